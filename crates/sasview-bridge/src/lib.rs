//! # sasview Bridge
//!
//! Read SAS7BDAT and XPT datasets by delegating parsing to a sandboxed,
//! WASM-embedded statistical interpreter and its package ecosystem.
//!
//! ## Pipeline
//!
//! ```text
//! initialize (once) → mount dir → evaluate extraction → materialize + release → JSON → records → unmount
//! ```
//!
//! | Component | Module |
//! |-----------|--------|
//! | Runtime lifecycle, query lock | [`runtime`] |
//! | Filesystem bridge | [`mount`] |
//! | Query executor | [`query`] |
//! | Foreign value tracker | [`foreign`] |
//! | Serialization adapter | [`serialize`] |
//! | Interpreter seam | [`interpreter`] |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use sasview_bridge::{BridgeConfig, RuntimeHandle, WasmConfig};
//!
//! let config = BridgeConfig::default().wasm(WasmConfig::default().module("webr.wasm"));
//! let runtime = RuntimeHandle::wasm(config);
//! runtime.initialize().await?;
//!
//! let shape = runtime.read_dataset_shape("/studies/sdtm/dm.sas7bdat").await?;
//! let rows = runtime.read_dataset("/studies/sdtm/dm.sas7bdat", "1:10", "all").await?;
//! runtime.teardown().await;
//! ```
//!
//! ## Features
//!
//! - `wasm` (default) - wasmtime interpreter backend

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod foreign;
pub mod interpreter;
pub mod mount;
pub mod query;
pub mod runtime;
pub mod serialize;

#[cfg(feature = "wasm")]
pub mod wasm;

// Re-export main types
pub use config::{BridgeConfig, LockMode};
pub use error::{BridgeError, Result};
pub use foreign::ForeignValue;
pub use interpreter::{Interpreter, InterpreterFactory, ObjectId};
pub use mount::MountBinding;
pub use query::{DatasetFormat, DatasetQuery, Selector};
pub use runtime::{QueryPhase, RuntimeHandle, RuntimeState};
pub use serialize::{DatasetShape, Record, ResultKind, TabularResult};

#[cfg(feature = "wasm")]
pub use wasm::{WasiCapabilities, WasmConfig, WasmEngine, WasmInterpreter};
