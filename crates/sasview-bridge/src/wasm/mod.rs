//! WebAssembly interpreter backend.
//!
//! Runs a WASM-compiled statistical interpreter under wasmtime with WASI.
//!
//! ## Security Model
//!
//! - **Memory isolation**: The interpreter runs in its own linear memory space
//! - **Capability-based**: No permissions unless explicitly granted via WASI
//! - **No host filesystem**: Dataset directories are only reachable through
//!   the `sasview_fs` host functions, and only while a query holds the mount
//!
//! ## Guest ABI
//!
//! The module must export `memory`, `alloc(len) -> ptr`, `dealloc(ptr, len)`
//! and the `sv_*` entry points:
//!
//! | Export | Signature | Returns |
//! |--------|-----------|---------|
//! | `sv_init` | `() -> i32` | 0 on success |
//! | `sv_install` | `(name_ptr, name_len, repo_ptr, repo_len) -> i32` | 0 on success |
//! | `sv_mkdir` | `(ptr, len) -> i32` | 0 on success |
//! | `sv_eval` | `(ptr, len) -> i32` | object handle, negative on error |
//! | `sv_value_len` | `(handle) -> i32` | serialized length, negative if unknown |
//! | `sv_value_read` | `(handle, ptr) -> i32` | bytes written |
//! | `sv_destroy` | `(handle) -> i32` | 0 on success |
//! | `sv_error_len` / `sv_error_read` | `() -> i32` / `(ptr) -> i32` | last error message |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sasview_bridge::{BridgeConfig, RuntimeHandle, WasmConfig};
//!
//! let config = BridgeConfig::default().wasm(WasmConfig::default().module("webr.wasm"));
//! let runtime = RuntimeHandle::wasm(config);
//! runtime.initialize().await?;
//! ```

mod config;
mod host_functions;
mod runtime;

pub use config::{WasiCapabilities, WasmConfig};
pub use host_functions::{MountTable, FS_MODULE};
pub use runtime::{boot_interpreter, WasmEngine, WasmHostState, WasmInterpreter, WasmModule};
