//! The embedded interpreter seam.
//!
//! The bridge never talks to an engine directly. Everything it needs from the
//! embedded runtime (package provisioning, the virtual filesystem, evaluation
//! and the foreign heap) goes through [`Interpreter`], so the lifecycle,
//! locking and cleanup logic is shared by every backend.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::BridgeConfig;
use crate::error::Result;

/// Opaque handle of an object living on the interpreter heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// An embedded interpreter instance.
///
/// Implementations are single-session: the bridge guarantees that at most one
/// call is in progress at a time, and that every object returned by
/// [`eval`](Interpreter::eval) is eventually passed to
/// [`destroy`](Interpreter::destroy).
pub trait Interpreter: Send {
    /// Install packages from a package repository.
    fn install_packages(&mut self, packages: &[String], repository: &str) -> Result<()>;

    /// Create a directory in the virtual filesystem.
    fn mkdir(&mut self, path: &str) -> Result<()>;

    /// Bind a host directory to a virtual mount point.
    fn mount(&mut self, host_dir: &Path, mount_point: &str) -> Result<()>;

    /// Remove the binding at a virtual mount point.
    fn unmount(&mut self, mount_point: &str) -> Result<()>;

    /// Host directory currently bound at `mount_point`, if any.
    fn mounted(&self, mount_point: &str) -> Option<PathBuf>;

    /// Evaluate an expression, leaving its value on the interpreter heap.
    ///
    /// Interpreter-side failures (missing file, bad selector, ...) must be
    /// reported as [`BridgeError::Evaluation`](crate::BridgeError::Evaluation)
    /// carrying the interpreter's own message.
    fn eval(&mut self, expr: &str) -> Result<ObjectId>;

    /// Copy the serialized contents of a heap object to the host.
    fn transfer(&mut self, id: ObjectId) -> Result<Vec<u8>>;

    /// Release a heap object.
    fn destroy(&mut self, id: ObjectId) -> Result<()>;

    /// Tear the engine down. Called at most once; the instance is dropped afterwards.
    fn shutdown(&mut self) {}
}

/// Boots a fresh interpreter for the given configuration.
pub type InterpreterFactory =
    Box<dyn Fn(&BridgeConfig) -> Result<Box<dyn Interpreter>> + Send + Sync>;
