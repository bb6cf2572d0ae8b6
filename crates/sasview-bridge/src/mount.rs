//! Scoped binding of a host directory into the interpreter filesystem.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};
use crate::interpreter::Interpreter;

/// An active host directory binding at the shared mount point.
///
/// The binding holds the interpreter exclusively while it is alive, and is
/// removed when it is released or dropped, whichever comes first. Unmount
/// failures never propagate; they are logged and reported through
/// [`release`](MountBinding::release)'s return value.
pub struct MountBinding<'a> {
    interpreter: &'a mut dyn Interpreter,
    host_dir: PathBuf,
    mount_point: String,
    active: bool,
}

impl<'a> MountBinding<'a> {
    /// Bind `host_dir` at `mount_point`.
    ///
    /// Fails with [`BridgeError::MountConflict`] if the mount point is already
    /// bound, and with an IO error if `host_dir` is not a readable directory.
    pub fn acquire(
        interpreter: &'a mut dyn Interpreter,
        host_dir: &Path,
        mount_point: &str,
    ) -> Result<Self> {
        if let Some(active) = interpreter.mounted(mount_point) {
            return Err(BridgeError::MountConflict {
                mount_point: mount_point.to_string(),
                active,
                requested: host_dir.to_path_buf(),
            });
        }

        if !host_dir.is_dir() {
            return Err(BridgeError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} is not a directory", host_dir.display()),
            )));
        }
        // Readability check; the interpreter would only report a vaguer error later.
        std::fs::read_dir(host_dir)?;

        interpreter.mount(host_dir, mount_point)?;
        tracing::debug!(host_dir = %host_dir.display(), mount_point, "mounted");

        Ok(Self {
            interpreter,
            host_dir: host_dir.to_path_buf(),
            mount_point: mount_point.to_string(),
            active: true,
        })
    }

    /// The interpreter, for use while the binding is active.
    pub fn interpreter(&mut self) -> &mut dyn Interpreter {
        &mut *self.interpreter
    }

    /// Virtual path of `file_name` under the mount point.
    pub fn virtual_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.mount_point.trim_end_matches('/'), file_name)
    }

    /// Whether the binding is still active.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Remove the binding. Returns `false` if the interpreter refused to unmount.
    pub fn release(mut self) -> bool {
        self.unmount()
    }

    fn unmount(&mut self) -> bool {
        if !self.active {
            return true;
        }
        self.active = false;
        match self.interpreter.unmount(&self.mount_point) {
            Ok(()) => {
                tracing::debug!(mount_point = %self.mount_point, "unmounted");
                true
            }
            Err(e) => {
                tracing::warn!(
                    mount_point = %self.mount_point,
                    host_dir = %self.host_dir.display(),
                    "unmount failed: {}",
                    e
                );
                false
            }
        }
    }
}

impl Drop for MountBinding<'_> {
    fn drop(&mut self) {
        self.unmount();
    }
}
