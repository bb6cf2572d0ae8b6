//! Filesystem host functions for the WASM interpreter.
//!
//! The guest has no preopened access to dataset directories. Instead the host
//! keeps a mount table and serves reads under a mount point through these
//! imports, so a directory can be bound and unbound between queries without
//! re-instantiating the interpreter.
//!
//! ## Import Module
//!
//! Host functions are imported under the `sasview_fs` namespace:
//! ```wat
//! (import "sasview_fs" "stat" (func $stat (param i32 i32) (result i64)))
//! (import "sasview_fs" "read" (func $read (param i32 i32 i64 i32 i32) (result i32)))
//! ```
//!
//! - `stat(path_ptr, path_len)`: file size in bytes, or -1 if the path is not
//!   a file under an active mount
//! - `read(path_ptr, path_len, offset, buf_ptr, buf_len)`: bytes copied into
//!   `buf_ptr` (0 at end of file), or -1 on error

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use wasmtime::{Caller, Linker, Memory};

use super::runtime::WasmHostState;
use crate::error::{BridgeError, Result};

/// Import namespace of the filesystem host functions.
pub const FS_MODULE: &str = "sasview_fs";

/// Virtual mount point -> host directory bindings.
#[derive(Debug, Default)]
pub struct MountTable {
    binds: BTreeMap<String, PathBuf>,
}

impl MountTable {
    /// Bind `host_dir` at `mount_point`.
    pub fn bind(&mut self, mount_point: &str, host_dir: &Path) -> Result<()> {
        let key = normalize(mount_point);
        if let Some(active) = self.binds.get(&key) {
            return Err(BridgeError::MountConflict {
                mount_point: key,
                active: active.clone(),
                requested: host_dir.to_path_buf(),
            });
        }
        self.binds.insert(key, host_dir.to_path_buf());
        Ok(())
    }

    /// Remove the binding at `mount_point`.
    pub fn unbind(&mut self, mount_point: &str) -> Result<()> {
        self.binds
            .remove(&normalize(mount_point))
            .map(|_| ())
            .ok_or_else(|| BridgeError::Interpreter(format!("{} is not mounted", mount_point)))
    }

    /// Host directory bound at `mount_point`.
    pub fn get(&self, mount_point: &str) -> Option<&Path> {
        self.binds.get(&normalize(mount_point)).map(PathBuf::as_path)
    }

    /// Number of active bindings.
    pub fn len(&self) -> usize {
        self.binds.len()
    }

    /// Whether no binding is active.
    pub fn is_empty(&self) -> bool {
        self.binds.is_empty()
    }

    /// Map a virtual path to a host path. Paths outside every mount, or
    /// escaping one with `..`, do not resolve.
    pub fn resolve(&self, virtual_path: &str) -> Option<PathBuf> {
        self.binds.iter().find_map(|(mount_point, host_dir)| {
            let rest = virtual_path.strip_prefix(mount_point.as_str())?;
            if !rest.is_empty() && !rest.starts_with('/') {
                return None;
            }
            let rest = Path::new(rest.trim_start_matches('/'));
            if !rest.components().all(|c| matches!(c, Component::Normal(_))) {
                return None;
            }
            Some(host_dir.join(rest))
        })
    }
}

fn normalize(mount_point: &str) -> String {
    let trimmed = mount_point.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Filesystem host functions exposed to the interpreter module.
pub struct FsHostFunctions;

impl FsHostFunctions {
    /// Register all filesystem host functions with the wasmtime linker.
    pub fn register(linker: &mut Linker<WasmHostState>) -> Result<()> {
        Self::register_stat(linker)?;
        Self::register_read(linker)?;
        Ok(())
    }

    fn register_stat(linker: &mut Linker<WasmHostState>) -> Result<()> {
        linker
            .func_wrap(
                FS_MODULE,
                "stat",
                |mut caller: Caller<'_, WasmHostState>,
                 path_ptr: i32,
                 path_len: i32|
                 -> wasmtime::Result<i64> {
                    let memory = get_memory(&mut caller)?;
                    let path = read_guest_str(&memory, &caller, path_ptr, path_len)?;

                    let size = caller
                        .data()
                        .mounts
                        .resolve(&path)
                        .and_then(|host| std::fs::metadata(host).ok())
                        .filter(|meta| meta.is_file())
                        .map(|meta| meta.len() as i64)
                        .unwrap_or(-1);

                    tracing::trace!(path = %path, size, "sasview_fs::stat");
                    Ok(size)
                },
            )
            .map_err(|e| BridgeError::Interpreter(format!("failed to register stat: {}", e)))?;
        Ok(())
    }

    fn register_read(linker: &mut Linker<WasmHostState>) -> Result<()> {
        linker
            .func_wrap(
                FS_MODULE,
                "read",
                |mut caller: Caller<'_, WasmHostState>,
                 path_ptr: i32,
                 path_len: i32,
                 offset: i64,
                 buf_ptr: i32,
                 buf_len: i32|
                 -> wasmtime::Result<i32> {
                    let memory = get_memory(&mut caller)?;
                    let path = read_guest_str(&memory, &caller, path_ptr, path_len)?;

                    let Some(host) = caller.data().mounts.resolve(&path) else {
                        return Ok(-1);
                    };
                    if offset < 0 || buf_len < 0 {
                        return Ok(-1);
                    }

                    let mut buffer = vec![0u8; buf_len as usize];
                    let read = File::open(&host).and_then(|mut file| {
                        file.seek(SeekFrom::Start(offset as u64))?;
                        read_full(&mut file, &mut buffer)
                    });
                    let n = match read {
                        Ok(n) => n,
                        Err(e) => {
                            tracing::debug!(path = %path, "sasview_fs::read failed: {}", e);
                            return Ok(-1);
                        }
                    };

                    memory.write(&mut caller, buf_ptr as usize, &buffer[..n])?;
                    Ok(n as i32)
                },
            )
            .map_err(|e| BridgeError::Interpreter(format!("failed to register read: {}", e)))?;
        Ok(())
    }
}

/// Fill `buf` as far as the file allows.
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

// ============================================================================
// Memory Access Helpers
// ============================================================================

/// Get the memory export from the caller.
fn get_memory(caller: &mut Caller<'_, WasmHostState>) -> Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| BridgeError::Interpreter("no memory export found".to_string()))
}

/// Read a UTF-8 string from guest memory.
fn read_guest_str(
    memory: &Memory,
    caller: &Caller<'_, WasmHostState>,
    ptr: i32,
    len: i32,
) -> Result<String> {
    let data = memory.data(caller);
    let (offset, len) = (ptr as usize, len as usize);

    if ptr < 0 || len > data.len() || offset > data.len() - len {
        return Err(BridgeError::Interpreter(
            "memory read out of bounds".to_string(),
        ));
    }

    String::from_utf8(data[offset..offset + len].to_vec())
        .map_err(|e| BridgeError::Interpreter(format!("path is not UTF-8: {}", e)))
}
