//! Configuration for the WASM interpreter backend.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// WASI capability grants for the interpreter.
///
/// Following the deny-by-default security model, all capabilities
/// start disabled and must be explicitly enabled. Dataset directories are
/// not preopened here: they are bound per query through the mount table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiCapabilities {
    /// Allow access to stdin
    pub stdin: bool,

    /// Allow access to stdout
    pub stdout: bool,

    /// Allow access to stderr
    pub stderr: bool,

    /// Directories to pre-open for filesystem access (read-only),
    /// e.g. an offline package library
    pub preopened_dirs_ro: Vec<PathBuf>,

    /// Environment variables to expose
    pub env_vars: Vec<(String, String)>,

    /// Command-line arguments to pass
    pub args: Vec<String>,
}

impl WasiCapabilities {
    /// Create capabilities with nothing allowed (maximum isolation)
    pub fn none() -> Self {
        Self::default()
    }

    /// Create capabilities for the statistical interpreter
    ///
    /// Allows: stdout/stderr for interpreter messages
    /// Denies: stdin, host filesystem, env vars
    pub fn interpreter() -> Self {
        Self {
            stdout: true,
            stderr: true,
            ..Default::default()
        }
    }

    /// Builder: enable stdout
    pub fn stdout(mut self, allow: bool) -> Self {
        self.stdout = allow;
        self
    }

    /// Builder: enable stderr
    pub fn stderr(mut self, allow: bool) -> Self {
        self.stderr = allow;
        self
    }

    /// Builder: add read-only directory
    pub fn preopened_dir_ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.preopened_dirs_ro.push(path.into());
        self
    }

    /// Builder: add environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Builder: add command-line argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for the WASM interpreter runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConfig {
    /// Compiled interpreter module (.wasm or .wat)
    pub interpreter_module: Option<PathBuf>,

    /// WASI capability configuration
    pub capabilities: WasiCapabilities,

    /// Maximum memory in bytes (default = 1 GB; datasets are loaded whole)
    pub max_memory: usize,

    /// Fuel granted to each guest call (None = unmetered)
    pub fuel_limit: Option<u64>,

    /// Cranelift optimization level (0-3)
    pub optimization_level: u8,

    /// Enable SIMD support
    pub enable_simd: bool,

    /// Cache compiled modules to disk using this wasmtime cache config
    pub cache_path: Option<PathBuf>,
}

impl Default for WasmConfig {
    fn default() -> Self {
        Self {
            interpreter_module: None,
            capabilities: WasiCapabilities::interpreter(),
            max_memory: 1024 * 1024 * 1024, // 1 GB
            fuel_limit: None,
            optimization_level: 2,
            enable_simd: true,
            cache_path: None,
        }
    }
}

impl WasmConfig {
    /// Create a minimal config for maximum isolation
    pub fn minimal() -> Self {
        Self {
            capabilities: WasiCapabilities::none(),
            max_memory: 64 * 1024 * 1024,    // 64 MB
            fuel_limit: Some(1_000_000_000), // 1B fuel units
            ..Default::default()
        }
    }

    /// Create config for development/debugging
    pub fn development() -> Self {
        Self {
            capabilities: WasiCapabilities::interpreter(),
            optimization_level: 0, // Faster compilation
            ..Default::default()
        }
    }

    /// Builder: set interpreter module
    pub fn module(mut self, path: impl Into<PathBuf>) -> Self {
        self.interpreter_module = Some(path.into());
        self
    }

    /// Builder: set capabilities
    pub fn capabilities(mut self, caps: WasiCapabilities) -> Self {
        self.capabilities = caps;
        self
    }

    /// Builder: set max memory
    pub fn max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Builder: set fuel limit
    pub fn fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }

    /// Builder: enable SIMD
    pub fn simd(mut self, enable: bool) -> Self {
        self.enable_simd = enable;
        self
    }

    /// Builder: set optimization level
    pub fn optimize(mut self, level: u8) -> Self {
        self.optimization_level = level.min(3);
        self
    }

    /// Builder: set cache path
    pub fn cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }
}
