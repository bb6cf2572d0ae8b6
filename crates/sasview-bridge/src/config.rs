//! Bridge configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

#[cfg(feature = "wasm")]
use crate::wasm::WasmConfig;

/// Default package repository for the embedded interpreter.
pub const DEFAULT_REPOSITORY: &str = "https://repo.r-wasm.org/";

/// Default virtual directory host directories are bound to.
pub const DEFAULT_MOUNT_POINT: &str = "/data";

/// How callers wait for the query lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Queue behind the running query (FIFO)
    #[default]
    Queue,
    /// Return `BridgeError::Busy` immediately
    FailFast,
}

/// Configuration for the data bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Package repository used at initialization time
    pub repository_url: String,

    /// Packages provisioned into the interpreter (reader + JSON serializer)
    pub packages: Vec<String>,

    /// Virtual mount point inside the interpreter filesystem
    pub mount_point: String,

    /// Per-query timeout in milliseconds (0 = unlimited)
    pub query_timeout_ms: u64,

    /// Behaviour when the query lock is held
    pub lock_mode: LockMode,

    /// WASM interpreter backend configuration
    #[cfg(feature = "wasm")]
    pub wasm: WasmConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            repository_url: DEFAULT_REPOSITORY.to_string(),
            packages: vec!["haven".to_string(), "jsonlite".to_string()],
            mount_point: DEFAULT_MOUNT_POINT.to_string(),
            query_timeout_ms: 0,
            lock_mode: LockMode::Queue,
            #[cfg(feature = "wasm")]
            wasm: WasmConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Query timeout, if one is configured.
    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_ms > 0).then(|| Duration::from_millis(self.query_timeout_ms))
    }

    /// Builder: set package repository
    pub fn repository(mut self, url: impl Into<String>) -> Self {
        self.repository_url = url.into();
        self
    }

    /// Builder: replace the package list
    pub fn packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set mount point
    pub fn mount_point(mut self, path: impl Into<String>) -> Self {
        self.mount_point = path.into();
        self
    }

    /// Builder: set query timeout
    pub fn query_timeout_ms(mut self, ms: u64) -> Self {
        self.query_timeout_ms = ms;
        self
    }

    /// Builder: set lock mode
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Builder: set WASM backend configuration
    #[cfg(feature = "wasm")]
    pub fn wasm(mut self, wasm: WasmConfig) -> Self {
        self.wasm = wasm;
        self
    }
}
