//! Error types for the bridge crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::runtime::{QueryPhase, RuntimeState};

/// Bridge error type
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Interpreter boot or package provisioning failed (retryable)
    #[error("runtime initialization failed: {0}")]
    RuntimeInit(String),

    /// Another binding already holds the mount point
    #[error("mount point {mount_point} already bound to {active:?} (requested {requested:?})")]
    MountConflict {
        /// Virtual mount point
        mount_point: String,
        /// Host directory currently bound
        active: PathBuf,
        /// Host directory that was requested
        requested: PathBuf,
    },

    /// The interpreter rejected the expression (bad path, malformed dataset, bad selector)
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// The interpreter result did not match the serialization contract
    #[error("malformed result: {0}")]
    MalformedResult(String),

    /// The runtime is serving another query (fail-fast mode)
    #[error("runtime busy: another query is in flight")]
    Busy,

    /// The query did not finish in time; the runtime will be rebuilt
    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    /// An operation was attempted before the runtime reached `Ready`
    #[error("runtime not ready (state: {0:?})")]
    NotReady(RuntimeState),

    /// The dataset query is missing a required part
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// File extension does not map to a known reader
    #[error("unsupported dataset format: {0}")]
    UnsupportedFormat(String),

    /// Interpreter backend or ABI failure
    #[error("interpreter error: {0}")]
    Interpreter(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A failure annotated with the query phase it happened in
    #[error("{phase} failed: {source}")]
    Stage {
        /// Phase in which the failure happened
        phase: QueryPhase,
        /// Underlying failure
        #[source]
        source: Box<BridgeError>,
    },
}

impl BridgeError {
    /// Annotate this error with the phase it happened in.
    ///
    /// An error that already carries a phase keeps its original one.
    pub fn at(self, phase: QueryPhase) -> Self {
        match self {
            err @ BridgeError::Stage { .. } => err,
            err => BridgeError::Stage {
                phase,
                source: Box::new(err),
            },
        }
    }

    /// The innermost error, with stage annotations stripped.
    pub fn root(&self) -> &BridgeError {
        match self {
            BridgeError::Stage { source, .. } => source.root(),
            err => err,
        }
    }

    /// The phase this error was annotated with, if any.
    pub fn phase(&self) -> Option<QueryPhase> {
        match self {
            BridgeError::Stage { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            BridgeError::RuntimeInit(_)
                | BridgeError::MountConflict { .. }
                | BridgeError::Busy
                | BridgeError::Timeout(_)
        )
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
