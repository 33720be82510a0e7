//! Error taxonomy for the worker subsystem
//!
//! Caller-contract violations (construction, arity, serialization) fail
//! fast and synchronously. Everything that happens after the worker thread
//! starts is reported asynchronously through the owner's `onerror` slot,
//! never by throwing across the thread boundary.

use thiserror::Error;

use crate::loader::LoadError;

/// Errors surfaced synchronously to the calling context
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Bad arguments to worker creation, or the thread failed to spawn
    #[error("worker construction failed: {0}")]
    Construction(String),

    /// `postMessage` called with anything other than exactly one argument
    #[error("postMessage expects exactly one argument, got {got}")]
    Arity { got: usize },

    /// The value contains something that cannot cross contexts
    #[error("value cannot be cloned across contexts: {0}")]
    Serialization(String),

    /// Entry script resolution failure
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Internal failure while running the worker
    #[error("worker runtime error: {0}")]
    Runtime(String),
}

/// Result type for worker operations
pub type WorkerResult<T> = Result<T, WorkerError>;

/// The "thrown value" of an entry script or a worker-scope callback
///
/// Entry points and callbacks signal an uncaught failure by returning
/// `Err(ScriptError)`; the ErrorPropagator decides where it goes from
/// there.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<WorkerError> for ScriptError {
    fn from(err: WorkerError) -> Self {
        Self::new(err.to_string())
    }
}
