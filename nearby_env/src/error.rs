//! Error types for the Nearby environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A background task was requested with no async runtime available
    #[error("No async runtime available to spawn '{0}'")]
    NoRuntime(String),
}

impl EnvError {
    /// Creates a missing-runtime error for the named task.
    pub fn no_runtime(task: impl Into<String>) -> Self {
        Self::NoRuntime(task.into())
    }
}
