//! Error types for hostrun-exec

use std::time::Duration;

use hostrun_core::SpecError;
use thiserror::Error;

/// Errors that can occur while executing a unit of work
///
/// A non-zero remote exit is not represented here — it comes back as
/// data in the [`Outcome`](hostrun_core::Outcome). Cleanup-phase
/// failures never surface at all; they are logged and swallowed so a
/// secondary failure cannot discard the primary result.
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// The request payload failed validation
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// The local client process could not be started
    #[error("failed to spawn {binary}: {message}")]
    Spawn {
        /// Binary that was being spawned
        binary: String,
        /// Underlying OS error
        message: String,
    },

    /// The secure channel could not be established
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// SSH key error
    #[error("SSH key error: {0}")]
    KeyError(String),

    /// The script template could not be loaded or rendered
    #[error("template render failed: {0}")]
    RenderFailed(String),

    /// The rendered script could not be uploaded
    #[error("upload failed: {0}")]
    UploadFailed(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Execution exceeded its deadline
    #[error("execution timed out after {timeout:?}")]
    Timeout {
        /// Deadline that was exceeded
        timeout: Duration,
    },
}

impl ExecError {
    /// Check if the error is worth retrying from the job system
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::Timeout { .. }
        )
    }
}
