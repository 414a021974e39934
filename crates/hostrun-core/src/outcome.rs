//! Result values for one execution

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the executed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Normal exit with a code (0 for success)
    Code(i32),
    /// Terminated by a signal
    Signal(i32),
}

impl ExitStatus {
    /// Exit code, if the process exited normally
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Code(code) => Some(*code),
            Self::Signal(_) => None,
        }
    }

    /// Check for a clean zero exit
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self, Self::Code(0))
    }

    /// Translate the status of a reaped local child process
    #[must_use]
    pub fn from_unix(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match status.code() {
            Some(code) => Self::Code(code),
            None => Self::Signal(status.signal().unwrap_or(-1)),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(code) => write!(f, "exit code {code}"),
            Self::Signal(sig) => write!(f, "terminated by signal {sig}"),
        }
    }
}

/// Result of one executed unit of work
///
/// A non-zero exit status is data, not an error: the work unit ran to
/// completion and this is what it reported. The caller owns the value
/// outright; the executor keeps no reference to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    /// Exit status of the remote command or script
    pub status: ExitStatus,
    /// Captured output
    pub output: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl Outcome {
    /// Check if the work unit succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }
}
