//! hostrun-core: request model, defaults and outcome types
//!
//! Validates job payloads into immutable [`RequestSpec`] values and defines
//! the configuration and result types shared by both executors.

pub mod config;
pub mod error;
pub mod outcome;
pub mod request;

pub use config::{DEFAULT_SSH_OPTS, SshDefaults};
pub use error::SpecError;
pub use outcome::{ExitStatus, Outcome};
pub use request::{ExecutorKind, RequestSpec};
