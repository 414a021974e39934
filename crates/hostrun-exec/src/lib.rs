//! hostrun-exec: remote unit-of-work execution
//!
//! Two executors share one contract — execute a validated request, return
//! its exit status and captured output — and differ only in transport.
//! [`CommandExecutor`] spawns the local ssh client with piped stdio;
//! [`ScriptExecutor`] renders a templated script, uploads it over a
//! secure channel session and runs it there. Both guarantee that the
//! resources they allocate (child process, pipes, uploaded file,
//! connection) are released exactly once, on every exit path.

pub mod command;
pub mod error;
pub mod keys;
pub mod sanitize;
pub mod script;
pub mod template;
pub mod traits;

pub use command::{CommandExecutor, CommandTransport};
pub use error::ExecError;
pub use script::ScriptExecutor;
pub use traits::WorkExecutor;
