//! The shared executor contract

use std::time::Duration;

use async_trait::async_trait;
use hostrun_core::{Outcome, RequestSpec};

use crate::error::ExecError;

/// One unit of remote work: take a validated request, return its outcome.
///
/// The two transports implement this and share nothing else; leaf
/// utilities (sanitizer, defaults) are composed in, not inherited.
/// Neither method takes an internal timeout on its own — the plain
/// [`execute`](WorkExecutor::execute) blocks until the remote side is
/// done, and the calling job context bounds it with
/// [`execute_with_timeout`](WorkExecutor::execute_with_timeout), which
/// still tears the transport down when the deadline expires.
#[async_trait]
pub trait WorkExecutor: Send + Sync {
    /// Execute the work unit, blocking until the remote side finishes.
    async fn execute(&self, spec: &RequestSpec) -> Result<Outcome, ExecError>;

    /// Execute with a deadline. Expiry releases the transport resources
    /// before [`ExecError::Timeout`] is returned.
    async fn execute_with_timeout(
        &self,
        spec: &RequestSpec,
        timeout: Duration,
    ) -> Result<Outcome, ExecError>;
}
