//! Per-request deadline threaded through every collaborator call.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::error::ProcessingError;

#[derive(Debug, Clone)]
pub struct UploadContext {
    pub correlation_id: String,
    deadline: Instant,
}

impl UploadContext {
    #[must_use]
    pub fn new(correlation_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            deadline: Instant::now() + timeout,
        }
    }

    /// Run a collaborator call under the request deadline.
    ///
    /// Running out of time surfaces as
    /// [`ProcessingError::DeadlineExceeded`] naming `operation`.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T, ProcessingError>
    where
        F: Future<Output = Result<T, ProcessingError>>,
    {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .map_err(|_| ProcessingError::DeadlineExceeded { operation })?
    }
}
