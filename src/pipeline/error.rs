use thiserror::Error;
use tokio::task::JoinError;

use crate::smtp::SmtpError;

/// Boxed error of an address source or sink.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("address source failed: {source}")]
    Source {
        #[source]
        source: BoxError,
    },
    #[error("address sink failed: {source}")]
    Sink {
        #[source]
        source: BoxError,
    },
    /// Verification cannot go on (the proxy is down).
    #[error("verification aborted: {0}")]
    Verify(#[from] SmtpError),
    #[error("verification task failed: {0}")]
    Worker(#[from] JoinError),
}

impl PipelineError {
    pub(crate) fn sink(source: BoxError) -> Self {
        Self::Sink { source }
    }
}
