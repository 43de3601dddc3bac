//! Text-generation and error-tracking collaborators.

use std::future::Future;
use std::pin::Pin;

use colloquy_context::SummaryRequest;
use colloquy_types::SessionId;
use thiserror::Error;
use tokio::sync::mpsc;

/// Summarization future type alias.
pub type SummarizeFut<'a> = Pin<Box<dyn Future<Output = Result<String, SummarizeError>> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum SummarizeError {
    /// Provider or network failure. Surfaced to the user, never reported.
    #[error("summarization request failed: {0}")]
    Api(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl SummarizeError {
    /// Expected failures are shown to the user but not sent to error tracking.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Api(_))
    }
}

/// Produces the body of a summary message.
///
/// Implementations may stream partial text through `deltas`; the returned
/// string is the authoritative summary. Cancellation is handled by dropping
/// the future, and timeouts are the implementation's responsibility.
pub trait Summarizer: Send + Sync {
    fn summarize<'a>(
        &'a self,
        request: &'a SummaryRequest,
        deltas: mpsc::UnboundedSender<String>,
    ) -> SummarizeFut<'a>;
}

/// Error-tracking collaborator for unexpected failures.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, session_id: &SessionId, error: &(dyn std::error::Error + 'static));
}

/// Reports through `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, session_id: &SessionId, error: &(dyn std::error::Error + 'static)) {
        let mut chain = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        tracing::error!(session_id = %session_id, error = %chain, "Unexpected engine failure");
    }
}
