//! Error types for the summarization core.
//!
//! Command-level glue (config, CLI, SQL plumbing) uses `anyhow`; the
//! completion and summarization layers use these typed errors so callers
//! can tell an empty corpus from a hard LLM failure.

use thiserror::Error;

/// Failure talking to a completion backend.
#[derive(Debug, Error)]
pub enum CompletionError {
    /// Transport or service failure. Retried, fatal on the last attempt.
    #[error("completion request failed: {0}")]
    Request(String),
    /// The service answered but the body could not be read. Treated like an
    /// empty message: retried with the fallback model, never fatal.
    #[error("malformed completion response: {0}")]
    Malformed(String),
    /// A request failure on the final attempt.
    #[error("completion failed after {attempts} attempt(s) with model `{model}`: {source}")]
    Fatal {
        attempts: u32,
        model: String,
        #[source]
        source: Box<CompletionError>,
    },
}

/// Failure of a summarization run.
#[derive(Debug, Error)]
pub enum SummarizeError {
    /// Nothing left after filtering; raised before any completion call.
    #[error("No data found for the given filters.")]
    EmptyCorpus,
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("storage error: {0:#}")]
    Store(anyhow::Error),
    #[error("summary run was cancelled")]
    Cancelled,
    #[error("summary worker panicked")]
    WorkerPanicked,
}

impl SummarizeError {
    /// True for failures caused by the input rather than by a collaborator.
    pub fn is_input_error(&self) -> bool {
        matches!(self, SummarizeError::EmptyCorpus)
    }
}
