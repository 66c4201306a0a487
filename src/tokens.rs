//! Token counting.
//!
//! Chunk boundaries and reduce-group budgets are both measured through a
//! [`TokenCounter`], so the chunker and the summarizer must share one
//! instance for the size accounting to agree.
//!
//! - [`Cl100kCounter`]: exact BPE counts for the `cl100k_base` encoding.
//! - [`ApproxCounter`]: `ceil(chars / 4)`, no vocabulary required.

use anyhow::{bail, Result};
use std::sync::Arc;
use tiktoken_rs::CoreBPE;

/// Approximate chars-per-token ratio used by [`ApproxCounter`].
const CHARS_PER_TOKEN: usize = 4;

/// Counts tokens in a string. Implementations must be pure and deterministic.
pub trait TokenCounter: Send + Sync {
    /// Number of tokens in `text`.
    fn count(&self, text: &str) -> usize;
    /// Encoding identifier (e.g. `"cl100k_base"`).
    fn name(&self) -> &str;
}

/// Exact counter for the `cl100k_base` BPE encoding.
pub struct Cl100kCounter {
    bpe: CoreBPE,
}

impl Cl100kCounter {
    pub fn new() -> Result<Self> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| anyhow::anyhow!("failed to load cl100k_base encoding: {}", e))?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for Cl100kCounter {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_ordinary(text).len()
    }

    fn name(&self) -> &str {
        "cl100k_base"
    }
}

/// Character-ratio approximation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApproxCounter;

impl TokenCounter for ApproxCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }

    fn name(&self) -> &str {
        "approx"
    }
}

/// Build the counter named by `chunking.encoding`.
pub fn counter_for(encoding: &str) -> Result<Arc<dyn TokenCounter>> {
    match encoding {
        "cl100k_base" => Ok(Arc::new(Cl100kCounter::new()?)),
        "approx" => Ok(Arc::new(ApproxCounter)),
        other => bail!("Unknown token encoding: {}", other),
    }
}
