//! Core data models used throughout Case Digest.
//!
//! These types represent the case records, chunks, summaries and progress
//! events that flow through the summarization pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One support ticket, as read from the case table.
///
/// Immutable snapshot; the warehouse stays the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseRecord {
    #[serde(alias = "CASE_ID")]
    pub case_id: String,
    #[serde(alias = "CASE_TITLE")]
    pub title: String,
    #[serde(default, alias = "CASE_DESCRIPTION")]
    pub description: String,
    #[serde(default, alias = "STATUS")]
    pub status: String,
    /// Warehouse exports name this column `LAST_UPDATE`.
    #[serde(default, alias = "LAST_UPDATE")]
    pub last_comment: String,
    #[serde(alias = "CATEGORY")]
    pub category: String,
    #[serde(alias = "DATE_CREATED")]
    pub date_created: NaiveDate,
}

impl CaseRecord {
    /// Field-labelled text used both for the summarization corpus and for
    /// the published search index.
    pub fn labelled_text(&self) -> String {
        format!(
            "##### \nCASE TITLE: {}\n\nCASE DESCRIPTION: {}\n\nCASE STATUS: {}\n\nLAST COMMENT: {}",
            self.title, self.description, self.status, self.last_comment
        )
    }
}

/// A case row written to a published case table, carrying the text the
/// search index is built over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedCase {
    pub case_id: String,
    pub title: String,
    pub category: String,
    pub date_created: NaiveDate,
    pub index_text: String,
}

impl From<&CaseRecord> for IndexedCase {
    fn from(record: &CaseRecord) -> Self {
        Self {
            case_id: record.case_id.clone(),
            title: record.title.clone(),
            category: record.category.clone(),
            date_created: record.date_created,
            index_text: record.labelled_text(),
        }
    }
}

/// An ordered, token-bounded slice of the concatenated corpus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChunk {
    /// Position in the chunk sequence, starting at 0.
    pub index: usize,
    pub text: String,
    /// Byte offset of the chunk in the source text.
    pub start: usize,
    /// Byte offset one past the end of the chunk in the source text.
    pub end: usize,
    /// Length in bytes of the prefix duplicated from the previous chunk.
    pub overlap: usize,
}

/// Output of one map-stage call for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSummary {
    pub chunk_index: usize,
    /// Empty when the call degraded after exhausting its retries.
    pub text: String,
}

/// The persisted artifact of one pipeline run. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub output_text: String,
    pub intermediate_steps: Vec<String>,
}

impl SummaryResult {
    pub fn new(output_text: String, intermediate_steps: Vec<String>) -> Self {
        let timestamp = Utc::now();
        Self {
            timestamp,
            date: timestamp.date_naive(),
            output_text,
            intermediate_steps,
        }
    }
}

/// Transient progress notification from the worker to the render loop.
///
/// Invariant: `finished <= started <= total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Update {
        started: u64,
        finished: u64,
        total: u64,
    },
}
