//! Storage and search-index collaborators for the pipeline.
//!
//! Two traits split the external surface:
//!
//! - [`CaseStore`]: the case table (read side of the pipeline) plus the
//!   append-only summary and published-case tables (write side).
//! - [`SearchIndexService`]: recreates a named keyword index over a
//!   published case table, and queries it.
//!
//! Both are implemented by [`sqlite::SqliteStore`] for real use and by
//! [`memory::InMemoryStore`] for tests.
//!
//! # Table naming
//!
//! | Artifact | Name |
//! |----------|------|
//! | Summary table | `{PREFIX}_SUMMARIES` |
//! | Published cases | `{PREFIX}_CASES` |
//! | Search index | `{PREFIX}_CORTEX_SEARCH` |

pub mod memory;
pub mod sqlite;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;

use crate::config::is_valid_identifier;
use crate::models::{CaseRecord, IndexedCase, SummaryResult};

pub const SUMMARY_TABLE_SUFFIX: &str = "_SUMMARIES";
pub const CASES_TABLE_SUFFIX: &str = "_CASES";
pub const INDEX_SUFFIX: &str = "_CORTEX_SEARCH";

/// Column of the published case table that the index searches.
pub const INDEX_COLUMN: &str = "index_text";

pub fn summary_table(prefix: &str) -> String {
    format!("{}{}", prefix, SUMMARY_TABLE_SUFFIX)
}

pub fn cases_table(prefix: &str) -> String {
    format!("{}{}", prefix, CASES_TABLE_SUFFIX)
}

pub fn index_name(prefix: &str) -> String {
    format!("{}{}", prefix, INDEX_SUFFIX)
}

/// Tables the store owns. Table names compare case-insensitively.
pub const RESERVED_TABLES: &[&str] = &["support_cases", "search_indexes"];

/// Reject names that cannot be spliced into SQL as bare identifiers.
pub fn check_identifier(kind: &str, name: &str) -> Result<()> {
    if !is_valid_identifier(name) {
        bail!("invalid {} name: {:?} (allowed: A-Z a-z 0-9 _)", kind, name);
    }
    Ok(())
}

/// Reject output table names that would land on a base table.
pub fn check_output_table(name: &str) -> Result<()> {
    check_identifier("table", name)?;
    let lower = name.to_ascii_lowercase();
    if let Some(reserved) = RESERVED_TABLES.iter().find(|r| **r == lower) {
        bail!("table name {:?} collides with the base table {}", name, reserved);
    }
    if lower.starts_with("sqlite_") {
        bail!("table name {:?} uses the reserved sqlite_ namespace", name);
    }
    Ok(())
}

/// Reject a run prefix if any table or index derived from it is unusable.
pub fn check_prefix(prefix: &str) -> Result<()> {
    check_identifier("prefix", prefix)?;
    for name in [summary_table(prefix), cases_table(prefix), index_name(prefix)] {
        check_output_table(&name)?;
    }
    Ok(())
}

/// Definition of a keyword index. Recreated on every publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSpec {
    pub name: String,
    pub source_table: String,
    /// Column whose text is indexed.
    pub column: String,
    /// Refresh lag recorded with the index, e.g. `"1 day"`.
    pub target_lag: String,
    /// Columns returned alongside each hit.
    pub attributes: Vec<String>,
}

impl IndexSpec {
    /// The index published for a run with the given prefix.
    pub fn for_prefix(prefix: &str, target_lag: &str) -> Self {
        Self {
            name: index_name(prefix),
            source_table: cases_table(prefix),
            column: INDEX_COLUMN.to_string(),
            target_lag: target_lag.to_string(),
            attributes: vec!["category".to_string()],
        }
    }

    /// The query the index is built from.
    pub fn backing_query(&self) -> String {
        format!(
            "SELECT case_id, title, category, date_created, {} FROM {}",
            self.column, self.source_table
        )
    }

    pub fn validate(&self) -> Result<()> {
        check_output_table(&self.name)?;
        check_identifier("table", &self.source_table)?;
        check_identifier("column", &self.column)?;
        for attr in &self.attributes {
            check_identifier("attribute", attr)?;
        }
        Ok(())
    }
}

/// One keyword search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub case_id: String,
    pub title: String,
    pub category: String,
    pub date_created: NaiveDate,
    pub snippet: String,
    /// Full indexed text of the row.
    #[serde(skip)]
    pub text: String,
    /// Higher is better.
    pub score: f64,
}

/// Case table plus the append-only output tables.
#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Insert or replace cases by `case_id`. Returns the number written.
    async fn upsert_cases(&self, cases: &[CaseRecord]) -> Result<usize>;

    /// Most recent `date_created`, or `None` when the table is empty.
    async fn latest_case_date(&self) -> Result<Option<NaiveDate>>;

    /// Cases created strictly after `after` (all cases when `None`) whose
    /// category is in `categories` (any category when empty), oldest first.
    async fn cases_since(
        &self,
        categories: &[String],
        after: Option<NaiveDate>,
    ) -> Result<Vec<CaseRecord>>;

    /// Distinct categories, sorted.
    async fn categories(&self) -> Result<Vec<String>>;

    async fn append_summary(&self, table: &str, summary: &SummaryResult) -> Result<()>;

    /// Names of every summary table, sorted.
    async fn summary_tables(&self) -> Result<Vec<String>>;

    /// Newest row of `table` by timestamp. `None` if the table is missing or empty.
    async fn latest_summary(&self, table: &str) -> Result<Option<SummaryResult>>;

    async fn append_index_cases(&self, table: &str, cases: &[IndexedCase]) -> Result<()>;
}

/// Keyword index over a published case table.
#[async_trait]
pub trait SearchIndexService: Send + Sync {
    /// Drop and rebuild the index described by `spec`.
    async fn replace_index(&self, spec: &IndexSpec) -> Result<()>;

    /// Search a previously built index.
    async fn search(&self, index: &str, query: &str, limit: i64) -> Result<Vec<SearchHit>>;
}
