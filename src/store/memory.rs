//! In-memory [`CaseStore`] and [`SearchIndexService`] for tests.
//!
//! Everything lives in maps behind `std::sync::RwLock`. Keyword search is a
//! term-containment count over the indexed column; the number of index
//! rebuilds is recorded so tests can assert replace semantics.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::{CaseRecord, IndexedCase, SummaryResult};

use super::{check_output_table, CaseStore, IndexSpec, SearchHit, SearchIndexService};

struct BuiltIndex {
    spec: IndexSpec,
    rows: Vec<IndexedCase>,
}

pub struct InMemoryStore {
    cases: RwLock<BTreeMap<String, CaseRecord>>,
    summaries: RwLock<BTreeMap<String, Vec<SummaryResult>>>,
    published: RwLock<HashMap<String, Vec<IndexedCase>>>,
    indexes: RwLock<HashMap<String, BuiltIndex>>,
    index_rebuilds: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            cases: RwLock::new(BTreeMap::new()),
            summaries: RwLock::new(BTreeMap::new()),
            published: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            index_rebuilds: AtomicUsize::new(0),
        }
    }

    /// Store pre-loaded with `cases`.
    pub fn with_cases(cases: Vec<CaseRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.cases.write().unwrap_or_else(|p| p.into_inner());
            for case in cases {
                map.insert(case.case_id.clone(), case);
            }
        }
        store
    }

    /// Every row appended to `table`, oldest first.
    pub fn summaries(&self, table: &str) -> Vec<SummaryResult> {
        self.summaries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn published_cases(&self, table: &str) -> Vec<IndexedCase> {
        self.published
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn index_spec(&self, name: &str) -> Option<IndexSpec> {
        self.indexes
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .map(|b| b.spec.clone())
    }

    pub fn index_rebuilds(&self) -> usize {
        self.index_rebuilds.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CaseStore for InMemoryStore {
    async fn upsert_cases(&self, cases: &[CaseRecord]) -> Result<usize> {
        let mut map = self.cases.write().unwrap_or_else(|p| p.into_inner());
        for case in cases {
            map.insert(case.case_id.clone(), case.clone());
        }
        Ok(cases.len())
    }

    async fn latest_case_date(&self) -> Result<Option<NaiveDate>> {
        let map = self.cases.read().unwrap_or_else(|p| p.into_inner());
        Ok(map.values().map(|c| c.date_created).max())
    }

    async fn cases_since(
        &self,
        categories: &[String],
        after: Option<NaiveDate>,
    ) -> Result<Vec<CaseRecord>> {
        let map = self.cases.read().unwrap_or_else(|p| p.into_inner());
        let mut cases: Vec<CaseRecord> = map
            .values()
            .filter(|c| after.map_or(true, |d| c.date_created > d))
            .filter(|c| categories.is_empty() || categories.contains(&c.category))
            .cloned()
            .collect();
        cases.sort_by(|a, b| {
            a.date_created
                .cmp(&b.date_created)
                .then_with(|| a.case_id.cmp(&b.case_id))
        });
        Ok(cases)
    }

    async fn categories(&self) -> Result<Vec<String>> {
        let map = self.cases.read().unwrap_or_else(|p| p.into_inner());
        let mut cats: Vec<String> = map.values().map(|c| c.category.clone()).collect();
        cats.sort();
        cats.dedup();
        Ok(cats)
    }

    async fn append_summary(&self, table: &str, summary: &SummaryResult) -> Result<()> {
        check_output_table(table)?;
        self.summaries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(table.to_string())
            .or_default()
            .push(summary.clone());
        Ok(())
    }

    async fn summary_tables(&self) -> Result<Vec<String>> {
        let summaries = self.summaries.read().unwrap_or_else(|p| p.into_inner());
        Ok(summaries.keys().cloned().collect())
    }

    async fn latest_summary(&self, table: &str) -> Result<Option<SummaryResult>> {
        let summaries = self.summaries.read().unwrap_or_else(|p| p.into_inner());
        Ok(summaries
            .get(table)
            .and_then(|rows| rows.iter().max_by_key(|r| r.timestamp).cloned()))
    }

    async fn append_index_cases(&self, table: &str, cases: &[IndexedCase]) -> Result<()> {
        check_output_table(table)?;
        self.published
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .entry(table.to_string())
            .or_default()
            .extend(cases.iter().cloned());
        Ok(())
    }
}

#[async_trait]
impl SearchIndexService for InMemoryStore {
    async fn replace_index(&self, spec: &IndexSpec) -> Result<()> {
        spec.validate()?;
        let rows = {
            let published = self.published.read().unwrap_or_else(|p| p.into_inner());
            match published.get(&spec.source_table) {
                Some(rows) => rows.clone(),
                None => bail!("source table not found: {}", spec.source_table),
            }
        };
        self.indexes.write().unwrap_or_else(|p| p.into_inner()).insert(
            spec.name.clone(),
            BuiltIndex {
                spec: spec.clone(),
                rows,
            },
        );
        self.index_rebuilds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn search(&self, index: &str, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let query_lower = query.to_lowercase();
        let terms: Vec<&str> = query_lower.split_whitespace().collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let indexes = self.indexes.read().unwrap_or_else(|p| p.into_inner());
        let built = match indexes.get(index) {
            Some(b) => b,
            None => bail!("search index not found: {}", index),
        };

        let mut hits: Vec<SearchHit> = built
            .rows
            .iter()
            .filter_map(|row| {
                let text_lower = row.index_text.to_lowercase();
                let matches = terms.iter().filter(|t| text_lower.contains(*t)).count();
                (matches > 0).then(|| SearchHit {
                    case_id: row.case_id.clone(),
                    title: row.title.clone(),
                    category: row.category.clone(),
                    date_created: row.date_created,
                    snippet: row.index_text.chars().take(160).collect(),
                    text: row.index_text.clone(),
                    score: matches as f64,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit.max(0) as usize);
        Ok(hits)
    }
}
