//! Keyword search over a published case index.
//!
//! Hits come from [`SearchIndexService::search`] (FTS5 BM25 for SQLite);
//! scores are min-max normalized to `[0, 1]` for display.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::store::sqlite::SqliteStore;
use crate::store::{index_name, SearchHit, SearchIndexService};

pub const DEFAULT_LIMIT: i64 = 10;

/// Search `index` (default: the configured prefix's index) and return hits
/// with normalized scores, best first.
pub async fn search_cases(
    service: &dyn SearchIndexService,
    index: &str,
    query: &str,
    limit: i64,
) -> Result<Vec<SearchHit>> {
    if limit <= 0 {
        bail!("--limit must be > 0");
    }
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let hits = service.search(index, query, limit).await?;
    let normalized = normalize_scores(&hits);
    let mut hits: Vec<SearchHit> = hits
        .into_iter()
        .zip(normalized)
        .map(|(mut hit, score)| {
            hit.score = score;
            hit
        })
        .collect();

    // score desc, newest first, id asc
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.date_created.cmp(&a.date_created))
            .then(a.case_id.cmp(&b.case_id))
    });
    Ok(hits)
}

/// `digest search`.
pub async fn run_search(
    config: &Config,
    query: &str,
    index: Option<String>,
    limit: Option<i64>,
) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let index = index.unwrap_or_else(|| index_name(&config.summarize.prefix));
    let hits = search_cases(&store, &index, query, limit.unwrap_or(DEFAULT_LIMIT)).await?;

    if hits.is_empty() {
        println!("No results.");
        store.close().await;
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!("{}. [{:.2}] {} / {}", i + 1, hit.score, hit.category, hit.title);
        println!("    created: {}", hit.date_created);
        println!(
            "    excerpt: \"{}\"",
            hit.snippet.replace('\n', " ").trim()
        );
        println!("    case: {}", hit.case_id);
        println!();
    }

    store.close().await;
    Ok(())
}

/// Min-max normalize raw scores to `[0, 1]`. All-equal scores map to 1.0.
fn normalize_scores(hits: &[SearchHit]) -> Vec<f64> {
    if hits.is_empty() {
        return Vec::new();
    }

    let s_min = hits.iter().map(|h| h.score).fold(f64::INFINITY, f64::min);
    let s_max = hits
        .iter()
        .map(|h| h.score)
        .fold(f64::NEG_INFINITY, f64::max);

    hits.iter()
        .map(|h| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (h.score - s_min) / (s_max - s_min)
            }
        })
        .collect()
}
