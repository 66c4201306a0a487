//! Browsing stored summaries (`digest tables`, `digest show`).

use anyhow::{bail, Result};

use crate::config::Config;
use crate::models::SummaryResult;
use crate::store::sqlite::SqliteStore;
use crate::store::{check_identifier, summary_table, CaseStore};

/// Newest summary in `table`.
pub async fn latest_summary(store: &dyn CaseStore, table: &str) -> Result<SummaryResult> {
    check_identifier("table", table)?;
    match store.latest_summary(table).await? {
        Some(s) => Ok(s),
        None => bail!("no summaries found in {}", table),
    }
}

/// Text shown for one summary; `steps` adds every per-chunk summary.
pub fn render_summary(table: &str, summary: &SummaryResult, steps: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!("--- {} ---\n", table));
    out.push_str(&format!(
        "timestamp:    {}\n",
        summary.timestamp.format("%Y-%m-%dT%H:%M:%SZ")
    ));
    out.push_str(&format!("date:         {}\n", summary.date));
    out.push_str(&format!("chunks:       {}\n\n", summary.intermediate_steps.len()));

    out.push_str("--- Summary ---\n");
    if summary.output_text.trim().is_empty() {
        out.push_str("(empty)\n");
    } else {
        out.push_str(summary.output_text.trim_end());
        out.push('\n');
    }

    if steps {
        out.push_str(&format!(
            "\n--- Intermediate steps ({}) ---\n",
            summary.intermediate_steps.len()
        ));
        for (i, step) in summary.intermediate_steps.iter().enumerate() {
            out.push_str(&format!("[chunk {}]\n", i));
            if step.trim().is_empty() {
                out.push_str("(no usable summary)\n\n");
            } else {
                out.push_str(step.trim_end());
                out.push_str("\n\n");
            }
        }
    }
    out
}

/// `digest show`.
pub async fn run_show(config: &Config, table: Option<String>, steps: bool) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let table = table.unwrap_or_else(|| summary_table(&config.summarize.prefix));
    let outcome = latest_summary(&store, &table).await;
    store.close().await;

    let summary = outcome?;
    print!("{}", render_summary(&table, &summary, steps));
    Ok(())
}

/// `digest tables`.
pub async fn run_tables(config: &Config) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let tables = store.summary_tables().await;
    store.close().await;

    let tables = tables?;
    if tables.is_empty() {
        println!("No summary tables.");
    }
    for t in tables {
        println!("{}", t);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;

    #[test]
    fn render_without_steps() {
        let summary = SummaryResult::new("Top trend: SSO".into(), vec!["a".into()]);
        let text = render_summary("ALL_SUMMARIES", &summary, false);
        assert!(text.starts_with("--- ALL_SUMMARIES ---"));
        assert!(text.contains("chunks:       1"));
        assert!(text.contains("Top trend: SSO"));
        assert!(!text.contains("Intermediate steps"));
    }

    #[test]
    fn render_marks_degraded_steps() {
        let summary = SummaryResult::new("final".into(), vec!["first".into(), String::new()]);
        let text = render_summary("ALL_SUMMARIES", &summary, true);
        assert!(text.contains("--- Intermediate steps (2) ---"));
        assert!(text.contains("[chunk 0]\nfirst"));
        assert!(text.contains("[chunk 1]\n(no usable summary)"));
    }

    #[tokio::test]
    async fn missing_table_is_an_error() {
        let store = InMemoryStore::new();
        let err = latest_summary(&store, "ALL_SUMMARIES").await.unwrap_err();
        assert!(err.to_string().contains("no summaries found"));
        assert!(latest_summary(&store, "bad-name").await.is_err());
    }
}
