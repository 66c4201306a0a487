//! Case import from JSON Lines (`digest load`).
//!
//! One JSON object per line. Field names follow [`CaseRecord`]; the
//! warehouse's upper-case column names are accepted too. Blank lines are
//! skipped. Records are upserted by `case_id`.

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::models::CaseRecord;
use crate::store::sqlite::SqliteStore;
use crate::store::CaseStore;

/// Parse JSONL text into records. Errors name the 1-based line.
pub fn parse_jsonl(text: &str) -> Result<Vec<CaseRecord>> {
    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: CaseRecord = serde_json::from_str(line)
            .with_context(|| format!("line {}: invalid case record", i + 1))?;
        if record.case_id.trim().is_empty() {
            bail!("line {}: case_id must not be empty", i + 1);
        }
        records.push(record);
    }
    Ok(records)
}

/// Read `path` and upsert every record. Returns the number written.
pub async fn load_cases(store: &dyn CaseStore, path: &Path) -> Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let records = parse_jsonl(&text)?;
    if records.is_empty() {
        return Ok(0);
    }
    store.upsert_cases(&records).await
}

/// `digest load`.
pub async fn run_load(config: &Config, path: &Path) -> Result<()> {
    let store = SqliteStore::open(config).await?;
    let outcome = load_cases(&store, path).await;
    store.close().await;

    let written = outcome?;
    println!("Loaded {} case(s) from {}.", written, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use std::io::Write;

    const SAMPLE: &str = r#"{"case_id":"1","title":"SSO loop","description":"d","status":"open","last_comment":"c","category":"auth","date_created":"2024-01-02"}

{"case_id":"2","title":"Invoice","category":"billing","date_created":"2024-01-03"}
"#;

    #[test]
    fn parses_and_skips_blank_lines() {
        let records = parse_jsonl(SAMPLE).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].status, "");
    }

    #[test]
    fn error_names_the_line() {
        let err = parse_jsonl("{\"case_id\":\"1\"}\n").unwrap_err();
        assert!(format!("{:#}", err).contains("line 1"));
        let err = parse_jsonl("\n{\"case_id\":\"\",\"title\":\"t\",\"category\":\"c\",\"date_created\":\"2024-01-01\"}").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[tokio::test]
    async fn load_upserts_into_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let store = InMemoryStore::new();
        assert_eq!(load_cases(&store, file.path()).await.unwrap(), 2);
        assert_eq!(load_cases(&store, file.path()).await.unwrap(), 2);
        assert_eq!(store.cases_since(&[], None).await.unwrap().len(), 2);
    }
}
