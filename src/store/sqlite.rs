//! SQLite-backed [`CaseStore`] and [`SearchIndexService`].
//!
//! The case table (`support_cases`) and the index registry
//! (`search_indexes`) come from [`crate::migrate`]. Output tables are created
//! on first write; search indexes are FTS5 virtual tables dropped and rebuilt
//! from their backing query on every publish.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::{CaseRecord, IndexedCase, SummaryResult};

use super::{
    check_identifier, check_output_table, CaseStore, IndexSpec, SearchHit, SearchIndexService,
    SUMMARY_TABLE_SUFFIX,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `[db] path` and make sure the base schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn table_exists(&self, name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).with_context(|| format!("bad date in store: {}", s))
}

fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

fn case_from_row(row: &SqliteRow) -> Result<CaseRecord> {
    let date: String = row.get("date_created");
    Ok(CaseRecord {
        case_id: row.get("case_id"),
        title: row.get("title"),
        description: row.get("description"),
        status: row.get("status"),
        last_comment: row.get("last_comment"),
        category: row.get("category"),
        date_created: parse_date(&date)?,
    })
}

/// Quoted terms joined with `OR`; bm25 ranks rows matching more terms first.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl CaseStore for SqliteStore {
    async fn upsert_cases(&self, cases: &[CaseRecord]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for case in cases {
            sqlx::query(
                r#"
                INSERT INTO support_cases (case_id, title, description, status,
                                           last_comment, category, date_created)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(case_id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    status = excluded.status,
                    last_comment = excluded.last_comment,
                    category = excluded.category,
                    date_created = excluded.date_created
                "#,
            )
            .bind(&case.case_id)
            .bind(&case.title)
            .bind(&case.description)
            .bind(&case.status)
            .bind(&case.last_comment)
            .bind(&case.category)
            .bind(format_date(case.date_created))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(cases.len())
    }

    async fn latest_case_date(&self) -> Result<Option<NaiveDate>> {
        let latest: Option<String> =
            sqlx::query_scalar("SELECT MAX(date_created) FROM support_cases")
                .fetch_one(&self.pool)
                .await?;
        latest.as_deref().map(parse_date).transpose()
    }

    async fn cases_since(
        &self,
        categories: &[String],
        after: Option<NaiveDate>,
    ) -> Result<Vec<CaseRecord>> {
        let mut sql = String::from(
            "SELECT case_id, title, description, status, last_comment, category, date_created \
             FROM support_cases WHERE 1 = 1",
        );
        if after.is_some() {
            sql.push_str(" AND date_created > ?");
        }
        if !categories.is_empty() {
            let placeholders = vec!["?"; categories.len()].join(", ");
            sql.push_str(&format!(" AND category IN ({})", placeholders));
        }
        sql.push_str(" ORDER BY date_created ASC, case_id ASC");

        let mut query = sqlx::query(&sql);
        if let Some(after) = after {
            query = query.bind(format_date(after));
        }
        for category in categories {
            query = query.bind(category.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(case_from_row).collect()
    }

    async fn categories(&self) -> Result<Vec<String>> {
        let cats: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT category FROM support_cases ORDER BY category")
                .fetch_all(&self.pool)
                .await?;
        Ok(cats)
    }

    async fn append_summary(&self, table: &str, summary: &SummaryResult) -> Result<()> {
        check_output_table(table)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                date TEXT NOT NULL,
                output_text TEXT NOT NULL,
                intermediate_steps TEXT NOT NULL
            )
            "#,
            table
        ))
        .execute(&self.pool)
        .await?;

        let steps = serde_json::to_string(&summary.intermediate_steps)?;
        sqlx::query(&format!(
            "INSERT INTO {} (timestamp, date, output_text, intermediate_steps) VALUES (?, ?, ?, ?)",
            table
        ))
        .bind(summary.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(format_date(summary.date))
        .bind(&summary.output_text)
        .bind(steps)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn summary_tables(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE ? ESCAPE '\\' ORDER BY name",
        )
        .bind(format!("%{}", SUMMARY_TABLE_SUFFIX.replace('_', "\\_")))
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn latest_summary(&self, table: &str) -> Result<Option<SummaryResult>> {
        check_identifier("table", table)?;
        if !self.table_exists(table).await? {
            return Ok(None);
        }
        let row = sqlx::query(&format!(
            "SELECT timestamp, date, output_text, intermediate_steps FROM {} \
             ORDER BY timestamp DESC, id DESC LIMIT 1",
            table
        ))
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let timestamp: String = row.get("timestamp");
        let date: String = row.get("date");
        let steps: String = row.get("intermediate_steps");
        Ok(Some(SummaryResult {
            timestamp: DateTime::parse_from_rfc3339(&timestamp)
                .with_context(|| format!("bad timestamp in {}: {}", table, timestamp))?
                .with_timezone(&Utc),
            date: parse_date(&date)?,
            output_text: row.get("output_text"),
            intermediate_steps: serde_json::from_str(&steps)
                .with_context(|| format!("bad intermediate_steps in {}", table))?,
        }))
    }

    async fn append_index_cases(&self, table: &str, cases: &[IndexedCase]) -> Result<()> {
        check_output_table(table)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                case_id TEXT NOT NULL,
                title TEXT NOT NULL,
                category TEXT NOT NULL,
                date_created TEXT NOT NULL,
                index_text TEXT NOT NULL
            )
            "#,
            table
        ))
        .execute(&mut *tx)
        .await?;

        let insert = format!(
            "INSERT INTO {} (case_id, title, category, date_created, index_text) VALUES (?, ?, ?, ?, ?)",
            table
        );
        for case in cases {
            sqlx::query(&insert)
                .bind(&case.case_id)
                .bind(&case.title)
                .bind(&case.category)
                .bind(format_date(case.date_created))
                .bind(&case.index_text)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SearchIndexService for SqliteStore {
    async fn replace_index(&self, spec: &IndexSpec) -> Result<()> {
        spec.validate()?;
        if !self.table_exists(&spec.source_table).await? {
            bail!("source table not found: {}", spec.source_table);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", spec.name))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE VIRTUAL TABLE {} USING fts5(\
                case_id UNINDEXED, title UNINDEXED, category UNINDEXED, \
                date_created UNINDEXED, {})",
            spec.name, spec.column
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "INSERT INTO {} (case_id, title, category, date_created, {}) {}",
            spec.name,
            spec.column,
            spec.backing_query()
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO search_indexes (name, source_table, column_name, target_lag,
                                        attributes_json, backing_query, refreshed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                source_table = excluded.source_table,
                column_name = excluded.column_name,
                target_lag = excluded.target_lag,
                attributes_json = excluded.attributes_json,
                backing_query = excluded.backing_query,
                refreshed_at = excluded.refreshed_at
            "#,
        )
        .bind(&spec.name)
        .bind(&spec.source_table)
        .bind(&spec.column)
        .bind(&spec.target_lag)
        .bind(serde_json::to_string(&spec.attributes)?)
        .bind(spec.backing_query())
        .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, index: &str, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        check_identifier("index", index)?;
        let match_expr = fts_query(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let registered: Option<String> =
            sqlx::query_scalar("SELECT column_name FROM search_indexes WHERE name = ?")
                .bind(index)
                .fetch_optional(&self.pool)
                .await?;
        let column = match registered {
            Some(column) => column,
            None => bail!("search index not found: {}", index),
        };
        if !self.table_exists(index).await? {
            bail!("search index not found: {}", index);
        }
        check_identifier("column", &column)?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT case_id, title, category, date_created, rank,
                   {col} AS text,
                   snippet({idx}, 4, '>>>', '<<<', '...', 24) AS snippet
            FROM {idx}
            WHERE {idx} MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
            idx = index,
            col = column
        ))
        .bind(&match_expr)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                let date: String = row.get("date_created");
                Ok(SearchHit {
                    case_id: row.get("case_id"),
                    title: row.get("title"),
                    category: row.get("category"),
                    date_created: parse_date(&date)?,
                    snippet: row.get("snippet"),
                    text: row.get("text"),
                    score: -rank,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{cases_table, IndexSpec};
    use tempfile::TempDir;

    fn case(id: &str, category: &str, date: &str, description: &str) -> CaseRecord {
        CaseRecord {
            case_id: id.to_string(),
            title: format!("case {}", id),
            description: description.to_string(),
            status: "open".to_string(),
            last_comment: "".to_string(),
            category: category.to_string(),
            date_created: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
        }
    }

    async fn open(dir: &TempDir) -> SqliteStore {
        let config = Config::with_db_path(dir.path().join("digest.db"));
        SqliteStore::open(&config).await.unwrap()
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(fts_query("login  fails"), "\"login\" OR \"fails\"");
        assert_eq!(fts_query("a\"b"), "\"a\"\"b\"");
        assert_eq!(fts_query("   "), "");
    }

    #[tokio::test]
    async fn upsert_and_filter_cases() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        store
            .upsert_cases(&[
                case("1", "auth", "2024-01-05", "a"),
                case("2", "billing", "2024-02-05", "b"),
                case("3", "auth", "2024-03-05", "c"),
            ])
            .await
            .unwrap();
        // second write replaces, not duplicates
        store
            .upsert_cases(&[case("3", "auth", "2024-03-05", "changed")])
            .await
            .unwrap();

        assert_eq!(
            store.latest_case_date().await.unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 5)
        );
        let after = NaiveDate::from_ymd_opt(2024, 1, 5);
        let recent = store.cases_since(&[], after).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].description, "changed");

        let auth = store
            .cases_since(&["auth".to_string()], None)
            .await
            .unwrap();
        assert_eq!(auth.len(), 2);
        assert_eq!(
            store.categories().await.unwrap(),
            vec!["auth".to_string(), "billing".to_string()]
        );
        store.close().await;
    }

    #[tokio::test]
    async fn empty_table_has_no_latest_date() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        assert!(store.latest_case_date().await.unwrap().is_none());
        assert!(store.summary_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summaries_append_and_read_back_newest() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let older = SummaryResult::new("older".into(), vec!["s1".into(), "".into()]);
        let mut newer = SummaryResult::new("newer".into(), vec!["s2".into()]);
        newer.timestamp = older.timestamp + chrono::Duration::seconds(1);

        store.append_summary("ALL_SUMMARIES", &newer).await.unwrap();
        store.append_summary("ALL_SUMMARIES", &older).await.unwrap();
        store.append_summary("AUTH_SUMMARIES", &older).await.unwrap();

        assert_eq!(
            store.summary_tables().await.unwrap(),
            vec!["ALL_SUMMARIES".to_string(), "AUTH_SUMMARIES".to_string()]
        );
        let latest = store.latest_summary("ALL_SUMMARIES").await.unwrap().unwrap();
        assert_eq!(latest.output_text, "newer");
        assert_eq!(latest.intermediate_steps, vec!["s2".to_string()]);

        let auth = store.latest_summary("AUTH_SUMMARIES").await.unwrap().unwrap();
        assert_eq!(auth.intermediate_steps, vec!["s1".to_string(), String::new()]);
        assert!(store.latest_summary("NOPE_SUMMARIES").await.unwrap().is_none());
        assert!(store.latest_summary("bad name").await.is_err());
    }

    #[tokio::test]
    async fn index_is_replaced_and_searchable() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let cases = vec![
            case("1", "auth", "2024-01-05", "SSO login loops forever"),
            case("2", "billing", "2024-01-06", "invoice total is wrong"),
        ];
        let indexed: Vec<IndexedCase> = cases.iter().map(IndexedCase::from).collect();
        store
            .append_index_cases(&cases_table("ALL"), &indexed)
            .await
            .unwrap();

        let spec = IndexSpec::for_prefix("ALL", "1 day");
        store.replace_index(&spec).await.unwrap();
        store.replace_index(&spec).await.unwrap();

        let hits = store.search(&spec.name, "login", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].case_id, "1");
        assert_eq!(hits[0].category, "auth");
        assert!(hits[0].snippet.contains(">>>"));
        assert_eq!(hits[0].text, indexed[0].index_text);

        // any term matches; rows matching more terms rank first
        let hits = store.search(&spec.name, "invoice wrong login", 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.case_id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);

        let lag: String =
            sqlx::query_scalar("SELECT target_lag FROM search_indexes WHERE name = ?")
                .bind(&spec.name)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(lag, "1 day");

        assert!(store.search("MISSING_CORTEX_SEARCH", "x", 5).await.is_err());
    }

    #[tokio::test]
    async fn output_table_colliding_with_base_table_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let indexed = vec![IndexedCase::from(&case("1", "auth", "2024-01-05", "x"))];
        let err = store
            .append_index_cases(&cases_table("support"), &indexed)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("support_cases"));
        let summary = SummaryResult::new("s".into(), vec![]);
        assert!(store.append_summary("SEARCH_INDEXES", &summary).await.is_err());
        // base table untouched
        assert!(store.latest_case_date().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replace_index_without_source_table_fails() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let spec = IndexSpec::for_prefix("NONE", "1 day");
        assert!(store.replace_index(&spec).await.is_err());
    }
}
