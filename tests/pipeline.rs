//! End-to-end pipeline scenarios against scripted completion backends.
//!
//! These run the real chunker, completion client, summarizer and stores;
//! only the LLM is faked. Every request is recorded so tests can assert
//! exact call counts, including zero.

use async_trait::async_trait;
use case_digest::config::Config;
use case_digest::error::{CompletionError, SummarizeError};
use case_digest::llm::{CompletionBackend, CompletionRequest, CompletionResponse};
use case_digest::completion::ResponseCache;
use case_digest::models::CaseRecord;
use case_digest::pipeline::{CaseIngestionPipeline, PipelineOptions};
use case_digest::progress::{ProgressView, MAX_PENDING_FRACTION};
use case_digest::store::memory::InMemoryStore;
use case_digest::store::sqlite::SqliteStore;
use case_digest::store::{CaseStore, SearchIndexService};
use case_digest::tokens::{counter_for, TokenCounter};
use chrono::NaiveDate;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ─── Fakes ──────────────────────────────────────────────────────────

/// Counts whitespace-separated words, so budgets in tests are easy to reason about.
struct WordCounter;

impl TokenCounter for WordCounter {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
    fn name(&self) -> &str {
        "words"
    }
}

#[derive(Clone, Copy)]
enum Behaviour {
    Answer,
    FailEverything,
}

/// Answers map prompts with a 10-word summary and reduce prompts with a
/// short consolidated text. Every call costs 100 tokens.
struct ScriptedLlm {
    behaviour: Behaviour,
    calls: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn map_calls(&self) -> usize {
        self.count_matching("### Cases ###")
    }

    fn reduce_calls(&self) -> usize {
        self.count_matching("### Case Chunk Summaries ###")
    }

    fn count_matching(&self, marker: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.prompt().contains(marker))
            .count()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, CompletionError> {
        self.calls.lock().unwrap().push(request.clone());
        if let Behaviour::FailEverything = self.behaviour {
            return Err(CompletionError::Request("service unavailable".to_string()));
        }
        let message = if request.prompt().contains("### Cases ###") {
            "cases mention login failures and slow exports in several regions".to_string()
        } else {
            "Trend report: login failures dominate.".to_string()
        };
        Ok(CompletionResponse {
            message,
            total_tokens: 100,
        })
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

fn case(id: &str, category: &str, date: &str, description: &str) -> CaseRecord {
    CaseRecord {
        case_id: id.to_string(),
        title: format!("t{}", id),
        description: description.to_string(),
        status: "open".to_string(),
        last_comment: "c".to_string(),
        category: category.to_string(),
        date_created: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
    }
}

fn three_cases() -> Vec<CaseRecord> {
    vec![
        case("1", "Auth", "2024-03-01", "SSO login loops back to the sign-in page"),
        case("2", "Data", "2024-03-10", "CSV export times out for large tables"),
        case("3", "Auth", "2024-03-20", "MFA codes rejected after device change"),
    ]
}

fn config() -> Config {
    let mut config = Config::with_db_path("unused.db");
    config.llm.max_retries = 2;
    config.llm.concurrency = 3;
    config
}

fn options(config: &Config) -> PipelineOptions {
    PipelineOptions::from_config(config)
}

fn pipeline(
    config: Config,
    store: Arc<InMemoryStore>,
    llm: Arc<ScriptedLlm>,
    counter: Arc<dyn TokenCounter>,
) -> CaseIngestionPipeline {
    CaseIngestionPipeline::new(config, store.clone(), store, llm, counter).unwrap()
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn three_cases_fit_one_chunk_and_persist_one_row() {
    let store = Arc::new(InMemoryStore::with_cases(three_cases()));
    let llm = ScriptedLlm::new(Behaviour::Answer);
    let cfg = config();
    let p = pipeline(cfg.clone(), store.clone(), llm.clone(), counter_for("approx").unwrap());

    let report = p.run(&options(&cfg), None).await.unwrap();

    assert_eq!(report.case_count, 3);
    assert_eq!(report.chunk_count, 1);
    assert_eq!(report.summary.intermediate_steps.len(), 1);
    assert_eq!(report.summary.output_text, "Trend report: login failures dominate.");
    assert!(report.converged);
    assert_eq!(llm.map_calls(), 1);
    assert_eq!(llm.reduce_calls(), 1);
    assert_eq!(report.total_tokens, 200);

    let rows = store.summaries("ALL_SUMMARIES");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0], report.summary);

    assert_eq!(report.index_published.as_deref(), Some("ALL_CORTEX_SEARCH"));
    assert_eq!(store.published_cases("ALL_CASES").len(), 3);
    assert_eq!(store.index_rebuilds(), 1);
    assert_eq!(
        store.index_spec("ALL_CORTEX_SEARCH").unwrap().target_lag,
        "1 day"
    );
}

#[tokio::test]
async fn five_chunks_collapse_twice_and_keep_all_steps() {
    // Each record is 26 words; two together (plus the separator) exceed 40.
    let description = vec!["word"; 15].join(" ");
    let cases: Vec<CaseRecord> = (1..=5)
        .map(|i| case(&i.to_string(), "Auth", &format!("2024-03-0{}", i), &description))
        .collect();
    let store = Arc::new(InMemoryStore::with_cases(cases));
    let llm = ScriptedLlm::new(Behaviour::Answer);

    let mut cfg = config();
    cfg.chunking.chunk_size = 40;
    cfg.chunking.chunk_overlap = 0;
    // Map summaries are 10 words: three fit in 30, four do not.
    cfg.summarize.token_max = 30;
    let p = pipeline(cfg.clone(), store.clone(), llm.clone(), Arc::new(WordCounter));

    let report = p.run(&options(&cfg), None).await.unwrap();

    assert_eq!(report.chunk_count, 5);
    assert_eq!(report.summary.intermediate_steps.len(), 5);
    assert!(report
        .summary
        .intermediate_steps
        .iter()
        .all(|s| s.starts_with("cases mention")));
    assert_eq!(report.collapse_rounds, 2);
    assert!(report.converged);
    assert_eq!(llm.map_calls(), 5);
    // round one reduces groups of 3 and 2, round two reduces the pair
    assert_eq!(llm.reduce_calls(), 3);
    assert_eq!(store.summaries("ALL_SUMMARIES").len(), 1);
}

#[tokio::test]
async fn empty_filtered_corpus_fails_before_any_call() {
    let store = Arc::new(InMemoryStore::with_cases(three_cases()));
    let llm = ScriptedLlm::new(Behaviour::Answer);
    let cfg = config();
    let p = pipeline(cfg.clone(), store.clone(), llm.clone(), counter_for("approx").unwrap());

    let mut opts = options(&cfg);
    opts.categories = vec!["Billing".to_string()];
    let err = p.run(&opts, None).await.unwrap_err();

    assert!(matches!(err, SummarizeError::EmptyCorpus));
    assert_eq!(err.to_string(), "No data found for the given filters.");
    assert_eq!(llm.total_calls(), 0);
    assert!(store.summaries("ALL_SUMMARIES").is_empty());
    assert_eq!(store.index_rebuilds(), 0);
}

#[tokio::test]
async fn empty_store_is_an_empty_corpus() {
    let store = Arc::new(InMemoryStore::new());
    let llm = ScriptedLlm::new(Behaviour::Answer);
    let cfg = config();
    let p = pipeline(cfg.clone(), store, llm.clone(), counter_for("approx").unwrap());
    let err = p.run(&options(&cfg), None).await.unwrap_err();
    assert!(err.is_input_error());
    assert_eq!(llm.total_calls(), 0);
}

#[tokio::test]
async fn lookback_window_excludes_old_cases() {
    let mut cases = three_cases();
    cases.push(case("old", "Auth", "2023-01-01", "ancient"));
    let store = Arc::new(InMemoryStore::with_cases(cases));
    let llm = ScriptedLlm::new(Behaviour::Answer);
    let cfg = config();
    let p = pipeline(cfg.clone(), store.clone(), llm, counter_for("approx").unwrap());

    let mut opts = options(&cfg);
    opts.weeks_back = 4;
    let corpus = p.prepare(&opts).await.unwrap();
    let ids: Vec<&str> = corpus.cases.iter().map(|c| c.case_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn fatal_llm_failure_persists_nothing() {
    let store = Arc::new(InMemoryStore::with_cases(three_cases()));
    let llm = ScriptedLlm::new(Behaviour::FailEverything);
    let cfg = config();
    let p = pipeline(cfg.clone(), store.clone(), llm.clone(), counter_for("approx").unwrap());

    let err = p.run(&options(&cfg), None).await.unwrap_err();
    match err {
        SummarizeError::Completion(CompletionError::Fatal { attempts, .. }) => {
            assert_eq!(attempts, 2)
        }
        other => panic!("expected fatal completion error, got {:?}", other),
    }
    // one chunk, two attempts, no reduce
    assert_eq!(llm.total_calls(), 2);
    assert!(store.summaries("ALL_SUMMARIES").is_empty());
    assert!(store.published_cases("ALL_CASES").is_empty());
    assert_eq!(store.index_rebuilds(), 0);
}

#[tokio::test]
async fn no_index_skips_publishing() {
    let store = Arc::new(InMemoryStore::with_cases(three_cases()));
    let llm = ScriptedLlm::new(Behaviour::Answer);
    let cfg = config();
    let p = pipeline(cfg.clone(), store.clone(), llm, counter_for("approx").unwrap());

    let mut opts = options(&cfg);
    opts.publish_index = false;
    opts.prefix = "AUTH".to_string();
    let report = p.run(&opts, None).await.unwrap();

    assert!(report.index_published.is_none());
    assert_eq!(report.summary_table, "AUTH_SUMMARIES");
    assert_eq!(store.summaries("AUTH_SUMMARIES").len(), 1);
    assert_eq!(store.index_rebuilds(), 0);
}

#[tokio::test]
async fn spawned_run_reports_monotonic_progress() {
    let store = Arc::new(InMemoryStore::with_cases(three_cases()));
    let llm = ScriptedLlm::new(Behaviour::Answer);
    let cfg = config();
    let p = Arc::new(pipeline(
        cfg.clone(),
        store.clone(),
        llm,
        counter_for("approx").unwrap(),
    ));

    let opts = options(&cfg);
    let corpus = p.prepare(&opts).await.unwrap();
    let mut view = ProgressView::new(corpus.chunks.len());
    let mut fractions = Vec::new();
    let mut last_counts = (0, 0, 0);

    let run = p.spawn(opts, corpus);
    let report = run
        .drive(Duration::from_millis(50), |event| {
            view.apply(&event);
            fractions.push(view.fraction());
            last_counts = view.counts();
        })
        .await
        .unwrap();

    assert_eq!(report.chunk_count, 1);
    // one map call and one reduce call, total = chunks + 2
    assert_eq!(fractions.len(), 4);
    assert_eq!(last_counts, (2, 2, 3));
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    assert!(fractions.iter().all(|f| *f <= MAX_PENDING_FRACTION));
    view.complete();
    assert_eq!(view.fraction(), 1.0);
}

#[tokio::test]
async fn shared_cache_makes_repeat_runs_free() {
    let store = Arc::new(InMemoryStore::with_cases(three_cases()));
    let llm = ScriptedLlm::new(Behaviour::Answer);
    let cfg = config();
    let p = pipeline(cfg.clone(), store.clone(), llm.clone(), counter_for("approx").unwrap())
        .with_cache(Arc::new(ResponseCache::new()));

    let first = p.run(&options(&cfg), None).await.unwrap();
    let calls_after_first = llm.total_calls();
    let second = p.run(&options(&cfg), None).await.unwrap();

    assert_eq!(llm.total_calls(), calls_after_first);
    assert_eq!(second.total_tokens, 0);
    assert_eq!(first.summary.output_text, second.summary.output_text);
    assert_eq!(store.summaries("ALL_SUMMARIES").len(), 2);
}

#[tokio::test]
async fn sqlite_store_end_to_end_with_cl100k() {
    let tmp = TempDir::new().unwrap();
    let cfg = Config::with_db_path(tmp.path().join("digest.sqlite"));
    let store = Arc::new(SqliteStore::open(&cfg).await.unwrap());
    store.upsert_cases(&three_cases()).await.unwrap();

    let llm = ScriptedLlm::new(Behaviour::Answer);
    let p = CaseIngestionPipeline::new(
        cfg.clone(),
        store.clone(),
        store.clone(),
        llm.clone(),
        counter_for("cl100k_base").unwrap(),
    )
    .unwrap();

    let report = p.run(&PipelineOptions::from_config(&cfg), None).await.unwrap();
    assert_eq!(report.chunk_count, 1);

    let latest = store.latest_summary("ALL_SUMMARIES").await.unwrap().unwrap();
    assert_eq!(latest.output_text, report.summary.output_text);
    assert_eq!(latest.intermediate_steps, report.summary.intermediate_steps);

    let hits = store.search("ALL_CORTEX_SEARCH", "export", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].case_id, "2");
}
