//! Case ingestion pipeline: select, chunk, summarize, persist.
//!
//! ```text
//! CaseStore ──▶ lookback + category filter ──▶ labelled corpus
//!     ──▶ DocumentChunker ──▶ MapReduceSummarizer ──▶ {PREFIX}_SUMMARIES
//!                                                 └──▶ {PREFIX}_CASES + index (optional)
//! ```
//!
//! [`CaseIngestionPipeline::prepare`] does the cheap part (query and chunk)
//! so the caller can report the chunk count up front;
//! [`CaseIngestionPipeline::execute`] does the completion work and
//! persistence. [`CaseIngestionPipeline::spawn`] runs `execute` on a
//! background task behind a [`SummaryRun`].
//!
//! Nothing is written unless summarization succeeds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use chrono::NaiveDate;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::DocumentChunker;
use crate::completion::{CompletionClient, CompletionSettings, ResponseCache};
use crate::config::{Config, PricingConfig};
use crate::error::SummarizeError;
use crate::llm::{create_backend, CompletionBackend};
use crate::models::{CaseRecord, DocumentChunk, IndexedCase, ProgressEvent, SummaryResult};
use crate::progress::{format_number, ProgressMode, ProgressTracker, ProgressView, SummaryRun};
use crate::store::sqlite::SqliteStore;
use crate::store::{cases_table, summary_table, CaseStore, IndexSpec, SearchIndexService};
use crate::summarize::{MapReduceSummarizer, SummarizeSettings};
use crate::tokens::{counter_for, TokenCounter};

/// Separator between labelled records in the corpus.
pub const RECORD_JOINER: &str = " ";

/// Longest accepted lookback, in weeks.
pub const MAX_WEEKS_BACK: u32 = 520;

/// Per-run knobs. Defaults come from the config; the CLI overrides them.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub weeks_back: u32,
    /// Empty means every category.
    pub categories: Vec<String>,
    pub concurrency: usize,
    pub model: String,
    pub prefix: String,
    pub publish_index: bool,
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            weeks_back: config.summarize.weeks_back,
            categories: config.summarize.categories.clone(),
            concurrency: config.llm.concurrency,
            model: config.llm.model.clone(),
            prefix: config.summarize.prefix.clone(),
            publish_index: config.summarize.publish_index,
        }
    }

    /// Checks CLI overrides with the same rules as the config file.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=64).contains(&self.concurrency) {
            anyhow::bail!("--concurrency must be in [1, 64]");
        }
        if self.model.trim().is_empty() {
            anyhow::bail!("--model must not be empty");
        }
        if !(1..=MAX_WEEKS_BACK).contains(&self.weeks_back) {
            anyhow::bail!("--weeks must be in [1, {}]", MAX_WEEKS_BACK);
        }
        crate::store::check_prefix(&self.prefix)
    }
}

/// Credits and dollars for a token count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostEstimate {
    pub credits: f64,
    pub usd: f64,
}

impl CostEstimate {
    pub fn from_tokens(total_tokens: u64, pricing: &PricingConfig) -> Self {
        let credits = total_tokens as f64 / 1_000_000.0 * pricing.credits_per_million_tokens;
        Self {
            credits,
            usd: credits * pricing.usd_per_credit,
        }
    }
}

/// Cases and chunks selected for one run.
#[derive(Debug, Clone)]
pub struct PreparedCorpus {
    pub cases: Vec<CaseRecord>,
    pub chunks: Vec<DocumentChunk>,
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: String,
    pub total_tokens: u64,
    pub chunk_count: usize,
    pub case_count: usize,
    pub elapsed: Duration,
    pub summary: SummaryResult,
    pub collapse_rounds: usize,
    pub converged: bool,
    pub summary_table: String,
    /// Name of the rebuilt index, when publishing was requested.
    pub index_published: Option<String>,
}

/// Lower bound (exclusive) of the lookback window ending at `latest`.
/// `None` when the window reaches past the earliest representable date.
pub fn window_start(latest: NaiveDate, weeks_back: u32) -> Option<NaiveDate> {
    latest.checked_sub_signed(chrono::Duration::days(i64::from(weeks_back) * 7))
}

/// Labelled records joined into one text.
pub fn build_corpus(cases: &[CaseRecord]) -> String {
    cases
        .iter()
        .map(CaseRecord::labelled_text)
        .collect::<Vec<_>>()
        .join(RECORD_JOINER)
}

/// Cases inside the lookback window ending at the newest case, filtered by category.
pub async fn select_cases(
    store: &dyn CaseStore,
    weeks_back: u32,
    categories: &[String],
) -> anyhow::Result<Vec<CaseRecord>> {
    let latest = match store.latest_case_date().await? {
        Some(d) => d,
        None => return Ok(Vec::new()),
    };
    let after = match window_start(latest, weeks_back) {
        Some(d) => d,
        None => bail!("a {}-week window before {} is out of range", weeks_back, latest),
    };
    store.cases_since(categories, Some(after)).await
}

pub struct CaseIngestionPipeline {
    config: Config,
    store: Arc<dyn CaseStore>,
    index: Arc<dyn SearchIndexService>,
    backend: Arc<dyn CompletionBackend>,
    counter: Arc<dyn TokenCounter>,
    chunker: Arc<DocumentChunker>,
    cache: Option<Arc<ResponseCache>>,
}

impl CaseIngestionPipeline {
    /// # Errors
    ///
    /// Fails if the chunking section cannot build a chunker (e.g. a bad
    /// separator pattern).
    pub fn new(
        config: Config,
        store: Arc<dyn CaseStore>,
        index: Arc<dyn SearchIndexService>,
        backend: Arc<dyn CompletionBackend>,
        counter: Arc<dyn TokenCounter>,
    ) -> anyhow::Result<Self> {
        let chunker = DocumentChunker::from_config(&config.chunking, Arc::clone(&counter))?;
        Ok(Self {
            config,
            store,
            index,
            backend,
            counter,
            chunker: Arc::new(chunker),
            cache: None,
        })
    }

    /// Share a response cache across runs of this pipeline.
    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Select and chunk the corpus. Makes no completion calls.
    ///
    /// # Errors
    ///
    /// [`SummarizeError::EmptyCorpus`] when the filters leave nothing.
    pub async fn prepare(&self, options: &PipelineOptions) -> Result<PreparedCorpus, SummarizeError> {
        let cases = select_cases(self.store.as_ref(), options.weeks_back, &options.categories)
            .await
            .map_err(SummarizeError::Store)?;
        if cases.is_empty() {
            return Err(SummarizeError::EmptyCorpus);
        }

        let corpus = build_corpus(&cases);
        let chunker = Arc::clone(&self.chunker);
        // tokenizing a large corpus is CPU-bound
        let chunks = tokio::task::spawn_blocking(move || chunker.split(&corpus))
            .await
            .map_err(|_| SummarizeError::WorkerPanicked)?;
        if chunks.is_empty() {
            return Err(SummarizeError::EmptyCorpus);
        }

        info!(
            cases = cases.len(),
            chunks = chunks.len(),
            weeks_back = options.weeks_back,
            "corpus prepared"
        );
        Ok(PreparedCorpus { cases, chunks })
    }

    /// Summarize a prepared corpus and persist the result.
    pub async fn execute(
        &self,
        options: &PipelineOptions,
        corpus: PreparedCorpus,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Result<PipelineReport, SummarizeError> {
        if corpus.chunks.is_empty() {
            return Err(SummarizeError::EmptyCorpus);
        }

        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let chunk_count = corpus.chunks.len();

        let tracker = Arc::new(match progress {
            Some(tx) => ProgressTracker::new(chunk_count, tx),
            None => ProgressTracker::detached(chunk_count),
        });

        let mut settings = CompletionSettings::from_config(&self.config.llm);
        settings.model = options.model.clone();
        settings.concurrency = options.concurrency;

        let mut client =
            CompletionClient::new(Arc::clone(&self.backend), settings).with_progress(tracker);
        if let Some(cache) = &self.cache {
            client = client.with_cache(Arc::clone(cache));
        }

        info!(
            run_id = %run_id,
            backend = self.backend.name(),
            model = %options.model,
            concurrency = options.concurrency,
            chunks = chunk_count,
            "summary run started"
        );

        let summarizer = MapReduceSummarizer::new(
            client.clone(),
            Arc::clone(&self.counter),
            SummarizeSettings::from_config(&self.config.summarize),
        );
        let output = summarizer.summarize(&corpus.chunks).await?;
        let collapse_rounds = output.collapse_rounds;
        let converged = output.converged;
        let summary = output.into_result();

        let table = summary_table(&options.prefix);
        self.store
            .append_summary(&table, &summary)
            .await
            .map_err(SummarizeError::Store)?;

        let index_published = if options.publish_index {
            Some(self.publish(options, &corpus.cases).await?)
        } else {
            None
        };

        if !converged {
            warn!(run_id = %run_id, "summary stored from a non-converged collapse");
        }

        let report = PipelineReport {
            run_id,
            total_tokens: client.total_tokens(),
            chunk_count,
            case_count: corpus.cases.len(),
            elapsed: started.elapsed(),
            summary,
            collapse_rounds,
            converged,
            summary_table: table,
            index_published,
        };
        info!(
            run_id = %report.run_id,
            tokens = report.total_tokens,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "summary run finished"
        );
        Ok(report)
    }

    async fn publish(
        &self,
        options: &PipelineOptions,
        cases: &[CaseRecord],
    ) -> Result<String, SummarizeError> {
        let table = cases_table(&options.prefix);
        let rows: Vec<IndexedCase> = cases.iter().map(IndexedCase::from).collect();
        self.store
            .append_index_cases(&table, &rows)
            .await
            .map_err(SummarizeError::Store)?;

        let spec = IndexSpec::for_prefix(&options.prefix, &self.config.index.target_lag);
        self.index
            .replace_index(&spec)
            .await
            .map_err(SummarizeError::Store)?;
        info!(index = %spec.name, rows = rows.len(), "search index rebuilt");
        Ok(spec.name)
    }

    /// `prepare` followed by `execute`, on the current task.
    pub async fn run(
        &self,
        options: &PipelineOptions,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Result<PipelineReport, SummarizeError> {
        let corpus = self.prepare(options).await?;
        self.execute(options, corpus, progress).await
    }

    /// Run `execute` on a background task.
    pub fn spawn(
        self: &Arc<Self>,
        options: PipelineOptions,
        corpus: PreparedCorpus,
    ) -> SummaryRun<PipelineReport> {
        let pipeline = Arc::clone(self);
        SummaryRun::spawn(move |tx| async move {
            pipeline.execute(&options, corpus, Some(tx)).await
        })
    }
}

// ============ CLI entry points ============

/// Most rows `digest preview` prints.
pub const PREVIEW_MAX_ROWS: usize = 1000;

/// `digest categories`.
pub async fn run_categories(config: &Config) -> anyhow::Result<()> {
    let store = SqliteStore::open(config).await?;
    let cats = store.categories().await;
    store.close().await;

    let cats = cats?;
    if cats.is_empty() {
        println!("No categories.");
    }
    for c in cats {
        println!("{}", c);
    }
    Ok(())
}

/// `digest preview`: the cases a run with `options` would read.
pub async fn run_preview(
    config: &Config,
    options: &PipelineOptions,
    limit: usize,
) -> anyhow::Result<()> {
    options.validate()?;

    let store = SqliteStore::open(config).await?;
    let cases = select_cases(&store, options.weeks_back, &options.categories).await;
    store.close().await;

    let cases = cases?;
    if cases.is_empty() {
        println!("{}", SummarizeError::EmptyCorpus);
        return Ok(());
    }

    let shown = limit.min(PREVIEW_MAX_ROWS);
    println!(
        "{} case(s) in window (showing {}):",
        cases.len(),
        shown.min(cases.len())
    );
    // newest first, like the dashboard table
    for case in cases.iter().rev().take(shown) {
        println!("{}  {:<20}  {}", case.date_created, case.category, case.title);
    }
    Ok(())
}

/// `digest process`: prepare, run in the background with live progress,
/// then print the cost summary.
pub async fn run_process(
    config: &Config,
    options: PipelineOptions,
    mode: ProgressMode,
) -> anyhow::Result<()> {
    options.validate()?;

    let store = Arc::new(SqliteStore::open(config).await?);
    let backend = create_backend(&config.llm)?;
    let counter = counter_for(&config.chunking.encoding)?;

    let mut pipeline = CaseIngestionPipeline::new(
        config.clone(),
        store.clone(),
        store.clone(),
        backend,
        counter,
    )?;
    if config.llm.cache {
        pipeline = pipeline.with_cache(Arc::new(ResponseCache::new()));
    }
    let pipeline = Arc::new(pipeline);

    let corpus = pipeline.prepare(&options).await?;
    if !config.llm.is_enabled() {
        bail!("LLM provider is disabled. Set [llm] provider in config.");
    }

    let reporter = mode.reporter();
    let mut view = ProgressView::new(corpus.chunks.len());
    reporter.report(&view);

    let run = pipeline.spawn(options, corpus);
    let canceller = run.canceller();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let outcome = run
        .drive(Duration::from_secs(1), |event| {
            view.apply(&event);
            reporter.report(&view);
        })
        .await;
    ctrl_c.abort();

    let report = outcome.map_err(|e| anyhow::anyhow!("Summary run failed: {}", e))?;
    view.complete();
    reporter.report(&view);

    let cost = CostEstimate::from_tokens(report.total_tokens, &config.pricing);
    println!(
        "Summary stored in {} ({} cases, {} chunks, {} collapse round(s)).",
        report.summary_table, report.case_count, report.chunk_count, report.collapse_rounds
    );
    if !report.converged {
        println!("Warning: reduction did not converge; summary is best effort.");
    }
    if let Some(index) = &report.index_published {
        println!("Search index {} rebuilt.", index);
    }
    println!("Elapsed:      {:.1}s", report.elapsed.as_secs_f64());
    println!("Total tokens: {}", format_number(report.total_tokens));
    println!("Credits:      {:.4}", cost.credits);
    println!("Est. cost:    ${:.2}", cost.usd);
    Ok(())
}
