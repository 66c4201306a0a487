//! Summarization progress reporting.
//!
//! Three layers:
//!
//! 1. [`ProgressTracker`]: lives inside the worker, counts started and
//!    finished completion calls and pushes a [`ProgressEvent`] onto an
//!    unbounded channel after every change.
//! 2. [`SummaryRun`]: the spawned worker task plus its progress and result
//!    channels. The caller drives it with a bounded poll interval and can
//!    cancel it through a [`RunCanceller`].
//! 3. [`ProgressView`] + [`ProgressReporter`]: turn events into a fraction
//!    and status line and print them on **stderr** so stdout stays parseable.

use std::future::Future;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::SummarizeError;
use crate::models::ProgressEvent;

/// Highest fraction shown before the result has arrived.
pub const MAX_PENDING_FRACTION: f64 = 0.95;

/// Meta phases counted on top of the chunk count: chunk completion and final reduction.
const META_PHASES: u64 = 2;

#[derive(Default)]
struct Counters {
    started: u64,
    finished: u64,
}

/// Counts completion calls for one run and emits ordered progress events.
///
/// `total` is fixed at construction (chunk count + 2). Reported counts
/// saturate at `total`, so `finished <= started <= total` holds even when
/// collapse rounds issue more calls than were budgeted.
pub struct ProgressTracker {
    counters: Mutex<Counters>,
    total: u64,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressTracker {
    pub fn new(chunk_count: usize, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            total: chunk_count as u64 + META_PHASES,
            tx: Some(tx),
        }
    }

    /// A tracker that counts but sends nowhere.
    pub fn detached(chunk_count: usize) -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            total: chunk_count as u64 + META_PHASES,
            tx: None,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Record a call about to be issued.
    pub fn start(&self) {
        self.bump(|c| c.started += 1);
    }

    /// Record a call that returned (success, degraded, or failed).
    pub fn finish(&self) {
        self.bump(|c| c.finished += 1);
    }

    /// Current `(started, finished)` as reported in events.
    pub fn snapshot(&self) -> (u64, u64) {
        let guard = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        self.clamped(&guard)
    }

    fn clamped(&self, c: &Counters) -> (u64, u64) {
        let started = c.started.min(self.total);
        let finished = c.finished.min(started);
        (started, finished)
    }

    // Increment and send under one lock so events leave in counter order.
    fn bump(&self, f: impl FnOnce(&mut Counters)) {
        let mut guard = self.counters.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard);
        let (started, finished) = self.clamped(&guard);
        if let Some(tx) = &self.tx {
            // The render loop may have gone away; the run still completes.
            let _ = tx.send(ProgressEvent::Update {
                started,
                finished,
                total: self.total,
            });
        }
    }
}

/// Cancels a [`SummaryRun`] from anywhere (e.g. a Ctrl-C handler).
#[derive(Clone)]
pub struct RunCanceller {
    abort: AbortHandle,
    cancelled: Arc<AtomicBool>,
}

impl RunCanceller {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.abort.abort();
    }
}

/// A summarization running on a background tokio task.
pub struct SummaryRun<T> {
    progress: mpsc::UnboundedReceiver<ProgressEvent>,
    result: oneshot::Receiver<Result<T, SummarizeError>>,
    abort: AbortHandle,
    cancelled: Arc<AtomicBool>,
}

impl<T: Send + 'static> SummaryRun<T> {
    /// Spawn `work` with a fresh progress sender. Channels are never reused across runs.
    pub fn spawn<F, Fut>(work: F) -> Self
    where
        F: FnOnce(mpsc::UnboundedSender<ProgressEvent>) -> Fut,
        Fut: Future<Output = Result<T, SummarizeError>> + Send + 'static,
    {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let fut = work(progress_tx);
        let handle = tokio::spawn(async move {
            let outcome = fut.await;
            let _ = result_tx.send(outcome);
        });

        Self {
            progress: progress_rx,
            result: result_rx,
            abort: handle.abort_handle(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn canceller(&self) -> RunCanceller {
        RunCanceller {
            abort: self.abort.clone(),
            cancelled: Arc::clone(&self.cancelled),
        }
    }

    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    /// The result if the worker has already finished. Yields it at most once.
    pub fn try_result(&mut self) -> Option<Result<T, SummarizeError>> {
        match self.result.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                if self.cancelled.load(Ordering::SeqCst) {
                    Some(Err(SummarizeError::Cancelled))
                } else {
                    Some(Err(SummarizeError::WorkerPanicked))
                }
            }
        }
    }

    /// Wait at most `timeout` for the next event. `None` on timeout or once
    /// the worker has dropped its sender.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<ProgressEvent> {
        tokio::time::timeout(timeout, self.progress.recv())
            .await
            .ok()
            .flatten()
    }

    /// Render loop: deliver every event in order, waking at least once per
    /// `poll_interval`, until the worker finishes; then return its result.
    ///
    /// Ends when the result is ready even if a progress sender outlives the
    /// worker.
    pub async fn drive(
        mut self,
        poll_interval: Duration,
        mut on_event: impl FnMut(ProgressEvent),
    ) -> Result<T, SummarizeError> {
        loop {
            match tokio::time::timeout(poll_interval, self.progress.recv()).await {
                Ok(Some(event)) => on_event(event),
                Ok(None) => break,
                Err(_) => {
                    if let Some(outcome) = self.try_result() {
                        // the worker sent everything before its result
                        while let Ok(event) = self.progress.try_recv() {
                            on_event(event);
                        }
                        return outcome;
                    }
                }
            }
        }
        self.collect().await
    }

    /// Wait for the result, discarding progress.
    pub async fn wait(self) -> Result<T, SummarizeError> {
        self.drive(Duration::from_secs(1), |_| {}).await
    }

    async fn collect(self) -> Result<T, SummarizeError> {
        match self.result.await {
            Ok(outcome) => outcome,
            Err(_) if self.cancelled.load(Ordering::SeqCst) => Err(SummarizeError::Cancelled),
            Err(_) => Err(SummarizeError::WorkerPanicked),
        }
    }
}

/// What the user sees: a fraction in `[0, 0.95]` until done, and a status line.
#[derive(Debug, Clone)]
pub struct ProgressView {
    fraction: f64,
    text: String,
    started: u64,
    finished: u64,
    total: u64,
}

impl ProgressView {
    pub fn new(chunk_count: usize) -> Self {
        Self {
            fraction: 0.0,
            text: format!("Processing cases... (Total Chunks: {})", chunk_count),
            started: 0,
            finished: 0,
            total: chunk_count as u64 + META_PHASES,
        }
    }

    /// Fold one event in. The fraction never decreases.
    pub fn apply(&mut self, event: &ProgressEvent) {
        let ProgressEvent::Update {
            started,
            finished,
            total,
        } = *event;
        self.started = started;
        self.finished = finished;
        self.total = total;

        let chunk_total = total.saturating_sub(META_PHASES);
        self.text = if finished >= chunk_total {
            "Summarizing chunks....".to_string()
        } else {
            format!(
                "Processing cases... (Chunks finished: {} | Total chunks: {})",
                finished, chunk_total
            )
        };

        if total > 0 {
            let value = (finished as f64 / total as f64).min(MAX_PENDING_FRACTION);
            self.fraction = self.fraction.max(value);
        }
    }

    /// Mark the run done: the only way to reach 1.0.
    pub fn complete(&mut self) {
        self.fraction = 1.0;
        self.text = "Done.".to_string();
    }

    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn counts(&self) -> (u64, u64, u64) {
        (self.started, self.finished, self.total)
    }
}

/// Renders a [`ProgressView`]. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, view: &ProgressView);
}

/// Human-friendly progress on stderr: "process   42%  Processing cases... (...)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, view: &ProgressView) {
        let line = format!(
            "process  {:>3}%  {}\n",
            (view.fraction() * 100.0).round() as u64,
            view.text()
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, view: &ProgressView) {
        let (started, finished, total) = view.counts();
        let obj = serde_json::json!({
            "event": "progress",
            "fraction": view.fraction(),
            "text": view.text(),
            "started": started,
            "finished": finished,
            "total": total,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _view: &ProgressView) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
