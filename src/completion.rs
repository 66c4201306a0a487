//! Retrying, bounded-concurrency completion client.
//!
//! [`CompletionClient`] wraps a [`CompletionBackend`] with:
//!
//! - a fixed number of attempts per prompt, with a flat `retry_delay`
//!   between attempts (no exponential growth);
//! - degradation to a fallback model after an empty or malformed answer;
//! - a fatal error only when the *last* attempt fails outright;
//! - a worker pool of `concurrency` permits for [`CompletionClient::complete_many`],
//!   whose results come back in submission order;
//! - start/finish progress events and a running token total;
//! - an optional, explicitly injected [`ResponseCache`].
//!
//! # Outcomes per prompt
//!
//! | Backend behaviour | Result |
//! |-------------------|--------|
//! | non-empty message on some attempt | `Ok(Completion::Text)` |
//! | only empty/malformed answers | `Ok(Completion::Degraded)` after `max_retries` attempts |
//! | request error on the last attempt | `Err(CompletionError::Fatal)` |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::CompletionError;
use crate::llm::{CompletionBackend, CompletionRequest};
use crate::progress::ProgressTracker;

/// Outcome of one prompt after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Text(String),
    /// Every attempt came back empty or malformed.
    Degraded,
}

impl Completion {
    /// The text, or `""` when degraded.
    pub fn text(&self) -> &str {
        match self {
            Completion::Text(t) => t,
            Completion::Degraded => "",
        }
    }

    pub fn into_text(self) -> String {
        match self {
            Completion::Text(t) => t,
            Completion::Degraded => String::new(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Completion::Degraded)
    }
}

/// Per-client request settings.
#[derive(Debug, Clone)]
pub struct CompletionSettings {
    pub model: String,
    pub fallback_model: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub concurrency: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
}

impl CompletionSettings {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            fallback_model: config.fallback_model.clone(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            concurrency: config.concurrency,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
        }
    }
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self::from_config(&LlmConfig::default())
    }
}

/// Prompt-level response cache keyed on SHA-256 of (model, prompt).
///
/// Only non-empty answers are stored. Share one instance between clients
/// by passing the same `Arc`.
#[derive(Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, String>>,
    hits: AtomicU64,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(model: &str, prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(prompt.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, model: &str, prompt: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let hit = entries.get(&Self::key(model, prompt)).cloned();
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn put(&self, model: &str, prompt: &str, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(Self::key(model, prompt), text.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Usage {
    total_tokens: AtomicU64,
    requests: AtomicU64,
}

/// Completion client for one pipeline run.
///
/// Cheap to clone; clones share the token total, the cache and the
/// progress tracker.
#[derive(Clone)]
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    settings: Arc<CompletionSettings>,
    cache: Option<Arc<ResponseCache>>,
    progress: Option<Arc<ProgressTracker>>,
    usage: Arc<Usage>,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn CompletionBackend>, settings: CompletionSettings) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
            cache: None,
            progress: None,
            usage: Arc::new(Usage::default()),
        }
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_progress(mut self, tracker: Arc<ProgressTracker>) -> Self {
        self.progress = Some(tracker);
        self
    }

    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }

    /// Tokens billed so far, summed over every response (empty ones included).
    pub fn total_tokens(&self) -> u64 {
        self.usage.total_tokens.load(Ordering::SeqCst)
    }

    /// Backend requests issued so far (cache hits excluded).
    pub fn requests_made(&self) -> u64 {
        self.usage.requests.load(Ordering::SeqCst)
    }

    /// Complete one prompt with retry and fallback. Fires one start and one
    /// finish progress event regardless of outcome.
    pub async fn complete(&self, prompt: &str) -> Result<Completion, CompletionError> {
        if let Some(tracker) = &self.progress {
            tracker.start();
        }
        let outcome = self.complete_with_retries(prompt).await;
        if let Some(tracker) = &self.progress {
            tracker.finish();
        }
        outcome
    }

    async fn complete_with_retries(&self, prompt: &str) -> Result<Completion, CompletionError> {
        let settings = &self.settings;

        if let Some(cache) = &self.cache {
            if let Some(text) = cache.get(&settings.model, prompt) {
                debug!(model = %settings.model, "completion served from cache");
                return Ok(Completion::Text(text));
            }
        }

        let mut model = settings.model.clone();

        for attempt in 0..settings.max_retries {
            let request = CompletionRequest::new(
                &model,
                &settings.system_prompt,
                prompt,
                settings.max_tokens,
                settings.temperature,
            );
            self.usage.requests.fetch_add(1, Ordering::SeqCst);

            match self.backend.complete(&request).await {
                Ok(response) => {
                    self.usage
                        .total_tokens
                        .fetch_add(response.total_tokens, Ordering::SeqCst);
                    if !response.message.trim().is_empty() {
                        if let Some(cache) = &self.cache {
                            cache.put(&settings.model, prompt, &response.message);
                        }
                        return Ok(Completion::Text(response.message));
                    }
                    warn!(
                        attempt = attempt + 1,
                        max_retries = settings.max_retries,
                        model = %model,
                        fallback = %settings.fallback_model,
                        "empty completion, degrading to fallback model"
                    );
                    model = settings.fallback_model.clone();
                }
                Err(CompletionError::Malformed(reason)) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = settings.max_retries,
                        model = %model,
                        %reason,
                        "malformed completion, degrading to fallback model"
                    );
                    model = settings.fallback_model.clone();
                }
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = settings.max_retries,
                        model = %model,
                        error = %err,
                        "completion request failed"
                    );
                    if attempt + 1 == settings.max_retries {
                        return Err(CompletionError::Fatal {
                            attempts: attempt + 1,
                            model,
                            source: Box::new(err),
                        });
                    }
                }
            }

            if attempt + 1 < settings.max_retries && !settings.retry_delay.is_zero() {
                tokio::time::sleep(settings.retry_delay).await;
            }
        }

        warn!(
            attempts = settings.max_retries,
            "no usable completion after all attempts, returning degraded result"
        );
        Ok(Completion::Degraded)
    }

    /// Complete every prompt on a pool of `concurrency` workers.
    ///
    /// Results are in the order of `prompts`. The first fatal error aborts
    /// the remaining work and is returned.
    pub async fn complete_many(
        &self,
        prompts: Vec<String>,
    ) -> Result<Vec<Completion>, CompletionError> {
        let n = prompts.len();
        if n == 0 {
            return Ok(Vec::new());
        }

        let sem = Arc::new(Semaphore::new(self.settings.concurrency.max(1)));
        let mut set = JoinSet::new();

        for (idx, prompt) in prompts.into_iter().enumerate() {
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| CompletionError::Request(format!("worker pool closed: {}", e)))?;
            let client = self.clone();
            set.spawn(async move {
                let _permit = permit;
                (idx, client.complete(&prompt).await)
            });
        }

        let mut slots: Vec<Option<Completion>> = vec![None; n];
        while let Some(joined) = set.join_next().await {
            let (idx, outcome) = joined.map_err(|e| {
                CompletionError::Request(format!("completion worker failed: {}", e))
            })?;
            match outcome {
                Ok(completion) => slots[idx] = Some(completion),
                Err(err) => {
                    set.abort_all();
                    return Err(err);
                }
            }
        }

        Ok(slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Completion::Degraded))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::CompletionResponse;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::sync::mpsc;

    type Script = dyn Fn(usize, &CompletionRequest) -> Result<CompletionResponse, CompletionError>
        + Send
        + Sync;

    /// Backend that answers from a script and records (model, prompt) per call.
    struct ScriptedBackend {
        script: Box<Script>,
        calls: Mutex<Vec<(String, String)>>,
        delay_for: Box<dyn Fn(&str) -> Duration + Send + Sync>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(
            script: impl Fn(usize, &CompletionRequest) -> Result<CompletionResponse, CompletionError>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            Self {
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
                delay_for: Box::new(|_| Duration::ZERO),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, f: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
            self.delay_for = Box::new(f);
            self
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, CompletionError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let call_no = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((request.model.clone(), request.prompt().to_string()));
                calls.len() - 1
            };
            let delay = (self.delay_for)(request.prompt());
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            (self.script)(call_no, request)
        }
    }

    fn ok(text: &str, tokens: u64) -> Result<CompletionResponse, CompletionError> {
        Ok(CompletionResponse {
            message: text.to_string(),
            total_tokens: tokens,
        })
    }

    fn settings(max_retries: u32) -> CompletionSettings {
        CompletionSettings {
            model: "primary".to_string(),
            fallback_model: "fallback".to_string(),
            max_retries,
            retry_delay: Duration::ZERO,
            concurrency: 2,
            ..CompletionSettings::default()
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let backend = Arc::new(ScriptedBackend::new(|_, _| ok("a summary", 40)));
        let client = CompletionClient::new(backend.clone(), settings(3));
        let out = client.complete("prompt").await.unwrap();
        assert_eq!(out, Completion::Text("a summary".to_string()));
        assert_eq!(client.total_tokens(), 40);
        assert_eq!(backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn empty_answers_degrade_after_exactly_max_retries() {
        let backend = Arc::new(ScriptedBackend::new(|_, _| ok("   ", 5)));
        let client = CompletionClient::new(backend.clone(), settings(3));
        let out = client.complete("prompt").await.unwrap();
        assert!(out.is_degraded());
        assert_eq!(out.text(), "");

        let models: Vec<String> = backend.calls().into_iter().map(|(m, _)| m).collect();
        assert_eq!(models, vec!["primary", "fallback", "fallback"]);
        // usage is recorded even for empty answers
        assert_eq!(client.total_tokens(), 15);
    }

    #[tokio::test]
    async fn hard_failure_propagates_only_after_last_attempt() {
        let backend = Arc::new(ScriptedBackend::new(|_, _| {
            Err(CompletionError::Request("503 unavailable".to_string()))
        }));
        let client = CompletionClient::new(backend.clone(), settings(3));
        let err = client.complete("prompt").await.unwrap_err();
        match err {
            CompletionError::Fatal {
                attempts, model, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(model, "primary");
            }
            other => panic!("expected fatal error, got {:?}", other),
        }
        assert_eq!(backend.calls().len(), 3);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let backend = Arc::new(ScriptedBackend::new(|n, _| {
            if n == 0 {
                Err(CompletionError::Request("timeout".to_string()))
            } else {
                ok("recovered", 9)
            }
        }));
        let client = CompletionClient::new(backend.clone(), settings(2));
        let out = client.complete("prompt").await.unwrap();
        assert_eq!(out.text(), "recovered");
        // request errors do not switch models
        let models: Vec<String> = backend.calls().into_iter().map(|(m, _)| m).collect();
        assert_eq!(models, vec!["primary", "primary"]);
    }

    #[tokio::test]
    async fn malformed_answer_switches_to_fallback() {
        let backend = Arc::new(ScriptedBackend::new(|n, _| {
            if n == 0 {
                Err(CompletionError::Malformed("bad json".to_string()))
            } else {
                ok("fine", 1)
            }
        }));
        let client = CompletionClient::new(backend.clone(), settings(2));
        assert_eq!(client.complete("p").await.unwrap().text(), "fine");
        assert_eq!(backend.calls()[1].0, "fallback");
    }

    #[tokio::test]
    async fn retry_delay_is_flat_between_attempts() {
        let backend = Arc::new(ScriptedBackend::new(|_, _| ok("", 0)));
        let mut s = settings(3);
        s.retry_delay = Duration::from_millis(30);
        let client = CompletionClient::new(backend, s);
        let started = Instant::now();
        client.complete("p").await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(60), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn complete_many_preserves_submission_order() {
        // later prompts finish first
        let backend = Arc::new(
            ScriptedBackend::new(|_, req| ok(&format!("summary of {}", req.prompt()), 1))
                .with_delay(|prompt| {
                    let idx: u64 = prompt.trim_start_matches("chunk-").parse().unwrap_or(0);
                    Duration::from_millis(40 - idx * 5)
                }),
        );
        let client = CompletionClient::new(backend.clone(), settings(2));
        let prompts: Vec<String> = (0..6).map(|i| format!("chunk-{}", i)).collect();
        let out = client.complete_many(prompts).await.unwrap();
        let texts: Vec<&str> = out.iter().map(|c| c.text()).collect();
        assert_eq!(
            texts,
            vec![
                "summary of chunk-0",
                "summary of chunk-1",
                "summary of chunk-2",
                "summary of chunk-3",
                "summary of chunk-4",
                "summary of chunk-5",
            ]
        );
        assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(client.total_tokens(), 6);
    }

    #[tokio::test]
    async fn complete_many_stops_on_fatal_error() {
        let backend = Arc::new(ScriptedBackend::new(|_, req| {
            if req.prompt() == "bad" {
                Err(CompletionError::Request("boom".to_string()))
            } else {
                ok("fine", 1)
            }
        }));
        let client = CompletionClient::new(backend, settings(1));
        let err = client
            .complete_many(vec!["good".to_string(), "bad".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Fatal { .. }));
    }

    #[tokio::test]
    async fn progress_fires_start_and_finish_per_prompt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(ProgressTracker::new(3, tx));
        let backend = Arc::new(ScriptedBackend::new(|_, _| ok("x", 1)));
        let client = CompletionClient::new(backend, settings(1)).with_progress(tracker.clone());
        client
            .complete_many(vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(tracker.snapshot(), (3, 3));
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 6);
    }

    #[tokio::test]
    async fn cache_hit_skips_backend() {
        let backend = Arc::new(ScriptedBackend::new(|_, _| ok("cached answer", 11)));
        let cache = Arc::new(ResponseCache::new());
        let client = CompletionClient::new(backend.clone(), settings(2)).with_cache(cache.clone());
        client.complete("same prompt").await.unwrap();
        let second = client.complete("same prompt").await.unwrap();
        assert_eq!(second.text(), "cached answer");
        assert_eq!(backend.calls().len(), 1);
        assert_eq!(client.total_tokens(), 11);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn degraded_answers_are_not_cached() {
        let backend = Arc::new(ScriptedBackend::new(|_, _| ok("", 0)));
        let cache = Arc::new(ResponseCache::new());
        let client = CompletionClient::new(backend.clone(), settings(1)).with_cache(cache.clone());
        client.complete("p").await.unwrap();
        client.complete("p").await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(backend.calls().len(), 2);
    }
}
