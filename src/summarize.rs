//! Map-reduce summarization over document chunks.
//!
//! # Phases
//!
//! ```text
//! Idle ──▶ Mapping ──▶ Reducing ──▶ Collapsing(round) ─┬─▶ Done
//!                                        ▲             │
//!                                        └─────────────┘  (while > 1 output)
//! ```
//!
//! 1. **Map**: one completion per chunk, rendered from the map prompt
//!    (`{cases}` placeholder). Runs on the client's worker pool; results
//!    keep chunk order and become the `intermediate_steps` of the run.
//! 2. **Reduce / collapse**: usable summaries are packed greedily into
//!    groups whose joined text stays within `token_max`. Each group is
//!    reduced with the reduce prompt (`{summaries}` placeholder). Rounds
//!    repeat until a single output remains.
//!
//! A chunk whose map call degraded keeps an empty slot in
//! `intermediate_steps` and is not fed to the reduce stage. A summary that
//! is too large to share a group with anything, and too large to fit alone,
//! passes through a round uncombined.
//!
//! Collapse is bounded by `max_collapse_rounds`. If the bound is hit, or a
//! round does not shrink the set, the remaining outputs are joined and the
//! run is flagged as not converged.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::completion::{Completion, CompletionClient};
use crate::config::SummarizeConfig;
use crate::error::SummarizeError;
use crate::models::{ChunkSummary, DocumentChunk, SummaryResult};
use crate::tokens::TokenCounter;

/// Delimiter between summaries inside one reduce prompt.
pub const GROUP_DELIMITER: &str = "\n\n";

/// Where a summarizer is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Mapping,
    Reducing,
    Collapsing(usize),
    Done,
}

#[derive(Debug, Clone)]
pub struct SummarizeSettings {
    pub token_max: usize,
    pub max_collapse_rounds: usize,
    pub map_prompt: String,
    pub reduce_prompt: String,
}

impl SummarizeSettings {
    pub fn from_config(config: &SummarizeConfig) -> Self {
        Self {
            token_max: config.token_max,
            max_collapse_rounds: config.max_collapse_rounds.max(1),
            map_prompt: config.map_prompt.clone(),
            reduce_prompt: config.reduce_prompt.clone(),
        }
    }
}

impl Default for SummarizeSettings {
    fn default() -> Self {
        Self::from_config(&SummarizeConfig::default())
    }
}

/// Substitute `value` for every `{placeholder}` in `template`.
pub fn render_prompt(template: &str, placeholder: &str, value: &str) -> String {
    template.replace(&format!("{{{}}}", placeholder), value)
}

/// Result of a map-reduce run before it is stamped and persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapReduceOutput {
    pub output_text: String,
    /// One entry per chunk, in chunk order. Empty for degraded map calls.
    pub intermediate_steps: Vec<String>,
    pub collapse_rounds: usize,
    /// False when the final text was assembled without a single last reduce.
    pub converged: bool,
}

impl MapReduceOutput {
    pub fn into_result(self) -> SummaryResult {
        SummaryResult::new(self.output_text, self.intermediate_steps)
    }
}

/// Greedily pack `items` into groups whose joined token count stays within
/// `token_max`. Order is preserved. A group always holds at least one item,
/// so an item larger than `token_max` ends up alone.
pub fn partition_groups(
    items: &[String],
    counter: &dyn TokenCounter,
    token_max: usize,
) -> Vec<Vec<String>> {
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for item in items {
        if !current.is_empty() {
            let mut candidate = current.join(GROUP_DELIMITER);
            candidate.push_str(GROUP_DELIMITER);
            candidate.push_str(item);
            if counter.count(&candidate) > token_max {
                groups.push(std::mem::take(&mut current));
            }
        }
        current.push(item.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

pub struct MapReduceSummarizer {
    client: CompletionClient,
    counter: Arc<dyn TokenCounter>,
    settings: SummarizeSettings,
    phase: Mutex<Phase>,
}

impl MapReduceSummarizer {
    pub fn new(
        client: CompletionClient,
        counter: Arc<dyn TokenCounter>,
        settings: SummarizeSettings,
    ) -> Self {
        Self {
            client,
            counter,
            settings,
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn client(&self) -> &CompletionClient {
        &self.client
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn enter(&self, phase: Phase) {
        debug!(?phase, "summarizer phase");
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    /// Summarize `chunks` into one text.
    ///
    /// # Errors
    ///
    /// [`SummarizeError::EmptyCorpus`] when `chunks` is empty (no calls are
    /// made), or the first fatal completion error.
    pub async fn summarize(
        &self,
        chunks: &[DocumentChunk],
    ) -> Result<MapReduceOutput, SummarizeError> {
        if chunks.is_empty() {
            return Err(SummarizeError::EmptyCorpus);
        }

        self.enter(Phase::Mapping);
        let summaries = self.map(chunks).await?;
        let intermediate_steps: Vec<String> =
            summaries.iter().map(|s| s.text.clone()).collect();

        let usable: Vec<String> = summaries
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| s.text)
            .collect();

        if usable.is_empty() {
            warn!(
                chunks = chunks.len(),
                "every map call degraded; final summary is empty"
            );
            self.enter(Phase::Done);
            return Ok(MapReduceOutput {
                output_text: String::new(),
                intermediate_steps,
                collapse_rounds: 0,
                converged: false,
            });
        }

        self.enter(Phase::Reducing);
        let (output_text, collapse_rounds, converged) = self.collapse(usable).await?;
        self.enter(Phase::Done);

        info!(
            chunks = chunks.len(),
            rounds = collapse_rounds,
            converged,
            "map-reduce finished"
        );

        Ok(MapReduceOutput {
            output_text,
            intermediate_steps,
            collapse_rounds,
            converged,
        })
    }

    async fn map(&self, chunks: &[DocumentChunk]) -> Result<Vec<ChunkSummary>, SummarizeError> {
        let prompts: Vec<String> = chunks
            .iter()
            .map(|c| render_prompt(&self.settings.map_prompt, "cases", &c.text))
            .collect();

        let completions = self.client.complete_many(prompts).await?;

        Ok(chunks
            .iter()
            .zip(completions)
            .map(|(chunk, completion)| {
                if completion.is_degraded() {
                    warn!(chunk = chunk.index, "map call degraded; slot left empty");
                }
                ChunkSummary {
                    chunk_index: chunk.index,
                    text: completion.into_text(),
                }
            })
            .collect())
    }

    /// Reduce rounds until one output remains. Returns the final text, the
    /// number of rounds run and whether a single reduce produced it.
    async fn collapse(
        &self,
        mut current: Vec<String>,
    ) -> Result<(String, usize, bool), SummarizeError> {
        let token_max = self.settings.token_max;
        let mut rounds = 0;

        loop {
            rounds += 1;
            if rounds > 1 {
                self.enter(Phase::Collapsing(rounds));
            }

            let groups = partition_groups(&current, self.counter.as_ref(), token_max);

            // None = reduce this group; Some(text) = pass through uncombined
            let mut slots: Vec<Option<String>> = Vec::with_capacity(groups.len());
            let mut prompts = Vec::new();
            for group in &groups {
                if group.len() == 1 && self.counter.count(&group[0]) > token_max {
                    warn!(
                        tokens = self.counter.count(&group[0]),
                        token_max, "summary exceeds token_max; passing through uncombined"
                    );
                    slots.push(Some(group[0].clone()));
                } else {
                    prompts.push(render_prompt(
                        &self.settings.reduce_prompt,
                        "summaries",
                        &group.join(GROUP_DELIMITER),
                    ));
                    slots.push(None);
                }
            }

            debug!(
                round = rounds,
                inputs = current.len(),
                groups = groups.len(),
                calls = prompts.len(),
                "reduce round"
            );

            let mut reduced = self.client.complete_many(prompts).await?.into_iter();
            let mut next: Vec<(String, bool)> = Vec::with_capacity(slots.len());
            for slot in slots {
                match slot {
                    Some(text) => next.push((text, false)),
                    None => match reduced.next() {
                        Some(Completion::Text(text)) => next.push((text, true)),
                        Some(Completion::Degraded) | None => {
                            warn!(round = rounds, "reduce call degraded; group dropped");
                        }
                    },
                }
            }

            if next.is_empty() {
                warn!(round = rounds, "every reduce call degraded; final summary is empty");
                return Ok((String::new(), rounds, false));
            }

            if next.len() == 1 {
                let (text, was_reduced) = next.remove(0);
                if !was_reduced {
                    warn!("final summary was never reduced");
                }
                return Ok((text, rounds, was_reduced));
            }

            if rounds >= self.settings.max_collapse_rounds || next.len() >= current.len() {
                warn!(
                    rounds,
                    remaining = next.len(),
                    "collapse did not converge; joining remaining summaries"
                );
                let texts: Vec<String> = next.into_iter().map(|(t, _)| t).collect();
                return Ok((texts.join(GROUP_DELIMITER), rounds, false));
            }

            current = next.into_iter().map(|(t, _)| t).collect();
        }
    }
}
