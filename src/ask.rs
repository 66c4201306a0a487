//! Retrieval-augmented answers over a published case index.
//!
//! `digest ask` searches an index for the question, hands the matching cases
//! to the completion model between `<context>` tags and prints the answer
//! followed by the cases it drew on. When earlier messages are supplied, the
//! question is first rewritten into a standalone search query.
//!
//! ```text
//! question ──▶ (rewrite with history) ──▶ index search ──▶ context prompt
//!          ──▶ one completion ──▶ answer + references
//! ```

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::completion::{Completion, CompletionClient, CompletionSettings};
use crate::config::Config;
use crate::llm::create_backend;
use crate::search::search_cases;
use crate::store::sqlite::SqliteStore;
use crate::store::{index_name, SearchHit, SearchIndexService};
use crate::summarize::render_prompt;

pub const DEFAULT_CONTEXT_CASES: i64 = 5;
pub const MAX_CONTEXT_CASES: i64 = 20;

/// Number of most recent history messages shown to the model.
pub const HISTORY_WINDOW: usize = 5;

pub const ANSWER_SYSTEM_PROMPT: &str =
    "You are a helpful AI chat assistant answering questions about support cases.";

pub const ANSWER_PROMPT: &str = "[INST]
You are a helpful AI chat assistant with RAG capabilities. When a user asks you a question,
you will also be given context provided between <context> and </context> tags. Use that context
with the user's chat history provided between <chat_history> and </chat_history> tags
to provide a summary that addresses the user's question. Ensure the answer is coherent, concise,
and directly relevant to the user's question.

If the user asks a generic question which cannot be answered with the given context or chat_history,
just say \"I don't know the answer to that question.\"

Don't say things like \"according to the provided context\".

<chat_history>
{chat_history}
</chat_history>
<context>
{context}
</context>
<question>
{question}
</question>
[/INST]
Answer:";

pub const CONDENSE_PROMPT: &str = "[INST]
Based on the chat history below and the question, generate a query that extends the question
with the chat history provided. The query should be in natural language.
Answer with only the query. Do not add any explanation.

<chat_history>
{chat_history}
</chat_history>
<question>
{question}
</question>
[/INST]";

/// A case the answer drew on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub case_id: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    /// Distinct cases in retrieval order.
    pub references: Vec<Reference>,
    /// The query the index was searched with.
    pub query: String,
}

/// Numbered context block for the answer prompt, plus one reference per
/// distinct case. Hits without indexed text are skipped.
pub fn build_context(hits: &[SearchHit]) -> (String, Vec<Reference>) {
    let mut context = String::new();
    let mut seen = HashSet::new();
    let mut references = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        if hit.text.trim().is_empty() {
            continue;
        }
        context.push_str(&format!("Context support case {}: {} \n\n", i + 1, hit.text));
        if seen.insert(hit.case_id.as_str()) {
            references.push(Reference {
                case_id: hit.case_id.clone(),
                title: hit.title.clone(),
            });
        }
    }
    (context, references)
}

/// Strip leading whitespace from every line. Models answering `[INST]`
/// prompts tend to indent their output.
pub fn strip_line_indent(text: &str) -> String {
    text.lines()
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

/// Answer text followed by its references, ready to print.
pub fn render_answer(answer: &Answer) -> String {
    let mut out = answer.text.clone();
    if !answer.references.is_empty() {
        out.push_str("\n\nReferences:");
        for r in &answer.references {
            out.push_str(&format!("\n  {} - {}", r.case_id, r.title));
        }
    }
    out
}

pub struct QuestionAnswerer {
    client: CompletionClient,
    index: Arc<dyn SearchIndexService>,
    index_name: String,
    limit: i64,
}

impl QuestionAnswerer {
    pub fn new(
        client: CompletionClient,
        index: Arc<dyn SearchIndexService>,
        index_name: impl Into<String>,
        limit: i64,
    ) -> Self {
        Self {
            client,
            index,
            index_name: index_name.into(),
            limit,
        }
    }

    /// Tokens billed so far across every call.
    pub fn total_tokens(&self) -> u64 {
        self.client.total_tokens()
    }

    /// Answer `question`. `history` holds earlier messages, oldest first;
    /// only the last [`HISTORY_WINDOW`] are used.
    ///
    /// # Errors
    ///
    /// Fails on an empty question, a missing index, a fatal completion error,
    /// or when the model gives no answer.
    pub async fn ask(&self, question: &str, history: &[String]) -> Result<Answer> {
        let question = question.trim();
        if question.is_empty() {
            bail!("question must not be empty");
        }

        let recent = &history[history.len().saturating_sub(HISTORY_WINDOW)..];
        let chat_history = recent.join("\n");
        let query = if recent.is_empty() {
            question.to_string()
        } else {
            let prompt = render_prompt(
                &render_prompt(CONDENSE_PROMPT, "question", question),
                "chat_history",
                &chat_history,
            );
            let rewritten = self.complete(&prompt).await?;
            debug!(query = %rewritten, "question rewritten from history");
            if rewritten.trim().is_empty() {
                question.to_string()
            } else {
                rewritten.trim().to_string()
            }
        };

        let hits = search_cases(self.index.as_ref(), &self.index_name, &query, self.limit).await?;
        let (context, references) = build_context(&hits);
        info!(
            index = %self.index_name,
            hits = hits.len(),
            cases = references.len(),
            "context retrieved"
        );

        let prompt = render_prompt(
            &render_prompt(
                &render_prompt(ANSWER_PROMPT, "question", question),
                "chat_history",
                &chat_history,
            ),
            "context",
            &context,
        );
        let text = self.complete(&prompt).await?;

        Ok(Answer {
            text,
            references,
            query,
        })
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        match self.client.complete(prompt).await? {
            Completion::Text(text) => Ok(strip_line_indent(&text)),
            Completion::Degraded => bail!("the model returned no answer"),
        }
    }
}

/// `digest ask`.
pub async fn run_ask(
    config: &Config,
    question: &str,
    index: Option<String>,
    limit: Option<i64>,
    model: Option<String>,
    history: Vec<String>,
) -> Result<()> {
    let limit = limit.unwrap_or(DEFAULT_CONTEXT_CASES);
    if !(1..=MAX_CONTEXT_CASES).contains(&limit) {
        bail!("--limit must be in [1, {}]", MAX_CONTEXT_CASES);
    }
    if !config.llm.is_enabled() {
        bail!("LLM provider is disabled. Set [llm] provider in config.");
    }

    let mut settings = CompletionSettings::from_config(&config.llm);
    settings.system_prompt = ANSWER_SYSTEM_PROMPT.to_string();
    if let Some(m) = model {
        if m.trim().is_empty() {
            bail!("--model must not be empty");
        }
        settings.model = m;
    }

    let store = Arc::new(SqliteStore::open(config).await?);
    let backend = create_backend(&config.llm)?;
    let index = index.unwrap_or_else(|| index_name(&config.summarize.prefix));
    let answerer = QuestionAnswerer::new(
        CompletionClient::new(backend, settings),
        store.clone(),
        index,
        limit,
    );

    let outcome = answerer.ask(question, &history).await;
    store.pool().close().await;
    let answer = outcome?;

    println!("{}", render_answer(&answer));
    info!(tokens = answerer.total_tokens(), "answer complete");
    Ok(())
}
