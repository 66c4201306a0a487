//! # Case Digest
//!
//! Turns a time-window of support cases into one LLM-written trend summary.
//!
//! Cases are selected from a SQLite case table, concatenated into a labelled
//! corpus, split into token-bounded chunks, summarized chunk by chunk on a
//! bounded worker pool, and reduced (collapsing as often as needed) into a
//! single summary. Each run appends its summary to a per-prefix table and can
//! publish the selected cases as a keyword search index.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ CaseStore   │──▶│  Chunker     │──▶│  Map-Reduce   │──▶│  SQLite   │
//! │ (SQLite)    │   │ cl100k_base │   │ retry+pool   │   │ summaries │
//! └─────────────┘   └─────────────┘   └──────┬───────┘   │ + FTS5    │
//!                                            │           └──────────┘
//!                                     progress events
//!                                            ▼
//!                                     ┌──────────┐
//!                                     │   CLI    │
//!                                     │ (digest) │
//!                                     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! digest init                        # create database
//! digest load cases.jsonl            # import cases
//! digest preview --weeks 4           # what a run would read
//! digest process --categories Auth   # summarize (needs [llm] provider)
//! digest show --steps                # newest summary + per-chunk summaries
//! digest search "login loop"         # query the published index
//! digest ask "why do logins loop?"   # answer from the indexed cases
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types |
//! | [`error`] | Typed errors for the summarization core |
//! | [`tokens`] | Token counting |
//! | [`chunk`] | Separator-aware, token-bounded chunking with overlap |
//! | [`llm`] | Chat-completion backends |
//! | [`completion`] | Retry, fallback, worker pool and response cache |
//! | [`summarize`] | Map-reduce summarization |
//! | [`progress`] | Progress events, background runs, renderers |
//! | [`pipeline`] | Case selection, summarization, persistence |
//! | [`store`] | Case store and search index service |
//! | [`load`] | JSONL case import |
//! | [`show`] | Browsing stored summaries |
//! | [`search`] | Keyword search over a published index |
//! | [`ask`] | Retrieval-augmented answers over a published index |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod ask;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod load;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod search;
pub mod show;
pub mod store;
pub mod summarize;
pub mod tokens;
