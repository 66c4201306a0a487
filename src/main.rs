//! # Case Digest CLI (`digest`)
//!
//! Loads support cases into SQLite, summarizes a time window of them with an
//! LLM map-reduce, and browses or searches the results.
//!
//! ## Usage
//!
//! ```bash
//! digest --config ./config/digest.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `digest init` | Create the SQLite database and schema |
//! | `digest load <file>` | Upsert cases from a JSONL file |
//! | `digest categories` | List case categories |
//! | `digest preview` | Show the cases a run would summarize |
//! | `digest process` | Summarize the window and store the result |
//! | `digest tables` | List summary tables |
//! | `digest show` | Print the newest summary |
//! | `digest search "<query>"` | Keyword search over a published index |
//! | `digest ask "<question>"` | Answer a question from the indexed cases |
//! | `digest completions <shell>` | Print shell completions |
//!
//! Logging goes to stderr through `tracing`; set `RUST_LOG` (default `info`).

use case_digest::config::{self, Config};
use case_digest::pipeline::{self, PipelineOptions};
use case_digest::progress::ProgressMode;
use case_digest::{ask, load, migrate, search, show};

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Case Digest: LLM trend summaries over support cases.
///
/// All commands except `completions` read a TOML configuration file given
/// by `--config`.
#[derive(Parser)]
#[command(
    name = "digest",
    about = "Case Digest: LLM trend summaries over support cases",
    version,
    long_about = "Case Digest selects a lookback window of support cases, splits them into \
    token-bounded chunks, summarizes each chunk with an LLM on a bounded worker pool, and \
    reduces the chunk summaries into one trend report stored in SQLite."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/digest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Overrides shared by `preview` and `process`.
#[derive(clap::Args, Clone, Default)]
struct WindowArgs {
    /// Lookback window in weeks, ending at the newest case.
    #[arg(long)]
    weeks: Option<u32>,

    /// Only these categories (comma-separated). Default: every category.
    #[arg(long, value_delimiter = ',')]
    categories: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it more than once is safe.
    Init,

    /// Upsert cases from a JSON Lines file.
    Load {
        /// Path to the `.jsonl` file.
        path: PathBuf,
    },

    /// List distinct case categories.
    Categories,

    /// Show the cases inside the lookback window.
    Preview {
        #[command(flatten)]
        window: WindowArgs,

        /// Maximum rows to print (capped at 1000).
        #[arg(long, default_value_t = 1000)]
        limit: usize,
    },

    /// Summarize the cases in the window and store the result.
    ///
    /// Prints elapsed time, total tokens and the estimated cost.
    Process {
        #[command(flatten)]
        window: WindowArgs,

        /// Number of concurrent LLM requests (1-64).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Primary model identifier.
        #[arg(long)]
        model: Option<String>,

        /// Output table prefix (`{PREFIX}_SUMMARIES`, `{PREFIX}_CASES`).
        #[arg(long)]
        prefix: Option<String>,

        /// Skip publishing the cases and rebuilding the search index.
        #[arg(long)]
        no_index: bool,

        /// Progress output on stderr. Default: human on a TTY, otherwise off.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// List summary tables.
    Tables,

    /// Print the newest summary of a table.
    Show {
        /// Summary table. Default: `{prefix}_SUMMARIES` from config.
        #[arg(long)]
        table: Option<String>,

        /// Also print every per-chunk summary.
        #[arg(long)]
        steps: bool,
    },

    /// Keyword search over a published case index.
    Search {
        /// The search query string.
        query: String,

        /// Index name. Default: `{prefix}_CORTEX_SEARCH` from config.
        #[arg(long)]
        index: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Answer a question with an LLM, using indexed cases as context.
    ///
    /// Prints the answer followed by the cases it drew on.
    Ask {
        /// The question.
        question: String,

        /// Index name. Default: `{prefix}_CORTEX_SEARCH` from config.
        #[arg(long)]
        index: Option<String>,

        /// Number of cases retrieved as context (1-20, default 5).
        #[arg(long)]
        limit: Option<i64>,

        /// Model identifier. Default: `llm.model` from config.
        #[arg(long)]
        model: Option<String>,

        /// Earlier conversation messages, oldest first. Repeatable; the
        /// question is rewritten from the last five before searching.
        #[arg(long = "history")]
        history: Vec<String>,
    },

    /// Print a shell completion script to stdout.
    Completions {
        shell: Shell,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

fn pipeline_options(cfg: &Config, window: WindowArgs) -> PipelineOptions {
    let mut options = PipelineOptions::from_config(cfg);
    if let Some(weeks) = window.weeks {
        options.weeks_back = weeks;
    }
    let categories: Vec<String> = window
        .categories
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if !categories.is_empty() {
        options.categories = categories;
    }
    options
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "digest", &mut std::io::stdout());
        return Ok(());
    }

    init_tracing();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Load { path } => {
            load::run_load(&cfg, &path).await?;
        }
        Commands::Categories => {
            pipeline::run_categories(&cfg).await?;
        }
        Commands::Preview { window, limit } => {
            let options = pipeline_options(&cfg, window);
            pipeline::run_preview(&cfg, &options, limit).await?;
        }
        Commands::Process {
            window,
            concurrency,
            model,
            prefix,
            no_index,
            progress,
        } => {
            let mut options = pipeline_options(&cfg, window);
            if let Some(c) = concurrency {
                options.concurrency = c;
            }
            if let Some(m) = model {
                options.model = m;
            }
            if let Some(p) = prefix {
                options.prefix = p;
            }
            if no_index {
                options.publish_index = false;
            }
            let mode = progress
                .map(ProgressMode::from)
                .unwrap_or_else(ProgressMode::default_for_tty);
            pipeline::run_process(&cfg, options, mode).await?;
        }
        Commands::Tables => {
            show::run_tables(&cfg).await?;
        }
        Commands::Show { table, steps } => {
            show::run_show(&cfg, table, steps).await?;
        }
        Commands::Search {
            query,
            index,
            limit,
        } => {
            search::run_search(&cfg, &query, index, limit).await?;
        }
        Commands::Ask {
            question,
            index,
            limit,
            model,
            history,
        } => {
            ask::run_ask(&cfg, &question, index, limit, model, history).await?;
        }
        Commands::Completions { .. } => {
            // Handled above (before config loading)
            unreachable!()
        }
    }

    Ok(())
}
