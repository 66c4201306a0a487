use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAP_PROMPT: &str = "Given the following support cases, return a summary of each case.
Include details on the category of the issue, the errors or symptoms the customer noticed,
and any basic details about what the customer was looking to accomplish.
If multiple cases exist in the same category, you can group them together.
The summary will be used to understand overall case trends and causes that the team can
use to prioritize fixes and improvements.

### Cases ###

{cases}";

pub const DEFAULT_REDUCE_PROMPT: &str = "Given the following set of summaries for support case reports,
distill it into a final, consolidated and detailed summary of trends and top pain points or blockers customers have been hitting.
Prioritize issue categories that show up in multiple summaries as they are likely to be the most impactful.
Include a description of the issue, the symptoms the customer noticed, what they were trying to do, and what led them to open the case.
Ideally provide the response in a list of 3 to 8 areas, each that has a paragraph or two of detail about the area or trend.

### Case Chunk Summaries ###

{summaries}";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. \
You are tasked to help summarize and detect trends based on the support cases provided. \
Only generate insights based on the content provided by the user.";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub summarize: SummarizeConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub separator_is_regex: bool,
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            separator: default_separator(),
            separator_is_regex: false,
            encoding: default_encoding(),
        }
    }
}

fn default_chunk_size() -> usize {
    20_000
}
fn default_chunk_overlap() -> usize {
    4_000
}
fn default_separator() -> String {
    "#####".to_string()
}
fn default_encoding() -> String {
    "cl100k_base".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_fallback_model")]
    pub fallback_model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub retry_delay_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            api_key_env: default_api_key_env(),
            model: default_model(),
            fallback_model: default_fallback_model(),
            max_retries: default_max_retries(),
            retry_delay_secs: 0,
            concurrency: default_concurrency(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            system_prompt: default_system_prompt(),
            cache: true,
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_model() -> String {
    "mistral-large".to_string()
}
fn default_fallback_model() -> String {
    "mixtral-8x7b".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_concurrency() -> usize {
    5
}
fn default_max_tokens() -> u32 {
    8000
}
fn default_temperature() -> f32 {
    0.7
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizeConfig {
    #[serde(default = "default_token_max")]
    pub token_max: usize,
    #[serde(default = "default_max_collapse_rounds")]
    pub max_collapse_rounds: usize,
    #[serde(default = "default_weeks_back")]
    pub weeks_back: u32,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_true")]
    pub publish_index: bool,
    #[serde(default = "default_map_prompt")]
    pub map_prompt: String,
    #[serde(default = "default_reduce_prompt")]
    pub reduce_prompt: String,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            token_max: default_token_max(),
            max_collapse_rounds: default_max_collapse_rounds(),
            weeks_back: default_weeks_back(),
            categories: Vec::new(),
            prefix: default_prefix(),
            publish_index: true,
            map_prompt: default_map_prompt(),
            reduce_prompt: default_reduce_prompt(),
        }
    }
}

fn default_token_max() -> usize {
    28_000
}
fn default_max_collapse_rounds() -> usize {
    5
}
fn default_weeks_back() -> u32 {
    12
}
fn default_prefix() -> String {
    "ALL".to_string()
}
fn default_map_prompt() -> String {
    DEFAULT_MAP_PROMPT.to_string()
}
fn default_reduce_prompt() -> String {
    DEFAULT_REDUCE_PROMPT.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_target_lag")]
    pub target_lag: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            target_lag: default_target_lag(),
        }
    }
}

fn default_target_lag() -> String {
    "1 day".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PricingConfig {
    #[serde(default = "default_credits_per_million")]
    pub credits_per_million_tokens: f64,
    #[serde(default = "default_usd_per_credit")]
    pub usd_per_credit: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            credits_per_million_tokens: default_credits_per_million(),
            usd_per_credit: default_usd_per_credit(),
        }
    }
}

fn default_credits_per_million() -> f64 {
    5.10
}
fn default_usd_per_credit() -> f64 {
    2.0
}

/// True when `name` is usable as an unquoted table-name component.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Config {
    /// Config with defaults for everything except the database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            chunking: ChunkingConfig::default(),
            llm: LlmConfig::default(),
            summarize: SummarizeConfig::default(),
            index: IndexConfig::default(),
            pricing: PricingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Validate chunking
        if self.chunking.chunk_size == 0 {
            anyhow::bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
        }
        if self.chunking.separator.is_empty() {
            anyhow::bail!("chunking.separator must not be empty");
        }
        if self.chunking.separator_is_regex {
            regex::Regex::new(&self.chunking.separator)
                .with_context(|| "chunking.separator is not a valid regular expression")?;
        }
        match self.chunking.encoding.as_str() {
            "cl100k_base" | "approx" => {}
            other => anyhow::bail!(
                "Unknown chunking.encoding: '{}'. Must be cl100k_base or approx.",
                other
            ),
        }

        // Validate llm
        if self.llm.max_retries == 0 {
            anyhow::bail!("llm.max_retries must be >= 1");
        }
        if !(1..=64).contains(&self.llm.concurrency) {
            anyhow::bail!("llm.concurrency must be in [1, 64]");
        }
        if self.llm.model.trim().is_empty() || self.llm.fallback_model.trim().is_empty() {
            anyhow::bail!("llm.model and llm.fallback_model must not be empty");
        }
        match self.llm.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }

        // Validate summarize
        if self.summarize.token_max == 0 {
            anyhow::bail!("summarize.token_max must be > 0");
        }
        if self.summarize.max_collapse_rounds == 0 {
            anyhow::bail!("summarize.max_collapse_rounds must be >= 1");
        }
        if !(1..=crate::pipeline::MAX_WEEKS_BACK).contains(&self.summarize.weeks_back) {
            anyhow::bail!(
                "summarize.weeks_back must be in [1, {}]",
                crate::pipeline::MAX_WEEKS_BACK
            );
        }
        if !is_valid_identifier(&self.summarize.prefix) {
            anyhow::bail!(
                "summarize.prefix '{}' must contain only ASCII letters, digits and '_'",
                self.summarize.prefix
            );
        }
        crate::store::check_prefix(&self.summarize.prefix)
            .with_context(|| "summarize.prefix is not usable")?;
        if !self.summarize.map_prompt.contains("{cases}") {
            anyhow::bail!("summarize.map_prompt must contain the {{cases}} placeholder");
        }
        if !self.summarize.reduce_prompt.contains("{summaries}") {
            anyhow::bail!("summarize.reduce_prompt must contain the {{summaries}} placeholder");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
