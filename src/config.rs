//! TOML configuration.
//!
//! Only `[db]` is required; every other section falls back to defaults.
//! The parsed [`Config`] is handed to the engine as an `Arc<Config>` and
//! never stored in a global.
//!
//! ```toml
//! [db]
//! path = "./data/helios.sqlite"
//!
//! [escalation]
//! high_threshold = 0.75
//! low_threshold = 0.40
//!
//! [embedding]
//! provider = "hash"
//! dims = 256
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub composer: ComposerConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// A config with every section at its default, for tests and embedding.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            redaction: RedactionConfig::default(),
            retrieval: RetrievalConfig::default(),
            composer: ComposerConfig::default(),
            escalation: EscalationConfig::default(),
            pipeline: PipelineConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            audit: AuditConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedactionConfig {
    #[serde(default = "default_mask_char")]
    pub mask_char: char,
    #[serde(default = "default_max_pattern_len")]
    pub max_pattern_len: usize,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            mask_char: default_mask_char(),
            max_pattern_len: default_max_pattern_len(),
        }
    }
}

fn default_mask_char() -> char {
    '*'
}
fn default_max_pattern_len() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub min_score: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: 0.0,
        }
    }
}

fn default_top_k() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ComposerConfig {
    #[serde(default = "default_citation_min_score")]
    pub citation_min_score: f64,
    #[serde(default = "default_max_citations")]
    pub max_citations: usize,
    #[serde(default = "default_excerpt_chars")]
    pub excerpt_chars: usize,
    #[serde(default = "default_intent_weight")]
    pub intent_weight: f64,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            citation_min_score: default_citation_min_score(),
            max_citations: default_max_citations(),
            excerpt_chars: default_excerpt_chars(),
            intent_weight: default_intent_weight(),
        }
    }
}

fn default_citation_min_score() -> f64 {
    0.3
}
fn default_max_citations() -> usize {
    3
}
fn default_excerpt_chars() -> usize {
    280
}
fn default_intent_weight() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EscalationConfig {
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f64,
    #[serde(default = "default_max_uncertain_turns")]
    pub max_uncertain_turns: u32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            high_threshold: default_high_threshold(),
            low_threshold: default_low_threshold(),
            max_uncertain_turns: default_max_uncertain_turns(),
        }
    }
}

fn default_high_threshold() -> f64 {
    0.75
}
fn default_low_threshold() -> f64 {
    0.4
}
fn default_max_uncertain_turns() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_stage_timeout_ms")]
    pub validate_timeout_ms: u64,
    #[serde(default = "default_stage_timeout_ms")]
    pub redaction_timeout_ms: u64,
    #[serde(default = "default_retrieval_timeout_ms")]
    pub retrieval_timeout_ms: u64,
    #[serde(default = "default_stage_timeout_ms")]
    pub compose_timeout_ms: u64,
    #[serde(default = "default_stage_timeout_ms")]
    pub decide_timeout_ms: u64,
    #[serde(default = "default_stage_timeout_ms")]
    pub persist_timeout_ms: u64,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            validate_timeout_ms: default_stage_timeout_ms(),
            redaction_timeout_ms: default_stage_timeout_ms(),
            retrieval_timeout_ms: default_retrieval_timeout_ms(),
            compose_timeout_ms: default_stage_timeout_ms(),
            decide_timeout_ms: default_stage_timeout_ms(),
            persist_timeout_ms: default_stage_timeout_ms(),
            max_message_chars: default_max_message_chars(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    /// Every stage budget with its config key, in pipeline order.
    pub fn stage_budgets(&self) -> [(&'static str, u64); 6] {
        [
            ("validate_timeout_ms", self.validate_timeout_ms),
            ("redaction_timeout_ms", self.redaction_timeout_ms),
            ("retrieval_timeout_ms", self.retrieval_timeout_ms),
            ("compose_timeout_ms", self.compose_timeout_ms),
            ("decide_timeout_ms", self.decide_timeout_ms),
            ("persist_timeout_ms", self.persist_timeout_ms),
        ]
    }
}

fn default_stage_timeout_ms() -> u64 {
    2_000
}
fn default_retrieval_timeout_ms() -> u64 {
    10_000
}
fn default_max_message_chars() -> usize {
    4_000
}
fn default_idle_timeout_secs() -> u64 {
    1_800
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuditConfig {
    /// Environment variable holding the HMAC key for the audit chain.
    #[serde(default = "default_signing_key_env")]
    pub signing_key_env: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            signing_key_env: default_signing_key_env(),
        }
    }
}

fn default_signing_key_env() -> String {
    "HELIOS_AUDIT_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// How often the server sweeps idle sessions; `0` disables the sweeper.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}
fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `"pretty"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check cross-field constraints that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    let mask = config.redaction.mask_char;
    if mask.is_alphanumeric() || mask.is_whitespace() {
        anyhow::bail!("redaction.mask_char must be a symbol, got '{}'", mask);
    }

    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }

    for (key, budget) in config.pipeline.stage_budgets() {
        if budget == 0 {
            anyhow::bail!("pipeline.{} must be >= 1", key);
        }
    }

    let esc = &config.escalation;
    for (name, value) in [("high_threshold", esc.high_threshold), ("low_threshold", esc.low_threshold)] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("escalation.{} must be in [0.0, 1.0]", name);
        }
    }
    if esc.low_threshold > esc.high_threshold {
        anyhow::bail!("escalation.low_threshold must not exceed escalation.high_threshold");
    }

    if !(0.0..=1.0).contains(&config.composer.intent_weight) {
        anyhow::bail!("composer.intent_weight must be in [0.0, 1.0]");
    }
    if config.composer.max_citations == 0 {
        anyhow::bail!("composer.max_citations must be >= 1");
    }

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.embedding.is_enabled()
        && (config.embedding.dims.is_none() || config.embedding.dims == Some(0))
    {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, or ollama.",
            other
        ),
    }

    match config.logging.format.as_str() {
        "pretty" | "json" => {}
        other => anyhow::bail!("logging.format must be pretty or json, got '{}'", other),
    }

    Ok(())
}
