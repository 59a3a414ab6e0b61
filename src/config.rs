use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::resilient::{RateLimit, RetryPolicy};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Absent means jobs are processed without a payment gate.
    #[serde(default)]
    pub payment: Option<PaymentConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            max_chars: default_max_chars(),
        }
    }
}

fn default_min_chars() -> usize {
    100
}
fn default_max_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f32,
    /// Candidates per chunk quoted in the analysis prompt.
    #[serde(default = "default_prompt_candidates")]
    pub prompt_candidates: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: default_min_score(),
            prompt_candidates: default_prompt_candidates(),
        }
    }
}

fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.5
}
fn default_prompt_candidates() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            api_base: default_openai_base(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "openai".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    100
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_long_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_chat_provider(),
            model: default_chat_model(),
            temperature: default_temperature(),
            timeout_secs: default_long_timeout_secs(),
            api_base: default_openai_base(),
        }
    }
}

fn default_chat_provider() -> String {
    "openai".to_string()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_temperature() -> f32 {
    0.3
}
fn default_long_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_provider")]
    pub provider: String,
    #[serde(default = "default_ocr_model")]
    pub model: String,
    #[serde(default = "default_long_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_mistral_base")]
    pub api_base: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_ocr_provider(),
            model: default_ocr_model(),
            timeout_secs: default_long_timeout_secs(),
            api_base: default_mistral_base(),
        }
    }
}

fn default_ocr_provider() -> String {
    "mistral".to_string()
}
fn default_ocr_model() -> String {
    "mistral-ocr-latest".to_string()
}
fn default_mistral_base() -> String {
    "https://api.mistral.ai/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Refuse instead of waiting when the local rate window is full.
    #[serde(default)]
    pub fail_fast: bool,
    /// Per rate-key overrides, merged over [`default_rate_limits`].
    #[serde(default)]
    pub limits: HashMap<String, RateLimitConfig>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            fail_fast: false,
            limits: HashMap::new(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RateLimitConfig {
    pub rpm: u32,
    pub tpm: u64,
}

impl ResilienceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    /// Built-in limits with the configured overrides applied.
    pub fn rate_limits(&self) -> HashMap<String, RateLimit> {
        let mut limits = default_rate_limits();
        for (key, l) in &self.limits {
            limits.insert(
                key.clone(),
                RateLimit {
                    requests_per_minute: l.rpm,
                    cost_per_minute: l.tpm,
                },
            );
        }
        limits
    }
}

/// Published per-minute ceilings for the models the pipeline talks to.
pub fn default_rate_limits() -> HashMap<String, RateLimit> {
    let table: [(&str, u32, u64); 8] = [
        ("gpt-4o", 5_000, 10_000_000),
        ("gpt-4o-mini", 5_000, 10_000_000),
        ("gpt-4", 500, 10_000),
        ("gpt-3.5-turbo", 5_000, 1_000_000),
        ("text-embedding-3-small", 5_000, 1_000_000),
        ("text-embedding-3-large", 5_000, 1_000_000),
        ("text-embedding-ada-002", 5_000, 1_000_000),
        ("mistral-ocr-latest", 50, 1_000_000),
    ];
    table
        .iter()
        .map(|(key, rpm, tpm)| {
            (
                key.to_string(),
                RateLimit {
                    requests_per_minute: *rpm,
                    cost_per_minute: *tpm,
                },
            )
        })
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PaymentConfig {
    pub service_url: String,
    pub agent_identifier: String,
    #[serde(default)]
    pub seller_vkey: Option<String>,
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default)]
    pub amount: Option<u64>,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_network() -> String {
    "Preprod".to_string()
}
fn default_unit() -> String {
    "lovelace".to_string()
}
fn default_poll_interval_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// Network name reported by `/availability`.
    pub fn network(&self) -> &str {
        self.payment
            .as_ref()
            .map(|p| p.network.as_str())
            .unwrap_or("Preprod")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.min_chars >= config.chunking.max_chars {
        bail!("chunking.min_chars must be < chunking.max_chars");
    }

    // Retrieval
    if config.retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.min_score) {
        bail!("retrieval.min_score must be in [-1.0, 1.0]");
    }

    // Resilience
    if config.resilience.max_attempts < 1 {
        bail!("resilience.max_attempts must be >= 1");
    }
    if config.resilience.initial_delay_ms > config.resilience.max_delay_ms {
        bail!("resilience.initial_delay_ms must be <= resilience.max_delay_ms");
    }

    // Providers
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }
    match config.chat.provider.as_str() {
        "disabled" | "openai" => {}
        other => bail!("Unknown chat provider: '{}'. Must be disabled or openai.", other),
    }
    match config.ocr.provider.as_str() {
        "mistral" | "local" => {}
        other => bail!("Unknown ocr provider: '{}'. Must be mistral or local.", other),
    }

    if let Some(payment) = &config.payment {
        if payment.service_url.trim().is_empty() {
            bail!("payment.service_url must not be empty");
        }
        if payment.agent_identifier.trim().is_empty() {
            bail!("payment.agent_identifier must not be empty");
        }
        if payment.poll_interval_secs == 0 {
            bail!("payment.poll_interval_secs must be > 0");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/clause.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.min_chars, 100);
        assert_eq!(config.chunking.max_chars, 2000);
        assert_eq!(config.retrieval.top_k, 5);
        assert!((config.retrieval.min_score - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.embedding.model, "text-embedding-3-small");
        assert_eq!(config.chat.model, "gpt-4o-mini");
        assert_eq!(config.resilience.max_attempts, 5);
        assert!(config.payment.is_none());
        assert_eq!(config.network(), "Preprod");
    }

    #[test]
    fn test_rejects_inverted_chunk_bounds() {
        let err = parse("[db]\npath = \"x\"\n[chunking]\nmin_chars = 500\nmax_chars = 400\n")
            .unwrap_err();
        assert!(err.to_string().contains("min_chars"));
    }

    #[test]
    fn test_rejects_unknown_ocr_provider() {
        let err = parse("[db]\npath = \"x\"\n[ocr]\nprovider = \"tesseract\"\n").unwrap_err();
        assert!(err.to_string().contains("tesseract"));
    }

    #[test]
    fn test_rate_limit_overrides_merge() {
        let config = parse(
            "[db]\npath = \"x\"\n[resilience.limits.\"gpt-4o-mini\"]\nrpm = 10\ntpm = 2000\n",
        )
        .unwrap();
        let limits = config.resilience.rate_limits();
        assert_eq!(limits["gpt-4o-mini"].requests_per_minute, 10);
        assert_eq!(limits["gpt-4o-mini"].cost_per_minute, 2000);
        // Untouched defaults survive.
        assert_eq!(limits["text-embedding-3-small"].requests_per_minute, 5000);
    }

    #[test]
    fn test_payment_section() {
        let config = parse(
            "[db]\npath = \"x\"\n[payment]\nservice_url = \"http://localhost:3001/api/v1\"\nagent_identifier = \"agent-1\"\nnetwork = \"Mainnet\"\n",
        )
        .unwrap();
        let payment = config.payment.as_ref().unwrap();
        assert_eq!(payment.unit, "lovelace");
        assert_eq!(payment.poll_interval_secs, 10);
        assert_eq!(config.network(), "Mainnet");
    }
}
