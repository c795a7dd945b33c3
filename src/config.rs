use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub raster: RasterConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory for the database and per-document crop directories.
    pub root: PathBuf,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.root.join("tablelens.db"))
    }

    pub fn document_dir(&self, document_id: &str) -> PathBuf {
        self.root.join("documents").join(document_id)
    }

    pub fn crops_dir(&self, document_id: &str) -> PathBuf {
        self.document_dir(document_id).join("crops")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RasterConfig {
    #[serde(default = "default_zoom")]
    pub zoom: f32,
}

impl Default for RasterConfig {
    fn default() -> Self {
        Self {
            zoom: default_zoom(),
        }
    }
}

fn default_zoom() -> f32 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Base URL of the table-detection inference service.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default = "default_detection_retries")]
    pub max_retries: u32,
    #[serde(default = "default_detection_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: String::new(),
            confidence_threshold: default_confidence_threshold(),
            iou_threshold: default_iou_threshold(),
            max_retries: default_detection_retries(),
            timeout_secs: default_detection_timeout_secs(),
        }
    }
}

fn default_confidence_threshold() -> f32 {
    0.5
}
fn default_iou_threshold() -> f32 {
    0.5
}
fn default_detection_retries() -> u32 {
    2
}
fn default_detection_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_summarizer_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_chat_model(),
            pool_size: default_pool_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_summarizer_timeout_secs(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_pool_size() -> usize {
    6
}
fn default_summarizer_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embedding_timeout_secs(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    1536
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_synthesis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_chat_model(),
            max_retries: default_max_retries(),
            timeout_secs: default_synthesis_timeout_secs(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_synthesis_timeout_secs() -> u64 {
    60
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_chat_model() -> String {
    "openai/gpt-4o-mini".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

fn default_top_k() -> i64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    /// Also index the PDF's digital text layer as overlapping chunks.
    #[serde(default = "default_include_page_text")]
    pub include_page_text: bool,
    #[serde(default = "default_chunk_tokens")]
    pub chunk_tokens: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            include_page_text: default_include_page_text(),
            chunk_tokens: default_chunk_tokens(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_include_page_text() -> bool {
    true
}
fn default_chunk_tokens() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IngestConfig {
    /// Overall ingestion deadline in seconds; unset means no deadline.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
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

impl DetectionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl SummarizerConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl SynthesisConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Validate raster
    if !(config.raster.zoom > 0.0) || !config.raster.zoom.is_finite() {
        anyhow::bail!("raster.zoom must be a positive number");
    }

    // Validate detection
    if !(0.0..=1.0).contains(&config.detection.confidence_threshold) {
        anyhow::bail!("detection.confidence_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.detection.iou_threshold) {
        anyhow::bail!("detection.iou_threshold must be in [0.0, 1.0]");
    }
    if config.detection.is_enabled() && config.detection.endpoint.is_empty() {
        anyhow::bail!(
            "detection.endpoint must be set when provider is '{}'",
            config.detection.provider
        );
    }

    // Validate summarizer
    if config.summarizer.pool_size == 0 || config.summarizer.pool_size > 8 {
        anyhow::bail!("summarizer.pool_size must be between 1 and 8");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    // Validate retrieval
    if !(1..=10).contains(&config.retrieval.top_k) {
        anyhow::bail!("retrieval.top_k must be between 1 and 10");
    }

    // Validate indexing
    if config.indexing.chunk_tokens == 0 {
        anyhow::bail!("indexing.chunk_tokens must be > 0");
    }
    if config.indexing.chunk_overlap >= config.indexing.chunk_tokens {
        anyhow::bail!("indexing.chunk_overlap must be smaller than indexing.chunk_tokens");
    }

    match config.detection.provider.as_str() {
        "disabled" | "http" => {}
        other => anyhow::bail!(
            "Unknown detection provider: '{}'. Must be disabled or http.",
            other
        ),
    }
    for (section, provider) in [
        ("summarizer", config.summarizer.provider.as_str()),
        ("embedding", config.embedding.provider.as_str()),
        ("synthesis", config.synthesis.provider.as_str()),
    ] {
        match provider {
            "disabled" | "openrouter" => {}
            other => anyhow::bail!(
                "Unknown {} provider: '{}'. Must be disabled or openrouter.",
                section,
                other
            ),
        }
    }

    Ok(())
}
