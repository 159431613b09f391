use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub classify: ClassifyConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub relations: RelationsConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    1000
}
fn default_overlap_tokens() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassifyConfig {
    /// Pages sampled when classifying a document.
    #[serde(default = "default_sample_pages")]
    pub sample_pages: usize,
    /// Minimum extracted characters for a page to count as digital.
    #[serde(default = "default_min_chars_per_page")]
    pub min_chars_per_page: usize,
    /// Fraction of non-digital sampled pages above which the document is
    /// classified as scanned.
    #[serde(default = "default_scanned_ratio")]
    pub scanned_ratio: f64,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            sample_pages: default_sample_pages(),
            min_chars_per_page: default_min_chars_per_page(),
            scanned_ratio: default_scanned_ratio(),
        }
    }
}

fn default_sample_pages() -> usize {
    5
}
fn default_min_chars_per_page() -> usize {
    200
}
fn default_scanned_ratio() -> f64 {
    0.8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Methods that must agree before a term becomes a concept.
    #[serde(default = "default_min_agreement")]
    pub min_agreement: usize,
    /// Chunks yielding fewer concepts than this are enriched via the
    /// completion service.
    #[serde(default = "default_min_concepts_per_chunk")]
    pub min_concepts_per_chunk: usize,
    /// Fixed pause between successive chunk submissions.
    #[serde(default = "default_inter_chunk_delay_ms")]
    pub inter_chunk_delay_ms: u64,
    /// Disable to skip completion-service enrichment entirely.
    #[serde(default = "default_true")]
    pub enrich: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_agreement: default_min_agreement(),
            min_concepts_per_chunk: default_min_concepts_per_chunk(),
            inter_chunk_delay_ms: default_inter_chunk_delay_ms(),
            enrich: true,
        }
    }
}

fn default_min_agreement() -> usize {
    2
}
fn default_min_concepts_per_chunk() -> usize {
    3
}
fn default_inter_chunk_delay_ms() -> u64 {
    250
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_neighbor_k")]
    pub neighbor_k: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            neighbor_k: default_neighbor_k(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.95
}
fn default_neighbor_k() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelationsConfig {
    /// Nearest neighbors per concept considered as relationship candidates.
    #[serde(default = "default_neighbor_k")]
    pub top_k: usize,
    /// Weight of embedding similarity in the final strength blend.
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,
}

impl Default for RelationsConfig {
    fn default() -> Self {
        Self {
            top_k: default_neighbor_k(),
            similarity_weight: default_similarity_weight(),
        }
    }
}

fn default_similarity_weight() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct BudgetConfig {
    #[serde(default = "default_calls_per_minute")]
    pub calls_per_minute: u32,
    #[serde(default = "default_calls_per_day")]
    pub calls_per_day: u32,
    /// Daily spend threshold that triggers the (non-fatal) budget alert.
    #[serde(default = "default_daily_budget_usd")]
    pub daily_budget_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: default_calls_per_minute(),
            calls_per_day: default_calls_per_day(),
            daily_budget_usd: default_daily_budget_usd(),
        }
    }
}

fn default_calls_per_minute() -> u32 {
    60
}
fn default_calls_per_day() -> u32 {
    5000
}
fn default_daily_budget_usd() -> f64 {
    10.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_max_attempts() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Wall-clock ceiling for one document run.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration_secs(),
            cache_ttl_days: default_cache_ttl_days(),
        }
    }
}

fn default_max_duration_secs() -> u64 {
    1800
}
fn default_cache_ttl_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServicesConfig {
    #[serde(default)]
    pub completion: EndpointConfig,
    #[serde(default)]
    pub embedding: EndpointConfig,
    #[serde(default)]
    pub ocr: EndpointConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndpointConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    if config.extraction.min_agreement == 0 || config.extraction.min_agreement > 3 {
        anyhow::bail!("extraction.min_agreement must be between 1 and 3");
    }

    if !(0.0..=1.0).contains(&config.dedup.similarity_threshold) {
        anyhow::bail!("dedup.similarity_threshold must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.relations.similarity_weight) {
        anyhow::bail!("relations.similarity_weight must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&config.classify.scanned_ratio) {
        anyhow::bail!("classify.scanned_ratio must be in [0.0, 1.0]");
    }

    if config.budget.calls_per_minute == 0 || config.budget.calls_per_day == 0 {
        anyhow::bail!("budget ceilings must be > 0");
    }

    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be > 0");
    }
    if config.retry.multiplier < 1.0 {
        anyhow::bail!("retry.multiplier must be >= 1.0");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dgx.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        (dir, path)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let (_dir, path) = write_config("[db]\npath = \"dgx.sqlite\"\n");
        let config = load_config(&path).unwrap();
        assert_eq!(config.chunking.max_tokens, 1000);
        assert_eq!(config.chunking.overlap_tokens, 200);
        assert_eq!(config.extraction.min_agreement, 2);
        assert_eq!(config.dedup.similarity_threshold, 0.95);
        assert_eq!(config.budget.calls_per_minute, 60);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.pipeline.cache_ttl_days, 30);
    }

    #[test]
    fn overlap_must_be_smaller_than_window() {
        let (_dir, path) = write_config(
            "[db]\npath = \"dgx.sqlite\"\n[chunking]\nmax_tokens = 100\noverlap_tokens = 100\n",
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn min_agreement_bounds_enforced() {
        let (_dir, path) = write_config(
            "[db]\npath = \"dgx.sqlite\"\n[extraction]\nmin_agreement = 4\n",
        );
        assert!(load_config(&path).is_err());
    }
}
