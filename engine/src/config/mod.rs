//! Configuration management
//!
//! This module handles loading, validation, and management of the
//! Waypoint configuration. Configuration is stored in TOML format at
//! ~/.waypoint/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **vision**: Vision-language collaborator (Perception)
//! - **llm**: Chat collaborators (Hypothesis, holistic reasoning)
//! - **retrieval**: Embedding-based geographic retrieval endpoint
//! - **geo**: Geocoding and POI search services
//! - **agent**: Pipeline thresholds, iteration budget, evidence weights
//!
//! API keys are never stored in the file; each provider section names
//! the environment variable that carries its key.
//!
//! # Path Expansion
//!
//! The configuration system expands `~` to the user's home directory
//! and creates the data directory if it doesn't exist.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use sdk::errors::GeoError;

/// Main configuration structure
///
/// Represents the complete Waypoint configuration loaded from
/// ~/.waypoint/config.toml. Every section has full defaults, so an
/// empty file is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Vision-language collaborator settings
    #[serde(default)]
    pub vision: VisionConfig,

    /// Chat collaborator settings
    #[serde(default)]
    pub llm: LlmConfig,

    /// Embedding retrieval settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Geocoding / POI service settings
    #[serde(default)]
    pub geo: GeoConfig,

    /// Pipeline control settings
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

/// Vision-language collaborator configuration (Perception stage).
///
/// Any OpenAI-compatible multimodal chat endpoint works here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_vision_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_vision_model(),
            api_key_env: default_openai_key_env(),
            timeout_secs: default_model_timeout(),
        }
    }
}

/// Chat collaborator configuration (Hypothesis + holistic reasoning)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Default chat provider (openai, anthropic, ollama)
    #[serde(default = "default_llm_provider")]
    pub default_provider: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,

    /// OpenAI-compatible provider settings
    #[serde(default)]
    pub openai: OpenAiConfig,

    /// Anthropic provider settings
    #[serde(default)]
    pub anthropic: AnthropicConfig,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_provider: default_llm_provider(),
            timeout_secs: default_model_timeout(),
            openai: OpenAiConfig::default(),
            anthropic: AnthropicConfig::default(),
            ollama: OllamaConfig::default(),
        }
    }
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// Base URL for the API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key_env: default_openai_key_env(),
        }
    }
}

/// Anthropic provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    /// Base URL for the Anthropic API
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_anthropic_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_anthropic_key_env")]
    pub api_key_env: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: default_anthropic_base_url(),
            model: default_anthropic_model(),
            api_key_env: default_anthropic_key_env(),
        }
    }
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for the Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

/// Embedding retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Base URL of the geo-embedding inference endpoint; empty
    /// disables the embedding path (symbolic-only retrieval)
    #[serde(default)]
    pub endpoint: String,

    /// Top-K coordinate cells to retrieve
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Also retrieve at coarser (region-level) granularity and union
    #[serde(default)]
    pub multi_scale: bool,

    /// Per-call timeout in seconds
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,

    /// Time-to-live for cached retrieval results, in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            top_k: default_top_k(),
            multi_scale: false,
            timeout_secs: default_service_timeout(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

/// Geocoding / POI service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    /// Nominatim-compatible geocoding endpoint
    #[serde(default = "default_nominatim_url")]
    pub nominatim_url: String,

    /// Overpass-compatible POI endpoint
    #[serde(default = "default_overpass_url")]
    pub overpass_url: String,

    /// User-Agent header (Nominatim usage policy requires one)
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            nominatim_url: default_nominatim_url(),
            overpass_url: default_overpass_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_service_timeout(),
        }
    }
}

/// Pipeline control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Fused-score threshold that terminates iteration
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Maximum Hypothesis→Verification iterations per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Candidates closer than this are merged
    #[serde(default = "default_dedup_radius")]
    pub dedup_radius_m: f64,

    /// Minimum fused score for a candidate to appear in alternatives
    #[serde(default = "default_min_alternative_score")]
    pub min_alternative_score: f64,

    /// Run-level deadline, checked at stage boundaries
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    /// Ask the chat collaborator for the final reasoning text
    #[serde(default = "default_true")]
    pub holistic_reasoning: bool,

    /// Run the (slower) topology check against POI layout
    #[serde(default)]
    pub topology_check: bool,

    /// Concurrent runs in batch mode
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: usize,

    /// Evidence weight: clue text vs place names
    #[serde(default = "default_text_match_weight")]
    pub text_match_weight: f64,

    /// Evidence weight: language/script region prior
    #[serde(default = "default_language_prior_weight")]
    pub language_prior_weight: f64,

    /// Evidence weight: road/POI topology
    #[serde(default = "default_topology_weight")]
    pub topology_weight: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_iterations: default_max_iterations(),
            dedup_radius_m: default_dedup_radius(),
            min_alternative_score: default_min_alternative_score(),
            run_timeout_secs: default_run_timeout(),
            holistic_reasoning: true,
            topology_check: false,
            batch_concurrency: default_batch_concurrency(),
            text_match_weight: default_text_match_weight(),
            language_prior_weight: default_language_prior_weight(),
            topology_weight: default_topology_weight(),
        }
    }
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.waypoint/data")
}

fn default_vision_model() -> String {
    "qwen2.5-vl-72b-instruct".to_string()
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_anthropic_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_model_timeout() -> u64 {
    60
}

fn default_service_timeout() -> u64 {
    30
}

fn default_top_k() -> usize {
    5
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_nominatim_url() -> String {
    "https://nominatim.openstreetmap.org".to_string()
}

fn default_overpass_url() -> String {
    "https://overpass-api.de/api/interpreter".to_string()
}

fn default_user_agent() -> String {
    format!("waypoint/{}", env!("CARGO_PKG_VERSION"))
}

fn default_confidence_threshold() -> f64 {
    0.75
}

fn default_max_iterations() -> u32 {
    2
}

fn default_dedup_radius() -> f64 {
    1000.0
}

fn default_min_alternative_score() -> f64 {
    0.3
}

fn default_run_timeout() -> u64 {
    300
}

fn default_batch_concurrency() -> usize {
    4
}

fn default_text_match_weight() -> f64 {
    0.30
}

fn default_language_prior_weight() -> f64 {
    0.15
}

fn default_topology_weight() -> f64 {
    0.10
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Default configuration file path: ~/.waypoint/config.toml
    pub fn default_path() -> Result<PathBuf, GeoError> {
        let home = dirs::home_dir()
            .ok_or_else(|| GeoError::Config("Could not determine home directory".to_string()))?;
        Ok(home.join(".waypoint").join("config.toml"))
    }

    /// Load configuration from the default location, writing a default
    /// file if none exists yet.
    pub fn load_or_create() -> Result<Self, GeoError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            let config = Config::default();
            config.save(&path)?;
            tracing::info!("Created default configuration at {}", path.display());
            Ok(config)
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self, GeoError> {
        let contents = fs::read_to_string(path).map_err(|e| {
            GeoError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| GeoError::Config(format!("Failed to parse config: {e}")))?;
        config.core.data_dir = expand_tilde(&config.core.data_dir);
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to the given path, creating parent dirs.
    pub fn save(&self, path: &Path) -> Result<(), GeoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| GeoError::Config(format!("Failed to create config dir: {e}")))?;
        }
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| GeoError::Config(format!("Failed to serialize config: {e}")))?;
        fs::write(path, toml_string)
            .map_err(|e| GeoError::Config(format!("Failed to write config: {e}")))?;
        Ok(())
    }

    /// Validate cross-field invariants the type system cannot express.
    pub fn validate(&self) -> Result<(), GeoError> {
        if !(0.0..=1.0).contains(&self.agent.confidence_threshold) {
            return Err(GeoError::Config(format!(
                "agent.confidence_threshold {} out of [0,1]",
                self.agent.confidence_threshold
            )));
        }
        if self.agent.max_iterations == 0 {
            return Err(GeoError::Config(
                "agent.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.agent.dedup_radius_m < 0.0 {
            return Err(GeoError::Config(
                "agent.dedup_radius_m must be non-negative".to_string(),
            ));
        }
        for (name, weight) in [
            ("text_match_weight", self.agent.text_match_weight),
            ("language_prior_weight", self.agent.language_prior_weight),
            ("topology_weight", self.agent.topology_weight),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(GeoError::Config(format!("agent.{name} {weight} out of [0,1]")));
            }
        }
        if self.retrieval.top_k == 0 {
            return Err(GeoError::Config(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }
        if self.agent.batch_concurrency == 0 {
            return Err(GeoError::Config(
                "agent.batch_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}
