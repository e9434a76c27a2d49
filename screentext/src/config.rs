use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::decoding::{DecodeStrategy, DecoderOptions};
use crate::engine::EngineSettings;

fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Using default.", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_env_opt<T: std::str::FromStr>(var: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Ignoring.", val, var, e);
                None
            }
        },
        Err(_) => None,
    }
}

/// Parse a comma-separated list, dropping empty entries.
fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Service,
    Cloud,
    Manga,
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "service" | "local" => Ok(EngineKind::Service),
            "cloud" => Ok(EngineKind::Cloud),
            "manga" => Ok(EngineKind::Manga),
            other => Err(format!("unknown engine kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engine: EngineConfig,
    pub service: ServiceConfig,
    pub supervisor: SupervisorConfig,
    pub settings: EngineSettings,
    pub cloud: CloudOcrConfig,
    pub decoder: DecoderConfig,
    pub manga: MangaConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub language: String,
}

/// Local recognition service launched (or bound to) by the supervisor.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub executable: PathBuf,
    pub presets_dir: PathBuf,
    /// Address of an already-running service. When set, no process is spawned.
    pub address: Option<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    pub health_interval_ms: u64,
    pub health_attempts: u32,
    pub settings_retry_limit: u32,
}

impl SupervisorConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudOcrConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    pub strategy: String,
    pub beam_width: usize,
    pub length_penalty: f64,
    pub max_sequence_length: usize,
    pub start_token_id: u32,
    pub eos_token_id: u32,
    pub min_token_index: u32,
}

impl DecoderConfig {
    pub fn strategy(&self) -> DecodeStrategy {
        match self.strategy.trim().to_lowercase().as_str() {
            "beam" => DecodeStrategy::Beam {
                width: self.beam_width.max(1),
            },
            "greedy" => DecodeStrategy::Greedy,
            other => {
                tracing::warn!("Unknown decoder strategy '{}', using greedy", other);
                DecodeStrategy::Greedy
            }
        }
    }

    pub fn options(&self) -> DecoderOptions {
        DecoderOptions {
            start_token_id: self.start_token_id,
            eos_token_id: self.eos_token_id,
            max_sequence_length: self.max_sequence_length,
            min_token_index: self.min_token_index,
            length_penalty: self.length_penalty,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MangaConfig {
    pub vocab_path: PathBuf,
    pub image_size: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            strategy: "greedy".to_string(),
            beam_width: 3,
            length_penalty: 2.0,
            max_sequence_length: 300,
            start_token_id: 2,
            eos_token_id: 3,
            min_token_index: 5,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval_ms: 2000,
            health_attempts: 15,
            settings_retry_limit: 3,
        }
    }
}

impl Default for CloudOcrConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o".to_string(),
            api_key: None,
            base_url: None,
            timeout_secs: 60,
            max_retries: 3,
            languages: parse_list("en,ja,zh,ko"),
        }
    }
}

fn default_executable() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("ocr-service.exe")
    } else {
        PathBuf::from("ocr-service")
    }
}

impl Default for Config {
    fn default() -> Self {
        let decoder_defaults = DecoderConfig::default();
        let supervisor_defaults = SupervisorConfig::default();
        let settings_defaults = EngineSettings::default();
        let cloud_defaults = CloudOcrConfig::default();

        Self {
            engine: EngineConfig {
                kind: parse_env_or("OCR_ENGINE", EngineKind::Service),
                language: env::var("OCR_LANGUAGE").unwrap_or_else(|_| "ja".to_string()),
            },
            service: ServiceConfig {
                executable: parse_env_opt("OCR_SERVICE_EXECUTABLE")
                    .unwrap_or_else(default_executable),
                presets_dir: parse_env_or("OCR_SERVICE_PRESETS_DIR", PathBuf::from("presets")),
                address: env::var("OCR_SERVICE_ADDRESS").ok().filter(|a| !a.is_empty()),
                request_timeout_secs: parse_env_or("OCR_SERVICE_TIMEOUT", 120),
            },
            supervisor: SupervisorConfig {
                health_interval_ms: parse_env_or(
                    "OCR_HEALTH_INTERVAL_MS",
                    supervisor_defaults.health_interval_ms,
                ),
                health_attempts: parse_env_or(
                    "OCR_HEALTH_ATTEMPTS",
                    supervisor_defaults.health_attempts,
                ),
                settings_retry_limit: parse_env_or(
                    "OCR_SETTINGS_RETRIES",
                    supervisor_defaults.settings_retry_limit,
                ),
            },
            settings: EngineSettings {
                threads: parse_env_or("OCR_THREADS", settings_defaults.threads),
                max_image_width: parse_env_or(
                    "OCR_MAX_IMAGE_WIDTH",
                    settings_defaults.max_image_width,
                ),
                inference_runtime: env::var("OCR_INFERENCE_RUNTIME")
                    .unwrap_or_else(|_| settings_defaults.inference_runtime.clone()),
                ..settings_defaults
            },
            cloud: CloudOcrConfig {
                model: env::var("OCR_CLOUD_MODEL").unwrap_or(cloud_defaults.model),
                api_key: env::var("OCR_CLOUD_API_KEY").ok(),
                base_url: env::var("OCR_CLOUD_BASE_URL").ok(),
                timeout_secs: parse_env_or("OCR_CLOUD_TIMEOUT", cloud_defaults.timeout_secs),
                max_retries: parse_env_or("OCR_CLOUD_MAX_RETRIES", cloud_defaults.max_retries),
                languages: env::var("OCR_CLOUD_LANGUAGES")
                    .map(|v| parse_list(&v))
                    .unwrap_or(cloud_defaults.languages),
            },
            decoder: DecoderConfig {
                strategy: env::var("OCR_DECODER_STRATEGY").unwrap_or(decoder_defaults.strategy),
                beam_width: parse_env_or("OCR_BEAM_WIDTH", decoder_defaults.beam_width),
                length_penalty: parse_env_or("OCR_LENGTH_PENALTY", decoder_defaults.length_penalty),
                max_sequence_length: parse_env_or(
                    "OCR_MAX_SEQUENCE_LENGTH",
                    decoder_defaults.max_sequence_length,
                ),
                start_token_id: parse_env_or("OCR_START_TOKEN_ID", decoder_defaults.start_token_id),
                eos_token_id: parse_env_or("OCR_EOS_TOKEN_ID", decoder_defaults.eos_token_id),
                min_token_index: parse_env_or(
                    "OCR_MIN_TOKEN_INDEX",
                    decoder_defaults.min_token_index,
                ),
            },
            manga: MangaConfig {
                vocab_path: parse_env_or("OCR_MANGA_VOCAB", PathBuf::from("vocab.txt")),
                image_size: parse_env_or("OCR_MANGA_IMAGE_SIZE", 224),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}

/// Known cloud OCR providers, selected by the prefix of the model name.
pub const KNOWN_CLOUD_PROVIDERS: &[&str] = &["openai", "mistral", "deepseek"];

/// Parse a cloud model name into (provider, model) tuple.
pub fn parse_cloud_provider_model(model: &str) -> (&str, &str) {
    if let Some((prefix, rest)) = model.split_once('/') {
        let prefix_lower = prefix.to_lowercase();
        if KNOWN_CLOUD_PROVIDERS.contains(&prefix_lower.as_str()) {
            return (prefix, rest);
        }
    }
    // Bare model names go to the OpenAI-compatible endpoint
    ("openai", model)
}
