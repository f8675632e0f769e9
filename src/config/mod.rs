//! Configuration module for the Callvox gateway
//!
//! Configuration comes from environment variables (with `.env` loaded at
//! startup in `main.rs`) and optionally a YAML file. Priority:
//! YAML > ENV vars > .env values > defaults. Validation runs once after the
//! merge.
//!
//! # Example
//! ```rust,no_run
//! use callvox_gateway::config::ServerConfig;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config = ServerConfig::from_file(Path::new("config.yaml"))?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod env;
mod yaml;

pub use yaml::YamlConfig;

use crate::core::call::{CallTimingConfig, PipelineConfig};
use crate::core::realtime::{RealtimeConfig, RealtimeProvider};
use crate::core::vad::VADConfig;
use env::{env_parse, env_var};

/// Default wait for the telephony `start` frame.
pub const DEFAULT_START_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: '{value}'")]
    InvalidEnv { name: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Where call recordings and transcripts go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingBackend {
    Local { path: PathBuf },
    S3 { bucket: String, region: Option<String> },
    Memory,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
    /// Comma-separated origins for the HTTP API; `*` allows any
    pub cors_allowed_origins: Option<String>,

    // Providers
    pub default_provider: RealtimeProvider,
    pub openai_api_key: Option<String>,
    pub openai_model: Option<String>,
    pub openai_voice: Option<String>,
    pub openai_endpoint: Option<String>,
    pub openai_transcription_model: Option<String>,
    pub openai_temperature: Option<f32>,
    pub hume_api_key: Option<String>,
    pub hume_config_id: Option<String>,
    pub hume_voice: Option<String>,
    pub hume_endpoint: Option<String>,

    // Telephony and call behaviour
    pub start_timeout_ms: u64,
    pub pipeline: PipelineConfig,
    pub timing: CallTimingConfig,
    pub vad: VADConfig,

    // Collaborators
    pub prompts_path: Option<PathBuf>,
    pub prompts_cache_ttl_seconds: u64,
    pub recording: Option<RecordingBackend>,
    pub recording_prefix: Option<String>,
    pub leads_base_url: Option<String>,
    pub leads_api_key: Option<String>,
    pub leads_timeout_ms: u64,

    // Limits
    /// Maximum concurrent telephony sockets; `None` is unlimited
    pub max_concurrent_calls: Option<usize>,
}

/// Zeroize all secret fields when the config is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.openai_api_key {
            key.zeroize();
        }
        if let Some(ref mut key) = self.hume_api_key {
            key.zeroize();
        }
        if let Some(ref mut key) = self.leads_api_key {
            key.zeroize();
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            cors_allowed_origins: None,
            default_provider: RealtimeProvider::OpenAI,
            openai_api_key: None,
            openai_model: None,
            openai_voice: None,
            openai_endpoint: None,
            openai_transcription_model: None,
            openai_temperature: None,
            hume_api_key: None,
            hume_config_id: None,
            hume_voice: None,
            hume_endpoint: None,
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            pipeline: PipelineConfig::default(),
            timing: CallTimingConfig::default(),
            vad: VADConfig::default(),
            prompts_path: None,
            prompts_cache_ttl_seconds: 300,
            recording: None,
            recording_prefix: None,
            leads_base_url: None,
            leads_api_key: None,
            leads_timeout_ms: 2000,
            max_concurrent_calls: None,
        }
    }
}

fn parse_provider(name: &str, value: &str) -> Result<RealtimeProvider, ConfigError> {
    RealtimeProvider::parse(value).ok_or_else(|| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_recording_backend(
    backend: &str,
    path: Option<String>,
    bucket: Option<String>,
    region: Option<String>,
) -> Result<Option<RecordingBackend>, ConfigError> {
    match backend.to_lowercase().as_str() {
        "none" | "off" => Ok(None),
        "memory" => Ok(Some(RecordingBackend::Memory)),
        "local" => {
            let path = path.ok_or_else(|| {
                ConfigError::Invalid("recording backend 'local' requires a path".to_string())
            })?;
            Ok(Some(RecordingBackend::Local {
                path: PathBuf::from(path),
            }))
        }
        "s3" => {
            let bucket = bucket.ok_or_else(|| {
                ConfigError::Invalid("recording backend 's3' requires s3_bucket".to_string())
            })?;
            Ok(Some(RecordingBackend::S3 { bucket, region }))
        }
        other => Err(ConfigError::Invalid(format!(
            "unknown recording backend '{other}' (expected local, s3, memory or none)"
        ))),
    }
}

impl ServerConfig {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::env_base()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file on top of the environment configuration.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path)?;
        let mut config = Self::env_base()?;
        config.apply_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn env_base() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(host) = env_var("HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("PORT")? {
            config.port = port;
        }
        if let (Some(cert), Some(key)) = (env_var("TLS_CERT_PATH"), env_var("TLS_KEY_PATH")) {
            config.tls = Some(TlsConfig {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            });
        }
        config.cors_allowed_origins = env_var("CORS_ALLOWED_ORIGINS");

        if let Some(provider) = env_var("DEFAULT_PROVIDER") {
            config.default_provider = parse_provider("DEFAULT_PROVIDER", &provider)?;
        }
        config.openai_api_key = env_var("OPENAI_API_KEY");
        config.openai_model = env_var("OPENAI_REALTIME_MODEL");
        config.openai_voice = env_var("OPENAI_VOICE");
        config.openai_endpoint = env_var("OPENAI_REALTIME_URL");
        config.hume_api_key = env_var("HUME_API_KEY");
        config.hume_config_id = env_var("HUME_CONFIG_ID");
        config.hume_voice = env_var("HUME_VOICE");
        config.hume_endpoint = env_var("HUME_EVI_URL");

        if let Some(ms) = env_parse("START_TIMEOUT_MS")? {
            config.start_timeout_ms = ms;
        }

        config.prompts_path = env_var("PROMPTS_PATH").map(PathBuf::from);
        if let Some(backend) = env_var("RECORDING_BACKEND") {
            config.recording = parse_recording_backend(
                &backend,
                env_var("RECORDING_PATH"),
                env_var("RECORDING_S3_BUCKET"),
                env_var("RECORDING_S3_REGION"),
            )?;
        }
        config.recording_prefix = env_var("RECORDING_PREFIX");
        config.leads_base_url = env_var("LEADS_BASE_URL");
        config.leads_api_key = env_var("LEADS_API_KEY");
        config.max_concurrent_calls = env_parse("MAX_CONCURRENT_CALLS")?;

        Ok(config)
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) -> Result<(), ConfigError> {
        if let Some(server) = yaml.server {
            if let Some(host) = server.host {
                self.host = host;
            }
            if let Some(port) = server.port {
                self.port = port;
            }
            if let Some(tls) = server.tls
                && let (Some(cert), Some(key)) = (tls.cert_path, tls.key_path)
            {
                self.tls = Some(TlsConfig {
                    cert_path: PathBuf::from(cert),
                    key_path: PathBuf::from(key),
                });
            }
            if server.cors_allowed_origins.is_some() {
                self.cors_allowed_origins = server.cors_allowed_origins;
            }
        }

        if let Some(providers) = yaml.providers {
            if let Some(default) = providers.default {
                self.default_provider = parse_provider("providers.default", &default)?;
            }
            if let Some(openai) = providers.openai {
                override_opt(&mut self.openai_api_key, openai.api_key);
                override_opt(&mut self.openai_model, openai.model);
                override_opt(&mut self.openai_voice, openai.voice);
                override_opt(&mut self.openai_endpoint, openai.endpoint);
                override_opt(&mut self.openai_transcription_model, openai.transcription_model);
                override_opt(&mut self.openai_temperature, openai.temperature);
            }
            if let Some(hume) = providers.hume {
                override_opt(&mut self.hume_api_key, hume.api_key);
                override_opt(&mut self.hume_config_id, hume.config_id);
                override_opt(&mut self.hume_voice, hume.voice);
                override_opt(&mut self.hume_endpoint, hume.endpoint);
            }
        }

        if let Some(telephony) = yaml.telephony {
            if let Some(ms) = telephony.start_timeout_ms {
                self.start_timeout_ms = ms;
            }
            if let Some(pipeline) = telephony.pipeline {
                self.pipeline = pipeline;
            }
        }
        if let Some(timing) = yaml.timing {
            self.timing = timing;
        }
        if let Some(vad) = yaml.vad {
            self.vad = vad;
        }

        if let Some(prompts) = yaml.prompts {
            override_opt(&mut self.prompts_path, prompts.path.map(PathBuf::from));
            if let Some(ttl) = prompts.cache_ttl_seconds {
                self.prompts_cache_ttl_seconds = ttl;
            }
        }

        if let Some(recording) = yaml.recording {
            if let Some(backend) = recording.backend {
                self.recording = parse_recording_backend(
                    &backend,
                    recording.path,
                    recording.s3_bucket,
                    recording.s3_region,
                )?;
            }
            override_opt(&mut self.recording_prefix, recording.prefix);
        }

        if let Some(leads) = yaml.leads {
            override_opt(&mut self.leads_base_url, leads.base_url);
            override_opt(&mut self.leads_api_key, leads.api_key);
            if let Some(ms) = leads.timeout_ms {
                self.leads_timeout_ms = ms;
            }
        }

        if let Some(limits) = yaml.limits {
            override_opt(&mut self.max_concurrent_calls, limits.max_concurrent_calls);
        }

        Ok(())
    }

    /// Check the merged configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be greater than 0".to_string()));
        }
        if !self.provider_configs().contains_key(&self.default_provider) {
            return Err(ConfigError::Invalid(format!(
                "default provider '{}' has no API key configured",
                self.default_provider
            )));
        }
        if self.start_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "start_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_calls == Some(0) {
            return Err(ConfigError::Invalid(
                "max_concurrent_calls must be greater than 0".to_string(),
            ));
        }
        self.timing.validate().map_err(ConfigError::Invalid)?;
        self.pipeline.validate().map_err(ConfigError::Invalid)?;
        self.vad.validate().map_err(ConfigError::Invalid)?;
        if self.vad.sample_rate != crate::core::audio::TELEPHONY_SAMPLE_RATE {
            return Err(ConfigError::Invalid(format!(
                "vad.sample_rate must match the telephony rate ({} Hz)",
                crate::core::audio::TELEPHONY_SAMPLE_RATE
            )));
        }
        Ok(())
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Client configuration for every provider that has an API key.
    pub fn provider_configs(&self) -> HashMap<RealtimeProvider, RealtimeConfig> {
        let mut configs = HashMap::new();
        if let Some(key) = &self.openai_api_key {
            configs.insert(
                RealtimeProvider::OpenAI,
                RealtimeConfig {
                    api_key: key.clone(),
                    model: self.openai_model.clone().unwrap_or_default(),
                    voice: self.openai_voice.clone(),
                    endpoint: self.openai_endpoint.clone(),
                    transcription_model: self.openai_transcription_model.clone(),
                    temperature: self.openai_temperature,
                    ..Default::default()
                },
            );
        }
        if let Some(key) = &self.hume_api_key {
            configs.insert(
                RealtimeProvider::Hume,
                RealtimeConfig {
                    api_key: key.clone(),
                    voice: self.hume_voice.clone(),
                    endpoint: self.hume_endpoint.clone(),
                    config_id: self.hume_config_id.clone(),
                    ..Default::default()
                },
            );
        }
        configs
    }

    /// Human-readable summary with secrets masked.
    pub fn summary(&self) -> String {
        let providers: Vec<&str> = {
            let mut names: Vec<&str> = self
                .provider_configs()
                .keys()
                .map(|p| p.as_str())
                .collect();
            names.sort_unstable();
            names
        };
        let recording = match &self.recording {
            None => "disabled".to_string(),
            Some(RecordingBackend::Memory) => "memory".to_string(),
            Some(RecordingBackend::Local { path }) => format!("local ({})", path.display()),
            Some(RecordingBackend::S3 { bucket, .. }) => format!("s3 ({bucket})"),
        };
        format!(
            "address: {}\ntls: {}\ndefault provider: {}\nproviders: {}\nprompts: {}\nrecording: {}\nleads: {}\nmax concurrent calls: {}",
            self.address(),
            self.is_tls_enabled(),
            self.default_provider,
            providers.join(", "),
            self.prompts_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string()),
            recording,
            self.leads_base_url.as_deref().unwrap_or("disabled"),
            self.max_concurrent_calls
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unlimited".to_string()),
        )
    }
}

fn override_opt<T>(target: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *target = value;
    }
}
