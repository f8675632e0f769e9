use serde::Deserialize;
use std::path::Path;

use super::ConfigError;
use crate::core::call::{CallTimingConfig, PipelineConfig};
use crate::core::vad::VADConfig;

/// Complete YAML configuration structure
///
/// All fields are optional so a file can override only what it needs;
/// anything left out keeps its environment or default value.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///   tls:
///     cert_path: "/etc/callvox/cert.pem"
///     key_path: "/etc/callvox/key.pem"
///
/// providers:
///   default: openai
///   openai:
///     api_key: "sk-..."
///     model: "gpt-4o-realtime-preview"
///     voice: "alloy"
///   hume:
///     api_key: "hume-key"
///     config_id: "evi-config-id"
///
/// telephony:
///   start_timeout_ms: 10000
///   pipeline:
///     rx_queue_frames: 50
///     egress_lead_frames: 5
///
/// timing:
///   min_speech_ms: 150
///   silence_hangup_ms: 20000
///
/// prompts:
///   path: "/etc/callvox/prompts.yaml"
///   cache_ttl_seconds: 300
///
/// recording:
///   backend: s3
///   s3_bucket: "call-recordings"
///   s3_region: "us-west-2"
///   prefix: "production"
///
/// leads:
///   base_url: "https://crm.internal/api"
///   api_key: "crm-token"
///
/// limits:
///   max_concurrent_calls: 200
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub providers: Option<ProvidersYaml>,
    pub telephony: Option<TelephonyYaml>,
    pub timing: Option<CallTimingConfig>,
    pub vad: Option<VADConfig>,
    pub prompts: Option<PromptsYaml>,
    pub recording: Option<RecordingYaml>,
    pub leads: Option<LeadsYaml>,
    pub limits: Option<LimitsYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
    pub cors_allowed_origins: Option<String>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Realtime provider settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersYaml {
    /// `openai` or `hume`
    pub default: Option<String>,
    pub openai: Option<OpenAIYaml>,
    pub hume: Option<HumeYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OpenAIYaml {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub endpoint: Option<String>,
    pub transcription_model: Option<String>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HumeYaml {
    pub api_key: Option<String>,
    pub config_id: Option<String>,
    pub voice: Option<String>,
    pub endpoint: Option<String>,
}

/// Telephony socket and audio pipeline settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TelephonyYaml {
    /// How long a socket may stay open without a `start` frame
    pub start_timeout_ms: Option<u64>,
    pub pipeline: Option<PipelineConfig>,
}

/// Prompt catalog settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PromptsYaml {
    pub path: Option<String>,
    pub cache_ttl_seconds: Option<u64>,
}

/// Recording sink settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RecordingYaml {
    /// `local`, `s3`, `memory` or `none`
    pub backend: Option<String>,
    pub path: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub prefix: Option<String>,
}

/// Lead store settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LeadsYaml {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LimitsYaml {
    pub max_concurrent_calls: Option<usize>,
}

impl YamlConfig {
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "0.0.0.0"
  port: 3001
providers:
  default: hume
  openai:
    api_key: "sk-test"
    voice: "alloy"
  hume:
    api_key: "hume-test"
    config_id: "cfg-1"
telephony:
  start_timeout_ms: 5000
  pipeline:
    rx_queue_frames: 25
timing:
  silence_hangup_ms: 15000
prompts:
  path: "/etc/callvox/prompts.yaml"
recording:
  backend: local
  path: "/var/lib/callvox"
leads:
  base_url: "https://crm.example.com"
limits:
  max_concurrent_calls: 10
"#;
        let config = YamlConfig::parse(yaml).unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(server.port, Some(3001));

        let providers = config.providers.unwrap();
        assert_eq!(providers.default.as_deref(), Some("hume"));
        assert_eq!(providers.openai.unwrap().voice.as_deref(), Some("alloy"));
        assert_eq!(providers.hume.unwrap().config_id.as_deref(), Some("cfg-1"));

        let telephony = config.telephony.unwrap();
        assert_eq!(telephony.start_timeout_ms, Some(5000));
        let pipeline = telephony.pipeline.unwrap();
        assert_eq!(pipeline.rx_queue_frames, 25);
        // Unset pipeline fields keep their defaults
        assert_eq!(pipeline.tick_ms, PipelineConfig::default().tick_ms);

        let timing = config.timing.unwrap();
        assert_eq!(timing.silence_hangup_ms, 15_000);
        assert_eq!(timing.min_speech_ms, 150);

        assert_eq!(config.recording.unwrap().backend.as_deref(), Some("local"));
        assert_eq!(
            config.leads.unwrap().base_url.as_deref(),
            Some("https://crm.example.com")
        );
        assert_eq!(config.limits.unwrap().max_concurrent_calls, Some(10));
    }

    #[test]
    fn test_yaml_config_empty() {
        let config = YamlConfig::parse("").unwrap_or_default();
        assert!(config.server.is_none());
        assert!(config.providers.is_none());
        assert!(config.timing.is_none());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "server:\n  host: \"localhost\"\n  port: 3000\n").unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();
        assert_eq!(
            config.server.as_ref().unwrap().host,
            Some("localhost".to_string())
        );
        assert_eq!(config.server.as_ref().unwrap().port, Some(3000));
    }

    #[test]
    fn test_from_file_not_found() {
        let result = YamlConfig::from_file(Path::new("/nonexistent/config.yaml"));
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");
        fs::write(&config_path, "invalid: yaml: content:").unwrap();

        let result = YamlConfig::from_file(&config_path);
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}
