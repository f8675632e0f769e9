//! Hume EVI configuration types.
//!
//! # Example
//!
//! ```rust,ignore
//! use callvox_gateway::core::realtime::hume::{HumeEVIConfig, EVIVersion};
//!
//! let config = HumeEVIConfig {
//!     api_key: "your-api-key".to_string(),
//!     config_id: Some("your-config-id".to_string()),
//!     evi_version: EVIVersion::V3,
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};

use super::messages::{
    HUME_EVI_DEFAULT_CHANNELS, HUME_EVI_DEFAULT_SAMPLE_RATE, HUME_EVI_WEBSOCKET_URL,
};
use crate::core::realtime::base::{DEFAULT_CONNECT_TIMEOUT_MS, RealtimeConfig};

// =============================================================================
// EVI Version
// =============================================================================

/// EVI version to use for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EVIVersion {
    /// EVI version 3 (English only).
    #[default]
    #[serde(rename = "3")]
    V3,
    #[serde(rename = "4-mini")]
    V4Mini,
}

impl EVIVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            EVIVersion::V3 => "3",
            EVIVersion::V4Mini => "4-mini",
        }
    }

    /// Parse a configured version; anything unrecognised is `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "3" => Some(EVIVersion::V3),
            "4-mini" | "4mini" => Some(EVIVersion::V4Mini),
            _ => None,
        }
    }
}

impl std::fmt::Display for EVIVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Hume EVI Configuration
// =============================================================================

/// Configuration for Hume EVI (Empathic Voice Interface).
///
/// - Input: linear16 PCM, mono, at `sample_rate`
/// - Output: base64-encoded WAV, rate read from each chunk's header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumeEVIConfig {
    pub api_key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,

    #[serde(default)]
    pub evi_version: EVIVersion,

    /// Voice ID; overrides the voice in the EVI configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,

    /// Enable interim user transcripts.
    #[serde(default)]
    pub verbose_transcription: bool,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u8,

    #[serde(default = "default_websocket_url")]
    pub websocket_url: String,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

fn default_sample_rate() -> u32 {
    HUME_EVI_DEFAULT_SAMPLE_RATE
}

fn default_channels() -> u8 {
    HUME_EVI_DEFAULT_CHANNELS
}

fn default_websocket_url() -> String {
    HUME_EVI_WEBSOCKET_URL.to_string()
}

fn default_connection_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl Default for HumeEVIConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            config_id: None,
            evi_version: EVIVersion::default(),
            voice_id: None,
            verbose_transcription: false,
            sample_rate: HUME_EVI_DEFAULT_SAMPLE_RATE,
            channels: HUME_EVI_DEFAULT_CHANNELS,
            websocket_url: HUME_EVI_WEBSOCKET_URL.to_string(),
            connection_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl HumeEVIConfig {
    /// Map the provider-neutral config onto EVI settings.
    /// `model` selects the EVI version ("3", "4-mini"); other values keep
    /// the default.
    pub fn from_realtime_config(config: &RealtimeConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            config_id: config.config_id.clone(),
            evi_version: EVIVersion::parse(&config.model).unwrap_or_default(),
            voice_id: config.voice.clone(),
            websocket_url: config
                .endpoint
                .clone()
                .unwrap_or_else(default_websocket_url),
            connection_timeout_ms: config.connect_timeout_ms,
            ..Default::default()
        }
    }

    pub fn build_websocket_url(&self) -> String {
        fn encode(s: &str) -> String {
            url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
        }

        let mut params = vec![format!("api_key={}", encode(&self.api_key))];
        if let Some(ref config_id) = self.config_id {
            params.push(format!("config_id={}", encode(config_id)));
        }
        if let Some(ref voice_id) = self.voice_id {
            params.push(format!("voice_id={}", encode(voice_id)));
        }
        if self.verbose_transcription {
            params.push("verbose_transcription=true".to_string());
        }
        params.push(format!("evi_version={}", self.evi_version.as_str()));

        format!("{}?{}", self.websocket_url, params.join("&"))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.api_key.is_empty() {
            return Err("API key is required".to_string());
        }
        if self.sample_rate == 0 {
            return Err("Sample rate must be greater than 0".to_string());
        }
        if self.channels == 0 {
            return Err("Channels must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evi_version_parse() {
        assert_eq!(EVIVersion::parse("3"), Some(EVIVersion::V3));
        assert_eq!(EVIVersion::parse("4-mini"), Some(EVIVersion::V4Mini));
        assert_eq!(EVIVersion::parse("gpt-4o"), None);
        assert_eq!(EVIVersion::V4Mini.to_string(), "4-mini");
    }

    #[test]
    fn test_from_realtime_config() {
        let config = HumeEVIConfig::from_realtime_config(&RealtimeConfig {
            api_key: "key".to_string(),
            model: "4-mini".to_string(),
            voice: Some("kora".to_string()),
            config_id: Some("cfg_1".to_string()),
            endpoint: Some("ws://127.0.0.1:9001/chat".to_string()),
            connect_timeout_ms: 2500,
            ..Default::default()
        });
        assert_eq!(config.evi_version, EVIVersion::V4Mini);
        assert_eq!(config.voice_id.as_deref(), Some("kora"));
        assert_eq!(config.websocket_url, "ws://127.0.0.1:9001/chat");
        assert_eq!(config.connection_timeout_ms, 2500);
        assert_eq!(config.sample_rate, HUME_EVI_DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn test_build_websocket_url() {
        let config = HumeEVIConfig {
            api_key: "a b&c".to_string(),
            config_id: Some("cfg_abc".to_string()),
            verbose_transcription: true,
            ..Default::default()
        };
        let url = config.build_websocket_url();

        assert!(url.starts_with(HUME_EVI_WEBSOCKET_URL));
        assert!(url.contains("api_key=a+b%26c"));
        assert!(url.contains("config_id=cfg_abc"));
        assert!(url.contains("verbose_transcription=true"));
        assert!(url.ends_with("evi_version=3"));
    }

    #[test]
    fn test_validate() {
        assert!(HumeEVIConfig::default().validate().unwrap_err().contains("API key"));

        let config = HumeEVIConfig {
            api_key: "test".to_string(),
            sample_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("Sample rate"));

        let config = HumeEVIConfig {
            api_key: "test".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
