//! Hume AI Realtime Module - Empathic Voice Interface (EVI).
//!
//! EVI detects the end of the caller's turn itself and replies without a
//! request, so this backend reports [`TurnTaking::Auto`]. Caller transcripts
//! carry the dominant prosody label as `emotion`.
//!
//! # EVI Versions
//!
//! - **EVI 3**: English only (default)
//! - **EVI 4-mini**: Multilingual, lower latency
//!
//! # Audio Format
//!
//! - **Input**: Linear16 PCM, mono, 16kHz unless configured otherwise
//! - **Output**: Base64-encoded WAV
//!
//! [`TurnTaking::Auto`]: crate::core::realtime::TurnTaking::Auto

mod client;
mod config;
pub mod messages;

pub use client::HumeEVI;
pub use config::{EVIVersion, HumeEVIConfig};
pub use messages::{
    EVIClientMessage, EVIServerMessage, HUME_EVI_DEFAULT_CHANNELS, HUME_EVI_DEFAULT_SAMPLE_RATE,
    HUME_EVI_WEBSOCKET_URL, ProsodyScores,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_from_hume_config() {
        let config = HumeEVIConfig {
            api_key: "test-key".to_string(),
            evi_version: EVIVersion::V4Mini,
            ..Default::default()
        };
        assert!(HumeEVI::from_hume_config(config).is_ok());
        assert!(HumeEVI::from_hume_config(HumeEVIConfig::default()).is_err());
    }
}
