//! OpenAI Realtime API module.
//!
//! Full-duplex audio with explicit turn-taking: the gateway asks for every
//! response and cancels them on barge-in. Server VAD stays on only for
//! speech events and caller transcription.
//!
//! # Supported Voices
//!
//! alloy, ash, ballad, coral, echo, sage, shimmer, verse
//!
//! # Audio Format
//!
//! Input and output audio is PCM 16-bit signed little-endian at 24kHz.

mod client;
mod config;
mod messages;

pub use client::OpenAIRealtime;
pub use config::{
    OPENAI_DEFAULT_MODEL, OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL, OpenAIRealtimeVoice,
};
pub use messages::{ClientEvent, ConversationItem, ServerEvent, SessionConfig, TurnDetection};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::base::{BaseRealtime, RealtimeConfig, TurnTaking};

    #[test]
    fn test_openai_capabilities() {
        let realtime = OpenAIRealtime::new(RealtimeConfig {
            api_key: "test_key".to_string(),
            voice: Some("coral".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(!realtime.is_ready());
        assert_eq!(realtime.turn_taking(), TurnTaking::Explicit);
        assert_eq!(realtime.sample_rate(), OPENAI_REALTIME_SAMPLE_RATE);
        assert_eq!(realtime.provider_name(), "openai");
    }
}
