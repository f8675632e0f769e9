//! Telephony media stream wire format (Twilio Media Streams JSON)

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::core::audio::TELEPHONY_SAMPLE_RATE;
use crate::core::call::{CallDirection, CallMetadata};
use crate::core::realtime::RealtimeProvider;

/// Encoding the carrier must announce in `start.mediaFormat`.
pub const MULAW_ENCODING: &str = "audio/x-mulaw";

// =============================================================================
// Incoming Messages (Carrier -> Gateway)
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyIncoming {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartPayload,
    },
    Media {
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Mark {
        mark: MarkPayload,
    },
    Stop {
        #[serde(default)]
        stop: Option<StopPayload>,
    },
    /// DTMF and anything newer than this gateway
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    #[serde(default)]
    pub call_sid: String,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub custom_parameters: HashMap<String, String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

fn default_channels() -> u16 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    /// Base64 μ-law
    pub payload: String,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub chunk: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl MediaPayload {
    /// Only caller audio is relayed; echoed outbound tracks are ignored.
    pub fn is_caller_track(&self) -> bool {
        self.track
            .as_deref()
            .is_none_or(|t| t.eq_ignore_ascii_case("inbound"))
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.payload.as_bytes())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPayload {
    #[serde(default)]
    pub call_sid: Option<String>,
}

impl StartPayload {
    /// Reject anything but 8kHz mono μ-law. A missing format is assumed to be
    /// the carrier default.
    pub fn validate_media_format(&self) -> Result<(), String> {
        let Some(format) = &self.media_format else {
            return Ok(());
        };
        if !format.encoding.eq_ignore_ascii_case(MULAW_ENCODING)
            || format.sample_rate != TELEPHONY_SAMPLE_RATE
            || format.channels != 1
        {
            return Err(format!(
                "unsupported media format {} {}Hz x{}",
                format.encoding, format.sample_rate, format.channels
            ));
        }
        Ok(())
    }

    /// Call metadata from the start frame and its custom parameters
    /// (`direction`, `business_id`, `provider`, `from`, `to`).
    pub fn into_metadata(self, stream_sid: String) -> CallMetadata {
        let mut params = self.custom_parameters;
        let mut take = |key: &str| params.remove(key).filter(|v| !v.trim().is_empty());

        let direction = take("direction")
            .map(|d| CallDirection::parse(&d))
            .unwrap_or_default();
        let business_id = take("business_id");
        let provider = take("provider").and_then(|p| RealtimeProvider::parse(&p));
        let from = take("from");
        let to = take("to");

        let call_id = if self.call_sid.is_empty() {
            stream_sid.clone()
        } else {
            self.call_sid
        };

        CallMetadata {
            call_id,
            stream_sid,
            direction,
            business_id,
            from,
            to,
            provider,
        }
    }
}

// =============================================================================
// Outgoing Messages (Gateway -> Carrier)
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyOutgoing {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutgoingMedia,
    },
    Clear {
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMedia {
    pub payload: String,
}

impl TelephonyOutgoing {
    pub fn media(stream_sid: &str, payload: String) -> Self {
        TelephonyOutgoing::Media {
            stream_sid: stream_sid.to_string(),
            media: OutgoingMedia { payload },
        }
    }

    pub fn clear(stream_sid: &str) -> Self {
        TelephonyOutgoing::Clear {
            stream_sid: stream_sid.to_string(),
        }
    }
}
