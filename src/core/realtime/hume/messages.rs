//! Hume EVI WebSocket message types.
//!
//! # Message Flow
//!
//! ```text
//! Client → Server:
//!   - SessionSettings (audio format, prompt, voice, tools)
//!   - AudioInput (base64 linear16 chunks)
//!   - TextInput (empty text nudges the first turn)
//!   - ToolResponse (function call results)
//!   - StopAssistant (interrupt the current reply)
//!
//! Server → Client:
//!   - ChatMetadata (on connection)
//!   - UserMessage (transcription + prosody)
//!   - UserInterruption (caller spoke over the assistant)
//!   - AssistantMessage (response text)
//!   - AudioOutput (base64 WAV)
//!   - AssistantEnd (response complete)
//!   - ToolCall / ToolError
//!   - Error
//! ```

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::realtime::base::ToolDefinition;

// =============================================================================
// Constants
// =============================================================================

/// Hume EVI WebSocket endpoint URL.
pub const HUME_EVI_WEBSOCKET_URL: &str = "wss://api.hume.ai/v0/evi/chat";

/// Input sample rate declared in session settings (Hz).
pub const HUME_EVI_DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Default number of audio channels (mono).
pub const HUME_EVI_DEFAULT_CHANNELS: u8 = 1;

// =============================================================================
// Prosody Scores
// =============================================================================

/// Prosody scores keyed by emotion label ("Joy", "Calmness", ...), 0.0 to 1.0.
///
/// The labels describe perceived vocal expression, not the speaker's actual
/// state. Hume adds labels over time, so they are kept as a map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProsodyScores(pub HashMap<String, f32>);

impl ProsodyScores {
    pub fn top_emotions(&self, n: usize) -> Vec<(&str, f32)> {
        let mut scores: Vec<(&str, f32)> =
            self.0.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        scores.truncate(n);
        scores
    }

    pub fn dominant_emotion(&self) -> Option<(&str, f32)> {
        self.top_emotions(1).into_iter().next()
    }
}

// =============================================================================
// Client → Server Messages
// =============================================================================

/// Messages sent from client to Hume EVI server.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EVIClientMessage {
    SessionSettings(SessionSettings),
    AudioInput(AudioInput),
    TextInput(TextInput),
    ToolResponse(ToolResponse),
    StopAssistant(StopAssistant),
}

/// Session settings.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<HumeTool>>,
}

/// Audio format settings.
#[derive(Debug, Clone, Serialize)]
pub struct AudioSettings {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u8,
}

/// Supported audio encodings for EVI input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    #[default]
    Linear16,
}

/// Function tool declared in session settings.
///
/// Unlike OpenAI, `parameters` is a JSON schema serialized to a string.
#[derive(Debug, Clone, Serialize)]
pub struct HumeTool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: String,
}

impl From<&ToolDefinition> for HumeTool {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            tool_type: "function".to_string(),
            name: tool.name.clone(),
            description: Some(tool.description.clone()),
            parameters: tool.parameters.to_string(),
        }
    }
}

/// Audio input message containing base64-encoded audio.
#[derive(Debug, Clone, Serialize)]
pub struct AudioInput {
    pub data: String,
}

impl AudioInput {
    pub fn from_bytes(audio_data: &[u8]) -> Self {
        Self {
            data: BASE64.encode(audio_data),
        }
    }
}

/// Text input message.
#[derive(Debug, Clone, Serialize)]
pub struct TextInput {
    pub text: String,
}

/// Tool response message for function calling.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub tool_call_id: String,
    pub content: String,
}

/// Stop/interrupt assistant.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopAssistant {}

// =============================================================================
// Server → Client Messages
// =============================================================================

/// Messages received from Hume EVI server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EVIServerMessage {
    ChatMetadata(ChatMetadata),
    UserMessage(UserMessage),
    UserInterruption(UserInterruption),
    AssistantMessage(AssistantMessage),
    AudioOutput(AudioOutput),
    AssistantEnd(AssistantEnd),
    ToolCall(ToolCall),
    ToolError(ToolError),
    Error(EVIError),
    WebSocketError(WebSocketError),
    #[serde(other)]
    Unknown,
}

/// Chat metadata received on WebSocket connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMetadata {
    pub chat_id: String,
    #[serde(default)]
    pub chat_group_id: Option<String>,
}

/// User message with transcription and prosody scores.
#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub message: MessageContent,
    #[serde(default)]
    pub models: Option<ProsodyModels>,
    /// Interim transcripts arrive with verbose transcription enabled.
    #[serde(default)]
    pub interim: Option<bool>,
}

impl UserMessage {
    pub fn is_final(&self) -> bool {
        self.interim != Some(true)
    }

    /// Label of the strongest prosody score, if any were sent.
    pub fn dominant_emotion(&self) -> Option<String> {
        self.models
            .as_ref()
            .and_then(|m| m.prosody.as_ref())
            .and_then(|p| p.scores.dominant_emotion())
            .map(|(label, _)| label.to_string())
    }
}

/// Role-tagged message content.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageContent {
    pub role: String,
    pub content: String,
}

/// Prosody models container.
#[derive(Debug, Clone, Deserialize)]
pub struct ProsodyModels {
    #[serde(default)]
    pub prosody: Option<ProsodyData>,
}

/// Prosody data container.
#[derive(Debug, Clone, Deserialize)]
pub struct ProsodyData {
    pub scores: ProsodyScores,
}

/// User interruption event.
#[derive(Debug, Clone, Deserialize)]
pub struct UserInterruption {
    #[serde(default)]
    pub time: Option<u64>,
}

/// Assistant message (response text).
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub message: MessageContent,
}

/// Audio output chunk from assistant.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioOutput {
    #[serde(default)]
    pub id: Option<String>,
    /// Base64-encoded WAV file.
    pub data: String,
}

impl AudioOutput {
    pub fn decode_audio(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data)
    }
}

/// End of assistant response.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantEnd {}

/// Tool call request from assistant.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub name: String,
    pub parameters: String,
}

/// Tool error response.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolError {
    pub tool_call_id: String,
    pub error: String,
    #[serde(default)]
    pub code: Option<String>,
}

/// EVI error message.
#[derive(Debug, Clone, Deserialize)]
pub struct EVIError {
    pub code: String,
    pub message: String,
}

/// WebSocket-level error.
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketError {
    #[serde(default)]
    pub code: Option<i32>,
    #[serde(default)]
    pub reason: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
