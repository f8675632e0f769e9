//! Base traits and types for realtime audio-to-audio providers.
//!
//! A provider session is a single WebSocket carrying caller audio up and
//! assistant audio, transcripts and turn lifecycle back down. Each concrete
//! client hides its own wire protocol behind [`BaseRealtime`] and reports
//! everything that happens on the socket as a [`RealtimeEvent`] on the
//! channel returned by [`BaseRealtime::connect`].
//!
//! # Turn-taking
//!
//! - [`TurnTaking::Explicit`]: the gateway decides when the model speaks
//!   (`create_response` / `cancel_response`). OpenAI Realtime.
//! - [`TurnTaking::Auto`]: the provider's own voice detection decides.
//!   Hume EVI. `create_response` only nudges the first turn.
//!
//! # Audio Format
//!
//! Audio crosses this interface as mono PCM16 samples at the provider's
//! native rate ([`BaseRealtime::sample_rate`] for input; every
//! [`RealtimeAudioData`] carries its own rate for output).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Upper bound on session instructions accepted by either provider.
pub const MAX_INSTRUCTIONS_CHARS: usize = 8000;

/// Capacity of the provider event channel handed to the session.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Name of the function tool the model calls to end the call.
pub const END_CALL_TOOL: &str = "end_call";

/// Default provider connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during realtime operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,
}

/// Result type for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;

// =============================================================================
// Configuration Types
// =============================================================================

/// Base configuration for realtime providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    pub api_key: String,

    /// Model to use (e.g., "gpt-4o-realtime-preview"). Ignored by Hume.
    #[serde(default)]
    pub model: String,

    /// Default voice, overridable per session
    #[serde(default)]
    pub voice: Option<String>,

    /// WebSocket endpoint override (mock servers, regional endpoints)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Provider-side configuration id (Hume EVI config)
    #[serde(default)]
    pub config_id: Option<String>,

    /// Caller transcription model for the explicit backend
    #[serde(default)]
    pub transcription_model: Option<String>,

    /// Temperature for response generation
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: String::new(),
            voice: None,
            endpoint: None,
            config_id: None,
            transcription_model: None,
            temperature: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl zeroize::Zeroize for RealtimeConfig {
    fn zeroize(&mut self) {
        self.api_key.zeroize();
    }
}

/// Who decides when the assistant speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnTaking {
    /// Gateway issues response-create / cancel
    Explicit,
    /// Provider VAD drives responses
    Auto,
}

/// Tool definition for function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// The `end_call` tool declared on every session.
    pub fn end_call() -> Self {
        Self {
            name: END_CALL_TOOL.to_string(),
            description: "End the phone call. Call this after saying goodbye, once the \
                          conversation is finished or the caller asks to hang up."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Short reason the call is ending"
                    }
                }
            }),
        }
    }
}

/// Per-call session settings sent after connect.
#[derive(Debug, Clone, Default)]
pub struct SessionSetup {
    /// System instructions (at most [`MAX_INSTRUCTIONS_CHARS`])
    pub instructions: String,
    /// Voice id; falls back to the configured default
    pub voice: Option<String>,
    /// Function tools exposed to the model
    pub tools: Vec<ToolDefinition>,
}

impl SessionSetup {
    pub fn validate(&self) -> RealtimeResult<()> {
        let len = self.instructions.chars().count();
        if len > MAX_INSTRUCTIONS_CHARS {
            return Err(RealtimeError::InvalidConfiguration(format!(
                "instructions are {len} chars, limit is {MAX_INSTRUCTIONS_CHARS}"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Connection state for realtime providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Terminal status of a provider response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Cancelled,
    /// Cut short (token limit, content filter); not an end of turn
    Incomplete,
    Failed,
}

impl ResponseStatus {
    /// Parse a provider status string. Unknown values count as failed.
    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => ResponseStatus::Completed,
            "cancelled" => ResponseStatus::Cancelled,
            "incomplete" => ResponseStatus::Incomplete,
            _ => ResponseStatus::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Completed => "completed",
            ResponseStatus::Cancelled => "cancelled",
            ResponseStatus::Incomplete => "incomplete",
            ResponseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Assistant audio chunk, decoded to PCM16.
#[derive(Debug, Clone)]
pub struct RealtimeAudioData {
    /// Response the chunk belongs to
    pub response_id: String,
    /// Mono samples
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

/// Function call request from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
    /// Response that carried the call
    pub response_id: Option<String>,
}

/// Provider-reported error.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderErrorInfo {
    pub code: String,
    pub message: String,
    /// Response the error is about, when the provider says so
    pub response_id: Option<String>,
}

/// Everything a provider session reports back to the call.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    /// Session settings were applied
    SessionReady { session_id: Option<String> },
    /// Provider VAD heard the caller start speaking
    SpeechStarted,
    /// Provider VAD heard the caller stop speaking
    SpeechStopped,
    /// Caller transcript
    UserTranscript {
        text: String,
        is_final: bool,
        /// Dominant vocal emotion, when the provider analyses prosody
        emotion: Option<String>,
    },
    /// Full assistant transcript of one response
    AssistantTranscript { response_id: String, text: String },
    /// A response started generating
    ResponseCreated { response_id: String },
    /// Assistant audio
    Audio(RealtimeAudioData),
    /// A response finished
    ResponseDone {
        response_id: String,
        status: ResponseStatus,
        reason: Option<String>,
    },
    /// A cancel was a no-op because the response was no longer active
    CancelRejected { response_id: Option<String> },
    /// The model invoked a function tool
    FunctionCall(FunctionCallRequest),
    /// Recoverable provider error
    Error(ProviderErrorInfo),
    /// The socket closed without `disconnect` being called
    Disconnected { reason: String },
}

impl RealtimeEvent {
    /// Short name for logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeEvent::SessionReady { .. } => "session_ready",
            RealtimeEvent::SpeechStarted => "speech_started",
            RealtimeEvent::SpeechStopped => "speech_stopped",
            RealtimeEvent::UserTranscript { .. } => "user_transcript",
            RealtimeEvent::AssistantTranscript { .. } => "assistant_transcript",
            RealtimeEvent::ResponseCreated { .. } => "response_created",
            RealtimeEvent::Audio(_) => "audio",
            RealtimeEvent::ResponseDone { .. } => "response_done",
            RealtimeEvent::CancelRejected { .. } => "cancel_rejected",
            RealtimeEvent::FunctionCall(_) => "function_call",
            RealtimeEvent::Error(_) => "error",
            RealtimeEvent::Disconnected { .. } => "disconnected",
        }
    }
}

// =============================================================================
// Base Trait
// =============================================================================

/// Base trait for realtime audio-to-audio providers.
///
/// `connect` needs exclusive access; every other operation takes `&self` so a
/// connected client can be shared between the uplink and control tasks.
///
/// # Example
///
/// ```rust,ignore
/// use callvox_gateway::core::realtime::{BaseRealtime, OpenAIRealtime, RealtimeConfig};
///
/// let mut client = OpenAIRealtime::new(RealtimeConfig {
///     api_key: "sk-...".to_string(),
///     ..Default::default()
/// })?;
/// let mut events = client.connect().await?;
/// client.configure_session(&setup).await?;
/// client.create_response().await?;
/// while let Some(event) = events.recv().await {
///     // ...
/// }
/// ```
#[async_trait]
pub trait BaseRealtime: Send + Sync {
    fn new(config: RealtimeConfig) -> RealtimeResult<Self>
    where
        Self: Sized;

    /// Open the provider socket and start the event loop.
    async fn connect(&mut self) -> RealtimeResult<mpsc::Receiver<RealtimeEvent>>;

    /// Close the socket. No `Disconnected` event is emitted.
    async fn disconnect(&self) -> RealtimeResult<()>;

    fn is_ready(&self) -> bool;

    fn get_connection_state(&self) -> ConnectionState;

    /// Turn-taking model of this backend.
    fn turn_taking(&self) -> TurnTaking;

    /// Native input sample rate.
    fn sample_rate(&self) -> u32;

    /// Provider name for logs.
    fn provider_name(&self) -> &'static str;

    // -------------------------------------------------------------------------
    // Session Control
    // -------------------------------------------------------------------------

    /// Apply instructions, voice and tools.
    async fn configure_session(&self, setup: &SessionSetup) -> RealtimeResult<()>;

    /// Send caller audio at [`sample_rate`](BaseRealtime::sample_rate).
    async fn send_audio(&self, samples: &[i16]) -> RealtimeResult<()>;

    async fn send_text(&self, text: &str) -> RealtimeResult<()>;

    /// Ask the model to speak.
    async fn create_response(&self) -> RealtimeResult<()>;

    /// Cancel the given response.
    /// The outcome arrives as `ResponseDone { status: Cancelled }` when the
    /// cancel took effect or `CancelRejected` when it was a no-op.
    async fn cancel_response(&self, response_id: &str) -> RealtimeResult<()>;

    /// Submit a function call result without triggering a new response.
    async fn submit_function_result(&self, call_id: &str, output: &str) -> RealtimeResult<()>;
}
