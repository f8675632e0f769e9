//! Realtime audio-to-audio provider module.
//!
//! # Supported Providers
//!
//! - **OpenAI Realtime API** - explicit turn-taking, gateway-driven responses
//! - **Hume EVI** - automatic turn-taking with prosody analysis
//!
//! # Architecture
//!
//! - `BaseRealtime` trait for the provider contract
//! - `RealtimeClient` enum resolved once per call from configuration
//! - Events delivered on the `mpsc` channel returned by `connect`
//!
//! A provider is never substituted for another: a missing key or failed
//! connect is returned to the caller as an error.
//!
//! # Example
//!
//! ```rust,ignore
//! use callvox_gateway::core::realtime::{create_realtime_client, RealtimeConfig, RealtimeProvider};
//!
//! let mut client = create_realtime_client(RealtimeProvider::OpenAI, RealtimeConfig {
//!     api_key: "sk-...".to_string(),
//!     ..Default::default()
//! })?;
//! let mut events = client.connect().await?;
//! ```

mod base;
pub mod hume;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use base::{
    BaseRealtime, ConnectionState, DEFAULT_CONNECT_TIMEOUT_MS, END_CALL_TOOL,
    EVENT_CHANNEL_CAPACITY, FunctionCallRequest, MAX_INSTRUCTIONS_CHARS, ProviderErrorInfo,
    RealtimeAudioData, RealtimeConfig, RealtimeError, RealtimeEvent, RealtimeResult,
    ResponseStatus, SessionSetup, ToolDefinition, TurnTaking,
};
pub use hume::{EVIVersion, HumeEVI, HumeEVIConfig};
pub use openai::{OPENAI_REALTIME_SAMPLE_RATE, OpenAIRealtime, OpenAIRealtimeVoice};

/// Supported realtime providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RealtimeProvider {
    /// OpenAI Realtime API
    OpenAI,
    /// Hume EVI (Empathic Voice Interface)
    Hume,
}

impl RealtimeProvider {
    /// Parse provider from string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Some(RealtimeProvider::OpenAI),
            "hume" | "hume_evi" | "hume-evi" | "evi" => Some(RealtimeProvider::Hume),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RealtimeProvider::OpenAI => "openai",
            RealtimeProvider::Hume => "hume",
        }
    }
}

impl std::fmt::Display for RealtimeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Realtime Client
// =============================================================================

/// A connected-or-connectable provider client of either kind.
pub enum RealtimeClient {
    OpenAI(OpenAIRealtime),
    Hume(HumeEVI),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $call:expr) => {
        match $self {
            RealtimeClient::OpenAI($inner) => $call,
            RealtimeClient::Hume($inner) => $call,
        }
    };
}

impl RealtimeClient {
    pub fn provider(&self) -> RealtimeProvider {
        match self {
            RealtimeClient::OpenAI(_) => RealtimeProvider::OpenAI,
            RealtimeClient::Hume(_) => RealtimeProvider::Hume,
        }
    }
}

#[async_trait]
impl BaseRealtime for RealtimeClient {
    /// Builds the OpenAI variant; use [`create_realtime_client`] to choose.
    fn new(config: RealtimeConfig) -> RealtimeResult<Self> {
        OpenAIRealtime::new(config).map(RealtimeClient::OpenAI)
    }

    async fn connect(&mut self) -> RealtimeResult<mpsc::Receiver<RealtimeEvent>> {
        delegate!(self, c => c.connect().await)
    }

    async fn disconnect(&self) -> RealtimeResult<()> {
        delegate!(self, c => c.disconnect().await)
    }

    fn is_ready(&self) -> bool {
        delegate!(self, c => c.is_ready())
    }

    fn get_connection_state(&self) -> ConnectionState {
        delegate!(self, c => c.get_connection_state())
    }

    fn turn_taking(&self) -> TurnTaking {
        delegate!(self, c => c.turn_taking())
    }

    fn sample_rate(&self) -> u32 {
        delegate!(self, c => c.sample_rate())
    }

    fn provider_name(&self) -> &'static str {
        delegate!(self, c => c.provider_name())
    }

    async fn configure_session(&self, setup: &SessionSetup) -> RealtimeResult<()> {
        delegate!(self, c => c.configure_session(setup).await)
    }

    async fn send_audio(&self, samples: &[i16]) -> RealtimeResult<()> {
        delegate!(self, c => c.send_audio(samples).await)
    }

    async fn send_text(&self, text: &str) -> RealtimeResult<()> {
        delegate!(self, c => c.send_text(text).await)
    }

    async fn create_response(&self) -> RealtimeResult<()> {
        delegate!(self, c => c.create_response().await)
    }

    async fn cancel_response(&self, response_id: &str) -> RealtimeResult<()> {
        delegate!(self, c => c.cancel_response(response_id).await)
    }

    async fn submit_function_result(&self, call_id: &str, output: &str) -> RealtimeResult<()> {
        delegate!(self, c => c.submit_function_result(call_id, output).await)
    }
}

/// Create the client for `provider`.
pub fn create_realtime_client(
    provider: RealtimeProvider,
    config: RealtimeConfig,
) -> RealtimeResult<RealtimeClient> {
    match provider {
        RealtimeProvider::OpenAI => OpenAIRealtime::new(config).map(RealtimeClient::OpenAI),
        RealtimeProvider::Hume => HumeEVI::new(config).map(RealtimeClient::Hume),
    }
}

/// Get list of supported realtime providers.
pub fn get_supported_realtime_providers() -> Vec<&'static str> {
    vec!["openai", "hume"]
}
