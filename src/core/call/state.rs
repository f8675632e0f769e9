//! Call state machine types.

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::core::realtime::RealtimeProvider;

/// Lifecycle of one call.
///
/// ```text
/// INIT → CONNECTING_AI → [WAITING_HUMAN_CONFIRM] → GREETING → LISTEN ⇄ AI_SPEAKING → CLOSING → TERMINATED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Init,
    ConnectingAi,
    /// Outbound only: no response may be requested yet
    WaitingHumanConfirm,
    Greeting,
    Listen,
    AiSpeaking,
    Closing,
    Terminated,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Init => "INIT",
            CallState::ConnectingAi => "CONNECTING_AI",
            CallState::WaitingHumanConfirm => "WAITING_HUMAN_CONFIRM",
            CallState::Greeting => "GREETING",
            CallState::Listen => "LISTEN",
            CallState::AiSpeaking => "AI_SPEAKING",
            CallState::Closing => "CLOSING",
            CallState::Terminated => "TERMINATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Terminated)
    }

    /// States in which the conversation is live and silence is measured.
    pub fn is_conversational(&self) -> bool {
        matches!(
            self,
            CallState::Greeting | CallState::Listen | CallState::AiSpeaking | CallState::Closing
        )
    }

    /// Whether `self → next` is a legal transition for a call in `direction`.
    pub fn can_transition_to(&self, next: CallState, direction: CallDirection) -> bool {
        use CallState::*;
        if *self == Terminated {
            return false;
        }
        if next == Terminated {
            return true;
        }
        match (self, next) {
            (Init, ConnectingAi | Closing) => true,
            (ConnectingAi, WaitingHumanConfirm) => direction == CallDirection::Outbound,
            (ConnectingAi, Greeting | Closing) => true,
            (WaitingHumanConfirm, Greeting | Closing) => true,
            (Greeting, AiSpeaking | Listen | Closing) => true,
            (Listen, AiSpeaking | Closing) => true,
            (AiSpeaking, Listen | Closing) => true,
            // A cancelled or incomplete hangup response reopens the conversation
            (Closing, Listen | AiSpeaking) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who placed the call. Set once from the transport `start` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    #[default]
    Inbound,
    Outbound,
}

impl CallDirection {
    /// Unknown values are treated as inbound.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "outbound" | "outbound-api" | "outbound-dial" => CallDirection::Outbound,
            _ => CallDirection::Inbound,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
        }
    }
}

/// Why a call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The model invoked `end_call`
    EndCall,
    SilenceTimeout,
    NoHumanDetected,
    ProviderDisconnected,
    /// The caller or carrier closed the stream
    TransportClosed,
    SetupFailed(String),
    TaskPanicked(String),
    ServerShutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::EndCall => "end_call",
            CloseReason::SilenceTimeout => "silence_timeout",
            CloseReason::NoHumanDetected => "no_human_detected",
            CloseReason::ProviderDisconnected => "provider_disconnected",
            CloseReason::TransportClosed => "transport_closed",
            CloseReason::SetupFailed(_) => "setup_failed",
            CloseReason::TaskPanicked(_) => "task_panicked",
            CloseReason::ServerShutdown => "server_shutdown",
        }
    }

    /// Closures that are part of a normal call and log at info.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            CloseReason::EndCall
                | CloseReason::SilenceTimeout
                | CloseReason::NoHumanDetected
                | CloseReason::TransportClosed
                | CloseReason::ServerShutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::SetupFailed(detail) | CloseReason::TaskPanicked(detail) => {
                write!(f, "{}: {}", self.as_str(), detail)
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Call metadata from the transport `start` frame.
#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    pub call_id: String,
    pub stream_sid: String,
    pub direction: CallDirection,
    pub business_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    /// Per-call provider override
    pub provider: Option<RealtimeProvider>,
}

/// One call, owned by its session.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub stream_sid: String,
    direction: CallDirection,
    state: CallState,
    human_confirmed: bool,
    pub provider: RealtimeProvider,
    pub voice: Option<String>,
    pub business_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub close_reason: Option<CloseReason>,
}

impl CallSession {
    pub fn new(meta: CallMetadata, provider: RealtimeProvider) -> Self {
        Self {
            call_id: meta.call_id,
            stream_sid: meta.stream_sid,
            direction: meta.direction,
            state: CallState::Init,
            human_confirmed: false,
            provider,
            voice: None,
            business_id: meta.business_id,
            from: meta.from,
            to: meta.to,
            started_at: OffsetDateTime::now_utc(),
            ended_at: None,
            close_reason: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn human_confirmed(&self) -> bool {
        self.human_confirmed
    }

    /// Apply a transition; illegal ones are logged and ignored.
    pub fn transition(&mut self, next: CallState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next, self.direction) {
            warn!(
                call_id = %self.call_id,
                from = %self.state,
                to = %next,
                "Ignoring illegal call state transition"
            );
            return false;
        }
        info!(call_id = %self.call_id, from = %self.state, to = %next, "Call state transition");
        self.state = next;
        if next == CallState::Terminated {
            self.ended_at = Some(OffsetDateTime::now_utc());
        }
        true
    }

    /// Record that a human answered. Returns false if already confirmed.
    pub fn confirm_human(&mut self) -> bool {
        if self.human_confirmed {
            return false;
        }
        self.human_confirmed = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(direction: CallDirection) -> CallSession {
        CallSession::new(
            CallMetadata {
                call_id: "CA1".to_string(),
                direction,
                ..Default::default()
            },
            RealtimeProvider::OpenAI,
        )
    }

    #[test]
    fn test_happy_path_inbound() {
        let mut s = session(CallDirection::Inbound);
        for next in [
            CallState::ConnectingAi,
            CallState::Greeting,
            CallState::AiSpeaking,
            CallState::Listen,
            CallState::AiSpeaking,
            CallState::Closing,
            CallState::Terminated,
        ] {
            assert!(s.transition(next), "transition to {next}");
        }
        assert!(s.ended_at.is_some());
    }

    #[test]
    fn test_waiting_human_is_outbound_only() {
        let mut s = session(CallDirection::Inbound);
        s.transition(CallState::ConnectingAi);
        assert!(!s.transition(CallState::WaitingHumanConfirm));
        assert_eq!(s.state(), CallState::ConnectingAi);

        let mut s = session(CallDirection::Outbound);
        s.transition(CallState::ConnectingAi);
        assert!(s.transition(CallState::WaitingHumanConfirm));
        assert!(!s.transition(CallState::Listen));
        assert!(s.transition(CallState::Greeting));
    }

    #[test]
    fn test_terminated_is_final() {
        let mut s = session(CallDirection::Inbound);
        assert!(s.transition(CallState::Terminated));
        assert!(!s.transition(CallState::Listen));
        assert!(!s.transition(CallState::Closing));
    }

    #[test]
    fn test_closing_can_reopen() {
        assert!(CallState::Closing.can_transition_to(CallState::Listen, CallDirection::Inbound));
        assert!(!CallState::Closing.can_transition_to(CallState::Greeting, CallDirection::Inbound));
    }

    #[test]
    fn test_human_confirm_flips_once() {
        let mut s = session(CallDirection::Outbound);
        assert!(!s.human_confirmed());
        assert!(s.confirm_human());
        assert!(!s.confirm_human());
        assert!(s.human_confirmed());
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!(CallDirection::parse("outbound-api"), CallDirection::Outbound);
        assert_eq!(CallDirection::parse("OUTBOUND"), CallDirection::Outbound);
        assert_eq!(CallDirection::parse("inbound"), CallDirection::Inbound);
        assert_eq!(CallDirection::parse(""), CallDirection::Inbound);
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::SilenceTimeout.to_string(), "silence_timeout");
        assert_eq!(
            CloseReason::SetupFailed("no key".to_string()).to_string(),
            "setup_failed: no key"
        );
        assert!(!CloseReason::ProviderDisconnected.is_expected());
    }
}
