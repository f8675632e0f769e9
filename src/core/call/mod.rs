//! Call orchestration.
//!
//! - [`state`]: call states, legal transitions, session record
//! - [`barge_in`]: six-gate interruption coordinator
//! - [`dispatcher`]: single-flight response dispatch and utterance dedup
//! - [`engine`]: synchronous per-call state machine tying the above together
//! - [`session`]: async actor running one call against a provider
//! - [`watchdog`]: task supervision and diagnostic snapshots
//! - [`registry`]: process-wide map of live calls

pub mod barge_in;
pub mod dispatcher;
pub mod engine;
pub mod prompt;
pub mod registry;
pub mod session;
pub mod state;
pub mod timing;
pub mod watchdog;

pub use barge_in::{BargeInCoordinator, BargeInDecision, BargeInEvent, BargeInGate, BargeInSource};
pub use dispatcher::{ResponseDispatcher, ResponseReason, ResponseTurn, TurnStatus};
pub use engine::{CallAction, CallEngine, CallInput, EngineDiagnostics, Speaker, TranscriptEntry};
pub use prompt::{ComposedPrompt, PromptBundle, PromptError};
pub use registry::{CallRegistry, CallSummary};
pub use session::{
    CallHandle, CallOutcome, CallServices, PipelineConfig, TransportCommand, render_transcript,
    spawn_call,
};
pub use state::{CallDirection, CallMetadata, CallSession, CallState, CloseReason};
pub use timing::CallTimingConfig;

use thiserror::Error;

use crate::core::audio::AudioError;
use crate::core::realtime::{RealtimeError, RealtimeProvider};
use crate::core::stores::StoreError;

/// Errors that stop a call from starting.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Provider {0} is not configured")]
    ProviderNotConfigured(RealtimeProvider),

    #[error("Call {0} is already active")]
    DuplicateCall(String),

    #[error("Provider error: {0}")]
    Realtime(#[from] RealtimeError),

    #[error("Prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
}

pub type CallResult<T> = Result<T, CallError>;
