//! Call engine.
//!
//! A synchronous state machine that owns one call's conversational state.
//! The session actor feeds it [`CallInput`]s with the current time and
//! executes the [`CallAction`]s it returns. The engine never awaits, sleeps
//! or touches a socket, so every timing rule can be driven by a synthetic
//! clock in tests.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::barge_in::{
    AiActivity, BargeInCandidate, BargeInCoordinator, BargeInEvent, BargeInSource,
};
use super::dispatcher::{DispatchDecision, ResponseDispatcher, ResponseReason, TurnStatus};
use super::state::{CallDirection, CallSession, CallState, CloseReason};
use super::timing::CallTimingConfig;
use crate::core::audio::{AudioFrame, DropCounters, DropReason, FRAME_DURATION_MS};
use crate::core::realtime::{
    END_CALL_TOOL, FunctionCallRequest, RealtimeEvent, ResponseStatus, TurnTaking,
};
use crate::core::vad::VADResult;

/// Finished or cancelled response ids whose late audio is dropped.
const RETIRED_IDS_LIMIT: usize = 16;

/// Barge-in evaluations kept for diagnostics.
const BARGE_IN_LOG_LIMIT: usize = 64;

// =============================================================================
// Inputs and Actions
// =============================================================================

/// Something that happened to the call.
#[derive(Debug)]
pub enum CallInput {
    /// Provider connected and prompt loaded
    SetupComplete {
        /// Full prompt to send once the greeting ends, when the session was
        /// configured with the compact one
        upgrade_instructions: Option<String>,
    },
    SetupFailed { reason: String },
    /// One caller frame with its local VAD result
    CallerAudio { frame: AudioFrame, vad: VADResult },
    Provider(RealtimeEvent),
    /// Periodic timer for watchdogs and playout tracking
    Tick,
    /// The telephony side went away
    TransportClosed,
    TaskPanicked { task: String, message: String },
}

/// Something the session must do.
#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    ForwardCallerAudio(AudioFrame),
    CreateResponse,
    CancelResponse { response_id: String },
    /// Drop everything queued for the caller and clear the carrier buffer
    FlushEgress,
    PlayAudio {
        response_id: String,
        samples: Vec<i16>,
        sample_rate: u32,
    },
    UpdateSession { instructions: String },
    SubmitFunctionResult { call_id: String, output: String },
    /// First-audio watchdog fired
    LogDiagnostics {
        response_id: Option<String>,
        waited_ms: u64,
    },
    Hangup { reason: CloseReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Caller,
    Assistant,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    /// Milliseconds since the call started
    pub offset_ms: u64,
}

/// Point-in-time view of the engine, logged by the first-audio watchdog.
#[derive(Debug, Clone, Serialize)]
pub struct EngineDiagnostics {
    pub state: CallState,
    pub in_flight: Option<String>,
    pub in_flight_status: Option<TurnStatus>,
    pub active_response: Option<String>,
    pub last_provider_event: Option<&'static str>,
    pub last_provider_event_age_ms: Option<u64>,
    pub last_ai_audio_age_ms: Option<u64>,
    pub last_caller_voice_age_ms: Option<u64>,
    pub playout_remaining_ms: u64,
}

#[derive(Debug, Clone)]
struct PendingCancel {
    response_id: String,
    deadline: Instant,
}

#[derive(Debug, Clone)]
struct FirstAudioWatch {
    response_id: Option<String>,
    since: Instant,
    fired: bool,
}

#[derive(Debug, Clone)]
struct PendingHangup {
    /// Response that carried `end_call`
    response_id: Option<String>,
    /// That response completed; hang up once playout drains
    ready: bool,
}

/// Wire frames the given audio occupies, at least one.
fn frames_for(samples: usize, sample_rate: u32) -> u64 {
    let ms = samples as u64 * 1000 / sample_rate.max(1) as u64;
    ms.div_ceil(FRAME_DURATION_MS as u64).max(1)
}

fn age_ms(now: Instant, then: Option<Instant>) -> Option<u64> {
    then.map(|t| now.saturating_duration_since(t).as_millis() as u64)
}

// =============================================================================
// Engine
// =============================================================================

pub struct CallEngine {
    session: CallSession,
    timing: CallTimingConfig,
    turn_taking: TurnTaking,
    barge_in: BargeInCoordinator,
    dispatcher: ResponseDispatcher,
    drops: Arc<DropCounters>,
    transcript: Vec<TranscriptEntry>,
    started: Instant,

    setup_done: bool,
    waiting_human_since: Option<Instant>,
    greeting_requested: bool,
    greeting_response: Option<String>,
    upgrade_instructions: Option<String>,

    /// Provider response currently generating
    active_response: Option<String>,
    active_has_audio: bool,
    retired: VecDeque<String>,
    ai_turn_started_at: Option<Instant>,
    last_ai_audio_at: Option<Instant>,
    /// When the audio handed to egress finishes playing
    playout_until: Option<Instant>,
    pending_cancel: Option<PendingCancel>,
    first_audio: Option<FirstAudioWatch>,
    pending_hangup: Option<PendingHangup>,
    hangup_issued: bool,

    /// Current local speech segment length, 0 outside a segment
    caller_speech_ms: u64,
    /// Onset of the latest local speech segment
    segment_started_at: Option<Instant>,
    /// A barge-in was confirmed for the latest segment
    segment_interrupted: bool,
    last_caller_voice_at: Option<Instant>,
    /// Start of the window in which dual silence is measured
    silence_epoch: Instant,

    last_provider_event: Option<(&'static str, Instant)>,
    barge_in_log: VecDeque<BargeInEvent>,
}

impl CallEngine {
    pub fn new(
        session: CallSession,
        timing: CallTimingConfig,
        turn_taking: TurnTaking,
        drops: Arc<DropCounters>,
        now: Instant,
    ) -> Self {
        Self {
            barge_in: BargeInCoordinator::new(&timing),
            dispatcher: ResponseDispatcher::new(&timing, now),
            session,
            timing,
            turn_taking,
            drops,
            transcript: Vec::new(),
            started: now,
            setup_done: false,
            waiting_human_since: None,
            greeting_requested: false,
            greeting_response: None,
            upgrade_instructions: None,
            active_response: None,
            active_has_audio: false,
            retired: VecDeque::with_capacity(RETIRED_IDS_LIMIT),
            ai_turn_started_at: None,
            last_ai_audio_at: None,
            playout_until: None,
            pending_cancel: None,
            first_audio: None,
            pending_hangup: None,
            hangup_issued: false,
            caller_speech_ms: 0,
            segment_started_at: None,
            segment_interrupted: false,
            last_caller_voice_at: None,
            silence_epoch: now,
            last_provider_event: None,
            barge_in_log: VecDeque::with_capacity(BARGE_IN_LOG_LIMIT),
        }
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn state(&self) -> CallState {
        self.session.state()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn drops(&self) -> &Arc<DropCounters> {
        &self.drops
    }

    pub fn dispatcher(&self) -> &ResponseDispatcher {
        &self.dispatcher
    }

    /// Most recent barge-in evaluations, oldest first.
    pub fn barge_in_events(&self) -> &VecDeque<BargeInEvent> {
        &self.barge_in_log
    }

    /// AI audio is being generated or is still playing to the caller.
    pub fn ai_speaking(&self, now: Instant) -> bool {
        (self.active_response.is_some() && self.active_has_audio)
            || self.playout_until.is_some_and(|t| now < t)
    }

    pub fn diagnostics(&self, now: Instant) -> EngineDiagnostics {
        EngineDiagnostics {
            state: self.state(),
            in_flight: self.dispatcher.in_flight().and_then(|t| t.id.clone()),
            in_flight_status: self.dispatcher.in_flight().map(|t| t.status),
            active_response: self.active_response.clone(),
            last_provider_event: self.last_provider_event.map(|(k, _)| k),
            last_provider_event_age_ms: age_ms(now, self.last_provider_event.map(|(_, t)| t)),
            last_ai_audio_age_ms: age_ms(now, self.last_ai_audio_at),
            last_caller_voice_age_ms: age_ms(now, self.last_caller_voice_at),
            playout_remaining_ms: self
                .playout_until
                .map(|t| t.saturating_duration_since(now).as_millis() as u64)
                .unwrap_or(0),
        }
    }

    /// INIT → CONNECTING_AI.
    pub fn begin_setup(&mut self) {
        self.session.transition(CallState::ConnectingAi);
    }

    /// Record the final state after teardown.
    pub fn terminate(&mut self, reason: CloseReason) {
        if self.session.close_reason.is_none() {
            self.session.close_reason = Some(reason);
        }
        self.session.transition(CallState::Terminated);
    }

    pub fn set_voice(&mut self, voice: Option<String>) {
        self.session.voice = voice;
    }

    /// Feed one input and collect the resulting actions.
    pub fn handle(&mut self, input: CallInput, now: Instant) -> Vec<CallAction> {
        let mut out = Vec::new();
        if self.state().is_terminal() {
            return out;
        }
        match input {
            CallInput::SetupComplete {
                upgrade_instructions,
            } => self.on_setup_complete(upgrade_instructions, now, &mut out),
            CallInput::SetupFailed { reason } => {
                warn!(call_id = %self.session.call_id, %reason, "Call setup failed");
                self.hangup(CloseReason::SetupFailed(reason), &mut out);
            }
            CallInput::CallerAudio { frame, vad } => {
                self.on_caller_audio(frame, vad, now, &mut out)
            }
            CallInput::Provider(event) => self.on_provider_event(event, now, &mut out),
            CallInput::Tick => self.on_tick(now, &mut out),
            CallInput::TransportClosed => {
                info!(call_id = %self.session.call_id, "Telephony stream closed");
                self.hangup(CloseReason::TransportClosed, &mut out);
            }
            CallInput::TaskPanicked { task, message } => {
                self.hangup(
                    CloseReason::TaskPanicked(format!("{task}: {message}")),
                    &mut out,
                );
            }
        }
        out
    }

    fn hangup(&mut self, reason: CloseReason, out: &mut Vec<CallAction>) {
        if self.hangup_issued {
            return;
        }
        self.hangup_issued = true;
        self.session.transition(CallState::Closing);
        if self.session.close_reason.is_none() {
            self.session.close_reason = Some(reason.clone());
        }
        out.push(CallAction::Hangup { reason });
    }

    // -------------------------------------------------------------------------
    // Setup and responses
    // -------------------------------------------------------------------------

    fn on_setup_complete(
        &mut self,
        upgrade_instructions: Option<String>,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        if self.setup_done {
            return;
        }
        self.setup_done = true;
        self.upgrade_instructions = upgrade_instructions;

        match self.session.direction() {
            CallDirection::Inbound => self.start_greeting(now, out),
            CallDirection::Outbound => {
                self.session.transition(CallState::WaitingHumanConfirm);
                self.waiting_human_since = Some(now);
            }
        }
    }

    fn start_greeting(&mut self, now: Instant, out: &mut Vec<CallAction>) {
        if self.greeting_requested || !self.session.transition(CallState::Greeting) {
            return;
        }
        self.silence_epoch = now;
        self.greeting_requested = true;
        self.request_response(ResponseReason::Greeting, now, out);
    }

    fn request_response(
        &mut self,
        reason: ResponseReason,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        let decision = self.dispatcher.request(reason, now);
        if decision == DispatchDecision::StaleRecovery {
            self.retire_active();
        }
        if decision.should_send() {
            debug!(call_id = %self.session.call_id, ?reason, "Requesting response");
            self.first_audio = Some(FirstAudioWatch {
                response_id: None,
                since: now,
                fired: false,
            });
            out.push(CallAction::CreateResponse);
        }
    }

    fn retire(&mut self, id: String) {
        if self.retired.contains(&id) {
            return;
        }
        if self.retired.len() == RETIRED_IDS_LIMIT {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
    }

    fn retire_active(&mut self) -> Option<String> {
        let id = self.active_response.take()?;
        self.active_has_audio = false;
        self.retire(id.clone());
        Some(id)
    }

    // -------------------------------------------------------------------------
    // Caller audio
    // -------------------------------------------------------------------------

    fn on_caller_audio(
        &mut self,
        frame: AudioFrame,
        vad: VADResult,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        if !self.setup_done {
            self.drops.record(DropReason::ProviderNotReady, 1);
            return;
        }

        if vad.speech_start || (vad.is_speech && self.caller_speech_ms == 0) {
            let onset = now
                .checked_sub(Duration::from_millis(vad.speech_duration_ms as u64))
                .unwrap_or(now);
            self.segment_started_at = Some(onset);
            self.segment_interrupted = false;
        }
        if vad.is_speech {
            self.last_caller_voice_at = Some(now);
            self.caller_speech_ms = vad.speech_duration_ms as u64;
        } else if vad.speech_end || vad.speech_duration_ms == 0 {
            self.caller_speech_ms = 0;
        }

        if self.state() == CallState::WaitingHumanConfirm {
            // Withheld until a person is confirmed, including the confirming frame
            self.drops.record(DropReason::AwaitingHuman, 1);
            if vad.is_speech
                && vad.speech_duration_ms as u64 >= self.timing.human_confirm_speech_ms
                && self.session.confirm_human()
            {
                info!(
                    call_id = %self.session.call_id,
                    speech_ms = vad.speech_duration_ms,
                    "Human confirmed on outbound call"
                );
                self.start_greeting(now, out);
            }
            return;
        }

        out.push(CallAction::ForwardCallerAudio(frame));

        if vad.is_speech && self.barge_in_candidate_allowed(now) {
            self.evaluate_barge_in(BargeInSource::LocalVad, now, out);
        }
    }

    fn barge_in_candidate_allowed(&self, now: Instant) -> bool {
        !self.segment_interrupted
            && matches!(
                self.state(),
                CallState::Greeting | CallState::Listen | CallState::AiSpeaking
            )
            && self.ai_speaking(now)
    }

    // -------------------------------------------------------------------------
    // Barge-in
    // -------------------------------------------------------------------------

    fn evaluate_barge_in(
        &mut self,
        source: BargeInSource,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        let speech_ms = match source {
            BargeInSource::LocalVad => self.caller_speech_ms,
            // Provider signals trail the audio; age them from the local onset
            BargeInSource::ProviderSpeechStarted | BargeInSource::Transcript => {
                age_ms(now, self.segment_started_at).unwrap_or(0)
            }
        };
        let ai = AiActivity {
            speaking: self.ai_speaking(now),
            turn_started_at: self.ai_turn_started_at,
            last_audio_at: self.last_ai_audio_at,
        };
        let event = self
            .barge_in
            .evaluate(BargeInCandidate { source, speech_ms }, ai, now);
        let confirmed = event.is_confirmed();
        if self.barge_in_log.len() == BARGE_IN_LOG_LIMIT {
            self.barge_in_log.pop_front();
        }
        self.barge_in_log.push_back(event);
        if confirmed {
            self.on_barge_in_confirmed(source, now, out);
        }
    }

    fn on_barge_in_confirmed(
        &mut self,
        source: BargeInSource,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        info!(
            call_id = %self.session.call_id,
            source = source.as_str(),
            active = ?self.active_response,
            "Barge-in confirmed"
        );
        self.segment_interrupted = true;
        self.dispatcher.release(now);

        // Audio still arriving for the cancelled id is stale from here on
        match self.retire_active() {
            Some(id) => {
                self.pending_cancel = Some(PendingCancel {
                    response_id: id.clone(),
                    deadline: now + CallTimingConfig::ms(self.timing.cancel_ack_timeout_ms),
                });
                out.push(CallAction::CancelResponse { response_id: id });
            }
            // Generation already finished; only queued playout remains
            None => self.flush(out),
        }

        self.first_audio = None;
        self.session.transition(CallState::Listen);
    }

    fn flush(&mut self, out: &mut Vec<CallAction>) {
        self.playout_until = None;
        self.ai_turn_started_at = None;
        out.push(CallAction::FlushEgress);
    }

    // -------------------------------------------------------------------------
    // Provider events
    // -------------------------------------------------------------------------

    fn on_provider_event(
        &mut self,
        event: RealtimeEvent,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        self.last_provider_event = Some((event.kind(), now));
        match event {
            RealtimeEvent::SessionReady { session_id } => {
                debug!(call_id = %self.session.call_id, ?session_id, "Provider session ready");
            }
            RealtimeEvent::SpeechStarted => {
                if self.barge_in_candidate_allowed(now) {
                    self.evaluate_barge_in(BargeInSource::ProviderSpeechStarted, now, out);
                }
            }
            RealtimeEvent::SpeechStopped => {
                if self.turn_taking == TurnTaking::Explicit && self.setup_done {
                    self.dispatcher.on_user_turn_ended(now);
                }
            }
            RealtimeEvent::UserTranscript {
                text,
                is_final,
                emotion,
            } => {
                if is_final {
                    self.on_user_transcript(text, emotion, now, out);
                }
            }
            RealtimeEvent::AssistantTranscript { response_id, text } => {
                debug!(call_id = %self.session.call_id, %response_id, "Assistant: {}", text);
                self.push_transcript(Speaker::Assistant, &text, None, now);
            }
            RealtimeEvent::ResponseCreated { response_id } => {
                self.on_response_created(response_id, now)
            }
            RealtimeEvent::Audio(audio) => {
                self.on_ai_audio(audio.response_id, audio.samples, audio.sample_rate, now, out)
            }
            RealtimeEvent::ResponseDone {
                response_id,
                status,
                reason,
            } => self.on_response_done(response_id, status, reason, now, out),
            RealtimeEvent::CancelRejected { response_id } => {
                let matches = self.pending_cancel.as_ref().is_some_and(|p| {
                    response_id
                        .as_deref()
                        .is_none_or(|id| id == p.response_id)
                });
                if matches {
                    info!(
                        call_id = %self.session.call_id,
                        ?response_id,
                        "Cancel was a no-op, keeping egress"
                    );
                    self.pending_cancel = None;
                }
            }
            RealtimeEvent::FunctionCall(call) => self.on_function_call(call, now, out),
            RealtimeEvent::Error(info) => {
                warn!(
                    call_id = %self.session.call_id,
                    code = %info.code,
                    response_id = ?info.response_id,
                    "Provider error: {}",
                    info.message
                );
                self.on_provider_error(info.response_id, now, out);
            }
            RealtimeEvent::Disconnected { reason } => {
                warn!(call_id = %self.session.call_id, %reason, "Provider disconnected");
                self.hangup(CloseReason::ProviderDisconnected, out);
            }
        }
    }

    fn push_transcript(
        &mut self,
        speaker: Speaker,
        text: &str,
        emotion: Option<String>,
        now: Instant,
    ) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.transcript.push(TranscriptEntry {
            speaker,
            text: text.to_string(),
            emotion,
            offset_ms: now.saturating_duration_since(self.started).as_millis() as u64,
        });
    }

    fn on_user_transcript(
        &mut self,
        text: String,
        emotion: Option<String>,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        debug!(call_id = %self.session.call_id, ?emotion, "Caller: {}", text);
        self.push_transcript(Speaker::Caller, &text, emotion, now);

        if self.barge_in_candidate_allowed(now) {
            self.evaluate_barge_in(BargeInSource::Transcript, now, out);
        }

        let is_new = self.dispatcher.check_utterance(&text, now);
        if self.turn_taking == TurnTaking::Explicit
            && is_new
            && self.state() == CallState::Listen
            && !self.ai_speaking(now)
        {
            self.request_response(ResponseReason::UserTurn, now, out);
        }
    }

    fn on_response_created(&mut self, response_id: String, now: Instant) {
        debug!(call_id = %self.session.call_id, %response_id, "Response created");
        self.dispatcher.on_response_created(&response_id, now);

        if self.greeting_requested && self.greeting_response.is_none() {
            self.greeting_response = Some(response_id.clone());
        }

        let attach = self
            .first_audio
            .as_ref()
            .is_some_and(|w| w.response_id.is_none());
        if attach {
            if let Some(watch) = self.first_audio.as_mut() {
                watch.response_id = Some(response_id.clone());
            }
        } else {
            self.first_audio = Some(FirstAudioWatch {
                response_id: Some(response_id.clone()),
                since: now,
                fired: false,
            });
        }

        if self.active_response.as_deref() != Some(response_id.as_str()) {
            self.retire_active();
            self.active_response = Some(response_id);
        }
    }

    fn is_stale(&self, response_id: &str) -> bool {
        self.retired.iter().any(|r| r == response_id)
            || self
                .active_response
                .as_deref()
                .is_some_and(|active| active != response_id)
    }

    fn on_ai_audio(
        &mut self,
        response_id: String,
        samples: Vec<i16>,
        sample_rate: u32,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        if samples.is_empty() {
            return;
        }
        let frames = frames_for(samples.len(), sample_rate);
        if self.state() == CallState::WaitingHumanConfirm {
            self.drops.record(DropReason::AwaitingHuman, frames);
            return;
        }
        if self.is_stale(&response_id) {
            self.drops.record(DropReason::StaleResponse, frames);
            return;
        }
        if self.active_response.is_none() {
            // Audio for a response whose creation was never reported
            self.on_response_created(response_id.clone(), now);
        }

        let playing = self.playout_until.is_some_and(|t| now < t);
        if !self.active_has_audio {
            self.active_has_audio = true;
            if !playing || self.ai_turn_started_at.is_none() {
                self.ai_turn_started_at = Some(now);
            }
            let watched = self.first_audio.as_ref().is_some_and(|w| {
                w.response_id.as_deref().is_none_or(|id| id == response_id)
            });
            if watched && let Some(watch) = self.first_audio.take() {
                debug!(
                    call_id = %self.session.call_id,
                    %response_id,
                    latency_ms = now.saturating_duration_since(watch.since).as_millis() as u64,
                    "First audio"
                );
            }
        }

        let duration =
            Duration::from_micros(samples.len() as u64 * 1_000_000 / sample_rate.max(1) as u64);
        let start = match self.playout_until {
            Some(until) if playing => until,
            _ => now,
        };
        self.playout_until = Some(start + duration);
        self.last_ai_audio_at = Some(now);

        if matches!(self.state(), CallState::Greeting | CallState::Listen) {
            self.session.transition(CallState::AiSpeaking);
        }

        out.push(CallAction::PlayAudio {
            response_id,
            samples,
            sample_rate,
        });
    }

    fn on_response_done(
        &mut self,
        response_id: String,
        status: ResponseStatus,
        reason: Option<String>,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        let turn = self.dispatcher.on_response_done(&response_id, status, now);
        debug!(
            call_id = %self.session.call_id,
            %response_id,
            %status,
            ?reason,
            turn = ?turn.map(|t| t.reason),
            "Response done"
        );

        if self.active_response.as_deref() == Some(response_id.as_str()) {
            self.retire_active();
        } else {
            self.retire(response_id.clone());
        }
        if self
            .first_audio
            .as_ref()
            .is_some_and(|w| w.response_id.as_deref() == Some(response_id.as_str()))
        {
            self.first_audio = None;
        }

        // Outcome of a barge-in cancel
        if self
            .pending_cancel
            .as_ref()
            .is_some_and(|p| p.response_id == response_id)
        {
            self.pending_cancel = None;
            if status == ResponseStatus::Cancelled {
                debug!(call_id = %self.session.call_id, %response_id, "Cancel acknowledged, flushing egress");
                self.flush(out);
            } else {
                info!(
                    call_id = %self.session.call_id,
                    %response_id,
                    %status,
                    "Response finished before the cancel, keeping egress"
                );
            }
        }

        if let Some(hangup) = &mut self.pending_hangup
            && hangup.response_id.as_deref() == Some(response_id.as_str())
        {
            if status == ResponseStatus::Completed {
                hangup.ready = true;
            } else {
                info!(
                    call_id = %self.session.call_id,
                    %response_id,
                    %status,
                    "Hangup response did not complete, call continues"
                );
                self.abandon_hangup(now);
            }
        }

        if self.greeting_response.as_deref() == Some(response_id.as_str()) {
            self.upgrade_prompt(out);
        }

        if self.state() == CallState::Greeting
            || (self.state() == CallState::AiSpeaking && !self.ai_speaking(now))
        {
            self.session.transition(CallState::Listen);
        }

        self.try_finish_hangup(now, out);
    }

    /// Swap the compact greeting prompt for the full one, at most once.
    fn upgrade_prompt(&mut self, out: &mut Vec<CallAction>) {
        if let Some(instructions) = self.upgrade_instructions.take() {
            info!(call_id = %self.session.call_id, "Upgrading to the full prompt");
            out.push(CallAction::UpdateSession { instructions });
        }
    }

    /// A hangup response was cut short; reopen the conversation.
    fn abandon_hangup(&mut self, now: Instant) {
        self.pending_hangup = None;
        if self.session.close_reason == Some(CloseReason::EndCall) {
            self.session.close_reason = None;
        }
        let next = if self.ai_speaking(now) {
            CallState::AiSpeaking
        } else {
            CallState::Listen
        };
        self.session.transition(next);
    }

    fn try_finish_hangup(&mut self, now: Instant, out: &mut Vec<CallAction>) -> bool {
        let ready = self.pending_hangup.as_ref().is_some_and(|h| h.ready);
        if !ready || self.ai_speaking(now) {
            return false;
        }
        self.pending_hangup = None;
        self.hangup(CloseReason::EndCall, out);
        true
    }

    fn on_function_call(
        &mut self,
        call: FunctionCallRequest,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        if call.name != END_CALL_TOOL {
            warn!(call_id = %self.session.call_id, name = %call.name, "Unknown function called");
            out.push(CallAction::SubmitFunctionResult {
                call_id: call.call_id,
                output: serde_json::json!({ "error": format!("unknown function {}", call.name) })
                    .to_string(),
            });
            return;
        }

        let response_id = call.response_id.or_else(|| self.active_response.clone());
        info!(
            call_id = %self.session.call_id,
            response_id = ?response_id,
            arguments = %call.arguments,
            "Model requested hangup"
        );
        let ready = match response_id.as_deref() {
            None => true,
            Some(id) => {
                self.active_response.as_deref() != Some(id)
                    && self.retired.iter().any(|r| r == id)
            }
        };
        self.pending_hangup = Some(PendingHangup { response_id, ready });
        self.session.close_reason = Some(CloseReason::EndCall);
        self.session.transition(CallState::Closing);
        out.push(CallAction::SubmitFunctionResult {
            call_id: call.call_id,
            output: serde_json::json!({ "status": "ending_call" }).to_string(),
        });
        self.try_finish_hangup(now, out);
    }

    fn on_provider_error(
        &mut self,
        response_id: Option<String>,
        now: Instant,
        out: &mut Vec<CallAction>,
    ) {
        let in_flight_id = self.dispatcher.in_flight().and_then(|t| t.id.clone());
        let affects_in_flight = match (&response_id, &in_flight_id) {
            (Some(err_id), Some(id)) => err_id == id,
            (Some(_), None) => false,
            (None, _) => true,
        };
        // A failed greeting still ends the compact-prompt phase
        let greeting_failed = match response_id.as_deref().or(in_flight_id.as_deref()) {
            Some(id) => self.greeting_response.as_deref() == Some(id),
            None => {
                affects_in_flight && self.greeting_requested && self.greeting_response.is_none()
            }
        };
        if greeting_failed {
            self.upgrade_prompt(out);
        }
        if affects_in_flight && self.dispatcher.fail_in_flight(now).is_some() {
            debug!(call_id = %self.session.call_id, "In-flight response failed");
        }
        let failed = response_id.as_ref().or(in_flight_id.as_ref());
        if affects_in_flight
            && failed.is_some()
            && self.active_response.as_ref() == failed
            && !self.active_has_audio
        {
            self.retire_active();
        }

        if let Some(id) = response_id.as_deref()
            && self
                .pending_hangup
                .as_ref()
                .is_some_and(|h| h.response_id.as_deref() == Some(id))
        {
            self.abandon_hangup(now);
            return;
        }
        if self.hangup_issued || self.pending_hangup.is_some() {
            return;
        }
        if matches!(self.state(), CallState::Greeting | CallState::AiSpeaking)
            && !self.ai_speaking(now)
        {
            self.session.transition(CallState::Listen);
        }
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    fn on_tick(&mut self, now: Instant, out: &mut Vec<CallAction>) {
        if self.hangup_issued {
            return;
        }

        if let Some(pending) = &self.pending_cancel
            && now >= pending.deadline
        {
            warn!(
                call_id = %self.session.call_id,
                response_id = %pending.response_id,
                "No cancel outcome in time, flushing egress"
            );
            self.pending_cancel = None;
            self.flush(out);
        }

        let speaking = self.ai_speaking(now);
        if !speaking && self.active_response.is_none() {
            self.ai_turn_started_at = None;
            if self.state() == CallState::AiSpeaking {
                self.session.transition(CallState::Listen);
            }
        }

        if self.try_finish_hangup(now, out) {
            return;
        }

        if let Some(watch) = &mut self.first_audio {
            let waited = now.saturating_duration_since(watch.since);
            if !watch.fired && waited >= CallTimingConfig::ms(self.timing.first_audio_timeout_ms)
            {
                watch.fired = true;
                let waited_ms = waited.as_millis() as u64;
                warn!(
                    call_id = %self.session.call_id,
                    response_id = ?watch.response_id,
                    waited_ms,
                    "No audio from provider yet"
                );
                out.push(CallAction::LogDiagnostics {
                    response_id: watch.response_id.clone(),
                    waited_ms,
                });
            }
        }

        if self.turn_taking == TurnTaking::Explicit
            && self.state() == CallState::Listen
            && self
                .dispatcher
                .should_retry(now, !speaking && self.active_response.is_none())
        {
            info!(call_id = %self.session.call_id, "Caller turn unanswered, retrying response");
            self.request_response(ResponseReason::Retry, now, out);
        }

        if self.state() == CallState::WaitingHumanConfirm {
            if let Some(since) = self.waiting_human_since
                && now.saturating_duration_since(since)
                    >= CallTimingConfig::ms(self.timing.human_confirm_timeout_ms)
            {
                info!(call_id = %self.session.call_id, "No human detected on outbound call");
                self.hangup(CloseReason::NoHumanDetected, out);
            }
            return;
        }

        if self.state().is_conversational() && !speaking {
            let last_activity = [
                self.last_caller_voice_at,
                self.playout_until,
                self.last_ai_audio_at,
            ]
            .into_iter()
            .flatten()
            .fold(self.silence_epoch, Instant::max);
            if now.saturating_duration_since(last_activity)
                >= CallTimingConfig::ms(self.timing.silence_hangup_ms)
            {
                info!(call_id = %self.session.call_id, "Caller and AI both silent, closing");
                self.hangup(CloseReason::SilenceTimeout, out);
            }
        }
    }
}
