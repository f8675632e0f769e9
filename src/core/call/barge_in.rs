//! Barge-in arbitration.
//!
//! A caller interruption of AI speech is confirmed only when six gates pass,
//! evaluated in order and short-circuiting on the first failure:
//!
//! 1. the AI is currently speaking
//! 2. locally measured continuous speech reaches the minimum
//! 3. the AI turn has been speaking for at least the anti-echo cooldown
//! 4. the last AI audio chunk is at least `last_audio_age` old
//! 5. no interrupt was confirmed within the interrupt lock
//! 6. for provider-signalled candidates, the speech is not older than the
//!    late-transcript limit
//!
//! Gates 3 and 4 reject the AI's own voice echoed back through the handset;
//! gate 2 rejects clicks and line noise.

use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

use super::timing::CallTimingConfig;

/// What raised the candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BargeInSource {
    /// Local VAD heard sustained caller speech
    LocalVad,
    /// Provider speech-started event
    ProviderSpeechStarted,
    /// Caller transcript arrived
    Transcript,
}

impl BargeInSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BargeInSource::LocalVad => "local_vad",
            BargeInSource::ProviderSpeechStarted => "provider_speech_started",
            BargeInSource::Transcript => "transcript",
        }
    }
}

/// The gate that rejected a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BargeInGate {
    AiSpeaking,
    MinSpeech,
    AntiEchoCooldown,
    LastAudioAge,
    InterruptLock,
    LateTranscript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "decision", content = "gate")]
pub enum BargeInDecision {
    Confirmed,
    Rejected(BargeInGate),
}

/// A possible interruption.
#[derive(Debug, Clone, Copy)]
pub struct BargeInCandidate {
    pub source: BargeInSource,
    /// Length of the caller's current speech segment per local VAD
    pub speech_ms: u64,
}

/// What the AI side looks like at evaluation time.
#[derive(Debug, Clone, Copy, Default)]
pub struct AiActivity {
    pub speaking: bool,
    /// First audio of the current AI turn
    pub turn_started_at: Option<Instant>,
    /// Most recent AI audio accepted into egress
    pub last_audio_at: Option<Instant>,
}

/// One gate evaluation, kept for logs and tests.
#[derive(Debug, Clone, Serialize)]
pub struct BargeInEvent {
    pub source: BargeInSource,
    pub decision: BargeInDecision,
    pub speech_ms: u64,
    pub ai_speaking: bool,
    /// Time since the AI turn started speaking
    pub cooldown_age_ms: Option<u64>,
    /// Time since the last AI audio chunk
    pub last_audio_age_ms: Option<u64>,
    /// Time since the previous confirmed interrupt
    pub lock_age_ms: Option<u64>,
}

impl BargeInEvent {
    pub fn is_confirmed(&self) -> bool {
        self.decision == BargeInDecision::Confirmed
    }
}

#[derive(Debug, Clone, Copy)]
struct Thresholds {
    min_speech: u64,
    anti_echo_cooldown: Duration,
    last_audio_age: Duration,
    interrupt_lock: Duration,
    late_transcript: u64,
}

/// Stateful gate evaluator for one call.
#[derive(Debug)]
pub struct BargeInCoordinator {
    thresholds: Thresholds,
    last_confirmed_at: Option<Instant>,
}

fn age_ms(now: Instant, then: Option<Instant>) -> Option<u64> {
    then.map(|t| now.saturating_duration_since(t).as_millis() as u64)
}

impl BargeInCoordinator {
    pub fn new(timing: &CallTimingConfig) -> Self {
        Self {
            thresholds: Thresholds {
                min_speech: timing.min_speech_ms,
                anti_echo_cooldown: CallTimingConfig::ms(timing.anti_echo_cooldown_ms),
                last_audio_age: CallTimingConfig::ms(timing.last_audio_age_ms),
                interrupt_lock: CallTimingConfig::ms(timing.interrupt_lock_ms),
                late_transcript: timing.late_transcript_ms,
            },
            last_confirmed_at: None,
        }
    }

    /// Evaluate a candidate. A confirmation starts the interrupt lock.
    pub fn evaluate(
        &mut self,
        candidate: BargeInCandidate,
        ai: AiActivity,
        now: Instant,
    ) -> BargeInEvent {
        let t = self.thresholds;
        let cooldown_age_ms = age_ms(now, ai.turn_started_at);
        let last_audio_age_ms = age_ms(now, ai.last_audio_at);
        let lock_age_ms = age_ms(now, self.last_confirmed_at);

        let passes_age = |age: Option<u64>, min: Duration| {
            age.is_none_or(|a| a >= min.as_millis() as u64)
        };

        let decision = if !ai.speaking {
            BargeInDecision::Rejected(BargeInGate::AiSpeaking)
        } else if candidate.speech_ms < t.min_speech {
            BargeInDecision::Rejected(BargeInGate::MinSpeech)
        } else if !passes_age(cooldown_age_ms, t.anti_echo_cooldown) {
            BargeInDecision::Rejected(BargeInGate::AntiEchoCooldown)
        } else if !passes_age(last_audio_age_ms, t.last_audio_age) {
            BargeInDecision::Rejected(BargeInGate::LastAudioAge)
        } else if lock_age_ms.is_some_and(|a| a < t.interrupt_lock.as_millis() as u64) {
            BargeInDecision::Rejected(BargeInGate::InterruptLock)
        } else if candidate.source != BargeInSource::LocalVad
            && candidate.speech_ms > t.late_transcript
        {
            BargeInDecision::Rejected(BargeInGate::LateTranscript)
        } else {
            BargeInDecision::Confirmed
        };

        if decision == BargeInDecision::Confirmed {
            self.last_confirmed_at = Some(now);
        }

        let event = BargeInEvent {
            source: candidate.source,
            decision,
            speech_ms: candidate.speech_ms,
            ai_speaking: ai.speaking,
            cooldown_age_ms,
            last_audio_age_ms,
            lock_age_ms,
        };
        debug!(
            source = candidate.source.as_str(),
            decision = ?event.decision,
            speech_ms = event.speech_ms,
            cooldown_age_ms = ?event.cooldown_age_ms,
            last_audio_age_ms = ?event.last_audio_age_ms,
            lock_age_ms = ?event.lock_age_ms,
            "Barge-in evaluated"
        );
        event
    }
}
