//! Response dispatcher.
//!
//! Keeps at most one response in flight per call and drops repeated caller
//! utterances so one thing said once produces one reply.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use super::timing::CallTimingConfig;
use crate::core::realtime::ResponseStatus;

/// Finished turns kept for diagnostics.
const HISTORY_LIMIT: usize = 32;

/// Why a response was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseReason {
    Greeting,
    UserTurn,
    Retry,
    /// Started by the provider's own turn-taking
    ProviderInitiated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    InFlight,
    Done,
    Cancelled,
    Incomplete,
    Failed,
}

impl From<ResponseStatus> for TurnStatus {
    fn from(status: ResponseStatus) -> Self {
        match status {
            ResponseStatus::Completed => TurnStatus::Done,
            ResponseStatus::Cancelled => TurnStatus::Cancelled,
            ResponseStatus::Incomplete => TurnStatus::Incomplete,
            ResponseStatus::Failed => TurnStatus::Failed,
        }
    }
}

/// One requested or provider-started response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseTurn {
    /// Provider id, known once the provider acknowledges the request
    pub id: Option<String>,
    pub reason: ResponseReason,
    pub status: TurnStatus,
    #[serde(skip)]
    pub requested_at: Instant,
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

/// Outcome of a response request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchDecision {
    /// Send response-create
    Send,
    /// The previous request went stale; it is failed and this one is sent
    StaleRecovery,
    /// Another response is in flight
    SuppressedInFlight,
}

impl DispatchDecision {
    pub fn should_send(&self) -> bool {
        matches!(self, DispatchDecision::Send | DispatchDecision::StaleRecovery)
    }
}

#[derive(Debug)]
pub struct ResponseDispatcher {
    stale_after: Duration,
    dedup_window: Duration,
    retry_after: Duration,
    epoch: Instant,
    in_flight: Option<ResponseTurn>,
    history: VecDeque<ResponseTurn>,
    fingerprints: HashMap<u64, Instant>,
    /// End of the caller's last turn, while it has not been answered
    unanswered_turn_at: Option<Instant>,
    retry_attempted: bool,
}

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_utterance(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// xxh3 of a normalized utterance within a time bucket.
pub fn utterance_fingerprint(normalized: &str, bucket: u64) -> u64 {
    let mut buf = Vec::with_capacity(normalized.len() + 9);
    buf.extend_from_slice(normalized.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&bucket.to_le_bytes());
    xxh3_64(&buf)
}

impl ResponseDispatcher {
    pub fn new(timing: &CallTimingConfig, epoch: Instant) -> Self {
        Self {
            stale_after: CallTimingConfig::ms(timing.stale_in_flight_ms),
            dedup_window: CallTimingConfig::ms(timing.dedup_window_ms),
            retry_after: CallTimingConfig::ms(timing.response_retry_ms),
            epoch,
            in_flight: None,
            history: VecDeque::with_capacity(HISTORY_LIMIT),
            fingerprints: HashMap::new(),
            unanswered_turn_at: None,
            retry_attempted: false,
        }
    }

    pub fn in_flight(&self) -> Option<&ResponseTurn> {
        self.in_flight.as_ref()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn history(&self) -> &VecDeque<ResponseTurn> {
        &self.history
    }

    fn finish(&mut self, status: TurnStatus, now: Instant) -> Option<ResponseTurn> {
        let mut turn = self.in_flight.take()?;
        turn.status = status;
        turn.finished_at = Some(now);
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(turn.clone());
        Some(turn)
    }

    /// Ask to send a response-create.
    pub fn request(&mut self, reason: ResponseReason, now: Instant) -> DispatchDecision {
        let mut decision = DispatchDecision::Send;
        if let Some(turn) = &self.in_flight {
            let age = now.saturating_duration_since(turn.requested_at);
            if age < self.stale_after {
                debug!(
                    ?reason,
                    in_flight = ?turn.id,
                    age_ms = age.as_millis() as u64,
                    "Response suppressed, another is in flight"
                );
                return DispatchDecision::SuppressedInFlight;
            }
            warn!(
                in_flight = ?turn.id,
                age_ms = age.as_millis() as u64,
                "In-flight response went stale, recovering"
            );
            self.finish(TurnStatus::Failed, now);
            decision = DispatchDecision::StaleRecovery;
        }

        self.in_flight = Some(ResponseTurn {
            id: None,
            reason,
            status: TurnStatus::InFlight,
            requested_at: now,
            finished_at: None,
        });
        self.unanswered_turn_at = None;
        decision
    }

    /// Returns false when the same utterance was seen inside the dedup window.
    pub fn check_utterance(&mut self, text: &str, now: Instant) -> bool {
        let normalized = normalize_utterance(text);
        if normalized.is_empty() {
            return false;
        }
        let window_ms = self.dedup_window.as_millis().max(1) as u64;
        let bucket = now.saturating_duration_since(self.epoch).as_millis() as u64 / window_ms;

        let window = self.dedup_window;
        self.fingerprints
            .retain(|_, seen| now.saturating_duration_since(*seen) < window * 2);

        let current = utterance_fingerprint(&normalized, bucket);
        let candidates = [Some(current), bucket.checked_sub(1).map(|b| utterance_fingerprint(&normalized, b))];
        for fp in candidates.into_iter().flatten() {
            if let Some(seen) = self.fingerprints.get(&fp)
                && now.saturating_duration_since(*seen) < window
            {
                debug!(utterance = %normalized, "Duplicate utterance dropped");
                return false;
            }
        }
        self.fingerprints.insert(current, now);
        true
    }

    /// The provider acknowledged a response.
    ///
    /// Attaches the id to the pending request, or registers a
    /// provider-started response when nothing was requested.
    pub fn on_response_created(&mut self, id: &str, now: Instant) {
        if let Some(turn) = self.in_flight.as_mut() {
            match turn.id.as_deref() {
                None => {
                    turn.id = Some(id.to_string());
                    return;
                }
                Some(current) if current == id => return,
                Some(current) => {
                    warn!(previous = %current, next = %id, "Response replaced before finishing");
                    self.finish(TurnStatus::Failed, now);
                }
            }
        }
        self.in_flight = Some(ResponseTurn {
            id: Some(id.to_string()),
            reason: ResponseReason::ProviderInitiated,
            status: TurnStatus::InFlight,
            requested_at: now,
            finished_at: None,
        });
        self.unanswered_turn_at = None;
    }

    /// A response finished. Releases the lock when it is the in-flight one.
    pub fn on_response_done(
        &mut self,
        id: &str,
        status: ResponseStatus,
        now: Instant,
    ) -> Option<ResponseTurn> {
        let matches = self
            .in_flight
            .as_ref()
            .is_some_and(|t| t.id.as_deref() == Some(id));
        if !matches {
            return None;
        }
        self.finish(status.into(), now)
    }

    /// The in-flight response failed (provider error).
    pub fn fail_in_flight(&mut self, now: Instant) -> Option<ResponseTurn> {
        self.finish(TurnStatus::Failed, now)
    }

    /// Clear the single-flight lock after a confirmed barge-in.
    pub fn release(&mut self, now: Instant) -> Option<ResponseTurn> {
        self.finish(TurnStatus::Cancelled, now)
    }

    /// The caller finished speaking; arms the one-shot retry.
    pub fn on_user_turn_ended(&mut self, now: Instant) {
        self.unanswered_turn_at = Some(now);
        self.retry_attempted = false;
    }

    /// Whether the retry should fire now. Marks it attempted when true.
    pub fn should_retry(&mut self, now: Instant, ai_idle: bool) -> bool {
        let Some(ended_at) = self.unanswered_turn_at else {
            return false;
        };
        if self.retry_attempted
            || self.in_flight.is_some()
            || !ai_idle
            || now.saturating_duration_since(ended_at) < self.retry_after
        {
            return false;
        }
        self.retry_attempted = true;
        self.unanswered_turn_at = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(base: Instant, v: u64) -> Instant {
        base + Duration::from_millis(v)
    }

    fn dispatcher(base: Instant) -> ResponseDispatcher {
        ResponseDispatcher::new(&CallTimingConfig::default(), base)
    }

    #[test]
    fn test_single_flight() {
        let base = Instant::now();
        let mut d = dispatcher(base);
        assert_eq!(d.request(ResponseReason::Greeting, base), DispatchDecision::Send);
        assert_eq!(
            d.request(ResponseReason::UserTurn, ms(base, 100)),
            DispatchDecision::SuppressedInFlight
        );

        d.on_response_created("resp_1", ms(base, 200));
        assert_eq!(d.in_flight().unwrap().id.as_deref(), Some("resp_1"));

        // A different id finishing does not release the lock
        assert!(
            d.on_response_done("resp_0", ResponseStatus::Completed, ms(base, 300))
                .is_none()
        );
        assert!(d.is_in_flight());

        let done = d
            .on_response_done("resp_1", ResponseStatus::Completed, ms(base, 400))
            .unwrap();
        assert_eq!(done.status, TurnStatus::Done);
        assert_eq!(d.request(ResponseReason::UserTurn, ms(base, 500)), DispatchDecision::Send);
    }

    #[test]
    fn test_stale_recovery() {
        let base = Instant::now();
        let mut d = dispatcher(base);
        d.request(ResponseReason::UserTurn, base);
        assert_eq!(
            d.request(ResponseReason::UserTurn, ms(base, 5_999)),
            DispatchDecision::SuppressedInFlight
        );
        assert_eq!(
            d.request(ResponseReason::UserTurn, ms(base, 6_000)),
            DispatchDecision::StaleRecovery
        );
        assert_eq!(d.history().back().unwrap().status, TurnStatus::Failed);
        assert!(d.is_in_flight());
    }

    #[test]
    fn test_history_keeps_most_recent_turns() {
        let base = Instant::now();
        let mut d = dispatcher(base);
        let turns = HISTORY_LIMIT as u64 + 5;
        for i in 0..turns {
            let at = ms(base, i * 1_000);
            let id = format!("resp_{i}");
            assert_eq!(d.request(ResponseReason::UserTurn, at), DispatchDecision::Send);
            d.on_response_created(&id, at);
            d.on_response_done(&id, ResponseStatus::Completed, ms(base, i * 1_000 + 500))
                .unwrap();
        }

        assert_eq!(d.history().len(), HISTORY_LIMIT);
        assert_eq!(d.history().front().unwrap().id.as_deref(), Some("resp_5"));
        let last = format!("resp_{}", turns - 1);
        assert_eq!(d.history().back().unwrap().id.as_deref(), Some(last.as_str()));
    }

    #[test]
    fn test_incomplete_releases_lock() {
        let base = Instant::now();
        let mut d = dispatcher(base);
        d.request(ResponseReason::UserTurn, base);
        d.on_response_created("r", base);
        let turn = d.on_response_done("r", ResponseStatus::Incomplete, base).unwrap();
        assert_eq!(turn.status, TurnStatus::Incomplete);
        assert!(!d.is_in_flight());
    }

    #[test]
    fn test_provider_initiated_registers_in_flight() {
        let base = Instant::now();
        let mut d = dispatcher(base);
        d.on_response_created("hume-turn-1", base);
        let turn = d.in_flight().unwrap();
        assert_eq!(turn.reason, ResponseReason::ProviderInitiated);
        assert_eq!(
            d.request(ResponseReason::UserTurn, ms(base, 10)),
            DispatchDecision::SuppressedInFlight
        );
    }

    #[test]
    fn test_dedup_within_window() {
        let base = Instant::now();
        let mut d = dispatcher(base);
        assert!(d.check_utterance("Yes, that works.", ms(base, 1_000)));
        assert!(!d.check_utterance("yes that   works", ms(base, 2_000)));
        assert!(d.check_utterance("No thanks", ms(base, 2_100)));
        // Outside the window it counts again
        assert!(d.check_utterance("yes that works", ms(base, 9_000)));
    }

    #[test]
    fn test_dedup_across_bucket_boundary() {
        let base = Instant::now();
        let mut d = dispatcher(base);
        assert!(d.check_utterance("book it", ms(base, 3_900)));
        assert!(!d.check_utterance("Book it!", ms(base, 4_100)));
    }

    #[test]
    fn test_empty_utterance_is_not_new() {
        let base = Instant::now();
        let mut d = dispatcher(base);
        assert!(!d.check_utterance(" ... ", base));
    }

    #[test]
    fn test_retry_once() {
        let base = Instant::now();
        let mut d = dispatcher(base);
        d.on_user_turn_ended(base);
        assert!(!d.should_retry(ms(base, 2_999), true));
        assert!(!d.should_retry(ms(base, 3_000), false));
        assert!(d.should_retry(ms(base, 3_000), true));
        assert!(!d.should_retry(ms(base, 4_000), true));
    }

    #[test]
    fn test_request_disarms_retry() {
        let base = Instant::now();
        let mut d = dispatcher(base);
        d.on_user_turn_ended(base);
        d.request(ResponseReason::UserTurn, ms(base, 500));
        d.on_response_created("r", ms(base, 600));
        d.on_response_done("r", ResponseStatus::Completed, ms(base, 1_000));
        assert!(!d.should_retry(ms(base, 5_000), true));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_utterance("  Hello,  World!! "), "hello world");
        assert_ne!(
            utterance_fingerprint("hello", 1),
            utterance_fingerprint("hello", 2)
        );
    }
}
