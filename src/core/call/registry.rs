//! Process-wide registry of live calls.
//!
//! Each session inserts itself on start and removes itself on termination;
//! nothing else mutates an entry. Readers (the HTTP API, shutdown) only take
//! snapshots.

use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use super::state::{CallDirection, CallSession, CallState};
use crate::core::realtime::RealtimeProvider;

/// Public view of a live call.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub stream_sid: String,
    pub direction: CallDirection,
    pub provider: RealtimeProvider,
    pub state: CallState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl CallSummary {
    pub fn from_session(session: &CallSession) -> Self {
        Self {
            call_id: session.call_id.clone(),
            stream_sid: session.stream_sid.clone(),
            direction: session.direction(),
            provider: session.provider,
            state: session.state(),
            business_id: session.business_id.clone(),
            started_at: session.started_at,
        }
    }
}

struct Entry {
    summary: CallSummary,
    shutdown: CancellationToken,
}

#[derive(Default)]
pub struct CallRegistry {
    calls: DashMap<String, Entry>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call. Returns false if the id is already live.
    pub fn insert(&self, summary: CallSummary, shutdown: CancellationToken) -> bool {
        use dashmap::mapref::entry::Entry as MapEntry;
        match self.calls.entry(summary.call_id.clone()) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(slot) => {
                slot.insert(Entry { summary, shutdown });
                true
            }
        }
    }

    pub fn update_state(&self, call_id: &str, state: CallState) {
        if let Some(mut entry) = self.calls.get_mut(call_id) {
            entry.summary.state = state;
        }
    }

    pub fn remove(&self, call_id: &str) -> Option<CallSummary> {
        self.calls.remove(call_id).map(|(_, e)| e.summary)
    }

    pub fn get(&self, call_id: &str) -> Option<CallSummary> {
        self.calls.get(call_id).map(|e| e.summary.clone())
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Snapshot of all live calls, oldest first.
    pub fn list(&self) -> Vec<CallSummary> {
        let mut calls: Vec<CallSummary> =
            self.calls.iter().map(|e| e.summary.clone()).collect();
        calls.sort_by_key(|c| c.started_at);
        calls
    }

    /// Ask every live call to close. Returns how many were signalled.
    pub fn shutdown_all(&self) -> usize {
        let mut signalled = 0;
        for entry in self.calls.iter() {
            entry.shutdown.cancel();
            signalled += 1;
        }
        signalled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::call::state::CallMetadata;

    fn summary(id: &str) -> CallSummary {
        let session = CallSession::new(
            CallMetadata {
                call_id: id.to_string(),
                stream_sid: format!("MZ{id}"),
                ..Default::default()
            },
            RealtimeProvider::OpenAI,
        );
        CallSummary::from_session(&session)
    }

    #[test]
    fn test_insert_update_remove() {
        let registry = CallRegistry::new();
        assert!(registry.insert(summary("CA1"), CancellationToken::new()));
        assert!(!registry.insert(summary("CA1"), CancellationToken::new()));
        assert_eq!(registry.len(), 1);

        registry.update_state("CA1", CallState::Listen);
        assert_eq!(registry.get("CA1").unwrap().state, CallState::Listen);

        let removed = registry.remove("CA1").unwrap();
        assert_eq!(removed.call_id, "CA1");
        assert!(registry.is_empty());
        assert!(registry.remove("CA1").is_none());
    }

    #[test]
    fn test_shutdown_all_cancels_tokens() {
        let registry = CallRegistry::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        registry.insert(summary("CA1"), a.clone());
        registry.insert(summary("CA2"), b.clone());
        assert_eq!(registry.shutdown_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[test]
    fn test_summary_serializes() {
        let json = serde_json::to_value(summary("CA9")).unwrap();
        assert_eq!(json["call_id"], "CA9");
        assert_eq!(json["state"], "INIT");
        assert_eq!(json["direction"], "inbound");
        assert!(json.get("business_id").is_none());
    }
}
