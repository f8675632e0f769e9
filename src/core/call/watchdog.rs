//! Crash visibility and diagnostic snapshots.
//!
//! Every background task of a call runs under [`spawn_supervised`]. A panic
//! inside one is caught, logged with the call id and task name, and reported
//! to the session so it can tear the call down instead of freezing.

use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;
use tracing::error;

use super::engine::EngineDiagnostics;
use crate::core::audio::DropSnapshot;
use crate::core::realtime::RealtimeProvider;

/// How a supervised task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    Completed,
    Panicked(String),
}

/// Best-effort text of a panic payload.
pub fn extract_panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (non-string payload)".to_string()
    }
}

/// Run `fut`, turning a panic into [`TaskExit::Panicked`].
pub async fn run_supervised<F>(call_id: &str, task: &str, fut: F) -> TaskExit
where
    F: Future<Output = ()>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => TaskExit::Completed,
        Err(payload) => {
            let message = extract_panic_message(payload.as_ref());
            error!(call_id = %call_id, task = %task, panic = %message, "Call task panicked");
            TaskExit::Panicked(message)
        }
    }
}

/// Spawn a call task; `on_panic` receives the panic message.
pub fn spawn_supervised<F, P>(
    call_id: String,
    task: &'static str,
    fut: F,
    on_panic: P,
) -> JoinHandle<TaskExit>
where
    F: Future<Output = ()> + Send + 'static,
    P: FnOnce(String) + Send + 'static,
{
    tokio::spawn(async move {
        let exit = run_supervised(&call_id, task, fut).await;
        if let TaskExit::Panicked(message) = &exit {
            on_panic(message.clone());
        }
        exit
    })
}

/// Everything logged when the first-audio watchdog fires.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticSnapshot {
    pub call_id: String,
    pub provider: RealtimeProvider,
    pub provider_state: String,
    pub waited_ms: u64,
    pub ingress_depth: usize,
    pub egress_depth: usize,
    pub engine: EngineDiagnostics,
    pub drops: DropSnapshot,
}

impl DiagnosticSnapshot {
    pub fn log(&self) {
        let detail = serde_json::to_string(self).unwrap_or_else(|e| e.to_string());
        tracing::warn!(
            call_id = %self.call_id,
            provider = %self.provider,
            waited_ms = self.waited_ms,
            "First-audio watchdog fired: {}",
            detail
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_completed_task() {
        let exit = run_supervised("CA1", "writer", async {}).await;
        assert_eq!(exit, TaskExit::Completed);
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_reported() {
        let reported = Arc::new(AtomicBool::new(false));
        let flag = reported.clone();
        let handle = spawn_supervised(
            "CA1".to_string(),
            "uplink",
            async {
                panic!("resampler exploded");
            },
            move |msg| {
                assert!(msg.contains("resampler exploded"));
                flag.store(true, Ordering::SeqCst);
            },
        );
        let exit = handle.await.unwrap();
        assert_eq!(exit, TaskExit::Panicked("resampler exploded".to_string()));
        assert!(reported.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_formatted_panic_message() {
        let exit = run_supervised("CA1", "writer", async {
            let n = 3;
            panic!("frame {n} out of range");
        })
        .await;
        assert_eq!(exit, TaskExit::Panicked("frame 3 out of range".to_string()));
    }

    #[test]
    fn test_extract_non_string_payload() {
        let payload: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(
            extract_panic_message(payload.as_ref()),
            "Unknown panic (non-string payload)"
        );
    }
}
