//! Mock realtime provider for integration tests
//!
//! Speaks enough of the OpenAI Realtime event protocol to drive a call:
//! session updates, `response.create` answered with a burst of 24kHz PCM
//! audio, `response.cancel` acknowledged with a cancelled `response.done`.

#![allow(dead_code)]

use std::f32::consts::PI;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Provider-side sample rate
pub const MOCK_SAMPLE_RATE: u32 = 24_000;

/// How the mock answers response requests.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Audio sent for the first response (the greeting)
    pub greeting_audio_ms: u64,
    /// The greeting stays active until cancelled or this long has passed
    pub greeting_hold_ms: u64,
    /// Audio sent for every later response, which completes immediately
    pub reply_audio_ms: u64,
    /// Caller transcript sent after a cancel, as if the caller kept talking
    pub transcript_after_cancel: Option<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            greeting_audio_ms: 4000,
            greeting_hold_ms: 10_000,
            reply_audio_ms: 200,
            transcript_after_cancel: Some("wait I have a question".to_string()),
        }
    }
}

/// Everything the mock received, excluding audio appends.
#[derive(Debug, Default)]
pub struct MockLog {
    pub events: Vec<String>,
    pub audio_appends: usize,
    pub connections: usize,
    pub instructions: Vec<String>,
}

impl MockLog {
    pub fn count(&self, event_type: &str) -> usize {
        self.events.iter().filter(|e| *e == event_type).count()
    }
}

pub struct MockRealtimeServer {
    pub addr: SocketAddr,
    pub log: Arc<Mutex<MockLog>>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockRealtimeServer {
    pub async fn start(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(MockLog::default()));

        let accept_log = log.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let log = accept_log.clone();
                let behavior = behavior.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, log, behavior).await {
                        eprintln!("mock realtime connection error: {e}");
                    }
                });
            }
        });

        Self { addr, log, handle }
    }

    /// Endpoint for `RealtimeConfig::endpoint`
    pub fn endpoint(&self) -> String {
        format!("ws://{}/v1/realtime", self.addr)
    }
}

impl Drop for MockRealtimeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// 24kHz 16-bit little-endian sine, base64 encoded.
pub fn tone_delta(duration_ms: u64) -> String {
    let samples = (MOCK_SAMPLE_RATE as u64 * duration_ms / 1000) as usize;
    let mut bytes = Vec::with_capacity(samples * 2);
    for i in 0..samples {
        let t = i as f32 / MOCK_SAMPLE_RATE as f32;
        let sample = (0.25 * (2.0 * PI * 440.0 * t).sin() * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    BASE64.encode(bytes)
}

async fn handle_connection(
    stream: TcpStream,
    log: Arc<Mutex<MockLog>>,
    behavior: MockBehavior,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();
    log.lock().connections += 1;

    let send = |value: Value| Message::Text(value.to_string().into());

    write
        .send(send(json!({
            "type": "session.created",
            "session": {"id": "sess_mock", "model": "mock-realtime"}
        })))
        .await?;

    let mut responses = 0u32;
    // Held greeting: (response id, auto-complete deadline)
    let mut active: Option<(String, Instant)> = None;

    loop {
        let deadline = active.as_ref().map(|(_, d)| *d);
        let msg = tokio::select! {
            msg = read.next() => msg,
            _ = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Some((id, _)) = active.take() {
                    write.send(send(json!({
                        "type": "response.done",
                        "response": {"id": id, "status": "completed"}
                    }))).await?;
                }
                continue;
            }
        };

        let text = match msg {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };
        let event: Value = serde_json::from_str(&text)?;
        let event_type = event["type"].as_str().unwrap_or_default().to_string();

        if event_type == "input_audio_buffer.append" {
            log.lock().audio_appends += 1;
            continue;
        }
        log.lock().events.push(event_type.clone());

        match event_type.as_str() {
            "session.update" => {
                if let Some(instructions) = event["session"]["instructions"].as_str() {
                    log.lock().instructions.push(instructions.to_string());
                }
                write
                    .send(send(json!({
                        "type": "session.updated",
                        "session": {"id": "sess_mock", "model": "mock-realtime"}
                    })))
                    .await?;
            }
            "response.create" => {
                responses += 1;
                let id = format!("resp_{responses}");
                let greeting = responses == 1;
                let audio_ms = if greeting {
                    behavior.greeting_audio_ms
                } else {
                    behavior.reply_audio_ms
                };

                write
                    .send(send(json!({
                        "type": "response.created",
                        "response": {"id": id, "status": "in_progress"}
                    })))
                    .await?;
                // 100ms chunks, sent as one burst like a fast model
                let mut remaining = audio_ms;
                while remaining > 0 {
                    let chunk = remaining.min(100);
                    write
                        .send(send(json!({
                            "type": "response.audio.delta",
                            "response_id": id,
                            "item_id": "item_1",
                            "output_index": 0,
                            "content_index": 0,
                            "delta": tone_delta(chunk)
                        })))
                        .await?;
                    remaining -= chunk;
                }
                let transcript = if greeting {
                    "Hello, thanks for calling."
                } else {
                    "Sure, go ahead."
                };
                write
                    .send(send(json!({
                        "type": "response.audio_transcript.done",
                        "response_id": id,
                        "transcript": transcript
                    })))
                    .await?;

                if greeting {
                    active = Some((
                        id,
                        Instant::now() + Duration::from_millis(behavior.greeting_hold_ms),
                    ));
                } else {
                    write
                        .send(send(json!({
                            "type": "response.done",
                            "response": {"id": id, "status": "completed"}
                        })))
                        .await?;
                }
            }
            "response.cancel" => {
                let target = event["response_id"].as_str().map(str::to_string);
                match active.take() {
                    Some((id, _)) if target.as_deref().is_none_or(|t| t == id) => {
                        write
                            .send(send(json!({
                                "type": "response.done",
                                "response": {
                                    "id": id,
                                    "status": "cancelled",
                                    "status_details": {"reason": "client_cancelled"}
                                }
                            })))
                            .await?;
                        if let Some(transcript) = &behavior.transcript_after_cancel {
                            write
                                .send(send(json!({
                                    "type": "conversation.item.input_audio_transcription.completed",
                                    "item_id": "item_caller_1",
                                    "content_index": 0,
                                    "transcript": transcript
                                })))
                                .await?;
                        }
                    }
                    other => {
                        active = other;
                        write
                            .send(send(json!({
                                "type": "error",
                                "error": {
                                    "type": "invalid_request_error",
                                    "code": "response_cancel_not_active",
                                    "message": "Cancellation failed: no active response found"
                                }
                            })))
                            .await?;
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}
