//! OpenAI Realtime API client implementation.
//!
//! Explicit turn-taking: server VAD is configured with `create_response` and
//! `interrupt_response` disabled, so the model only speaks on
//! `response.create` and only stops on `response.cancel`. Caller
//! transcription runs on the same socket.
//!
//! # API Reference
//!
//! - Endpoint: `wss://api.openai.com/v1/realtime?model=<model>`
//! - Protocol: WebSocket with JSON events
//! - Audio: PCM 16-bit, 24kHz, mono, little-endian, base64 encoded

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;

use super::config::{
    CANCEL_NOT_ACTIVE_CODE, OPENAI_DEFAULT_MODEL, OPENAI_DEFAULT_TRANSCRIPTION_MODEL,
    OPENAI_REALTIME_SAMPLE_RATE, OPENAI_REALTIME_URL, OpenAIRealtimeVoice, ServerVadSettings,
};
use super::messages::{
    ClientEvent, ConversationItem, InputAudioTranscription, ServerEvent, SessionConfig, ToolDef,
    TurnDetection,
};
use crate::core::audio::{pcm16_from_le_bytes, pcm16_to_le_bytes};
use crate::core::realtime::base::{
    BaseRealtime, ConnectionState, EVENT_CHANNEL_CAPACITY, FunctionCallRequest,
    ProviderErrorInfo, RealtimeAudioData, RealtimeConfig, RealtimeError, RealtimeEvent,
    RealtimeResult, ResponseStatus, SessionSetup, TurnTaking,
};

/// Channel capacity for WebSocket message sending.
const WS_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// OpenAI Realtime Client
// =============================================================================

/// OpenAI Realtime API client.
///
/// `connect` spawns one task that owns the socket: it drains the outbound
/// channel, translates inbound server events into [`RealtimeEvent`]s and
/// answers pings. All other state is shared with that task through `Arc`s.
pub struct OpenAIRealtime {
    /// Configuration
    config: RealtimeConfig,
    /// Default voice
    voice: OpenAIRealtimeVoice,
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,
    /// Connected flag for fast checks (shared with connection task)
    connected: Arc<AtomicBool>,
    /// WebSocket sender channel
    ws_sender: Option<mpsc::Sender<ClientEvent>>,
    /// Response id of the cancel awaiting an outcome
    pending_cancel: Arc<Mutex<Option<String>>>,
    /// Stops the connection task
    shutdown: CancellationToken,
    /// Connection task handle
    connection_handle: Option<JoinHandle<()>>,
}

/// Per-connection translation state owned by the socket task.
#[derive(Debug, Default)]
struct EventContext {
    /// call_id -> function name, from `response.output_item.added`
    pending_function_calls: HashMap<String, String>,
    pending_cancel: Arc<Mutex<Option<String>>>,
}

impl OpenAIRealtime {
    /// Build the WebSocket URL with model parameter.
    fn build_ws_url(&self) -> String {
        let base = self
            .config
            .endpoint
            .as_deref()
            .unwrap_or(OPENAI_REALTIME_URL);
        let model = if self.config.model.is_empty() {
            OPENAI_DEFAULT_MODEL
        } else {
            &self.config.model
        };
        format!("{base}?model={model}")
    }

    /// Build the session configuration for a call.
    fn build_session_config(&self, setup: &SessionSetup) -> SessionConfig {
        let voice = setup
            .voice
            .as_deref()
            .map(OpenAIRealtimeVoice::from_str_or_default)
            .unwrap_or(self.voice);
        let vad = ServerVadSettings::default();
        let transcription_model = self
            .config
            .transcription_model
            .clone()
            .unwrap_or_else(|| OPENAI_DEFAULT_TRANSCRIPTION_MODEL.to_string());

        SessionConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: Some(setup.instructions.clone()),
            voice: Some(voice.as_str().to_string()),
            input_audio_format: Some("pcm16".to_string()),
            output_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: Some(InputAudioTranscription {
                model: transcription_model,
            }),
            turn_detection: Some(TurnDetection::ServerVad {
                threshold: Some(vad.threshold),
                prefix_padding_ms: Some(vad.prefix_padding_ms),
                silence_duration_ms: Some(vad.silence_duration_ms),
                create_response: Some(false),
                interrupt_response: Some(false),
            }),
            tools: (!setup.tools.is_empty()).then(|| {
                setup
                    .tools
                    .iter()
                    .map(|t| ToolDef {
                        tool_type: "function".to_string(),
                        name: t.name.clone(),
                        description: Some(t.description.clone()),
                        parameters: Some(t.parameters.clone()),
                    })
                    .collect()
            }),
            tool_choice: (!setup.tools.is_empty()).then(|| "auto".to_string()),
            temperature: self.config.temperature,
        }
    }

    /// Translate a server event into the provider-neutral event stream.
    fn translate_server_event(event: ServerEvent, ctx: &mut EventContext) -> Option<RealtimeEvent> {
        match event {
            ServerEvent::SessionCreated { session } => {
                tracing::info!(session_id = %session.id, model = %session.model, "OpenAI Realtime session created");
                None
            }

            ServerEvent::SessionUpdated { session } => {
                tracing::debug!("OpenAI Realtime session updated: {}", session.id);
                Some(RealtimeEvent::SessionReady {
                    session_id: Some(session.id),
                })
            }

            ServerEvent::Error { error } => {
                if error.code.as_deref() == Some(CANCEL_NOT_ACTIVE_CODE) {
                    let response_id = ctx.pending_cancel.lock().take();
                    tracing::debug!(?response_id, "Cancel was a no-op, response not active");
                    return Some(RealtimeEvent::CancelRejected { response_id });
                }
                tracing::warn!(
                    "OpenAI Realtime error: {} - {}",
                    error.error_type,
                    error.message
                );
                Some(RealtimeEvent::Error(ProviderErrorInfo {
                    code: error.code.unwrap_or(error.error_type),
                    message: error.message,
                    response_id: None,
                }))
            }

            ServerEvent::SpeechStarted { audio_start_ms } => {
                tracing::debug!("Speech started at {}ms", audio_start_ms);
                Some(RealtimeEvent::SpeechStarted)
            }

            ServerEvent::SpeechStopped { audio_end_ms } => {
                tracing::debug!("Speech stopped at {}ms", audio_end_ms);
                Some(RealtimeEvent::SpeechStopped)
            }

            ServerEvent::TranscriptionCompleted {
                item_id,
                transcript,
            } => {
                tracing::debug!(item_id = %item_id, "User transcript: {}", transcript);
                Some(RealtimeEvent::UserTranscript {
                    text: transcript,
                    is_final: true,
                    emotion: None,
                })
            }

            ServerEvent::ResponseCreated { response } => {
                tracing::debug!("Response created: {}", response.id);
                Some(RealtimeEvent::ResponseCreated {
                    response_id: response.id,
                })
            }

            ServerEvent::AudioDelta { response_id, delta } => {
                let decoded = ServerEvent::decode_audio_delta(&delta)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| pcm16_from_le_bytes(&bytes).map_err(|e| e.to_string()));
                match decoded {
                    Ok(samples) => Some(RealtimeEvent::Audio(RealtimeAudioData {
                        response_id,
                        samples,
                        sample_rate: OPENAI_REALTIME_SAMPLE_RATE,
                    })),
                    Err(e) => {
                        tracing::warn!(response_id = %response_id, "Failed to decode audio delta: {}", e);
                        Some(RealtimeEvent::Error(ProviderErrorInfo {
                            code: "audio_decode".to_string(),
                            message: e,
                            response_id: Some(response_id),
                        }))
                    }
                }
            }

            ServerEvent::AudioTranscriptDelta { .. } => None,

            ServerEvent::AudioTranscriptDone {
                response_id,
                transcript,
            } => {
                tracing::debug!("Assistant transcript: {}", transcript);
                Some(RealtimeEvent::AssistantTranscript {
                    response_id,
                    text: transcript,
                })
            }

            // Track function calls when output items are added; the
            // arguments-done event does not carry the function name
            ServerEvent::OutputItemAdded { item, .. } => {
                if item.item_type == "function_call"
                    && let (Some(call_id), Some(name)) = (item.call_id, item.name)
                {
                    tracing::debug!("Tracking function call: call_id={}, name={}", call_id, name);
                    ctx.pending_function_calls.insert(call_id, name);
                }
                None
            }

            ServerEvent::FunctionCallArgumentsDone {
                response_id,
                call_id,
                arguments,
            } => {
                let name = ctx
                    .pending_function_calls
                    .remove(&call_id)
                    .unwrap_or_else(|| {
                        tracing::warn!("Function name not found for call_id: {}", call_id);
                        String::new()
                    });
                tracing::debug!(
                    "Function call complete: name={}, call_id={}, args={}",
                    name,
                    call_id,
                    arguments
                );
                Some(RealtimeEvent::FunctionCall(FunctionCallRequest {
                    call_id,
                    name,
                    arguments,
                    response_id: Some(response_id),
                }))
            }

            ServerEvent::ResponseDone { response } => {
                let status = ResponseStatus::parse(&response.status);
                let reason = response.status_reason();
                {
                    let mut pending = ctx.pending_cancel.lock();
                    if pending.as_deref() == Some(response.id.as_str()) {
                        *pending = None;
                    }
                }
                tracing::debug!(response_id = %response.id, %status, ?reason, "Response done");
                Some(RealtimeEvent::ResponseDone {
                    response_id: response.id,
                    status,
                    reason,
                })
            }

            ServerEvent::Unknown => {
                tracing::trace!("Unhandled server event");
                None
            }
        }
    }

    /// Send an event to the WebSocket.
    async fn send_event(&self, event: ClientEvent) -> RealtimeResult<()> {
        if !self.is_ready() {
            return Err(RealtimeError::NotConnected);
        }
        let sender = self.ws_sender.as_ref().ok_or(RealtimeError::NotConnected)?;
        sender
            .send(event)
            .await
            .map_err(|e| RealtimeError::WebSocketError(e.to_string()))
    }
}

#[async_trait]
impl BaseRealtime for OpenAIRealtime {
    fn new(config: RealtimeConfig) -> RealtimeResult<Self> {
        if config.api_key.is_empty() {
            return Err(RealtimeError::AuthenticationFailed(
                "API key is required".to_string(),
            ));
        }

        let voice = config
            .voice
            .as_deref()
            .map(OpenAIRealtimeVoice::from_str_or_default)
            .unwrap_or_default();

        Ok(Self {
            config,
            voice,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connected: Arc::new(AtomicBool::new(false)),
            ws_sender: None,
            pending_cancel: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
            connection_handle: None,
        })
    }

    async fn connect(&mut self) -> RealtimeResult<mpsc::Receiver<RealtimeEvent>> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(RealtimeError::InvalidConfiguration(
                "already connected".to_string(),
            ));
        }

        *self.state.write() = ConnectionState::Connecting;

        let url = self.build_ws_url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::ConnectionFailed(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|e| RealtimeError::AuthenticationFailed(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let ws_stream =
            match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request))
                .await
            {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(e)) => {
                    *self.state.write() = ConnectionState::Failed;
                    return Err(RealtimeError::ConnectionFailed(e.to_string()));
                }
                Err(_) => {
                    *self.state.write() = ConnectionState::Failed;
                    return Err(RealtimeError::Timeout(format!(
                        "OpenAI Realtime connect exceeded {}ms",
                        self.config.connect_timeout_ms
                    )));
                }
            };

        tracing::info!("Connected to OpenAI Realtime API");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<ClientEvent>(WS_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel::<RealtimeEvent>(EVENT_CHANNEL_CAPACITY);
        self.ws_sender = Some(tx);

        let state = self.state.clone();
        let connected = self.connected.clone();
        let shutdown = self.shutdown.clone();
        let mut ctx = EventContext {
            pending_function_calls: HashMap::new(),
            pending_cancel: self.pending_cancel.clone(),
        };

        self.connected.store(true, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Connected;

        let handle = tokio::spawn(async move {
            // None when the loop ended on request
            let lost: Option<String> = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break None;
                    }

                    Some(event) = rx.recv() => {
                        let json = match serde_json::to_string(&event) {
                            Ok(j) => j,
                            Err(e) => {
                                tracing::error!("Failed to serialize event: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                            break Some(format!("send failed: {e}"));
                        }
                    }

                    msg = ws_stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerEvent>(&text) {
                                    Ok(event) => {
                                        if let Some(ev) = Self::translate_server_event(event, &mut ctx)
                                            && events_tx.send(ev).await.is_err()
                                        {
                                            // Session gone
                                            break None;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Failed to parse server event: {}", e);
                                    }
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                tracing::info!("WebSocket closed by server: {:?}", frame);
                                break Some(frame.map(|f| f.reason.to_string()).unwrap_or_else(|| "closed by provider".to_string()));
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    tracing::error!("Failed to send pong: {}", e);
                                }
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break Some(e.to_string()),
                            None => break Some("stream ended".to_string()),
                        }
                    }
                }
            };

            connected.store(false, Ordering::SeqCst);
            match lost {
                Some(reason) => {
                    tracing::warn!(%reason, "OpenAI Realtime connection lost");
                    *state.write() = ConnectionState::Failed;
                    let _ = events_tx.send(RealtimeEvent::Disconnected { reason }).await;
                }
                None => {
                    *state.write() = ConnectionState::Disconnected;
                    tracing::info!("OpenAI Realtime connection task ended");
                }
            }
        });

        self.connection_handle = Some(handle);
        Ok(events_rx)
    }

    async fn disconnect(&self) -> RealtimeResult<()> {
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Disconnected;
        tracing::info!("Disconnected from OpenAI Realtime API");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn get_connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn turn_taking(&self) -> TurnTaking {
        TurnTaking::Explicit
    }

    fn sample_rate(&self) -> u32 {
        OPENAI_REALTIME_SAMPLE_RATE
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }

    async fn configure_session(&self, setup: &SessionSetup) -> RealtimeResult<()> {
        setup.validate()?;
        let session = self.build_session_config(setup);
        self.send_event(ClientEvent::SessionUpdate { session }).await
    }

    async fn send_audio(&self, samples: &[i16]) -> RealtimeResult<()> {
        self.send_event(ClientEvent::audio_append(&pcm16_to_le_bytes(samples)))
            .await
    }

    async fn send_text(&self, text: &str) -> RealtimeResult<()> {
        self.send_event(ClientEvent::ConversationItemCreate {
            item: ConversationItem::user_text(text),
        })
        .await
    }

    async fn create_response(&self) -> RealtimeResult<()> {
        self.send_event(ClientEvent::ResponseCreate).await
    }

    async fn cancel_response(&self, response_id: &str) -> RealtimeResult<()> {
        *self.pending_cancel.lock() = Some(response_id.to_string());
        self.send_event(ClientEvent::ResponseCancel {
            response_id: Some(response_id.to_string()),
        })
        .await
    }

    async fn submit_function_result(&self, call_id: &str, output: &str) -> RealtimeResult<()> {
        self.send_event(ClientEvent::ConversationItemCreate {
            item: ConversationItem::function_output(call_id, output),
        })
        .await
    }
}

impl Drop for OpenAIRealtime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::realtime::base::ToolDefinition;

    fn client() -> OpenAIRealtime {
        OpenAIRealtime::new(RealtimeConfig {
            api_key: "test_key".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn parse(json: &str) -> ServerEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_api_key_required() {
        let result = OpenAIRealtime::new(RealtimeConfig::default());
        assert!(matches!(result, Err(RealtimeError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_build_ws_url() {
        let realtime = client();
        assert_eq!(
            realtime.build_ws_url(),
            "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview"
        );

        let realtime = OpenAIRealtime::new(RealtimeConfig {
            api_key: "k".to_string(),
            model: "gpt-4o-mini-realtime-preview".to_string(),
            endpoint: Some("ws://127.0.0.1:9000/v1/realtime".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            realtime.build_ws_url(),
            "ws://127.0.0.1:9000/v1/realtime?model=gpt-4o-mini-realtime-preview"
        );
    }

    #[test]
    fn test_session_config_disables_auto_response() {
        let realtime = client();
        let setup = SessionSetup {
            instructions: "Be brief.".to_string(),
            voice: Some("shimmer".to_string()),
            tools: vec![ToolDefinition::end_call()],
        };
        let session = realtime.build_session_config(&setup);
        assert_eq!(session.voice.as_deref(), Some("shimmer"));
        match session.turn_detection {
            Some(TurnDetection::ServerVad {
                create_response,
                interrupt_response,
                ..
            }) => {
                assert_eq!(create_response, Some(false));
                assert_eq!(interrupt_response, Some(false));
            }
            other => panic!("unexpected turn detection: {other:?}"),
        }
        let tools = session.tools.unwrap();
        assert_eq!(tools[0].name, "end_call");
        assert_eq!(tools[0].tool_type, "function");
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let realtime = client();
        assert!(matches!(
            realtime.send_audio(&[0; 480]).await,
            Err(RealtimeError::NotConnected)
        ));
        assert!(matches!(
            realtime.create_response().await,
            Err(RealtimeError::NotConnected)
        ));
        assert_eq!(
            realtime.get_connection_state(),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn test_translate_cancel_not_active() {
        let mut ctx = EventContext::default();
        *ctx.pending_cancel.lock() = Some("resp_1".to_string());
        let event = parse(
            r#"{"type":"error","error":{"type":"invalid_request_error","code":"response_cancel_not_active","message":"no active response"}}"#,
        );
        match OpenAIRealtime::translate_server_event(event, &mut ctx) {
            Some(RealtimeEvent::CancelRejected { response_id }) => {
                assert_eq!(response_id.as_deref(), Some("resp_1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ctx.pending_cancel.lock().is_none());
    }

    #[test]
    fn test_translate_response_done_clears_pending_cancel() {
        let mut ctx = EventContext::default();
        *ctx.pending_cancel.lock() = Some("resp_2".to_string());
        let event = parse(
            r#"{"type":"response.done","response":{"id":"resp_2","status":"cancelled","status_details":{"reason":"client_cancelled"}}}"#,
        );
        match OpenAIRealtime::translate_server_event(event, &mut ctx) {
            Some(RealtimeEvent::ResponseDone {
                response_id,
                status,
                reason,
            }) => {
                assert_eq!(response_id, "resp_2");
                assert_eq!(status, ResponseStatus::Cancelled);
                assert_eq!(reason.as_deref(), Some("client_cancelled"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ctx.pending_cancel.lock().is_none());
    }

    #[test]
    fn test_translate_audio_delta() {
        use base64::prelude::*;
        let mut ctx = EventContext::default();
        let pcm = pcm16_to_le_bytes(&[1, -2, 300]);
        let json = format!(
            r#"{{"type":"response.audio.delta","response_id":"resp_3","item_id":"i","output_index":0,"content_index":0,"delta":"{}"}}"#,
            BASE64_STANDARD.encode(pcm)
        );
        match OpenAIRealtime::translate_server_event(parse(&json), &mut ctx) {
            Some(RealtimeEvent::Audio(audio)) => {
                assert_eq!(audio.response_id, "resp_3");
                assert_eq!(audio.samples, vec![1, -2, 300]);
                assert_eq!(audio.sample_rate, 24000);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_translate_function_call_uses_tracked_name() {
        let mut ctx = EventContext::default();
        let added = parse(
            r#"{"type":"response.output_item.added","response_id":"resp_4","output_index":0,"item":{"type":"function_call","call_id":"call_1","name":"end_call"}}"#,
        );
        assert!(OpenAIRealtime::translate_server_event(added, &mut ctx).is_none());

        let done = parse(
            r#"{"type":"response.function_call_arguments.done","response_id":"resp_4","item_id":"i","output_index":0,"call_id":"call_1","arguments":"{}"}"#,
        );
        match OpenAIRealtime::translate_server_event(done, &mut ctx) {
            Some(RealtimeEvent::FunctionCall(call)) => {
                assert_eq!(call.name, "end_call");
                assert_eq!(call.response_id.as_deref(), Some("resp_4"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ctx.pending_function_calls.is_empty());
    }
}
