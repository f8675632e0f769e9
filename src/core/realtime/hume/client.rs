//! Hume EVI WebSocket client implementation.
//!
//! EVI runs its own turn-taking: it decides when the caller has finished and
//! replies without being asked. EVI has no response ids, so the client
//! numbers assistant turns itself (`hume-turn-N`) and reports them with the
//! same lifecycle events as an explicit backend.
//!
//! # Example
//!
//! ```rust,ignore
//! use callvox_gateway::core::realtime::{BaseRealtime, HumeEVI, RealtimeConfig};
//!
//! let mut evi = HumeEVI::new(RealtimeConfig {
//!     api_key: "your-api-key".to_string(),
//!     config_id: Some("your-config-id".to_string()),
//!     ..Default::default()
//! })?;
//! let mut events = evi.connect().await?;
//! evi.configure_session(&setup).await?;
//! evi.create_response().await?; // bot speaks first
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::HumeEVIConfig;
use super::messages::{
    AudioEncoding, AudioInput, AudioSettings, EVIClientMessage, EVIServerMessage, HumeTool,
    SessionSettings, StopAssistant, TextInput, ToolResponse,
};
use crate::core::audio::pcm16_to_le_bytes;
use crate::core::realtime::base::{
    BaseRealtime, ConnectionState, EVENT_CHANNEL_CAPACITY, FunctionCallRequest,
    ProviderErrorInfo, RealtimeAudioData, RealtimeConfig, RealtimeError, RealtimeEvent,
    RealtimeResult, ResponseStatus, SessionSetup, TurnTaking,
};

/// Channel capacity for WebSocket message sending.
const WS_CHANNEL_CAPACITY: usize = 256;

/// Prefix of synthesized response ids.
const TURN_ID_PREFIX: &str = "hume-turn-";

// =============================================================================
// Turn Tracking
// =============================================================================

/// Synthetic response ids for EVI assistant turns.
#[derive(Debug, Default)]
struct HumeTurnState {
    counter: u64,
    /// Turn currently producing output
    active: Option<String>,
    /// Turn stopped by the gateway whose tail may still arrive
    stopped: Option<String>,
}

impl HumeTurnState {
    /// Id that assistant output should carry, opening a turn if needed.
    fn output_turn(&mut self, out: &mut Vec<RealtimeEvent>) -> String {
        if let Some(id) = self.active.as_ref().or(self.stopped.as_ref()) {
            return id.clone();
        }
        self.counter += 1;
        let id = format!("{TURN_ID_PREFIX}{}", self.counter);
        self.active = Some(id.clone());
        out.push(RealtimeEvent::ResponseCreated {
            response_id: id.clone(),
        });
        id
    }
}

/// Decode one EVI audio chunk (a complete WAV file) to mono PCM16.
fn decode_wav(bytes: &[u8]) -> Result<(Vec<i16>, u32), String> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(format!(
            "unsupported WAV format: {} bit {:?}",
            spec.bits_per_sample, spec.sample_format
        ));
    }
    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<i16>, _>>()
        .map_err(|e| e.to_string())?;

    let mono = match spec.channels {
        1 => samples,
        n => samples
            .chunks(n as usize)
            .map(|c| (c.iter().map(|&s| s as i32).sum::<i32>() / c.len() as i32) as i16)
            .collect(),
    };
    Ok((mono, spec.sample_rate))
}

// =============================================================================
// HumeEVI Client
// =============================================================================

/// Hume EVI (Empathic Voice Interface) realtime client.
pub struct HumeEVI {
    config: HumeEVIConfig,
    state: Arc<RwLock<ConnectionState>>,
    connected: Arc<AtomicBool>,
    ws_sender: Option<mpsc::Sender<EVIClientMessage>>,
    /// Kept so cancel outcomes can be reported from the caller's side
    events_tx: Option<mpsc::Sender<RealtimeEvent>>,
    turn: Arc<Mutex<HumeTurnState>>,
    chat_id: Arc<Mutex<Option<String>>>,
    shutdown: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl HumeEVI {
    /// Create a new HumeEVI client from HumeEVIConfig.
    pub fn from_hume_config(config: HumeEVIConfig) -> RealtimeResult<Self> {
        config
            .validate()
            .map_err(RealtimeError::InvalidConfiguration)?;

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            connected: Arc::new(AtomicBool::new(false)),
            ws_sender: None,
            events_tx: None,
            turn: Arc::new(Mutex::new(HumeTurnState::default())),
            chat_id: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
            task_handle: None,
        })
    }

    /// Chat id reported by EVI on connect.
    pub fn chat_id(&self) -> Option<String> {
        self.chat_id.lock().clone()
    }

    async fn send_message(&self, msg: EVIClientMessage) -> RealtimeResult<()> {
        if !self.is_ready() {
            return Err(RealtimeError::NotConnected);
        }
        let sender = self.ws_sender.as_ref().ok_or(RealtimeError::NotConnected)?;
        sender
            .send(msg)
            .await
            .map_err(|e| RealtimeError::WebSocketError(e.to_string()))
    }

    /// Translate a server message into zero or more provider-neutral events.
    fn translate_server_message(
        msg: EVIServerMessage,
        turn: &Mutex<HumeTurnState>,
        chat_id: &Mutex<Option<String>>,
    ) -> Vec<RealtimeEvent> {
        let mut out = Vec::new();
        match msg {
            EVIServerMessage::ChatMetadata(meta) => {
                info!(chat_id = %meta.chat_id, chat_group_id = ?meta.chat_group_id, "Hume EVI chat started");
                *chat_id.lock() = Some(meta.chat_id.clone());
                out.push(RealtimeEvent::SessionReady {
                    session_id: Some(meta.chat_id),
                });
            }

            EVIServerMessage::UserMessage(user_msg) => {
                let is_final = user_msg.is_final();
                if is_final {
                    // A finished caller utterance ends the stopped turn's tail
                    turn.lock().stopped = None;
                }
                let emotion = user_msg.dominant_emotion();
                debug!(is_final, ?emotion, "User: {}", user_msg.message.content);
                out.push(RealtimeEvent::UserTranscript {
                    text: user_msg.message.content,
                    is_final,
                    emotion,
                });
            }

            EVIServerMessage::UserInterruption(interruption) => {
                debug!(time = ?interruption.time, "User interruption");
                out.push(RealtimeEvent::SpeechStarted);
            }

            EVIServerMessage::AssistantMessage(asst_msg) => {
                let response_id = turn.lock().output_turn(&mut out);
                out.push(RealtimeEvent::AssistantTranscript {
                    response_id,
                    text: asst_msg.message.content,
                });
            }

            EVIServerMessage::AudioOutput(audio) => {
                let response_id = turn.lock().output_turn(&mut out);
                let decoded = audio
                    .decode_audio()
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| decode_wav(&bytes));
                match decoded {
                    Ok((samples, sample_rate)) => {
                        trace!(response_id = %response_id, samples = samples.len(), "Audio output");
                        out.push(RealtimeEvent::Audio(RealtimeAudioData {
                            response_id,
                            samples,
                            sample_rate,
                        }));
                    }
                    Err(e) => {
                        warn!(response_id = %response_id, "Failed to decode EVI audio: {}", e);
                        out.push(RealtimeEvent::Error(ProviderErrorInfo {
                            code: "audio_decode".to_string(),
                            message: e,
                            response_id: Some(response_id),
                        }));
                    }
                }
            }

            EVIServerMessage::AssistantEnd(_) => {
                let mut turn = turn.lock();
                if let Some(stopped) = turn.stopped.take() {
                    debug!(response_id = %stopped, "Stopped turn drained");
                } else if let Some(active) = turn.active.take() {
                    out.push(RealtimeEvent::ResponseDone {
                        response_id: active,
                        status: ResponseStatus::Completed,
                        reason: None,
                    });
                } else {
                    debug!("Assistant end without an open turn");
                }
            }

            EVIServerMessage::ToolCall(call) => {
                let response_id = turn.lock().active.clone();
                debug!(name = %call.name, call_id = %call.tool_call_id, "Tool call");
                out.push(RealtimeEvent::FunctionCall(FunctionCallRequest {
                    call_id: call.tool_call_id,
                    name: call.name,
                    arguments: call.parameters,
                    response_id,
                }));
            }

            EVIServerMessage::ToolError(err) => {
                warn!(call_id = %err.tool_call_id, "Hume EVI tool error: {}", err.error);
                out.push(RealtimeEvent::Error(ProviderErrorInfo {
                    code: err.code.unwrap_or_else(|| "tool_error".to_string()),
                    message: err.error,
                    response_id: turn.lock().active.clone(),
                }));
            }

            EVIServerMessage::Error(err) => {
                warn!("Hume EVI error: {} - {}", err.code, err.message);
                out.push(RealtimeEvent::Error(ProviderErrorInfo {
                    code: err.code,
                    message: err.message,
                    response_id: turn.lock().active.clone(),
                }));
            }

            EVIServerMessage::WebSocketError(err) => {
                warn!(code = ?err.code, "Hume EVI websocket error: {:?}", err.reason);
                out.push(RealtimeEvent::Error(ProviderErrorInfo {
                    code: err
                        .code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "websocket_error".to_string()),
                    message: err.reason.unwrap_or_default(),
                    response_id: None,
                }));
            }

            EVIServerMessage::Unknown => {
                trace!("Unhandled EVI message");
            }
        }
        out
    }
}

#[async_trait]
impl BaseRealtime for HumeEVI {
    fn new(config: RealtimeConfig) -> RealtimeResult<Self> {
        if config.api_key.is_empty() {
            return Err(RealtimeError::AuthenticationFailed(
                "API key is required".to_string(),
            ));
        }
        Self::from_hume_config(HumeEVIConfig::from_realtime_config(&config))
    }

    async fn connect(&mut self) -> RealtimeResult<mpsc::Receiver<RealtimeEvent>> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(RealtimeError::InvalidConfiguration(
                "already connected".to_string(),
            ));
        }

        *self.state.write() = ConnectionState::Connecting;

        let url = self.config.build_websocket_url();
        let connect_timeout = Duration::from_millis(self.config.connection_timeout_ms);

        debug!("Connecting to Hume EVI at {}", self.config.websocket_url);

        let ws_stream = match timeout(connect_timeout, connect_async(&url)).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                *self.state.write() = ConnectionState::Failed;
                return Err(RealtimeError::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                *self.state.write() = ConnectionState::Failed;
                return Err(RealtimeError::Timeout(format!(
                    "Hume EVI connect exceeded {}ms",
                    self.config.connection_timeout_ms
                )));
            }
        };

        info!("Connected to Hume EVI");

        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<EVIClientMessage>(WS_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel::<RealtimeEvent>(EVENT_CHANNEL_CAPACITY);
        self.ws_sender = Some(tx);
        self.events_tx = Some(events_tx.clone());

        let state = self.state.clone();
        let connected = self.connected.clone();
        let shutdown = self.shutdown.clone();
        let turn = self.turn.clone();
        let chat_id = self.chat_id.clone();

        self.connected.store(true, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Connected;

        let handle = tokio::spawn(async move {
            let lost: Option<String> = 'outer: loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break None;
                    }

                    Some(msg) = rx.recv() => {
                        let json = match serde_json::to_string(&msg) {
                            Ok(j) => j,
                            Err(e) => {
                                error!("Failed to serialize EVI message: {}", e);
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
                                match serde_json::from_str::<EVIServerMessage>(&text) {
                                    Ok(server_msg) => {
                                        for ev in Self::translate_server_message(server_msg, &turn, &chat_id) {
                                            if events_tx.send(ev).await.is_err() {
                                                break 'outer None;
                                            }
                                        }
                                    }
                                    Err(e) => warn!("Failed to parse EVI message: {}", e),
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    error!("Failed to send pong: {}", e);
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!("Hume EVI closed the connection: {:?}", frame);
                                break Some(frame.map(|f| f.reason.to_string()).unwrap_or_else(|| "closed by provider".to_string()));
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
                    warn!(%reason, "Hume EVI connection lost");
                    *state.write() = ConnectionState::Failed;
                    let _ = events_tx.send(RealtimeEvent::Disconnected { reason }).await;
                }
                None => {
                    *state.write() = ConnectionState::Disconnected;
                    debug!("Hume EVI connection task ended");
                }
            }
        });

        self.task_handle = Some(handle);
        Ok(events_rx)
    }

    async fn disconnect(&self) -> RealtimeResult<()> {
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Disconnected;
        info!("Disconnected from Hume EVI");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn get_connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn turn_taking(&self) -> TurnTaking {
        TurnTaking::Auto
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn provider_name(&self) -> &'static str {
        "hume"
    }

    async fn configure_session(&self, setup: &SessionSetup) -> RealtimeResult<()> {
        setup.validate()?;
        let settings = SessionSettings {
            audio: Some(AudioSettings {
                encoding: AudioEncoding::Linear16,
                sample_rate: self.config.sample_rate,
                channels: self.config.channels,
            }),
            system_prompt: Some(setup.instructions.clone()),
            voice_id: setup.voice.clone().or_else(|| self.config.voice_id.clone()),
            tools: (!setup.tools.is_empty())
                .then(|| setup.tools.iter().map(HumeTool::from).collect()),
        };
        self.send_message(EVIClientMessage::SessionSettings(settings))
            .await
    }

    async fn send_audio(&self, samples: &[i16]) -> RealtimeResult<()> {
        self.send_message(EVIClientMessage::AudioInput(AudioInput::from_bytes(
            &pcm16_to_le_bytes(samples),
        )))
        .await
    }

    async fn send_text(&self, text: &str) -> RealtimeResult<()> {
        self.send_message(EVIClientMessage::TextInput(TextInput {
            text: text.to_string(),
        }))
        .await
    }

    /// EVI replies on its own; an empty text input makes it take the first turn.
    async fn create_response(&self) -> RealtimeResult<()> {
        self.send_text("").await
    }

    async fn cancel_response(&self, response_id: &str) -> RealtimeResult<()> {
        self.send_message(EVIClientMessage::StopAssistant(StopAssistant {}))
            .await?;

        let outcome = {
            let mut turn = self.turn.lock();
            if turn.active.as_deref() == Some(response_id) {
                turn.active = None;
                turn.stopped = Some(response_id.to_string());
                RealtimeEvent::ResponseDone {
                    response_id: response_id.to_string(),
                    status: ResponseStatus::Cancelled,
                    reason: Some("stop_assistant".to_string()),
                }
            } else {
                RealtimeEvent::CancelRejected {
                    response_id: Some(response_id.to_string()),
                }
            }
        };

        if let Some(tx) = &self.events_tx {
            tx.send(outcome)
                .await
                .map_err(|e| RealtimeError::WebSocketError(e.to_string()))?;
        }
        Ok(())
    }

    async fn submit_function_result(&self, call_id: &str, output: &str) -> RealtimeResult<()> {
        self.send_message(EVIClientMessage::ToolResponse(ToolResponse {
            tool_call_id: call_id.to_string(),
            content: output.to_string(),
        }))
        .await
    }
}

impl Drop for HumeEVI {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

    fn wav_base64(samples: &[i16], sample_rate: u32, channels: u16) -> String {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        BASE64.encode(cursor.into_inner())
    }

    fn parse(json: &str) -> EVIServerMessage {
        serde_json::from_str(json).unwrap()
    }

    fn audio_msg(samples: &[i16]) -> EVIServerMessage {
        parse(&format!(
            r#"{{"type":"audio_output","id":"a","data":"{}"}}"#,
            wav_base64(samples, 24000, 1)
        ))
    }

    #[test]
    fn test_hume_evi_creation_empty_key() {
        let result = HumeEVI::new(RealtimeConfig::default());
        assert!(matches!(result, Err(RealtimeError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_hume_evi_capabilities() {
        let evi = HumeEVI::new(RealtimeConfig {
            api_key: "key".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(evi.turn_taking(), TurnTaking::Auto);
        assert_eq!(evi.provider_name(), "hume");
        assert_eq!(evi.get_connection_state(), ConnectionState::Disconnected);
        assert!(evi.chat_id().is_none());
    }

    #[tokio::test]
    async fn test_hume_evi_send_without_connection() {
        let evi = HumeEVI::new(RealtimeConfig {
            api_key: "key".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            evi.send_audio(&[0; 320]).await,
            Err(RealtimeError::NotConnected)
        ));
        assert!(matches!(
            evi.cancel_response("hume-turn-1").await,
            Err(RealtimeError::NotConnected)
        ));
    }

    #[test]
    fn test_decode_wav_downmixes_stereo() {
        let data = BASE64.decode(wav_base64(&[100, 300, -50, 50], 48000, 2)).unwrap();
        let (samples, rate) = decode_wav(&data).unwrap();
        assert_eq!(rate, 48000);
        assert_eq!(samples, vec![200, 0]);
        assert!(decode_wav(b"not a wav").is_err());
    }

    #[test]
    fn test_first_output_opens_turn() {
        let turn = Mutex::new(HumeTurnState::default());
        let chat_id = Mutex::new(None);

        let events = HumeEVI::translate_server_message(audio_msg(&[1, 2, 3]), &turn, &chat_id);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            RealtimeEvent::ResponseCreated { response_id } if response_id == "hume-turn-1"
        ));
        match &events[1] {
            RealtimeEvent::Audio(audio) => {
                assert_eq!(audio.response_id, "hume-turn-1");
                assert_eq!(audio.sample_rate, 24000);
                assert_eq!(audio.samples, vec![1, 2, 3]);
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Same turn continues
        let events = HumeEVI::translate_server_message(audio_msg(&[4]), &turn, &chat_id);
        assert_eq!(events.len(), 1);

        let events =
            HumeEVI::translate_server_message(parse(r#"{"type":"assistant_end"}"#), &turn, &chat_id);
        assert!(matches!(
            &events[0],
            RealtimeEvent::ResponseDone { response_id, status: ResponseStatus::Completed, .. }
                if response_id == "hume-turn-1"
        ));

        // Next output opens turn 2
        let events = HumeEVI::translate_server_message(audio_msg(&[5]), &turn, &chat_id);
        assert!(matches!(
            &events[0],
            RealtimeEvent::ResponseCreated { response_id } if response_id == "hume-turn-2"
        ));
    }

    #[test]
    fn test_stopped_turn_tail_is_tagged_stale() {
        let turn = Mutex::new(HumeTurnState {
            counter: 1,
            active: None,
            stopped: Some("hume-turn-1".to_string()),
        });
        let chat_id = Mutex::new(None);

        let events = HumeEVI::translate_server_message(audio_msg(&[9]), &turn, &chat_id);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RealtimeEvent::Audio(a) if a.response_id == "hume-turn-1"));

        // The stopped turn's end produces no second ResponseDone
        let events =
            HumeEVI::translate_server_message(parse(r#"{"type":"assistant_end"}"#), &turn, &chat_id);
        assert!(events.is_empty());
        assert!(turn.lock().stopped.is_none());
    }

    #[test]
    fn test_chat_metadata_and_interruption() {
        let turn = Mutex::new(HumeTurnState::default());
        let chat_id = Mutex::new(None);

        let events = HumeEVI::translate_server_message(
            parse(r#"{"type":"chat_metadata","chat_id":"chat_1","chat_group_id":"g"}"#),
            &turn,
            &chat_id,
        );
        assert!(matches!(&events[0], RealtimeEvent::SessionReady { session_id: Some(id) } if id == "chat_1"));
        assert_eq!(chat_id.lock().as_deref(), Some("chat_1"));

        let events = HumeEVI::translate_server_message(
            parse(r#"{"type":"user_interruption","time":1200}"#),
            &turn,
            &chat_id,
        );
        assert!(matches!(events[0], RealtimeEvent::SpeechStarted));
    }

    #[test]
    fn test_tool_call_carries_active_turn() {
        let turn = Mutex::new(HumeTurnState {
            counter: 3,
            active: Some("hume-turn-3".to_string()),
            stopped: None,
        });
        let chat_id = Mutex::new(None);
        let events = HumeEVI::translate_server_message(
            parse(r#"{"type":"tool_call","tool_call_id":"t1","name":"end_call","parameters":"{}"}"#),
            &turn,
            &chat_id,
        );
        match &events[0] {
            RealtimeEvent::FunctionCall(call) => {
                assert_eq!(call.name, "end_call");
                assert_eq!(call.response_id.as_deref(), Some("hume-turn-3"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
