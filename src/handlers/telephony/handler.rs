//! Telephony media stream WebSocket handler

use axum::{
    Extension,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::core::call::{CallHandle, CallMetadata, TransportCommand, spawn_call};
use crate::middleware::CallSlot;
use crate::state::AppState;

use super::messages::{StartPayload, TelephonyIncoming, TelephonyOutgoing};

/// Transport command buffer between the call and the socket writer
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket message size (1 MB); carrier frames are a few hundred bytes
const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long the socket writer may take to drain after the call ends
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Upgrades `GET /telephony/stream` to the carrier media WebSocket.
pub async fn telephony_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    slot: Option<Extension<CallSlot>>,
) -> Response {
    debug!("Telephony WebSocket upgrade requested");
    let slot = slot.map(|Extension(slot)| slot);

    ws.max_message_size(MAX_WS_MESSAGE_SIZE)
        .max_frame_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_telephony_socket(socket, state, slot))
}

/// Result of waiting for the `start` frame.
#[derive(Debug)]
enum StartWait {
    Started {
        stream_sid: String,
        start: StartPayload,
    },
    /// `media` arrived with no `start` before it
    Ghost,
    Closed,
}

async fn handle_telephony_socket(socket: WebSocket, state: Arc<AppState>, _slot: Option<CallSlot>) {
    let (mut sink, mut stream) = socket.split();

    let (stream_sid, start) = match timeout(state.start_timeout(), wait_for_start(&mut stream)).await
    {
        Ok(StartWait::Started { stream_sid, start }) => (stream_sid, start),
        Ok(StartWait::Ghost) => {
            warn!("Rejecting telephony stream: media before start");
            close_with(&mut sink, close_code::POLICY, "start required").await;
            return;
        }
        Ok(StartWait::Closed) => {
            info!("Telephony stream closed before start");
            return;
        }
        Err(_) => {
            warn!(
                timeout_ms = state.config.start_timeout_ms,
                "Rejecting telephony stream: no start frame"
            );
            close_with(&mut sink, close_code::POLICY, "start timeout").await;
            return;
        }
    };

    if let Err(reason) = start.validate_media_format() {
        warn!(stream_sid = %stream_sid, reason = %reason, "Rejecting telephony stream");
        close_with(&mut sink, close_code::UNSUPPORTED, "unsupported media format").await;
        return;
    }

    let meta: CallMetadata = start.into_metadata(stream_sid.clone());
    info!(
        call_id = %meta.call_id,
        stream_sid = %meta.stream_sid,
        direction = meta.direction.as_str(),
        business_id = ?meta.business_id,
        "Telephony stream started"
    );

    let (transport_tx, transport_rx) = mpsc::channel::<TransportCommand>(CHANNEL_BUFFER_SIZE);
    let mut handle = match spawn_call(state.services.clone(), meta, transport_tx) {
        Ok(handle) => handle,
        Err(e) => {
            error!(stream_sid = %stream_sid, error = %e, "Failed to start call");
            close_with(&mut sink, close_code::ERROR, "call setup failed").await;
            return;
        }
    };

    let mut sender_task = tokio::spawn(run_sender(sink, transport_rx, stream_sid));
    let mut sender_done = false;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if !process_telephony_message(msg, &mut handle) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        info!(call_id = %handle.call_id(), error = %e, "Telephony socket error");
                        break;
                    }
                    None => {
                        info!(call_id = %handle.call_id(), "Telephony socket closed by carrier");
                        break;
                    }
                }
            }
            // The call ended on its own and the close frame has gone out
            _ = &mut sender_task => {
                sender_done = true;
                break;
            }
        }
    }

    let call_id = handle.call_id().to_string();
    match handle.close().await {
        Some(outcome) => info!(
            call_id = %call_id,
            reason = %outcome.reason,
            dropped_frames = outcome.drops.total,
            transcript_entries = outcome.transcript.len(),
            "Telephony stream finished"
        ),
        None => warn!(call_id = %call_id, "Call ended without an outcome"),
    }

    if !sender_done && timeout(SENDER_DRAIN_TIMEOUT, &mut sender_task).await.is_err() {
        debug!(call_id = %call_id, "Socket writer did not drain in time");
        sender_task.abort();
    }
}

async fn wait_for_start(stream: &mut WsStream) -> StartWait {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => return StartWait::Closed,
            Ok(_) => continue,
        };
        match serde_json::from_str::<TelephonyIncoming>(&text) {
            Ok(TelephonyIncoming::Start { stream_sid, start }) => {
                return StartWait::Started { stream_sid, start };
            }
            Ok(TelephonyIncoming::Media { .. }) => return StartWait::Ghost,
            Ok(TelephonyIncoming::Stop { .. }) => return StartWait::Closed,
            Ok(TelephonyIncoming::Connected { protocol }) => {
                debug!(protocol = ?protocol, "Telephony stream connected");
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "Ignoring unparseable telephony frame"),
        }
    }
    StartWait::Closed
}

/// Handle one carrier frame after `start`. Returns false when the stream is over.
fn process_telephony_message(msg: Message, handle: &mut CallHandle) -> bool {
    let text = match msg {
        Message::Text(text) => text,
        Message::Close(frame) => {
            info!(call_id = %handle.call_id(), frame = ?frame, "Telephony close frame");
            return false;
        }
        _ => return true,
    };

    match serde_json::from_str::<TelephonyIncoming>(&text) {
        Ok(TelephonyIncoming::Media { media, .. }) => {
            if !media.is_caller_track() {
                return true;
            }
            match media.decode() {
                Ok(bytes) => {
                    let accepted = handle.push_caller_audio(&bytes);
                    trace!(bytes = bytes.len(), frames = accepted, "Caller media");
                }
                Err(e) => debug!(call_id = %handle.call_id(), error = %e, "Bad media payload"),
            }
            true
        }
        Ok(TelephonyIncoming::Stop { .. }) => {
            info!(call_id = %handle.call_id(), "Telephony stream stopped");
            false
        }
        Ok(TelephonyIncoming::Mark { mark }) => {
            trace!(name = %mark.name, "Mark acknowledged");
            true
        }
        Ok(TelephonyIncoming::Start { .. }) => {
            warn!(call_id = %handle.call_id(), "Ignoring repeated start frame");
            true
        }
        Ok(_) => true,
        Err(e) => {
            debug!(call_id = %handle.call_id(), error = %e, "Ignoring unparseable telephony frame");
            true
        }
    }
}

/// Writes call output to the socket until the call closes it.
async fn run_sender(
    mut sink: WsSink,
    mut commands: mpsc::Receiver<TransportCommand>,
    stream_sid: String,
) {
    while let Some(command) = commands.recv().await {
        let outgoing = match command {
            TransportCommand::Media { payload } => TelephonyOutgoing::media(&stream_sid, payload),
            TransportCommand::Clear => TelephonyOutgoing::clear(&stream_sid),
            TransportCommand::Close { reason } => {
                debug!(stream_sid = %stream_sid, reason = %reason, "Closing telephony socket");
                close_with(&mut sink, close_code::NORMAL, reason.as_str()).await;
                return;
            }
        };

        let json = match serde_json::to_string(&outgoing) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize telephony message: {}", e);
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(json.into())).await {
            debug!(stream_sid = %stream_sid, error = %e, "Telephony socket write failed");
            return;
        }
    }
}

async fn close_with(sink: &mut WsSink, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}
