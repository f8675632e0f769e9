//! Call session actor.
//!
//! One task per call owns the [`CallEngine`], the provider client and the
//! audio converters. The telephony handler talks to it through a
//! [`CallHandle`]: caller audio goes into a bounded ingress queue, and
//! everything for the caller comes back as [`TransportCommand`]s on a
//! channel. A paced writer task drains the egress queue.
//!
//! Lifecycle:
//! 1. [`spawn_call`] registers the call and starts the actor
//! 2. provider connect and prompt/voice/lead lookups run in parallel
//! 3. the main loop feeds the engine and executes its actions
//! 4. on hangup: writer drained, provider disconnected, registry entry
//!    removed, recording and transcript persisted in the background

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::engine::{CallAction, CallEngine, CallInput, Speaker, TranscriptEntry};
use super::registry::{CallRegistry, CallSummary};
use super::state::{CallDirection, CallMetadata, CallSession, CallState, CloseReason};
use super::timing::CallTimingConfig;
use super::watchdog::{DiagnosticSnapshot, TaskExit, spawn_supervised};
use super::{CallError, CallResult};
use crate::core::audio::{
    AudioFrame, DropCounters, DropReason, DropSnapshot, FRAME_DURATION_MS, FrameAssembler,
    FrameDirection, FrameQueue, StreamingResampler, TELEPHONY_SAMPLE_RATE, decode_mulaw,
    encode_mulaw,
};
use crate::core::realtime::{
    BaseRealtime, ProviderErrorInfo, RealtimeClient, RealtimeConfig, RealtimeEvent,
    RealtimeProvider, SessionSetup, ToolDefinition, create_realtime_client,
};
use crate::core::stores::{CallRecorder, LeadStore, PromptStore, RecordingSink};
use crate::core::vad::{EnergyVAD, VADConfig};

// =============================================================================
// Configuration
// =============================================================================

/// Per-call pipeline settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ingress (caller → AI) queue capacity in 20ms frames
    pub rx_queue_frames: usize,
    /// Egress (AI → caller) queue capacity in 20ms frames
    pub tx_queue_frames: usize,
    /// Engine timer period
    pub tick_ms: u64,
    /// Frames the writer may run ahead of real time
    pub egress_lead_frames: u32,
    /// Business block length of the compact greeting prompt; `None` sends
    /// the full prompt from the start
    pub compact_business_chars: Option<usize>,
    /// Recording length cap
    pub recording_max_seconds: u32,
    /// Bound on each teardown step
    pub teardown_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rx_queue_frames: 50,
            tx_queue_frames: 3000,
            tick_ms: 20,
            egress_lead_frames: 5,
            compact_business_chars: Some(600),
            recording_max_seconds: 3600,
            teardown_timeout_ms: 2000,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.rx_queue_frames == 0 || self.tx_queue_frames == 0 {
            return Err("queue capacities must be greater than 0".to_string());
        }
        if self.tick_ms == 0 || self.tick_ms > 100 {
            return Err(format!("tick_ms must be between 1 and 100, got {}", self.tick_ms));
        }
        Ok(())
    }
}

/// Everything a call needs from the process.
#[derive(Clone)]
pub struct CallServices {
    pub default_provider: RealtimeProvider,
    pub providers: Arc<HashMap<RealtimeProvider, RealtimeConfig>>,
    pub timing: CallTimingConfig,
    pub pipeline: PipelineConfig,
    pub vad: VADConfig,
    pub prompts: Arc<dyn PromptStore>,
    pub leads: Option<Arc<dyn LeadStore>>,
    pub recordings: Option<Arc<dyn RecordingSink>>,
    pub registry: Arc<CallRegistry>,
}

// =============================================================================
// Handle and transport commands
// =============================================================================

/// Output of a call towards the telephony socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// One 20ms frame of base64 μ-law
    Media { payload: String },
    /// Drop whatever the carrier has buffered
    Clear,
    /// The call is over; close the socket
    Close { reason: CloseReason },
}

/// Final report of a call.
#[derive(Debug)]
pub struct CallOutcome {
    pub call_id: String,
    pub reason: CloseReason,
    pub drops: DropSnapshot,
    pub transcript: Vec<TranscriptEntry>,
    /// Background persistence of recording and transcript
    pub persistence: Option<JoinHandle<()>>,
}

/// The transport side of a running call.
pub struct CallHandle {
    call_id: String,
    ingress: Arc<FrameQueue>,
    assembler: FrameAssembler,
    shutdown: CancellationToken,
    outcome: oneshot::Receiver<CallOutcome>,
}

impl CallHandle {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Queue one carrier media payload (8kHz μ-law). Returns the number of
    /// frames accepted.
    pub fn push_caller_audio(&mut self, mulaw: &[u8]) -> usize {
        let samples = decode_mulaw(mulaw);
        let mut accepted = 0;
        for frame in self.assembler.push(&samples) {
            if self.ingress.push(frame) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Ask the call to end as a server shutdown would.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The telephony stream ended; wait for the call to wind down.
    pub async fn close(mut self) -> Option<CallOutcome> {
        if let Some(frame) = self.assembler.finish() {
            self.ingress.push(frame);
        }
        self.ingress.close();
        self.outcome.await.ok()
    }

    /// Wait for the call to end on its own.
    pub async fn finished(self) -> Option<CallOutcome> {
        self.outcome.await.ok()
    }
}

/// Register a call and start its session actor.
pub fn spawn_call(
    services: CallServices,
    meta: CallMetadata,
    transport: mpsc::Sender<TransportCommand>,
) -> CallResult<CallHandle> {
    let provider = meta.provider.unwrap_or(services.default_provider);
    let config = services
        .providers
        .get(&provider)
        .cloned()
        .ok_or(CallError::ProviderNotConfigured(provider))?;
    let client = create_realtime_client(provider, config)?;

    let drops = Arc::new(DropCounters::new());
    let ingress = Arc::new(FrameQueue::new(
        services.pipeline.rx_queue_frames,
        DropReason::RxQueueFull,
        drops.clone(),
    ));
    let egress = Arc::new(FrameQueue::new(
        services.pipeline.tx_queue_frames,
        DropReason::TxQueueFull,
        drops.clone(),
    ));

    let session = CallSession::new(meta, provider);
    let call_id = session.call_id.clone();
    let shutdown = CancellationToken::new();
    if !services
        .registry
        .insert(CallSummary::from_session(&session), shutdown.clone())
    {
        return Err(CallError::DuplicateCall(call_id));
    }

    let uplink = match StreamingResampler::new(TELEPHONY_SAMPLE_RATE, client.sample_rate()) {
        Ok(r) => r,
        Err(e) => {
            services.registry.remove(&call_id);
            return Err(e.into());
        }
    };

    let engine = CallEngine::new(
        session,
        services.timing.clone(),
        client.turn_taking(),
        drops.clone(),
        Instant::now(),
    );
    let recorder = services.recordings.as_ref().map(|_| {
        Arc::new(Mutex::new(CallRecorder::new(
            TELEPHONY_SAMPLE_RATE,
            services.pipeline.recording_max_seconds,
        )))
    });
    let (panic_tx, panic_rx) = mpsc::unbounded_channel();
    let flush_epoch = Arc::new(AtomicU64::new(0));

    let actor = CallActor {
        vad: EnergyVAD::new(services.vad.clone()),
        services: services.clone(),
        engine,
        client,
        uplink,
        downlink: None,
        downlink_frames: FrameAssembler::new(FrameDirection::Outbound, TELEPHONY_SAMPLE_RATE),
        ingress: ingress.clone(),
        egress: egress.clone(),
        flush_epoch: flush_epoch.clone(),
        recorder,
        transport: transport.clone(),
        shutdown: shutdown.clone(),
        panic_tx,
        panic_rx,
        pending: VecDeque::new(),
        last_state: CallState::Init,
    };

    let (outcome_tx, outcome_rx) = oneshot::channel();
    let registry = services.registry.clone();
    let panicked_id = call_id.clone();
    let panicked_ingress = ingress.clone();
    spawn_supervised(
        call_id.clone(),
        "session",
        async move {
            let outcome = actor.run().await;
            let _ = outcome_tx.send(outcome);
        },
        move |message| {
            // Releases the egress writer, which would otherwise wait forever
            discard_media(&panicked_ingress, &egress, &flush_epoch);
            registry.remove(&panicked_id);
            let _ = transport.try_send(TransportCommand::Close {
                reason: CloseReason::TaskPanicked(format!("session: {message}")),
            });
        },
    );

    Ok(CallHandle {
        call_id,
        ingress,
        assembler: FrameAssembler::new(FrameDirection::Inbound, TELEPHONY_SAMPLE_RATE),
        shutdown,
        outcome: outcome_rx,
    })
}

// =============================================================================
// Actor
// =============================================================================

struct CallActor {
    services: CallServices,
    engine: CallEngine,
    client: RealtimeClient,
    vad: EnergyVAD,
    /// Telephony rate → provider input rate
    uplink: StreamingResampler,
    /// Provider output rate → telephony rate, built on first audio
    downlink: Option<StreamingResampler>,
    downlink_frames: FrameAssembler,
    ingress: Arc<FrameQueue>,
    egress: Arc<FrameQueue>,
    flush_epoch: Arc<AtomicU64>,
    recorder: Option<Arc<Mutex<CallRecorder>>>,
    transport: mpsc::Sender<TransportCommand>,
    shutdown: CancellationToken,
    panic_tx: mpsc::UnboundedSender<(String, String)>,
    panic_rx: mpsc::UnboundedReceiver<(String, String)>,
    /// Inputs raised while executing actions
    pending: VecDeque<CallInput>,
    last_state: CallState,
}

struct SetupOutcome {
    events: mpsc::Receiver<RealtimeEvent>,
    upgrade: Option<String>,
    voice: Option<String>,
}

/// Connect the provider while prompt, voice and caller context load.
async fn setup_call(
    client: &mut RealtimeClient,
    services: &CallServices,
    session: &CallSession,
) -> CallResult<SetupOutcome> {
    let business_id = session.business_id.as_deref();
    let direction = session.direction();
    let phone = match direction {
        CallDirection::Inbound => session.from.as_deref(),
        CallDirection::Outbound => session.to.as_deref(),
    };

    let connect = client.connect();
    let load = async {
        let (bundle, voice, lead) = tokio::join!(
            services.prompts.get_prompt(business_id, direction),
            services.prompts.get_voice(business_id),
            lookup_lead(services.leads.as_deref(), phone, &session.call_id),
        );
        Ok::<_, CallError>((bundle?, voice?, lead))
    };
    let (events, loaded) = tokio::join!(connect, load);
    let events = events?;
    let (bundle, voice, lead) = loaded?;

    let composed = bundle.compose(services.pipeline.compact_business_chars, lead.as_deref())?;
    client
        .configure_session(&SessionSetup {
            instructions: composed.initial,
            voice: voice.clone(),
            tools: vec![ToolDefinition::end_call()],
        })
        .await?;

    Ok(SetupOutcome {
        events,
        upgrade: composed.upgrade,
        voice,
    })
}

/// Lead lookups never fail a call.
async fn lookup_lead(
    leads: Option<&dyn LeadStore>,
    phone: Option<&str>,
    call_id: &str,
) -> Option<String> {
    let (store, phone) = (leads?, phone?);
    match store.find_by_phone(phone).await {
        Ok(lead) => lead.and_then(|l| l.prompt_context()),
        Err(e) => {
            warn!(call_id = %call_id, error = %e, "Lead lookup failed, continuing without caller context");
            None
        }
    }
}

enum SetupPhase {
    Ready(SetupOutcome),
    Failed(String),
    Ended(CloseReason),
}

impl CallActor {
    async fn run(mut self) -> CallOutcome {
        let call_id = self.engine.session().call_id.clone();
        info!(
            call_id = %call_id,
            provider = %self.engine.session().provider,
            direction = self.engine.session().direction().as_str(),
            "Call started"
        );
        self.engine.begin_setup();
        self.sync_state();

        let writer = self.spawn_writer(&call_id);

        let reason = match self.run_setup().await {
            SetupPhase::Ready(outcome) => {
                self.engine.set_voice(outcome.voice);
                let actions = self.engine.handle(
                    CallInput::SetupComplete {
                        upgrade_instructions: outcome.upgrade,
                    },
                    Instant::now(),
                );
                match self.execute_all(actions).await {
                    Some(reason) => reason,
                    None => self.run_conversation(outcome.events).await,
                }
            }
            SetupPhase::Failed(reason) => {
                error!(call_id = %call_id, %reason, "Call setup failed");
                let actions = self
                    .engine
                    .handle(CallInput::SetupFailed { reason: reason.clone() }, Instant::now());
                self.execute_all(actions)
                    .await
                    .unwrap_or(CloseReason::SetupFailed(reason))
            }
            SetupPhase::Ended(reason) => reason,
        };

        self.teardown(reason, writer).await
    }

    async fn run_setup(&mut self) -> SetupPhase {
        let session = self.engine.session().clone();
        let setup = setup_call(&mut self.client, &self.services, &session);
        tokio::pin!(setup);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SetupPhase::Ended(CloseReason::ServerShutdown),
                result = &mut setup => {
                    return match result {
                        Ok(outcome) => SetupPhase::Ready(outcome),
                        Err(e) => SetupPhase::Failed(e.to_string()),
                    };
                }
                frame = self.ingress.pop() => {
                    let input = match frame {
                        Some(frame) => caller_input(&mut self.vad, self.recorder.as_ref(), frame),
                        None => CallInput::TransportClosed,
                    };
                    // Nothing but drops and hangups can come out before setup
                    for action in self.engine.handle(input, Instant::now()) {
                        if let CallAction::Hangup { reason } = action {
                            return SetupPhase::Ended(reason);
                        }
                    }
                }
            }
        }
    }

    async fn run_conversation(&mut self, mut events: mpsc::Receiver<RealtimeEvent>) -> CloseReason {
        let mut tick = tokio::time::interval(Duration::from_millis(self.services.pipeline.tick_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let input = match self.pending.pop_front() {
                Some(input) => input,
                None => tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return CloseReason::ServerShutdown,
                    Some((task, message)) = self.panic_rx.recv() => {
                        CallInput::TaskPanicked { task, message }
                    }
                    event = events.recv() => match event {
                        Some(event) => CallInput::Provider(event),
                        None => CallInput::Provider(RealtimeEvent::Disconnected {
                            reason: "provider event stream ended".to_string(),
                        }),
                    },
                    frame = self.ingress.pop() => match frame {
                        Some(frame) => caller_input(&mut self.vad, self.recorder.as_ref(), frame),
                        None => CallInput::TransportClosed,
                    },
                    _ = tick.tick() => CallInput::Tick,
                },
            };

            let actions = self.engine.handle(input, Instant::now());
            if let Some(reason) = self.execute_all(actions).await {
                return reason;
            }
        }
    }

    fn sync_state(&mut self) {
        let state = self.engine.state();
        if state != self.last_state {
            self.last_state = state;
            self.services
                .registry
                .update_state(&self.engine.session().call_id, state);
        }
    }

    /// Run actions in order; stops at a hangup and returns its reason.
    async fn execute_all(&mut self, actions: Vec<CallAction>) -> Option<CloseReason> {
        self.sync_state();
        for action in actions {
            if let CallAction::Hangup { reason } = action {
                return Some(reason);
            }
            self.execute(action).await;
        }
        None
    }

    fn provider_failure(&mut self, code: &str, response_id: Option<String>, message: String) {
        self.pending
            .push_back(CallInput::Provider(RealtimeEvent::Error(ProviderErrorInfo {
                code: code.to_string(),
                message,
                response_id,
            })));
    }

    async fn execute(&mut self, action: CallAction) {
        let call_id = &self.engine.session().call_id;
        match action {
            CallAction::ForwardCallerAudio(frame) => {
                let samples = match self.uplink.process(&frame.samples) {
                    Ok(samples) => samples,
                    Err(e) => {
                        warn!(call_id = %call_id, error = %e, "Dropping caller audio, resample failed");
                        self.engine.drops().record(DropReason::ResampleFailed, 1);
                        return;
                    }
                };
                if samples.is_empty() {
                    return;
                }
                if let Err(e) = self.client.send_audio(&samples).await {
                    debug!(call_id = %call_id, error = %e, "Dropping caller audio, provider send failed");
                    self.engine.drops().record(DropReason::ProviderNotReady, 1);
                }
            }
            CallAction::CreateResponse => {
                if let Err(e) = self.client.create_response().await {
                    warn!(call_id = %call_id, error = %e, "response.create failed");
                    self.provider_failure("send_failed", None, e.to_string());
                }
            }
            CallAction::CancelResponse { response_id } => {
                if let Err(e) = self.client.cancel_response(&response_id).await {
                    warn!(call_id = %call_id, %response_id, error = %e, "response.cancel failed");
                }
            }
            CallAction::FlushEgress => {
                self.flush_epoch.fetch_add(1, Ordering::AcqRel);
                let flushed = self.egress.flush(DropReason::BargeInFlush);
                self.downlink_frames.clear();
                if let Some(downlink) = self.downlink.as_mut() {
                    downlink.reset();
                }
                debug!(call_id = %call_id, frames = flushed, "Egress flushed");
                let _ = self.transport.send(TransportCommand::Clear).await;
            }
            CallAction::PlayAudio {
                response_id,
                samples,
                sample_rate,
            } => self.play_audio(response_id, &samples, sample_rate),
            CallAction::UpdateSession { instructions } => {
                let setup = SessionSetup {
                    instructions,
                    voice: self.engine.session().voice.clone(),
                    tools: vec![ToolDefinition::end_call()],
                };
                if let Err(e) = self.client.configure_session(&setup).await {
                    warn!(call_id = %call_id, error = %e, "Prompt upgrade failed, keeping compact prompt");
                }
            }
            CallAction::SubmitFunctionResult { call_id: fn_call_id, output } => {
                if let Err(e) = self.client.submit_function_result(&fn_call_id, &output).await {
                    warn!(call_id = %call_id, function_call_id = %fn_call_id, error = %e, "Function result not delivered");
                }
            }
            CallAction::LogDiagnostics {
                response_id,
                waited_ms,
            } => {
                let now = Instant::now();
                DiagnosticSnapshot {
                    call_id: call_id.clone(),
                    provider: self.engine.session().provider,
                    provider_state: self.client.get_connection_state().to_string(),
                    waited_ms,
                    ingress_depth: self.ingress.len(),
                    egress_depth: self.egress.len(),
                    engine: self.engine.diagnostics(now),
                    drops: self.engine.drops().snapshot(),
                }
                .log();
                debug!(call_id = %call_id, ?response_id, "Diagnostics logged");
            }
            CallAction::Hangup { .. } => {}
        }
    }

    fn play_audio(&mut self, response_id: String, samples: &[i16], sample_rate: u32) {
        let rebuild = self
            .downlink
            .as_ref()
            .is_none_or(|r| r.input_rate() != sample_rate);
        if rebuild {
            match StreamingResampler::new(sample_rate, TELEPHONY_SAMPLE_RATE) {
                Ok(r) => self.downlink = Some(r),
                Err(e) => {
                    warn!(
                        call_id = %self.engine.session().call_id,
                        %response_id,
                        error = %e,
                        "Cannot convert assistant audio"
                    );
                    self.provider_failure("audio_format", Some(response_id), e.to_string());
                    return;
                }
            }
        }
        let Some(downlink) = self.downlink.as_mut() else {
            return;
        };
        let converted = match downlink.process(samples) {
            Ok(converted) => converted,
            Err(e) => {
                let per_frame = (sample_rate as usize * FRAME_DURATION_MS as usize / 1000).max(1);
                let frames = samples.len().div_ceil(per_frame).max(1);
                self.engine.drops().record(DropReason::ResampleFailed, frames as u64);
                self.provider_failure("audio_format", Some(response_id), e.to_string());
                return;
            }
        };
        for frame in self.downlink_frames.push(&converted) {
            self.egress.push(frame);
        }
    }

    fn spawn_writer(&self, call_id: &str) -> JoinHandle<TaskExit> {
        let writer = EgressWriter {
            egress: self.egress.clone(),
            transport: self.transport.clone(),
            recorder: self.recorder.clone(),
            drops: self.engine.drops().clone(),
            flush_epoch: self.flush_epoch.clone(),
            lead: Duration::from_millis(
                FRAME_DURATION_MS as u64 * self.services.pipeline.egress_lead_frames as u64,
            ),
        };
        let panic_tx = self.panic_tx.clone();
        spawn_supervised(call_id.to_string(), "egress_writer", writer.run(), move |message| {
            let _ = panic_tx.send(("egress_writer".to_string(), message));
        })
    }

    async fn teardown(
        mut self,
        reason: CloseReason,
        mut writer: JoinHandle<TaskExit>,
    ) -> CallOutcome {
        let call_id = self.engine.session().call_id.clone();
        let bound = Duration::from_millis(self.services.pipeline.teardown_timeout_ms);

        let (inbound, outbound) =
            discard_media(&self.ingress, &self.egress, &self.flush_epoch);
        debug!(call_id = %call_id, inbound, outbound, "Discarded queued media at hangup");
        if tokio::time::timeout(bound, &mut writer).await.is_err() {
            warn!(call_id = %call_id, "Egress writer did not drain in time");
            writer.abort();
        }
        let _ = self
            .transport
            .send(TransportCommand::Close {
                reason: reason.clone(),
            })
            .await;

        match tokio::time::timeout(bound, self.client.disconnect()).await {
            Ok(Err(e)) => warn!(call_id = %call_id, error = %e, "Provider disconnect failed"),
            Err(_) => warn!(call_id = %call_id, "Provider disconnect timed out"),
            Ok(Ok(())) => {}
        }

        self.engine.terminate(reason.clone());
        self.services.registry.remove(&call_id);

        let drops = self.engine.drops().snapshot();
        if drops.unknown() > 0 {
            warn!(call_id = %call_id, unknown = drops.unknown(), "Uncategorized frame drops");
        }
        if reason.is_expected() {
            info!(call_id = %call_id, %reason, drops = drops.total, "Call ended");
        } else {
            warn!(call_id = %call_id, %reason, drops = drops.total, "Call ended abnormally");
        }

        let transcript = self.engine.transcript().to_vec();
        let persistence = self.services.recordings.clone().map(|sink| {
            let recorder = self.recorder.take();
            let text = render_transcript(&transcript);
            let call_id = call_id.clone();
            tokio::spawn(persist_call(sink, call_id, recorder, text))
        });

        CallOutcome {
            call_id,
            reason,
            drops,
            transcript,
            persistence,
        }
    }
}

/// Stop both media directions at once: nothing queued is played or
/// forwarded after this, and later pushes count as session drops.
fn discard_media(
    ingress: &FrameQueue,
    egress: &FrameQueue,
    flush_epoch: &AtomicU64,
) -> (usize, usize) {
    ingress.close();
    egress.close();
    // Wakes a writer holding a popped frame
    flush_epoch.fetch_add(1, Ordering::AcqRel);
    (
        ingress.flush(DropReason::SessionClosed),
        egress.flush(DropReason::SessionClosed),
    )
}

fn caller_input(
    vad: &mut EnergyVAD,
    recorder: Option<&Arc<Mutex<CallRecorder>>>,
    frame: AudioFrame,
) -> CallInput {
    if let Some(recorder) = recorder {
        recorder.lock().push_caller(&frame.samples);
    }
    let vad = vad.process_frame(&frame.samples);
    CallInput::CallerAudio { frame, vad }
}

/// Write recording and transcript; failures are only logged.
async fn persist_call(
    sink: Arc<dyn RecordingSink>,
    call_id: String,
    recorder: Option<Arc<Mutex<CallRecorder>>>,
    transcript: String,
) {
    if let Some(recorder) = recorder {
        let wav = {
            let recorder = recorder.lock();
            if recorder.is_empty() {
                None
            } else {
                Some(recorder.to_wav())
            }
        };
        match wav {
            Some(Ok(bytes)) => {
                if let Err(e) = sink.write_recording(&call_id, bytes).await {
                    error!(call_id = %call_id, error = %e, "Failed to store recording");
                }
            }
            Some(Err(e)) => error!(call_id = %call_id, error = %e, "Failed to encode recording"),
            None => debug!(call_id = %call_id, "No audio recorded"),
        }
    }
    if !transcript.is_empty()
        && let Err(e) = sink.write_transcript(&call_id, &transcript).await
    {
        error!(call_id = %call_id, error = %e, "Failed to store transcript");
    }
}

/// One line per entry: `[mm:ss.mmm] speaker: text (emotion)`.
pub fn render_transcript(entries: &[TranscriptEntry]) -> String {
    entries
        .iter()
        .map(|entry| {
            let secs = entry.offset_ms / 1000;
            let speaker = match entry.speaker {
                Speaker::Caller => "caller",
                Speaker::Assistant => "assistant",
            };
            let emotion = entry
                .emotion
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default();
            format!(
                "[{:02}:{:02}.{:03}] {}: {}{}",
                secs / 60,
                secs % 60,
                entry.offset_ms % 1000,
                speaker,
                entry.text,
                emotion
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// =============================================================================
// Egress writer
// =============================================================================

/// Sends queued frames to the carrier at real-time pace, at most `lead`
/// ahead of the playout clock.
struct EgressWriter {
    egress: Arc<FrameQueue>,
    transport: mpsc::Sender<TransportCommand>,
    recorder: Option<Arc<Mutex<CallRecorder>>>,
    drops: Arc<DropCounters>,
    flush_epoch: Arc<AtomicU64>,
    lead: Duration,
}

impl EgressWriter {
    async fn run(self) {
        let mut playout: Option<tokio::time::Instant> = None;
        let mut epoch = self.flush_epoch.load(Ordering::Acquire);

        while let Some(frame) = self.egress.pop().await {
            let current = self.flush_epoch.load(Ordering::Acquire);
            if current != epoch {
                epoch = current;
                playout = None;
            }

            let now = tokio::time::Instant::now();
            let due = playout.filter(|t| *t > now).unwrap_or(now);
            if let Some(send_at) = due.checked_sub(self.lead)
                && send_at > now
            {
                tokio::time::sleep_until(send_at).await;
            }
            if self.egress.is_closed() {
                // Hung up while this frame waited
                self.drops.record(DropReason::SessionClosed, 1);
                continue;
            }
            if self.flush_epoch.load(Ordering::Acquire) != epoch {
                // Flushed while this frame waited
                self.drops.record(DropReason::BargeInFlush, 1);
                continue;
            }

            if let Some(recorder) = &self.recorder {
                recorder.lock().push_assistant(&frame.samples);
            }
            let payload = BASE64.encode(encode_mulaw(&frame.samples));
            if self
                .transport
                .send(TransportCommand::Media { payload })
                .await
                .is_err()
            {
                // Socket gone; this frame and what is left will never play
                self.drops.record(DropReason::TransportClosed, 1);
                let remaining = self.egress.flush(DropReason::TransportClosed) + 1;
                debug!(frames = remaining, "Transport closed under the egress writer");
                break;
            }
            playout = Some(due + Duration::from_millis(frame.duration_ms() as u64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_transcript() {
        let entries = vec![
            TranscriptEntry {
                speaker: Speaker::Assistant,
                text: "Hi, this is Acme.".to_string(),
                emotion: None,
                offset_ms: 1_250,
            },
            TranscriptEntry {
                speaker: Speaker::Caller,
                text: "I need to move my appointment".to_string(),
                emotion: Some("Determination".to_string()),
                offset_ms: 65_020,
            },
        ];
        assert_eq!(
            render_transcript(&entries),
            "[00:01.250] assistant: Hi, this is Acme.\n\
             [01:05.020] caller: I need to move my appointment (Determination)"
        );
        assert_eq!(render_transcript(&[]), "");
    }

    #[test]
    fn test_pipeline_config_validation() {
        assert!(PipelineConfig::default().validate().is_ok());
        let bad = PipelineConfig {
            tick_ms: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame {
            seq,
            direction: FrameDirection::Outbound,
            sample_rate: TELEPHONY_SAMPLE_RATE,
            samples: vec![1000; 160],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_paces_frames() {
        let drops = Arc::new(DropCounters::new());
        let egress = Arc::new(FrameQueue::new(100, DropReason::TxQueueFull, drops.clone()));
        let (tx, mut rx) = mpsc::channel(100);
        let writer = EgressWriter {
            egress: egress.clone(),
            transport: tx,
            recorder: None,
            drops,
            flush_epoch: Arc::new(AtomicU64::new(0)),
            lead: Duration::from_millis(40),
        };
        for seq in 0..10 {
            egress.push(frame(seq));
        }
        let start = tokio::time::Instant::now();
        let task = tokio::spawn(writer.run());

        // Three frames go out immediately: the lead covers two more
        for _ in 0..3 {
            assert!(matches!(rx.recv().await, Some(TransportCommand::Media { .. })));
        }
        assert!(start.elapsed() < Duration::from_millis(5));

        for _ in 3..10 {
            rx.recv().await.unwrap();
        }
        // Frame 9 is due at 180ms and may leave 40ms early
        assert!(start.elapsed() >= Duration::from_millis(140));

        egress.close();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_drops_frame_flushed_while_waiting() {
        let drops = Arc::new(DropCounters::new());
        let egress = Arc::new(FrameQueue::new(100, DropReason::TxQueueFull, drops.clone()));
        let flush_epoch = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::channel(100);
        let writer = EgressWriter {
            egress: egress.clone(),
            transport: tx,
            recorder: None,
            drops: drops.clone(),
            flush_epoch: flush_epoch.clone(),
            lead: Duration::ZERO,
        };
        egress.push(frame(0));
        egress.push(frame(1));
        egress.push(frame(2));
        let task = tokio::spawn(writer.run());

        rx.recv().await.unwrap();
        // Writer now holds frame 1 until 20ms
        tokio::time::sleep(Duration::from_millis(5)).await;
        flush_epoch.fetch_add(1, Ordering::AcqRel);
        egress.flush(DropReason::BargeInFlush);
        tokio::time::sleep(Duration::from_millis(30)).await;

        egress.close();
        task.await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(drops.get(DropReason::BargeInFlush), 2);
    }

    fn writer_for(
        egress: &Arc<FrameQueue>,
        drops: &Arc<DropCounters>,
        flush_epoch: &Arc<AtomicU64>,
        transport: mpsc::Sender<TransportCommand>,
    ) -> EgressWriter {
        EgressWriter {
            egress: egress.clone(),
            transport,
            recorder: None,
            drops: drops.clone(),
            flush_epoch: flush_epoch.clone(),
            lead: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_counts_frames_lost_with_transport() {
        let drops = Arc::new(DropCounters::new());
        let egress = Arc::new(FrameQueue::new(100, DropReason::TxQueueFull, drops.clone()));
        let (tx, rx) = mpsc::channel(100);
        drop(rx);
        for seq in 0..3 {
            egress.push(frame(seq));
        }

        let writer = writer_for(&egress, &drops, &Arc::new(AtomicU64::new(0)), tx);
        tokio::time::timeout(Duration::from_secs(1), writer.run())
            .await
            .unwrap();

        let snap = drops.snapshot();
        assert_eq!(drops.get(DropReason::TransportClosed), 3);
        assert_eq!(drops.get(DropReason::TxQueueFull), 0);
        assert_eq!(snap.total, 3);
        assert_eq!(snap.categorized_sum(), snap.total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_media_after_hangup() {
        let drops = Arc::new(DropCounters::new());
        let ingress = Arc::new(FrameQueue::new(50, DropReason::RxQueueFull, drops.clone()));
        let egress = Arc::new(FrameQueue::new(100, DropReason::TxQueueFull, drops.clone()));
        let flush_epoch = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::channel(100);
        for seq in 0..10 {
            egress.push(frame(seq));
        }
        ingress.push(frame(0));
        ingress.push(frame(1));
        let task = tokio::spawn(writer_for(&egress, &drops, &flush_epoch, tx).run());

        assert!(matches!(rx.recv().await, Some(TransportCommand::Media { .. })));
        // Writer holds frame 1 until 20ms
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (inbound, outbound) = discard_media(&ingress, &egress, &flush_epoch);
        assert_eq!((inbound, outbound), (2, 8));

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(rx.recv().await.is_none());

        assert!(!egress.push(frame(10)));
        let snap = drops.snapshot();
        // 2 inbound, 8 queued outbound, the held frame, the late push
        assert_eq!(drops.get(DropReason::SessionClosed), 12);
        assert_eq!(snap.total, 12);
        assert_eq!(snap.categorized_sum(), snap.total);
        assert_eq!(snap.unknown(), 0);
    }

    #[tokio::test]
    async fn test_discard_media_releases_idle_writer() {
        let drops = Arc::new(DropCounters::new());
        let ingress = Arc::new(FrameQueue::new(50, DropReason::RxQueueFull, drops.clone()));
        let egress = Arc::new(FrameQueue::new(100, DropReason::TxQueueFull, drops.clone()));
        let flush_epoch = Arc::new(AtomicU64::new(0));
        let (tx, _rx) = mpsc::channel(100);
        let task = tokio::spawn(writer_for(&egress, &drops, &flush_epoch, tx).run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        discard_media(&ingress, &egress, &flush_epoch);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(drops.total(), 0);
    }
}
