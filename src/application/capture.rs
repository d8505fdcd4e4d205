//! Capture state machine use case
//!
//! Owns the microphone stream, the encoder session and the capture graph for
//! one recording at a time.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capture_graph::{AnalyserNode, FrameNode, SourceNode};
use super::encode_pipeline::{EncodePipeline, EncodeSession, DEFAULT_QUEUE_CAPACITY};
use super::events::EventBus;
use super::ports::{
    CodecFailure, CodecService, DeviceId, DeviceInfo, EncoderOptions, InputError, InputSource,
    InputStream, PartStore, StoreError,
};
use crate::domain::capture::{RecorderPhase, RecorderStatus};
use crate::domain::config::AppConfig;
use crate::domain::recording::{
    session_sample_rate, AudioFormat, RecordingId, RecordingMeta, SessionId,
};

/// Errors from starting or steering a recording
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Microphone access denied: {0}")]
    UserDenied(String),

    #[error("Input device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Codec request failed: {}", .0.join("; "))]
    Codec(Vec<String>),

    #[error("Storage failed: {0}")]
    Store(String),

    #[error("Capture graph failed: {0}")]
    Graph(String),

    #[error("Recorder is {0}, expected idle")]
    Busy(RecorderPhase),

    #[error("Recording start was cancelled")]
    Cancelled,
}

impl From<InputError> for CaptureError {
    fn from(err: InputError) -> Self {
        match err {
            InputError::PermissionDenied(msg) => Self::UserDenied(msg),
            InputError::DeviceUnavailable(msg) | InputError::Unsupported(msg) => {
                Self::DeviceUnavailable(msg)
            }
            InputError::Transport(msg) => Self::Graph(msg),
        }
    }
}

impl From<CodecFailure> for CaptureError {
    fn from(err: CodecFailure) -> Self {
        Self::Codec(err.into_diagnostics())
    }
}

impl From<StoreError> for CaptureError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

/// Tunables for new recordings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureConfig {
    /// Initial encoder bitrate in bits per second
    pub bitrate: i32,
    /// Frames buffered ahead of the encode worker
    pub queue_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::from(&AppConfig::empty())
    }
}

impl From<&AppConfig> for CaptureConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            bitrate: config.bitrate_or_default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Result of a successful start
#[derive(Debug, Clone, PartialEq)]
pub struct StartedRecording {
    pub encoder_id: SessionId,
    /// Bitrate reported by the encoder after configuration
    pub bitrate: i32,
    pub recording_id: RecordingId,
}

/// Everything a live recording holds
struct ActiveSession {
    encoder_id: SessionId,
    recording_id: RecordingId,
    format: AudioFormat,
    device: DeviceInfo,
    stream: Box<dyn InputStream>,
    analyser: Arc<AnalyserNode>,
    source: SourceNode,
    frames: FrameNode,
    pipeline: EncodePipeline,
}

enum Phase {
    Idle,
    Starting {
        device: Option<DeviceId>,
        cancel: CancellationToken,
        settled: watch::Receiver<bool>,
    },
    Recording(ActiveSession),
}

impl Phase {
    fn recorder_phase(&self) -> RecorderPhase {
        match self {
            Self::Idle => RecorderPhase::Idle,
            Self::Starting { .. } => RecorderPhase::StartingToRecord,
            Self::Recording(_) => RecorderPhase::Recording,
        }
    }
}

/// Resources taken by an in-flight start, released if it aborts
#[derive(Default)]
struct Acquired {
    stream: Option<Box<dyn InputStream>>,
    encoder_id: Option<SessionId>,
    recording_id: Option<RecordingId>,
}

impl Acquired {
    async fn release<C: CodecService, S: PartStore>(mut self, codec: &C, store: &S) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        if let Some(encoder_id) = self.encoder_id.take() {
            codec.destroy(encoder_id).await;
        }
        if let Some(recording_id) = self.recording_id.take() {
            if let Err(e) = store.delete(&recording_id).await {
                warn!(%recording_id, "Failed to remove empty recording: {}", e);
            }
        }
    }
}

/// Recording lifecycle: `Idle -> StartingToRecord -> Recording -> Idle`
pub struct CaptureStateMachine<I, C, S>
where
    I: InputSource,
    C: CodecService,
    S: PartStore,
{
    input: Arc<I>,
    codec: Arc<C>,
    store: Arc<S>,
    events: EventBus,
    config: CaptureConfig,
    phase: Mutex<Phase>,
}

impl<I, C, S> CaptureStateMachine<I, C, S>
where
    I: InputSource,
    C: CodecService + 'static,
    S: PartStore + 'static,
{
    pub fn new(
        input: Arc<I>,
        codec: Arc<C>,
        store: Arc<S>,
        events: EventBus,
        config: CaptureConfig,
    ) -> Self {
        Self {
            input,
            codec,
            store,
            events,
            config,
            phase: Mutex::new(Phase::Idle),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Start recording from `device` (or the system default).
    ///
    /// Returns `None` if any step fails; everything acquired so far has
    /// been released by then.
    pub async fn start(
        &self,
        device: Option<DeviceId>,
        max_payload_bytes: usize,
    ) -> Option<StartedRecording> {
        match self.try_start(device, max_payload_bytes).await {
            Ok(started) => Some(started),
            Err(CaptureError::Cancelled) => {
                debug!("Recording start cancelled");
                None
            }
            Err(e) => {
                error!("Failed to start recording: {}", e);
                None
            }
        }
    }

    /// Like [`start`](Self::start), but reports why the start failed
    pub async fn try_start(
        &self,
        device: Option<DeviceId>,
        max_payload_bytes: usize,
    ) -> Result<StartedRecording, CaptureError> {
        let (cancel, settled) = {
            let mut phase = self.phase.lock().await;
            if !matches!(*phase, Phase::Idle) {
                return Err(CaptureError::Busy(phase.recorder_phase()));
            }
            let cancel = CancellationToken::new();
            let (settled_tx, settled_rx) = watch::channel(false);
            *phase = Phase::Starting {
                device: device.clone(),
                cancel: cancel.clone(),
                settled: settled_rx,
            };
            (cancel, settled_tx)
        };

        let mut acquired = Acquired::default();
        let result = self
            .run_start(device, max_payload_bytes, &cancel, &mut acquired)
            .await;

        if result.is_err() {
            acquired.release(&*self.codec, &*self.store).await;
            *self.phase.lock().await = Phase::Idle;
        }
        let _ = settled.send(true);
        result
    }

    async fn run_start(
        &self,
        device: Option<DeviceId>,
        max_payload_bytes: usize,
        cancel: &CancellationToken,
        acquired: &mut Acquired,
    ) -> Result<StartedRecording, CaptureError> {
        let stream = self.input.acquire(device.as_ref()).await?;
        let info = stream.info().clone();
        acquired.stream = Some(stream);
        checkpoint(cancel)?;

        let format = AudioFormat::mono(session_sample_rate(info.sample_rate));
        debug!(
            device = %info.id,
            device_rate = info.sample_rate,
            sample_rate = format.sample_rate,
            frame_size = format.frame_size,
            "Input stream acquired"
        );

        let encoder_id = self
            .codec
            .create_encoder(EncoderOptions {
                sample_rate: format.sample_rate,
                channels: format.channels,
                frame_size: format.frame_size,
                max_output_bytes: max_payload_bytes,
            })
            .await?;
        acquired.encoder_id = Some(encoder_id);
        checkpoint(cancel)?;

        self.codec
            .set_bitrate(encoder_id, self.config.bitrate)
            .await?;
        let bitrate = self.codec.get_bitrate(encoder_id).await?;
        checkpoint(cancel)?;

        let recording_id = self
            .store
            .create(RecordingMeta {
                encoder_id,
                format,
                device: Some(info.id.to_string()),
            })
            .await?;
        acquired.recording_id = Some(recording_id.clone());

        // The graph is built under the lock so a concurrent stop either
        // cancels before this point or sees a complete recording.
        let mut phase = self.phase.lock().await;
        checkpoint(cancel)?;

        let Some(mut stream) = acquired.stream.take() else {
            return Err(CaptureError::Graph("input stream went missing".into()));
        };
        let analyser = Arc::new(AnalyserNode::new());
        let source =
            match SourceNode::connect(stream.as_mut(), Arc::clone(&analyser), format.sample_rate) {
                Ok(source) => source,
                Err(e) => {
                    acquired.stream = Some(stream);
                    return Err(CaptureError::Graph(e));
                }
            };

        let pipeline = EncodePipeline::spawn(
            Arc::clone(&self.codec),
            Arc::clone(&self.store),
            self.events.clone(),
            EncodeSession {
                encoder_id,
                recording_id: recording_id.clone(),
                format,
                max_payload_bytes,
            },
            self.config.queue_capacity,
        );
        let frame_len = format.frame_size * format.channels as usize;
        let Some(frame_tx) = pipeline.frame_sender() else {
            source.disconnect();
            pipeline.drain().await;
            acquired.stream = Some(stream);
            return Err(CaptureError::Graph("encode pipeline closed early".into()));
        };
        let frames = FrameNode::attach(&analyser, frame_len, frame_tx);

        *acquired = Acquired::default();
        *phase = Phase::Recording(ActiveSession {
            encoder_id,
            recording_id: recording_id.clone(),
            format,
            device: info,
            stream,
            analyser,
            source,
            frames,
            pipeline,
        });

        info!(encoder_id, %recording_id, bitrate, "Recording started");
        Ok(StartedRecording {
            encoder_id,
            bitrate,
            recording_id,
        })
    }

    /// Stop the current recording.
    ///
    /// From `Recording` this returns after every queued chunk has been
    /// persisted and announced, with the encoder id of the finished session.
    /// From `StartingToRecord` it cancels the start, waits for its rollback
    /// and returns `None`.
    pub async fn stop(&self) -> Option<SessionId> {
        let mut phase = self.phase.lock().await;
        let pending_start = match &*phase {
            Phase::Idle => {
                debug!("Stop requested while idle");
                return None;
            }
            Phase::Starting {
                cancel, settled, ..
            } => {
                cancel.cancel();
                Some(settled.clone())
            }
            Phase::Recording(_) => None,
        };

        if let Some(mut settled) = pending_start {
            drop(phase);
            let _ = settled.wait_for(|done| *done).await;
            return None;
        }

        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::Recording(session) => Some(self.teardown(session).await),
            other => {
                *phase = other;
                None
            }
        }
    }

    /// Swap the input device of the running recording.
    ///
    /// The new source joins the existing analyser before the old stream
    /// is released.
    pub async fn set_input_device(&self, device: DeviceId) -> bool {
        let mut phase = self.phase.lock().await;
        let Phase::Recording(session) = &mut *phase else {
            warn!(%device, "Input device can only be changed while recording");
            return false;
        };
        if session.device.id == device {
            return true;
        }

        let mut stream = match self.input.acquire(Some(&device)).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(%device, "Failed to switch input device: {}", e);
                return false;
            }
        };
        let source = match SourceNode::connect(
            stream.as_mut(),
            Arc::clone(&session.analyser),
            session.format.sample_rate,
        ) {
            Ok(source) => source,
            Err(e) => {
                stream.stop();
                error!(%device, "Failed to connect input device: {}", e);
                return false;
            }
        };

        let info = stream.info().clone();
        std::mem::replace(&mut session.source, source).disconnect();
        std::mem::replace(&mut session.stream, stream).stop();
        let previous = std::mem::replace(&mut session.device, info);

        info!(from = %previous.id, to = %session.device.id, "Input device switched");
        true
    }

    /// Snapshot of the recorder
    pub async fn current_state(&self) -> RecorderStatus {
        let phase = self.phase.lock().await;
        match &*phase {
            Phase::Idle => RecorderStatus::idle(),
            Phase::Starting { device, .. } => RecorderStatus {
                phase: RecorderPhase::StartingToRecord,
                device: device.as_ref().map(ToString::to_string),
                ..RecorderStatus::default()
            },
            Phase::Recording(session) => RecorderStatus {
                phase: RecorderPhase::Recording,
                encoder_id: Some(session.encoder_id),
                recording_id: Some(session.recording_id.clone()),
                device: Some(session.device.id.to_string()),
                format: Some(session.format),
                sample_count: session.pipeline.samples(),
                level: session.analyser.level(),
                encode_halted: session.pipeline.is_halted(),
            },
        }
    }

    /// Peak input level of the running recording, 0.0 when idle
    pub async fn input_level(&self) -> f32 {
        match &*self.phase.lock().await {
            Phase::Recording(session) => session.analyser.level(),
            _ => 0.0,
        }
    }

    async fn teardown(&self, session: ActiveSession) -> SessionId {
        let ActiveSession {
            encoder_id,
            recording_id,
            mut stream,
            analyser,
            source,
            frames,
            pipeline,
            ..
        } = session;

        // Front to back: no new audio, then flush each node into the next.
        stream.stop();
        source.finish().await;
        analyser.disconnect_output();
        frames.join().await;
        let report = pipeline.drain().await;
        self.codec.destroy(encoder_id).await;

        info!(
            encoder_id,
            %recording_id,
            chunks = report.chunks,
            halted = report.halted,
            "Recording stopped"
        );
        encoder_id
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), CaptureError> {
    if cancel.is_cancelled() {
        Err(CaptureError::Cancelled)
    } else {
        Ok(())
    }
}
