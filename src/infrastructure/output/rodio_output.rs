//! Rodio-based output graph
//!
//! One dynamic mixer is played for the lifetime of the adapter. Scheduled
//! buffers are mixer voices that emit silence until their start time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rodio::dynamic_mixer::{self, DynamicMixerController};
use rodio::source::{Source, Zero};
use rodio::OutputStream;
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::application::ports::{
    OutputError, OutputGraph, OutputNode, PcmBuffer, ScheduledBuffer, VoiceControl,
};

const MIXER_CHANNELS: u16 = 2;
const MIXER_SAMPLE_RATE: u32 = 48_000;

/// Running mixer plus the clock origin of the graph
struct Engine {
    controller: Arc<DynamicMixerController<f32>>,
    origin: Instant,
    // Dropping the sender releases the output thread and its stream.
    _shutdown: std_mpsc::Sender<()>,
}

/// Output graph on the default output device
#[derive(Default)]
pub struct RodioOutput {
    engine: StdMutex<Option<Arc<Engine>>>,
}

impl RodioOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.lock().ok().and_then(|e| e.clone())
    }

    /// Open the device on a dedicated thread; `OutputStream` is not `Send`
    fn start_engine() -> Result<Engine, OutputError> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("voxpart-output".into())
            .spawn(move || {
                let opened = OutputStream::try_default()
                    .map_err(|e| OutputError::DeviceUnavailable(e.to_string()))
                    .and_then(|(stream, handle)| {
                        let (controller, mixer) =
                            dynamic_mixer::mixer::<f32>(MIXER_CHANNELS, MIXER_SAMPLE_RATE);
                        // The mixer ends once it has no inputs, so keep one forever.
                        controller.add(Zero::<f32>::new(MIXER_CHANNELS, MIXER_SAMPLE_RATE));
                        handle
                            .play_raw(mixer)
                            .map_err(|e| OutputError::Playback(e.to_string()))?;
                        Ok((stream, controller))
                    });

                match opened {
                    Ok((stream, controller)) => {
                        let _ = ready_tx.send(Ok((controller, Instant::now())));
                        let _ = shutdown_rx.recv();
                        drop(stream);
                        debug!("Output stream closed");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| OutputError::Playback(format!("Failed to spawn output thread: {}", e)))?;

        let (controller, origin) = ready_rx
            .recv()
            .map_err(|_| OutputError::Playback("Output thread exited early".into()))??;

        Ok(Engine {
            controller,
            origin,
            _shutdown: shutdown_tx,
        })
    }
}

#[async_trait]
impl OutputGraph for RodioOutput {
    async fn resume(&self) -> Result<(), OutputError> {
        if self.engine().is_some() {
            return Ok(());
        }
        let engine = tokio::task::spawn_blocking(Self::start_engine)
            .await
            .map_err(|e| OutputError::Playback(format!("Task join error: {}", e)))??;

        let mut slot = self
            .engine
            .lock()
            .map_err(|_| OutputError::Playback("output state poisoned".into()))?;
        if slot.is_none() {
            info!("Audio output started");
            *slot = Some(Arc::new(engine));
        }
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.engine()
            .map(|e| e.origin.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    fn connect(&self) -> Result<Box<dyn OutputNode>, OutputError> {
        let engine = self
            .engine()
            .ok_or_else(|| OutputError::DeviceUnavailable("output graph not resumed".into()))?;
        Ok(Box::new(RodioNode {
            engine,
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Shared flags of one voice
#[derive(Default)]
struct VoiceState {
    started: AtomicBool,
    stopped: AtomicBool,
}

impl VoiceControl for VoiceState {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

struct RodioNode {
    engine: Arc<Engine>,
    closed: Arc<AtomicBool>,
}

impl OutputNode for RodioNode {
    fn schedule(
        &self,
        buffer: PcmBuffer,
        start_at: f64,
        delta: f64,
    ) -> Result<ScheduledBuffer, OutputError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(OutputError::Disconnected);
        }
        let now = self.engine.origin.elapsed().as_secs_f64();
        let wait = Duration::from_secs_f64((start_at - now).max(0.0));
        let duration = buffer.duration();

        let state = Arc::new(VoiceState::default());
        let (ended_tx, ended_rx) = oneshot::channel();
        self.engine.controller.add(Voice::new(
            buffer,
            wait,
            Arc::clone(&state),
            Arc::clone(&self.closed),
            ended_tx,
        ));

        Ok(ScheduledBuffer::new(delta, duration, ended_rx, state))
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Mixer input: leading silence, then the decoded samples
struct Voice {
    samples: std::vec::IntoIter<f32>,
    lead: usize,
    channels: u16,
    sample_rate: u32,
    state: Arc<VoiceState>,
    node_closed: Arc<AtomicBool>,
    ended: Option<oneshot::Sender<()>>,
}

impl Voice {
    fn new(
        buffer: PcmBuffer,
        wait: Duration,
        state: Arc<VoiceState>,
        node_closed: Arc<AtomicBool>,
        ended: oneshot::Sender<()>,
    ) -> Self {
        let channels = buffer.channels.max(1);
        let lead_frames = (wait.as_secs_f64() * buffer.sample_rate as f64).round() as usize;
        Self {
            samples: buffer.samples.into_iter(),
            lead: lead_frames * channels as usize,
            channels,
            sample_rate: buffer.sample_rate,
            state,
            node_closed,
            ended: Some(ended),
        }
    }

    fn finish(&mut self) {
        if let Some(ended) = self.ended.take() {
            let _ = ended.send(());
        }
    }
}

impl Iterator for Voice {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.state.stopped.load(Ordering::Relaxed) || self.node_closed.load(Ordering::Relaxed)
        {
            self.finish();
            return None;
        }
        if self.lead > 0 {
            self.lead -= 1;
            return Some(0.0);
        }
        self.state.started.store(true, Ordering::Relaxed);
        match self.samples.next() {
            Some(sample) => Some(sample),
            None => {
                self.finish();
                None
            }
        }
    }
}

impl Source for Voice {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

impl Drop for Voice {
    fn drop(&mut self) {
        self.finish();
    }
}
