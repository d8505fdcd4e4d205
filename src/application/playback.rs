//! Look-ahead playback scheduler use case
//!
//! A play session walks the recording's parts in index order, decodes the
//! ones inside the current look-ahead window and schedules them on a single
//! output node. A watcher task follows the "ended" signals in schedule order
//! and requests the next window once enough of the scheduled audio played.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::SendError};
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{Event, EventBus};
use super::ports::{
    CodecFailure, CodecService, DecoderOptions, OutputError, OutputGraph, OutputNode, PartStore,
    PcmBuffer, ScheduledBuffer, StoreError,
};
use crate::domain::config::AppConfig;
use crate::domain::playback::{PlaybackState, PlaybackTimeline, WindowCursor, WindowStep};
use crate::domain::recording::{RecordingId, SessionId};

/// Errors from starting or running a play session
#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    #[error("Playback was cancelled")]
    Cancelled,

    #[error("Codec request failed: {}", .0.join("; "))]
    Codec(Vec<String>),

    #[error("Storage failed: {0}")]
    Store(#[from] StoreError),

    #[error("Audio output failed: {0}")]
    Output(#[from] OutputError),

    #[error("Recording {0} has no audio at the requested position")]
    Empty(RecordingId),
}

impl From<CodecFailure> for PlaybackError {
    fn from(err: CodecFailure) -> Self {
        Self::Codec(err.into_diagnostics())
    }
}

/// How a `play` call resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// The first window is scheduled
    Started,
    /// A later call inside the debounce window superseded this one
    Coalesced,
    /// Playback was not paused when the call committed
    Ignored,
}

/// Scheduler tunables, in seconds where not noted
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackConfig {
    pub look_ahead: f64,
    pub lead_in: f64,
    pub refill_ratio: f64,
    pub debounce: std::time::Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self::from(&AppConfig::empty())
    }
}

impl From<&AppConfig> for PlaybackConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            look_ahead: config.look_ahead_or_default().as_secs_f64(),
            lead_in: config.lead_in_or_default().as_secs_f64(),
            refill_ratio: config.refill_ratio_or_default(),
            debounce: config.play_debounce_or_default().as_std(),
        }
    }
}

/// Position snapshot of the current (or last) play session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaybackProgress {
    pub recording_id: Option<RecordingId>,
    pub state: PlaybackState,
    /// Seconds confirmed played
    pub played: f64,
    /// Seconds committed to the output graph
    pub scheduled: f64,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A decoder session scoped to one play session.
///
/// Call [`release`](Self::release) on every exit path; dropping an
/// unreleased lease schedules the release on the current runtime.
pub struct DecoderLease<C: CodecService + 'static> {
    codec: Arc<C>,
    id: SessionId,
    released: AtomicBool,
}

impl<C: CodecService + 'static> DecoderLease<C> {
    pub async fn acquire(codec: Arc<C>, options: DecoderOptions) -> Result<Self, CodecFailure> {
        let id = codec.create_decoder(options).await?;
        debug!(decoder_id = id, "Decoder acquired");
        Ok(Self {
            codec,
            id,
            released: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn decode(&self, payload: Vec<u8>) -> Result<Vec<f32>, CodecFailure> {
        self.codec.decode_float(self.id, payload).await
    }

    /// Destroy the decoder session. Idempotent.
    pub async fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.codec.destroy(self.id).await;
            debug!(decoder_id = self.id, "Decoder released");
        }
    }
}

impl<C: CodecService + 'static> Drop for DecoderLease<C> {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let codec = Arc::clone(&self.codec);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { codec.destroy(id).await });
            }
            Err(_) => warn!(decoder_id = id, "Decoder leaked: no runtime to release it"),
        }
    }
}

type WindowResult = Result<usize, PlaybackError>;

/// State shared by the watcher and the window tasks of one session
struct Session<C: CodecService + 'static, S: PartStore> {
    recording_id: RecordingId,
    store: Arc<S>,
    decoder: DecoderLease<C>,
    node: Box<dyn OutputNode>,
    timeline: StdMutex<PlaybackTimeline>,
    exhausted: AtomicBool,
    cancel: CancellationToken,
    buffers: mpsc::UnboundedSender<ScheduledBuffer>,
}

impl<C: CodecService + 'static, S: PartStore> Session<C, S> {
    /// Decode and schedule every part whose start offset lies in `[from, to)`.
    /// Returns how many buffers were scheduled.
    async fn schedule_window(&self, from: f64, to: f64) -> WindowResult {
        let mut parts = self.store.parts_ordered_by_index(&self.recording_id);
        let mut cursor = WindowCursor::new(from, to);
        let mut count = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PlaybackError::Cancelled),
                next = parts.next() => next,
            };
            let Some(part) = next else {
                self.exhausted.store(true, Ordering::SeqCst);
                break;
            };
            let part = part?;
            let duration = part.duration_secs();
            let delta = match cursor.offer(duration) {
                WindowStep::Skip => continue,
                WindowStep::Done => break,
                WindowStep::Take { delta } => delta,
            };

            let format = part.format;
            let samples = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PlaybackError::Cancelled),
                pcm = self.decoder.decode(part.encoded) => pcm?,
            };
            let buffer = PcmBuffer {
                samples,
                sample_rate: format.sample_rate,
                channels: format.channels,
            };

            let start_at = lock(&self.timeline).start_at(delta);
            let handle = self.node.schedule(buffer, start_at, delta)?;
            lock(&self.timeline).mark_scheduled(delta, duration);
            if let Err(SendError(handle)) = self.buffers.send(handle) {
                handle.stop();
                return Err(PlaybackError::Cancelled);
            }
            count += 1;
        }

        Ok(count)
    }

    fn snapshot(&self) -> (f64, f64) {
        let timeline = lock(&self.timeline);
        (timeline.played(), timeline.scheduled())
    }

    /// Stop whatever is still queued, disconnect the node, release the decoder
    async fn shut_down(&self, buffers: &mut mpsc::UnboundedReceiver<ScheduledBuffer>) {
        buffers.close();
        while let Ok(buffer) = buffers.try_recv() {
            buffer.stop();
        }
        self.node.disconnect();
        self.decoder.release().await;
    }
}

/// Handle kept in the scheduler's single session slot
struct ActivePlayback {
    recording_id: RecordingId,
    task: JoinHandle<()>,
}

impl ActivePlayback {
    async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!(recording_id = %self.recording_id, "Playback task failed: {}", e);
            }
        }
    }
}

struct Inner<C, S, O> {
    codec: Arc<C>,
    store: Arc<S>,
    output: Arc<O>,
    events: EventBus,
    config: PlaybackConfig,
    state: StdMutex<PlaybackState>,
    progress: StdMutex<PlaybackProgress>,
    play_generation: AtomicU64,
    current: StdMutex<Option<CancellationToken>>,
    slot: Mutex<Option<ActivePlayback>>,
}

impl<C, S, O> Inner<C, S, O> {
    fn state(&self) -> PlaybackState {
        *lock(&self.state)
    }

    fn set_state(&self, next: PlaybackState) {
        {
            let mut state = lock(&self.state);
            if *state == next {
                return;
            }
            *state = next;
        }
        lock(&self.progress).state = next;
        debug!(state = %next, "Playback state changed");
        self.events.emit(Event::PlaybackState { state: next });
    }

    fn record_progress(&self, played: f64, scheduled: f64) {
        let mut progress = lock(&self.progress);
        progress.played = played;
        progress.scheduled = scheduled;
    }
}

/// Plays stored recordings through the output graph, one session at a time
pub struct PlaybackScheduler<C, S, O> {
    inner: Arc<Inner<C, S, O>>,
}

impl<C, S, O> Clone for PlaybackScheduler<C, S, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, S, O> PlaybackScheduler<C, S, O>
where
    C: CodecService + 'static,
    S: PartStore + 'static,
    O: OutputGraph + 'static,
{
    pub fn new(
        codec: Arc<C>,
        store: Arc<S>,
        output: Arc<O>,
        events: EventBus,
        config: PlaybackConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                codec,
                store,
                output,
                events,
                config,
                state: StdMutex::new(PlaybackState::Paused),
                progress: StdMutex::new(PlaybackProgress::default()),
                play_generation: AtomicU64::new(0),
                current: StdMutex::new(None),
                slot: Mutex::new(None),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.state()
    }

    pub fn progress(&self) -> PlaybackProgress {
        lock(&self.inner.progress).clone()
    }

    /// Play `recording_id` from `from` seconds.
    ///
    /// Calls arriving within the debounce interval collapse into the last
    /// one. The call only commits while playback is paused.
    pub async fn play(
        &self,
        recording_id: RecordingId,
        from: f64,
    ) -> Result<PlayOutcome, PlaybackError> {
        let inner = &self.inner;
        let generation = inner.play_generation.fetch_add(1, Ordering::SeqCst) + 1;
        if !inner.config.debounce.is_zero() {
            tokio::time::sleep(inner.config.debounce).await;
        }
        if inner.play_generation.load(Ordering::SeqCst) != generation {
            debug!(%recording_id, from, "Play request superseded");
            return Ok(PlayOutcome::Coalesced);
        }

        let mut slot = inner.slot.lock().await;
        if inner.state() != PlaybackState::Paused {
            debug!(%recording_id, state = %inner.state(), "Play ignored, not paused");
            return Ok(PlayOutcome::Ignored);
        }
        if let Some(previous) = slot.take() {
            previous.join().await;
        }

        let cancel = CancellationToken::new();
        *lock(&inner.current) = Some(cancel.clone());
        {
            let mut progress = lock(&inner.progress);
            progress.recording_id = Some(recording_id.clone());
            progress.played = from.max(0.0);
            progress.scheduled = from.max(0.0);
        }
        inner.set_state(PlaybackState::Preparing);

        match Self::commit(inner, recording_id.clone(), from.max(0.0), cancel).await {
            Ok(active) => {
                *slot = Some(active);
                info!(%recording_id, from, "Playback started");
                Ok(PlayOutcome::Started)
            }
            Err(e) => {
                inner.set_state(PlaybackState::Paused);
                if matches!(e, PlaybackError::Cancelled) {
                    debug!(%recording_id, "Playback cancelled while preparing");
                } else {
                    error!(%recording_id, "Failed to start playback: {}", e);
                }
                Err(e)
            }
        }
    }

    /// Cancel the current session and wait until it has torn down.
    /// Pending debounced plays resolve as coalesced.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        inner.play_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(cancel) = lock(&inner.current).clone() {
            cancel.cancel();
        }
        let mut slot = inner.slot.lock().await;
        if let Some(active) = slot.take() {
            debug!(recording_id = %active.recording_id, "Destroying play session");
            active.join().await;
        }
    }

    /// Restart playback of `recording_id` at `offset` seconds
    pub async fn seek(
        &self,
        recording_id: RecordingId,
        offset: f64,
    ) -> Result<PlayOutcome, PlaybackError> {
        self.destroy().await;
        self.play(recording_id, offset).await
    }

    async fn commit(
        inner: &Arc<Inner<C, S, O>>,
        recording_id: RecordingId,
        from: f64,
        cancel: CancellationToken,
    ) -> Result<ActivePlayback, PlaybackError> {
        inner.output.resume().await?;
        let recording = inner.store.get(&recording_id).await?;
        if cancel.is_cancelled() {
            return Err(PlaybackError::Cancelled);
        }

        let format = recording.format();
        let decoder = DecoderLease::acquire(
            Arc::clone(&inner.codec),
            DecoderOptions {
                sample_rate: format.sample_rate,
                channels: format.channels,
            },
        )
        .await?;
        let node = match inner.output.connect() {
            Ok(node) => node,
            Err(e) => {
                decoder.release().await;
                return Err(e.into());
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let timeline =
            PlaybackTimeline::new(from, inner.output.current_time(), inner.config.lead_in);
        let session = Arc::new(Session {
            recording_id: recording_id.clone(),
            store: Arc::clone(&inner.store),
            decoder,
            node,
            timeline: StdMutex::new(timeline),
            exhausted: AtomicBool::new(false),
            cancel,
            buffers: tx,
        });

        let failure = match session
            .schedule_window(from, from + inner.config.look_ahead)
            .await
        {
            Ok(0) => Some(PlaybackError::Empty(recording_id.clone())),
            Ok(count) => {
                debug!(count, from, "First playback window scheduled");
                None
            }
            Err(e) => Some(e),
        };
        if let Some(e) = failure {
            session.shut_down(&mut rx).await;
            return Err(e);
        }

        let (played, scheduled) = session.snapshot();
        inner.record_progress(played, scheduled);
        inner.set_state(PlaybackState::Playing);

        let task = tokio::spawn(watch_session(Arc::clone(inner), session, rx));
        Ok(ActivePlayback { recording_id, task })
    }
}

enum SessionEnd {
    Finished,
    Cancelled,
    Failed,
}

async fn join_window(
    refill: &mut Option<JoinHandle<WindowResult>>,
) -> Result<WindowResult, JoinError> {
    match refill.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Whether a finished refill leaves the session able to continue
fn window_landed(result: Result<WindowResult, JoinError>, recording_id: &RecordingId) -> bool {
    match result {
        Ok(Ok(count)) => {
            debug!(%recording_id, count, "Playback window scheduled");
            true
        }
        // The watcher's own cancellation branch takes over.
        Ok(Err(PlaybackError::Cancelled)) => true,
        Ok(Err(e)) => {
            error!(%recording_id, "Next playback window failed, ending session: {}", e);
            false
        }
        Err(e) => {
            error!(%recording_id, "Playback window task failed: {}", e);
            false
        }
    }
}

/// Follow "ended" signals in schedule order until the recording is played
/// out, the session is cancelled or a refill fails.
async fn watch_session<C, S, O>(
    inner: Arc<Inner<C, S, O>>,
    session: Arc<Session<C, S>>,
    mut buffers: mpsc::UnboundedReceiver<ScheduledBuffer>,
) where
    C: CodecService + 'static,
    S: PartStore + 'static,
    O: OutputGraph + 'static,
{
    let cancel = session.cancel.clone();
    let mut head: Option<ScheduledBuffer> = None;
    let mut refill: Option<JoinHandle<WindowResult>> = None;

    let end = loop {
        if head.is_none() {
            head = buffers.try_recv().ok();
        }

        if head.is_none() {
            if refill.is_none() {
                break SessionEnd::Finished;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                next = buffers.recv() => head = next,
                result = join_window(&mut refill) => {
                    refill = None;
                    if !window_landed(result, &session.recording_id) {
                        break SessionEnd::Failed;
                    }
                    let (played, scheduled) = session.snapshot();
                    inner.record_progress(played, scheduled);
                }
            }
            continue;
        }

        let Some(buffer) = head.as_mut() else {
            continue;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break SessionEnd::Cancelled,
            result = join_window(&mut refill), if refill.is_some() => {
                refill = None;
                if !window_landed(result, &session.recording_id) {
                    break SessionEnd::Failed;
                }
                let (played, scheduled) = session.snapshot();
                inner.record_progress(played, scheduled);
                continue;
            }
            _ = buffer.ended() => {}
        }

        let Some(finished) = head.take() else {
            continue;
        };
        if cancel.is_cancelled() {
            break SessionEnd::Cancelled;
        }

        let (played, scheduled, due) = {
            let mut timeline = lock(&session.timeline);
            let played = timeline.mark_played(finished.delta, finished.duration);
            (
                played,
                timeline.scheduled(),
                timeline.refill_due(inner.config.refill_ratio),
            )
        };
        inner.record_progress(played, scheduled);
        inner.events.emit(Event::DurationChanged {
            recording_id: session.recording_id.clone(),
            duration: played,
        });

        if due && refill.is_none() && !session.exhausted.load(Ordering::SeqCst) {
            let (from, to) = lock(&session.timeline).next_window(inner.config.look_ahead);
            debug!(from, to, played, "Requesting next playback window");
            let window = Arc::clone(&session);
            refill = Some(tokio::spawn(async move {
                window.schedule_window(from, to).await
            }));
        }
    };

    if let Some(handle) = refill.take() {
        let _ = handle.await;
    }
    if let Some(buffer) = head.take() {
        buffer.stop();
    }
    session.shut_down(&mut buffers).await;

    match end {
        SessionEnd::Finished => info!(recording_id = %session.recording_id, "Playback finished"),
        SessionEnd::Cancelled => debug!(recording_id = %session.recording_id, "Playback cancelled"),
        SessionEnd::Failed => warn!(recording_id = %session.recording_id, "Playback ended early"),
    }
    inner.set_state(PlaybackState::Paused);
}
