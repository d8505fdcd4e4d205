//! Hand-written test doubles for the application ports

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::ports::{
    CodecFailure, CodecService, DecoderOptions, DeviceId, DeviceInfo, EncodedPacket,
    EncoderOptions, InputError, InputSource, InputStream, OutputError, OutputGraph, OutputNode,
    PcmBuffer, ScheduledBuffer, VoiceControl,
};
use crate::domain::recording::SessionId;

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

enum FakeSession {
    Encoder {
        frame_len: usize,
        frame_size: usize,
        sample_rate: u32,
        pending: Vec<f32>,
        bitrate: i32,
        packets: u64,
    },
    Decoder,
}

/// Codec that frames samples like a real encoder and produces payloads
/// that record the frame length, so decoding restores the sample count.
#[derive(Default)]
pub struct FakeCodec {
    next_id: AtomicU32,
    sessions: StdMutex<HashMap<SessionId, FakeSession>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_create_encoder: AtomicBool,
    fail_bitrate: AtomicBool,
    encode_budget: StdMutex<Option<u64>>,
    destroyed: StdMutex<Vec<SessionId>>,
    decode_calls: AtomicUsize,
}

impl FakeCodec {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            ..Default::default()
        }
    }

    pub fn fail_create_encoder(&self) {
        self.fail_create_encoder.store(true, Ordering::SeqCst);
    }

    pub fn fail_bitrate(&self) {
        self.fail_bitrate.store(true, Ordering::SeqCst);
    }

    /// Allow `packets` successful encodes, then fail every request
    pub fn fail_encode_after(&self, packets: u64) {
        *self.encode_budget.lock().unwrap() = Some(packets);
    }

    pub fn max_concurrent_encodes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn destroyed(&self) -> Vec<SessionId> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    /// Payload for a frame of `frame_len` interleaved samples
    pub fn payload_for(frame_len: usize, filler: usize) -> Vec<u8> {
        let mut payload = (frame_len as u32).to_le_bytes().to_vec();
        payload.extend(std::iter::repeat(filler as u8).take(filler % 7 + 1));
        payload
    }

    fn allocate(&self, session: FakeSession) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions.lock().unwrap().insert(id, session);
        id
    }
}

#[async_trait]
impl CodecService for FakeCodec {
    async fn create_encoder(&self, options: EncoderOptions) -> Result<SessionId, CodecFailure> {
        if self.fail_create_encoder.load(Ordering::SeqCst) {
            return Err(CodecFailure::from_diagnostics(vec![
                "encoder init failed".into(),
                format!("frame size {}", options.frame_size),
            ]));
        }
        Ok(self.allocate(FakeSession::Encoder {
            frame_len: options.frame_size * options.channels as usize,
            frame_size: options.frame_size,
            sample_rate: options.sample_rate,
            pending: Vec::new(),
            bitrate: 0,
            packets: 0,
        }))
    }

    async fn encode_float(
        &self,
        id: SessionId,
        pcm: Vec<f32>,
        _max_bytes: usize,
    ) -> Result<Option<EncodedPacket>, CodecFailure> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let result = (|| {
            let mut sessions = self.sessions.lock().unwrap();
            let Some(FakeSession::Encoder {
                frame_len,
                frame_size,
                sample_rate,
                pending,
                packets,
                ..
            }) = sessions.get_mut(&id)
            else {
                return Err(CodecFailure::new(format!("unknown encoder {}", id)));
            };
            pending.extend_from_slice(&pcm);
            if pending.len() < *frame_len {
                return Ok(None);
            }
            let mut budget = self.encode_budget.lock().unwrap();
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(CodecFailure::new("injected encode failure"));
                }
                *remaining -= 1;
            }
            pending.drain(..*frame_len);
            *packets += 1;
            Ok(Some(EncodedPacket {
                payload: Self::payload_for(*frame_len, *packets as usize),
                sample_count: *frame_size as u32,
                duration_ms: *frame_size as f64 * 1000.0 / *sample_rate as f64,
            }))
        })();

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn set_bitrate(&self, id: SessionId, bits_per_second: i32) -> Result<i32, CodecFailure> {
        if self.fail_bitrate.load(Ordering::SeqCst) {
            return Err(CodecFailure::new("bitrate rejected"));
        }
        let mut sessions = self.sessions.lock().unwrap();
        match sessions.get_mut(&id) {
            Some(FakeSession::Encoder { bitrate, .. }) => {
                *bitrate = bits_per_second;
                Ok(*bitrate)
            }
            _ => Err(CodecFailure::new(format!("unknown encoder {}", id))),
        }
    }

    async fn get_bitrate(&self, id: SessionId) -> Result<i32, CodecFailure> {
        match self.sessions.lock().unwrap().get(&id) {
            Some(FakeSession::Encoder { bitrate, .. }) => Ok(*bitrate),
            _ => Err(CodecFailure::new(format!("unknown encoder {}", id))),
        }
    }

    async fn create_decoder(&self, _options: DecoderOptions) -> Result<SessionId, CodecFailure> {
        Ok(self.allocate(FakeSession::Decoder))
    }

    async fn decode_float(
        &self,
        id: SessionId,
        payload: Vec<u8>,
    ) -> Result<Vec<f32>, CodecFailure> {
        self.decode_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if !matches!(
            self.sessions.lock().unwrap().get(&id),
            Some(FakeSession::Decoder)
        ) {
            return Err(CodecFailure::new(format!("unknown decoder {}", id)));
        }
        let header: [u8; 4] = payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CodecFailure::new("truncated packet"))?;
        Ok(vec![0.25; u32::from_le_bytes(header) as usize])
    }

    async fn destroy(&self, id: SessionId) {
        if self.sessions.lock().unwrap().remove(&id).is_some() {
            self.destroyed.lock().unwrap().push(id);
        }
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Stream fed by the test through the sender returned from `new`
pub struct FakeStream {
    info: DeviceInfo,
    samples: Option<mpsc::Receiver<Vec<f32>>>,
    live: bool,
    live_count: Option<Arc<AtomicUsize>>,
}

impl FakeStream {
    pub fn new(id: DeviceId, sample_rate: u32) -> (Self, mpsc::Sender<Vec<f32>>) {
        let (tx, rx) = mpsc::channel(64);
        let stream = Self {
            info: DeviceInfo {
                id,
                sample_rate,
                channels: 1,
                is_default: false,
            },
            samples: Some(rx),
            live: true,
            live_count: None,
        };
        (stream, tx)
    }
}

impl InputStream for FakeStream {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn take_samples(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.samples.take()
    }

    fn stop(&mut self) {
        if self.live {
            self.live = false;
            if let Some(count) = &self.live_count {
                count.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Input source with a fixed device list that counts live streams
pub struct FakeInput {
    devices: Vec<DeviceInfo>,
    live: Arc<AtomicUsize>,
    feeds: StdMutex<Vec<(DeviceId, mpsc::Sender<Vec<f32>>)>>,
    fail_next: StdMutex<Option<InputError>>,
    acquired: AtomicUsize,
}

impl FakeInput {
    /// One default device named "default" at `sample_rate`
    pub fn new(sample_rate: u32) -> Self {
        Self {
            devices: vec![DeviceInfo {
                id: DeviceId::new("default"),
                sample_rate,
                channels: 1,
                is_default: true,
            }],
            live: Arc::new(AtomicUsize::new(0)),
            feeds: StdMutex::new(Vec::new()),
            fail_next: StdMutex::new(None),
            acquired: AtomicUsize::new(0),
        }
    }

    pub fn with_device(mut self, name: &str, sample_rate: u32) -> Self {
        self.devices.push(DeviceInfo {
            id: DeviceId::new(name),
            sample_rate,
            channels: 1,
            is_default: false,
        });
        self
    }

    pub fn fail_next_acquire(&self, err: InputError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Sender feeding the most recent stream opened on `device`
    pub fn feed(&self, device: &str) -> Option<mpsc::Sender<Vec<f32>>> {
        self.feeds
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id.as_str() == device)
            .map(|(_, tx)| tx.clone())
    }
}

#[async_trait]
impl InputSource for FakeInput {
    async fn acquire(
        &self,
        device: Option<&DeviceId>,
    ) -> Result<Box<dyn InputStream>, InputError> {
        // Device opening is never instantaneous; give other tasks a turn.
        tokio::task::yield_now().await;
        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }
        let info = match device {
            Some(id) => self.devices.iter().find(|d| &d.id == id),
            None => self.devices.iter().find(|d| d.is_default),
        }
        .cloned()
        .ok_or_else(|| {
            InputError::DeviceUnavailable(
                device.map(|d| d.to_string()).unwrap_or_else(|| "default".into()),
            )
        })?;

        let (mut stream, tx) = FakeStream::new(info.id.clone(), info.sample_rate);
        stream.info = info.clone();
        stream.live_count = Some(Arc::clone(&self.live));
        self.live.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.feeds.lock().unwrap().push((info.id, tx));
        Ok(Box::new(stream))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, InputError> {
        Ok(self.devices.clone())
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeVoice {
    started: AtomicBool,
    stopped: AtomicBool,
}

impl VoiceControl for FakeVoice {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

/// What a fake node recorded for one scheduled buffer
pub struct VoiceRecord {
    pub node: usize,
    pub start_at: f64,
    pub delta: f64,
    pub duration: f64,
    ended: Option<oneshot::Sender<()>>,
    control: Arc<FakeVoice>,
}

impl VoiceRecord {
    pub fn is_stopped(&self) -> bool {
        self.control.stopped.load(Ordering::SeqCst)
    }
}

type VoiceLog = Arc<StdMutex<Vec<VoiceRecord>>>;

struct FakeNode {
    id: usize,
    voices: VoiceLog,
    disconnects: Arc<AtomicUsize>,
    disconnected: AtomicBool,
}

impl OutputNode for FakeNode {
    fn schedule(
        &self,
        buffer: PcmBuffer,
        start_at: f64,
        delta: f64,
    ) -> Result<ScheduledBuffer, OutputError> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(OutputError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        let control = Arc::new(FakeVoice::default());
        let duration = buffer.duration();
        self.voices.lock().unwrap().push(VoiceRecord {
            node: self.id,
            start_at,
            delta,
            duration,
            ended: Some(tx),
            control: Arc::clone(&control),
        });
        Ok(ScheduledBuffer::new(delta, duration, rx, control))
    }

    fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            for voice in self.voices.lock().unwrap().iter() {
                if voice.node == self.id {
                    voice.control.stop();
                }
            }
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Output graph whose voices end only when the test says so
#[derive(Default)]
pub struct FakeOutput {
    clock: StdMutex<f64>,
    voices: VoiceLog,
    connects: AtomicUsize,
    disconnects: Arc<AtomicUsize>,
    fail_resume: AtomicBool,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time(&self, seconds: f64) {
        *self.clock.lock().unwrap() = seconds;
    }

    pub fn fail_resume(&self) {
        self.fail_resume.store(true, Ordering::SeqCst);
    }

    pub fn scheduled_count(&self) -> usize {
        self.voices.lock().unwrap().len()
    }

    /// `(node, start_at, delta)` for every scheduled voice, in schedule order
    pub fn schedule_log(&self) -> Vec<(usize, f64, f64)> {
        self.voices
            .lock()
            .unwrap()
            .iter()
            .map(|v| (v.node, v.start_at, v.delta))
            .collect()
    }

    pub fn stopped_count(&self) -> usize {
        self.voices
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v.is_stopped())
            .count()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Fire "ended" on the earliest voice that is still pending.
    /// Returns false if there is none.
    pub fn finish_next(&self) -> bool {
        let mut voices = self.voices.lock().unwrap();
        let Some(voice) = voices
            .iter_mut()
            .find(|v| v.ended.is_some() && !v.is_stopped())
        else {
            return false;
        };
        voice.control.started.store(true, Ordering::SeqCst);
        if let Some(tx) = voice.ended.take() {
            let _ = tx.send(());
        }
        true
    }
}

#[async_trait]
impl OutputGraph for FakeOutput {
    async fn resume(&self) -> Result<(), OutputError> {
        if self.fail_resume.load(Ordering::SeqCst) {
            return Err(OutputError::DeviceUnavailable("no speakers".into()));
        }
        Ok(())
    }

    fn current_time(&self) -> f64 {
        *self.clock.lock().unwrap()
    }

    fn connect(&self) -> Result<Box<dyn OutputNode>, OutputError> {
        let id = self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeNode {
            id,
            voices: Arc::clone(&self.voices),
            disconnects: Arc::clone(&self.disconnects),
            disconnected: AtomicBool::new(false),
        }))
    }
}
