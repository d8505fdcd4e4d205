//! Opus codec service
//!
//! Encoder and decoder sessions live on a single worker thread. Callers talk
//! to it through a request channel and get their answer on a oneshot, so the
//! libopus handles never cross threads.

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::application::ports::{
    CodecFailure, CodecService, DecoderOptions, EncodedPacket, EncoderOptions,
};
use crate::domain::recording::{SessionId, OPUS_SAMPLE_RATES};

/// Longest Opus frame, used to size decode buffers
const MAX_FRAME_MS: usize = 120;

/// Frame lengths libopus accepts, in units of 2.5 ms
const FRAME_UNITS: [usize; 9] = [1, 2, 4, 8, 16, 24, 32, 40, 48];

type Reply<T> = oneshot::Sender<Result<T, CodecFailure>>;

enum Request {
    CreateEncoder(EncoderOptions, Reply<SessionId>),
    Encode {
        id: SessionId,
        pcm: Vec<f32>,
        max_bytes: usize,
        reply: Reply<Option<EncodedPacket>>,
    },
    SetBitrate(SessionId, i32, Reply<i32>),
    GetBitrate(SessionId, Reply<i32>),
    CreateDecoder(DecoderOptions, Reply<SessionId>),
    Decode(SessionId, Vec<u8>, Reply<Vec<f32>>),
    Destroy(SessionId, oneshot::Sender<()>),
}

struct EncoderSession {
    encoder: opus::Encoder,
    options: EncoderOptions,
    pending: Vec<f32>,
}

struct DecoderSession {
    decoder: opus::Decoder,
    options: DecoderOptions,
}

enum Session {
    Encoder(EncoderSession),
    Decoder(DecoderSession),
}

/// Codec service backed by libopus
pub struct OpusCodecService {
    requests: std_mpsc::Sender<Request>,
}

impl OpusCodecService {
    /// Start the codec worker thread
    pub fn new() -> Result<Self, CodecFailure> {
        let (requests, inbox) = std_mpsc::channel();
        std::thread::Builder::new()
            .name("voxpart-codec".into())
            .spawn(move || Worker::default().run(inbox))
            .map_err(|e| CodecFailure::new(format!("Failed to spawn codec thread: {}", e)))?;
        Ok(Self { requests })
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, CodecFailure> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .map_err(|_| CodecFailure::new("codec service has stopped"))?;
        rx.await
            .map_err(|_| CodecFailure::new("codec service dropped the request"))?
    }
}

#[async_trait]
impl CodecService for OpusCodecService {
    async fn create_encoder(&self, options: EncoderOptions) -> Result<SessionId, CodecFailure> {
        self.call(|reply| Request::CreateEncoder(options, reply)).await
    }

    async fn encode_float(
        &self,
        id: SessionId,
        pcm: Vec<f32>,
        max_bytes: usize,
    ) -> Result<Option<EncodedPacket>, CodecFailure> {
        self.call(|reply| Request::Encode {
            id,
            pcm,
            max_bytes,
            reply,
        })
        .await
    }

    async fn set_bitrate(&self, id: SessionId, bits_per_second: i32) -> Result<i32, CodecFailure> {
        self.call(|reply| Request::SetBitrate(id, bits_per_second, reply))
            .await
    }

    async fn get_bitrate(&self, id: SessionId) -> Result<i32, CodecFailure> {
        self.call(|reply| Request::GetBitrate(id, reply)).await
    }

    async fn create_decoder(&self, options: DecoderOptions) -> Result<SessionId, CodecFailure> {
        self.call(|reply| Request::CreateDecoder(options, reply)).await
    }

    async fn decode_float(
        &self,
        id: SessionId,
        payload: Vec<u8>,
    ) -> Result<Vec<f32>, CodecFailure> {
        self.call(|reply| Request::Decode(id, payload, reply)).await
    }

    async fn destroy(&self, id: SessionId) {
        let (tx, rx) = oneshot::channel();
        if self.requests.send(Request::Destroy(id, tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

#[derive(Default)]
struct Worker {
    sessions: HashMap<SessionId, Session>,
    next_id: SessionId,
}

impl Worker {
    /// Serve requests until every client handle is gone
    fn run(mut self, inbox: std_mpsc::Receiver<Request>) {
        while let Ok(request) = inbox.recv() {
            match request {
                Request::CreateEncoder(options, reply) => {
                    let _ = reply.send(self.create_encoder(options));
                }
                Request::Encode {
                    id,
                    pcm,
                    max_bytes,
                    reply,
                } => {
                    let _ = reply.send(self.encode(id, pcm, max_bytes));
                }
                Request::SetBitrate(id, bits, reply) => {
                    let _ = reply.send(self.set_bitrate(id, bits));
                }
                Request::GetBitrate(id, reply) => {
                    let _ = reply.send(self.encoder(id).and_then(|s| read_bitrate(&mut s.encoder)));
                }
                Request::CreateDecoder(options, reply) => {
                    let _ = reply.send(self.create_decoder(options));
                }
                Request::Decode(id, payload, reply) => {
                    let _ = reply.send(self.decode(id, &payload));
                }
                Request::Destroy(id, reply) => {
                    if self.sessions.remove(&id).is_some() {
                        debug!(session = id, "Codec session destroyed");
                    }
                    let _ = reply.send(());
                }
            }
        }
        if !self.sessions.is_empty() {
            warn!(count = self.sessions.len(), "Codec stopped with open sessions");
        }
    }

    fn insert(&mut self, session: Session) -> SessionId {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        while self.sessions.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1).max(1);
        }
        self.sessions.insert(self.next_id, session);
        self.next_id
    }

    fn create_encoder(&mut self, options: EncoderOptions) -> Result<SessionId, CodecFailure> {
        let mut diagnostics = check_layout(options.sample_rate, options.channels);
        let units = options.frame_size * 400;
        let rate = options.sample_rate as usize;
        if rate == 0 || units % rate != 0 || !FRAME_UNITS.contains(&(units / rate)) {
            diagnostics.push(format!(
                "frame size {} is not a valid Opus frame at {} Hz",
                options.frame_size, options.sample_rate
            ));
        }
        if options.max_output_bytes == 0 {
            diagnostics.push("output budget must be positive".into());
        }
        if !diagnostics.is_empty() {
            return Err(CodecFailure::from_diagnostics(diagnostics));
        }

        let encoder = opus::Encoder::new(
            options.sample_rate,
            channels(options.channels),
            opus::Application::Voip,
        )
        .map_err(opus_failure)?;
        let id = self.insert(Session::Encoder(EncoderSession {
            encoder,
            options,
            pending: Vec::new(),
        }));
        debug!(
            session = id,
            rate = options.sample_rate,
            frame_size = options.frame_size,
            "Encoder created"
        );
        Ok(id)
    }

    fn create_decoder(&mut self, options: DecoderOptions) -> Result<SessionId, CodecFailure> {
        let diagnostics = check_layout(options.sample_rate, options.channels);
        if !diagnostics.is_empty() {
            return Err(CodecFailure::from_diagnostics(diagnostics));
        }
        let decoder = opus::Decoder::new(options.sample_rate, channels(options.channels))
            .map_err(opus_failure)?;
        let id = self.insert(Session::Decoder(DecoderSession { decoder, options }));
        debug!(session = id, rate = options.sample_rate, "Decoder created");
        Ok(id)
    }

    fn encoder(&mut self, id: SessionId) -> Result<&mut EncoderSession, CodecFailure> {
        match self.sessions.get_mut(&id) {
            Some(Session::Encoder(session)) => Ok(session),
            Some(Session::Decoder(_)) => Err(CodecFailure::new(format!(
                "session {} is a decoder",
                id
            ))),
            None => Err(CodecFailure::new(format!("unknown encoder session {}", id))),
        }
    }

    fn encode(
        &mut self,
        id: SessionId,
        pcm: Vec<f32>,
        max_bytes: usize,
    ) -> Result<Option<EncodedPacket>, CodecFailure> {
        let session = self.encoder(id)?;
        let options = session.options;
        let frame_len = options.frame_size * options.channels as usize;

        session.pending.extend_from_slice(&pcm);
        if session.pending.len() < frame_len {
            return Ok(None);
        }

        let frame: Vec<f32> = session.pending.drain(..frame_len).collect();
        let budget = if max_bytes == 0 {
            options.max_output_bytes
        } else {
            max_bytes
        };
        let payload = session
            .encoder
            .encode_vec_float(&frame, budget)
            .map_err(opus_failure)?;

        Ok(Some(EncodedPacket {
            payload,
            sample_count: options.frame_size as u32,
            duration_ms: options.frame_size as f64 * 1000.0 / options.sample_rate as f64,
        }))
    }

    fn set_bitrate(&mut self, id: SessionId, bits: i32) -> Result<i32, CodecFailure> {
        if bits <= 0 {
            return Err(CodecFailure::new(format!("invalid bitrate {}", bits)));
        }
        let session = self.encoder(id)?;
        session
            .encoder
            .set_bitrate(opus::Bitrate::Bits(bits))
            .map_err(opus_failure)?;
        read_bitrate(&mut session.encoder)
    }

    fn decode(&mut self, id: SessionId, payload: &[u8]) -> Result<Vec<f32>, CodecFailure> {
        let session = match self.sessions.get_mut(&id) {
            Some(Session::Decoder(session)) => session,
            Some(Session::Encoder(_)) => {
                return Err(CodecFailure::new(format!("session {} is an encoder", id)))
            }
            None => return Err(CodecFailure::new(format!("unknown decoder session {}", id))),
        };
        let channels = session.options.channels as usize;
        let capacity = session.options.sample_rate as usize * MAX_FRAME_MS / 1000 * channels;
        let mut output = vec![0.0f32; capacity];
        let frames = session
            .decoder
            .decode_float(payload, &mut output, false)
            .map_err(opus_failure)?;
        output.truncate(frames * channels);
        Ok(output)
    }
}

fn check_layout(sample_rate: u32, channel_count: u16) -> Vec<String> {
    let mut diagnostics = Vec::new();
    if !OPUS_SAMPLE_RATES.contains(&sample_rate) {
        diagnostics.push(format!("unsupported sample rate {}", sample_rate));
    }
    if !(1..=2).contains(&channel_count) {
        diagnostics.push(format!("unsupported channel count {}", channel_count));
    }
    diagnostics
}

fn channels(count: u16) -> opus::Channels {
    if count == 2 {
        opus::Channels::Stereo
    } else {
        opus::Channels::Mono
    }
}

fn read_bitrate(encoder: &mut opus::Encoder) -> Result<i32, CodecFailure> {
    match encoder.get_bitrate().map_err(opus_failure)? {
        opus::Bitrate::Bits(bits) => Ok(bits),
        other => Err(CodecFailure::new(format!(
            "encoder reports non-numeric bitrate {:?}",
            other
        ))),
    }
}

fn opus_failure(err: opus::Error) -> CodecFailure {
    CodecFailure::new(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder_options(sample_rate: u32, frame_size: usize) -> EncoderOptions {
        EncoderOptions {
            sample_rate,
            channels: 1,
            frame_size,
            max_output_bytes: 4000,
        }
    }

    fn tone(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / 48_000.0).sin() * 0.3)
            .collect()
    }

    #[tokio::test]
    async fn full_frame_round_trips_to_same_length() {
        let codec = OpusCodecService::new().unwrap();
        let encoder = codec.create_encoder(encoder_options(48_000, 4800)).await.unwrap();

        let packet = codec
            .encode_float(encoder, tone(4800), 4000)
            .await
            .unwrap()
            .expect("a full frame encodes");
        assert_eq!(packet.sample_count, 4800);
        assert_eq!(packet.duration_ms, 100.0);
        assert!(!packet.payload.is_empty() && packet.payload.len() <= 4000);

        let decoder = codec
            .create_decoder(DecoderOptions {
                sample_rate: 48_000,
                channels: 1,
            })
            .await
            .unwrap();
        let pcm = codec.decode_float(decoder, packet.payload).await.unwrap();
        assert_eq!(pcm.len(), 4800);

        codec.destroy(encoder).await;
        codec.destroy(decoder).await;
    }

    #[tokio::test]
    async fn partial_frame_is_buffered() {
        let codec = OpusCodecService::new().unwrap();
        let id = codec.create_encoder(encoder_options(16_000, 1600)).await.unwrap();

        assert!(codec.encode_float(id, tone(1000), 4000).await.unwrap().is_none());
        let packet = codec.encode_float(id, tone(1000), 4000).await.unwrap();
        assert_eq!(packet.map(|p| p.sample_count), Some(1600));
    }

    #[tokio::test]
    async fn invalid_encoder_options_report_every_problem() {
        let codec = OpusCodecService::new().unwrap();
        let failure = codec
            .create_encoder(EncoderOptions {
                sample_rate: 44_100,
                channels: 3,
                frame_size: 1000,
                max_output_bytes: 0,
            })
            .await
            .unwrap_err();
        assert_eq!(failure.diagnostics().len(), 4);
    }

    #[tokio::test]
    async fn bitrate_is_applied() {
        let codec = OpusCodecService::new().unwrap();
        let id = codec.create_encoder(encoder_options(48_000, 4800)).await.unwrap();
        assert_eq!(codec.set_bitrate(id, 24_000).await.unwrap(), 24_000);
        assert_eq!(codec.get_bitrate(id).await.unwrap(), 24_000);
        assert!(codec.set_bitrate(id, 0).await.is_err());
    }

    #[tokio::test]
    async fn destroyed_sessions_are_gone() {
        let codec = OpusCodecService::new().unwrap();
        let id = codec.create_encoder(encoder_options(48_000, 960)).await.unwrap();
        codec.destroy(id).await;
        codec.destroy(id).await;
        assert!(codec.encode_float(id, tone(960), 4000).await.is_err());
    }

    #[tokio::test]
    async fn sessions_are_typed() {
        let codec = OpusCodecService::new().unwrap();
        let encoder = codec.create_encoder(encoder_options(48_000, 960)).await.unwrap();
        assert!(codec.decode_float(encoder, vec![0; 10]).await.is_err());
    }
}
