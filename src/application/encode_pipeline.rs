//! Ordered encode pipeline
//!
//! A bounded single-consumer queue feeds one worker task, so a recording
//! session never has more than one encode request outstanding and chunks are
//! emitted in capture order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::events::{Event, EventBus};
use super::ports::{CodecService, PartStore};
use crate::domain::recording::{AudioFormat, EncodedChunk, RecordingId, SessionId};

/// Frames buffered between the frame node and the worker
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Sender half used by the frame-producing node
pub type FrameSender = mpsc::Sender<Vec<f32>>;

/// Identity and limits of one encode session
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeSession {
    pub encoder_id: SessionId,
    pub recording_id: RecordingId,
    pub format: AudioFormat,
    pub max_payload_bytes: usize,
}

/// Summary returned once the worker has finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineReport {
    pub chunks: u64,
    pub samples: u64,
    pub halted: bool,
}

#[derive(Debug, Default)]
struct Progress {
    samples: AtomicU64,
    halted: AtomicBool,
}

/// Handle to a running encode worker
pub struct EncodePipeline {
    encoder_id: SessionId,
    frames: Option<FrameSender>,
    worker: Option<JoinHandle<PipelineReport>>,
    progress: Arc<Progress>,
}

impl EncodePipeline {
    /// Spawn the worker. It announces the recording before consuming frames.
    pub fn spawn<C, S>(
        codec: Arc<C>,
        store: Arc<S>,
        events: EventBus,
        session: EncodeSession,
        capacity: usize,
    ) -> Self
    where
        C: CodecService + 'static,
        S: PartStore + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let progress = Arc::new(Progress::default());
        let encoder_id = session.encoder_id;

        let worker = tokio::spawn(run_worker(
            codec,
            store,
            events,
            session,
            rx,
            Arc::clone(&progress),
        ));

        Self {
            encoder_id,
            frames: Some(tx),
            worker: Some(worker),
            progress,
        }
    }

    /// A sender for the frame node, or `None` once draining started
    pub fn frame_sender(&self) -> Option<FrameSender> {
        self.frames.clone()
    }

    /// Samples per channel persisted so far
    pub fn samples(&self) -> u64 {
        self.progress.samples.load(Ordering::SeqCst)
    }

    /// Whether the worker stopped after a failure
    pub fn is_halted(&self) -> bool {
        self.progress.halted.load(Ordering::SeqCst)
    }

    /// Close the queue and wait until every queued frame has been encoded,
    /// persisted and announced.
    pub async fn drain(mut self) -> PipelineReport {
        self.frames.take();
        let Some(worker) = self.worker.take() else {
            return PipelineReport::default();
        };
        match worker.await {
            Ok(report) => report,
            Err(e) => {
                error!(encoder_id = self.encoder_id, "Encode worker panicked: {}", e);
                PipelineReport {
                    chunks: 0,
                    samples: self.samples(),
                    halted: true,
                }
            }
        }
    }
}

async fn run_worker<C, S>(
    codec: Arc<C>,
    store: Arc<S>,
    events: EventBus,
    session: EncodeSession,
    mut frames: mpsc::Receiver<Vec<f32>>,
    progress: Arc<Progress>,
) -> PipelineReport
where
    C: CodecService + 'static,
    S: PartStore + 'static,
{
    let encoder_id = session.encoder_id;
    events.emit(Event::StartRecording {
        encoder_id,
        recording_id: session.recording_id.clone(),
        sample_rate: session.format.sample_rate,
        frame_size: session.format.frame_size,
        channels: session.format.channels,
    });

    let mut next_index: u64 = 0;
    let mut halt_reason: Option<Vec<String>> = None;

    while let Some(frame) = frames.recv().await {
        let packet = match codec
            .encode_float(encoder_id, frame, session.max_payload_bytes)
            .await
        {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(failure) => {
                halt_reason = Some(failure.into_diagnostics());
                break;
            }
        };

        let chunk = EncodedChunk {
            encoder_id,
            sequence_index: next_index,
            sample_count: packet.sample_count,
            payload: packet.payload,
            duration_ms: packet.duration_ms,
        };
        next_index += 1;

        let event = Event::Encoded {
            encoder_id,
            sequence_index: chunk.sequence_index,
            duration_ms: chunk.duration_ms,
            size: chunk.payload.len(),
            payload: chunk.payload.clone(),
        };
        let sample_count = chunk.sample_count as u64;

        if let Err(err) = store
            .add_recording_part(chunk.into_part(session.format))
            .await
        {
            halt_reason = Some(vec![err.to_string()]);
            break;
        }

        progress.samples.fetch_add(sample_count, Ordering::SeqCst);
        events.emit(event);
    }

    let halted = halt_reason.is_some();
    if let Some(diagnostics) = halt_reason {
        // Deregister the frame handler: later sends fail and the frame node exits.
        frames.close();
        progress.halted.store(true, Ordering::SeqCst);
        error!(
            encoder_id,
            "Encoding halted, no further chunks will be emitted: {}",
            diagnostics.join("; ")
        );
        events.emit(Event::EncodeHalted {
            encoder_id,
            diagnostics,
        });
    } else {
        debug!(encoder_id, chunks = next_index, "Encode queue drained");
    }

    info!(
        encoder_id,
        chunks = next_index,
        halted,
        "Encode worker finished"
    );

    PipelineReport {
        chunks: next_index,
        samples: progress.samples.load(Ordering::SeqCst),
        halted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::events::EventKind;
    use crate::application::ports::{EncoderOptions, PartStore};
    use crate::application::test_support::FakeCodec;
    use crate::domain::recording::RecordingMeta;
    use crate::infrastructure::store::MemoryPartStore;
    use futures::StreamExt;

    async fn setup(codec: &FakeCodec, store: &MemoryPartStore) -> EncodeSession {
        let format = AudioFormat::mono(16_000);
        let encoder_id = codec
            .create_encoder(EncoderOptions {
                sample_rate: format.sample_rate,
                channels: 1,
                frame_size: format.frame_size,
                max_output_bytes: 4000,
            })
            .await
            .unwrap();
        let recording_id = store
            .create(RecordingMeta {
                encoder_id,
                format,
                device: None,
            })
            .await
            .unwrap();
        EncodeSession {
            encoder_id,
            recording_id,
            format,
            max_payload_bytes: 4000,
        }
    }

    #[tokio::test]
    async fn chunks_are_sequenced_and_persisted_in_order() {
        let codec = Arc::new(FakeCodec::new());
        let store = Arc::new(MemoryPartStore::new());
        let events = EventBus::new();
        let (_sub, mut encoded) = events.channel(EventKind::Encoded);
        let session = setup(&codec, &store).await;
        let recording_id = session.recording_id.clone();

        let pipeline = EncodePipeline::spawn(
            Arc::clone(&codec),
            Arc::clone(&store),
            events.clone(),
            session,
            4,
        );
        let tx = pipeline.frame_sender().unwrap();
        for i in 0..5 {
            tx.send(vec![i as f32 / 10.0; 1600]).await.unwrap();
        }
        drop(tx);
        let report = pipeline.drain().await;

        assert_eq!(report.chunks, 5);
        assert_eq!(report.samples, 5 * 1600);
        assert!(!report.halted);
        assert_eq!(codec.max_concurrent_encodes(), 1);

        let mut indices = Vec::new();
        while let Ok(Event::Encoded {
            sequence_index,
            size,
            ..
        }) = encoded.try_recv()
        {
            indices.push((sequence_index, size));
        }
        assert_eq!(
            indices.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
            vec![0, 1, 2, 3, 4]
        );

        let parts: Vec<_> = store
            .parts_ordered_by_index(&recording_id)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(parts.len(), 5);
        for (part, (index, size)) in parts.into_iter().zip(indices) {
            let part = part.unwrap();
            assert_eq!(part.part_index, index);
            assert_eq!(part.encoded.len(), size);
        }
    }

    #[tokio::test]
    async fn partial_frames_are_not_chunks() {
        let codec = Arc::new(FakeCodec::new());
        let store = Arc::new(MemoryPartStore::new());
        let session = setup(&codec, &store).await;
        let pipeline =
            EncodePipeline::spawn(Arc::clone(&codec), store, EventBus::new(), session, 4);

        let tx = pipeline.frame_sender().unwrap();
        tx.send(vec![0.0; 800]).await.unwrap();
        tx.send(vec![0.0; 800]).await.unwrap();
        tx.send(vec![0.0; 400]).await.unwrap();
        drop(tx);

        let report = pipeline.drain().await;
        assert_eq!(report.chunks, 1);
    }

    #[tokio::test]
    async fn encode_failure_halts_emission() {
        let codec = Arc::new(FakeCodec::new());
        let store = Arc::new(MemoryPartStore::new());
        let events = EventBus::new();
        let (_halt_sub, mut halted) = events.channel(EventKind::EncodeHalted);
        let (_enc_sub, mut encoded) = events.channel(EventKind::Encoded);
        let session = setup(&codec, &store).await;
        codec.fail_encode_after(2);

        let pipeline = EncodePipeline::spawn(
            Arc::clone(&codec),
            Arc::clone(&store),
            events.clone(),
            session,
            8,
        );
        let tx = pipeline.frame_sender().unwrap();
        for _ in 0..10 {
            if tx.send(vec![0.0; 1600]).await.is_err() {
                break;
            }
        }
        drop(tx);
        let report = pipeline.drain().await;

        assert!(report.halted);
        assert_eq!(report.chunks, 2);
        assert!(matches!(halted.try_recv(), Ok(Event::EncodeHalted { .. })));
        let mut count = 0;
        while encoded.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn start_notification_precedes_chunks() {
        let codec = Arc::new(FakeCodec::new());
        let store = Arc::new(MemoryPartStore::new());
        let events = EventBus::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let order_start = Arc::clone(&order);
        let order_enc = Arc::clone(&order);
        let _a = events.subscribe(EventKind::StartRecording, move |_| {
            order_start.lock().unwrap().push("start");
        });
        let _b = events.subscribe(EventKind::Encoded, move |_| {
            order_enc.lock().unwrap().push("encoded");
        });
        let session = setup(&codec, &store).await;

        let pipeline = EncodePipeline::spawn(codec, store, events.clone(), session, 4);
        let tx = pipeline.frame_sender().unwrap();
        tx.send(vec![0.0; 1600]).await.unwrap();
        drop(tx);
        pipeline.drain().await;

        assert_eq!(*order.lock().unwrap(), vec!["start", "encoded"]);
    }
}
