//! Capture graph: source -> analyser -> frame-producing node.
//!
//! The analyser is shared for the whole recording; on a device swap a new
//! source node is connected into it before the old one is torn down. On
//! stop the nodes are finished front to back so no captured block is lost.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::encode_pipeline::FrameSender;
use super::ports::InputStream;

/// Channel between the analyser and the frame node
const ANALYSER_BUFFER: usize = 64;

/// Block size fed to the resampler
const RESAMPLE_CHUNK: usize = 1024;

/// Shared analysis node: tracks the input level and forwards samples to
/// whatever frame node is connected.
pub struct AnalyserNode {
    level_bits: AtomicU32,
    output: StdMutex<Option<mpsc::Sender<Vec<f32>>>>,
}

impl AnalyserNode {
    pub fn new() -> Self {
        Self {
            level_bits: AtomicU32::new(0f32.to_bits()),
            output: StdMutex::new(None),
        }
    }

    /// Peak level of the last processed block, 0.0..=1.0
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    fn connect_output(&self, tx: mpsc::Sender<Vec<f32>>) {
        if let Ok(mut output) = self.output.lock() {
            *output = Some(tx);
        }
    }

    /// Detach the frame node; it finishes once in-flight blocks are consumed
    pub fn disconnect_output(&self) {
        if let Ok(mut output) = self.output.lock() {
            output.take();
        }
    }

    /// Analyse a block and pass it downstream
    pub async fn process(&self, samples: Vec<f32>) {
        let peak = samples
            .iter()
            .fold(0f32, |acc, s| acc.max(s.abs()))
            .min(1.0);
        self.level_bits.store(peak.to_bits(), Ordering::Relaxed);

        let tx = self.output.lock().ok().and_then(|o| o.clone());
        if let Some(tx) = tx {
            // A closed frame node simply drops the block.
            let _ = tx.send(samples).await;
        }
    }
}

impl Default for AnalyserNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming mono rate converter
struct RateConverter {
    resampler: FftFixedIn<f32>,
    pending: Vec<f32>,
}

impl RateConverter {
    fn new(from_rate: u32, to_rate: u32) -> Result<Self, String> {
        let resampler = FftFixedIn::<f32>::new(
            from_rate as usize,
            to_rate as usize,
            RESAMPLE_CHUNK,
            2, // Sub-chunks
            1, // Mono
        )
        .map_err(|e| format!("Resampler init failed: {}", e))?;
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(samples);
        let mut output = Vec::new();
        loop {
            let needed = self.resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let block: Vec<f32> = self.pending.drain(..needed).collect();
            match self.resampler.process(&[block], None) {
                Ok(mut resampled) => output.append(&mut resampled[0]),
                Err(e) => {
                    warn!("Resampling failed, dropping block: {}", e);
                }
            }
        }
        output
    }

    /// Convert whatever is still buffered, zero-padded to a full chunk
    fn flush(&mut self) -> Vec<f32> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let input = [std::mem::take(&mut self.pending)];
        match self.resampler.process_partial(Some(&input[..]), None) {
            Ok(mut resampled) => resampled.swap_remove(0),
            Err(e) => {
                warn!("Resampler flush failed, dropping tail: {}", e);
                Vec::new()
            }
        }
    }
}

/// Pumps one input stream into the analyser
pub struct SourceNode {
    closing: CancellationToken,
    task: JoinHandle<()>,
}

impl SourceNode {
    /// Connect `stream` into `analyser`, converting to `target_rate` if the
    /// device runs at a different rate.
    pub fn connect(
        stream: &mut dyn InputStream,
        analyser: Arc<AnalyserNode>,
        target_rate: u32,
    ) -> Result<Self, String> {
        let device = stream.info().clone();
        let mut samples = stream
            .take_samples()
            .ok_or_else(|| format!("Stream for '{}' is already connected", device.id))?;

        let mut converter = if device.sample_rate != target_rate {
            debug!(
                device = %device.id,
                from = device.sample_rate,
                to = target_rate,
                "Resampling capture stream"
            );
            Some(RateConverter::new(device.sample_rate, target_rate)?)
        } else {
            None
        };

        let closing = CancellationToken::new();
        let close = closing.clone();
        let task = tokio::spawn(async move {
            let mut closed = false;
            loop {
                let next = tokio::select! {
                    next = samples.recv() => next,
                    _ = close.cancelled(), if !closed => {
                        // Refuse new blocks; the buffered ones are still delivered.
                        samples.close();
                        closed = true;
                        continue;
                    }
                };
                let Some(block) = next else {
                    break;
                };
                let block = match converter.as_mut() {
                    Some(converter) => converter.push(&block),
                    None => block,
                };
                if !block.is_empty() {
                    analyser.process(block).await;
                }
            }

            if let Some(tail) = converter.as_mut().map(RateConverter::flush) {
                if !tail.is_empty() {
                    analyser.process(tail).await;
                }
            }
        });

        Ok(Self { closing, task })
    }

    /// Stop pumping at once; blocks still in the stream channel are dropped.
    /// Used when another source already feeds the analyser.
    pub fn disconnect(self) {
        self.task.abort();
    }

    /// Close the stream channel and wait until every block it still holds
    /// has passed through the analyser.
    pub async fn finish(self) {
        self.closing.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("Source node task failed: {}", e);
            }
        }
    }
}

/// Cuts the analysed signal into fixed-size frames for the encode pipeline
pub struct FrameNode {
    task: JoinHandle<()>,
}

impl FrameNode {
    /// Attach a frame node of `frame_len` samples behind `analyser`
    pub fn attach(analyser: &AnalyserNode, frame_len: usize, pipeline: FrameSender) -> Self {
        let (tx, mut rx) = mpsc::channel::<Vec<f32>>(ANALYSER_BUFFER);
        analyser.connect_output(tx);

        let task = tokio::spawn(async move {
            let mut pending: Vec<f32> = Vec::with_capacity(frame_len * 2);
            while let Some(block) = rx.recv().await {
                pending.extend_from_slice(&block);
                while pending.len() >= frame_len {
                    let frame: Vec<f32> = pending.drain(..frame_len).collect();
                    if pipeline.send(frame).await.is_err() {
                        debug!("Encode pipeline closed, frame node detaching");
                        return;
                    }
                }
            }
            if pending.is_empty() {
                return;
            }
            // The last words of a recording live in the partial frame.
            debug!(samples = pending.len(), "Padding final frame with silence");
            pending.resize(frame_len, 0.0);
            let _ = pipeline.send(pending).await;
        });

        Self { task }
    }

    /// Wait for the node to forward everything it has received, the padded
    /// final frame included. The analyser output must be disconnected first.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("Frame node task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::DeviceId;
    use crate::application::test_support::FakeStream;

    #[tokio::test]
    async fn frame_node_emits_fixed_size_frames() {
        let analyser = Arc::new(AnalyserNode::new());
        let (pipe_tx, mut pipe_rx) = mpsc::channel(16);
        let frames = FrameNode::attach(&analyser, 4, pipe_tx);

        analyser.process(vec![0.1; 3]).await;
        analyser.process(vec![0.2; 6]).await;
        analyser.disconnect_output();
        frames.join().await;

        let first = pipe_rx.recv().await.unwrap();
        let second = pipe_rx.recv().await.unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(second.len(), 4);
        assert_eq!(first[..3], [0.1f32; 3]);

        // The leftover sample goes out padded with silence.
        assert_eq!(pipe_rx.recv().await.unwrap(), vec![0.2, 0.0, 0.0, 0.0]);
        assert!(pipe_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn analyser_tracks_peak_level() {
        let analyser = AnalyserNode::new();
        analyser.process(vec![0.1, -0.6, 0.3]).await;
        assert!((analyser.level() - 0.6).abs() < 1e-6);
        analyser.process(vec![2.0]).await;
        assert_eq!(analyser.level(), 1.0);
    }

    #[tokio::test]
    async fn source_node_pumps_stream_into_analyser() {
        let analyser = Arc::new(AnalyserNode::new());
        let (pipe_tx, mut pipe_rx) = mpsc::channel(16);
        let frames = FrameNode::attach(&analyser, 2, pipe_tx);

        let (mut stream, feed) = FakeStream::new(DeviceId::new("mic"), 16_000);
        let source = SourceNode::connect(&mut stream, Arc::clone(&analyser), 16_000).unwrap();
        feed.send(vec![0.5; 4]).await.unwrap();

        assert_eq!(pipe_rx.recv().await.unwrap(), vec![0.5, 0.5]);
        assert_eq!(pipe_rx.recv().await.unwrap(), vec![0.5, 0.5]);

        source.disconnect();
        analyser.disconnect_output();
        frames.join().await;
    }

    #[tokio::test]
    async fn finished_source_delivers_every_buffered_block() {
        let analyser = Arc::new(AnalyserNode::new());
        let (pipe_tx, mut pipe_rx) = mpsc::channel(16);
        let frames = FrameNode::attach(&analyser, 1600, pipe_tx);

        let (mut stream, feed) = FakeStream::new(DeviceId::new("mic"), 16_000);
        let source = SourceNode::connect(&mut stream, Arc::clone(&analyser), 16_000).unwrap();
        for _ in 0..5 {
            feed.send(vec![0.3; 1600]).await.unwrap();
        }

        // The feed is still open; finishing must not wait for it.
        source.finish().await;
        assert!(feed.send(vec![0.3; 1600]).await.is_err());
        analyser.disconnect_output();
        frames.join().await;

        let mut delivered = 0;
        while let Some(frame) = pipe_rx.recv().await {
            assert_eq!(frame.len(), 1600);
            delivered += 1;
        }
        assert_eq!(delivered, 5);
    }

    #[tokio::test]
    async fn second_connect_on_same_stream_fails() {
        let analyser = Arc::new(AnalyserNode::new());
        let (mut stream, _feed) = FakeStream::new(DeviceId::new("mic"), 16_000);
        let first = SourceNode::connect(&mut stream, Arc::clone(&analyser), 16_000).unwrap();
        assert!(SourceNode::connect(&mut stream, analyser, 16_000).is_err());
        first.disconnect();
    }

    #[test]
    fn rate_converter_changes_length_by_ratio() {
        let mut converter = RateConverter::new(44_100, 48_000).unwrap();
        let mut produced = 0;
        for _ in 0..20 {
            produced += converter.push(&[0.0; 2205]).len();
        }
        let expected = 44_100.0 * (48_000.0 / 44_100.0);
        // Whole input second minus what is still buffered inside the converter.
        assert!(produced as f64 > expected * 0.9);
        assert!(produced as f64 <= expected * 1.01);

        let tail = converter.flush();
        assert!(!tail.is_empty());
        assert!(converter.flush().is_empty());
    }
}
