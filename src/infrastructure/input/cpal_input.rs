//! Microphone input using cpal
//!
//! `cpal::Stream` is not `Send`, so every stream lives on its own thread.
//! The callback downmixes to mono `f32` and forwards blocks over a tokio
//! channel; the thread keeps the stream alive until told to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::JoinHandle;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::application::ports::{DeviceId, DeviceInfo, InputError, InputSource, InputStream};

/// Preferred capture rate; Opus accepts it without resampling
const PREFERRED_SAMPLE_RATE: u32 = 48_000;

/// Blocks buffered between the audio callback and the capture graph
const BLOCK_BUFFER: usize = 64;

/// Input source backed by the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

impl CpalInput {
    pub fn new() -> Self {
        Self
    }

    fn find_device(id: Option<&DeviceId>) -> Result<cpal::Device, InputError> {
        let host = cpal::default_host();
        match id {
            None => host
                .default_input_device()
                .ok_or_else(|| InputError::DeviceUnavailable("no default input device".into())),
            Some(id) => host
                .input_devices()
                .map_err(|e| InputError::DeviceUnavailable(e.to_string()))?
                .find(|d| d.name().map(|n| n == id.as_str()).unwrap_or(false))
                .ok_or_else(|| InputError::DeviceUnavailable(id.to_string())),
        }
    }

    /// Pick an i16/f32 configuration, preferring 48 kHz and fewer channels
    fn input_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat), InputError> {
        let supported = device
            .supported_input_configs()
            .map_err(|e| classify(e.to_string()))?;

        let includes_preferred = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate().0 <= PREFERRED_SAMPLE_RATE
                && c.max_sample_rate().0 >= PREFERRED_SAMPLE_RATE
        };

        let mut best: Option<cpal::SupportedStreamConfigRange> = None;
        for config in supported {
            if !matches!(config.sample_format(), SampleFormat::I16 | SampleFormat::F32) {
                continue;
            }
            let is_better = match &best {
                None => true,
                Some(current) => {
                    (includes_preferred(&config) && !includes_preferred(current))
                        || (includes_preferred(&config) == includes_preferred(current)
                            && config.channels() < current.channels())
                }
            };
            if is_better {
                best = Some(config);
            }
        }

        let range = best.ok_or_else(|| {
            InputError::Unsupported("no i16 or f32 input configuration".into())
        })?;
        let sample_rate = if includes_preferred(&range) {
            SampleRate(PREFERRED_SAMPLE_RATE)
        } else if range.max_sample_rate().0 < PREFERRED_SAMPLE_RATE {
            range.max_sample_rate()
        } else {
            range.min_sample_rate()
        };

        let format = range.sample_format();
        Ok((
            StreamConfig {
                channels: range.channels(),
                sample_rate,
                buffer_size: cpal::BufferSize::Default,
            },
            format,
        ))
    }

    fn downmix_f32(data: &[f32], channels: u16) -> Vec<f32> {
        if channels <= 1 {
            return data.to_vec();
        }
        data.chunks(channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    }

    fn downmix_i16(data: &[i16], channels: u16) -> Vec<f32> {
        let channels = channels.max(1) as usize;
        data.chunks(channels)
            .map(|frame| {
                let sum: f32 = frame.iter().map(|&s| s as f32 / 32768.0).sum();
                sum / frame.len() as f32
            })
            .collect()
    }

    /// Runs on the stream thread until `stop_rx` fires or its sender is dropped
    fn run_stream(
        device: Option<DeviceId>,
        blocks: mpsc::Sender<Vec<f32>>,
        live: Arc<AtomicBool>,
        ready: oneshot::Sender<Result<DeviceInfo, InputError>>,
        stop_rx: std_mpsc::Receiver<()>,
    ) {
        let opened = (|| {
            let host_default = cpal::default_host()
                .default_input_device()
                .and_then(|d| d.name().ok());
            let device = Self::find_device(device.as_ref())?;
            let name = device.name().map_err(|e| classify(e.to_string()))?;
            let (config, sample_format) = Self::input_config(&device)?;
            let channels = config.channels;

            let live_err = Arc::clone(&live);
            let on_error = move |err: cpal::StreamError| {
                warn!("Input stream error: {}", err);
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    live_err.store(false, Ordering::SeqCst);
                }
            };

            let stream = match sample_format {
                SampleFormat::F32 => {
                    let blocks = blocks.clone();
                    device.build_input_stream(
                        &config,
                        move |data: &[f32], _: &cpal::InputCallbackInfo| {
                            // A full queue drops the block rather than stalling the callback.
                            let _ = blocks.try_send(Self::downmix_f32(data, channels));
                        },
                        on_error,
                        None,
                    )
                }
                SampleFormat::I16 => {
                    let blocks = blocks.clone();
                    device.build_input_stream(
                        &config,
                        move |data: &[i16], _: &cpal::InputCallbackInfo| {
                            let _ = blocks.try_send(Self::downmix_i16(data, channels));
                        },
                        on_error,
                        None,
                    )
                }
                other => {
                    return Err(InputError::Unsupported(format!(
                        "sample format {:?}",
                        other
                    )))
                }
            }
            .map_err(|e| match e {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    InputError::DeviceUnavailable(name.clone())
                }
                other => classify(other.to_string()),
            })?;

            stream.play().map_err(|e| classify(e.to_string()))?;

            let info = DeviceInfo {
                is_default: host_default.as_deref() == Some(name.as_str()),
                id: DeviceId::new(name),
                sample_rate: config.sample_rate.0,
                channels,
            };
            Ok((stream, info))
        })();

        match opened {
            Ok((stream, info)) => {
                live.store(true, Ordering::SeqCst);
                debug!(device = %info.id, rate = info.sample_rate, "Input stream open");
                if ready.send(Ok(info)).is_err() {
                    live.store(false, Ordering::SeqCst);
                    return;
                }
                // Any message or a dropped sender ends the stream.
                let _ = stop_rx.recv();
                drop(stream);
                live.store(false, Ordering::SeqCst);
                debug!("Input stream closed");
            }
            Err(e) => {
                let _ = ready.send(Err(e));
            }
        }
    }
}

/// Map host error text onto the port's taxonomy
fn classify(message: String) -> InputError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        InputError::PermissionDenied(message)
    } else if lower.contains("not available") || lower.contains("no such device") {
        InputError::DeviceUnavailable(message)
    } else {
        InputError::Transport(message)
    }
}

#[async_trait]
impl InputSource for CpalInput {
    async fn acquire(
        &self,
        device: Option<&DeviceId>,
    ) -> Result<Box<dyn InputStream>, InputError> {
        let (blocks_tx, blocks_rx) = mpsc::channel(BLOCK_BUFFER);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let live = Arc::new(AtomicBool::new(false));

        let device = device.cloned();
        let thread_live = Arc::clone(&live);
        let thread = std::thread::Builder::new()
            .name("voxpart-input".into())
            .spawn(move || Self::run_stream(device, blocks_tx, thread_live, ready_tx, stop_rx))
            .map_err(|e| InputError::Transport(format!("Failed to spawn input thread: {}", e)))?;

        let info = match ready_rx.await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                return Err(InputError::Transport(
                    "Input thread exited before the stream opened".into(),
                ))
            }
        };

        Ok(Box::new(CpalStream {
            info,
            samples: Some(blocks_rx),
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            live,
        }))
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, InputError> {
        tokio::task::spawn_blocking(|| {
            let host = cpal::default_host();
            let default_name = host.default_input_device().and_then(|d| d.name().ok());
            let devices = host
                .input_devices()
                .map_err(|e| InputError::DeviceUnavailable(e.to_string()))?;

            Ok(devices
                .filter_map(|device| {
                    let name = device.name().ok()?;
                    let config = device.default_input_config().ok()?;
                    Some(DeviceInfo {
                        is_default: default_name.as_deref() == Some(name.as_str()),
                        id: DeviceId::new(name),
                        sample_rate: config.sample_rate().0,
                        channels: config.channels(),
                    })
                })
                .collect())
        })
        .await
        .map_err(|e| InputError::Transport(format!("Device enumeration failed: {}", e)))?
    }
}

/// A running cpal stream owned by its thread
struct CpalStream {
    info: DeviceInfo,
    samples: Option<mpsc::Receiver<Vec<f32>>>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    live: Arc<AtomicBool>,
}

impl InputStream for CpalStream {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn take_samples(&mut self) -> Option<mpsc::Receiver<Vec<f32>>> {
        self.samples.take()
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(device = %self.info.id, "Input thread panicked");
            }
        }
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop();
    }
}
