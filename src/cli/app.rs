//! Command runners: record, play, list, devices

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::time::{interval, sleep, Duration as TokioDuration, MissedTickBehavior};
use tracing::{debug, warn};

use crate::application::ports::{ConfigStore, InputSource, PartStore};
use crate::application::{
    CaptureStateMachine, Event, EventBus, EventKind, PlayOutcome, PlaybackError,
    PlaybackScheduler,
};
use crate::domain::config::AppConfig;
use crate::domain::error::InvalidRecordingIdError;
use crate::domain::playback::PlaybackState;
use crate::domain::recording::RecordingId;
use crate::infrastructure::{CpalInput, FsPartStore, OpusCodecService, RodioOutput, XdgConfigStore};

use super::args::{PlayOptions, RecordOptions};
use super::presenter::Presenter;
use super::signals::ShutdownSignal;

/// Exit codes
pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_USAGE_ERROR: u8 = 2;

/// Environment overrides
pub const ENV_STORAGE_DIR: &str = "VOXPART_STORAGE_DIR";
pub const ENV_INPUT_DEVICE: &str = "VOXPART_INPUT_DEVICE";

/// How often the spinner refreshes
const PROGRESS_TICK: TokioDuration = TokioDuration::from_millis(200);

/// Record until interrupted, the duration elapses, or encoding halts
pub async fn run_record(options: RecordOptions, storage_dir: PathBuf) -> ExitCode {
    let mut presenter = Presenter::new();

    let shutdown = ShutdownSignal::new();
    if let Err(e) = shutdown.setup().await {
        presenter.error(&format!("Failed to setup signal handler: {}", e));
        return ExitCode::from(EXIT_ERROR);
    }

    let store = match FsPartStore::open(&storage_dir).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            presenter.error(&e.to_string());
            return ExitCode::from(EXIT_ERROR);
        }
    };
    let codec = match OpusCodecService::new() {
        Ok(codec) => Arc::new(codec),
        Err(e) => {
            presenter.error(&e.to_string());
            return ExitCode::from(EXIT_ERROR);
        }
    };

    let events = EventBus::new();
    let (_halted_subscription, mut halted) = events.channel(EventKind::EncodeHalted);
    let recorder = CaptureStateMachine::new(
        Arc::new(CpalInput::new()),
        codec,
        Arc::clone(&store),
        events,
        options.capture,
    );

    let started = match recorder
        .try_start(options.device.clone(), options.max_payload_bytes)
        .await
    {
        Ok(started) => started,
        Err(e) => {
            presenter.error(&format!("Failed to start recording: {}", e));
            return ExitCode::from(EXIT_ERROR);
        }
    };
    debug!(
        recording = %started.recording_id,
        bitrate = started.bitrate,
        "Recording started"
    );

    presenter.start_spinner("Recording...");
    let total_ms = options.duration.map(|d| d.as_millis());
    let deadline = async {
        match options.duration {
            Some(limit) => sleep(limit.as_std()).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut ticker = interval(PROGRESS_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut halt_diagnostics = None;

    loop {
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = &mut deadline => break,
            Some(event) = halted.recv() => {
                if let Event::EncodeHalted { diagnostics, .. } = event {
                    halt_diagnostics = Some(diagnostics);
                }
                break;
            }
            _ = ticker.tick() => {
                let status = recorder.current_state().await;
                presenter.update_recording_progress(status.elapsed_ms(), total_ms, status.level);
            }
        }
    }

    presenter.update_spinner("Finishing...");
    recorder.stop().await;

    let summary = match store.get(&started.recording_id).await {
        Ok(recording) => format!(
            "{:.1}s, {}",
            recording.duration_ms / 1000.0,
            recording.human_readable_size()
        ),
        Err(e) => {
            warn!("Failed to read the finished recording: {}", e);
            String::from("size unknown")
        }
    };

    match halt_diagnostics {
        Some(diagnostics) => {
            presenter.spinner_fail(&format!("Encoding stopped early ({})", summary));
            for diagnostic in &diagnostics {
                presenter.warn(diagnostic);
            }
            presenter.output(started.recording_id.as_str());
            ExitCode::from(EXIT_ERROR)
        }
        None => {
            presenter.spinner_success(&format!("Recording saved ({})", summary));
            presenter.output(started.recording_id.as_str());
            ExitCode::from(EXIT_SUCCESS)
        }
    }
}

/// Play a stored recording to the end or until interrupted
pub async fn run_play(options: PlayOptions, storage_dir: PathBuf) -> ExitCode {
    let mut presenter = Presenter::new();

    let shutdown = ShutdownSignal::new();
    if let Err(e) = shutdown.setup().await {
        presenter.error(&format!("Failed to setup signal handler: {}", e));
        return ExitCode::from(EXIT_ERROR);
    }

    let store = match FsPartStore::open(&storage_dir).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            presenter.error(&e.to_string());
            return ExitCode::from(EXIT_ERROR);
        }
    };
    let total_secs = match store.get(&options.recording_id).await {
        Ok(recording) => recording.duration_ms / 1000.0,
        Err(e) => {
            presenter.error(&e.to_string());
            return ExitCode::from(EXIT_ERROR);
        }
    };
    let codec = match OpusCodecService::new() {
        Ok(codec) => Arc::new(codec),
        Err(e) => {
            presenter.error(&e.to_string());
            return ExitCode::from(EXIT_ERROR);
        }
    };

    let events = EventBus::new();
    let (_state_subscription, mut states) = events.channel(EventKind::PlaybackState);
    let scheduler = PlaybackScheduler::new(
        codec,
        store,
        Arc::new(RodioOutput::new()),
        events,
        options.playback,
    );

    presenter.start_spinner("Preparing playback...");
    let from = options.from.as_secs_f64();
    match scheduler.play(options.recording_id.clone(), from).await {
        Ok(PlayOutcome::Started) => {}
        Ok(other) => {
            presenter.spinner_fail(&format!("Playback did not start ({:?})", other));
            return ExitCode::from(EXIT_ERROR);
        }
        Err(PlaybackError::Cancelled) => {
            presenter.stop_spinner();
            return ExitCode::from(EXIT_SUCCESS);
        }
        Err(e) => {
            presenter.spinner_fail(&e.to_string());
            return ExitCode::from(EXIT_ERROR);
        }
    }

    let mut ticker = interval(PROGRESS_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                interrupted = true;
                scheduler.destroy().await;
                break;
            }
            Some(event) = states.recv() => {
                if matches!(event, Event::PlaybackState { state: PlaybackState::Paused }) {
                    break;
                }
            }
            _ = ticker.tick() => {
                presenter.update_playback_progress(scheduler.progress().played, total_secs);
            }
        }
    }

    let played = scheduler.progress().played;
    if interrupted {
        presenter.spinner_success(&format!("Stopped at {:.1}s", played));
    } else {
        presenter.spinner_success(&format!("Played {:.1}s", played));
    }
    ExitCode::from(EXIT_SUCCESS)
}

/// Print stored recordings, newest first
pub async fn run_list(storage_dir: PathBuf) -> ExitCode {
    let presenter = Presenter::new();
    let store = match FsPartStore::open(&storage_dir).await {
        Ok(store) => store,
        Err(e) => {
            presenter.error(&e.to_string());
            return ExitCode::from(EXIT_ERROR);
        }
    };

    match store.list().await {
        Ok(recordings) if recordings.is_empty() => {
            presenter.info(&format!("No recordings in {}", storage_dir.display()));
            ExitCode::from(EXIT_SUCCESS)
        }
        Ok(recordings) => {
            for recording in &recordings {
                presenter.recording_row(recording);
            }
            ExitCode::from(EXIT_SUCCESS)
        }
        Err(e) => {
            presenter.error(&e.to_string());
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Print the available input devices
pub async fn run_devices() -> ExitCode {
    let presenter = Presenter::new();
    match CpalInput::new().list_devices().await {
        Ok(devices) if devices.is_empty() => {
            presenter.warn("No input devices found");
            ExitCode::from(EXIT_SUCCESS)
        }
        Ok(devices) => {
            for device in &devices {
                presenter.device_row(device);
            }
            ExitCode::from(EXIT_SUCCESS)
        }
        Err(e) => {
            presenter.error(&e.to_string());
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Parse a recording id argument
pub fn parse_recording_id(value: &str) -> Result<RecordingId, String> {
    value.parse().map_err(|e: InvalidRecordingIdError| e.to_string())
}

/// Configuration taken from the environment
pub fn env_config() -> AppConfig {
    let var = |name: &str| env::var(name).ok().filter(|s| !s.trim().is_empty());
    AppConfig {
        storage_dir: var(ENV_STORAGE_DIR),
        input_device: var(ENV_INPUT_DEVICE),
        ..Default::default()
    }
}

/// Load and merge configuration from file, env, and CLI
pub async fn load_merged_config(cli_config: AppConfig) -> AppConfig {
    let store = XdgConfigStore::new();
    let file_config = match store.load().await {
        Ok(config) => config,
        Err(e) => {
            warn!("Ignoring config file: {}", e);
            AppConfig::empty()
        }
    };

    // Merge: defaults < file < env < cli
    AppConfig::defaults()
        .merge(file_config)
        .merge(env_config())
        .merge(cli_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_ids_must_be_uuids() {
        assert!(parse_recording_id("nope").is_err());
        let id = RecordingId::generate();
        assert_eq!(parse_recording_id(id.as_str()).unwrap(), id);
    }
}
