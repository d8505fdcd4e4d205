//! Voxpart CLI entry point

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voxpart::application::ports::DeviceId;
use voxpart::application::{CaptureConfig, PlaybackConfig};
use voxpart::cli::{
    app::{
        load_merged_config, parse_recording_id, run_devices, run_list, run_play, run_record,
        EXIT_ERROR, EXIT_USAGE_ERROR,
    },
    args::{Cli, Commands},
    config_cmd::handle_config_command,
    presenter::Presenter,
    PlayOptions, RecordOptions,
};
use voxpart::domain::config::AppConfig;
use voxpart::domain::recording::Duration;
use voxpart::infrastructure::XdgConfigStore;

/// Logs go to stderr; `--verbose` overrides `RUST_LOG`
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::new("voxpart=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "voxpart=warn".into())
    };
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let presenter = Presenter::new();

    match cli.command {
        Commands::Config { action } => {
            let store = XdgConfigStore::new();
            if let Err(e) = handle_config_command(action, &store, &presenter).await {
                presenter.error(&e.to_string());
                return ExitCode::from(EXIT_ERROR);
            }
            ExitCode::SUCCESS
        }
        Commands::Devices => run_devices().await,
        Commands::List => {
            let config = load_merged_config(AppConfig::empty()).await;
            run_list(config.storage_dir_or_default()).await
        }
        Commands::Record {
            device,
            duration,
            bitrate,
            max_payload,
        } => {
            let duration = match duration.as_deref().map(str::parse::<Duration>) {
                None => None,
                Some(Ok(d)) if d.is_zero() => {
                    presenter.error("Invalid duration: must be longer than zero");
                    return ExitCode::from(EXIT_USAGE_ERROR);
                }
                Some(Ok(d)) => Some(d),
                Some(Err(e)) => {
                    presenter.error(&format!("Invalid duration: {}", e));
                    return ExitCode::from(EXIT_USAGE_ERROR);
                }
            };

            let config = load_merged_config(AppConfig {
                input_device: device,
                bitrate,
                max_payload_bytes: max_payload,
                ..Default::default()
            })
            .await;

            let options = RecordOptions {
                device: config.input_device.clone().map(DeviceId::new),
                duration,
                max_payload_bytes: config.max_payload_bytes_or_default(),
                capture: CaptureConfig::from(&config),
            };
            run_record(options, config.storage_dir_or_default()).await
        }
        Commands::Play { id, from } => {
            let recording_id = match parse_recording_id(&id) {
                Ok(id) => id,
                Err(e) => {
                    presenter.error(&e);
                    return ExitCode::from(EXIT_USAGE_ERROR);
                }
            };
            let from = match from.as_deref().map(str::parse::<Duration>) {
                None => Duration::ZERO,
                Some(Ok(d)) => d,
                Some(Err(e)) => {
                    presenter.error(&format!("Invalid offset: {}", e));
                    return ExitCode::from(EXIT_USAGE_ERROR);
                }
            };

            let config = load_merged_config(AppConfig::empty()).await;
            let options = PlayOptions {
                recording_id,
                from,
                playback: PlaybackConfig::from(&config),
            };
            run_play(options, config.storage_dir_or_default()).await
        }
    }
}
