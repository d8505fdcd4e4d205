//! Config command handler

use std::str::FromStr;

use crate::application::ports::ConfigStore;
use crate::domain::config::AppConfig;
use crate::domain::error::ConfigError;
use crate::domain::recording::Duration;

use super::args::{is_valid_config_key, ConfigAction, VALID_CONFIG_KEYS};
use super::presenter::Presenter;

const NOT_SET: &str = "(not set)";

/// Handle config subcommand
pub async fn handle_config_command<S: ConfigStore>(
    action: ConfigAction,
    store: &S,
    presenter: &Presenter,
) -> Result<(), ConfigError> {
    match action {
        ConfigAction::Init => handle_init(store, presenter).await,
        ConfigAction::Set { key, value } => handle_set(store, presenter, &key, &value).await,
        ConfigAction::Get { key } => handle_get(store, presenter, &key).await,
        ConfigAction::List => handle_list(store, presenter).await,
        ConfigAction::Path => handle_path(store, presenter),
    }
}

async fn handle_init<S: ConfigStore>(store: &S, presenter: &Presenter) -> Result<(), ConfigError> {
    store.init().await?;
    presenter.success(&format!(
        "Config file created at: {}",
        store.path().display()
    ));
    Ok(())
}

async fn handle_set<S: ConfigStore>(
    store: &S,
    presenter: &Presenter,
    key: &str,
    value: &str,
) -> Result<(), ConfigError> {
    check_key(key)?;

    let mut config = store.load().await?;
    apply_value(&mut config, key, value)?;

    store.save(&config).await?;
    presenter.success(&format!("{} = {}", key, value));

    Ok(())
}

async fn handle_get<S: ConfigStore>(
    store: &S,
    presenter: &Presenter,
    key: &str,
) -> Result<(), ConfigError> {
    check_key(key)?;

    let config = store.load().await?;
    match read_value(&config, key) {
        Some(v) => presenter.output(&v),
        None => presenter.output(NOT_SET),
    }

    Ok(())
}

async fn handle_list<S: ConfigStore>(store: &S, presenter: &Presenter) -> Result<(), ConfigError> {
    let config = store.load().await?;

    for key in VALID_CONFIG_KEYS {
        let value = read_value(&config, key).unwrap_or_else(|| NOT_SET.to_string());
        presenter.key_value(key, &value);
    }

    Ok(())
}

fn handle_path<S: ConfigStore>(store: &S, presenter: &Presenter) -> Result<(), ConfigError> {
    presenter.output(&store.path().to_string_lossy());
    Ok(())
}

fn check_key(key: &str) -> Result<(), ConfigError> {
    if is_valid_config_key(key) {
        return Ok(());
    }
    Err(ConfigError::ValidationError {
        key: key.to_string(),
        message: format!("Unknown key. Valid keys: {}", VALID_CONFIG_KEYS.join(", ")),
    })
}

/// Validate `value` for `key` and store it in `config`
fn apply_value(config: &mut AppConfig, key: &str, value: &str) -> Result<(), ConfigError> {
    match key {
        "storage_dir" => config.storage_dir = Some(non_empty(key, value)?),
        "input_device" => config.input_device = Some(non_empty(key, value)?),
        "max_payload_bytes" => config.max_payload_bytes = Some(positive(key, value)?),
        "bitrate" => config.bitrate = Some(positive(key, value)?),
        "look_ahead" => {
            let parsed = duration(key, value)?;
            if parsed.is_zero() {
                return Err(invalid(key, "Look-ahead must be longer than zero"));
            }
            config.look_ahead = Some(parsed.to_string());
        }
        "lead_in" => config.lead_in = Some(duration(key, value)?.to_string()),
        "play_debounce" => config.play_debounce = Some(duration(key, value)?.to_string()),
        "refill_ratio" => {
            let ratio: f64 = value
                .parse()
                .map_err(|_| invalid(key, "Value must be a number"))?;
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(invalid(key, "Value must be in (0, 1]"));
            }
            config.refill_ratio = Some(ratio);
        }
        other => return check_key(other),
    }
    Ok(())
}

/// Display value of `key`, or `None` when unset
fn read_value(config: &AppConfig, key: &str) -> Option<String> {
    match key {
        "storage_dir" => config.storage_dir.clone(),
        "input_device" => config.input_device.clone(),
        "max_payload_bytes" => config.max_payload_bytes.map(|v| v.to_string()),
        "bitrate" => config.bitrate.map(|v| v.to_string()),
        "look_ahead" => config.look_ahead.clone(),
        "lead_in" => config.lead_in.clone(),
        "refill_ratio" => config.refill_ratio.map(|v| v.to_string()),
        "play_debounce" => config.play_debounce.clone(),
        _ => None,
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::ValidationError {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn non_empty(key: &str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(invalid(key, "Value must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn positive<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    match value.parse::<T>() {
        Ok(parsed) if parsed > T::default() => Ok(parsed),
        _ => Err(invalid(key, "Value must be a positive integer")),
    }
}

fn duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value.parse::<Duration>().map_err(|e| ConfigError::ValidationError {
        key: key.to_string(),
        message: e.to_string(),
    })
}
