//! CLI presenter for output formatting

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};

use crate::application::ports::DeviceInfo;
use crate::domain::recording::Recording;

/// Width of the progress and level bars
const BAR_WIDTH: usize = 20;

/// Presenter for CLI output formatting
pub struct Presenter {
    spinner: Option<ProgressBar>,
    is_spinner_active: Arc<AtomicBool>,
}

impl Presenter {
    /// Create a new presenter
    pub fn new() -> Self {
        Self {
            spinner: None,
            is_spinner_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a spinner with message
    pub fn start_spinner(&mut self, message: &str) {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        self.spinner = Some(spinner);
        self.is_spinner_active.store(true, Ordering::SeqCst);
    }

    /// Update spinner message
    pub fn update_spinner(&self, message: &str) {
        if let Some(ref spinner) = self.spinner {
            spinner.set_message(message.to_string());
        }
    }

    /// Mark spinner as success and finish
    pub fn spinner_success(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_with_message(format!("{} {}", "✓".green(), message));
        }
        self.is_spinner_active.store(false, Ordering::SeqCst);
    }

    /// Mark spinner as failed and finish
    pub fn spinner_fail(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_with_message(format!("{} {}", "✗".red(), message));
        }
        self.is_spinner_active.store(false, Ordering::SeqCst);
    }

    /// Stop spinner without status
    pub fn stop_spinner(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
        self.is_spinner_active.store(false, Ordering::SeqCst);
    }

    /// Print info message to stderr
    pub fn info(&self, message: &str) {
        eprintln!("{} {}", "ℹ".cyan(), message);
    }

    /// Print success message to stderr
    pub fn success(&self, message: &str) {
        eprintln!("{} {}", "✓".green(), message);
    }

    /// Print warning message to stderr
    pub fn warn(&self, message: &str) {
        eprintln!("{} {}", "⚠".yellow(), message);
    }

    /// Print error message to stderr
    pub fn error(&self, message: &str) {
        eprintln!("{} {}", "✗".red(), message);
    }

    /// Output text to stdout
    pub fn output(&self, text: &str) {
        println!("{}", text);
    }

    /// Format a filled bar for `ratio` in 0.0..=1.0
    fn bar(ratio: f64) -> String {
        let filled = (ratio.clamp(0.0, 1.0) * BAR_WIDTH as f64) as usize;
        format!(
            "{}{}",
            "█".repeat(filled).cyan(),
            "░".repeat(BAR_WIDTH - filled)
        )
    }

    /// Format recording progress, bounded or open-ended
    pub fn format_progress(&self, elapsed_ms: u64, total_ms: Option<u64>) -> String {
        let elapsed_secs = elapsed_ms / 1000;
        match total_ms {
            Some(total_ms) => {
                let ratio = if total_ms > 0 {
                    elapsed_ms as f64 / total_ms as f64
                } else {
                    0.0
                };
                format!(
                    "[{}] {:>3}s / {}s",
                    Self::bar(ratio),
                    elapsed_secs,
                    total_ms / 1000
                )
            }
            None => format!("{:>3}s", elapsed_secs),
        }
    }

    /// Format an input level meter
    pub fn format_level(&self, level: f32) -> String {
        format!("[{}]", Self::bar(level as f64))
    }

    /// Update recording progress
    pub fn update_recording_progress(&self, elapsed_ms: u64, total_ms: Option<u64>, level: f32) {
        let progress = self.format_progress(elapsed_ms, total_ms);
        self.update_spinner(&format!(
            "Recording... {} {}",
            progress,
            self.format_level(level)
        ));
    }

    /// Update playback progress
    pub fn update_playback_progress(&self, played_secs: f64, total_secs: f64) {
        let ratio = if total_secs > 0.0 {
            played_secs / total_secs
        } else {
            0.0
        };
        self.update_spinner(&format!(
            "Playing... [{}] {:.1}s / {:.1}s",
            Self::bar(ratio),
            played_secs,
            total_secs
        ));
    }

    /// Print one stored recording to stdout
    pub fn recording_row(&self, recording: &Recording) {
        println!(
            "{}  {}  {:>8.1}s  {:>9}  {}",
            recording.id.as_str().cyan(),
            recording.created_at.format("%Y-%m-%d %H:%M:%S"),
            recording.duration_ms / 1000.0,
            recording.human_readable_size(),
            recording.device.as_deref().unwrap_or("-")
        );
    }

    /// Print one input device to stdout
    pub fn device_row(&self, device: &DeviceInfo) {
        let marker = if device.is_default { "*" } else { " " };
        println!(
            "{} {}  ({} Hz, {} ch)",
            marker.green(),
            device.id,
            device.sample_rate,
            device.channels
        );
    }

    /// Print a key-value pair (for config list)
    pub fn key_value(&self, key: &str, value: &str) {
        println!("{}: {}", key.cyan(), value);
    }
}

impl Default for Presenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_progress_at_start() {
        let presenter = Presenter::new();
        let progress = presenter.format_progress(0, Some(10000));
        assert!(progress.contains("0s / 10s"));
    }

    #[test]
    fn format_progress_at_half() {
        let presenter = Presenter::new();
        let progress = presenter.format_progress(5000, Some(10000));
        assert!(progress.contains("5s / 10s"));
    }

    #[test]
    fn format_progress_past_end_is_clamped() {
        let presenter = Presenter::new();
        let progress = presenter.format_progress(12000, Some(10000));
        assert!(progress.contains("12s / 10s"));
        assert!(!progress.contains('░'));
    }

    #[test]
    fn format_progress_open_ended() {
        let presenter = Presenter::new();
        let progress = presenter.format_progress(42_500, None);
        assert_eq!(progress.trim(), "42s");
    }

    #[test]
    fn format_level_silence_is_empty() {
        let presenter = Presenter::new();
        let level = presenter.format_level(0.0);
        assert_eq!(level.matches('░').count(), BAR_WIDTH);
    }
}
