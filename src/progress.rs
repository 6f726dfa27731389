// src/progress.rs

//! Progress reporting for packing, publishing and deploying
//!
//! Library operations never draw anything themselves. They report through a
//! [`ProgressTracker`] handed in by the caller:
//! - `CliProgress`: indicatif bar or spinner for interactive use
//! - `LogProgress`: periodic `tracing` lines for non-interactive runs
//! - `SilentProgress`: counts only, for tests and scripted use
//! - `CallbackProgress`: forwards [`ProgressEvent`]s to a closure
//!
//! Transfers report bytes, multi-component operations report components.
//! Trackers are shared across worker threads, so every method takes `&self`.

use indicatif::{ProgressBar, ProgressStyle as BarStyle};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// What the counter of a tracker measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressUnit {
    /// Discrete items (files, components)
    #[default]
    Items,
    /// Bytes moved
    Bytes,
}

/// Progress sink shared by long-running operations
pub trait ProgressTracker: Send + Sync {
    fn set_message(&self, message: &str);

    /// Advance by `amount` units
    fn increment(&self, amount: u64);

    /// Jump to an absolute position (used when a transfer resumes)
    fn set_position(&self, position: u64);

    fn set_length(&self, length: u64);

    fn position(&self) -> u64;

    fn length(&self) -> u64;

    fn finish_with_message(&self, message: &str);

    fn finish_with_error(&self, message: &str);

    fn is_finished(&self) -> bool;
}

/// Counter state shared by the non-visual trackers
#[derive(Debug, Default)]
struct Counters {
    position: AtomicU64,
    length: AtomicU64,
    finished: AtomicBool,
}

impl Counters {
    fn with_length(length: u64) -> Self {
        Self {
            length: AtomicU64::new(length),
            ..Default::default()
        }
    }

    fn add(&self, amount: u64) -> (u64, u64) {
        let old = self.position.fetch_add(amount, Ordering::Relaxed);
        (old, old + amount)
    }
}

/// No-op tracker that still counts
#[derive(Debug, Default)]
pub struct SilentProgress {
    counters: Counters,
}

impl SilentProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_length(length: u64) -> Self {
        Self {
            counters: Counters::with_length(length),
        }
    }
}

impl ProgressTracker for SilentProgress {
    fn set_message(&self, _message: &str) {}

    fn increment(&self, amount: u64) {
        self.counters.add(amount);
    }

    fn set_position(&self, position: u64) {
        self.counters.position.store(position, Ordering::Relaxed);
    }

    fn set_length(&self, length: u64) {
        self.counters.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.counters.position.load(Ordering::Relaxed)
    }

    fn length(&self) -> u64 {
        self.counters.length.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, _message: &str) {
        self.counters.finished.store(true, Ordering::Relaxed);
    }

    fn finish_with_error(&self, _message: &str) {
        self.counters.finished.store(true, Ordering::Relaxed);
    }

    fn is_finished(&self) -> bool {
        self.counters.finished.load(Ordering::Relaxed)
    }
}

/// Tracker that logs roughly every tenth of the way
#[derive(Debug)]
pub struct LogProgress {
    name: String,
    unit: ProgressUnit,
    counters: Counters,
}

impl LogProgress {
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            unit: ProgressUnit::Items,
            counters: Counters::with_length(length),
        }
    }

    pub fn with_unit(mut self, unit: ProgressUnit) -> Self {
        self.unit = unit;
        self
    }

    fn interval(&self) -> u64 {
        std::cmp::max(1, self.length() / 10)
    }
}

impl ProgressTracker for LogProgress {
    fn set_message(&self, message: &str) {
        info!("{}: {}", self.name, message);
    }

    fn increment(&self, amount: u64) {
        let (old, new) = self.counters.add(amount);
        let length = self.length();
        let interval = self.interval();

        if length > 0 && new / interval > old / interval {
            let percent = (new.min(length) * 100) / length;
            match self.unit {
                ProgressUnit::Items => info!("{}: {}% ({}/{})", self.name, percent, new, length),
                ProgressUnit::Bytes => {
                    info!("{}: {}% ({} of {} bytes)", self.name, percent, new, length)
                }
            }
        }
    }

    fn set_position(&self, position: u64) {
        self.counters.position.store(position, Ordering::Relaxed);
    }

    fn set_length(&self, length: u64) {
        self.counters.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.counters.position.load(Ordering::Relaxed)
    }

    fn length(&self) -> u64 {
        self.counters.length.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, message: &str) {
        self.counters.finished.store(true, Ordering::Relaxed);
        info!("{}: {}", self.name, message);
    }

    fn finish_with_error(&self, message: &str) {
        self.counters.finished.store(true, Ordering::Relaxed);
        warn!("{}: {}", self.name, message);
    }

    fn is_finished(&self) -> bool {
        self.counters.finished.load(Ordering::Relaxed)
    }
}

/// Event forwarded by [`CallbackProgress`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Message(String),
    Position { current: u64, total: u64 },
    Finished(String),
    Error(String),
}

/// Tracker that forwards every update to a closure
pub struct CallbackProgress<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    callback: F,
    counters: Counters,
}

impl<F> CallbackProgress<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    pub fn new(length: u64, callback: F) -> Self {
        Self {
            callback,
            counters: Counters::with_length(length),
        }
    }

    fn emit_position(&self, current: u64) {
        (self.callback)(ProgressEvent::Position {
            current,
            total: self.length(),
        });
    }
}

impl<F> ProgressTracker for CallbackProgress<F>
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn set_message(&self, message: &str) {
        (self.callback)(ProgressEvent::Message(message.to_string()));
    }

    fn increment(&self, amount: u64) {
        let (_, new) = self.counters.add(amount);
        self.emit_position(new);
    }

    fn set_position(&self, position: u64) {
        self.counters.position.store(position, Ordering::Relaxed);
        self.emit_position(position);
    }

    fn set_length(&self, length: u64) {
        self.counters.length.store(length, Ordering::Relaxed);
    }

    fn position(&self) -> u64 {
        self.counters.position.load(Ordering::Relaxed)
    }

    fn length(&self) -> u64 {
        self.counters.length.load(Ordering::Relaxed)
    }

    fn finish_with_message(&self, message: &str) {
        self.counters.finished.store(true, Ordering::Relaxed);
        (self.callback)(ProgressEvent::Finished(message.to_string()));
    }

    fn finish_with_error(&self, message: &str) {
        self.counters.finished.store(true, Ordering::Relaxed);
        (self.callback)(ProgressEvent::Error(message.to_string()));
    }

    fn is_finished(&self) -> bool {
        self.counters.finished.load(Ordering::Relaxed)
    }
}

/// Terminal progress bar
pub struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    /// Bar for a known number of units; a zero length gives a spinner
    pub fn new(message: &str, length: u64, unit: ProgressUnit) -> Self {
        let bar = if length == 0 {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) = BarStyle::default_spinner().template("{spinner:.green} {msg}") {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(100));
            bar
        } else {
            let template = match unit {
                ProgressUnit::Items => "{msg} ({pos}/{len}) [{bar:40.green/dim}] {percent}%",
                ProgressUnit::Bytes => {
                    "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})"
                }
            };
            let bar = ProgressBar::new(length);
            if let Ok(style) = BarStyle::default_bar().template(template) {
                bar.set_style(style.progress_chars("##-"));
            }
            bar
        };
        bar.set_message(message.to_string());
        Self { bar }
    }
}

impl ProgressTracker for CliProgress {
    fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn increment(&self, amount: u64) {
        self.bar.inc(amount);
    }

    fn set_position(&self, position: u64) {
        self.bar.set_position(position);
    }

    fn set_length(&self, length: u64) {
        self.bar.set_length(length);
    }

    fn position(&self) -> u64 {
        self.bar.position()
    }

    fn length(&self) -> u64 {
        self.bar.length().unwrap_or(0)
    }

    fn finish_with_message(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    fn finish_with_error(&self, message: &str) {
        self.bar.abandon_with_message(format!("FAILED: {}", message));
    }

    fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_silent_progress_counts() {
        let progress = SilentProgress::with_length(100);
        progress.increment(10);
        progress.increment(5);
        assert_eq!(progress.position(), 15);

        progress.set_position(90);
        assert_eq!(progress.position(), 90);
        assert!(!progress.is_finished());
        progress.finish_with_message("done");
        assert!(progress.is_finished());
    }

    #[test]
    fn test_log_progress_bytes() {
        let progress = LogProgress::new("upload", 1000).with_unit(ProgressUnit::Bytes);
        for _ in 0..10 {
            progress.increment(100);
        }
        assert_eq!(progress.position(), 1000);
        progress.finish_with_error("connection reset");
        assert!(progress.is_finished());
    }

    #[test]
    fn test_callback_progress_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let progress = CallbackProgress::new(4, move |e| sink.lock().unwrap().push(e));

        progress.set_message("model:1.0.0");
        progress.increment(1);
        progress.set_position(3);
        progress.finish_with_message("deployed");

        let captured = events.lock().unwrap();
        assert_eq!(
            *captured,
            vec![
                ProgressEvent::Message("model:1.0.0".to_string()),
                ProgressEvent::Position { current: 1, total: 4 },
                ProgressEvent::Position { current: 3, total: 4 },
                ProgressEvent::Finished("deployed".to_string()),
            ]
        );
    }

    #[test]
    fn test_cli_progress_hidden_in_tests() {
        let progress = CliProgress::new("pack", 3, ProgressUnit::Items);
        progress.increment(2);
        assert_eq!(progress.position(), 2);
        assert_eq!(progress.length(), 3);
        progress.finish_with_message("ok");
        assert!(progress.is_finished());
    }
}
