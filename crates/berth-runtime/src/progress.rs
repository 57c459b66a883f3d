//! Structured progress side channel.
//!
//! Long operations report `PROGRESS:{json}` lines on stderr so the final JSON
//! result on stdout is never interleaved with status chatter.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::Mutex;

pub const PROGRESS_PREFIX: &str = "PROGRESS:";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<String>>,
}

impl ProgressEvent {
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: Some(percent.min(100)),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn at_step(mut self, step: u32, total: u32, label: impl Into<String>) -> Self {
        self.step = Some(step);
        self.total = Some(total);
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_steps(mut self, steps: &[&str]) -> Self {
        self.steps = Some(steps.iter().map(|s| (*s).to_owned()).collect());
        self
    }

    pub fn to_line(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned());
        format!("{PROGRESS_PREFIX}{json}")
    }

    /// Parse a line written by [`to_line`](Self::to_line).
    pub fn parse_line(line: &str) -> Option<Self> {
        serde_json::from_str(line.strip_prefix(PROGRESS_PREFIX)?).ok()
    }
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Writes `PROGRESS:` lines to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn emit(&self, event: &ProgressEvent) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", event.to_line());
        let _ = err.flush();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressSink for CollectingProgress {
    fn emit(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
