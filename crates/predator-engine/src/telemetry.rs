// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-action execution timelines and the engine telemetry sink.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

/// Phase timeline and counters for one action execution.
#[derive(Debug)]
pub struct Telemetry {
    start: Instant,
    timeline: Vec<(String, String, Value)>,
    counters: BTreeMap<String, u64>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    /// Start a fresh timeline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            timeline: Vec::new(),
            counters: BTreeMap::new(),
        }
    }

    /// Record a phase event with metadata.
    pub fn event(&mut self, phase: &str, metadata: Value) {
        self.timeline
            .push((phase.to_string(), chrono::Utc::now().to_rfc3339(), metadata));
    }

    /// Increment a counter.
    pub fn incr(&mut self, counter: &str, value: u64) {
        *self.counters.entry(counter.to_string()).or_insert(0) += value;
    }

    /// Snapshot the timeline as a boundary payload.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let elapsed_ms = self.start.elapsed().as_millis() as u64;
        serde_json::json!({
            "elapsed_ms": elapsed_ms,
            "counters": self.counters,
            "timeline": self.timeline.iter().map(|(phase, ts, metadata)| {
                serde_json::json!({"phase": phase, "ts": ts, "metadata": metadata})
            }).collect::<Vec<_>>(),
        })
    }
}

/// Receives one event per action outcome.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Deliver one event. Implementations swallow their own failures.
    async fn emit(&self, event: &Value);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullTelemetrySink;

#[async_trait]
impl TelemetrySink for NullTelemetrySink {
    async fn emit(&self, _event: &Value) {}
}

/// Appends one canonical JSON line per event to `<dir>/events.jsonl`.
#[derive(Debug)]
pub struct JsonlTelemetrySink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonlTelemetrySink {
    /// Build a sink under `dir`, creating it if needed.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            path: dir.join("events.jsonl"),
            lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl TelemetrySink for JsonlTelemetrySink {
    async fn emit(&self, event: &Value) {
        let _guard = self.lock.lock().await;
        let Ok(line) = predator_core::canonical_json(event) else {
            return;
        };
        if let Some(parent) = self.path.parent()
            && let Err(error) = std::fs::create_dir_all(parent)
        {
            warn!(%error, "telemetry dir create failed");
            return;
        }
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| {
                use std::io::Write;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")
            });
        if let Err(error) = appended {
            warn!(%error, "telemetry emit failed");
        }
    }
}
