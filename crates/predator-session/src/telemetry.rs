// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session runtime telemetry: console and page-error capture.
//!
//! Like the network observer, the buffer drains its subscription
//! synchronously on every read, so sequences are deterministic under any
//! scheduler.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use predator_driver::{PageDriver, PageEvent};

const DEFAULT_MAX_EVENTS: usize = 256;
const MESSAGE_CAP: usize = 240;

/// One captured console or page-error event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    /// Strictly monotone per-session sequence number.
    pub seq: u64,
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    /// `console` or `pageerror`.
    pub kind: String,
    /// Truncated message text.
    pub message: String,
}

#[derive(Debug, Default)]
struct BufferState {
    events: VecDeque<RuntimeEvent>,
    seq: u64,
    receiver: Option<broadcast::Receiver<PageEvent>>,
}

/// Bounded buffer of runtime events for one session.
#[derive(Debug)]
pub struct RuntimeTelemetryBuffer {
    state: Mutex<BufferState>,
    max_events: usize,
}

impl Default for RuntimeTelemetryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl RuntimeTelemetryBuffer {
    /// Build a buffer keeping at most `max_events` events.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            max_events,
        }
    }

    fn drain_locked(state: &mut BufferState, max_events: usize) {
        let Some(receiver) = state.receiver.as_mut() else {
            return;
        };
        loop {
            let (kind, message) = match receiver.try_recv() {
                Ok(PageEvent::Console { level, text }) => {
                    ("console".to_string(), format!("{level}: {text}"))
                }
                Ok(PageEvent::PageError { message }) => ("pageerror".to_string(), message),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => break,
            };
            state.seq += 1;
            let seq = state.seq;
            state.events.push_back(RuntimeEvent {
                seq,
                ts: chrono::Utc::now().to_rfc3339(),
                kind,
                message: message.chars().take(MESSAGE_CAP).collect(),
            });
            while state.events.len() > max_events {
                state.events.pop_front();
            }
        }
    }

    /// Attach to a page's event tap. Replaces any previous attachment.
    pub async fn attach(&self, page: &Arc<dyn PageDriver>) {
        let mut state = self.state.lock().expect("telemetry lock poisoned");
        state.receiver = Some(page.subscribe());
    }

    /// Detach from the current page.
    pub async fn detach(&self) {
        let mut state = self.state.lock().expect("telemetry lock poisoned");
        Self::drain_locked(&mut state, self.max_events);
        state.receiver = None;
    }

    /// Current high-water sequence number.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        let mut state = self.state.lock().expect("telemetry lock poisoned");
        Self::drain_locked(&mut state, self.max_events);
        state.seq
    }

    /// Events with sequence strictly greater than `seq`.
    #[must_use]
    pub fn events_since(&self, seq: u64) -> Vec<RuntimeEvent> {
        let mut state = self.state.lock().expect("telemetry lock poisoned");
        Self::drain_locked(&mut state, self.max_events);
        state
            .events
            .iter()
            .filter(|event| event.seq > seq)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use predator_driver::BrowserDriver;
    use predator_driver::sim::{PageScript, SimEffect, SimWorld, SimulatedBrowser};
    use predator_driver::RawElement;
    use std::time::Duration;

    #[tokio::test]
    async fn console_and_page_errors_are_buffered_in_order() {
        let world = SimWorld::new();
        world.route(
            "http://app.test/",
            PageScript::single_frame(
                "http://app.test/",
                vec![RawElement::new("button", "Go", "button", "#go")],
            ),
        );
        world.on_click(
            "#go",
            vec![
                SimEffect::EmitConsole {
                    level: "warn".into(),
                    text: "deprecated call".into(),
                },
                SimEffect::EmitConsole {
                    level: "error".into(),
                    text: "boom".into(),
                },
            ],
        );
        let browser = SimulatedBrowser::new(world);
        let context = browser.new_context().await.unwrap();
        let page = context.new_page().await.unwrap();
        page.goto("http://app.test/", Duration::from_secs(1))
            .await
            .unwrap();

        let buffer = RuntimeTelemetryBuffer::default();
        buffer.attach(&page).await;
        let watermark = buffer.sequence();

        page.click(0, "#go", Duration::from_secs(1)).await.unwrap();

        let events = buffer.events_since(watermark);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "console");
        assert_eq!(events[0].message, "warn: deprecated call");
        assert!(events[0].seq < events[1].seq);

        // Watermarked reads exclude everything already seen.
        assert!(buffer.events_since(buffer.sequence()).is_empty());
        buffer.detach().await;
    }
}
