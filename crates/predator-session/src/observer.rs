// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session network observation.
//!
//! The observer subscribes to the driver's event tap and normalises raw
//! events into a bounded, strictly monotone sequence: route keys, status
//! classes, depth-bounded JSON shape hashes, and silent-failure detection.
//! Pending events are drained synchronously on every read, so summaries
//! since a sequence watermark are stable regardless of scheduling and of
//! how many receivers were attached.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use predator_core::{NetworkFailure, NetworkSummary, stable_hash};
use predator_driver::{PageDriver, PageEvent, RawNetworkEvent, RawNetworkKind};

const DEFAULT_MAX_EVENTS: usize = 256;
const FAILURE_DETAIL_CAP: usize = 20;

/// Observer-level event discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkEventKind {
    /// A request left the page.
    Request,
    /// A response arrived.
    Response,
    /// The request failed at the transport layer.
    RequestFailed,
}

/// One observed network event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    /// Strictly monotone per-session sequence number.
    pub seq: u64,
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    /// Event discriminator.
    pub kind: NetworkEventKind,
    /// HTTP method.
    pub method: String,
    /// Full URL.
    pub url: String,
    /// `host/path[:2]` grouping key.
    pub route_key: String,
    /// HTTP status for responses.
    pub status: Option<u16>,
    /// Request-to-response latency.
    pub latency_ms: Option<u64>,
    /// `"<digit>xx"` class for responses.
    pub status_class: Option<String>,
    /// `Content-Type` header for responses.
    pub content_type: Option<String>,
    /// Depth-bounded JSON shape hash for JSON responses.
    pub json_shape_hash: Option<String>,
    /// A 2xx JSON body signalled an error.
    pub silent_failure: bool,
    /// Stable signature of the failure cause.
    pub error_signature: Option<String>,
}

/// Derive the `host/path[:2]` route key for a URL.
#[must_use]
pub fn route_key(raw_url: &str) -> String {
    match url::Url::parse(raw_url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or("");
            let segments: Vec<&str> = parsed
                .path()
                .split('/')
                .filter(|segment| !segment.is_empty())
                .take(2)
                .collect();
            if segments.is_empty() {
                format!("{host}/")
            } else {
                format!("{host}/{}", segments.join("/"))
            }
        }
        Err(_) => raw_url.to_string(),
    }
}

fn status_class(status: Option<u16>) -> String {
    match status {
        Some(status) => format!("{}xx", status / 100),
        None => "none".into(),
    }
}

fn json_shape(value: &Value, depth: u8) -> Value {
    if depth > 2 {
        return Value::String("...".into());
    }
    match value {
        Value::Object(map) => {
            let mut shaped = serde_json::Map::new();
            for (key, item) in map.iter().take(12) {
                shaped.insert(key.clone(), json_shape(item, depth + 1));
            }
            Value::Object(shaped)
        }
        Value::Array(items) => match items.first() {
            Some(first) => Value::Array(vec![json_shape(first, depth + 1)]),
            None => Value::Array(vec![]),
        },
        Value::Null => Value::String("null".into()),
        Value::Bool(_) => Value::String("bool".into()),
        Value::Number(_) => Value::String("number".into()),
        Value::String(_) => Value::String("string".into()),
    }
}

/// Depth-bounded shape hash of a JSON payload.
#[must_use]
pub fn json_shape_hash(payload: &Value) -> String {
    stable_hash(&json_shape(payload, 0))
}

fn silent_failure(payload: &Value) -> (bool, Option<String>) {
    if let Value::Object(map) = payload {
        if map.get("success") == Some(&Value::Bool(false)) {
            return (true, Some("json_success_false".into()));
        }
        if matches!(
            map.get("error"),
            Some(Value::String(_) | Value::Object(_) | Value::Array(_))
        ) {
            return (true, Some("json_error_present".into()));
        }
        if let Some(Value::Array(errors)) = map.get("errors")
            && !errors.is_empty()
        {
            return (true, Some("json_errors_nonempty".into()));
        }
    }
    (false, None)
}

#[derive(Debug, Default)]
struct ObserverState {
    events: VecDeque<NetworkEvent>,
    seq: u64,
    receiver: Option<broadcast::Receiver<PageEvent>>,
}

/// Bounded per-session network event stream.
#[derive(Debug)]
pub struct NetworkObserver {
    state: Mutex<ObserverState>,
    max_events: usize,
}

impl Default for NetworkObserver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

impl NetworkObserver {
    /// Build an observer keeping at most `max_events` events.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            state: Mutex::new(ObserverState::default()),
            max_events,
        }
    }

    fn normalise(raw: RawNetworkEvent, seq: u64) -> NetworkEvent {
        let ts = chrono::Utc::now().to_rfc3339();
        match raw.kind {
            RawNetworkKind::Request => NetworkEvent {
                seq,
                ts,
                kind: NetworkEventKind::Request,
                route_key: route_key(&raw.url),
                method: raw.method,
                url: raw.url,
                status: None,
                latency_ms: None,
                status_class: None,
                content_type: None,
                json_shape_hash: None,
                silent_failure: false,
                error_signature: None,
            },
            RawNetworkKind::Response => {
                let is_json = raw
                    .content_type
                    .as_deref()
                    .is_some_and(|ct| ct.contains("application/json"));
                let (shape, silent, signature) = if is_json {
                    if raw.body_parse_failed {
                        (None, true, Some("json_parse_error".to_string()))
                    } else if let Some(body) = &raw.body_json {
                        let (silent, signature) = silent_failure(body);
                        (Some(json_shape_hash(body)), silent, signature)
                    } else {
                        (None, true, Some("json_parse_error".to_string()))
                    }
                } else {
                    (None, false, None)
                };
                NetworkEvent {
                    seq,
                    ts,
                    kind: NetworkEventKind::Response,
                    route_key: route_key(&raw.url),
                    method: raw.method,
                    url: raw.url,
                    status: raw.status,
                    latency_ms: raw.latency_ms,
                    status_class: Some(status_class(raw.status)),
                    content_type: raw.content_type,
                    json_shape_hash: shape,
                    silent_failure: silent,
                    error_signature: signature,
                }
            }
            RawNetworkKind::RequestFailed => NetworkEvent {
                seq,
                ts,
                kind: NetworkEventKind::RequestFailed,
                route_key: route_key(&raw.url),
                method: raw.method,
                url: raw.url,
                status: None,
                latency_ms: None,
                status_class: None,
                content_type: None,
                json_shape_hash: None,
                silent_failure: false,
                error_signature: Some(raw.error_text.unwrap_or_else(|| "request_failed".into())),
            },
        }
    }

    fn drain_locked(state: &mut ObserverState, max_events: usize) {
        let Some(receiver) = state.receiver.as_mut() else {
            return;
        };
        loop {
            match receiver.try_recv() {
                Ok(PageEvent::Network(raw)) => {
                    state.seq += 1;
                    let event = Self::normalise(raw, state.seq);
                    state.events.push_back(event);
                    while state.events.len() > max_events {
                        state.events.pop_front();
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => break,
            }
        }
    }

    /// Attach to a page's event tap. Replaces any previous attachment.
    pub async fn attach(&self, page: &std::sync::Arc<dyn PageDriver>) {
        let mut state = self.state.lock().expect("observer lock poisoned");
        state.receiver = Some(page.subscribe());
    }

    /// Detach from the current page.
    pub async fn detach(&self) {
        let mut state = self.state.lock().expect("observer lock poisoned");
        Self::drain_locked(&mut state, self.max_events);
        state.receiver = None;
    }

    /// Current high-water sequence number.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        let mut state = self.state.lock().expect("observer lock poisoned");
        Self::drain_locked(&mut state, self.max_events);
        state.seq
    }

    /// Events with sequence strictly greater than `seq`.
    #[must_use]
    pub fn events_since(&self, seq: u64) -> Vec<NetworkEvent> {
        let mut state = self.state.lock().expect("observer lock poisoned");
        Self::drain_locked(&mut state, self.max_events);
        state
            .events
            .iter()
            .filter(|event| event.seq > seq)
            .cloned()
            .collect()
    }

    /// Summarise events with sequence strictly greater than `seq`.
    #[must_use]
    pub fn summary_since(&self, seq: u64) -> NetworkSummary {
        let events = self.events_since(seq);
        let total_requests = events
            .iter()
            .filter(|event| event.kind == NetworkEventKind::Request)
            .count() as u64;
        let responses: Vec<&NetworkEvent> = events
            .iter()
            .filter(|event| event.kind == NetworkEventKind::Response)
            .collect();

        let mut failures: Vec<NetworkFailure> = Vec::new();
        for event in &responses {
            let http_failure = event.status.is_some_and(|status| status >= 400);
            if http_failure || event.silent_failure {
                failures.push(NetworkFailure {
                    route_key: event.route_key.clone(),
                    status: event.status.unwrap_or(0),
                    status_class: event.status_class.clone().unwrap_or_else(|| "none".into()),
                    error_signature: event
                        .error_signature
                        .clone()
                        .unwrap_or_else(|| "response_failure".into()),
                    latency_ms: event.latency_ms.unwrap_or(0),
                });
            }
        }
        for event in &events {
            if event.kind == NetworkEventKind::RequestFailed {
                failures.push(NetworkFailure {
                    route_key: event.route_key.clone(),
                    status: 0,
                    status_class: "none".into(),
                    error_signature: event
                        .error_signature
                        .clone()
                        .unwrap_or_else(|| "request_failed".into()),
                    latency_ms: 0,
                });
            }
        }

        let total_failures = failures.len() as u64;
        failures.truncate(FAILURE_DETAIL_CAP);
        NetworkSummary {
            total_requests,
            total_responses: responses.len() as u64,
            total_failures,
            failures,
        }
    }
}
