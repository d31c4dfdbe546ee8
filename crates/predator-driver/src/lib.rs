// SPDX-License-Identifier: MIT OR Apache-2.0
//! predator-driver
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The automation driver boundary. The browser engine itself is out of
//! scope for the execution engine; it is modelled here as a set of
//! object-safe traits exposing page, frame, locator, and network hooks.
//! A deterministic in-memory implementation ([`sim::SimulatedBrowser`])
//! ships alongside the traits for tests and embedding.

/// Deterministic in-memory driver implementation.
pub mod sim;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

pub use predator_core::SelectorState;

/// Errors surfaced by an automation driver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// The operation did not complete within its timeout.
    #[error("driver timeout: {0}")]
    Timeout(String),
    /// No element matched the selector.
    #[error("target not found: {0}")]
    TargetNotFound(String),
    /// A selector resolved to an unexpected number of elements.
    #[error("strict selector resolved to {count} elements: {selector}")]
    StrictViolation {
        /// The offending selector.
        selector: String,
        /// Number of elements it resolved to.
        count: usize,
    },
    /// Navigation failed.
    #[error("navigation failed: {0}")]
    Navigation(String),
    /// Page evaluation failed.
    #[error("evaluate failed: {0}")]
    Evaluate(String),
    /// The page or context has been closed.
    #[error("driver closed")]
    Closed,
}

/// Result alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Discriminator for [`RawNetworkEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawNetworkKind {
    /// A request left the page.
    Request,
    /// A response arrived.
    Response,
    /// The request failed at the transport layer.
    RequestFailed,
}

/// A network event as reported by the driver, before observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNetworkEvent {
    /// Event discriminator.
    pub kind: RawNetworkKind,
    /// HTTP method.
    pub method: String,
    /// Full URL.
    pub url: String,
    /// HTTP status for responses.
    pub status: Option<u16>,
    /// `Content-Type` header for responses.
    pub content_type: Option<String>,
    /// Parsed JSON body for JSON responses, when available.
    pub body_json: Option<Value>,
    /// Whether a JSON body failed to parse.
    pub body_parse_failed: bool,
    /// Request-to-response latency.
    pub latency_ms: Option<u64>,
    /// Transport error text for failed requests.
    pub error_text: Option<String>,
}

impl RawNetworkEvent {
    /// A plain request event.
    #[must_use]
    pub fn request(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: RawNetworkKind::Request,
            method: method.into(),
            url: url.into(),
            status: None,
            content_type: None,
            body_json: None,
            body_parse_failed: false,
            latency_ms: None,
            error_text: None,
        }
    }

    /// A non-JSON response event.
    #[must_use]
    pub fn response(method: impl Into<String>, url: impl Into<String>, status: u16) -> Self {
        Self {
            kind: RawNetworkKind::Response,
            method: method.into(),
            url: url.into(),
            status: Some(status),
            content_type: Some("text/html".into()),
            body_json: None,
            body_parse_failed: false,
            latency_ms: Some(5),
            error_text: None,
        }
    }

    /// A JSON response event with a parsed body.
    #[must_use]
    pub fn json_response(
        method: impl Into<String>,
        url: impl Into<String>,
        status: u16,
        body: Value,
    ) -> Self {
        Self {
            kind: RawNetworkKind::Response,
            method: method.into(),
            url: url.into(),
            status: Some(status),
            content_type: Some("application/json".into()),
            body_json: Some(body),
            body_parse_failed: false,
            latency_ms: Some(5),
            error_text: None,
        }
    }

    /// A transport-level failure event.
    #[must_use]
    pub fn failed(
        method: impl Into<String>,
        url: impl Into<String>,
        error_text: impl Into<String>,
    ) -> Self {
        Self {
            kind: RawNetworkKind::RequestFailed,
            method: method.into(),
            url: url.into(),
            status: None,
            content_type: None,
            body_json: None,
            body_parse_failed: false,
            latency_ms: None,
            error_text: Some(error_text.into()),
        }
    }
}

/// An event pushed by the driver to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PageEvent {
    /// A network event.
    Network(RawNetworkEvent),
    /// The page URL changed.
    UrlChanged {
        /// The new URL.
        url: String,
    },
    /// A console message was emitted.
    Console {
        /// Console level (`log`, `warn`, `error`, ...).
        level: String,
        /// Message text.
        text: String,
    },
    /// An uncaught page error fired.
    PageError {
        /// Error text.
        message: String,
    },
}

/// One frame in the driver's frame tree, root first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Position in the driver's frame list; `0` is the main frame.
    pub index: usize,
    /// Parent frame index; `None` for the main frame.
    pub parent: Option<usize>,
    /// Frame URL.
    pub url: String,
}

/// An interactive element as collected from a frame, pre-extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawElement {
    /// ARIA role or tag name.
    pub role: String,
    /// Accessible name (untrusted).
    pub name: String,
    /// Input type or tag name.
    pub element_type: String,
    /// Whether the element accepts interaction.
    pub enabled: bool,
    /// Whether the element is visible in the viewport.
    pub visible: bool,
    /// Whether the element is a required form field.
    pub required: bool,
    /// Checked state for checkboxes/radios.
    pub checked: Option<bool>,
    /// Current value (untrusted).
    pub value_hint: Option<String>,
    /// Normalised `[x, y, w, h]` bounding box.
    pub bbox_norm: [f64; 4],
    /// Candidate selectors for binding, most stable first.
    pub selector_hints: Vec<String>,
    /// Attribute map for attribute-state verification.
    pub attributes: BTreeMap<String, String>,
}

impl RawElement {
    /// A visible, enabled element with one selector hint.
    #[must_use]
    pub fn new(
        role: impl Into<String>,
        name: impl Into<String>,
        element_type: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            name: name.into(),
            element_type: element_type.into(),
            enabled: true,
            visible: true,
            required: false,
            checked: None,
            value_hint: None,
            bbox_norm: [0.1, 0.1, 0.2, 0.05],
            selector_hints: vec![hint.into()],
            attributes: BTreeMap::new(),
        }
    }
}

/// A form as collected from a frame, pre-extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawForm {
    /// Form id or positional fallback.
    pub local_id: String,
    /// `tag:name-or-id` keys of the form's fields.
    pub field_keys: Vec<String>,
    /// Count of required fields with no value.
    pub required_missing: u32,
    /// `tag:name-or-id` key of the submit control.
    pub submit_key: Option<String>,
    /// Keys of fields flagged `aria-invalid`.
    pub validation_keys: Vec<String>,
}

/// A visible error as collected from a frame, pre-extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawError {
    /// `banner` or `form`.
    pub kind: String,
    /// Error text (untrusted).
    pub text: String,
}

/// A completed download handed back by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPayload {
    /// Filename suggested by the page.
    pub suggested_filename: String,
    /// Downloaded bytes.
    pub bytes: Vec<u8>,
}

/// A pre-armed download expectation.
///
/// Arm before the triggering click; resolve after it.
#[derive(Debug)]
pub struct DownloadWaiter {
    rx: oneshot::Receiver<DownloadPayload>,
}

impl DownloadWaiter {
    /// Wrap a oneshot receiver as a waiter.
    #[must_use]
    pub fn new(rx: oneshot::Receiver<DownloadPayload>) -> Self {
        Self { rx }
    }

    /// Resolve the expectation.
    ///
    /// # Errors
    ///
    /// [`DriverError::Timeout`] if no download arrives in time, or
    /// [`DriverError::Closed`] if the page went away.
    pub async fn wait(self, timeout: Duration) -> DriverResult<DownloadPayload> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(DriverError::Closed),
            Err(_) => Err(DriverError::Timeout("download expectation".into())),
        }
    }
}

/// Page-level automation surface.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Current page URL.
    fn current_url(&self) -> String;

    /// Document readiness phase (`loading`, `interactive`, `complete`).
    async fn ready_state(&self) -> DriverResult<String>;

    /// Navigate to a URL with readiness target DOM-ready.
    async fn goto(&self, url: &str, timeout: Duration) -> DriverResult<()>;

    /// Evaluate an expression in the page, with an optional argument.
    async fn evaluate(&self, expression: &str, arg: Option<Value>) -> DriverResult<Value>;

    /// Subscribe to page events (network, URL, console, errors).
    fn subscribe(&self) -> broadcast::Receiver<PageEvent>;

    /// Current frame tree, root first.
    fn frames(&self) -> Vec<FrameInfo>;

    /// Collect interactive elements from one frame.
    async fn collect_elements(&self, frame_index: usize) -> DriverResult<Vec<RawElement>>;

    /// Collect forms from one frame.
    async fn collect_forms(&self, frame_index: usize) -> DriverResult<Vec<RawForm>>;

    /// Collect visible errors from one frame.
    async fn collect_errors(&self, frame_index: usize) -> DriverResult<Vec<RawError>>;

    /// Click the first match of the selector.
    async fn click(&self, frame_index: usize, selector: &str, timeout: Duration)
    -> DriverResult<()>;

    /// Fill text into the first match of the selector.
    async fn fill(
        &self,
        frame_index: usize,
        selector: &str,
        text: &str,
        timeout: Duration,
    ) -> DriverResult<()>;

    /// Select an option value on the first match of the selector.
    async fn select_option(
        &self,
        frame_index: usize,
        selector: &str,
        value: &str,
        timeout: Duration,
    ) -> DriverResult<()>;

    /// Set a file on the first match of the selector.
    async fn set_input_files(
        &self,
        frame_index: usize,
        selector: &str,
        path: &str,
        timeout: Duration,
    ) -> DriverResult<()>;

    /// Wait for a selector to reach a named state.
    async fn wait_for_selector(
        &self,
        selector: &str,
        state: SelectorState,
        strict: bool,
        timeout: Duration,
    ) -> DriverResult<()>;

    /// Wait for an evaluated predicate to become truthy.
    async fn wait_for_function(
        &self,
        expression: &str,
        arg: Option<Value>,
        timeout: Duration,
    ) -> DriverResult<()>;

    /// Arm a download expectation before a triggering click.
    async fn arm_download(&self) -> DriverResult<DownloadWaiter>;

    /// Remove the nth element matching the selector. Chaos injection only.
    async fn remove_element(&self, selector: &str, index: usize) -> DriverResult<bool>;

    /// Inner text of the first match of the selector.
    async fn inner_text(&self, selector: &str) -> DriverResult<String>;

    /// Attribute value of the first match of the selector.
    async fn attribute(&self, selector: &str, name: &str) -> DriverResult<Option<String>>;

    /// Page title.
    async fn title(&self) -> DriverResult<String>;

    /// Close the page.
    async fn close(&self) -> DriverResult<()>;
}

/// Browser-context surface: an isolation unit owning pages and storage.
#[async_trait]
pub trait ContextDriver: Send + Sync {
    /// Open a new blank page in this context.
    async fn new_page(&self) -> DriverResult<Arc<dyn PageDriver>>;

    /// All open pages, oldest first.
    async fn pages(&self) -> Vec<Arc<dyn PageDriver>>;

    /// Clear granted permissions.
    async fn clear_permissions(&self) -> DriverResult<()>;

    /// Clear cookies.
    async fn clear_cookies(&self) -> DriverResult<()>;

    /// Close the context and all its pages.
    async fn close(&self) -> DriverResult<()>;
}

/// Top-level browser surface: a factory for isolated contexts.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Create a fresh isolated context.
    async fn new_context(&self) -> DriverResult<Arc<dyn ContextDriver>>;

    /// Close the browser.
    async fn close(&self) -> DriverResult<()>;
}
