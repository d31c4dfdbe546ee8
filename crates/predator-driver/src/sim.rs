// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic in-memory driver.
//!
//! `SimulatedBrowser` implements the driver traits against a scripted
//! [`SimWorld`]: routes map URLs to page definitions, click effects map
//! selectors to state mutations and emitted events. Everything is
//! synchronous state under mutexes plus tokio channels, so tests are fully
//! deterministic and need no real browser.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, watch};

use crate::{
    BrowserDriver, ContextDriver, DownloadPayload, DownloadWaiter, DriverError, DriverResult,
    FrameInfo, PageDriver, PageEvent, RawElement, RawError, RawForm, RawNetworkEvent,
    SelectorState,
};

const EVENT_CAPACITY: usize = 256;

/// One scripted frame of a page definition.
#[derive(Debug, Clone, Default)]
pub struct SimFrame {
    /// Frame URL.
    pub url: String,
    /// Parent frame index; `None` for the main frame.
    pub parent: Option<usize>,
    /// Interactive elements in the frame.
    pub elements: Vec<RawElement>,
    /// Forms in the frame.
    pub forms: Vec<RawForm>,
    /// Visible errors in the frame.
    pub errors: Vec<RawError>,
}

/// A scripted page served for one route.
#[derive(Debug, Clone)]
pub struct PageScript {
    /// Frames, main frame first.
    pub frames: Vec<SimFrame>,
    /// Network events emitted when the route loads.
    pub network: Vec<RawNetworkEvent>,
    /// Readiness phase reported after load.
    pub ready_state: String,
}

impl PageScript {
    /// A single-frame page at `url` with the given elements.
    #[must_use]
    pub fn single_frame(url: impl Into<String>, elements: Vec<RawElement>) -> Self {
        Self {
            frames: vec![SimFrame {
                url: url.into(),
                parent: None,
                elements,
                forms: vec![],
                errors: vec![],
            }],
            network: vec![],
            ready_state: "complete".into(),
        }
    }

    /// Attach network events emitted on load.
    #[must_use]
    pub fn with_network(mut self, events: Vec<RawNetworkEvent>) -> Self {
        self.network = events;
        self
    }

    /// Attach visible errors to the main frame.
    #[must_use]
    pub fn with_errors(mut self, errors: Vec<RawError>) -> Self {
        if let Some(main) = self.frames.first_mut() {
            main.errors = errors;
        }
        self
    }

    /// Attach forms to the main frame.
    #[must_use]
    pub fn with_forms(mut self, forms: Vec<RawForm>) -> Self {
        if let Some(main) = self.frames.first_mut() {
            main.forms = forms;
        }
        self
    }
}

/// A state mutation or emission applied when a scripted click fires.
#[derive(Debug, Clone)]
pub enum SimEffect {
    /// Emit a network event.
    EmitNetwork(RawNetworkEvent),
    /// Change the page URL without reloading frames.
    SetUrl(String),
    /// Navigate to a scripted route.
    LoadRoute(String),
    /// Add an element to a frame.
    AddElement {
        /// Frame index.
        frame: usize,
        /// The element to add.
        element: RawElement,
    },
    /// Remove every element matching the selector.
    RemoveElement(String),
    /// Add a visible error to a frame.
    AddError {
        /// Frame index.
        frame: usize,
        /// The error to add.
        error: RawError,
    },
    /// Clear all visible errors.
    ClearErrors,
    /// Deliver a download to armed waiters.
    EmitDownload {
        /// Suggested filename.
        filename: String,
        /// File content.
        bytes: Vec<u8>,
    },
    /// Emit a console message.
    EmitConsole {
        /// Console level.
        level: String,
        /// Message text.
        text: String,
    },
}

/// The scripted web all simulated contexts share.
#[derive(Debug, Default)]
pub struct SimWorld {
    routes: Mutex<BTreeMap<String, PageScript>>,
    click_effects: Mutex<BTreeMap<String, Vec<SimEffect>>>,
    eval_results: Mutex<BTreeMap<String, Value>>,
}

impl SimWorld {
    /// An empty world.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script a route.
    pub fn route(&self, url: impl Into<String>, script: PageScript) {
        self.routes
            .lock()
            .expect("route lock poisoned")
            .insert(url.into(), script);
    }

    /// Script the effects of clicking a selector.
    pub fn on_click(&self, selector: impl Into<String>, effects: Vec<SimEffect>) {
        self.click_effects
            .lock()
            .expect("effects lock poisoned")
            .insert(selector.into(), effects);
    }

    /// Script the result of evaluating an expression.
    pub fn set_eval(&self, expression: impl Into<String>, value: Value) {
        self.eval_results
            .lock()
            .expect("eval lock poisoned")
            .insert(expression.into(), value);
    }

    fn script_for(&self, url: &str) -> Option<PageScript> {
        self.routes
            .lock()
            .expect("route lock poisoned")
            .get(url)
            .cloned()
    }

    fn effects_for(&self, selector: &str) -> Vec<SimEffect> {
        self.click_effects
            .lock()
            .expect("effects lock poisoned")
            .get(selector)
            .cloned()
            .unwrap_or_default()
    }

    fn eval_for(&self, expression: &str) -> Value {
        self.eval_results
            .lock()
            .expect("eval lock poisoned")
            .get(expression)
            .cloned()
            .unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default)]
struct PageState {
    url: String,
    ready_state: String,
    frames: Vec<SimFrame>,
    filled: Vec<(String, String)>,
    selected: Vec<(String, String)>,
    uploaded: Vec<(String, String)>,
}

/// A deterministic scripted page.
#[derive(Debug)]
pub struct SimulatedPage {
    world: Arc<SimWorld>,
    state: Mutex<PageState>,
    events: broadcast::Sender<PageEvent>,
    version: watch::Sender<u64>,
    download_waiters: Mutex<Vec<oneshot::Sender<DownloadPayload>>>,
    closed: AtomicBool,
}

impl SimulatedPage {
    fn new(world: Arc<SimWorld>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (version, _) = watch::channel(0);
        Arc::new(Self {
            world,
            state: Mutex::new(PageState {
                url: "about:blank".into(),
                ready_state: "complete".into(),
                frames: vec![SimFrame {
                    url: "about:blank".into(),
                    ..SimFrame::default()
                }],
                ..PageState::default()
            }),
            events,
            version,
            download_waiters: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    fn emit(&self, event: PageEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        Ok(())
    }

    fn matching_count(state: &PageState, selector: &str) -> usize {
        state
            .frames
            .iter()
            .flat_map(|frame| frame.elements.iter())
            .filter(|element| element.selector_hints.iter().any(|hint| hint == selector))
            .count()
    }

    fn find_element(state: &PageState, selector: &str) -> Option<RawElement> {
        state
            .frames
            .iter()
            .flat_map(|frame| frame.elements.iter())
            .find(|element| element.selector_hints.iter().any(|hint| hint == selector))
            .cloned()
    }

    fn selector_matches_state(
        state: &PageState,
        selector: &str,
        target: SelectorState,
    ) -> bool {
        let found = state
            .frames
            .iter()
            .flat_map(|frame| frame.elements.iter())
            .find(|element| element.selector_hints.iter().any(|hint| hint == selector));
        match (target, found) {
            (SelectorState::Visible, Some(element)) => element.visible,
            (SelectorState::Attached, Some(_)) => true,
            (SelectorState::Hidden, Some(element)) => !element.visible,
            (SelectorState::Detached, None) => true,
            (SelectorState::Detached, Some(_)) => false,
            (_, None) => false,
        }
    }

    fn apply_load(&self, url: &str) {
        let script = self.world.script_for(url);
        let network = {
            let mut state = self.state.lock().expect("page lock poisoned");
            state.url = url.to_string();
            match script {
                Some(script) => {
                    state.ready_state = script.ready_state.clone();
                    state.frames = script.frames.clone();
                    script.network
                }
                None => {
                    state.ready_state = "complete".into();
                    state.frames = vec![SimFrame {
                        url: url.to_string(),
                        ..SimFrame::default()
                    }];
                    vec![]
                }
            }
        };
        self.emit(PageEvent::UrlChanged { url: url.into() });
        for event in network {
            self.emit(PageEvent::Network(event));
        }
        self.bump();
    }

    fn apply_effects(&self, effects: Vec<SimEffect>) {
        for effect in effects {
            match effect {
                SimEffect::EmitNetwork(event) => self.emit(PageEvent::Network(event)),
                SimEffect::SetUrl(url) => {
                    self.state.lock().expect("page lock poisoned").url = url.clone();
                    self.emit(PageEvent::UrlChanged { url });
                }
                SimEffect::LoadRoute(url) => self.apply_load(&url),
                SimEffect::AddElement { frame, element } => {
                    let mut state = self.state.lock().expect("page lock poisoned");
                    if let Some(target) = state.frames.get_mut(frame) {
                        target.elements.push(element);
                    }
                }
                SimEffect::RemoveElement(selector) => {
                    let mut state = self.state.lock().expect("page lock poisoned");
                    for frame in &mut state.frames {
                        frame
                            .elements
                            .retain(|el| !el.selector_hints.iter().any(|hint| hint == &selector));
                    }
                }
                SimEffect::AddError { frame, error } => {
                    let mut state = self.state.lock().expect("page lock poisoned");
                    if let Some(target) = state.frames.get_mut(frame) {
                        target.errors.push(error);
                    }
                }
                SimEffect::ClearErrors => {
                    let mut state = self.state.lock().expect("page lock poisoned");
                    for frame in &mut state.frames {
                        frame.errors.clear();
                    }
                }
                SimEffect::EmitDownload { filename, bytes } => {
                    let mut waiters = self
                        .download_waiters
                        .lock()
                        .expect("download lock poisoned");
                    for waiter in waiters.drain(..) {
                        let _ = waiter.send(DownloadPayload {
                            suggested_filename: filename.clone(),
                            bytes: bytes.clone(),
                        });
                    }
                }
                SimEffect::EmitConsole { level, text } => {
                    self.emit(PageEvent::Console { level, text });
                }
            }
        }
        self.bump();
    }

    /// Text filled so far, for assertions.
    #[must_use]
    pub fn filled_log(&self) -> Vec<(String, String)> {
        self.state.lock().expect("page lock poisoned").filled.clone()
    }

    /// Files uploaded so far, for assertions.
    #[must_use]
    pub fn uploaded_log(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .expect("page lock poisoned")
            .uploaded
            .clone()
    }

    /// Inject a page error event.
    pub fn emit_page_error(&self, message: impl Into<String>) {
        self.emit(PageEvent::PageError {
            message: message.into(),
        });
    }

    /// Inject a network event directly, outside any click script.
    pub fn emit_network(&self, event: RawNetworkEvent) {
        self.emit(PageEvent::Network(event));
    }
}

#[async_trait]
impl PageDriver for SimulatedPage {
    fn current_url(&self) -> String {
        self.state.lock().expect("page lock poisoned").url.clone()
    }

    async fn ready_state(&self) -> DriverResult<String> {
        self.ensure_open()?;
        Ok(self
            .state
            .lock()
            .expect("page lock poisoned")
            .ready_state
            .clone())
    }

    async fn goto(&self, url: &str, _timeout: Duration) -> DriverResult<()> {
        self.ensure_open()?;
        self.apply_load(url);
        Ok(())
    }

    async fn evaluate(&self, expression: &str, _arg: Option<Value>) -> DriverResult<Value> {
        self.ensure_open()?;
        Ok(self.world.eval_for(expression))
    }

    fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.events.subscribe()
    }

    fn frames(&self) -> Vec<FrameInfo> {
        let state = self.state.lock().expect("page lock poisoned");
        state
            .frames
            .iter()
            .enumerate()
            .map(|(index, frame)| FrameInfo {
                index,
                parent: frame.parent,
                url: frame.url.clone(),
            })
            .collect()
    }

    async fn collect_elements(&self, frame_index: usize) -> DriverResult<Vec<RawElement>> {
        self.ensure_open()?;
        let state = self.state.lock().expect("page lock poisoned");
        Ok(state
            .frames
            .get(frame_index)
            .map(|frame| frame.elements.clone())
            .unwrap_or_default())
    }

    async fn collect_forms(&self, frame_index: usize) -> DriverResult<Vec<RawForm>> {
        self.ensure_open()?;
        let state = self.state.lock().expect("page lock poisoned");
        Ok(state
            .frames
            .get(frame_index)
            .map(|frame| frame.forms.clone())
            .unwrap_or_default())
    }

    async fn collect_errors(&self, frame_index: usize) -> DriverResult<Vec<RawError>> {
        self.ensure_open()?;
        let state = self.state.lock().expect("page lock poisoned");
        Ok(state
            .frames
            .get(frame_index)
            .map(|frame| frame.errors.clone())
            .unwrap_or_default())
    }

    async fn click(
        &self,
        _frame_index: usize,
        selector: &str,
        _timeout: Duration,
    ) -> DriverResult<()> {
        self.ensure_open()?;
        {
            let state = self.state.lock().expect("page lock poisoned");
            if Self::find_element(&state, selector).is_none() {
                return Err(DriverError::TargetNotFound(selector.into()));
            }
        }
        let effects = self.world.effects_for(selector);
        self.apply_effects(effects);
        Ok(())
    }

    async fn fill(
        &self,
        _frame_index: usize,
        selector: &str,
        text: &str,
        _timeout: Duration,
    ) -> DriverResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().expect("page lock poisoned");
        let mut found = false;
        for frame in &mut state.frames {
            for element in &mut frame.elements {
                if element.selector_hints.iter().any(|hint| hint == selector) {
                    element.value_hint = Some(text.to_string());
                    found = true;
                }
            }
        }
        if !found {
            return Err(DriverError::TargetNotFound(selector.into()));
        }
        state.filled.push((selector.to_string(), text.to_string()));
        drop(state);
        self.bump();
        Ok(())
    }

    async fn select_option(
        &self,
        _frame_index: usize,
        selector: &str,
        value: &str,
        _timeout: Duration,
    ) -> DriverResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().expect("page lock poisoned");
        if Self::find_element(&state, selector).is_none() {
            return Err(DriverError::TargetNotFound(selector.into()));
        }
        state
            .selected
            .push((selector.to_string(), value.to_string()));
        drop(state);
        self.bump();
        Ok(())
    }

    async fn set_input_files(
        &self,
        _frame_index: usize,
        selector: &str,
        path: &str,
        _timeout: Duration,
    ) -> DriverResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock().expect("page lock poisoned");
        if Self::find_element(&state, selector).is_none() {
            return Err(DriverError::TargetNotFound(selector.into()));
        }
        state.uploaded.push((selector.to_string(), path.to_string()));
        drop(state);
        self.bump();
        Ok(())
    }

    async fn wait_for_selector(
        &self,
        selector: &str,
        state: SelectorState,
        strict: bool,
        timeout: Duration,
    ) -> DriverResult<()> {
        self.ensure_open()?;
        let mut version = self.version.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let page = self.state.lock().expect("page lock poisoned");
                if Self::selector_matches_state(&page, selector, state) {
                    if strict {
                        let count = Self::matching_count(&page, selector);
                        if count != 1 {
                            return Err(DriverError::StrictViolation {
                                selector: selector.into(),
                                count,
                            });
                        }
                    }
                    return Ok(());
                }
            }
            tokio::select! {
                changed = version.changed() => {
                    if changed.is_err() {
                        return Err(DriverError::Closed);
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(DriverError::Timeout(format!("selector {selector}")));
                }
            }
        }
    }

    async fn wait_for_function(
        &self,
        expression: &str,
        _arg: Option<Value>,
        timeout: Duration,
    ) -> DriverResult<()> {
        self.ensure_open()?;
        let mut version = self.version.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let value = self.world.eval_for(expression);
            let truthy = match value {
                Value::Null => false,
                Value::Bool(b) => b,
                Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                Value::String(s) => !s.is_empty(),
                Value::Array(_) | Value::Object(_) => true,
            };
            if truthy {
                return Ok(());
            }
            tokio::select! {
                changed = version.changed() => {
                    if changed.is_err() {
                        return Err(DriverError::Closed);
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(DriverError::Timeout(format!("function {expression}")));
                }
            }
        }
    }

    async fn arm_download(&self) -> DriverResult<DownloadWaiter> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.download_waiters
            .lock()
            .expect("download lock poisoned")
            .push(tx);
        Ok(DownloadWaiter::new(rx))
    }

    async fn remove_element(&self, selector: &str, index: usize) -> DriverResult<bool> {
        self.ensure_open()?;
        let removed = {
            let mut state = self.state.lock().expect("page lock poisoned");
            let total = Self::matching_count(&state, selector);
            if total == 0 {
                false
            } else {
                // Out-of-range indices clamp to the last match.
                let target = index.min(total - 1);
                let mut seen = 0usize;
                let mut removed = false;
                for frame in &mut state.frames {
                    let mut keep = Vec::with_capacity(frame.elements.len());
                    for element in frame.elements.drain(..) {
                        let matches =
                            element.selector_hints.iter().any(|hint| hint == selector);
                        if matches && seen == target && !removed {
                            removed = true;
                            seen += 1;
                        } else {
                            if matches {
                                seen += 1;
                            }
                            keep.push(element);
                        }
                    }
                    frame.elements = keep;
                }
                removed
            }
        };
        if removed {
            self.bump();
        }
        Ok(removed)
    }

    async fn inner_text(&self, selector: &str) -> DriverResult<String> {
        self.ensure_open()?;
        let state = self.state.lock().expect("page lock poisoned");
        Self::find_element(&state, selector)
            .map(|element| element.name)
            .ok_or_else(|| DriverError::TargetNotFound(selector.into()))
    }

    async fn attribute(&self, selector: &str, name: &str) -> DriverResult<Option<String>> {
        self.ensure_open()?;
        let state = self.state.lock().expect("page lock poisoned");
        let element = Self::find_element(&state, selector)
            .ok_or_else(|| DriverError::TargetNotFound(selector.into()))?;
        Ok(element.attributes.get(name).cloned())
    }

    async fn title(&self) -> DriverResult<String> {
        self.ensure_open()?;
        Ok(String::new())
    }

    async fn close(&self) -> DriverResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A deterministic scripted browser context.
#[derive(Debug)]
pub struct SimulatedContext {
    world: Arc<SimWorld>,
    pages: Mutex<Vec<Arc<SimulatedPage>>>,
    closed: AtomicBool,
}

impl SimulatedContext {
    fn new(world: Arc<SimWorld>) -> Arc<Self> {
        Arc::new(Self {
            world,
            pages: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl ContextDriver for SimulatedContext {
    async fn new_page(&self) -> DriverResult<Arc<dyn PageDriver>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }
        let page = SimulatedPage::new(Arc::clone(&self.world));
        self.pages
            .lock()
            .expect("pages lock poisoned")
            .push(Arc::clone(&page));
        Ok(page)
    }

    async fn pages(&self) -> Vec<Arc<dyn PageDriver>> {
        self.pages
            .lock()
            .expect("pages lock poisoned")
            .iter()
            .map(|page| Arc::clone(page) as Arc<dyn PageDriver>)
            .collect()
    }

    async fn clear_permissions(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn clear_cookies(&self) -> DriverResult<()> {
        Ok(())
    }

    async fn close(&self) -> DriverResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        for page in self.pages.lock().expect("pages lock poisoned").drain(..) {
            page.closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// A deterministic scripted browser.
#[derive(Debug)]
pub struct SimulatedBrowser {
    world: Arc<SimWorld>,
}

impl SimulatedBrowser {
    /// A browser over the given scripted world.
    #[must_use]
    pub fn new(world: Arc<SimWorld>) -> Arc<Self> {
        Arc::new(Self { world })
    }

    /// The scripted world backing this browser.
    #[must_use]
    pub fn world(&self) -> Arc<SimWorld> {
        Arc::clone(&self.world)
    }
}

#[async_trait]
impl BrowserDriver for SimulatedBrowser {
    async fn new_context(&self) -> DriverResult<Arc<dyn ContextDriver>> {
        Ok(SimulatedContext::new(Arc::clone(&self.world)))
    }

    async fn close(&self) -> DriverResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world_with_button() -> Arc<SimWorld> {
        let world = SimWorld::new();
        world.route(
            "http://app.test/",
            PageScript::single_frame(
                "http://app.test/",
                vec![RawElement::new("button", "Go", "button", "#go")],
            )
            .with_network(vec![
                RawNetworkEvent::request("GET", "http://app.test/"),
                RawNetworkEvent::response("GET", "http://app.test/", 200),
            ]),
        );
        world
    }

    #[tokio::test]
    async fn goto_loads_scripted_frames_and_emits_network() {
        let world = world_with_button();
        let browser = SimulatedBrowser::new(world);
        let context = browser.new_context().await.unwrap();
        let page = context.new_page().await.unwrap();

        let mut events = page.subscribe();
        page.goto("http://app.test/", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(page.current_url(), "http://app.test/");
        let elements = page.collect_elements(0).await.unwrap();
        assert_eq!(elements.len(), 1);

        let first = events.recv().await.unwrap();
        assert!(matches!(first, PageEvent::UrlChanged { .. }));
        let second = events.recv().await.unwrap();
        assert!(matches!(second, PageEvent::Network(_)));
    }

    #[tokio::test]
    async fn click_applies_scripted_effects() {
        let world = world_with_button();
        world.on_click(
            "#go",
            vec![
                SimEffect::EmitNetwork(RawNetworkEvent::json_response(
                    "GET",
                    "http://app.test/api/ping",
                    200,
                    serde_json::json!({"success": true}),
                )),
                SimEffect::AddElement {
                    frame: 0,
                    element: RawElement::new("status", "Done", "div", "#done"),
                },
            ],
        );
        let browser = SimulatedBrowser::new(world);
        let context = browser.new_context().await.unwrap();
        let page = context.new_page().await.unwrap();
        page.goto("http://app.test/", Duration::from_secs(1))
            .await
            .unwrap();

        page.click(0, "#go", Duration::from_secs(1)).await.unwrap();
        let elements = page.collect_elements(0).await.unwrap();
        assert_eq!(elements.len(), 2);
    }

    #[tokio::test]
    async fn wait_for_selector_resolves_on_later_mutation() {
        let world = world_with_button();
        world.on_click(
            "#go",
            vec![SimEffect::AddElement {
                frame: 0,
                element: RawElement::new("status", "Ready", "div", "#ready"),
            }],
        );
        let browser = SimulatedBrowser::new(world);
        let context = browser.new_context().await.unwrap();
        let page = context.new_page().await.unwrap();
        page.goto("http://app.test/", Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = {
            let page = Arc::clone(&page);
            tokio::spawn(async move {
                page.wait_for_selector(
                    "#ready",
                    SelectorState::Visible,
                    false,
                    Duration::from_secs(2),
                )
                .await
            })
        };
        page.click(0, "#go", Duration::from_secs(1)).await.unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn wait_for_selector_times_out() {
        let world = world_with_button();
        let browser = SimulatedBrowser::new(world);
        let context = browser.new_context().await.unwrap();
        let page = context.new_page().await.unwrap();
        let err = page
            .wait_for_selector(
                "#missing",
                SelectorState::Visible,
                false,
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout(_)));
    }

    #[tokio::test]
    async fn armed_download_receives_click_payload() {
        let world = world_with_button();
        world.on_click(
            "#go",
            vec![SimEffect::EmitDownload {
                filename: "report.csv".into(),
                bytes: b"a,b\n1,2\n".to_vec(),
            }],
        );
        let browser = SimulatedBrowser::new(world);
        let context = browser.new_context().await.unwrap();
        let page = context.new_page().await.unwrap();
        page.goto("http://app.test/", Duration::from_secs(1))
            .await
            .unwrap();

        let waiter = page.arm_download().await.unwrap();
        page.click(0, "#go", Duration::from_secs(1)).await.unwrap();
        let payload = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(payload.suggested_filename, "report.csv");
    }
}
