// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event-driven composite waits.
//!
//! Waits are pre-armed before the effecting call so a response that lands
//! during dispatch is never missed: response/url waits take their event
//! subscription synchronously at arm time, selector/function waits check
//! current state before parking. No arbitrary sleeps anywhere; the only
//! timers are per-condition timeouts and the opt-in chaos delays.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;
use tokio::task::JoinHandle;

use predator_core::{FailureCode, WaitCondition, WaitKind};
use predator_driver::{DriverError, PageDriver, PageEvent, RawNetworkKind};

use crate::EngineFailure;

/// Composite resolution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Every wait must resolve.
    All,
    /// First resolution wins; losers are cancelled.
    Any,
}

/// One resolved wait.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    /// The condition that resolved.
    pub condition: WaitCondition,
    /// Always `true` for returned outcomes; failures surface as errors.
    pub satisfied: bool,
    /// What resolved it, e.g. `response:200:<url>`.
    pub detail: String,
}

/// Seeded fault injection for adversarial wait testing.
///
/// Disabled by default; never enable outside deterministic tests.
#[derive(Debug, Clone)]
pub struct ChaosPolicy {
    /// Master switch.
    pub enabled: bool,
    /// RNG seed; identical seeds replay identical schedules.
    pub seed: u64,
    /// `(min, max)` delay injected before dispatch.
    pub pre_action_delay_ms: (u64, u64),
    /// `(min, max)` delay injected after dispatch.
    pub post_action_delay_ms: (u64, u64),
    /// Probability of deleting a matching element before dispatch.
    pub dom_mutation_probability: f64,
    /// Selector pool the mutation draws from.
    pub dom_mutation_selector: String,
}

impl Default for ChaosPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            seed: 0,
            pre_action_delay_ms: (0, 0),
            post_action_delay_ms: (0, 0),
            dom_mutation_probability: 0.0,
            dom_mutation_selector: "button,a[href],input,select,textarea".into(),
        }
    }
}

/// Pre-arms waits, runs dispatch, and collects outcomes deterministically.
pub struct WaitManager {
    page: Arc<dyn PageDriver>,
    chaos: Option<ChaosPolicy>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for WaitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitManager")
            .field("chaos", &self.chaos)
            .finish()
    }
}

impl WaitManager {
    /// Build a manager over one page, with optional chaos.
    #[must_use]
    pub fn new(page: Arc<dyn PageDriver>, chaos: Option<ChaosPolicy>) -> Self {
        let seed = chaos.as_ref().map_or(0, |policy| policy.seed);
        Self {
            page,
            chaos,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// The page this manager drives.
    #[must_use]
    pub fn page(&self) -> Arc<dyn PageDriver> {
        Arc::clone(&self.page)
    }

    fn map_driver_error(error: DriverError, what: &str) -> EngineFailure {
        match error {
            DriverError::Timeout(detail) => {
                EngineFailure::new(FailureCode::WaitTimeout, format!("{what}: {detail}"))
            }
            other => EngineFailure::new(
                FailureCode::ActionExecutionFailed,
                format!("{what}: {other}"),
            ),
        }
    }

    fn arm_condition(
        &self,
        condition: &WaitCondition,
        default_timeout: Duration,
    ) -> JoinHandle<Result<WaitOutcome, EngineFailure>> {
        let timeout = condition
            .timeout_ms
            .map_or(default_timeout, Duration::from_millis);
        let condition = condition.clone();
        let page = Arc::clone(&self.page);

        match condition.kind.clone() {
            WaitKind::Selector {
                selector,
                state,
                strict,
            } => tokio::spawn(async move {
                page.wait_for_selector(&selector, state, strict, timeout)
                    .await
                    .map_err(|error| Self::map_driver_error(error, "selector wait"))?;
                Ok(WaitOutcome {
                    condition,
                    satisfied: true,
                    detail: "selector".into(),
                })
            }),
            WaitKind::Function { expression, arg } => tokio::spawn(async move {
                page.wait_for_function(&expression, arg, timeout)
                    .await
                    .map_err(|error| Self::map_driver_error(error, "function wait"))?;
                Ok(WaitOutcome {
                    condition,
                    satisfied: true,
                    detail: "function".into(),
                })
            }),
            WaitKind::Response {
                url_pattern,
                status_min,
                status_max,
            } => {
                // Subscribe before returning so dispatch cannot outrun us.
                let receiver = page.subscribe();
                tokio::spawn(async move {
                    let regex = Regex::new(&url_pattern).map_err(|error| {
                        EngineFailure::new(
                            FailureCode::InvalidWaitCondition,
                            format!("bad url_pattern: {error}"),
                        )
                    })?;
                    let detail = wait_for_response(
                        receiver, &regex, status_min, status_max, timeout,
                    )
                    .await?;
                    Ok(WaitOutcome {
                        condition,
                        satisfied: true,
                        detail,
                    })
                })
            }
            WaitKind::Url { url_pattern } => {
                let receiver = page.subscribe();
                let current = page.current_url();
                tokio::spawn(async move {
                    let regex = Regex::new(&url_pattern).map_err(|error| {
                        EngineFailure::new(
                            FailureCode::InvalidWaitCondition,
                            format!("bad url_pattern: {error}"),
                        )
                    })?;
                    wait_for_url(receiver, current, &regex, timeout).await?;
                    Ok(WaitOutcome {
                        condition,
                        satisfied: true,
                        detail: "url".into(),
                    })
                })
            }
        }
    }

    async fn chaos_delay(&self, range: (u64, u64)) {
        let (min, max) = range;
        if max == 0 || max < min {
            return;
        }
        let delay_ms = {
            let mut rng = self.rng.lock().expect("chaos rng poisoned");
            rng.gen_range(min..=max)
        };
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn chaos_pre_action(&self) {
        let Some(chaos) = self.chaos.clone() else {
            return;
        };
        if !chaos.enabled {
            return;
        }
        self.chaos_delay(chaos.pre_action_delay_ms).await;
        if chaos.dom_mutation_probability <= 0.0 {
            return;
        }
        let (mutate, index) = {
            let mut rng = self.rng.lock().expect("chaos rng poisoned");
            (
                rng.r#gen::<f64>() <= chaos.dom_mutation_probability,
                rng.gen_range(0..=20usize),
            )
        };
        if mutate {
            let _ = self
                .page
                .remove_element(&chaos.dom_mutation_selector, index)
                .await;
        }
    }

    async fn chaos_post_action(&self) {
        let Some(chaos) = self.chaos.clone() else {
            return;
        };
        if !chaos.enabled {
            return;
        }
        self.chaos_delay(chaos.post_action_delay_ms).await;
    }

    /// Resolve one condition on its own.
    ///
    /// # Errors
    ///
    /// Returns [`EngineFailure`] with `WAIT_TIMEOUT` on expiry or
    /// `ACTION_EXECUTION_FAILED` on driver faults.
    pub async fn wait_for_condition(
        &self,
        condition: &WaitCondition,
        default_timeout: Duration,
    ) -> Result<WaitOutcome, EngineFailure> {
        match self.arm_condition(condition, default_timeout).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineFailure::new(
                FailureCode::ActionExecutionFailed,
                "wait task aborted",
            )),
        }
    }

    /// Pre-arm every condition, run `action`, then collect wait outcomes.
    ///
    /// Losers are aborted deterministically on every exit path.
    ///
    /// # Errors
    ///
    /// The action's own failure wins over wait failures; otherwise the
    /// first wait failure in arming order is returned.
    pub async fn execute_armed<T, F, Fut>(
        &self,
        action: F,
        conditions: &[WaitCondition],
        mode: WaitMode,
        default_timeout: Duration,
    ) -> Result<(T, Vec<WaitOutcome>), EngineFailure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineFailure>>,
    {
        if conditions.is_empty() {
            self.chaos_pre_action().await;
            let result = action().await?;
            self.chaos_post_action().await;
            return Ok((result, vec![]));
        }

        let handles: Vec<JoinHandle<Result<WaitOutcome, EngineFailure>>> = conditions
            .iter()
            .map(|condition| self.arm_condition(condition, default_timeout))
            .collect();
        tokio::task::yield_now().await;

        self.chaos_pre_action().await;
        let result = match action().await {
            Ok(value) => value,
            Err(failure) => {
                for handle in &handles {
                    handle.abort();
                }
                return Err(failure);
            }
        };
        self.chaos_post_action().await;

        match mode {
            WaitMode::All => {
                let mut outcomes = Vec::with_capacity(handles.len());
                let mut iter = handles.into_iter();
                while let Some(handle) = iter.next() {
                    match handle.await {
                        Ok(Ok(outcome)) => outcomes.push(outcome),
                        Ok(Err(failure)) => {
                            for remaining in iter {
                                remaining.abort();
                            }
                            return Err(failure);
                        }
                        Err(_) => {
                            for remaining in iter {
                                remaining.abort();
                            }
                            return Err(EngineFailure::new(
                                FailureCode::ActionExecutionFailed,
                                "wait task aborted",
                            ));
                        }
                    }
                }
                Ok((result, outcomes))
            }
            WaitMode::Any => {
                let (first, _, remaining) = futures::future::select_all(handles).await;
                for handle in remaining {
                    handle.abort();
                }
                match first {
                    Ok(Ok(outcome)) => Ok((result, vec![outcome])),
                    Ok(Err(failure)) => Err(failure),
                    Err(_) => Err(EngineFailure::new(
                        FailureCode::ActionExecutionFailed,
                        "wait task aborted",
                    )),
                }
            }
        }
    }
}

async fn wait_for_response(
    mut receiver: tokio::sync::broadcast::Receiver<PageEvent>,
    regex: &Regex,
    status_min: Option<u16>,
    status_max: Option<u16>,
    timeout: Duration,
) -> Result<String, EngineFailure> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Err(_) => {
                return Err(EngineFailure::new(
                    FailureCode::WaitTimeout,
                    format!("response wait: {}", regex.as_str()),
                ));
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                return Err(EngineFailure::new(
                    FailureCode::ActionExecutionFailed,
                    "page event stream closed",
                ));
            }
            Ok(Ok(event)) => event,
        };
        if let PageEvent::Network(network) = event
            && network.kind == RawNetworkKind::Response
            && regex.is_match(&network.url)
        {
            let status = network.status.unwrap_or(0);
            if status_min.is_some_and(|min| status < min) {
                continue;
            }
            if status_max.is_some_and(|max| status > max) {
                continue;
            }
            return Ok(format!("response:{status}:{}", network.url));
        }
    }
}

async fn wait_for_url(
    mut receiver: tokio::sync::broadcast::Receiver<PageEvent>,
    current_url: String,
    regex: &Regex,
    timeout: Duration,
) -> Result<(), EngineFailure> {
    if regex.is_match(&current_url) {
        return Ok(());
    }
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match tokio::time::timeout_at(deadline, receiver.recv()).await {
            Err(_) => {
                return Err(EngineFailure::new(
                    FailureCode::WaitTimeout,
                    format!("url wait: {}", regex.as_str()),
                ));
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => {
                return Err(EngineFailure::new(
                    FailureCode::ActionExecutionFailed,
                    "page event stream closed",
                ));
            }
            Ok(Ok(PageEvent::UrlChanged { url })) if regex.is_match(&url) => return Ok(()),
            Ok(Ok(_)) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use predator_core::SelectorState;
    use predator_driver::sim::{PageScript, SimEffect, SimWorld, SimulatedBrowser};
    use predator_driver::{BrowserDriver, RawElement, RawNetworkEvent};

    async fn page_on(world: Arc<SimWorld>) -> Arc<dyn PageDriver> {
        let browser = SimulatedBrowser::new(world);
        let context = browser.new_context().await.unwrap();
        let page = context.new_page().await.unwrap();
        page.goto("http://app.test/", Duration::from_secs(1))
            .await
            .unwrap();
        page
    }

    fn clickable_world() -> Arc<SimWorld> {
        let world = SimWorld::new();
        world.route(
            "http://app.test/",
            PageScript::single_frame(
                "http://app.test/",
                vec![RawElement::new("button", "Go", "button", "#go")],
            ),
        );
        world
    }

    #[tokio::test]
    async fn response_armed_before_dispatch_catches_fast_responses() {
        let world = clickable_world();
        world.on_click(
            "#go",
            vec![SimEffect::EmitNetwork(RawNetworkEvent::json_response(
                "GET",
                "http://app.test/api/ping",
                204,
                serde_json::json!({}),
            ))],
        );
        let page = page_on(world).await;
        let manager = WaitManager::new(Arc::clone(&page), None);

        let conditions = vec![WaitCondition {
            kind: WaitKind::Response {
                url_pattern: "/api/ping".into(),
                status_min: Some(200),
                status_max: Some(299),
            },
            timeout_ms: Some(500),
        }];
        // The response fires during dispatch itself; the pre-armed
        // subscription must still observe it.
        let (_, outcomes) = manager
            .execute_armed(
                || async {
                    page.click(0, "#go", Duration::from_secs(1))
                        .await
                        .map_err(|error| {
                            EngineFailure::new(
                                FailureCode::ActionExecutionFailed,
                                error.to_string(),
                            )
                        })
                },
                &conditions,
                WaitMode::All,
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].detail.starts_with("response:204:"));
    }

    #[tokio::test]
    async fn all_mode_fails_with_wait_timeout_when_one_condition_never_fires() {
        let world = clickable_world();
        world.on_click("#go", vec![]);
        let page = page_on(world).await;
        let manager = WaitManager::new(Arc::clone(&page), None);

        let conditions = vec![WaitCondition {
            kind: WaitKind::Selector {
                selector: "#never".into(),
                state: SelectorState::Visible,
                strict: false,
            },
            timeout_ms: Some(30),
        }];
        let error = manager
            .execute_armed(
                || async { Ok::<_, EngineFailure>(()) },
                &conditions,
                WaitMode::All,
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert_eq!(error.code, FailureCode::WaitTimeout);
    }

    #[tokio::test]
    async fn any_mode_returns_the_winner_and_cancels_losers() {
        let world = clickable_world();
        world.on_click(
            "#go",
            vec![SimEffect::AddElement {
                frame: 0,
                element: RawElement::new("status", "Ready", "div", "#ready"),
            }],
        );
        let page = page_on(world).await;
        let manager = WaitManager::new(Arc::clone(&page), None);

        let conditions = vec![
            WaitCondition {
                kind: WaitKind::Selector {
                    selector: "#ready".into(),
                    state: SelectorState::Visible,
                    strict: false,
                },
                timeout_ms: Some(2_000),
            },
            WaitCondition {
                kind: WaitKind::Response {
                    url_pattern: "/never".into(),
                    status_min: None,
                    status_max: None,
                },
                timeout_ms: Some(60_000),
            },
        ];
        let (_, outcomes) = manager
            .execute_armed(
                || async {
                    page.click(0, "#go", Duration::from_secs(1))
                        .await
                        .map_err(|error| {
                            EngineFailure::new(
                                FailureCode::ActionExecutionFailed,
                                error.to_string(),
                            )
                        })
                },
                &conditions,
                WaitMode::Any,
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].detail, "selector");
    }

    #[tokio::test]
    async fn url_wait_matches_current_url_immediately() {
        let world = clickable_world();
        let page = page_on(world).await;
        let manager = WaitManager::new(page, None);
        let outcome = manager
            .wait_for_condition(
                &WaitCondition {
                    kind: WaitKind::Url {
                        url_pattern: "^http://app\\.test/$".into(),
                    },
                    timeout_ms: Some(50),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(outcome.satisfied);
    }

    #[tokio::test]
    async fn chaos_mutation_is_deterministic_per_seed() {
        for _ in 0..2 {
            let world = clickable_world();
            let page = page_on(world).await;
            let chaos = ChaosPolicy {
                enabled: true,
                seed: 7,
                dom_mutation_probability: 1.0,
                dom_mutation_selector: "#go".into(),
                ..ChaosPolicy::default()
            };
            let manager = WaitManager::new(Arc::clone(&page), Some(chaos));
            let result = manager
                .execute_armed(
                    || async {
                        page.click(0, "#go", Duration::from_secs(1))
                            .await
                            .map_err(|error| {
                                EngineFailure::new(
                                    FailureCode::ActionExecutionFailed,
                                    error.to_string(),
                                )
                            })
                    },
                    &[],
                    WaitMode::All,
                    Duration::from_secs(1),
                )
                .await;
            // The mutation removed the only #go element before dispatch,
            // so the click must fail identically on every run.
            let error = result.unwrap_err();
            assert_eq!(error.code, FailureCode::ActionExecutionFailed);
        }
    }
}
