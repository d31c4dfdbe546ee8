// SPDX-License-Identifier: MIT OR Apache-2.0

//! Verification: pure predicate evaluation over page, network, and state.
//!
//! A report fails only when at least one hard rule fails; soft failures
//! are recorded but do not flip the outcome.

use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use predator_core::{RuleCheck, Severity, StructuredState, TextMatchMode, VerificationRule};
use predator_driver::{DriverError, PageDriver};
use predator_session::NetworkObserver;
use predator_session::observer::NetworkEventKind;

use crate::EngineFailure;
use predator_core::FailureCode;

/// One failed rule with a structured cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationFailure {
    /// Wire name of the rule type.
    pub rule_type: String,
    /// The rule's severity.
    pub severity: Severity,
    /// Stable cause code, e.g. `TEXT_STATE_MISMATCH`.
    pub code: String,
    /// Human-readable detail.
    pub detail: String,
}

/// Outcome of evaluating a rule set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    /// `true` when no hard rule failed.
    pub passed: bool,
    /// Every failure, hard and soft, in rule order.
    pub failures: Vec<VerificationFailure>,
}

fn rule_type_name(check: &RuleCheck) -> &'static str {
    match check {
        RuleCheck::ElementPresent { .. } => "element_present",
        RuleCheck::TextState { .. } => "text_state",
        RuleCheck::AttributeState { .. } => "attribute_state",
        RuleCheck::NetworkStatus { .. } => "network_status",
        RuleCheck::JsonField { .. } => "json_field",
        RuleCheck::FileExists { .. } => "file_exists",
        RuleCheck::UrlPattern { .. } => "url_pattern",
        RuleCheck::Invariant { .. } => "invariant",
    }
}

/// Evaluates verification rules against `(page, network, state)`.
pub struct VerificationEngine {
    page: Arc<dyn PageDriver>,
    network: Arc<NetworkObserver>,
}

impl std::fmt::Debug for VerificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationEngine").finish()
    }
}

impl VerificationEngine {
    /// Bind the engine to one page and its observer.
    #[must_use]
    pub fn new(page: Arc<dyn PageDriver>, network: Arc<NetworkObserver>) -> Self {
        Self { page, network }
    }

    fn failure(
        rule: &VerificationRule,
        code: &str,
        detail: impl Into<String>,
    ) -> VerificationFailure {
        VerificationFailure {
            rule_type: rule_type_name(&rule.check).to_string(),
            severity: rule.severity,
            code: code.to_string(),
            detail: detail.into(),
        }
    }

    async fn check_rule(
        &self,
        rule: &VerificationRule,
        state: &StructuredState,
    ) -> Result<Option<VerificationFailure>, EngineFailure> {
        match &rule.check {
            RuleCheck::ElementPresent { eid } => {
                let present = state
                    .interactive_elements
                    .iter()
                    .any(|element| &element.eid == eid);
                Ok((!present).then(|| {
                    Self::failure(rule, "ELEMENT_NOT_PRESENT", format!("Element '{eid}' not found"))
                }))
            }
            RuleCheck::TextState {
                selector,
                expected,
                mode,
            } => {
                let actual = self
                    .page
                    .inner_text(selector)
                    .await
                    .map_err(Self::driver_fault)?;
                let actual = actual.trim().to_string();
                let matched = match mode {
                    TextMatchMode::Contains => actual.contains(expected.as_str()),
                    TextMatchMode::Exact => actual == *expected,
                };
                Ok((!matched).then(|| {
                    Self::failure(
                        rule,
                        "TEXT_STATE_MISMATCH",
                        format!("selector={selector}, expected={expected}, actual={actual}"),
                    )
                }))
            }
            RuleCheck::AttributeState {
                selector,
                attribute,
                expected,
            } => {
                let actual = self
                    .page
                    .attribute(selector, attribute)
                    .await
                    .map_err(Self::driver_fault)?;
                if actual == *expected {
                    Ok(None)
                } else {
                    Ok(Some(Self::failure(
                        rule,
                        "ATTRIBUTE_STATE_MISMATCH",
                        format!(
                            "selector={selector}, attr={attribute}, expected={expected:?}, actual={actual:?}"
                        ),
                    )))
                }
            }
            RuleCheck::NetworkStatus {
                url_pattern,
                status_min,
                status_max,
                since_seq,
            } => {
                let regex = match url_pattern {
                    Some(pattern) => Some(Regex::new(pattern).map_err(|error| {
                        EngineFailure::new(
                            FailureCode::ActionExecutionFailed,
                            format!("bad network_status pattern: {error}"),
                        )
                    })?),
                    None => None,
                };
                let matched = self
                    .network
                    .events_since(*since_seq)
                    .into_iter()
                    .filter(|event| event.kind == NetworkEventKind::Response)
                    .filter(|event| {
                        regex
                            .as_ref()
                            .is_none_or(|regex| regex.is_match(&event.url))
                    })
                    .any(|event| {
                        event
                            .status
                            .is_some_and(|status| status >= *status_min && status <= *status_max)
                    });
                Ok((!matched).then(|| {
                    Self::failure(
                        rule,
                        "NETWORK_STATUS_MISMATCH",
                        format!("No response with status between {status_min} and {status_max}"),
                    )
                }))
            }
            RuleCheck::JsonField {
                route_key,
                require_no_silent_failure,
                since_seq,
            } => {
                if !require_no_silent_failure {
                    return Ok(None);
                }
                let silent = self
                    .network
                    .events_since(*since_seq)
                    .into_iter()
                    .any(|event| {
                        event.kind == NetworkEventKind::Response
                            && &event.route_key == route_key
                            && event.silent_failure
                    });
                Ok(silent.then(|| {
                    Self::failure(
                        rule,
                        "JSON_FIELD_FAILURE_SIGNAL",
                        format!("Silent failure signal detected for route_key={route_key}"),
                    )
                }))
            }
            RuleCheck::FileExists { path, min_size } => {
                let path = Path::new(path);
                let Ok(metadata) = std::fs::metadata(path) else {
                    return Ok(Some(Self::failure(
                        rule,
                        "FILE_NOT_FOUND",
                        path.display().to_string(),
                    )));
                };
                if metadata.len() < *min_size {
                    return Ok(Some(Self::failure(
                        rule,
                        "FILE_TOO_SMALL",
                        format!("size={}, min_size={min_size}", metadata.len()),
                    )));
                }
                Ok(None)
            }
            RuleCheck::UrlPattern { pattern } => {
                let regex = Regex::new(pattern).map_err(|error| {
                    EngineFailure::new(
                        FailureCode::ActionExecutionFailed,
                        format!("bad url pattern: {error}"),
                    )
                })?;
                let url = self.page.current_url();
                Ok((!regex.is_match(&url)).then(|| {
                    Self::failure(
                        rule,
                        "URL_PATTERN_MISMATCH",
                        format!("pattern={pattern}, url={url}"),
                    )
                }))
            }
            RuleCheck::Invariant { name } => {
                if name == "no_visible_errors" && !state.visible_errors.is_empty() {
                    return Ok(Some(Self::failure(
                        rule,
                        "INVARIANT_VIOLATION",
                        "visible_errors_present",
                    )));
                }
                Ok(None)
            }
        }
    }

    fn driver_fault(error: DriverError) -> EngineFailure {
        EngineFailure::new(FailureCode::ActionExecutionFailed, error.to_string())
    }

    /// Evaluate a rule set against the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EngineFailure`] when the driver faults mid-check; rule
    /// failures are reported in the report, not as errors.
    pub async fn verify(
        &self,
        rules: &[VerificationRule],
        state: &StructuredState,
    ) -> Result<VerificationReport, EngineFailure> {
        let mut failures = Vec::new();
        for rule in rules {
            if let Some(failure) = self.check_rule(rule, state).await? {
                failures.push(failure);
            }
        }
        let passed = !failures
            .iter()
            .any(|failure| failure.severity == Severity::Hard);
        Ok(VerificationReport { passed, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use predator_core::VerificationRule;
    use predator_driver::sim::{PageScript, SimWorld, SimulatedBrowser};
    use predator_driver::{BrowserDriver, RawElement, RawNetworkEvent};
    use std::time::Duration;

    async fn setup() -> (Arc<dyn PageDriver>, Arc<NetworkObserver>, StructuredState) {
        let world = SimWorld::new();
        let mut button = RawElement::new("button", "Pay now", "button", "#pay");
        button
            .attributes
            .insert("aria-disabled".into(), "false".into());
        world.route(
            "http://shop.test/checkout",
            PageScript::single_frame("http://shop.test/checkout", vec![button]).with_network(
                vec![
                    RawNetworkEvent::request("GET", "http://shop.test/api/cart"),
                    RawNetworkEvent::json_response(
                        "GET",
                        "http://shop.test/api/cart",
                        200,
                        serde_json::json!({"success": true}),
                    ),
                ],
            ),
        );
        let browser = SimulatedBrowser::new(world);
        let context = browser.new_context().await.unwrap();
        let page = context.new_page().await.unwrap();
        let observer = Arc::new(NetworkObserver::default());
        observer.attach(&page).await;
        page.goto("http://shop.test/checkout", Duration::from_secs(1))
            .await
            .unwrap();

        let extractor = crate::extract::StructuredStateExtractor::new(
            Arc::clone(&page),
            Arc::clone(&observer),
            crate::extract::ExtractorBounds::default(),
        );
        let state = extractor.extract(None, &[]).await.unwrap();
        (page, observer, state)
    }

    #[tokio::test]
    async fn network_status_matches_within_range() {
        let (page, observer, state) = setup().await;
        let engine = VerificationEngine::new(page, observer);

        let ok = VerificationRule::hard(RuleCheck::NetworkStatus {
            url_pattern: Some("/api/cart".into()),
            status_min: 200,
            status_max: 299,
            since_seq: 0,
        });
        let report = engine.verify(&[ok], &state).await.unwrap();
        assert!(report.passed);

        let missing = VerificationRule::hard(RuleCheck::NetworkStatus {
            url_pattern: Some("/api/other".into()),
            status_min: 200,
            status_max: 299,
            since_seq: 0,
        });
        let report = engine.verify(&[missing], &state).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.failures[0].code, "NETWORK_STATUS_MISMATCH");
    }

    #[tokio::test]
    async fn soft_failures_do_not_fail_the_report() {
        let (page, observer, state) = setup().await;
        let engine = VerificationEngine::new(page, observer);
        let soft = VerificationRule::soft(RuleCheck::ElementPresent {
            eid: "e_missing".into(),
        });
        let report = engine.verify(&[soft], &state).await.unwrap();
        assert!(report.passed);
        assert_eq!(report.failures.len(), 1);
    }

    #[tokio::test]
    async fn text_and_attribute_rules_query_the_page() {
        let (page, observer, state) = setup().await;
        let engine = VerificationEngine::new(page, observer);

        let text_ok = VerificationRule::hard(RuleCheck::TextState {
            selector: "#pay".into(),
            expected: "Pay".into(),
            mode: TextMatchMode::Contains,
        });
        let attr_ok = VerificationRule::hard(RuleCheck::AttributeState {
            selector: "#pay".into(),
            attribute: "aria-disabled".into(),
            expected: Some("false".into()),
        });
        let report = engine.verify(&[text_ok, attr_ok], &state).await.unwrap();
        assert!(report.passed, "failures: {:?}", report.failures);
    }

    #[tokio::test]
    async fn file_exists_checks_size_floor() {
        let (page, observer, state) = setup().await;
        let engine = VerificationEngine::new(page, observer);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");
        std::fs::write(&path, b"abc").unwrap();

        let ok = VerificationRule::hard(RuleCheck::FileExists {
            path: path.display().to_string(),
            min_size: 3,
        });
        let too_small = VerificationRule::hard(RuleCheck::FileExists {
            path: path.display().to_string(),
            min_size: 4,
        });
        let report = engine.verify(&[ok], &state).await.unwrap();
        assert!(report.passed);
        let report = engine.verify(&[too_small], &state).await.unwrap();
        assert_eq!(report.failures[0].code, "FILE_TOO_SMALL");
    }

    #[tokio::test]
    async fn no_visible_errors_invariant() {
        let (page, observer, mut state) = setup().await;
        let engine = VerificationEngine::new(page, observer);
        let rule = VerificationRule::hard(RuleCheck::Invariant {
            name: "no_visible_errors".into(),
        });
        let report = engine.verify(std::slice::from_ref(&rule), &state).await.unwrap();
        assert!(report.passed);

        state.visible_errors.push(predator_core::VisibleErrorState {
            error_id: "err_x".into(),
            fid: "f_x".into(),
            kind: "banner".into(),
            text_short: "Payment failed".into(),
            eid: None,
        });
        let report = engine.verify(&[rule], &state).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.failures[0].code, "INVARIANT_VIOLATION");
    }
}
