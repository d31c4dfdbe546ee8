// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structural contract validation.
//!
//! Validation is pure and runs before any quota, session, or security gate.
//! A denial here is terminal for the action and is audited like any other
//! outcome.

use serde_json::Value;
use url::Url;

use crate::{ActionContract, ActionType, FailureCode, GateDecision, WaitKind};

/// Selectors that match the whole document and are never acceptable.
const BROAD_SELECTORS: &[&str] = &[
    "*", "body *", "html *", "body>*", "html>*", "body > *", "html > *",
];

/// Structural validator over [`ActionContract`]s.
#[derive(Debug, Clone)]
pub struct ContractValidator {
    max_selector_length: usize,
    max_selector_candidates: usize,
    max_text_length: usize,
    max_js_expression_length: usize,
}

impl Default for ContractValidator {
    fn default() -> Self {
        Self {
            max_selector_length: 256,
            max_selector_candidates: 8,
            max_text_length: 4_096,
            max_js_expression_length: 512,
        }
    }
}

impl ContractValidator {
    /// Build a validator with explicit bounds.
    #[must_use]
    pub fn new(
        max_selector_length: usize,
        max_selector_candidates: usize,
        max_text_length: usize,
        max_js_expression_length: usize,
    ) -> Self {
        Self {
            max_selector_length,
            max_selector_candidates,
            max_text_length,
            max_js_expression_length,
        }
    }

    fn check_selector(&self, selector: &str) -> Option<GateDecision> {
        let normalized = selector
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if normalized.is_empty() {
            return Some(GateDecision::denied(
                FailureCode::InvalidActionSpec,
                "empty selector",
            ));
        }
        if selector.len() > self.max_selector_length {
            return Some(GateDecision::denied(
                FailureCode::InvalidActionSpec,
                "selector exceeds max length",
            ));
        }
        if BROAD_SELECTORS.contains(&normalized.as_str()) {
            return Some(GateDecision::denied(
                FailureCode::InvalidActionSpec,
                "selector too broad",
            ));
        }
        None
    }

    fn check_url(url: &str) -> Option<GateDecision> {
        let Ok(parsed) = Url::parse(url) else {
            return Some(GateDecision::denied(
                FailureCode::InvalidActionSpec,
                "url must use http/https",
            ));
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return Some(GateDecision::denied(
                FailureCode::InvalidActionSpec,
                "url must use http/https",
            ));
        }
        if parsed.host_str().is_none_or(str::is_empty) {
            return Some(GateDecision::denied(
                FailureCode::InvalidActionSpec,
                "url missing host",
            ));
        }
        None
    }

    /// Validate one contract. Returns the first violation found.
    #[must_use]
    pub fn validate(&self, contract: &ActionContract) -> GateDecision {
        if let Some(flag) = contract.metadata.get("high_risk_approved")
            && !matches!(flag, Value::Bool(_))
        {
            return GateDecision::denied(
                FailureCode::InvalidContract,
                "high_risk_approved must be boolean",
            );
        }

        let action = &contract.action_spec;

        if let Some(selector) = &action.selector
            && let Some(denied) = self.check_selector(selector)
        {
            return denied;
        }

        if action.selector_candidates.len() > self.max_selector_candidates {
            return GateDecision::denied(
                FailureCode::InvalidActionSpec,
                "too many selector_candidates",
            );
        }
        for candidate in &action.selector_candidates {
            if let Some(denied) = self.check_selector(candidate) {
                return denied;
            }
        }

        if let Some(text) = &action.text
            && text.len() > self.max_text_length
        {
            return GateDecision::denied(FailureCode::InvalidActionSpec, "text exceeds max length");
        }

        if let Some(url) = &action.url
            && let Some(denied) = Self::check_url(url)
        {
            return denied;
        }

        if action.action_type == ActionType::Navigate && action.url.is_none() {
            return GateDecision::denied(
                FailureCode::InvalidActionSpec,
                "navigate action requires url",
            );
        }

        if action.action_type == ActionType::Upload && action.upload_artifact_id.is_none() {
            return GateDecision::denied(
                FailureCode::InvalidActionSpec,
                "upload action requires upload_artifact_id",
            );
        }

        if let Some(expression) = &action.js_expression
            && expression.len() > self.max_js_expression_length
        {
            return GateDecision::denied(
                FailureCode::InvalidActionSpec,
                "js_expression exceeds max length",
            );
        }

        for wait in &contract.wait_conditions {
            match &wait.kind {
                WaitKind::Selector { selector, .. } => {
                    if selector.trim().is_empty() {
                        return GateDecision::denied(
                            FailureCode::InvalidWaitCondition,
                            "selector wait requires a selector",
                        );
                    }
                }
                WaitKind::Response { url_pattern, .. } | WaitKind::Url { url_pattern } => {
                    if regex::Regex::new(url_pattern).is_err() {
                        return GateDecision::denied(
                            FailureCode::InvalidWaitCondition,
                            format!("invalid url_pattern regex: {url_pattern}"),
                        );
                    }
                }
                WaitKind::Function { expression, .. } => {
                    if expression.trim().is_empty() {
                        return GateDecision::denied(
                            FailureCode::InvalidWaitCondition,
                            "function wait requires an expression",
                        );
                    }
                }
            }
        }

        GateDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ActionContractBuilder, ActionSpec, SelectorState, WaitCondition};

    fn contract_with_spec(spec: ActionSpec) -> ActionContract {
        ActionContractBuilder::new("wf", "test")
            .action_spec(spec)
            .build()
    }

    #[test]
    fn broad_selectors_are_rejected() {
        let validator = ContractValidator::default();
        for selector in ["*", "body > *", "HTML *"] {
            let contract = contract_with_spec(ActionSpec {
                action_type: ActionType::Click,
                selector: Some(selector.into()),
                ..ActionSpec::wait_only()
            });
            let decision = validator.validate(&contract);
            assert!(
                matches!(
                    decision,
                    GateDecision::Denied {
                        code: FailureCode::InvalidActionSpec,
                        ..
                    }
                ),
                "selector {selector:?} must be rejected"
            );
        }
    }

    #[test]
    fn navigate_requires_http_url_with_host() {
        let validator = ContractValidator::default();

        let missing = contract_with_spec(ActionSpec {
            action_type: ActionType::Navigate,
            ..ActionSpec::wait_only()
        });
        assert!(!validator.validate(&missing).is_allowed());

        let bad_scheme = contract_with_spec(ActionSpec {
            action_type: ActionType::Navigate,
            url: Some("file:///etc/passwd".into()),
            ..ActionSpec::wait_only()
        });
        assert!(!validator.validate(&bad_scheme).is_allowed());

        let ok = contract_with_spec(ActionSpec {
            action_type: ActionType::Navigate,
            url: Some("https://example.test/path".into()),
            ..ActionSpec::wait_only()
        });
        assert!(validator.validate(&ok).is_allowed());
    }

    #[test]
    fn upload_requires_registered_artifact_id() {
        let validator = ContractValidator::default();
        let contract = contract_with_spec(ActionSpec {
            action_type: ActionType::Upload,
            selector: Some("#file".into()),
            ..ActionSpec::wait_only()
        });
        assert!(!validator.validate(&contract).is_allowed());
    }

    #[test]
    fn js_expression_length_is_bounded() {
        let validator = ContractValidator::default();
        let contract = contract_with_spec(ActionSpec {
            action_type: ActionType::CustomJsRestricted,
            js_expression: Some("x".repeat(513)),
            ..ActionSpec::wait_only()
        });
        assert!(!validator.validate(&contract).is_allowed());
    }

    #[test]
    fn invalid_wait_regex_is_rejected() {
        let validator = ContractValidator::default();
        let contract = ActionContractBuilder::new("wf", "test")
            .action_spec(ActionSpec {
                action_type: ActionType::Navigate,
                url: Some("http://example.test/".into()),
                ..ActionSpec::wait_only()
            })
            .wait(WaitCondition {
                kind: WaitKind::Url {
                    url_pattern: "(".into(),
                },
                timeout_ms: None,
            })
            .build();
        assert!(matches!(
            validator.validate(&contract),
            GateDecision::Denied {
                code: FailureCode::InvalidWaitCondition,
                ..
            }
        ));
    }

    #[test]
    fn high_risk_approved_must_be_boolean() {
        let validator = ContractValidator::default();
        let contract = ActionContractBuilder::new("wf", "test")
            .metadata("high_risk_approved", serde_json::json!("yes"))
            .wait(WaitCondition {
                kind: WaitKind::Selector {
                    selector: "#x".into(),
                    state: SelectorState::Visible,
                    strict: false,
                },
                timeout_ms: None,
            })
            .build();
        assert!(matches!(
            validator.validate(&contract),
            GateDecision::Denied {
                code: FailureCode::InvalidContract,
                ..
            }
        ));
    }
}
