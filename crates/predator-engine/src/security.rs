// SPDX-License-Identifier: MIT OR Apache-2.0

//! Domain and action gating against a session's security policy.

use std::collections::BTreeMap;

use serde_json::Value;
use url::Url;

use predator_core::{ActionType, FailureCode, GateDecision, SecurityPolicy};

/// Evaluates navigation targets and action types against one policy.
#[derive(Debug, Clone)]
pub struct SecurityLayer {
    policy: SecurityPolicy,
}

impl SecurityLayer {
    /// Bind a policy.
    #[must_use]
    pub fn new(policy: SecurityPolicy) -> Self {
        Self { policy }
    }

    fn host_matches(host: &str, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    }

    fn domain_allowed(&self, raw_url: &str) -> bool {
        let host = Url::parse(raw_url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
            .unwrap_or_default();

        for denied in &self.policy.deny_domains {
            if Self::host_matches(&host, denied) {
                return false;
            }
        }
        if self.policy.allow_domains.is_empty() {
            return false;
        }
        self.policy
            .allow_domains
            .iter()
            .any(|allowed| Self::host_matches(&host, allowed))
    }

    /// Gate a navigation target.
    #[must_use]
    pub fn evaluate_navigation(&self, url: &str) -> GateDecision {
        if !self.domain_allowed(url) {
            return GateDecision::denied(
                FailureCode::SecurityDomainBlock,
                format!("navigation blocked for url={url}"),
            );
        }
        GateDecision::Allowed
    }

    /// Gate an action type against the current URL and request metadata.
    ///
    /// Navigation targets are validated separately, so a `navigate` action
    /// is not blocked by the URL it is leaving.
    #[must_use]
    pub fn evaluate_action(
        &self,
        action_type: ActionType,
        current_url: &str,
        metadata: &BTreeMap<String, Value>,
    ) -> GateDecision {
        if action_type != ActionType::Navigate && !self.domain_allowed(current_url) {
            return GateDecision::denied(
                FailureCode::SecurityDomainBlock,
                format!("action blocked outside policy domain: {current_url}"),
            );
        }

        if self.policy.high_risk_actions.contains(&action_type) {
            let approved = metadata.get("high_risk_approved") == Some(&Value::Bool(true));
            if !approved {
                return GateDecision::denied(
                    FailureCode::SecurityApprovalRequired,
                    format!("action requires explicit approval: {action_type:?}"),
                );
            }
        }

        if action_type == ActionType::CustomJsRestricted && !self.policy.allow_custom_js {
            return GateDecision::denied(
                FailureCode::SecurityJsBlocked,
                "custom js execution is disabled by policy",
            );
        }

        GateDecision::Allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> SecurityLayer {
        SecurityLayer::new(SecurityPolicy {
            allow_domains: vec!["app.test".into()],
            deny_domains: vec!["blocked.app.test".into()],
            ..SecurityPolicy::default()
        })
    }

    #[test]
    fn subdomains_of_allowed_domains_pass() {
        let layer = layer();
        assert!(layer.evaluate_navigation("http://app.test/x").is_allowed());
        assert!(layer.evaluate_navigation("http://www.app.test/").is_allowed());
        assert!(!layer.evaluate_navigation("http://evil.test/").is_allowed());
    }

    #[test]
    fn deny_list_wins_over_allow_list() {
        let layer = layer();
        assert!(!layer
            .evaluate_navigation("http://blocked.app.test/")
            .is_allowed());
    }

    #[test]
    fn empty_allow_list_denies_everything() {
        let layer = SecurityLayer::new(SecurityPolicy::default());
        assert!(!layer.evaluate_navigation("http://app.test/").is_allowed());
    }

    #[test]
    fn high_risk_actions_need_explicit_approval() {
        let layer = layer();
        let mut metadata = BTreeMap::new();
        let denied = layer.evaluate_action(ActionType::Upload, "http://app.test/", &metadata);
        assert!(matches!(
            denied,
            GateDecision::Denied {
                code: FailureCode::SecurityApprovalRequired,
                ..
            }
        ));

        metadata.insert("high_risk_approved".into(), Value::Bool(true));
        assert!(layer
            .evaluate_action(ActionType::Upload, "http://app.test/", &metadata)
            .is_allowed());
    }

    #[test]
    fn custom_js_is_blocked_by_default_even_when_approved() {
        let layer = layer();
        let mut metadata = BTreeMap::new();
        metadata.insert("high_risk_approved".into(), Value::Bool(true));
        let denied = layer.evaluate_action(
            ActionType::CustomJsRestricted,
            "http://app.test/",
            &metadata,
        );
        assert!(matches!(
            denied,
            GateDecision::Denied {
                code: FailureCode::SecurityJsBlocked,
                ..
            }
        ));
    }

    #[test]
    fn navigate_is_not_gated_by_current_url() {
        let layer = layer();
        let metadata = BTreeMap::new();
        assert!(layer
            .evaluate_action(ActionType::Navigate, "about:blank", &metadata)
            .is_allowed());
        assert!(!layer
            .evaluate_action(ActionType::Click, "about:blank", &metadata)
            .is_allowed());
    }
}
