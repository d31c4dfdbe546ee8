// SPDX-License-Identifier: MIT OR Apache-2.0

//! Security policy attached to a workflow's session.
//!
//! An empty allow list permits nothing: navigation is deny-by-default and
//! callers must opt domains in explicitly.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ActionType;

/// Domain and action restrictions for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Domains (and their subdomains) navigation and actions may touch.
    pub allow_domains: Vec<String>,
    /// Domains (and their subdomains) always blocked, even if allowed above.
    pub deny_domains: Vec<String>,
    /// Whether `custom_js_restricted` actions are permitted at all.
    pub allow_custom_js: bool,
    /// Action types requiring `high_risk_approved` metadata.
    pub high_risk_actions: Vec<ActionType>,
    /// Advisory per-minute rate for this policy's workflows.
    pub rate_limit_per_minute: u64,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allow_domains: vec![],
            deny_domains: vec![],
            allow_custom_js: false,
            high_risk_actions: vec![
                ActionType::CustomJsRestricted,
                ActionType::Upload,
                ActionType::DownloadTrigger,
            ],
            rate_limit_per_minute: 120,
        }
    }
}

impl SecurityPolicy {
    /// A policy allowing the given domains with everything else default.
    #[must_use]
    pub fn allowing<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow_domains: domains.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}
