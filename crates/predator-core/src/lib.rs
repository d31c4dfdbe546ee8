// SPDX-License-Identifier: MIT OR Apache-2.0
//! predator-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for the Predator execution engine.
//!
//! An [`ActionContract`] is the atomic unit of browser work: one intended
//! effect plus the evidence required to call it done. Contracts canonicalise
//! to a deterministic JSON form; the SHA-256 of that form is the action
//! identity used for idempotency and audit linkage.

/// Canonical JSON serialisation (sorted keys, compact, ASCII-escaped).
pub mod canonical;
/// Stable failure-code taxonomy surfaced to callers.
pub mod failure;
/// Session security policy model.
pub mod policy;
/// Prompt-injection redaction for untrusted page text.
pub mod redact;
/// Typed page snapshots, deltas, and network summaries.
pub mod state;
/// Structural contract validation.
pub mod validate;

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use canonical::{canonical_json, estimate_tokens, sha256_hex, short_hash, stable_hash};
pub use failure::FailureCode;
pub use policy::SecurityPolicy;
pub use state::{
    BudgetStats, DeltaOp, FormState, FrameState, InteractiveElementState, NetworkFailure,
    NetworkSummary, StateDelta, StructuredState, VisibleErrorState,
};
pub use validate::ContractValidator;

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The browser effect a contract commits to. At most one effect per action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Drive the page to a URL (readiness target: DOM-ready).
    Navigate,
    /// Click the bound target.
    Click,
    /// Fill text into the bound target.
    Type,
    /// Choose an option on the bound target.
    Select,
    /// Set a registered upload artifact on the bound file input.
    Upload,
    /// Click the bound target with a download expectation armed.
    DownloadTrigger,
    /// Dispatch nothing; only waits run.
    WaitOnly,
    /// Evaluate a bounded expression, gated by security policy.
    CustomJsRestricted,
}

/// How the orchestration layer should proceed after a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EscalationMode {
    /// Re-plan the target binding and retry at a higher layer.
    RetryRebind,
    /// Hand off to a vision-based fallback.
    VisionFallback,
    /// Queue for human review.
    HumanReview,
    /// Fail the whole workflow.
    FailWorkflow,
}

/// Retry behaviour for a single contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_backoff_ms: u64,
    /// Backoff ceiling.
    pub max_backoff_ms: u64,
    /// Exponential multiplier: `next = min(current * multiplier, max)`.
    pub multiplier: f64,
    /// Only these failure codes are retried.
    pub retryable_failure_codes: Vec<FailureCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
            retryable_failure_codes: vec![
                FailureCode::ActionExecutionFailed,
                FailureCode::WaitTimeout,
                FailureCode::TargetBindFailed,
            ],
        }
    }
}

impl RetryPolicy {
    /// The backoff after `current_ms`: `min(current * multiplier, cap)`.
    #[must_use]
    pub fn next_backoff_ms(&self, current_ms: u64) -> u64 {
        ((current_ms as f64) * self.multiplier).min(self.max_backoff_ms as f64) as u64
    }

    /// Whether outcomes with this code re-enter the attempt loop.
    #[must_use]
    pub fn is_retryable(&self, code: FailureCode) -> bool {
        self.retryable_failure_codes.contains(&code)
    }
}

/// Per-phase timeout ceilings in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TimeoutPolicy {
    /// Whole-action ceiling.
    pub total_timeout_ms: u64,
    /// Target binding ceiling.
    pub bind_timeout_ms: u64,
    /// Dispatch ceiling.
    pub execute_timeout_ms: u64,
    /// Default per-wait ceiling.
    pub wait_timeout_ms: u64,
    /// Verification ceiling.
    pub verify_timeout_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            total_timeout_ms: 30_000,
            bind_timeout_ms: 5_000,
            execute_timeout_ms: 10_000,
            wait_timeout_ms: 10_000,
            verify_timeout_ms: 5_000,
        }
    }
}

/// Escalation routing attached to terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EscalationPolicy {
    /// Mode attached when retries are exhausted.
    pub on_exhausted_retries: EscalationMode,
    /// Mode attached on a non-retryable failure.
    pub on_non_retryable: EscalationMode,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            on_exhausted_retries: EscalationMode::FailWorkflow,
            on_non_retryable: EscalationMode::HumanReview,
        }
    }
}

/// What to act on and with which payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionSpec {
    /// The effect to dispatch.
    pub action_type: ActionType,
    /// Stable element id from a prior snapshot.
    #[serde(default)]
    pub target_eid: Option<String>,
    /// Stable frame id routing the locator.
    #[serde(default)]
    pub target_fid: Option<String>,
    /// Explicit selector; wins over `target_eid`.
    #[serde(default)]
    pub selector: Option<String>,
    /// Fallback selectors, tried first-to-last. Bounded cardinality.
    #[serde(default)]
    pub selector_candidates: Vec<String>,
    /// Text payload for `type`.
    #[serde(default)]
    pub text: Option<String>,
    /// Target URL for `navigate`.
    #[serde(default)]
    pub url: Option<String>,
    /// Option value for `select`.
    #[serde(default)]
    pub select_value: Option<String>,
    /// Registered artifact id for `upload`.
    #[serde(default)]
    pub upload_artifact_id: Option<String>,
    /// Bounded expression for `custom_js_restricted`.
    #[serde(default)]
    pub js_expression: Option<String>,
    /// Optional argument passed to the expression.
    #[serde(default)]
    pub js_argument: Option<Value>,
}

impl ActionSpec {
    /// A spec that dispatches nothing.
    #[must_use]
    pub fn wait_only() -> Self {
        Self {
            action_type: ActionType::WaitOnly,
            target_eid: None,
            target_fid: None,
            selector: None,
            selector_candidates: vec![],
            text: None,
            url: None,
            select_value: None,
            upload_artifact_id: None,
            js_expression: None,
            js_argument: None,
        }
    }
}

/// Whether a failed rule fails the whole report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Failing this rule fails the report.
    Hard,
    /// Recorded but does not fail the report.
    Soft,
}

/// Text comparison mode for [`RuleCheck::TextState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TextMatchMode {
    /// Expected text must be contained in the actual text.
    Contains,
    /// Expected text must equal the actual text exactly.
    Exact,
}

/// The predicate a verification rule evaluates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "rule_type", rename_all = "snake_case")]
pub enum RuleCheck {
    /// A stable element id must be present in the snapshot.
    ElementPresent {
        /// Element id to look for.
        eid: String,
    },
    /// Text of the first match of `selector` must match `expected`.
    TextState {
        /// Locator selector.
        selector: String,
        /// Expected text.
        expected: String,
        /// Comparison mode.
        #[serde(default = "TextMatchMode::contains")]
        mode: TextMatchMode,
    },
    /// An attribute of the first match of `selector` must equal `expected`.
    AttributeState {
        /// Locator selector.
        selector: String,
        /// Attribute name.
        attribute: String,
        /// Expected attribute value (`None` means absent).
        #[serde(default)]
        expected: Option<String>,
    },
    /// At least one response since `since_seq` matches URL and status range.
    NetworkStatus {
        /// Regex over the response URL; `None` matches every response.
        #[serde(default)]
        url_pattern: Option<String>,
        /// Inclusive status lower bound.
        #[serde(default = "default_status_min")]
        status_min: u16,
        /// Inclusive status upper bound.
        #[serde(default = "default_status_max")]
        status_max: u16,
        /// Network sequence watermark.
        #[serde(default)]
        since_seq: u64,
    },
    /// No silent-failure JSON response for the route key since `since_seq`.
    JsonField {
        /// `host/path[:2]` route key to inspect.
        route_key: String,
        /// Fail on any silent-failure flag for the route.
        #[serde(default = "default_true")]
        require_no_silent_failure: bool,
        /// Network sequence watermark.
        #[serde(default)]
        since_seq: u64,
    },
    /// A file must exist with at least `min_size` bytes.
    FileExists {
        /// Filesystem path.
        path: String,
        /// Minimum acceptable size in bytes.
        #[serde(default = "default_min_size")]
        min_size: u64,
    },
    /// The current page URL must match the regex.
    UrlPattern {
        /// Regex over the page URL.
        pattern: String,
    },
    /// A named engine invariant must hold over the snapshot.
    Invariant {
        /// Invariant name, e.g. `no_visible_errors`.
        name: String,
    },
}

fn default_status_min() -> u16 {
    200
}
fn default_status_max() -> u16 {
    299
}
fn default_true() -> bool {
    true
}
fn default_min_size() -> u64 {
    1
}

impl TextMatchMode {
    fn contains() -> Self {
        Self::Contains
    }
}

/// A single verification predicate with its severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct VerificationRule {
    /// Whether a failure of this rule fails the report.
    #[serde(default = "Severity::hard")]
    pub severity: Severity,
    /// The predicate itself.
    #[serde(flatten)]
    pub check: RuleCheck,
}

impl Severity {
    fn hard() -> Self {
        Self::Hard
    }
}

impl VerificationRule {
    /// A hard rule over the given check.
    #[must_use]
    pub fn hard(check: RuleCheck) -> Self {
        Self {
            severity: Severity::Hard,
            check,
        }
    }

    /// A soft rule over the given check.
    #[must_use]
    pub fn soft(check: RuleCheck) -> Self {
        Self {
            severity: Severity::Soft,
            check,
        }
    }
}

/// DOM state a selector wait resolves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SelectorState {
    /// Present and visible.
    Visible,
    /// Present in the DOM, visibility irrelevant.
    Attached,
    /// Present but not visible.
    Hidden,
    /// Absent from the DOM.
    Detached,
}

/// The event a wait condition resolves on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitKind {
    /// Wait for a DOM element to reach a named state.
    Selector {
        /// Locator selector.
        selector: String,
        /// Target state.
        #[serde(default = "SelectorState::visible")]
        state: SelectorState,
        /// Require the selector to resolve to exactly one element.
        #[serde(default)]
        strict: bool,
    },
    /// Wait for a network response matching a URL regex and status range.
    Response {
        /// Regex over the response URL.
        url_pattern: String,
        /// Inclusive status lower bound, if any.
        #[serde(default)]
        status_min: Option<u16>,
        /// Inclusive status upper bound, if any.
        #[serde(default)]
        status_max: Option<u16>,
    },
    /// Wait for a page-evaluated predicate to become truthy.
    Function {
        /// Expression evaluated in the page.
        expression: String,
        /// Optional argument.
        #[serde(default)]
        arg: Option<Value>,
    },
    /// Wait for the page URL to match a regex.
    Url {
        /// Regex over the page URL.
        url_pattern: String,
    },
}

impl SelectorState {
    fn visible() -> Self {
        Self::Visible
    }
}

/// A wait condition with an optional per-condition timeout override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WaitCondition {
    /// What to wait on.
    #[serde(flatten)]
    pub kind: WaitKind,
    /// Per-condition timeout; falls back to the contract's wait timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Immutable unit of browser work.
///
/// Two contracts with equal canonical form share an action id; any differing
/// field produces a different id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionContract {
    /// Owning workflow.
    pub workflow_id: String,
    /// Orchestration run this step belongs to.
    pub run_id: String,
    /// Zero-based step position within the run.
    pub step_index: u32,
    /// Human-readable intent.
    pub intent: String,
    /// Rules checked against the pre-state; failures are terminal.
    #[serde(default)]
    pub preconditions: Vec<VerificationRule>,
    /// The single effect this contract commits to.
    pub action_spec: ActionSpec,
    /// Rules checked against the post-state.
    #[serde(default)]
    pub expected_postconditions: Vec<VerificationRule>,
    /// Additional post-state rules.
    #[serde(default)]
    pub verification_rules: Vec<VerificationRule>,
    /// Waits pre-armed before dispatch.
    #[serde(default)]
    pub wait_conditions: Vec<WaitCondition>,
    /// Timeout ceilings.
    #[serde(default)]
    pub timeout: TimeoutPolicy,
    /// Retry behaviour.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Escalation routing.
    #[serde(default)]
    pub escalation: EscalationPolicy,
    /// Free-form metadata (work-class override, approval flags, ...).
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl ActionContract {
    /// Deterministic canonical serialisation of the whole contract.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Json`] if the contract cannot be serialized.
    pub fn canonical_json(&self) -> Result<String, ContractError> {
        Ok(canonical::canonical_json(self)?)
    }

    /// Stable content-derived identity: `act_` + first 24 hex chars of the
    /// SHA-256 of the canonical form.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Json`] if the contract cannot be serialized.
    pub fn action_id(&self) -> Result<String, ContractError> {
        let canonical = self.canonical_json()?;
        let digest = sha256_hex(canonical.as_bytes());
        Ok(format!("act_{}", &digest[..24]))
    }

    /// True when the contract carries any post-action guard.
    #[must_use]
    pub fn has_post_guard(&self) -> bool {
        !self.wait_conditions.is_empty()
            || !self.expected_postconditions.is_empty()
            || !self.verification_rules.is_empty()
    }
}

/// Builder for constructing [`ActionContract`]s ergonomically.
///
/// # Examples
///
/// ```
/// use predator_core::{ActionContractBuilder, ActionSpec, ActionType};
///
/// let contract = ActionContractBuilder::new("wf-1", "sign in")
///     .step_index(2)
///     .action_spec(ActionSpec {
///         action_type: ActionType::Click,
///         selector: Some("#submit".into()),
///         ..ActionSpec::wait_only()
///     })
///     .build();
///
/// assert_eq!(contract.workflow_id, "wf-1");
/// assert_eq!(contract.step_index, 2);
/// ```
#[derive(Debug)]
pub struct ActionContractBuilder {
    contract: ActionContract,
}

impl ActionContractBuilder {
    /// Start a contract for a workflow with a fresh run id.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>, intent: impl Into<String>) -> Self {
        Self {
            contract: ActionContract {
                workflow_id: workflow_id.into(),
                run_id: uuid::Uuid::new_v4().to_string(),
                step_index: 0,
                intent: intent.into(),
                preconditions: vec![],
                action_spec: ActionSpec::wait_only(),
                expected_postconditions: vec![],
                verification_rules: vec![],
                wait_conditions: vec![],
                timeout: TimeoutPolicy::default(),
                retry: RetryPolicy::default(),
                escalation: EscalationPolicy::default(),
                metadata: BTreeMap::new(),
            },
        }
    }

    /// Set the run id.
    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.contract.run_id = run_id.into();
        self
    }
    /// Set the step index.
    #[must_use]
    pub fn step_index(mut self, index: u32) -> Self {
        self.contract.step_index = index;
        self
    }
    /// Set the action spec.
    #[must_use]
    pub fn action_spec(mut self, spec: ActionSpec) -> Self {
        self.contract.action_spec = spec;
        self
    }
    /// Append a precondition.
    #[must_use]
    pub fn precondition(mut self, rule: VerificationRule) -> Self {
        self.contract.preconditions.push(rule);
        self
    }
    /// Append an expected postcondition.
    #[must_use]
    pub fn postcondition(mut self, rule: VerificationRule) -> Self {
        self.contract.expected_postconditions.push(rule);
        self
    }
    /// Append a verification rule.
    #[must_use]
    pub fn verification(mut self, rule: VerificationRule) -> Self {
        self.contract.verification_rules.push(rule);
        self
    }
    /// Append a wait condition.
    #[must_use]
    pub fn wait(mut self, condition: WaitCondition) -> Self {
        self.contract.wait_conditions.push(condition);
        self
    }
    /// Set the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.contract.retry = retry;
        self
    }
    /// Set the timeout policy.
    #[must_use]
    pub fn timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.contract.timeout = timeout;
        self
    }
    /// Set the escalation policy.
    #[must_use]
    pub fn escalation(mut self, escalation: EscalationPolicy) -> Self {
        self.contract.escalation = escalation;
        self
    }
    /// Merge a metadata key.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.contract.metadata.insert(key.into(), value);
        self
    }

    /// Consume the builder and produce the contract.
    #[must_use]
    pub fn build(self) -> ActionContract {
        self.contract
    }
}

/// Whether a gate admits an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateDecision {
    /// The action may proceed.
    Allowed,
    /// The action is blocked with a stable code.
    Denied {
        /// Stable failure code.
        code: FailureCode,
        /// Human-readable detail for diagnostics.
        detail: String,
    },
}

impl GateDecision {
    /// Construct a denial.
    #[must_use]
    pub fn denied(code: FailureCode, detail: impl Into<String>) -> Self {
        Self::Denied {
            code,
            detail: detail.into(),
        }
    }

    /// Returns `true` when the action may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// A file produced or referenced by an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRecord {
    /// `up_`/`dl_` prefixed content hash id.
    pub artifact_id: String,
    /// Owning workflow.
    pub workflow_id: String,
    /// Producing action.
    pub action_id: String,
    /// Filesystem path.
    pub path: String,
    /// MIME type (best effort).
    pub mime: String,
    /// Size in bytes.
    pub size: u64,
    /// Full SHA-256 of the content.
    pub sha256: String,
}

/// Outcome of a single contract execution, with replayable evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ActionExecutionResult {
    /// Content-derived contract identity.
    pub action_id: String,
    /// Whether the action succeeded and verified.
    pub success: bool,
    /// Stable failure code on failure.
    #[serde(default)]
    pub failure_code: Option<FailureCode>,
    /// Attempts consumed (including the first).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Escalation routing attached to terminal failures.
    #[serde(default)]
    pub escalation: Option<EscalationMode>,
    /// Whether verification passed.
    #[serde(default)]
    pub verification_passed: bool,
    /// Snapshot id before dispatch.
    #[serde(default)]
    pub pre_state_id: Option<String>,
    /// Snapshot id after dispatch.
    #[serde(default)]
    pub post_state_id: Option<String>,
    /// Section-level diff between pre and post state.
    #[serde(default)]
    pub state_delta: StateDelta,
    /// Network events since the dispatch watermark.
    #[serde(default)]
    pub network_summary: NetworkSummary,
    /// Execution timeline and counters.
    #[serde(default)]
    pub telemetry: Value,
    /// Artifacts produced or referenced.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRecord>,
    /// Guard summary, budget report, runtime events, diagnostics.
    #[serde(default)]
    pub metadata: Value,
}

fn default_attempts() -> u32 {
    1
}

impl ActionExecutionResult {
    /// A failure outcome with no evidence beyond the code and detail.
    #[must_use]
    pub fn failure(action_id: impl Into<String>, code: FailureCode, detail: impl Into<String>) -> Self {
        Self {
            action_id: action_id.into(),
            success: false,
            failure_code: Some(code),
            attempts: 1,
            escalation: None,
            verification_passed: false,
            pre_state_id: None,
            post_state_id: None,
            state_delta: StateDelta::default(),
            network_summary: NetworkSummary::default(),
            telemetry: Value::Null,
            artifacts: vec![],
            metadata: serde_json::json!({ "detail": detail.into() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_contract() -> ActionContract {
        ActionContractBuilder::new("wf-ids", "navigate home")
            .run_id("run-1")
            .action_spec(ActionSpec {
                action_type: ActionType::Navigate,
                url: Some("http://localhost:8080/".into()),
                ..ActionSpec::wait_only()
            })
            .wait(WaitCondition {
                kind: WaitKind::Selector {
                    selector: "#ready".into(),
                    state: SelectorState::Visible,
                    strict: false,
                },
                timeout_ms: None,
            })
            .build()
    }

    #[test]
    fn equal_canonical_forms_share_an_action_id() {
        let a = minimal_contract();
        let b = minimal_contract();
        assert_eq!(a.canonical_json().unwrap(), b.canonical_json().unwrap());
        assert_eq!(a.action_id().unwrap(), b.action_id().unwrap());
    }

    #[test]
    fn any_field_change_produces_a_distinct_id() {
        let a = minimal_contract();
        let mut b = minimal_contract();
        b.step_index = 1;
        assert_ne!(a.action_id().unwrap(), b.action_id().unwrap());

        let mut c = minimal_contract();
        c.metadata.insert("work_class".into(), Value::from("heavy"));
        assert_ne!(a.action_id().unwrap(), c.action_id().unwrap());
    }

    #[test]
    fn action_id_has_stable_shape() {
        let id = minimal_contract().action_id().unwrap();
        assert!(id.starts_with("act_"));
        assert_eq!(id.len(), 4 + 24);
    }

    #[test]
    fn canonical_round_trip_is_fixed_point() {
        let contract = minimal_contract();
        let first = contract.canonical_json().unwrap();
        let parsed: ActionContract = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed.canonical_json().unwrap(), first);
    }

    #[test]
    fn wait_conditions_tag_on_kind() {
        let wait = WaitCondition {
            kind: WaitKind::Response {
                url_pattern: "/api/ping".into(),
                status_min: Some(200),
                status_max: Some(299),
            },
            timeout_ms: Some(500),
        };
        let value = serde_json::to_value(&wait).unwrap();
        assert_eq!(value["kind"], "response");
        assert_eq!(value["timeout_ms"], 500);
        let back: WaitCondition = serde_json::from_value(value).unwrap();
        assert_eq!(back, wait);
    }

    #[test]
    fn rules_tag_on_rule_type() {
        let rule = VerificationRule::hard(RuleCheck::NetworkStatus {
            url_pattern: Some("/api/ping".into()),
            status_min: 200,
            status_max: 299,
            since_seq: 0,
        });
        let value = serde_json::to_value(&rule).unwrap();
        assert_eq!(value["rule_type"], "network_status");
        assert_eq!(value["severity"], "hard");
    }

    #[test]
    fn wait_only_has_no_guard_requirement() {
        let contract = ActionContractBuilder::new("wf", "pause").build();
        assert_eq!(contract.action_spec.action_type, ActionType::WaitOnly);
        assert!(!contract.has_post_guard());
    }

    #[test]
    fn backoff_is_monotone_non_decreasing_until_the_cap() {
        let policy = RetryPolicy {
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
            ..RetryPolicy::default()
        };
        let mut backoff = policy.initial_backoff_ms;
        let mut previous = 0;
        for _ in 0..8 {
            assert!(backoff >= previous);
            assert!(backoff <= policy.max_backoff_ms);
            previous = backoff;
            backoff = policy.next_backoff_ms(backoff);
        }
        assert_eq!(backoff, policy.max_backoff_ms);
    }

    #[test]
    fn retryability_follows_the_configured_codes() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(FailureCode::WaitTimeout));
        assert!(policy.is_retryable(FailureCode::TargetBindFailed));
        assert!(!policy.is_retryable(FailureCode::PostconditionFailed));
        assert!(!policy.is_retryable(FailureCode::PreconditionFailed));
    }
}
