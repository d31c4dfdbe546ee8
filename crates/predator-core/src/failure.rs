// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stable failure-code taxonomy surfaced to callers.
//!
//! Every code serialises to a `SCREAMING_SNAKE_CASE` string that is
//! guaranteed not to change across releases; retry policies, audit records,
//! and orchestration layers key on these strings.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable, stable failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    /// The contract itself is malformed.
    InvalidContract,
    /// The action spec is malformed (selector, url, payload bounds).
    InvalidActionSpec,
    /// A wait condition is malformed.
    InvalidWaitCondition,
    /// A non-wait action carries no waits, postconditions, or rules.
    MissingPostActionGuard,
    /// A precondition failed against the pre-state; never retried.
    PreconditionFailed,
    /// Dispatch raised a driver fault.
    ActionExecutionFailed,
    /// A wait condition did not resolve within its timeout.
    WaitTimeout,
    /// No locator could be bound for the target.
    TargetBindFailed,
    /// Post-state verification failed.
    PostconditionFailed,
    /// All configured attempts were consumed.
    RetryExhausted,
    /// Navigation or action blocked by domain policy.
    SecurityDomainBlock,
    /// High-risk action lacks explicit approval.
    SecurityApprovalRequired,
    /// Custom JS execution is disabled by policy.
    SecurityJsBlocked,
    /// Tenant concurrent-session ceiling reached.
    QuotaSessionLimit,
    /// Tenant actions-per-minute ceiling reached.
    QuotaActionRate,
    /// Tenant artifact-byte ceiling would be exceeded.
    QuotaArtifactBytes,
    /// The per-tenant-per-domain circuit is open.
    CircuitOpen,
    /// The cross-process session lease is held by another owner.
    SessionLeaseNotAcquired,
    /// The process-wide session slot pool is exhausted.
    GlobalSessionLimit,
    /// Evidence exceeded the token budget even after all trims.
    BudgetExceeded,
    /// A shard node raised an internal error around execution.
    ShardNodeExecutionError,
}

impl FailureCode {
    /// The stable wire string for this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidContract => "INVALID_CONTRACT",
            Self::InvalidActionSpec => "INVALID_ACTION_SPEC",
            Self::InvalidWaitCondition => "INVALID_WAIT_CONDITION",
            Self::MissingPostActionGuard => "MISSING_POST_ACTION_GUARD",
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::ActionExecutionFailed => "ACTION_EXECUTION_FAILED",
            Self::WaitTimeout => "WAIT_TIMEOUT",
            Self::TargetBindFailed => "TARGET_BIND_FAILED",
            Self::PostconditionFailed => "POSTCONDITION_FAILED",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::SecurityDomainBlock => "SECURITY_DOMAIN_BLOCK",
            Self::SecurityApprovalRequired => "SECURITY_APPROVAL_REQUIRED",
            Self::SecurityJsBlocked => "SECURITY_JS_BLOCKED",
            Self::QuotaSessionLimit => "QUOTA_SESSION_LIMIT",
            Self::QuotaActionRate => "QUOTA_ACTION_RATE",
            Self::QuotaArtifactBytes => "QUOTA_ARTIFACT_BYTES",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::SessionLeaseNotAcquired => "SESSION_LEASE_NOT_ACQUIRED",
            Self::GlobalSessionLimit => "GLOBAL_SESSION_LIMIT",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::ShardNodeExecutionError => "SHARD_NODE_EXECUTION_ERROR",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_matches_as_str() {
        for code in [
            FailureCode::InvalidContract,
            FailureCode::MissingPostActionGuard,
            FailureCode::CircuitOpen,
            FailureCode::SessionLeaseNotAcquired,
            FailureCode::ShardNodeExecutionError,
        ] {
            let wire = serde_json::to_value(code).unwrap();
            assert_eq!(wire, code.as_str());
        }
    }

    #[test]
    fn wire_form_round_trips() {
        let back: FailureCode = serde_json::from_value("WAIT_TIMEOUT".into()).unwrap();
        assert_eq!(back, FailureCode::WaitTimeout);
    }
}
