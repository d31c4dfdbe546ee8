// SPDX-License-Identifier: MIT OR Apache-2.0
//! predator-budget
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Deterministic trimming of the emitted evidence payload.
//!
//! The trim order is fixed and content-independent so that identical inputs
//! always produce identical outputs: per-component passes first (metadata
//! runtime events, network failures, state-delta ops), then the same
//! sequence globally against the total cap, then a final collapse of
//! metadata and telemetry. A payload still over the limit after every trim
//! is replaced by the caller with a `BUDGET_EXCEEDED` envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use predator_core::estimate_tokens;

/// Per-component token ceilings for one emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentTokenBudgets {
    /// Ceiling for the `state_delta` component.
    pub max_state_delta_tokens: u64,
    /// Ceiling for the `network_summary` component.
    pub max_network_summary_tokens: u64,
    /// Ceiling for the `metadata` component.
    pub max_metadata_tokens: u64,
}

impl Default for ComponentTokenBudgets {
    fn default() -> Self {
        Self {
            max_state_delta_tokens: 500,
            max_network_summary_tokens: 250,
            max_metadata_tokens: 250,
        }
    }
}

/// Result of enforcing the budget on one payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetOutcome {
    /// `false` when the payload still exceeds the hard limit after trims.
    pub allowed: bool,
    /// Token estimate of the final payload.
    pub total_tokens: u64,
    /// Whether any trim step ran.
    pub trimmed: bool,
    /// Ordered trim notes for diagnostics.
    pub notes: Vec<String>,
}

/// Deterministic token-budget enforcement.
#[derive(Debug, Clone)]
pub struct TokenBudgetManager {
    hard_limit_tokens: u64,
}

impl Default for TokenBudgetManager {
    fn default() -> Self {
        Self {
            hard_limit_tokens: 1_200,
        }
    }
}

impl TokenBudgetManager {
    /// Build a manager with an explicit default hard limit.
    #[must_use]
    pub fn new(hard_limit_tokens: u64) -> Self {
        Self { hard_limit_tokens }
    }

    /// The default hard limit.
    #[must_use]
    pub fn hard_limit_tokens(&self) -> u64 {
        self.hard_limit_tokens
    }

    fn tokens(value: &Value) -> u64 {
        estimate_tokens(value) as u64
    }

    fn component_tokens(payload: &Value, key: &str) -> u64 {
        match payload.get(key) {
            Some(component) => Self::tokens(&serde_json::json!({ key: component })),
            None => 0,
        }
    }

    fn trim_list_to(list: &mut Vec<Value>, cap: usize) -> bool {
        if list.len() <= cap {
            return false;
        }
        list.truncate(cap);
        true
    }

    fn trim_runtime_events_to(payload: &mut Value, cap: usize, notes: &mut Vec<String>) {
        if let Some(Value::Array(events)) = payload
            .get_mut("metadata")
            .and_then(|metadata| metadata.get_mut("runtime_events"))
            && Self::trim_list_to(events, cap)
        {
            notes.push(format!("trimmed_runtime_events_to_{cap}"));
        }
    }

    fn trim_metadata_to_minimal(payload: &mut Value, notes: &mut Vec<String>) {
        if let Some(metadata) = payload.get_mut("metadata")
            && metadata.is_object()
        {
            let guard_summary = metadata.get("guard_summary").cloned();
            *metadata = match guard_summary {
                Some(summary) if summary.is_object() => {
                    serde_json::json!({ "guard_summary": summary })
                }
                _ => serde_json::json!({}),
            };
            notes.push("compressed_metadata_minimal".into());
        }
    }

    fn trim_network_failures_to(payload: &mut Value, cap: usize, notes: &mut Vec<String>) {
        if let Some(Value::Array(failures)) = payload
            .get_mut("network_summary")
            .and_then(|summary| summary.get_mut("failures"))
            && Self::trim_list_to(failures, cap)
        {
            notes.push(format!("trimmed_network_failures_to_{cap}"));
        }
    }

    fn trim_network_to_minimal(payload: &mut Value, notes: &mut Vec<String>) {
        if let Some(summary) = payload.get_mut("network_summary")
            && summary.is_object()
        {
            *summary = serde_json::json!({
                "total_requests": summary.get("total_requests").cloned().unwrap_or(0.into()),
                "total_responses": summary.get("total_responses").cloned().unwrap_or(0.into()),
                "total_failures": summary.get("total_failures").cloned().unwrap_or(0.into()),
                "failures": [],
            });
            notes.push("compressed_network_summary_minimal".into());
        }
    }

    fn trim_state_delta_ops_to(payload: &mut Value, cap: usize, notes: &mut Vec<String>) {
        if let Some(delta) = payload.get_mut("state_delta") {
            for key in ["element_ops", "form_ops", "error_ops"] {
                if let Some(Value::Array(ops)) = delta.get_mut(key)
                    && Self::trim_list_to(ops, cap)
                {
                    notes.push(format!("trimmed_{key}_to_{cap}"));
                }
            }
        }
    }

    fn trim_state_delta_to_minimal(payload: &mut Value, notes: &mut Vec<String>) {
        if let Some(delta) = payload.get_mut("state_delta")
            && delta.is_object()
        {
            *delta = serde_json::json!({
                "prev_state_id": delta.get("prev_state_id").cloned().unwrap_or(Value::Null),
                "new_state_id": delta.get("new_state_id").cloned().unwrap_or("".into()),
                "changed_sections": delta.get("changed_sections").cloned().unwrap_or_else(|| serde_json::json!([])),
                "section_hash_changes": delta.get("section_hash_changes").cloned().unwrap_or_else(|| serde_json::json!({})),
                "element_ops": [],
                "form_ops": [],
                "error_ops": [],
                "network_delta": Value::Null,
                "token_estimate": 0,
            });
            notes.push("compressed_state_delta_minimal".into());
        }
    }

    fn enforce_component_budgets(
        payload: &mut Value,
        budgets: &ComponentTokenBudgets,
        notes: &mut Vec<String>,
    ) {
        if Self::component_tokens(payload, "metadata") > budgets.max_metadata_tokens {
            Self::trim_runtime_events_to(payload, 10, notes);
        }
        if Self::component_tokens(payload, "metadata") > budgets.max_metadata_tokens {
            Self::trim_runtime_events_to(payload, 5, notes);
        }
        if Self::component_tokens(payload, "metadata") > budgets.max_metadata_tokens {
            Self::trim_metadata_to_minimal(payload, notes);
        }

        if Self::component_tokens(payload, "network_summary") > budgets.max_network_summary_tokens
        {
            Self::trim_network_failures_to(payload, 8, notes);
        }
        if Self::component_tokens(payload, "network_summary") > budgets.max_network_summary_tokens
        {
            Self::trim_network_failures_to(payload, 4, notes);
        }
        if Self::component_tokens(payload, "network_summary") > budgets.max_network_summary_tokens
        {
            Self::trim_network_to_minimal(payload, notes);
        }

        if Self::component_tokens(payload, "state_delta") > budgets.max_state_delta_tokens {
            Self::trim_state_delta_ops_to(payload, 12, notes);
        }
        if Self::component_tokens(payload, "state_delta") > budgets.max_state_delta_tokens {
            Self::trim_state_delta_ops_to(payload, 6, notes);
        }
        if Self::component_tokens(payload, "state_delta") > budgets.max_state_delta_tokens {
            Self::trim_state_delta_to_minimal(payload, notes);
        }
    }

    /// Enforce per-component and total budgets on `payload` in place.
    ///
    /// Returns the outcome; `allowed == false` means the caller must replace
    /// the evidence with a minimal `BUDGET_EXCEEDED` envelope.
    pub fn enforce(
        &self,
        payload: &mut Value,
        hard_limit_tokens: Option<u64>,
        component_budgets: Option<ComponentTokenBudgets>,
    ) -> BudgetOutcome {
        let limit = hard_limit_tokens.unwrap_or(self.hard_limit_tokens);
        let budgets = component_budgets.unwrap_or_default();
        let mut notes: Vec<String> = Vec::new();

        Self::enforce_component_budgets(payload, &budgets, &mut notes);

        let total = Self::tokens(payload);
        if total <= limit {
            return BudgetOutcome {
                allowed: true,
                total_tokens: total,
                trimmed: !notes.is_empty(),
                notes,
            };
        }

        // Same sequence globally, against the total cap.
        Self::trim_runtime_events_to(payload, 10, &mut notes);
        let total = Self::tokens(payload);
        if total <= limit {
            return BudgetOutcome {
                allowed: true,
                total_tokens: total,
                trimmed: true,
                notes,
            };
        }

        Self::trim_network_failures_to(payload, 8, &mut notes);
        let total = Self::tokens(payload);
        if total <= limit {
            return BudgetOutcome {
                allowed: true,
                total_tokens: total,
                trimmed: true,
                notes,
            };
        }

        Self::trim_state_delta_ops_to(payload, 12, &mut notes);
        let total = Self::tokens(payload);
        if total <= limit {
            return BudgetOutcome {
                allowed: true,
                total_tokens: total,
                trimmed: true,
                notes,
            };
        }

        // Hard stop: keep correctness signals, drop heavy optional data.
        if payload.get("metadata").is_some_and(Value::is_object) {
            payload["metadata"] = serde_json::json!({
                "budget_truncated": true,
                "notes": notes.clone(),
            });
            notes.push("dropped_metadata_payload".into());
        }
        if payload.get("telemetry").is_some_and(Value::is_object) {
            let telemetry = &payload["telemetry"];
            payload["telemetry"] = serde_json::json!({
                "elapsed_ms": telemetry.get("elapsed_ms").cloned().unwrap_or(Value::Null),
                "counters": telemetry.get("counters").cloned().unwrap_or_else(|| serde_json::json!({})),
            });
            notes.push("compressed_telemetry".into());
        }

        let total = Self::tokens(payload);
        BudgetOutcome {
            allowed: total <= limit,
            total_tokens: total,
            trimmed: true,
            notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_with(events: usize, failures: usize, ops: usize) -> Value {
        json!({
            "action_id": "act_x",
            "success": true,
            "state_delta": {
                "prev_state_id": "s_a",
                "new_state_id": "s_b",
                "changed_sections": ["elements"],
                "section_hash_changes": {},
                "element_ops": (0..ops).map(|i| json!({"op": "remove", "id": format!("e_{i}")})).collect::<Vec<_>>(),
                "form_ops": [],
                "error_ops": [],
                "network_delta": null,
                "token_estimate": 10,
            },
            "network_summary": {
                "total_requests": failures,
                "total_responses": failures,
                "total_failures": failures,
                "failures": (0..failures).map(|i| json!({
                    "route_key": format!("host/api/route{i}"),
                    "status": 500,
                    "status_class": "5xx",
                    "error_signature": "response_failure",
                    "latency_ms": 12,
                })).collect::<Vec<_>>(),
            },
            "telemetry": {"elapsed_ms": 8, "counters": {}, "timeline": []},
            "metadata": {
                "runtime_events": (0..events).map(|i| json!({
                    "seq": i, "ts": "2026-01-01T00:00:00Z", "kind": "console", "message": "m",
                })).collect::<Vec<_>>(),
                "guard_summary": {"wait_conditions": 1, "verification_rules": 1},
            },
        })
    }

    #[test]
    fn within_limit_payload_is_untouched() {
        let manager = TokenBudgetManager::default();
        let mut payload = payload_with(2, 1, 1);
        let before = payload.clone();
        let outcome = manager.enforce(&mut payload, Some(100_000), None);
        assert!(outcome.allowed);
        assert!(!outcome.trimmed);
        assert!(outcome.notes.is_empty());
        assert_eq!(payload, before);
    }

    #[test]
    fn exactly_at_limit_is_not_trimmed() {
        let manager = TokenBudgetManager::default();
        let mut payload = payload_with(1, 0, 0);
        let total = estimate_tokens(&payload) as u64;
        let outcome = manager.enforce(&mut payload, Some(total), None);
        assert!(outcome.allowed);
        assert!(!outcome.trimmed);
        assert_eq!(outcome.total_tokens, total);
    }

    #[test]
    fn component_pass_trims_runtime_events_first() {
        let manager = TokenBudgetManager::default();
        let mut payload = payload_with(40, 0, 0);
        let outcome = manager.enforce(
            &mut payload,
            Some(100_000),
            Some(ComponentTokenBudgets {
                max_metadata_tokens: 50,
                ..ComponentTokenBudgets::default()
            }),
        );
        assert!(outcome.allowed);
        assert!(outcome.trimmed);
        assert_eq!(outcome.notes[0], "trimmed_runtime_events_to_10");
        let events = payload["metadata"]["runtime_events"].as_array().unwrap();
        assert!(events.len() <= 10);
    }

    #[test]
    fn network_failures_trim_in_steps() {
        let manager = TokenBudgetManager::default();
        let mut payload = payload_with(0, 30, 0);
        let outcome = manager.enforce(
            &mut payload,
            Some(100_000),
            Some(ComponentTokenBudgets {
                max_network_summary_tokens: 10,
                ..ComponentTokenBudgets::default()
            }),
        );
        assert!(outcome.allowed);
        assert!(outcome.notes.contains(&"trimmed_network_failures_to_8".into()));
        assert!(outcome
            .notes
            .contains(&"compressed_network_summary_minimal".into()));
        assert_eq!(payload["network_summary"]["failures"], json!([]));
        assert_eq!(payload["network_summary"]["total_failures"], 30);
    }

    #[test]
    fn identical_payloads_trim_identically() {
        let manager = TokenBudgetManager::default();
        let mut a = payload_with(30, 30, 30);
        let mut b = payload_with(30, 30, 30);
        let oa = manager.enforce(&mut a, Some(200), None);
        let ob = manager.enforce(&mut b, Some(200), None);
        assert_eq!(a, b);
        assert_eq!(oa, ob);
    }

    #[test]
    fn over_limit_after_all_trims_is_disallowed() {
        let manager = TokenBudgetManager::default();
        let mut payload = payload_with(5, 5, 5);
        payload["state_delta"]["element_ops"] = json!((0..3)
            .map(|i| json!({"op": "add", "id": format!("e_{i}"), "value": "x".repeat(400)}))
            .collect::<Vec<_>>());
        let outcome = manager.enforce(&mut payload, Some(10), None);
        assert!(!outcome.allowed);
        assert!(outcome.trimmed);
        assert!(outcome.total_tokens > 10);
        assert_eq!(payload["metadata"]["budget_truncated"], json!(true));
    }

    #[test]
    fn total_tokens_never_exceed_limit_when_allowed() {
        let manager = TokenBudgetManager::default();
        for size in [0usize, 3, 10, 40, 120] {
            let mut payload = payload_with(size, size, size);
            let outcome = manager.enforce(&mut payload, Some(900), None);
            if outcome.allowed {
                assert!(outcome.total_tokens <= 900, "size={size}");
            }
        }
    }
}
