// SPDX-License-Identifier: MIT OR Apache-2.0
//! predator-quota
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Multi-tenant admission control: session/rate/byte quotas and
//! per-tenant-per-domain circuit breakers.
//!
//! When a control-plane store is attached, every counter is persisted and
//! shared across processes; otherwise in-memory sliding windows are used.
//! Both paths produce identical decisions for identical inputs.

/// Per-tenant-per-domain circuit breakers.
pub mod breaker;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use predator_core::{FailureCode, GateDecision};
use predator_store::{ControlPlaneStore, unix_now};

pub use breaker::{CircuitDecision, CircuitInfo, CircuitState, DomainCircuitBreaker};

/// Ceilings applied to one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TenantQuota {
    /// Concurrent browser sessions.
    pub max_concurrent_sessions: u64,
    /// Actions admitted in any 60 s sliding window.
    pub max_actions_per_minute: u64,
    /// Total artifact bytes.
    pub max_artifact_bytes: u64,
    /// Token ceiling for one emitted result.
    pub max_step_tokens: u64,
    /// Token ceiling for the state delta component.
    pub max_state_delta_tokens: u64,
    /// Token ceiling for the network summary component.
    pub max_network_summary_tokens: u64,
    /// Token ceiling for the metadata component.
    pub max_metadata_tokens: u64,
}

impl Default for TenantQuota {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 10,
            max_actions_per_minute: 120,
            max_artifact_bytes: 512 * 1024 * 1024,
            max_step_tokens: 1_200,
            max_state_delta_tokens: 500,
            max_network_summary_tokens: 250,
            max_metadata_tokens: 250,
        }
    }
}

/// Quota bookkeeping and admission decisions per tenant.
#[derive(Debug)]
pub struct QuotaManager {
    default_quota: TenantQuota,
    store: Option<Arc<ControlPlaneStore>>,
    quotas: Mutex<HashMap<String, TenantQuota>>,
    action_windows: Mutex<HashMap<String, VecDeque<f64>>>,
    artifact_bytes: Mutex<HashMap<String, u64>>,
}

impl QuotaManager {
    /// Build a manager with an optional store backing.
    #[must_use]
    pub fn new(default_quota: TenantQuota, store: Option<Arc<ControlPlaneStore>>) -> Self {
        Self {
            default_quota,
            store,
            quotas: Mutex::new(HashMap::new()),
            action_windows: Mutex::new(HashMap::new()),
            artifact_bytes: Mutex::new(HashMap::new()),
        }
    }

    /// Set a tenant's quota, persisting it when a store is attached.
    pub fn set_quota(&self, tenant_id: &str, quota: TenantQuota) {
        self.quotas
            .lock()
            .expect("quota lock poisoned")
            .insert(tenant_id.to_string(), quota);
        if let Some(store) = &self.store {
            match serde_json::to_string(&quota) {
                Ok(payload) => {
                    if let Err(error) = store.set_quota(tenant_id, &payload) {
                        warn!(tenant_id, %error, "failed to persist tenant quota");
                    }
                }
                Err(error) => warn!(tenant_id, %error, "failed to encode tenant quota"),
            }
        }
    }

    /// Effective quota for a tenant: store, then local override, then default.
    #[must_use]
    pub fn quota_for(&self, tenant_id: &str) -> TenantQuota {
        if let Some(store) = &self.store
            && let Ok(Some(payload)) = store.get_quota(tenant_id)
            && let Ok(stored) = serde_json::from_str::<TenantQuota>(&payload)
        {
            return stored;
        }
        self.quotas
            .lock()
            .expect("quota lock poisoned")
            .get(tenant_id)
            .copied()
            .unwrap_or(self.default_quota)
    }

    /// Deny when the tenant already holds `active_sessions` at its cap.
    #[must_use]
    pub fn check_session_quota(&self, tenant_id: &str, active_sessions: u64) -> GateDecision {
        let quota = self.quota_for(tenant_id);
        if active_sessions >= quota.max_concurrent_sessions {
            return GateDecision::denied(
                FailureCode::QuotaSessionLimit,
                format!(
                    "active_sessions={active_sessions}, max={}",
                    quota.max_concurrent_sessions
                ),
            );
        }
        GateDecision::Allowed
    }

    /// Deny when the tenant's 60 s action window is at its cap.
    #[must_use]
    pub fn check_action_rate(&self, tenant_id: &str, now: Option<f64>) -> GateDecision {
        let now_ts = now.unwrap_or_else(unix_now);
        let quota = self.quota_for(tenant_id);

        let count = if let Some(store) = &self.store {
            store
                .count_recent_actions(tenant_id, now_ts - 60.0)
                .unwrap_or(u64::MAX)
        } else {
            let mut windows = self.action_windows.lock().expect("window lock poisoned");
            let window = windows.entry(tenant_id.to_string()).or_default();
            let cutoff = now_ts - 60.0;
            while window.front().is_some_and(|ts| *ts < cutoff) {
                window.pop_front();
            }
            window.len() as u64
        };

        if count >= quota.max_actions_per_minute {
            return GateDecision::denied(
                FailureCode::QuotaActionRate,
                format!("count_60s={count}, max={}", quota.max_actions_per_minute),
            );
        }
        GateDecision::Allowed
    }

    /// Record an admitted action and prune timestamps older than one hour.
    pub fn register_action(&self, tenant_id: &str, now: Option<f64>) {
        let now_ts = now.unwrap_or_else(unix_now);
        if let Some(store) = &self.store {
            if let Err(error) = store.register_action(tenant_id, now_ts) {
                warn!(tenant_id, %error, "failed to register action event");
            }
            if let Err(error) = store.prune_action_events(now_ts - 3_600.0) {
                warn!(%error, "failed to prune action events");
            }
            return;
        }
        self.action_windows
            .lock()
            .expect("window lock poisoned")
            .entry(tenant_id.to_string())
            .or_default()
            .push_back(now_ts);
    }

    /// Deny when projected artifact usage would exceed the cap.
    #[must_use]
    pub fn check_artifact_quota(&self, tenant_id: &str, additional_bytes: u64) -> GateDecision {
        let quota = self.quota_for(tenant_id);
        let current = if let Some(store) = &self.store {
            store.get_artifact_bytes(tenant_id).unwrap_or(u64::MAX)
        } else {
            self.artifact_bytes
                .lock()
                .expect("bytes lock poisoned")
                .get(tenant_id)
                .copied()
                .unwrap_or(0)
        };
        let projected = current.saturating_add(additional_bytes);
        if projected > quota.max_artifact_bytes {
            return GateDecision::denied(
                FailureCode::QuotaArtifactBytes,
                format!("projected={projected}, max={}", quota.max_artifact_bytes),
            );
        }
        GateDecision::Allowed
    }

    /// Commit an artifact byte increment after a successful write.
    pub fn register_artifact_bytes(&self, tenant_id: &str, size_bytes: u64) {
        if let Some(store) = &self.store {
            if let Err(error) = store.add_artifact_bytes(tenant_id, size_bytes) {
                warn!(tenant_id, %error, "failed to register artifact bytes");
            }
            return;
        }
        *self
            .artifact_bytes
            .lock()
            .expect("bytes lock poisoned")
            .entry(tenant_id.to_string())
            .or_insert(0) += size_bytes;
    }
}

/// Engine-level health derived from sessions and circuit state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHealth {
    /// `healthy`, `degraded`, or `unhealthy`.
    pub status: String,
    /// Live sessions at evaluation time.
    pub active_sessions: u64,
    /// Circuits currently open.
    pub open_circuits: u64,
    /// Full circuit snapshot for diagnostics.
    pub circuits: std::collections::BTreeMap<String, CircuitInfo>,
}

/// Evaluates engine health from circuit snapshots.
#[derive(Debug, Default)]
pub struct HealthMonitor;

impl HealthMonitor {
    /// Classify health: any open circuit degrades; more than five is
    /// unhealthy.
    #[must_use]
    pub fn evaluate(
        &self,
        active_sessions: u64,
        circuits: std::collections::BTreeMap<String, CircuitInfo>,
    ) -> EngineHealth {
        let open_circuits = circuits
            .values()
            .filter(|info| info.state == CircuitState::Open)
            .count() as u64;
        let status = if open_circuits > 5 {
            "unhealthy"
        } else if open_circuits > 0 {
            "degraded"
        } else {
            "healthy"
        };
        EngineHealth {
            status: status.to_string(),
            active_sessions,
            open_circuits,
            circuits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_quota() -> TenantQuota {
        TenantQuota {
            max_concurrent_sessions: 2,
            max_actions_per_minute: 3,
            max_artifact_bytes: 1_000,
            ..TenantQuota::default()
        }
    }

    #[test]
    fn session_quota_denies_at_cap() {
        let manager = QuotaManager::new(small_quota(), None);
        assert!(manager.check_session_quota("t1", 1).is_allowed());
        let denied = manager.check_session_quota("t1", 2);
        assert!(matches!(
            denied,
            GateDecision::Denied {
                code: FailureCode::QuotaSessionLimit,
                ..
            }
        ));
    }

    #[test]
    fn action_rate_uses_a_sliding_minute() {
        let manager = QuotaManager::new(small_quota(), None);
        let base = 1_000_000.0;
        for i in 0..3 {
            assert!(manager.check_action_rate("t1", Some(base + i as f64)).is_allowed());
            manager.register_action("t1", Some(base + i as f64));
        }
        assert!(matches!(
            manager.check_action_rate("t1", Some(base + 3.0)),
            GateDecision::Denied {
                code: FailureCode::QuotaActionRate,
                ..
            }
        ));
        // Sixty-one seconds later the window has slid past all three.
        assert!(manager.check_action_rate("t1", Some(base + 61.0)).is_allowed());
    }

    #[test]
    fn rate_windows_are_per_tenant() {
        let manager = QuotaManager::new(small_quota(), None);
        let base = 2_000_000.0;
        for i in 0..3 {
            manager.register_action("tenant-a", Some(base + i as f64));
        }
        assert!(!manager.check_action_rate("tenant-a", Some(base + 3.0)).is_allowed());
        assert!(manager.check_action_rate("tenant-b", Some(base + 3.0)).is_allowed());
    }

    #[test]
    fn artifact_quota_projects_before_committing() {
        let manager = QuotaManager::new(small_quota(), None);
        assert!(manager.check_artifact_quota("t1", 900).is_allowed());
        manager.register_artifact_bytes("t1", 900);
        assert!(!manager.check_artifact_quota("t1", 200).is_allowed());
        assert!(manager.check_artifact_quota("t1", 100).is_allowed());
    }

    #[test]
    fn store_backed_counters_survive_manager_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Arc::new(ControlPlaneStore::open(dir.path().join("control.db")).unwrap());
        let base = 3_000_000.0;
        {
            let manager = QuotaManager::new(small_quota(), Some(Arc::clone(&store)));
            manager.set_quota("t1", small_quota());
            manager.register_action("t1", Some(base));
            manager.register_artifact_bytes("t1", 600);
        }
        let manager = QuotaManager::new(TenantQuota::default(), Some(store));
        assert_eq!(manager.quota_for("t1").max_actions_per_minute, 3);
        assert!(!manager.check_artifact_quota("t1", 500).is_allowed());
    }

    #[test]
    fn health_degrades_on_open_circuits() {
        let monitor = HealthMonitor;
        let mut circuits = std::collections::BTreeMap::new();
        assert_eq!(monitor.evaluate(0, circuits.clone()).status, "healthy");
        circuits.insert(
            "t1::host".to_string(),
            CircuitInfo {
                state: CircuitState::Open,
                recent_failures: 5,
                opened_at: 1.0,
            },
        );
        assert_eq!(monitor.evaluate(0, circuits).status, "degraded");
    }
}
