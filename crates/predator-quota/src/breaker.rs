// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-tenant-per-domain circuit breakers.
//!
//! Keys are `tenant::domain` when tenant-scoped so one tenant tripping a
//! domain never blocks another. Transitions: threshold failures in the
//! rolling window open the circuit; after the open interval a single probe
//! is admitted half-open; a half-open failure reopens immediately; a
//! half-open success closes and clears the window.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use predator_store::{CircuitStateTag, ControlPlaneStore, unix_now};

/// Circuit position for one `(tenant, domain)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Admitting traffic.
    Closed,
    /// Blocking traffic until the open interval elapses.
    Open,
    /// Admitting a single probe.
    HalfOpen,
}

impl From<CircuitStateTag> for CircuitState {
    fn from(tag: CircuitStateTag) -> Self {
        match tag {
            CircuitStateTag::Closed => Self::Closed,
            CircuitStateTag::Open => Self::Open,
            CircuitStateTag::HalfOpen => Self::HalfOpen,
        }
    }
}

impl From<CircuitState> for CircuitStateTag {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Closed,
            CircuitState::Open => Self::Open,
            CircuitState::HalfOpen => Self::HalfOpen,
        }
    }
}

/// Outcome of asking the breaker for admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitDecision {
    /// Traffic admitted; `state` is the position after the check.
    Admitted {
        /// Position after the check (`HalfOpen` marks a probe).
        state: CircuitState,
    },
    /// Traffic blocked; surfaces as `CIRCUIT_OPEN`.
    Blocked {
        /// Human-readable detail.
        detail: String,
    },
}

impl CircuitDecision {
    /// Returns `true` when traffic was admitted.
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

/// Snapshot row for diagnostics and drain-mode ratios.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitInfo {
    /// Current position.
    pub state: CircuitState,
    /// Failures inside the rolling window.
    pub recent_failures: u64,
    /// Unix seconds of the last open transition; `0.0` if never.
    pub opened_at: f64,
}

#[derive(Debug, Default)]
struct MemoryCircuit {
    state: CircuitState,
    opened_at: f64,
    recent_failures: VecDeque<f64>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self::Closed
    }
}

/// Failure-window circuit breaker, optionally store-backed.
#[derive(Debug)]
pub struct DomainCircuitBreaker {
    threshold: u64,
    window_seconds: f64,
    open_interval_seconds: f64,
    store: Option<Arc<ControlPlaneStore>>,
    circuits: Mutex<HashMap<String, MemoryCircuit>>,
}

impl DomainCircuitBreaker {
    /// Build a breaker with the default posture: 5 failures in 120 s opens
    /// for 60 s.
    #[must_use]
    pub fn new(store: Option<Arc<ControlPlaneStore>>) -> Self {
        Self::with_policy(5, 120.0, 60.0, store)
    }

    /// Build a breaker with an explicit policy.
    #[must_use]
    pub fn with_policy(
        threshold: u64,
        window_seconds: f64,
        open_interval_seconds: f64,
        store: Option<Arc<ControlPlaneStore>>,
    ) -> Self {
        Self {
            threshold,
            window_seconds,
            open_interval_seconds,
            store,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn key(domain: &str, tenant_id: Option<&str>) -> String {
        match tenant_id {
            Some(tenant) => format!("{tenant}::{domain}"),
            None => domain.to_string(),
        }
    }

    /// Ask whether traffic to `domain` is admitted for `tenant_id`.
    #[must_use]
    pub fn allow(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
        now: Option<f64>,
    ) -> CircuitDecision {
        let now_ts = now.unwrap_or_else(unix_now);

        if let Some(store) = &self.store {
            let snapshot = store
                .get_circuit(domain, tenant_id)
                .unwrap_or(predator_store::CircuitSnapshot {
                    state: CircuitStateTag::Closed,
                    opened_at: 0.0,
                });
            let state = CircuitState::from(snapshot.state);
            if state == CircuitState::Open {
                if now_ts - snapshot.opened_at >= self.open_interval_seconds {
                    let _ = store.set_circuit(
                        domain,
                        tenant_id,
                        CircuitStateTag::HalfOpen,
                        snapshot.opened_at,
                    );
                    return CircuitDecision::Admitted {
                        state: CircuitState::HalfOpen,
                    };
                }
                return CircuitDecision::Blocked {
                    detail: "domain temporarily blocked".into(),
                };
            }
            return CircuitDecision::Admitted { state };
        }

        let mut circuits = self.circuits.lock().expect("breaker lock poisoned");
        let circuit = circuits
            .entry(Self::key(domain, tenant_id))
            .or_default();
        if circuit.state == CircuitState::Open {
            if now_ts - circuit.opened_at >= self.open_interval_seconds {
                circuit.state = CircuitState::HalfOpen;
                return CircuitDecision::Admitted {
                    state: CircuitState::HalfOpen,
                };
            }
            return CircuitDecision::Blocked {
                detail: "domain temporarily blocked".into(),
            };
        }
        CircuitDecision::Admitted {
            state: circuit.state,
        }
    }

    /// Record a failed exchange; may open the circuit.
    pub fn record_failure(
        &self,
        domain: &str,
        tenant_id: Option<&str>,
        now: Option<f64>,
    ) -> CircuitState {
        let now_ts = now.unwrap_or_else(unix_now);

        if let Some(store) = &self.store {
            let snapshot = store
                .get_circuit(domain, tenant_id)
                .unwrap_or(predator_store::CircuitSnapshot {
                    state: CircuitStateTag::Closed,
                    opened_at: 0.0,
                });
            let state = CircuitState::from(snapshot.state);
            let _ = store.add_circuit_failure(domain, tenant_id, now_ts);
            let _ =
                store.prune_circuit_failures(domain, tenant_id, now_ts - self.window_seconds);
            let count = store
                .count_circuit_failures(domain, tenant_id, now_ts - self.window_seconds)
                .unwrap_or(0);
            if count >= self.threshold || state == CircuitState::HalfOpen {
                let _ = store.set_circuit(domain, tenant_id, CircuitStateTag::Open, now_ts);
                info!(domain, ?tenant_id, failures = count, "circuit opened");
                return CircuitState::Open;
            }
            return state;
        }

        let mut circuits = self.circuits.lock().expect("breaker lock poisoned");
        let circuit = circuits
            .entry(Self::key(domain, tenant_id))
            .or_default();
        let cutoff = now_ts - self.window_seconds;
        while circuit.recent_failures.front().is_some_and(|ts| *ts < cutoff) {
            circuit.recent_failures.pop_front();
        }
        circuit.recent_failures.push_back(now_ts);

        if circuit.recent_failures.len() as u64 >= self.threshold
            || circuit.state == CircuitState::HalfOpen
        {
            circuit.state = CircuitState::Open;
            circuit.opened_at = now_ts;
            info!(domain, ?tenant_id, "circuit opened");
        }
        circuit.state
    }

    /// Record a successful exchange; a half-open success closes the circuit.
    pub fn record_success(&self, domain: &str, tenant_id: Option<&str>) -> CircuitState {
        if let Some(store) = &self.store {
            let snapshot = store
                .get_circuit(domain, tenant_id)
                .unwrap_or(predator_store::CircuitSnapshot {
                    state: CircuitStateTag::Closed,
                    opened_at: 0.0,
                });
            let state = CircuitState::from(snapshot.state);
            if state == CircuitState::HalfOpen {
                let _ = store.set_circuit(domain, tenant_id, CircuitStateTag::Closed, 0.0);
                let _ = store.clear_circuit_failures(domain, tenant_id);
                return CircuitState::Closed;
            }
            return state;
        }

        let mut circuits = self.circuits.lock().expect("breaker lock poisoned");
        let circuit = circuits
            .entry(Self::key(domain, tenant_id))
            .or_default();
        if circuit.state == CircuitState::HalfOpen {
            circuit.state = CircuitState::Closed;
            circuit.recent_failures.clear();
        }
        circuit.state
    }

    /// Snapshot every tracked circuit, keyed by `tenant::domain`.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, CircuitInfo> {
        let now_ts = unix_now();
        if let Some(store) = &self.store {
            let mut out = BTreeMap::new();
            for key in store.list_circuit_domains().unwrap_or_default() {
                let snapshot = store.get_circuit(&key, None).unwrap_or(
                    predator_store::CircuitSnapshot {
                        state: CircuitStateTag::Closed,
                        opened_at: 0.0,
                    },
                );
                let count = store
                    .count_circuit_failures(&key, None, now_ts - self.window_seconds)
                    .unwrap_or(0);
                out.insert(
                    key,
                    CircuitInfo {
                        state: snapshot.state.into(),
                        recent_failures: count,
                        opened_at: snapshot.opened_at,
                    },
                );
            }
            return out;
        }

        let mut circuits = self.circuits.lock().expect("breaker lock poisoned");
        let mut out = BTreeMap::new();
        for (key, circuit) in circuits.iter_mut() {
            let cutoff = now_ts - self.window_seconds;
            while circuit.recent_failures.front().is_some_and(|ts| *ts < cutoff) {
                circuit.recent_failures.pop_front();
            }
            out.insert(
                key.clone(),
                CircuitInfo {
                    state: circuit.state,
                    recent_failures: circuit.recent_failures.len() as u64,
                    opened_at: circuit.opened_at,
                },
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_failures_open_the_circuit() {
        let breaker = DomainCircuitBreaker::with_policy(3, 120.0, 60.0, None);
        let base = 1_000.0;
        for i in 0..2 {
            assert_eq!(
                breaker.record_failure("host", Some("t1"), Some(base + i as f64)),
                CircuitState::Closed
            );
        }
        assert_eq!(
            breaker.record_failure("host", Some("t1"), Some(base + 2.0)),
            CircuitState::Open
        );
        assert!(!breaker.allow("host", Some("t1"), Some(base + 3.0)).is_admitted());
    }

    #[test]
    fn open_interval_elapsing_half_opens() {
        let breaker = DomainCircuitBreaker::with_policy(1, 120.0, 60.0, None);
        breaker.record_failure("host", None, Some(0.0));
        assert!(!breaker.allow("host", None, Some(30.0)).is_admitted());
        let decision = breaker.allow("host", None, Some(61.0));
        assert_eq!(
            decision,
            CircuitDecision::Admitted {
                state: CircuitState::HalfOpen
            }
        );
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let breaker = DomainCircuitBreaker::with_policy(10, 120.0, 60.0, None);
        // Force open with a burst, then move to half-open.
        for i in 0..10 {
            breaker.record_failure("host", None, Some(i as f64));
        }
        assert!(breaker.allow("host", None, Some(70.0)).is_admitted());
        assert_eq!(
            breaker.record_failure("host", None, Some(71.0)),
            CircuitState::Open
        );
    }

    #[test]
    fn half_open_success_closes_and_clears() {
        let breaker = DomainCircuitBreaker::with_policy(1, 120.0, 60.0, None);
        breaker.record_failure("host", None, Some(0.0));
        assert!(breaker.allow("host", None, Some(61.0)).is_admitted());
        assert_eq!(breaker.record_success("host", None), CircuitState::Closed);
        assert!(breaker.allow("host", None, Some(62.0)).is_admitted());
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot["host"].state, CircuitState::Closed);
    }

    #[test]
    fn tenants_do_not_share_circuits() {
        let breaker = DomainCircuitBreaker::with_policy(2, 120.0, 60.0, None);
        breaker.record_failure("host", Some("tenant-a"), Some(0.0));
        breaker.record_failure("host", Some("tenant-a"), Some(1.0));
        assert!(!breaker.allow("host", Some("tenant-a"), Some(2.0)).is_admitted());
        assert!(breaker.allow("host", Some("tenant-b"), Some(2.0)).is_admitted());
    }

    #[test]
    fn store_backed_state_is_shared_between_breakers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            predator_store::ControlPlaneStore::open(dir.path().join("control.db")).unwrap(),
        );
        let a = DomainCircuitBreaker::with_policy(1, 120.0, 60.0, Some(Arc::clone(&store)));
        let b = DomainCircuitBreaker::with_policy(1, 120.0, 60.0, Some(store));

        a.record_failure("host", Some("t1"), Some(10.0));
        assert!(!b.allow("host", Some("t1"), Some(11.0)).is_admitted());
    }
}
