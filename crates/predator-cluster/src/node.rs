// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution nodes and their admission SLOs.
//!
//! A node is in drain mode (`admit == false`) whenever any SLO is
//! violated: active sessions, inflight actions, loop lag p95, open file
//! descriptors, RSS, or the breaker-open ratio. Workflow affinity may
//! still pin new actions to a draining node; they stay queued until it
//! admits again.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;

use predator_audit::{AuditRecord, ChainOutcome};
use predator_core::{
    ActionContract, ActionExecutionResult, ArtifactRecord, FailureCode, SecurityPolicy,
};
use predator_engine::PredatorEngine;
use predator_quota::TenantQuota;
use predator_session::TabInfo;

use crate::ClusterError;

const LAG_SAMPLE_WINDOW: usize = 80;

/// Admission service-level objectives for one node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeAdmissionSlo {
    /// Maximum live sessions.
    pub max_active_sessions: u64,
    /// Maximum actions executing at once.
    pub max_inflight_actions: usize,
    /// Maximum p95 of monitor loop lag.
    pub max_loop_lag_p95_ms: f64,
    /// Maximum open file descriptors.
    pub max_fd_count: i64,
    /// Maximum resident set size.
    pub max_rss_mb: f64,
    /// Maximum open circuits / tracked circuits.
    pub max_breaker_open_ratio: f64,
}

impl Default for NodeAdmissionSlo {
    fn default() -> Self {
        Self {
            max_active_sessions: 120,
            max_inflight_actions: 120,
            max_loop_lag_p95_ms: 1_200.0,
            max_fd_count: 1_024,
            max_rss_mb: 1_024.0,
            max_breaker_open_ratio: 0.50,
        }
    }
}

impl NodeAdmissionSlo {
    /// Overlay `PREDATOR_SLO_*` environment variables on the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|raw| raw.parse().ok())
        }
        let mut slo = Self::default();
        if let Some(value) = parse("PREDATOR_SLO_MAX_ACTIVE_SESSIONS") {
            slo.max_active_sessions = value;
        }
        if let Some(value) = parse("PREDATOR_SLO_MAX_INFLIGHT_ACTIONS") {
            slo.max_inflight_actions = value;
        }
        if let Some(value) = parse("PREDATOR_SLO_MAX_LOOP_LAG_P95_MS") {
            slo.max_loop_lag_p95_ms = value;
        }
        if let Some(value) = parse("PREDATOR_SLO_MAX_FD_COUNT") {
            slo.max_fd_count = value;
        }
        if let Some(value) = parse("PREDATOR_SLO_MAX_RSS_MB") {
            slo.max_rss_mb = value;
        }
        if let Some(value) = parse("PREDATOR_SLO_MAX_BREAKER_OPEN_RATIO") {
            slo.max_breaker_open_ratio = value;
        }
        slo
    }
}

/// Point-in-time view of one node's admission state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Shard index.
    pub node_id: usize,
    /// Whether the node admits new work.
    pub admit: bool,
    /// Whether any SLO is currently violated.
    pub drain_mode: bool,
    /// Violated SLO names.
    pub reasons: Vec<String>,
    /// Actions executing right now.
    pub inflight_actions: usize,
    /// Live sessions.
    pub active_sessions: u64,
    /// Circuits currently open.
    pub open_circuits: u64,
    /// Open circuits / tracked circuits.
    pub breaker_open_ratio: f64,
    /// p95 of monitor loop lag.
    pub loop_lag_p95_ms: f64,
    /// Open file descriptors; `-1` when unreadable.
    pub fd_count: i64,
    /// Resident set size.
    pub rss_mb: f64,
    /// Engine health status string.
    pub status: String,
}

impl NodeSnapshot {
    fn initial(node_id: usize) -> Self {
        Self {
            node_id,
            admit: true,
            drain_mode: false,
            reasons: vec![],
            inflight_actions: 0,
            active_sessions: 0,
            open_circuits: 0,
            breaker_open_ratio: 0.0,
            loop_lag_p95_ms: 0.0,
            fd_count: fd_count(),
            rss_mb: rss_mb(),
            status: "initializing".into(),
        }
    }
}

fn fd_count() -> i64 {
    for path in ["/proc/self/fd", "/dev/fd"] {
        if let Ok(entries) = std::fs::read_dir(Path::new(path)) {
            return entries.count() as i64;
        }
    }
    -1
}

fn rss_mb() -> f64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0.0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: f64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0.0);
            return kb / 1024.0;
        }
    }
    0.0
}

fn p95(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut ordered: Vec<f64> = samples.iter().copied().collect();
    ordered.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = (((ordered.len() - 1) as f64) * 0.95).round() as usize;
    ordered[index.min(ordered.len() - 1)]
}

/// One schedulable executor in the cluster.
#[async_trait]
pub trait ExecutionNode: Send + Sync {
    /// Shard index of this node.
    fn node_id(&self) -> usize;

    /// Start background work (monitors, pool warm-up).
    async fn initialize(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    /// Stop background work and release resources.
    async fn close(&self) {}

    /// Whether the node currently admits new work.
    fn can_admit(&self) -> bool;

    /// Maximum actions the scheduler may keep inflight on this node.
    fn admission_limit(&self) -> usize;

    /// Current admission snapshot.
    fn snapshot(&self) -> NodeSnapshot;

    /// Execute one contract. Node-internal faults become
    /// `SHARD_NODE_EXECUTION_ERROR` results, never panics or errors.
    async fn execute_contract(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
        contract: &ActionContract,
    ) -> ActionExecutionResult;

    /// Close a workflow's session on this node.
    async fn close_workflow_session(&self, _workflow_id: &str) {}

    /// Verify a workflow's audit chain.
    async fn verify_audit_chain(
        &self,
        _tenant_id: &str,
        _workflow_id: &str,
    ) -> Result<ChainOutcome, ClusterError> {
        Err(ClusterError::Unsupported)
    }

    /// Ordered audit records for a workflow.
    async fn get_replay_trace(
        &self,
        _tenant_id: &str,
        _workflow_id: &str,
    ) -> Result<Vec<AuditRecord>, ClusterError> {
        Err(ClusterError::Unsupported)
    }

    /// Current snapshot projection for a workflow.
    async fn get_structured_state(
        &self,
        _tenant_id: &str,
        _workflow_id: &str,
        _policy: SecurityPolicy,
    ) -> Result<Value, ClusterError> {
        Err(ClusterError::Unsupported)
    }

    /// Open a tab for a workflow.
    async fn open_tab(
        &self,
        _tenant_id: &str,
        _workflow_id: &str,
        _policy: SecurityPolicy,
        _url: &str,
    ) -> Result<String, ClusterError> {
        Err(ClusterError::Unsupported)
    }

    /// Switch a workflow's active tab.
    async fn switch_tab(&self, _workflow_id: &str, _tab_id: &str) -> Result<(), ClusterError> {
        Err(ClusterError::Unsupported)
    }

    /// List a workflow's tabs.
    async fn list_tabs(&self, _workflow_id: &str) -> Vec<TabInfo> {
        vec![]
    }

    /// Register an upload artifact, charging tenant quota.
    async fn register_upload_artifact(
        &self,
        _tenant_id: &str,
        _workflow_id: &str,
        _action_id: &str,
        _source_path: &Path,
    ) -> Result<ArtifactRecord, ClusterError> {
        Err(ClusterError::Unsupported)
    }

    /// Set a tenant's quota on this node.
    fn set_tenant_quota(&self, _tenant_id: &str, _quota: TenantQuota) {}
}

#[derive(Debug)]
struct NodeShared {
    inflight: AtomicUsize,
    lag_samples: Mutex<VecDeque<f64>>,
    snapshot: Mutex<NodeSnapshot>,
}

async fn refresh_snapshot(
    node_id: usize,
    engine: &PredatorEngine,
    slo: &NodeAdmissionSlo,
    shared: &NodeShared,
) {
    let health = engine.get_health().await;
    let total_circuits = health.circuits.len();
    let breaker_ratio = if total_circuits > 0 {
        health.open_circuits as f64 / total_circuits as f64
    } else {
        0.0
    };
    let lag_p95 = p95(&shared.lag_samples.lock().expect("lag lock poisoned"));
    let fd = fd_count();
    let rss = rss_mb();
    let inflight = shared.inflight.load(Ordering::SeqCst);

    let mut reasons = Vec::new();
    if inflight >= slo.max_inflight_actions {
        reasons.push("inflight_limit".to_string());
    }
    if health.active_sessions > slo.max_active_sessions {
        reasons.push("active_sessions".to_string());
    }
    if lag_p95 > slo.max_loop_lag_p95_ms {
        reasons.push("loop_lag".to_string());
    }
    if fd >= 0 && fd > slo.max_fd_count {
        reasons.push("fd_count".to_string());
    }
    if rss > slo.max_rss_mb {
        reasons.push("rss_mb".to_string());
    }
    if breaker_ratio > slo.max_breaker_open_ratio {
        reasons.push("breaker_open_ratio".to_string());
    }

    let drain_mode = !reasons.is_empty();
    if drain_mode {
        warn!(node_id, ?reasons, "node in drain mode");
    }
    *shared.snapshot.lock().expect("snapshot lock poisoned") = NodeSnapshot {
        node_id,
        admit: !drain_mode,
        drain_mode,
        reasons,
        inflight_actions: inflight,
        active_sessions: health.active_sessions,
        open_circuits: health.open_circuits,
        breaker_open_ratio: breaker_ratio,
        loop_lag_p95_ms: lag_p95,
        fd_count: fd,
        rss_mb: rss,
        status: health.status,
    };
}

/// An [`ExecutionNode`] backed by a [`PredatorEngine`].
pub struct EngineNode {
    node_id: usize,
    engine: Arc<PredatorEngine>,
    slo: NodeAdmissionSlo,
    monitor_interval: Duration,
    shared: Arc<NodeShared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EngineNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineNode")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl EngineNode {
    /// Wrap an engine as a schedulable node.
    #[must_use]
    pub fn new(
        node_id: usize,
        engine: Arc<PredatorEngine>,
        slo: NodeAdmissionSlo,
        monitor_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            engine,
            slo,
            monitor_interval: monitor_interval.max(Duration::from_millis(50)),
            shared: Arc::new(NodeShared {
                inflight: AtomicUsize::new(0),
                lag_samples: Mutex::new(VecDeque::with_capacity(LAG_SAMPLE_WINDOW)),
                snapshot: Mutex::new(NodeSnapshot::initial(node_id)),
            }),
            monitor: Mutex::new(None),
        })
    }
}

#[async_trait]
impl ExecutionNode for EngineNode {
    fn node_id(&self) -> usize {
        self.node_id
    }

    async fn initialize(&self) -> Result<(), ClusterError> {
        self.engine
            .initialize()
            .await
            .map_err(|error| ClusterError::Node(error.to_string()))?;

        let node_id = self.node_id;
        let engine = Arc::clone(&self.engine);
        let slo = self.slo;
        let shared = Arc::clone(&self.shared);
        let interval = self.monitor_interval;
        let handle = tokio::spawn(async move {
            let mut next_tick = tokio::time::Instant::now() + interval;
            loop {
                tokio::time::sleep(interval).await;
                let now = tokio::time::Instant::now();
                let lag_ms = now
                    .saturating_duration_since(next_tick)
                    .as_secs_f64()
                    * 1_000.0;
                next_tick = now + interval;
                {
                    let mut samples = shared.lag_samples.lock().expect("lag lock poisoned");
                    samples.push_back(lag_ms);
                    while samples.len() > LAG_SAMPLE_WINDOW {
                        samples.pop_front();
                    }
                }
                refresh_snapshot(node_id, &engine, &slo, &shared).await;
            }
        });
        *self.monitor.lock().expect("monitor lock poisoned") = Some(handle);
        refresh_snapshot(self.node_id, &self.engine, &self.slo, &self.shared).await;
        Ok(())
    }

    async fn close(&self) {
        if let Some(handle) = self.monitor.lock().expect("monitor lock poisoned").take() {
            handle.abort();
        }
        self.engine.close().await;
    }

    fn can_admit(&self) -> bool {
        self.shared
            .snapshot
            .lock()
            .expect("snapshot lock poisoned")
            .admit
    }

    fn admission_limit(&self) -> usize {
        self.slo.max_inflight_actions.max(1)
    }

    fn snapshot(&self) -> NodeSnapshot {
        self.shared
            .snapshot
            .lock()
            .expect("snapshot lock poisoned")
            .clone()
    }

    async fn execute_contract(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
        contract: &ActionContract,
    ) -> ActionExecutionResult {
        self.shared.inflight.fetch_add(1, Ordering::SeqCst);
        let result = self
            .engine
            .execute_contract(tenant_id, workflow_id, policy, contract)
            .await;
        self.shared.inflight.fetch_sub(1, Ordering::SeqCst);
        refresh_snapshot(self.node_id, &self.engine, &self.slo, &self.shared).await;
        match result {
            Ok(result) => result,
            Err(error) => {
                let action_id = contract
                    .action_id()
                    .unwrap_or_else(|_| "act_unknown".into());
                let mut failure = ActionExecutionResult::failure(
                    &action_id,
                    FailureCode::ShardNodeExecutionError,
                    error.to_string(),
                );
                failure.metadata = serde_json::json!({"exception": error.to_string()});
                failure
            }
        }
    }

    async fn close_workflow_session(&self, workflow_id: &str) {
        self.engine.close_workflow_session(workflow_id).await;
    }

    async fn verify_audit_chain(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<ChainOutcome, ClusterError> {
        self.engine
            .verify_audit_chain(tenant_id, workflow_id)
            .await
            .map_err(|error| ClusterError::Node(error.to_string()))
    }

    async fn get_replay_trace(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<AuditRecord>, ClusterError> {
        self.engine
            .get_replay_trace(tenant_id, workflow_id)
            .await
            .map_err(|error| ClusterError::Node(error.to_string()))
    }

    async fn get_structured_state(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
    ) -> Result<Value, ClusterError> {
        self.engine
            .get_structured_state(tenant_id, workflow_id, policy)
            .await
            .map_err(|error| ClusterError::Node(error.to_string()))
    }

    async fn open_tab(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
        url: &str,
    ) -> Result<String, ClusterError> {
        self.engine
            .open_tab(tenant_id, workflow_id, policy, url)
            .await
            .map_err(|error| ClusterError::Node(error.to_string()))
    }

    async fn switch_tab(&self, workflow_id: &str, tab_id: &str) -> Result<(), ClusterError> {
        self.engine
            .switch_tab(workflow_id, tab_id)
            .await
            .map_err(|error| ClusterError::Node(error.to_string()))
    }

    async fn list_tabs(&self, workflow_id: &str) -> Vec<TabInfo> {
        self.engine.list_tabs(workflow_id).await
    }

    async fn register_upload_artifact(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        action_id: &str,
        source_path: &Path,
    ) -> Result<ArtifactRecord, ClusterError> {
        self.engine
            .register_upload_artifact(tenant_id, workflow_id, action_id, source_path)
            .await
            .map_err(|error| ClusterError::Node(error.to_string()))
    }

    fn set_tenant_quota(&self, tenant_id: &str, quota: TenantQuota) {
        self.engine.set_tenant_quota(tenant_id, quota);
    }
}
