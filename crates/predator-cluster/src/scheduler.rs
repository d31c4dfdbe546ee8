// SPDX-License-Identifier: MIT OR Apache-2.0

//! The sharded scheduler: affinity routing, weighted per-tenant fair
//! queues, and the dispatch loop.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use predator_audit::{AuditRecord, ChainOutcome};
use predator_core::{ActionContract, ActionExecutionResult, ArtifactRecord, SecurityPolicy};
use predator_driver::BrowserDriver;
use predator_engine::{EngineConfig, PredatorEngine};
use predator_quota::TenantQuota;
use predator_session::TabInfo;

use crate::node::{EngineNode, ExecutionNode, NodeAdmissionSlo, NodeSnapshot};
use crate::{ClusterError, WorkClass, classify_work_class, shard_index};

/// Scheduler-level settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSchedulerConfig {
    /// Number of shards (single-node engines).
    pub shard_count: usize,
    /// Dispatch-loop cadence when idle.
    pub dispatch_interval: Duration,
    /// Node monitor sampling interval.
    pub monitor_interval: Duration,
    /// Light-class weight in the class cycle.
    pub light_weight: usize,
    /// Heavy-class weight in the class cycle.
    pub heavy_weight: usize,
}

impl Default for ClusterSchedulerConfig {
    fn default() -> Self {
        Self {
            shard_count: 3,
            dispatch_interval: Duration::from_millis(20),
            monitor_interval: Duration::from_millis(250),
            light_weight: 3,
            heavy_weight: 1,
        }
    }
}

impl ClusterSchedulerConfig {
    /// Overlay `PREDATOR_CLUSTER_*` environment variables on the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|raw| raw.parse().ok())
        }
        let mut config = Self::default();
        if let Some(value) = parse("PREDATOR_CLUSTER_SHARD_COUNT") {
            config.shard_count = value;
        }
        if let Some(value) = parse::<u64>("PREDATOR_CLUSTER_DISPATCH_INTERVAL_MS") {
            config.dispatch_interval = Duration::from_millis(value);
        }
        if let Some(value) = parse::<u64>("PREDATOR_CLUSTER_MONITOR_INTERVAL_MS") {
            config.monitor_interval = Duration::from_millis(value);
        }
        if let Some(value) = parse("PREDATOR_CLUSTER_LIGHT_WEIGHT") {
            config.light_weight = value;
        }
        if let Some(value) = parse("PREDATOR_CLUSTER_HEAVY_WEIGHT") {
            config.heavy_weight = value;
        }
        config
    }

    fn class_cycle(&self) -> Vec<WorkClass> {
        let mut cycle = vec![WorkClass::Light; self.light_weight.max(1)];
        cycle.extend(vec![WorkClass::Heavy; self.heavy_weight.max(1)]);
        cycle
    }
}

struct QueuedAction {
    tenant_id: String,
    workflow_id: String,
    policy: SecurityPolicy,
    contract: ActionContract,
    responder: oneshot::Sender<ActionExecutionResult>,
}

#[derive(Default)]
struct TenantQueues {
    queues: HashMap<String, VecDeque<QueuedAction>>,
    rotation: VecDeque<String>,
}

impl TenantQueues {
    fn push(&mut self, item: QueuedAction) {
        if !self.queues.contains_key(&item.tenant_id) {
            self.rotation.push_back(item.tenant_id.clone());
        }
        self.queues
            .entry(item.tenant_id.clone())
            .or_default()
            .push_back(item);
    }

    fn pop_round_robin(&mut self) -> Option<QueuedAction> {
        let attempts = self.rotation.len();
        for _ in 0..attempts {
            let tenant = self.rotation.front()?.clone();
            self.rotation.rotate_left(1);
            let Some(queue) = self.queues.get_mut(&tenant) else {
                self.rotation.retain(|candidate| candidate != &tenant);
                continue;
            };
            let Some(item) = queue.pop_front() else {
                self.queues.remove(&tenant);
                self.rotation.retain(|candidate| candidate != &tenant);
                continue;
            };
            if queue.is_empty() {
                self.queues.remove(&tenant);
                self.rotation.retain(|candidate| candidate != &tenant);
            }
            return Some(item);
        }
        None
    }

    fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }
}

#[derive(Default)]
struct ShardQueues {
    light: TenantQueues,
    heavy: TenantQueues,
    class_index: usize,
}

impl ShardQueues {
    fn push(&mut self, work_class: WorkClass, item: QueuedAction) {
        match work_class {
            WorkClass::Light => self.light.push(item),
            WorkClass::Heavy => self.heavy.push(item),
        }
    }

    fn pop_next(&mut self, cycle: &[WorkClass]) -> Option<QueuedAction> {
        if cycle.is_empty() {
            return None;
        }
        let start = self.class_index % cycle.len();
        for offset in 0..cycle.len() {
            let work_class = cycle[(start + offset) % cycle.len()];
            let source = match work_class {
                WorkClass::Light => &mut self.light,
                WorkClass::Heavy => &mut self.heavy,
            };
            if let Some(item) = source.pop_round_robin() {
                self.class_index = (start + offset + 1) % cycle.len();
                return Some(item);
            }
        }
        self.light
            .pop_round_robin()
            .or_else(|| self.heavy.pop_round_robin())
    }

    fn len(&self) -> usize {
        self.light.len() + self.heavy.len()
    }
}

struct ClusterShared {
    nodes: Vec<Arc<dyn ExecutionNode>>,
    queues: Mutex<HashMap<usize, ShardQueues>>,
    reserved: Mutex<HashMap<usize, usize>>,
    class_cycle: Vec<WorkClass>,
    notify: Notify,
    stopped: AtomicBool,
}

impl ClusterShared {
    fn queue_depth(&self, node_id: usize) -> usize {
        self.queues
            .lock()
            .expect("queue lock poisoned")
            .get(&node_id)
            .map_or(0, ShardQueues::len)
    }
}

async fn run_item(shared: Arc<ClusterShared>, node: Arc<dyn ExecutionNode>, item: QueuedAction) {
    let result = node
        .execute_contract(
            &item.tenant_id,
            &item.workflow_id,
            item.policy.clone(),
            &item.contract,
        )
        .await;
    let _ = item.responder.send(result);
    {
        let mut reserved = shared.reserved.lock().expect("reserved lock poisoned");
        let slot = reserved.entry(node.node_id()).or_insert(0);
        *slot = slot.saturating_sub(1);
    }
    shared.notify.notify_one();
}

async fn dispatch_loop(shared: Arc<ClusterShared>, interval: Duration) {
    let interval = interval.max(Duration::from_millis(10));
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut dispatched = false;
        for node in &shared.nodes {
            let node_id = node.node_id();
            let limit = node.admission_limit().max(1);
            loop {
                if !node.can_admit() {
                    break;
                }
                {
                    let reserved = shared.reserved.lock().expect("reserved lock poisoned");
                    if reserved.get(&node_id).copied().unwrap_or(0) >= limit {
                        break;
                    }
                }
                let item = {
                    let mut queues = shared.queues.lock().expect("queue lock poisoned");
                    queues
                        .get_mut(&node_id)
                        .and_then(|shard| shard.pop_next(&shared.class_cycle))
                };
                let Some(item) = item else {
                    break;
                };
                dispatched = true;
                {
                    let mut reserved = shared.reserved.lock().expect("reserved lock poisoned");
                    *reserved.entry(node_id).or_insert(0) += 1;
                }
                debug!(node_id, tenant_id = %item.tenant_id, "dispatching action");
                tokio::spawn(run_item(Arc::clone(&shared), Arc::clone(node), item));
            }
        }

        if dispatched {
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                () = shared.notify.notified() => {}
                () = tokio::time::sleep(interval) => {}
            }
        }
    }
}

/// Health row for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Admission snapshot.
    pub snapshot: NodeSnapshot,
    /// Actions queued for this shard.
    pub queue_depth: usize,
}

/// Aggregate cluster health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// `healthy` or `degraded` (any draining node degrades).
    pub status: String,
    /// Number of shards.
    pub shard_count: usize,
    /// Sessions across all nodes.
    pub total_active_sessions: u64,
    /// Open circuits across all nodes.
    pub total_open_circuits: u64,
    /// Queued actions across all shards.
    pub total_queue_depth: usize,
    /// Pinned workflows.
    pub workflow_affinity_size: usize,
    /// Per-node detail.
    pub nodes: Vec<NodeHealth>,
}

/// A fixed-shard pool of execution nodes with fair scheduling.
pub struct ShardedCluster {
    config: ClusterSchedulerConfig,
    shared: Arc<ClusterShared>,
    node_by_id: HashMap<usize, Arc<dyn ExecutionNode>>,
    affinity: Mutex<HashMap<String, usize>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ShardedCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedCluster")
            .field("shard_count", &self.shared.nodes.len())
            .finish()
    }
}

fn node_path(base: &Path, node_id: usize) -> PathBuf {
    if base.extension().is_some_and(|ext| ext == "db") {
        let stem = base
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("control");
        base.with_file_name(format!("{stem}.node{node_id}.db"))
    } else {
        base.join(format!("node-{node_id}"))
    }
}

impl ShardedCluster {
    /// Build a cluster over externally constructed nodes.
    #[must_use]
    pub fn new(config: ClusterSchedulerConfig, nodes: Vec<Arc<dyn ExecutionNode>>) -> Self {
        let node_by_id = nodes
            .iter()
            .map(|node| (node.node_id(), Arc::clone(node)))
            .collect();
        let class_cycle = config.class_cycle();
        Self {
            config,
            shared: Arc::new(ClusterShared {
                nodes,
                queues: Mutex::new(HashMap::new()),
                reserved: Mutex::new(HashMap::new()),
                class_cycle,
                notify: Notify::new(),
                stopped: AtomicBool::new(false),
            }),
            node_by_id,
            affinity: Mutex::new(HashMap::new()),
            dispatch: Mutex::new(None),
        }
    }

    /// Build `shard_count` engine-backed nodes over one browser driver,
    /// isolating each node's roots and control-plane database.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Node`] when an engine cannot be built.
    pub fn with_engine_nodes(
        browser: Arc<dyn BrowserDriver>,
        base: &EngineConfig,
        config: ClusterSchedulerConfig,
        slo: NodeAdmissionSlo,
    ) -> Result<Self, ClusterError> {
        let mut nodes: Vec<Arc<dyn ExecutionNode>> = Vec::new();
        for node_id in 0..config.shard_count.max(1) {
            let node_config = EngineConfig {
                session: base.session.clone(),
                artifact_root: node_path(&base.artifact_root, node_id),
                audit_root: node_path(&base.audit_root, node_id),
                control_db_path: node_path(&base.control_db_path, node_id),
                telemetry_dir: node_path(&base.telemetry_dir, node_id),
                default_quota: base.default_quota,
                chaos: base.chaos.clone(),
            };
            let engine = PredatorEngine::new(Arc::clone(&browser), node_config)
                .map_err(|error| ClusterError::Node(error.to_string()))?;
            nodes.push(EngineNode::new(
                node_id,
                Arc::new(engine),
                slo,
                config.monitor_interval,
            ));
        }
        Ok(Self::new(config, nodes))
    }

    /// Initialize every node and start the dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns the first node initialization failure.
    pub async fn initialize(&self) -> Result<(), ClusterError> {
        if self.shared.nodes.is_empty() {
            return Err(ClusterError::NotInitialized);
        }
        for node in &self.shared.nodes {
            node.initialize().await?;
        }
        self.shared.stopped.store(false, Ordering::SeqCst);
        let handle = tokio::spawn(dispatch_loop(
            Arc::clone(&self.shared),
            self.config.dispatch_interval,
        ));
        *self.dispatch.lock().expect("dispatch lock poisoned") = Some(handle);
        info!(shards = self.shared.nodes.len(), "cluster initialized");
        Ok(())
    }

    /// Stop the dispatcher and close every node.
    pub async fn close(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
        let handle = self.dispatch.lock().expect("dispatch lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for node in &self.shared.nodes {
            node.close().await;
        }
    }

    fn pinned_node_id(&self, tenant_id: &str, workflow_id: &str) -> usize {
        let mut affinity = self.affinity.lock().expect("affinity lock poisoned");
        *affinity
            .entry(workflow_id.to_string())
            .or_insert_with(|| shard_index(tenant_id, workflow_id, self.shared.nodes.len()))
    }

    fn resolve_node(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<Arc<dyn ExecutionNode>, ClusterError> {
        if self.shared.nodes.is_empty() {
            return Err(ClusterError::NotInitialized);
        }
        let node_id = self.pinned_node_id(tenant_id, workflow_id);
        self.node_by_id
            .get(&node_id)
            .cloned()
            .ok_or(ClusterError::NotInitialized)
    }

    /// Route and enqueue one contract, awaiting its result.
    ///
    /// # Errors
    ///
    /// [`ClusterError::NotInitialized`] before `initialize`, or
    /// [`ClusterError::Node`] when the dispatcher drops the action.
    pub async fn execute_contract(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
        contract: ActionContract,
    ) -> Result<ActionExecutionResult, ClusterError> {
        if self.shared.nodes.is_empty() {
            return Err(ClusterError::NotInitialized);
        }
        let node_id = self.pinned_node_id(tenant_id, workflow_id);
        let work_class = classify_work_class(&contract);
        let (responder, receiver) = oneshot::channel();
        {
            let mut queues = self.shared.queues.lock().expect("queue lock poisoned");
            queues.entry(node_id).or_default().push(
                work_class,
                QueuedAction {
                    tenant_id: tenant_id.to_string(),
                    workflow_id: workflow_id.to_string(),
                    policy,
                    contract,
                    responder,
                },
            );
        }
        self.shared.notify.notify_one();
        receiver
            .await
            .map_err(|_| ClusterError::Node("dispatcher dropped the action".into()))
    }

    /// The shard a workflow routes to (pinning it if new).
    ///
    /// # Errors
    ///
    /// [`ClusterError::NotInitialized`] before nodes exist.
    pub fn shard_for(&self, tenant_id: &str, workflow_id: &str) -> Result<usize, ClusterError> {
        if self.shared.nodes.is_empty() {
            return Err(ClusterError::NotInitialized);
        }
        Ok(self.pinned_node_id(tenant_id, workflow_id))
    }

    /// Register an upload artifact on the workflow's shard.
    ///
    /// # Errors
    ///
    /// Propagates node errors.
    pub async fn register_upload_artifact(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        action_id: &str,
        source_path: &Path,
    ) -> Result<ArtifactRecord, ClusterError> {
        self.resolve_node(tenant_id, workflow_id)?
            .register_upload_artifact(tenant_id, workflow_id, action_id, source_path)
            .await
    }

    /// Verify a workflow's audit chain on its shard.
    ///
    /// # Errors
    ///
    /// Propagates node errors.
    pub async fn verify_audit_chain(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<ChainOutcome, ClusterError> {
        self.resolve_node(tenant_id, workflow_id)?
            .verify_audit_chain(tenant_id, workflow_id)
            .await
    }

    /// The ordered audit records for a workflow.
    ///
    /// # Errors
    ///
    /// Propagates node errors.
    pub async fn get_replay_trace(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<AuditRecord>, ClusterError> {
        self.resolve_node(tenant_id, workflow_id)?
            .get_replay_trace(tenant_id, workflow_id)
            .await
    }

    /// Current snapshot projection for a workflow.
    ///
    /// # Errors
    ///
    /// Propagates node errors.
    pub async fn get_structured_state(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
    ) -> Result<Value, ClusterError> {
        self.resolve_node(tenant_id, workflow_id)?
            .get_structured_state(tenant_id, workflow_id, policy)
            .await
    }

    /// Open a tab for a workflow on its shard.
    ///
    /// # Errors
    ///
    /// Propagates node errors.
    pub async fn open_tab(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
        url: &str,
    ) -> Result<String, ClusterError> {
        self.resolve_node(tenant_id, workflow_id)?
            .open_tab(tenant_id, workflow_id, policy, url)
            .await
    }

    /// Switch a workflow's active tab. Requires existing affinity.
    ///
    /// # Errors
    ///
    /// [`ClusterError::NoAffinity`] for an unpinned workflow.
    pub async fn switch_tab(&self, workflow_id: &str, tab_id: &str) -> Result<(), ClusterError> {
        let node_id = self
            .affinity
            .lock()
            .expect("affinity lock poisoned")
            .get(workflow_id)
            .copied()
            .ok_or_else(|| ClusterError::NoAffinity(workflow_id.to_string()))?;
        let node = self
            .node_by_id
            .get(&node_id)
            .cloned()
            .ok_or(ClusterError::NotInitialized)?;
        node.switch_tab(workflow_id, tab_id).await
    }

    /// List a workflow's tabs; empty for unpinned workflows.
    pub async fn list_tabs(&self, workflow_id: &str) -> Vec<TabInfo> {
        let node_id = self
            .affinity
            .lock()
            .expect("affinity lock poisoned")
            .get(workflow_id)
            .copied();
        match node_id.and_then(|id| self.node_by_id.get(&id).cloned()) {
            Some(node) => node.list_tabs(workflow_id).await,
            None => vec![],
        }
    }

    /// Close a workflow's session and release its affinity.
    pub async fn close_workflow_session(&self, workflow_id: &str) {
        let node_id = self
            .affinity
            .lock()
            .expect("affinity lock poisoned")
            .remove(workflow_id);
        if let Some(node_id) = node_id
            && let Some(node) = self.node_by_id.get(&node_id)
        {
            node.close_workflow_session(workflow_id).await;
        }
    }

    /// Set a tenant's quota on every node.
    pub fn set_tenant_quota(&self, tenant_id: &str, quota: TenantQuota) {
        for node in &self.shared.nodes {
            node.set_tenant_quota(tenant_id, quota);
        }
    }

    /// Aggregate cluster health; any draining node degrades the cluster.
    #[must_use]
    pub fn get_health(&self) -> ClusterHealth {
        let snapshots: Vec<NodeSnapshot> = self
            .shared
            .nodes
            .iter()
            .map(|node| node.snapshot())
            .collect();
        let any_drain = snapshots.iter().any(|snapshot| snapshot.drain_mode);
        let nodes: Vec<NodeHealth> = snapshots
            .into_iter()
            .map(|snapshot| {
                let queue_depth = self.shared.queue_depth(snapshot.node_id);
                NodeHealth {
                    snapshot,
                    queue_depth,
                }
            })
            .collect();
        ClusterHealth {
            status: if any_drain { "degraded" } else { "healthy" }.into(),
            shard_count: nodes.len(),
            total_active_sessions: nodes
                .iter()
                .map(|node| node.snapshot.active_sessions)
                .sum(),
            total_open_circuits: nodes.iter().map(|node| node.snapshot.open_circuits).sum(),
            total_queue_depth: nodes.iter().map(|node| node.queue_depth).sum(),
            workflow_affinity_size: self.affinity.lock().expect("affinity lock poisoned").len(),
            nodes,
        }
    }
}
