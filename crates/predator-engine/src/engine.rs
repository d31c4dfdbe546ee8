// SPDX-License-Identifier: MIT OR Apache-2.0

//! Single-node engine: validation, quotas, leases, circuit breakers,
//! security, idempotency, budget, and audit around the action engine.
//!
//! One call executes one contract. Idempotency is two-tier: an in-memory
//! ledger keyed by action id, with the immutable audit trail as the
//! cross-process fallback. Every terminal outcome is audited and cached so
//! a re-submitted canonical contract short-circuits to the recorded result.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, instrument, warn};
use url::Url;

use predator_audit::{AuditError, AuditRecord, AuditTrail, ChainOutcome};
use predator_budget::{BudgetOutcome, ComponentTokenBudgets, TokenBudgetManager};
use predator_core::{
    ActionContract, ActionExecutionResult, ArtifactRecord, ContractValidator, FailureCode,
    GateDecision, SecurityPolicy,
};
use predator_driver::BrowserDriver;
use predator_quota::{CircuitDecision, CircuitInfo, DomainCircuitBreaker, HealthMonitor, QuotaManager, TenantQuota};
use predator_session::{BrowserSession, SessionManager, TabInfo};
use predator_store::{ControlPlaneStore, StoreError};

use crate::action::ActionEngine;
use crate::artifacts::{ArtifactError, ArtifactManager};
use crate::config::EngineConfig;
use crate::delta::DeltaTracker;
use crate::extract::{ExtractorBounds, StructuredStateExtractor};
use crate::navigator::Navigator;
use crate::security::SecurityLayer;
use crate::telemetry::{JsonlTelemetrySink, TelemetrySink};
use crate::verify::VerificationEngine;
use crate::waits::{ChaosPolicy, WaitManager};

/// Infrastructure faults from engine operations.
///
/// Action-level failures are values inside [`ActionExecutionResult`]; these
/// errors are the faults the node itself cannot absorb.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Control-plane store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Audit trail failure.
    #[error(transparent)]
    Audit(#[from] AuditError),
    /// Artifact manager failure.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    /// Result payload encoding failure.
    #[error("result serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
    /// Contract canonicalisation failure.
    #[error(transparent)]
    Contract(#[from] predator_core::ContractError),
    /// A quota gate denied an out-of-band operation.
    #[error("quota denied: {code}: {detail}")]
    QuotaDenied {
        /// Stable failure code.
        code: FailureCode,
        /// Human-readable detail.
        detail: String,
    },
    /// A security gate denied an out-of-band operation.
    #[error("security denied: {code}: {detail}")]
    SecurityDenied {
        /// Stable failure code.
        code: FailureCode,
        /// Human-readable detail.
        detail: String,
    },
    /// Session acquisition failed outside contract execution.
    #[error(transparent)]
    Session(#[from] predator_session::SessionError),
}

/// Node health including pool and circuit detail.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EngineHealthReport {
    /// `healthy`, `degraded`, or `unhealthy`.
    pub status: String,
    /// Live sessions.
    pub active_sessions: u64,
    /// Contexts idle in the pool.
    pub pooled_contexts: usize,
    /// Circuits currently open.
    pub open_circuits: u64,
    /// Full circuit snapshot.
    pub circuits: BTreeMap<String, CircuitInfo>,
}

/// The single-node deterministic executor.
pub struct PredatorEngine {
    store: Arc<ControlPlaneStore>,
    sessions: SessionManager,
    artifacts: Arc<ArtifactManager>,
    audit: AuditTrail,
    quota: QuotaManager,
    breaker: DomainCircuitBreaker,
    health: HealthMonitor,
    budget: TokenBudgetManager,
    validator: ContractValidator,
    chaos: Option<ChaosPolicy>,
    telemetry_sink: Box<dyn TelemetrySink>,
    ledger: tokio::sync::Mutex<HashMap<String, ActionExecutionResult>>,
}

impl std::fmt::Debug for PredatorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredatorEngine").finish()
    }
}

fn domain_of(raw_url: &str) -> String {
    Url::parse(raw_url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_lowercase))
        .unwrap_or_default()
}

impl PredatorEngine {
    /// Build a node over a browser driver.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the store, audit root, or artifact root
    /// cannot be prepared.
    pub fn new(browser: Arc<dyn BrowserDriver>, config: EngineConfig) -> Result<Self, EngineError> {
        let store = Arc::new(ControlPlaneStore::open(&config.control_db_path)?);
        let sessions = SessionManager::new(
            config.session.clone(),
            browser,
            Some(Arc::clone(&store)),
        );
        let artifacts = Arc::new(ArtifactManager::new(&config.artifact_root)?);
        let audit = AuditTrail::open(&config.audit_root)?;
        let quota = QuotaManager::new(config.default_quota, Some(Arc::clone(&store)));
        let breaker = DomainCircuitBreaker::new(Some(Arc::clone(&store)));
        let telemetry_sink: Box<dyn TelemetrySink> =
            Box::new(JsonlTelemetrySink::new(&config.telemetry_dir));
        Ok(Self {
            store,
            sessions,
            artifacts,
            audit,
            quota,
            breaker,
            health: HealthMonitor,
            budget: TokenBudgetManager::default(),
            validator: ContractValidator::default(),
            chaos: config.chaos,
            telemetry_sink,
            ledger: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Swap the telemetry sink (tests, alternative backends).
    pub fn set_telemetry_sink(&mut self, sink: Box<dyn TelemetrySink>) {
        self.telemetry_sink = sink;
    }

    /// Pre-warm the session pool.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Session`] when the driver cannot create
    /// contexts.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        self.sessions.initialize().await?;
        Ok(())
    }

    /// Close sessions and pooled contexts.
    pub async fn close(&self) {
        self.sessions.close().await;
    }

    /// Set a tenant's quota on this node (persisted via the store).
    pub fn set_tenant_quota(&self, tenant_id: &str, quota: TenantQuota) {
        self.quota.set_quota(tenant_id, quota);
    }

    async fn audit_and_cache(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        action_id: &str,
        canonical_contract_json: &str,
        result: ActionExecutionResult,
    ) -> Result<ActionExecutionResult, EngineError> {
        {
            let mut ledger = self.ledger.lock().await;
            ledger.insert(action_id.to_string(), result.clone());
        }
        self.audit
            .append(tenant_id, workflow_id, action_id, canonical_contract_json, &result)
            .await?;
        self.telemetry_sink
            .emit(&json!({
                "event": "action_result",
                "tenant_id": tenant_id,
                "workflow_id": workflow_id,
                "action_id": action_id,
                "success": result.success,
                "failure_code": result.failure_code,
                "telemetry": result.telemetry,
                "metadata": result.metadata,
            }))
            .await;
        Ok(result)
    }

    /// Register a pre-existing file as an upload artifact, charging quota.
    ///
    /// # Errors
    ///
    /// [`EngineError::QuotaDenied`] when the byte ceiling would be
    /// exceeded; [`EngineError::Artifact`] on filesystem faults.
    pub async fn register_upload_artifact(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        action_id: &str,
        source_path: &std::path::Path,
    ) -> Result<ArtifactRecord, EngineError> {
        let record = self
            .artifacts
            .register_existing_upload(workflow_id, action_id, source_path)?;
        match self.quota.check_artifact_quota(tenant_id, record.size) {
            GateDecision::Allowed => {
                self.quota.register_artifact_bytes(tenant_id, record.size);
                Ok(record)
            }
            GateDecision::Denied { code, detail } => {
                Err(EngineError::QuotaDenied { code, detail })
            }
        }
    }

    async fn run_action_engine(
        &self,
        session: &Arc<BrowserSession>,
        contract: &ActionContract,
        workflow_id: &str,
        action_id: &str,
    ) -> ActionExecutionResult {
        let page = session.page();
        let waits = WaitManager::new(Arc::clone(&page), self.chaos.clone());
        let extractor = StructuredStateExtractor::new(
            Arc::clone(&page),
            Arc::clone(&session.network_observer),
            ExtractorBounds::default(),
        );
        let verifier = VerificationEngine::new(
            Arc::clone(&page),
            Arc::clone(&session.network_observer),
        );
        let engine = ActionEngine::new(
            Navigator,
            waits,
            verifier,
            extractor,
            DeltaTracker::default(),
            Arc::clone(&self.artifacts),
            Some(Arc::clone(&session.runtime_telemetry)),
        );
        engine.execute(contract, workflow_id, action_id).await
    }

    fn apply_budget(
        &self,
        result: ActionExecutionResult,
        quota: &TenantQuota,
    ) -> Result<(ActionExecutionResult, BudgetOutcome), EngineError> {
        let mut payload = serde_json::to_value(&result)?;
        let budgets = ComponentTokenBudgets {
            max_state_delta_tokens: quota.max_state_delta_tokens,
            max_network_summary_tokens: quota.max_network_summary_tokens,
            max_metadata_tokens: quota.max_metadata_tokens,
        };
        let outcome = self
            .budget
            .enforce(&mut payload, Some(quota.max_step_tokens), Some(budgets));

        if !outcome.allowed {
            payload = json!({
                "action_id": result.action_id,
                "success": false,
                "failure_code": FailureCode::BudgetExceeded,
                "attempts": result.attempts,
                "escalation": result.escalation,
                "verification_passed": false,
                "pre_state_id": result.pre_state_id,
                "post_state_id": result.post_state_id,
                "state_delta": Value::Object(Default::default()),
                "network_summary": Value::Object(Default::default()),
                "telemetry": {"budget_tokens": outcome.total_tokens},
                "artifacts": result.artifacts,
                "metadata": {"budget_notes": outcome.notes},
            });
        }

        if let Some(metadata) = payload.get_mut("metadata")
            && metadata.is_object()
        {
            metadata["budget"] = json!({
                "tokens": outcome.total_tokens,
                "trimmed": outcome.trimmed,
                "notes": outcome.notes,
                "limit": quota.max_step_tokens,
            });
        }

        let rehydrated: ActionExecutionResult = serde_json::from_value(payload)?;
        Ok((rehydrated, outcome))
    }

    /// Execute one contract for `(tenant, workflow)` under `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] only for infrastructure faults (store,
    /// audit, serialization). Every action-level failure is a value in the
    /// returned result with a stable failure code.
    #[instrument(skip(self, policy, contract))]
    pub async fn execute_contract(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
        contract: &ActionContract,
    ) -> Result<ActionExecutionResult, EngineError> {
        let action_id = contract.action_id()?;
        let canonical = contract.canonical_json()?;
        let tenant_quota = self.quota.quota_for(tenant_id);

        // Tier one: the in-memory ledger.
        {
            let ledger = self.ledger.lock().await;
            if let Some(cached) = ledger.get(&action_id) {
                return Ok(cached.clone());
            }
        }
        // Tier two: the immutable audit trail.
        if let Some(existing) = self
            .audit
            .get_record_by_action(tenant_id, workflow_id, &action_id)
            .await?
        {
            let restored = existing.to_execution_result();
            let mut ledger = self.ledger.lock().await;
            ledger.insert(action_id.clone(), restored.clone());
            return Ok(restored);
        }

        if let GateDecision::Denied { code, detail } = self.validator.validate(contract) {
            let result = ActionExecutionResult::failure(&action_id, code, detail);
            return self
                .audit_and_cache(tenant_id, workflow_id, &action_id, &canonical, result)
                .await;
        }

        if !self.sessions.has_session(workflow_id).await {
            let active = self.sessions.active_session_count_for_tenant(tenant_id).await;
            if let GateDecision::Denied { code, detail } =
                self.quota.check_session_quota(tenant_id, active)
            {
                let result = ActionExecutionResult::failure(&action_id, code, detail);
                return self
                    .audit_and_cache(tenant_id, workflow_id, &action_id, &canonical, result)
                    .await;
            }
        }

        if let GateDecision::Denied { code, detail } = self.quota.check_action_rate(tenant_id, None)
        {
            let result = ActionExecutionResult::failure(&action_id, code, detail);
            return self
                .audit_and_cache(tenant_id, workflow_id, &action_id, &canonical, result)
                .await;
        }
        self.quota.register_action(tenant_id, None);

        let session = match self
            .sessions
            .get_or_create_session(tenant_id, workflow_id, policy.clone())
            .await
        {
            Ok(session) => session,
            Err(error) => {
                warn!(workflow_id, %error, "session allocation failed");
                let result = ActionExecutionResult::failure(
                    &action_id,
                    error.failure_code(),
                    "session allocation failed",
                );
                return self
                    .audit_and_cache(tenant_id, workflow_id, &action_id, &canonical, result)
                    .await;
            }
        };

        let security = SecurityLayer::new(policy);
        let current_url = session.page().current_url();
        let navigation_target = contract.action_spec.url.clone();

        if let Some(target) = &navigation_target
            && let GateDecision::Denied { code, detail } = security.evaluate_navigation(target)
        {
            let result = ActionExecutionResult::failure(&action_id, code, detail);
            return self
                .audit_and_cache(tenant_id, workflow_id, &action_id, &canonical, result)
                .await;
        }

        let action_domain = domain_of(navigation_target.as_deref().unwrap_or(&current_url));
        if !action_domain.is_empty()
            && let CircuitDecision::Blocked { detail } =
                self.breaker.allow(&action_domain, Some(tenant_id), None)
        {
            let result =
                ActionExecutionResult::failure(&action_id, FailureCode::CircuitOpen, detail);
            return self
                .audit_and_cache(tenant_id, workflow_id, &action_id, &canonical, result)
                .await;
        }

        if let GateDecision::Denied { code, detail } = security.evaluate_action(
            contract.action_spec.action_type,
            &current_url,
            &contract.metadata,
        ) {
            let result = ActionExecutionResult::failure(&action_id, code, detail);
            return self
                .audit_and_cache(tenant_id, workflow_id, &action_id, &canonical, result)
                .await;
        }

        let result = self
            .run_action_engine(&session, contract, workflow_id, &action_id)
            .await;

        if !action_domain.is_empty() {
            if result.success {
                self.breaker.record_success(&action_domain, Some(tenant_id));
            } else {
                self.breaker
                    .record_failure(&action_domain, Some(tenant_id), None);
            }
        }

        let (mut result, _outcome) = self.apply_budget(result, &tenant_quota)?;

        if !result.artifacts.is_empty() {
            let bytes_added: u64 = result.artifacts.iter().map(|record| record.size).sum();
            match self.quota.check_artifact_quota(tenant_id, bytes_added) {
                GateDecision::Allowed => {
                    self.quota.register_artifact_bytes(tenant_id, bytes_added);
                }
                GateDecision::Denied { code, detail } => {
                    result.success = false;
                    result.failure_code = Some(code);
                    result.verification_passed = false;
                    result.metadata = json!({"detail": detail});
                }
            }
        }

        info!(
            workflow_id,
            action_id,
            success = result.success,
            failure_code = ?result.failure_code,
            "contract executed"
        );
        self.audit_and_cache(tenant_id, workflow_id, &action_id, &canonical, result)
            .await
    }

    /// Verify the workflow's audit chain.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Audit`] on read failure.
    pub async fn verify_audit_chain(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<ChainOutcome, EngineError> {
        Ok(self.audit.verify_chain(tenant_id, workflow_id).await?)
    }

    /// The ordered audit records for a workflow.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Audit`] on read failure.
    pub async fn get_replay_trace(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<AuditRecord>, EngineError> {
        Ok(self.audit.list_records(tenant_id, workflow_id).await?)
    }

    /// Extract the current snapshot's model projection without acting.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Session`] when the session cannot be
    /// acquired.
    pub async fn get_structured_state(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
    ) -> Result<Value, EngineError> {
        let session = self
            .sessions
            .get_or_create_session(tenant_id, workflow_id, policy)
            .await?;
        let extractor = StructuredStateExtractor::new(
            session.page(),
            Arc::clone(&session.network_observer),
            ExtractorBounds::default(),
        );
        match extractor.extract(None, &[]).await {
            Ok(state) => {
                let mut projection = state.model_projection();
                projection["state_id"] = Value::String(state.state_id);
                Ok(projection)
            }
            Err(failure) => Ok(json!({"error": failure.detail})),
        }
    }

    /// Open a new tab for a workflow, policy-gated, and make it active.
    ///
    /// # Errors
    ///
    /// [`EngineError::SecurityDenied`] when the target is blocked;
    /// [`EngineError::Session`] when the session cannot be acquired.
    pub async fn open_tab(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
        url: &str,
    ) -> Result<String, EngineError> {
        let session = self
            .sessions
            .get_or_create_session(tenant_id, workflow_id, policy.clone())
            .await?;
        let security = SecurityLayer::new(policy);
        if let GateDecision::Denied { code, detail } = security.evaluate_navigation(url) {
            return Err(EngineError::SecurityDenied { code, detail });
        }
        let tab_id = {
            let mut tabs = session.tabs.lock().await;
            tabs.open_tab(url)
                .await
                .map_err(predator_session::SessionError::Driver)?
        };
        let page = {
            let tabs = session.tabs.lock().await;
            tabs.get_page(Some(&tab_id))
                .map_err(predator_session::SessionError::Driver)?
        };
        session.activate_page(page).await;
        Ok(tab_id)
    }

    /// Switch a workflow's active tab.
    ///
    /// # Errors
    ///
    /// [`EngineError::Session`] for unknown workflows or tabs.
    pub async fn switch_tab(&self, workflow_id: &str, tab_id: &str) -> Result<(), EngineError> {
        let session = self.sessions.get_session(workflow_id).await?;
        let page = {
            let mut tabs = session.tabs.lock().await;
            tabs.set_active_tab(tab_id)
                .map_err(predator_session::SessionError::Driver)?;
            tabs.get_page(Some(tab_id))
                .map_err(predator_session::SessionError::Driver)?
        };
        session.activate_page(page).await;
        Ok(())
    }

    /// Summaries of a workflow's tabs; empty when no session exists.
    pub async fn list_tabs(&self, workflow_id: &str) -> Vec<TabInfo> {
        match self.sessions.get_session(workflow_id).await {
            Ok(session) => {
                let tabs = session.tabs.lock().await;
                tabs.list_tabs().await
            }
            Err(_) => vec![],
        }
    }

    /// Close a workflow's session.
    pub async fn close_workflow_session(&self, workflow_id: &str) {
        self.sessions.close_session(workflow_id).await;
    }

    /// Node health from sessions and circuit state.
    pub async fn get_health(&self) -> EngineHealthReport {
        let snapshot = self.breaker.snapshot();
        let health = self
            .health
            .evaluate(self.sessions.total_active_sessions().await, snapshot);
        EngineHealthReport {
            status: health.status,
            active_sessions: health.active_sessions,
            pooled_contexts: self.sessions.pooled_context_count(),
            open_circuits: health.open_circuits,
            circuits: health.circuits,
        }
    }

    /// The control-plane store backing this node.
    #[must_use]
    pub fn store(&self) -> Arc<ControlPlaneStore> {
        Arc::clone(&self.store)
    }
}
