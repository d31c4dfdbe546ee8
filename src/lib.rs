// SPDX-License-Identifier: MIT OR Apache-2.0
//! predator
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Deterministic browser-automation execution engine.
//!
//! This facade re-exports the public surface of the workspace: contracts
//! and canonical identity ([`predator_core`]), the automation driver
//! boundary ([`predator_driver`]), the single-node engine
//! ([`predator_engine`]), and the sharded cluster
//! ([`predator_cluster`]), plus tracing setup.

/// Tracing initialisation helpers.
pub mod telemetry;

pub use predator_audit::{AuditRecord, AuditTrail, ChainOutcome, ChainViolation};
pub use predator_budget::{BudgetOutcome, ComponentTokenBudgets, TokenBudgetManager};
pub use predator_cluster::{
    ClusterHealth, ClusterSchedulerConfig, EngineNode, ExecutionNode, NodeAdmissionSlo,
    NodeSnapshot, ShardedCluster, WorkClass, classify_work_class, shard_index,
};
pub use predator_core::{
    ActionContract, ActionContractBuilder, ActionExecutionResult, ActionSpec, ActionType,
    ArtifactRecord, ContractValidator, EscalationMode, EscalationPolicy, FailureCode,
    GateDecision, NetworkSummary, RetryPolicy, RuleCheck, SecurityPolicy, SelectorState,
    Severity, StateDelta, StructuredState, TextMatchMode, TimeoutPolicy, VerificationRule,
    WaitCondition, WaitKind, canonical_json, estimate_tokens, sha256_hex, stable_hash,
};
pub use predator_driver::{
    BrowserDriver, ContextDriver, DownloadPayload, DriverError, PageDriver, PageEvent,
    RawElement, RawError, RawForm, RawNetworkEvent, RawNetworkKind, sim,
};
pub use predator_engine::{
    ActionEngine, ArtifactManager, ChaosPolicy, EngineConfig, EngineError, EngineHealthReport,
    PredatorEngine, SecurityLayer, TelemetrySink, WaitManager, WaitMode,
};
pub use predator_quota::{
    CircuitState, DomainCircuitBreaker, EngineHealth, HealthMonitor, QuotaManager, TenantQuota,
};
pub use predator_session::{
    BrowserSession, NetworkObserver, SessionConfig, SessionError, SessionManager, TabInfo,
};
pub use predator_store::ControlPlaneStore;
