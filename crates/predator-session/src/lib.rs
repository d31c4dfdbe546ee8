// SPDX-License-Identifier: MIT OR Apache-2.0
//! predator-session
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Session and browser-context lifecycle.
//!
//! A workflow leases exactly one [`BrowserSession`] for its lifetime.
//! Contexts come from a pre-warmed pool with strict hygiene: cross-tenant
//! reuse is forbidden, released contexts are reset (permissions, cookies,
//! extra pages, storage) or retired by use-count/age, and any reset failure
//! closes the context outright. A global semaphore bounds total sessions;
//! when a control-plane store is attached, a TTL lease keyed by workflow
//! serialises ownership across processes.

/// Network observation.
pub mod observer;
/// Tab bookkeeping.
pub mod tabs;
/// Runtime console/page-error capture.
pub mod telemetry;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use predator_core::{FailureCode, SecurityPolicy};
use predator_driver::{BrowserDriver, ContextDriver, DriverError, PageDriver};
use predator_store::ControlPlaneStore;

pub use observer::{NetworkEvent, NetworkEventKind, NetworkObserver, json_shape_hash, route_key};
pub use tabs::{TabInfo, TabManager};
pub use telemetry::{RuntimeEvent, RuntimeTelemetryBuffer};

const BLANK_URL: &str = "about:blank";
const CLEAR_WEB_STORAGE_SCRIPT: &str = "() => {\
    try { localStorage.clear(); } catch (_) {}\
    try { sessionStorage.clear(); } catch (_) {}\
}";
const CLEAR_INDEXED_DB_SCRIPT: &str = "() => {\
    if (!('indexedDB' in window) || typeof indexedDB.databases !== 'function') return Promise.resolve();\
    return indexedDB.databases().then((dbs) => Promise.all((dbs || []).map((db) => new Promise((resolve) => {\
    try {\
    const req = indexedDB.deleteDatabase(db.name);\
    req.onsuccess = () => resolve(true);\
    req.onerror = () => resolve(false);\
    req.onblocked = () => resolve(false);\
    } catch (_) { resolve(false); }\
    }))));\
}";

/// Session pool and lifecycle settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Process-wide session ceiling (the admission semaphore).
    pub max_total_sessions: usize,
    /// How long to wait for a session slot before failing.
    pub session_acquire_timeout: Duration,
    /// Contexts created up front.
    pub prewarmed_contexts: usize,
    /// Pool capacity; released contexts beyond this are closed.
    pub max_pooled_contexts: usize,
    /// Retire a context after this many uses.
    pub max_context_reuses: u32,
    /// Retire a context after this age.
    pub max_context_age: Duration,
    /// Default driver operation timeout.
    pub default_timeout: Duration,
    /// TTL on the cross-process session lease.
    pub session_lease_ttl_seconds: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_total_sessions: 200,
            session_acquire_timeout: Duration::from_secs(300),
            prewarmed_contexts: 8,
            max_pooled_contexts: 64,
            max_context_reuses: 50,
            max_context_age: Duration::from_secs(1_800),
            default_timeout: Duration::from_secs(20),
            session_lease_ttl_seconds: 300,
        }
    }
}

impl SessionConfig {
    /// Overlay `PREDATOR_*` environment variables on the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        fn parse<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|raw| raw.parse().ok())
        }
        let mut config = Self::default();
        if let Some(value) = parse("PREDATOR_MAX_TOTAL_SESSIONS") {
            config.max_total_sessions = value;
        }
        if let Some(value) = parse("PREDATOR_PREWARMED_CONTEXTS") {
            config.prewarmed_contexts = value;
        }
        if let Some(value) = parse("PREDATOR_MAX_POOLED_CONTEXTS") {
            config.max_pooled_contexts = value;
        }
        if let Some(value) = parse("PREDATOR_MAX_CONTEXT_REUSES") {
            config.max_context_reuses = value;
        }
        if let Some(value) = parse::<u64>("PREDATOR_MAX_CONTEXT_AGE_SECONDS") {
            config.max_context_age = Duration::from_secs(value);
        }
        if let Some(value) = parse("PREDATOR_SESSION_LEASE_TTL_SECONDS") {
            config.session_lease_ttl_seconds = value;
        }
        config
    }
}

/// Errors from session acquisition and lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The process-wide session slot pool is exhausted.
    #[error("global session limit reached")]
    GlobalSessionLimit,
    /// The cross-process lease is held by another owner.
    #[error("session lease not acquired")]
    LeaseNotAcquired,
    /// The driver failed during session setup.
    #[error(transparent)]
    Driver(#[from] DriverError),
    /// No session exists for the workflow.
    #[error("unknown workflow session: {0}")]
    UnknownWorkflow(String),
}

impl SessionError {
    /// The failure code this error surfaces as.
    #[must_use]
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Self::GlobalSessionLimit => FailureCode::GlobalSessionLimit,
            Self::LeaseNotAcquired => FailureCode::SessionLeaseNotAcquired,
            Self::Driver(_) | Self::UnknownWorkflow(_) => FailureCode::ActionExecutionFailed,
        }
    }
}

/// A pooled browser context and its reuse bookkeeping.
pub struct PooledContext {
    /// The driver context.
    pub context: Arc<dyn ContextDriver>,
    /// Tenant currently (or last) bound to this context.
    pub tenant_id: Option<String>,
    /// Creation time, for age-based retirement.
    pub created_at: Instant,
    /// Times this context has been leased.
    pub use_count: u32,
}

impl std::fmt::Debug for PooledContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledContext")
            .field("tenant_id", &self.tenant_id)
            .field("use_count", &self.use_count)
            .finish()
    }
}

/// One workflow's exclusive browser session.
pub struct BrowserSession {
    /// Owning tenant.
    pub tenant_id: String,
    /// Owning workflow.
    pub workflow_id: String,
    /// The leased context.
    pub context: Arc<dyn ContextDriver>,
    /// Security policy bound at session creation.
    pub policy: SecurityPolicy,
    /// Network event stream for the active page.
    pub network_observer: Arc<NetworkObserver>,
    /// Console/page-error capture for the active page.
    pub runtime_telemetry: Arc<RuntimeTelemetryBuffer>,
    /// Tab bookkeeping.
    pub tabs: tokio::sync::Mutex<TabManager>,
    active_page: Mutex<Arc<dyn PageDriver>>,
}

impl std::fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSession")
            .field("tenant_id", &self.tenant_id)
            .field("workflow_id", &self.workflow_id)
            .finish()
    }
}

impl BrowserSession {
    /// The active page pointer.
    #[must_use]
    pub fn page(&self) -> Arc<dyn PageDriver> {
        Arc::clone(&self.active_page.lock().expect("page lock poisoned"))
    }

    /// Repoint the active page and re-attach observers to it.
    pub async fn activate_page(&self, page: Arc<dyn PageDriver>) {
        self.network_observer.detach().await;
        self.runtime_telemetry.detach().await;
        self.network_observer.attach(&page).await;
        self.runtime_telemetry.attach(&page).await;
        *self.active_page.lock().expect("page lock poisoned") = page;
    }
}

struct SessionSlot {
    session: Arc<BrowserSession>,
    pooled: PooledContext,
    _permit: OwnedSemaphorePermit,
}

/// Pool-backed session manager with lease-based cross-process ownership.
pub struct SessionManager {
    config: SessionConfig,
    browser: Arc<dyn BrowserDriver>,
    store: Option<Arc<ControlPlaneStore>>,
    owner_id: String,
    slots: tokio::sync::Mutex<HashMap<String, SessionSlot>>,
    pool: Mutex<VecDeque<PooledContext>>,
    semaphore: Arc<Semaphore>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("owner_id", &self.owner_id)
            .finish()
    }
}

impl SessionManager {
    /// Build a manager over a browser driver with optional store backing.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        browser: Arc<dyn BrowserDriver>,
        store: Option<Arc<ControlPlaneStore>>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_total_sessions));
        let owner_id = if store.is_some() {
            ControlPlaneStore::owner_id()
        } else {
            "local-owner".into()
        };
        Self {
            config,
            browser,
            store,
            owner_id,
            slots: tokio::sync::Mutex::new(HashMap::new()),
            pool: Mutex::new(VecDeque::new()),
            semaphore,
        }
    }

    /// Pre-warm the context pool.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Driver`] when context creation fails.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        let target = self
            .config
            .prewarmed_contexts
            .min(self.config.max_pooled_contexts);
        loop {
            {
                let pool = self.pool.lock().expect("pool lock poisoned");
                if pool.len() >= target {
                    return Ok(());
                }
            }
            let context = self.browser.new_context().await?;
            self.pool
                .lock()
                .expect("pool lock poisoned")
                .push_back(PooledContext {
                    context,
                    tenant_id: None,
                    created_at: Instant::now(),
                    use_count: 0,
                });
        }
    }

    async fn acquire_context(&self, tenant_id: &str) -> Result<PooledContext, SessionError> {
        let reused = {
            let mut pool = self.pool.lock().expect("pool lock poisoned");
            let position = pool.iter().position(|pooled| {
                pooled
                    .tenant_id
                    .as_deref()
                    .is_none_or(|owner| owner == tenant_id)
            });
            position.and_then(|index| pool.remove(index))
        };
        if let Some(mut pooled) = reused {
            pooled.tenant_id = Some(tenant_id.to_string());
            pooled.use_count += 1;
            return Ok(pooled);
        }
        let context = self.browser.new_context().await?;
        Ok(PooledContext {
            context,
            tenant_id: Some(tenant_id.to_string()),
            created_at: Instant::now(),
            use_count: 1,
        })
    }

    fn should_retire(&self, pooled: &PooledContext) -> bool {
        pooled.use_count >= self.config.max_context_reuses
            || pooled.created_at.elapsed() >= self.config.max_context_age
    }

    async fn reset_context(&self, context: &Arc<dyn ContextDriver>) -> bool {
        if context.clear_permissions().await.is_err() {
            return false;
        }
        if context.clear_cookies().await.is_err() {
            return false;
        }

        let pages = context.pages().await;
        let primary = match pages.first() {
            Some(page) => Arc::clone(page),
            None => match context.new_page().await {
                Ok(page) => page,
                Err(_) => return false,
            },
        };
        for page in pages.iter().skip(1) {
            let _ = page.close().await;
        }

        if primary
            .goto(BLANK_URL, self.config.default_timeout)
            .await
            .is_err()
        {
            return false;
        }
        if primary
            .evaluate(CLEAR_WEB_STORAGE_SCRIPT, None)
            .await
            .is_err()
        {
            return false;
        }
        primary
            .evaluate(CLEAR_INDEXED_DB_SCRIPT, None)
            .await
            .is_ok()
    }

    async fn release_context(&self, mut pooled: PooledContext) {
        if self.should_retire(&pooled) {
            debug!(use_count = pooled.use_count, "retiring pooled context");
            let _ = pooled.context.close().await;
            return;
        }
        if !self.reset_context(&pooled.context).await {
            warn!("context reset failed; closing context");
            let _ = pooled.context.close().await;
            return;
        }
        let pool_len = self.pool.lock().expect("pool lock poisoned").len();
        if pool_len >= self.config.max_pooled_contexts {
            let _ = pooled.context.close().await;
            return;
        }
        pooled.tenant_id = None;
        self.pool.lock().expect("pool lock poisoned").push_back(pooled);
    }

    /// Fetch the workflow's session, creating it on first use.
    ///
    /// # Errors
    ///
    /// [`SessionError::GlobalSessionLimit`] when no slot frees up in time,
    /// [`SessionError::LeaseNotAcquired`] on a cross-owner lease conflict,
    /// or [`SessionError::Driver`] when setup fails. Setup failures roll
    /// back the lease and the slot.
    pub async fn get_or_create_session(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
    ) -> Result<Arc<BrowserSession>, SessionError> {
        {
            let slots = self.slots.lock().await;
            if let Some(slot) = slots.get(workflow_id) {
                if let Some(store) = &self.store {
                    let _ = store.heartbeat_session_lease(workflow_id, &self.owner_id);
                }
                return Ok(Arc::clone(&slot.session));
            }
        }

        let permit = tokio::time::timeout(
            self.config.session_acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| SessionError::GlobalSessionLimit)?
        .map_err(|_| SessionError::GlobalSessionLimit)?;

        let mut lease_acquired = false;
        if let Some(store) = &self.store {
            let acquired = store
                .acquire_session_lease(
                    tenant_id,
                    workflow_id,
                    &self.owner_id,
                    self.config.session_lease_ttl_seconds,
                )
                .unwrap_or(false);
            if !acquired {
                return Err(SessionError::LeaseNotAcquired);
            }
            lease_acquired = true;
        }

        match self.build_session(tenant_id, workflow_id, policy).await {
            Ok((session, pooled)) => {
                let mut slots = self.slots.lock().await;
                slots.insert(
                    workflow_id.to_string(),
                    SessionSlot {
                        session: Arc::clone(&session),
                        pooled,
                        _permit: permit,
                    },
                );
                debug!(tenant_id, workflow_id, "session created");
                Ok(session)
            }
            Err(error) => {
                if lease_acquired && let Some(store) = &self.store {
                    let _ = store.release_session_lease(workflow_id, &self.owner_id);
                }
                Err(error)
            }
        }
    }

    async fn build_session(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        policy: SecurityPolicy,
    ) -> Result<(Arc<BrowserSession>, PooledContext), SessionError> {
        let pooled = self.acquire_context(tenant_id).await?;
        let context = Arc::clone(&pooled.context);

        let pages = context.pages().await;
        let page = match pages.first() {
            Some(page) => Arc::clone(page),
            None => context.new_page().await?,
        };

        let network_observer = Arc::new(NetworkObserver::default());
        network_observer.attach(&page).await;
        let runtime_telemetry = Arc::new(RuntimeTelemetryBuffer::default());
        runtime_telemetry.attach(&page).await;

        let tabs = TabManager::new(
            Arc::clone(&context),
            Arc::clone(&page),
            self.config.default_timeout,
        );

        let session = Arc::new(BrowserSession {
            tenant_id: tenant_id.to_string(),
            workflow_id: workflow_id.to_string(),
            context,
            policy,
            network_observer,
            runtime_telemetry,
            tabs: tokio::sync::Mutex::new(tabs),
            active_page: Mutex::new(page),
        });
        Ok((session, pooled))
    }

    /// Close a workflow's session, releasing context, slot, and lease.
    pub async fn close_session(&self, workflow_id: &str) {
        let slot = self.slots.lock().await.remove(workflow_id);
        let Some(slot) = slot else {
            return;
        };
        slot.session.runtime_telemetry.detach().await;
        slot.session.network_observer.detach().await;
        self.release_context(slot.pooled).await;
        if let Some(store) = &self.store {
            let _ = store.release_session_lease(workflow_id, &self.owner_id);
        }
        // The slot's permit drops here, freeing the admission slot.
    }

    /// Close everything: sessions first, then the pool.
    pub async fn close(&self) {
        let workflow_ids: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        for workflow_id in workflow_ids {
            self.close_session(&workflow_id).await;
        }
        let drained: Vec<PooledContext> = {
            let mut pool = self.pool.lock().expect("pool lock poisoned");
            pool.drain(..).collect()
        };
        for pooled in drained {
            let _ = pooled.context.close().await;
        }
    }

    /// Whether a session exists for the workflow.
    pub async fn has_session(&self, workflow_id: &str) -> bool {
        self.slots.lock().await.contains_key(workflow_id)
    }

    /// Fetch an existing session, heartbeating its lease.
    ///
    /// # Errors
    ///
    /// [`SessionError::UnknownWorkflow`] when no session exists.
    pub async fn get_session(&self, workflow_id: &str) -> Result<Arc<BrowserSession>, SessionError> {
        let slots = self.slots.lock().await;
        let slot = slots
            .get(workflow_id)
            .ok_or_else(|| SessionError::UnknownWorkflow(workflow_id.to_string()))?;
        if let Some(store) = &self.store {
            let _ = store.heartbeat_session_lease(workflow_id, &self.owner_id);
        }
        Ok(Arc::clone(&slot.session))
    }

    /// Live sessions for one tenant (store-backed when available).
    pub async fn active_session_count_for_tenant(&self, tenant_id: &str) -> u64 {
        if let Some(store) = &self.store {
            return store
                .count_active_sessions(tenant_id, self.config.session_lease_ttl_seconds)
                .unwrap_or(0);
        }
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.session.tenant_id == tenant_id)
            .count() as u64
    }

    /// Total live sessions (store-backed when available).
    pub async fn total_active_sessions(&self) -> u64 {
        if let Some(store) = &self.store {
            return store
                .count_all_active_sessions(self.config.session_lease_ttl_seconds)
                .unwrap_or(0);
        }
        self.slots.lock().await.len() as u64
    }

    /// Contexts currently idle in the pool.
    #[must_use]
    pub fn pooled_context_count(&self) -> usize {
        self.pool.lock().expect("pool lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use predator_driver::sim::{SimWorld, SimulatedBrowser};

    fn manager(config: SessionConfig) -> SessionManager {
        let world = SimWorld::new();
        let browser = SimulatedBrowser::new(world);
        SessionManager::new(config, browser, None)
    }

    #[tokio::test]
    async fn sessions_are_reused_per_workflow() {
        let manager = manager(SessionConfig::default());
        let first = manager
            .get_or_create_session("t1", "wf", SecurityPolicy::default())
            .await
            .unwrap();
        let second = manager
            .get_or_create_session("t1", "wf", SecurityPolicy::default())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.total_active_sessions().await, 1);
    }

    #[tokio::test]
    async fn prewarmed_pool_feeds_sessions_and_reset_returns_them() {
        let manager = manager(SessionConfig {
            prewarmed_contexts: 2,
            ..SessionConfig::default()
        });
        manager.initialize().await.unwrap();
        assert_eq!(manager.pooled_context_count(), 2);

        manager
            .get_or_create_session("t1", "wf", SecurityPolicy::default())
            .await
            .unwrap();
        assert_eq!(manager.pooled_context_count(), 1);

        manager.close_session("wf").await;
        assert_eq!(manager.pooled_context_count(), 2);
        assert_eq!(manager.total_active_sessions().await, 0);
    }

    #[tokio::test]
    async fn retirement_by_use_count_closes_instead_of_pooling() {
        let manager = manager(SessionConfig {
            prewarmed_contexts: 1,
            max_context_reuses: 1,
            ..SessionConfig::default()
        });
        manager.initialize().await.unwrap();
        manager
            .get_or_create_session("t1", "wf", SecurityPolicy::default())
            .await
            .unwrap();
        manager.close_session("wf").await;
        // use_count hit the cap: the context was retired, not pooled.
        assert_eq!(manager.pooled_context_count(), 0);
    }

    #[tokio::test]
    async fn global_semaphore_bounds_sessions() {
        let manager = manager(SessionConfig {
            max_total_sessions: 1,
            session_acquire_timeout: Duration::from_millis(30),
            ..SessionConfig::default()
        });
        manager
            .get_or_create_session("t1", "wf-1", SecurityPolicy::default())
            .await
            .unwrap();
        let error = manager
            .get_or_create_session("t1", "wf-2", SecurityPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(error, SessionError::GlobalSessionLimit));
        assert_eq!(error.failure_code(), FailureCode::GlobalSessionLimit);

        manager.close_session("wf-1").await;
        manager
            .get_or_create_session("t1", "wf-2", SecurityPolicy::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lease_conflict_surfaces_and_rolls_back_slot() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            predator_store::ControlPlaneStore::open(dir.path().join("control.db")).unwrap(),
        );
        // A foreign owner holds the workflow lease.
        store
            .acquire_session_lease("t1", "wf", "other-host:1", 300)
            .unwrap();

        let world = SimWorld::new();
        let browser = SimulatedBrowser::new(world);
        let manager = SessionManager::new(SessionConfig::default(), browser, Some(store));

        let error = manager
            .get_or_create_session("t1", "wf", SecurityPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(error, SessionError::LeaseNotAcquired));
        assert_eq!(
            error.failure_code(),
            FailureCode::SessionLeaseNotAcquired
        );
        // The slot was rolled back: a different workflow can still start.
        manager
            .get_or_create_session("t1", "wf-other", SecurityPolicy::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cross_tenant_contexts_are_never_reused() {
        let manager = manager(SessionConfig {
            prewarmed_contexts: 0,
            ..SessionConfig::default()
        });
        manager
            .get_or_create_session("tenant-a", "wf-a", SecurityPolicy::default())
            .await
            .unwrap();
        // Poison the pooled entry's tenant by simulating a failed reset
        // path: close the session but mark the pool entry as tenant-a.
        manager.close_session("wf-a").await;
        {
            let mut pool = manager.pool.lock().unwrap();
            if let Some(entry) = pool.front_mut() {
                entry.tenant_id = Some("tenant-a".into());
            }
        }
        manager
            .get_or_create_session("tenant-b", "wf-b", SecurityPolicy::default())
            .await
            .unwrap();
        // tenant-b did not take tenant-a's context: it is still pooled.
        assert_eq!(manager.pooled_context_count(), 1);
        assert_eq!(
            manager
                .pool
                .lock()
                .unwrap()
                .front()
                .unwrap()
                .tenant_id
                .as_deref(),
            Some("tenant-a")
        );
    }
}
