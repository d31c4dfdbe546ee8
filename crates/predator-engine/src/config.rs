// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine configuration with environment overlay.

use std::path::PathBuf;

use predator_quota::TenantQuota;
use predator_session::SessionConfig;

use crate::waits::ChaosPolicy;

/// Settings for one engine node.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Session pool and lease settings.
    pub session: SessionConfig,
    /// Root directory for artifacts (`<root>/<workflow>/...`).
    pub artifact_root: PathBuf,
    /// Root directory for audit logs (`<root>/<tenant>/<workflow>.jsonl`).
    pub audit_root: PathBuf,
    /// Control-plane SQLite database path.
    pub control_db_path: PathBuf,
    /// Directory for the JSONL telemetry sink.
    pub telemetry_dir: PathBuf,
    /// Quota applied to tenants with no explicit quota.
    pub default_quota: TenantQuota,
    /// Chaos policy for adversarial wait testing; `None` in production.
    pub chaos: Option<ChaosPolicy>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            artifact_root: PathBuf::from("/tmp/predator-artifacts"),
            audit_root: PathBuf::from("/tmp/predator-audit"),
            control_db_path: PathBuf::from("/tmp/predator-control-plane/control.db"),
            telemetry_dir: PathBuf::from("/tmp/predator-telemetry"),
            default_quota: TenantQuota::default(),
            chaos: None,
        }
    }
}

impl EngineConfig {
    /// Overlay `PREDATOR_*` environment variables on the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self {
            session: SessionConfig::from_env(),
            ..Self::default()
        };
        if let Ok(value) = std::env::var("PREDATOR_ARTIFACT_ROOT") {
            config.artifact_root = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("PREDATOR_AUDIT_ROOT") {
            config.audit_root = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("PREDATOR_CONTROL_DB") {
            config.control_db_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("PREDATOR_TELEMETRY_DIR") {
            config.telemetry_dir = PathBuf::from(value);
        }
        config
    }

    /// Re-root every path under `base`, for test and per-shard isolation.
    #[must_use]
    pub fn rooted_at(base: &std::path::Path) -> Self {
        Self {
            artifact_root: base.join("artifacts"),
            audit_root: base.join("audit"),
            control_db_path: base.join("control-plane").join("control.db"),
            telemetry_dir: base.join("telemetry"),
            ..Self::default()
        }
    }
}
