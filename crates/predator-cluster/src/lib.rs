// SPDX-License-Identifier: MIT OR Apache-2.0
//! predator-cluster
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! A fixed-shard pool of single-node engines.
//!
//! Routing of `(tenant, workflow)` is by stable hash; once a workflow's
//! first action lands on a shard, affinity pins every later action to the
//! same shard, so session state never migrates. Per shard the scheduler
//! keeps two per-class queues (`light`, `heavy`), each partitioned by
//! tenant; a deterministic weighted class cycle plus tenant round-robin
//! guarantees no tenant can starve another. A monitor flips nodes into
//! drain mode when any admission SLO is breached.

/// Execution-node trait and the engine-backed node.
pub mod node;
/// The sharded scheduler.
pub mod scheduler;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use predator_core::{ActionContract, ActionType};

pub use node::{EngineNode, ExecutionNode, NodeAdmissionSlo, NodeSnapshot};
pub use scheduler::{ClusterHealth, ClusterSchedulerConfig, NodeHealth, ShardedCluster};

/// Errors from cluster-level operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The cluster has no nodes yet.
    #[error("cluster not initialized")]
    NotInitialized,
    /// The workflow has no shard affinity and none can be derived.
    #[error("no shard affinity for workflow {0}")]
    NoAffinity(String),
    /// A node-level operation failed.
    #[error("node error: {0}")]
    Node(String),
    /// The node does not implement this operation.
    #[error("operation not supported by this node")]
    Unsupported,
}

/// Scheduler traffic class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkClass {
    /// Cheap interactions (click, type, select, wait).
    Light,
    /// Expensive actions (navigate, upload, download, custom JS).
    Heavy,
}

/// Classify a contract: explicit metadata override, else by action type.
#[must_use]
pub fn classify_work_class(contract: &ActionContract) -> WorkClass {
    if let Some(explicit) = contract
        .metadata
        .get("work_class")
        .and_then(serde_json::Value::as_str)
    {
        match explicit {
            "light" => return WorkClass::Light,
            "heavy" => return WorkClass::Heavy,
            _ => {}
        }
    }
    match contract.action_spec.action_type {
        ActionType::Navigate
        | ActionType::Upload
        | ActionType::DownloadTrigger
        | ActionType::CustomJsRestricted => WorkClass::Heavy,
        ActionType::Click | ActionType::Type | ActionType::Select | ActionType::WaitOnly => {
            WorkClass::Light
        }
    }
}

/// Stable shard index for `(tenant, workflow)` over `shard_count` shards.
#[must_use]
pub fn shard_index(tenant_id: &str, workflow_id: &str, shard_count: usize) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(workflow_id.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shard_count.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use predator_core::{ActionContractBuilder, ActionSpec};

    fn contract(action_type: ActionType) -> ActionContract {
        ActionContractBuilder::new("wf", "test")
            .action_spec(ActionSpec {
                action_type,
                url: matches!(action_type, ActionType::Navigate)
                    .then(|| "http://app.test/".to_string()),
                ..ActionSpec::wait_only()
            })
            .build()
    }

    #[test]
    fn heavy_actions_classify_heavy() {
        for action_type in [
            ActionType::Navigate,
            ActionType::Upload,
            ActionType::DownloadTrigger,
            ActionType::CustomJsRestricted,
        ] {
            assert_eq!(classify_work_class(&contract(action_type)), WorkClass::Heavy);
        }
        for action_type in [ActionType::Click, ActionType::Type, ActionType::WaitOnly] {
            assert_eq!(classify_work_class(&contract(action_type)), WorkClass::Light);
        }
    }

    #[test]
    fn metadata_overrides_classification() {
        let mut heavy_click = contract(ActionType::Click);
        heavy_click
            .metadata
            .insert("work_class".into(), serde_json::json!("heavy"));
        assert_eq!(classify_work_class(&heavy_click), WorkClass::Heavy);

        let mut light_nav = contract(ActionType::Navigate);
        light_nav
            .metadata
            .insert("work_class".into(), serde_json::json!("light"));
        assert_eq!(classify_work_class(&light_nav), WorkClass::Light);
    }

    #[test]
    fn shard_index_is_stable_and_bounded() {
        let first = shard_index("tenant-a", "wf-1", 3);
        for _ in 0..10 {
            assert_eq!(shard_index("tenant-a", "wf-1", 3), first);
        }
        assert!(first < 3);
        assert_eq!(shard_index("tenant-a", "wf-1", 1), 0);
    }
}
