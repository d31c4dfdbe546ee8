// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tenant quota enforcement through the live engine: action rates,
//! session ceilings, and artifact bytes.

mod common;

use common::{app_policy, app_world, engine_on, navigation_contract};
use predator::{FailureCode, TenantQuota};

fn tight_quota() -> TenantQuota {
    TenantQuota {
        max_actions_per_minute: 2,
        max_concurrent_sessions: 1,
        max_artifact_bytes: 10,
        ..TenantQuota::default()
    }
}

#[tokio::test]
async fn action_rate_denies_at_the_sliding_window_cap() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_on(dir.path(), app_world());
    engine.set_tenant_quota("tenant-q", tight_quota());

    let first = engine
        .execute_contract(
            "tenant-q",
            "wf-q",
            app_policy(),
            &navigation_contract("wf-q", 0),
        )
        .await
        .unwrap();
    assert!(first.success);

    let second = engine
        .execute_contract(
            "tenant-q",
            "wf-q",
            app_policy(),
            &navigation_contract("wf-q", 1),
        )
        .await
        .unwrap();
    assert!(second.success);

    let third = engine
        .execute_contract(
            "tenant-q",
            "wf-q",
            app_policy(),
            &navigation_contract("wf-q", 2),
        )
        .await
        .unwrap();
    assert_eq!(third.failure_code, Some(FailureCode::QuotaActionRate));

    // Another tenant is unaffected.
    let other = engine
        .execute_contract(
            "tenant-other",
            "wf-other",
            app_policy(),
            &navigation_contract("wf-other", 0),
        )
        .await
        .unwrap();
    assert!(other.success);
    engine.close().await;
}

#[tokio::test]
async fn session_ceiling_blocks_a_second_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_on(dir.path(), app_world());
    engine.set_tenant_quota("tenant-s", tight_quota());

    let first = engine
        .execute_contract(
            "tenant-s",
            "wf-s1",
            app_policy(),
            &navigation_contract("wf-s1", 0),
        )
        .await
        .unwrap();
    assert!(first.success);

    let second = engine
        .execute_contract(
            "tenant-s",
            "wf-s2",
            app_policy(),
            &navigation_contract("wf-s2", 0),
        )
        .await
        .unwrap();
    assert_eq!(second.failure_code, Some(FailureCode::QuotaSessionLimit));

    // Closing the first session frees the slot.
    engine.close_workflow_session("wf-s1").await;
    let retried = engine
        .execute_contract(
            "tenant-s",
            "wf-s2",
            app_policy(),
            &navigation_contract("wf-s2", 1),
        )
        .await
        .unwrap();
    assert!(retried.success, "failure: {:?}", retried.metadata);
    engine.close().await;
}

#[tokio::test]
async fn upload_registration_charges_artifact_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_on(dir.path(), app_world());
    engine.set_tenant_quota("tenant-u", tight_quota());

    let small = dir.path().join("small.bin");
    std::fs::write(&small, b"12345678").unwrap();
    let record = engine
        .register_upload_artifact("tenant-u", "wf-u", "act_setup", &small)
        .await
        .unwrap();
    assert!(record.artifact_id.starts_with("up_"));
    assert_eq!(record.size, 8);

    // The next registration would exceed the 10-byte ceiling.
    let more = dir.path().join("more.bin");
    std::fs::write(&more, b"abcdef").unwrap();
    let denied = engine
        .register_upload_artifact("tenant-u", "wf-u", "act_setup2", &more)
        .await
        .unwrap_err();
    assert!(denied.to_string().contains("QUOTA_ARTIFACT_BYTES"));
    engine.close().await;
}
