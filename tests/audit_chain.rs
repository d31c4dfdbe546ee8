// SPDX-License-Identifier: MIT OR Apache-2.0
//! Audit chain invariants across a live workflow.

mod common;

use common::{app_policy, app_world, engine_on, navigation_contract};
use predator::{AuditTrail, sha256_hex};

#[tokio::test]
async fn successive_records_form_a_verifiable_chain() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_on(dir.path(), app_world());

    for step in 0..3 {
        let result = engine
            .execute_contract(
                "tenant-ac",
                "wf-chain",
                app_policy(),
                &navigation_contract("wf-chain", step),
            )
            .await
            .unwrap();
        assert!(result.success);
    }

    let records = engine.get_replay_trace("tenant-ac", "wf-chain").await.unwrap();
    assert_eq!(records.len(), 3);

    // Invariant: the first record links to nothing; each later record
    // links to its predecessor's hash.
    assert_eq!(records[0].previous_record_hash, "");
    for index in 1..records.len() {
        assert_eq!(
            records[index].previous_record_hash,
            records[index - 1].record_hash
        );
    }

    // The action hash is the SHA-256 of the stored canonical contract.
    for record in &records {
        assert_eq!(
            record.action_hash,
            sha256_hex(record.contract_json.as_bytes())
        );
    }

    let outcome = engine
        .verify_audit_chain("tenant-ac", "wf-chain")
        .await
        .unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.checked, 3);
    engine.close().await;
}

#[tokio::test]
async fn failed_actions_are_audited_like_successes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_on(dir.path(), app_world());

    // A contract whose postcondition cannot hold.
    let mut contract = navigation_contract("wf-fail", 0);
    contract.expected_postconditions[0] = predator::VerificationRule::hard(
        predator::RuleCheck::UrlPattern {
            pattern: "^http://nowhere\\.test/$".into(),
        },
    );

    let result = engine
        .execute_contract("tenant-ac", "wf-fail", app_policy(), &contract)
        .await
        .unwrap();
    assert!(!result.success);

    let records = engine.get_replay_trace("tenant-ac", "wf-fail").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert!(engine.verify_audit_chain("tenant-ac", "wf-fail").await.unwrap().ok);
    engine.close().await;
}

#[tokio::test]
async fn signed_chains_reject_key_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let signed = AuditTrail::with_signing_key(dir.path(), b"key-one").unwrap();
    let result = predator::ActionExecutionResult::failure(
        "act_x",
        predator::FailureCode::WaitTimeout,
        "slow page",
    );
    signed
        .append("t", "wf", "act_x", r#"{"x":1}"#, &result)
        .await
        .unwrap();
    assert!(signed.verify_chain("t", "wf").await.unwrap().ok);

    // The same log under a different key fails signature verification.
    let other = AuditTrail::with_signing_key(dir.path(), b"key-two").unwrap();
    let outcome = other.verify_chain("t", "wf").await.unwrap();
    assert!(!outcome.ok);
    assert_eq!(outcome.violation.unwrap().to_string(), "record_signature_mismatch_at_index_0");
}
