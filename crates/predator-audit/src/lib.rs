// SPDX-License-Identifier: MIT OR Apache-2.0
//! predator-audit
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Append-only per-workflow audit trail.
//!
//! Each workflow owns one JSONL file under `<root>/<tenant>/<workflow>.jsonl`.
//! Every line is the canonical JSON of an [`AuditRecord`]: the contract's
//! canonical form, the outcome evidence, a link to the previous record's
//! hash, an HMAC-SHA256 signature, and the record's own hash. The chain is
//! verifiable offline; any mutation of any byte breaks it at a reported
//! index.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::debug;

use predator_core::{ActionExecutionResult, canonical_json, sha256_hex};

type HmacSha256 = Hmac<Sha256>;

/// Environment variable holding the audit signing key.
pub const SIGNING_KEY_ENV: &str = "PREDATOR_AUDIT_SIGNING_KEY";

/// Errors from audit trail operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Filesystem failure on the log file or its directory.
    #[error("audit io failure at {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// A record could not be serialized or a stored line is not valid JSON.
    #[error("audit serialization failure: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Where and why a chain verification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainViolation {
    /// `previous_record_hash` does not match the predecessor's hash.
    LinkMismatch {
        /// Index of the offending record.
        index: usize,
    },
    /// Re-derived record hash does not match the stored hash.
    HashMismatch {
        /// Index of the offending record.
        index: usize,
    },
    /// HMAC signature does not verify.
    SignatureMismatch {
        /// Index of the offending record.
        index: usize,
    },
}

impl std::fmt::Display for ChainViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LinkMismatch { index } => write!(f, "chain_link_mismatch_at_index_{index}"),
            Self::HashMismatch { index } => write!(f, "record_hash_mismatch_at_index_{index}"),
            Self::SignatureMismatch { index } => {
                write!(f, "record_signature_mismatch_at_index_{index}")
            }
        }
    }
}

/// Result of verifying one workflow's chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    /// Whether every link, hash, and signature verified.
    pub ok: bool,
    /// Number of records inspected.
    pub checked: usize,
    /// First violation found, if any.
    pub violation: Option<ChainViolation>,
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// `ar_` + hash over `(tenant, workflow, action, ts, previous_hash)`.
    pub record_id: String,
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    /// Tenant that executed the action.
    pub tenant_id: String,
    /// Owning workflow.
    pub workflow_id: String,
    /// Content-derived contract identity.
    pub action_id: String,
    /// The contract's canonical JSON, verbatim.
    pub contract_json: String,
    /// SHA-256 of `contract_json`.
    pub action_hash: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Failure code string, if any.
    pub failure_code: Option<String>,
    /// Snapshot id before dispatch.
    pub pre_state_id: Option<String>,
    /// Snapshot id after dispatch.
    pub post_state_id: Option<String>,
    /// Budget-trimmed state delta payload.
    pub state_delta: Value,
    /// Budget-trimmed network summary payload.
    pub network_summary: Value,
    /// Artifact records payload.
    pub artifacts: Value,
    /// Telemetry payload.
    pub telemetry: Value,
    /// Metadata payload.
    pub metadata: Value,
    /// Hash of the predecessor record; empty for the first record.
    pub previous_record_hash: String,
    /// HMAC-SHA256 over the canonical payload without hash/signature.
    pub signature: String,
    /// SHA-256 over the canonical payload without hash/signature.
    pub record_hash: String,
}

impl AuditRecord {
    /// Rebuild a minimal execution result from this record.
    ///
    /// Used for cross-process idempotency: a re-submitted contract whose id
    /// is already audited short-circuits to the recorded outcome.
    #[must_use]
    pub fn to_execution_result(&self) -> ActionExecutionResult {
        ActionExecutionResult {
            action_id: self.action_id.clone(),
            success: self.success,
            failure_code: self
                .failure_code
                .as_deref()
                .and_then(|code| serde_json::from_value(Value::String(code.into())).ok()),
            attempts: 1,
            escalation: None,
            verification_passed: self.success,
            pre_state_id: self.pre_state_id.clone(),
            post_state_id: self.post_state_id.clone(),
            state_delta: serde_json::from_value(self.state_delta.clone()).unwrap_or_default(),
            network_summary: serde_json::from_value(self.network_summary.clone())
                .unwrap_or_default(),
            telemetry: self.telemetry.clone(),
            artifacts: serde_json::from_value(self.artifacts.clone()).unwrap_or_default(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Append-only hash-chained audit trail persisted as JSONL per workflow.
#[derive(Debug)]
pub struct AuditTrail {
    root: PathBuf,
    signing_key: Vec<u8>,
    last_hash: Mutex<HashMap<String, String>>,
}

impl AuditTrail {
    /// Open a trail rooted at `root`, reading the signing key from the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the root cannot be created.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, AuditError> {
        let key = std::env::var(SIGNING_KEY_ENV).unwrap_or_default();
        Self::with_signing_key(root, key.as_bytes())
    }

    /// Open a trail with an explicit signing key. An empty key disables
    /// signing; records then carry empty signatures and verify as such.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the root cannot be created.
    pub fn with_signing_key(root: impl AsRef<Path>, key: &[u8]) -> Result<Self, AuditError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|source| AuditError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            signing_key: key.to_vec(),
            last_hash: Mutex::new(HashMap::new()),
        })
    }

    fn workflow_log(&self, tenant_id: &str, workflow_id: &str) -> Result<PathBuf, AuditError> {
        let tenant_dir = self.root.join(tenant_id.replace('/', "_"));
        std::fs::create_dir_all(&tenant_dir).map_err(|source| AuditError::Io {
            path: tenant_dir.clone(),
            source,
        })?;
        Ok(tenant_dir.join(format!("{}.jsonl", workflow_id.replace('/', "_"))))
    }

    fn sign(&self, canonical_payload: &str) -> String {
        if self.signing_key.is_empty() {
            return String::new();
        }
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(canonical_payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn verify_signature(&self, canonical_payload: &str, signature: &str) -> bool {
        if self.signing_key.is_empty() {
            return signature.is_empty();
        }
        // Recompute-and-compare via the Mac verifier for constant time.
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(canonical_payload.as_bytes());
        match hex::decode(signature) {
            Ok(bytes) => mac.verify_slice(&bytes).is_ok(),
            Err(_) => false,
        }
    }

    fn canonical_payload_without_hash(record: &AuditRecord) -> Result<String, AuditError> {
        let mut value = serde_json::to_value(record)?;
        if let Value::Object(map) = &mut value {
            map.remove("record_hash");
            map.remove("signature");
        }
        Ok(canonical_json(&value)?)
    }

    /// Append one outcome, linking it to the workflow's chain.
    ///
    /// The append is serialised per process by an async lock; the line is
    /// flushed and fsynced before the chain head moves.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on serialization or filesystem failure.
    pub async fn append(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        action_id: &str,
        canonical_contract_json: &str,
        result: &ActionExecutionResult,
    ) -> Result<AuditRecord, AuditError> {
        let mut last_hash = self.last_hash.lock().await;
        let log_path = self.workflow_log(tenant_id, workflow_id)?;
        let chain_key = format!("{tenant_id}:{workflow_id}");

        let mut previous_hash = last_hash.get(&chain_key).cloned().unwrap_or_default();
        if previous_hash.is_empty()
            && let Ok(existing) = self.read_records(tenant_id, workflow_id)
            && let Some(last) = existing.last()
        {
            previous_hash = last.record_hash.clone();
        }

        let ts = chrono::Utc::now().to_rfc3339();
        let seed = format!("{tenant_id}|{workflow_id}|{action_id}|{ts}|{previous_hash}");
        let record_id = format!("ar_{}", &sha256_hex(seed.as_bytes())[..24]);

        let mut record = AuditRecord {
            record_id,
            ts,
            tenant_id: tenant_id.to_string(),
            workflow_id: workflow_id.to_string(),
            action_id: action_id.to_string(),
            contract_json: canonical_contract_json.to_string(),
            action_hash: sha256_hex(canonical_contract_json.as_bytes()),
            success: result.success,
            failure_code: result.failure_code.map(|code| code.as_str().to_string()),
            pre_state_id: result.pre_state_id.clone(),
            post_state_id: result.post_state_id.clone(),
            state_delta: serde_json::to_value(&result.state_delta)?,
            network_summary: serde_json::to_value(&result.network_summary)?,
            artifacts: serde_json::to_value(&result.artifacts)?,
            telemetry: result.telemetry.clone(),
            metadata: result.metadata.clone(),
            previous_record_hash: previous_hash,
            signature: String::new(),
            record_hash: String::new(),
        };

        let payload = Self::canonical_payload_without_hash(&record)?;
        record.signature = self.sign(&payload);
        record.record_hash = sha256_hex(payload.as_bytes());

        let line = canonical_json(&record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|source| AuditError::Io {
                path: log_path.clone(),
                source,
            })?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_all())
            .map_err(|source| AuditError::Io {
                path: log_path.clone(),
                source,
            })?;

        last_hash.insert(chain_key, record.record_hash.clone());
        debug!(workflow_id, record_id = %record.record_id, "audit record appended");
        Ok(record)
    }

    fn read_records(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let log_path = self.workflow_log(tenant_id, workflow_id)?;
        if !log_path.exists() {
            return Ok(vec![]);
        }
        let raw = std::fs::read_to_string(&log_path).map_err(|source| AuditError::Io {
            path: log_path.clone(),
            source,
        })?;
        let mut records = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }

    /// All records for one workflow, in append order.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on filesystem or decode failure.
    pub async fn list_records(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        self.read_records(tenant_id, workflow_id)
    }

    /// The first record for an action id, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on filesystem or decode failure.
    pub async fn get_record_by_action(
        &self,
        tenant_id: &str,
        workflow_id: &str,
        action_id: &str,
    ) -> Result<Option<AuditRecord>, AuditError> {
        let records = self.read_records(tenant_id, workflow_id)?;
        Ok(records
            .into_iter()
            .find(|record| record.action_id == action_id))
    }

    /// Re-read the workflow's log and verify links, hashes, and signatures.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] on filesystem or decode failure; verification
    /// failures are reported in the outcome, not as errors.
    pub async fn verify_chain(
        &self,
        tenant_id: &str,
        workflow_id: &str,
    ) -> Result<ChainOutcome, AuditError> {
        let records = self.read_records(tenant_id, workflow_id)?;
        let mut previous_hash = String::new();

        for (index, record) in records.iter().enumerate() {
            if record.previous_record_hash != previous_hash {
                return Ok(ChainOutcome {
                    ok: false,
                    checked: records.len(),
                    violation: Some(ChainViolation::LinkMismatch { index }),
                });
            }
            let payload = Self::canonical_payload_without_hash(record)?;
            if sha256_hex(payload.as_bytes()) != record.record_hash {
                return Ok(ChainOutcome {
                    ok: false,
                    checked: records.len(),
                    violation: Some(ChainViolation::HashMismatch { index }),
                });
            }
            if !self.verify_signature(&payload, &record.signature) {
                return Ok(ChainOutcome {
                    ok: false,
                    checked: records.len(),
                    violation: Some(ChainViolation::SignatureMismatch { index }),
                });
            }
            previous_hash = record.record_hash.clone();
        }

        Ok(ChainOutcome {
            ok: true,
            checked: records.len(),
            violation: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use predator_core::FailureCode;

    fn result(action_id: &str, success: bool) -> ActionExecutionResult {
        ActionExecutionResult {
            action_id: action_id.into(),
            success,
            failure_code: (!success).then_some(FailureCode::PostconditionFailed),
            attempts: 1,
            escalation: None,
            verification_passed: success,
            pre_state_id: Some("s_pre".into()),
            post_state_id: Some("s_post".into()),
            state_delta: Default::default(),
            network_summary: Default::default(),
            telemetry: serde_json::json!({"elapsed_ms": 4}),
            artifacts: vec![],
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn chain_links_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::with_signing_key(dir.path(), b"secret").unwrap();

        let first = trail
            .append("t1", "wf", "act_a", r#"{"a":1}"#, &result("act_a", true))
            .await
            .unwrap();
        let second = trail
            .append("t1", "wf", "act_b", r#"{"b":2}"#, &result("act_b", false))
            .await
            .unwrap();

        assert_eq!(first.previous_record_hash, "");
        assert_eq!(second.previous_record_hash, first.record_hash);
        assert!(!first.signature.is_empty());

        let outcome = trail.verify_chain("t1", "wf").await.unwrap();
        assert!(outcome.ok);
        assert_eq!(outcome.checked, 2);
    }

    #[tokio::test]
    async fn unsigned_records_verify_with_empty_signatures() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::with_signing_key(dir.path(), b"").unwrap();
        let record = trail
            .append("t1", "wf", "act_a", r#"{"a":1}"#, &result("act_a", true))
            .await
            .unwrap();
        assert_eq!(record.signature, "");
        assert!(trail.verify_chain("t1", "wf").await.unwrap().ok);
    }

    #[tokio::test]
    async fn tampering_is_reported_at_the_failing_index() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::with_signing_key(dir.path(), b"secret").unwrap();
        trail
            .append("t1", "wf", "act_a", r#"{"a":1}"#, &result("act_a", true))
            .await
            .unwrap();
        trail
            .append("t1", "wf", "act_b", r#"{"b":2}"#, &result("act_b", true))
            .await
            .unwrap();

        // Flip the success flag on record 1 without re-hashing.
        let log = dir.path().join("t1").join("wf.jsonl");
        let raw = std::fs::read_to_string(&log).unwrap();
        let mut lines: Vec<String> = raw.lines().map(String::from).collect();
        lines[1] = lines[1].replace(r#""success":true"#, r#""success":false"#);
        std::fs::write(&log, lines.join("\n") + "\n").unwrap();

        let outcome = trail.verify_chain("t1", "wf").await.unwrap();
        assert!(!outcome.ok);
        assert_eq!(
            outcome.violation,
            Some(ChainViolation::HashMismatch { index: 1 })
        );
        assert_eq!(
            outcome.violation.unwrap().to_string(),
            "record_hash_mismatch_at_index_1"
        );
    }

    #[tokio::test]
    async fn chain_head_recovers_from_disk_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let trail = AuditTrail::with_signing_key(dir.path(), b"k").unwrap();
            trail
                .append("t1", "wf", "act_a", r#"{"a":1}"#, &result("act_a", true))
                .await
                .unwrap();
        }
        let trail = AuditTrail::with_signing_key(dir.path(), b"k").unwrap();
        let second = trail
            .append("t1", "wf", "act_b", r#"{"b":2}"#, &result("act_b", true))
            .await
            .unwrap();
        assert!(!second.previous_record_hash.is_empty());
        assert!(trail.verify_chain("t1", "wf").await.unwrap().ok);
    }

    #[tokio::test]
    async fn lookup_by_action_id_restores_a_result() {
        let dir = tempfile::tempdir().unwrap();
        let trail = AuditTrail::with_signing_key(dir.path(), b"").unwrap();
        trail
            .append("t1", "wf", "act_x", r#"{"x":1}"#, &result("act_x", false))
            .await
            .unwrap();

        let found = trail
            .get_record_by_action("t1", "wf", "act_x")
            .await
            .unwrap()
            .unwrap();
        let restored = found.to_execution_result();
        assert_eq!(restored.action_id, "act_x");
        assert!(!restored.success);
        assert_eq!(
            restored.failure_code,
            Some(FailureCode::PostconditionFailed)
        );

        assert!(
            trail
                .get_record_by_action("t1", "wf", "act_missing")
                .await
                .unwrap()
                .is_none()
        );
    }
}
