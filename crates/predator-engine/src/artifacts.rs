// SPDX-License-Identifier: MIT OR Apache-2.0

//! Download/upload artifact lifecycle with content-addressed ids.
//!
//! Downloads are persisted under `<root>/<workflow>/<file>`; uploads
//! reference pre-existing files unchanged. Ids are `up_`/`dl_` plus the
//! first 20 hex chars of the content SHA-256.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use predator_core::ArtifactRecord;
use predator_driver::DownloadPayload;

const OCTET_STREAM: &str = "application/octet-stream";

/// Errors from artifact registration and persistence.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// The upload source does not exist or is not a file.
    #[error("artifact source not found: {0}")]
    SourceNotFound(PathBuf),
    /// Filesystem failure while reading or writing artifact bytes.
    #[error("artifact io failure at {path}: {source}")]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

/// Registry of artifact records plus the download directory tree.
#[derive(Debug)]
pub struct ArtifactManager {
    root: PathBuf,
    records: Mutex<HashMap<String, ArtifactRecord>>,
}

fn sha256_hex_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl ArtifactManager {
    /// Build a manager rooted at `root`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Io`] when the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| ArtifactError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            records: Mutex::new(HashMap::new()),
        })
    }

    fn workflow_dir(&self, workflow_id: &str) -> Result<PathBuf, ArtifactError> {
        let dir = self.root.join(workflow_id.replace('/', "_"));
        std::fs::create_dir_all(&dir).map_err(|source| ArtifactError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Register a pre-existing file as an upload artifact.
    ///
    /// # Errors
    ///
    /// [`ArtifactError::SourceNotFound`] when the path is not a readable
    /// file; [`ArtifactError::Io`] on read failure.
    pub fn register_existing_upload(
        &self,
        workflow_id: &str,
        action_id: &str,
        source_path: &Path,
    ) -> Result<ArtifactRecord, ArtifactError> {
        if !source_path.is_file() {
            return Err(ArtifactError::SourceNotFound(source_path.to_path_buf()));
        }
        let bytes = std::fs::read(source_path).map_err(|source| ArtifactError::Io {
            path: source_path.to_path_buf(),
            source,
        })?;
        let digest = sha256_hex_of(&bytes);
        let record = ArtifactRecord {
            artifact_id: format!("up_{}", &digest[..20]),
            workflow_id: workflow_id.to_string(),
            action_id: action_id.to_string(),
            path: source_path.display().to_string(),
            mime: OCTET_STREAM.to_string(),
            size: bytes.len() as u64,
            sha256: digest,
        };
        self.records
            .lock()
            .expect("records lock poisoned")
            .insert(record.artifact_id.clone(), record.clone());
        Ok(record)
    }

    /// Persist a completed download under the workflow's directory.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError::Io`] on write failure.
    pub async fn save_download(
        &self,
        workflow_id: &str,
        action_id: &str,
        download: DownloadPayload,
    ) -> Result<ArtifactRecord, ArtifactError> {
        let dir = self.workflow_dir(workflow_id)?;
        let filename = if download.suggested_filename.is_empty() {
            "download.bin".to_string()
        } else {
            download.suggested_filename.replace('/', "_")
        };
        let target = dir.join(filename);
        tokio::fs::write(&target, &download.bytes)
            .await
            .map_err(|source| ArtifactError::Io {
                path: target.clone(),
                source,
            })?;

        let digest = sha256_hex_of(&download.bytes);
        let record = ArtifactRecord {
            artifact_id: format!("dl_{}", &digest[..20]),
            workflow_id: workflow_id.to_string(),
            action_id: action_id.to_string(),
            path: target.display().to_string(),
            mime: OCTET_STREAM.to_string(),
            size: download.bytes.len() as u64,
            sha256: digest,
        };
        self.records
            .lock()
            .expect("records lock poisoned")
            .insert(record.artifact_id.clone(), record.clone());
        Ok(record)
    }

    /// Look up a registered artifact.
    #[must_use]
    pub fn get_record(&self, artifact_id: &str) -> Option<ArtifactRecord> {
        self.records
            .lock()
            .expect("records lock poisoned")
            .get(artifact_id)
            .cloned()
    }

    /// All records for one workflow.
    #[must_use]
    pub fn list_workflow_records(&self, workflow_id: &str) -> Vec<ArtifactRecord> {
        let mut records: Vec<ArtifactRecord> = self
            .records
            .lock()
            .expect("records lock poisoned")
            .values()
            .filter(|record| record.workflow_id == workflow_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.artifact_id.cmp(&b.artifact_id));
        records
    }

    /// Remove a workflow's download directory and forget its records.
    pub fn purge_workflow(&self, workflow_id: &str) {
        let dir = self.root.join(workflow_id.replace('/', "_"));
        let _ = std::fs::remove_dir_all(&dir);
        self.records
            .lock()
            .expect("records lock poisoned")
            .retain(|_, record| record.workflow_id != workflow_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn downloads_are_content_addressed_under_the_workflow_dir() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ArtifactManager::new(dir.path()).unwrap();
        let record = manager
            .save_download(
                "wf-1",
                "act_x",
                DownloadPayload {
                    suggested_filename: "report.csv".into(),
                    bytes: b"a,b\n".to_vec(),
                },
            )
            .await
            .unwrap();

        assert!(record.artifact_id.starts_with("dl_"));
        assert_eq!(record.artifact_id.len(), 3 + 20);
        assert_eq!(record.size, 4);
        assert!(record.path.contains("wf-1"));
        assert!(std::path::Path::new(&record.path).exists());

        // Same bytes, same id.
        let again = manager
            .save_download(
                "wf-1",
                "act_y",
                DownloadPayload {
                    suggested_filename: "report.csv".into(),
                    bytes: b"a,b\n".to_vec(),
                },
            )
            .await
            .unwrap();
        assert_eq!(again.artifact_id, record.artifact_id);
    }

    #[test]
    fn uploads_require_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ArtifactManager::new(dir.path().join("artifacts")).unwrap();

        let missing = dir.path().join("absent.bin");
        assert!(matches!(
            manager.register_existing_upload("wf", "act_a", &missing),
            Err(ArtifactError::SourceNotFound(_))
        ));

        let source = dir.path().join("upload.bin");
        std::fs::write(&source, b"payload").unwrap();
        let record = manager
            .register_existing_upload("wf", "act_a", &source)
            .unwrap();
        assert!(record.artifact_id.starts_with("up_"));
        assert_eq!(record.size, 7);
        assert_eq!(manager.get_record(&record.artifact_id).unwrap(), record);
    }

    #[tokio::test]
    async fn purge_removes_files_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ArtifactManager::new(dir.path()).unwrap();
        let record = manager
            .save_download(
                "wf-gone",
                "act_x",
                DownloadPayload {
                    suggested_filename: "x.bin".into(),
                    bytes: vec![1, 2, 3],
                },
            )
            .await
            .unwrap();
        manager.purge_workflow("wf-gone");
        assert!(manager.get_record(&record.artifact_id).is_none());
        assert!(!std::path::Path::new(&record.path).exists());
    }
}
