//! Durable homes for backup artifacts.
//!
//! Every backend follows the same two-step protocol: bytes are streamed to a
//! provisional location that listing never reports as complete, then
//! `finalize` records the manifest and commits the artifact under its final
//! name. Anything that fails in between is abandoned or reclaimed later, so
//! a partial artifact can never be mistaken for a finished backup.

pub mod artifact;
pub mod local;
pub mod s3;

use crate::backup::config::TargetId;
use crate::backup::digest::Sha256Digest;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::storage::artifact::{ArtifactKey, ArtifactManifest, BackupArtifact};
use crate::backup::storage::local::{LocalBackend, LocalStorageConfig};
use crate::backup::storage::s3::{S3Backend, S3StorageConfig};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::Read;
use std::path::PathBuf;
use std::result;
use std::sync::Arc;
use validator::{Validate, ValidationErrors};

/// Where a provisional artifact lives until it is finalized or abandoned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisionalLocation {
    File(PathBuf),
    Multipart {
        object_key: String,
        upload_id: String,
        parts: Vec<UploadedPart>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedPart {
    pub number: i32,
    pub e_tag: String,
}

/// Result of a completed `write_stream`: the bytes are stored but the
/// artifact is still pending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionalHandle {
    pub key: ArtifactKey,
    /// Bytes the backend received and stored
    pub size: u64,
    /// Digest of the bytes the backend received
    pub sha256: Sha256Digest,
    pub location: ProvisionalLocation,
}

impl ProvisionalHandle {
    /// Checks that what the backend stored is what the pipeline produced.
    pub fn confirm(&self, manifest: &ArtifactManifest) -> Result<()> {
        if self.sha256 != manifest.sha256 || self.size != manifest.compressed_size {
            return Err(Error::ChecksumMismatch {
                key: self.key.to_string(),
                expected: format!("{} ({} bytes)", manifest.sha256, manifest.compressed_size),
                actual: format!("{} ({} bytes)", self.sha256, self.size),
            });
        }
        Ok(())
    }
}

pub trait StorageBackend: Send + Sync + Debug {
    /// Streams `stream` into a provisional location for `key`. Nothing is
    /// left behind when this returns an error.
    fn write_stream(&self, key: &ArtifactKey, stream: &mut dyn Read) -> Result<ProvisionalHandle>;

    /// Stores the manifest and commits the artifact under its final name.
    /// Safe to call again after a failure: a retry either completes the
    /// commit or finds it already done.
    fn finalize(
        &self,
        handle: &ProvisionalHandle,
        manifest: &ArtifactManifest,
    ) -> Result<BackupArtifact>;

    /// Discards a provisional artifact. Discarding one that is already gone
    /// succeeds.
    fn abandon(&self, handle: &ProvisionalHandle) -> Result<()>;

    /// Complete and corrupt artifacts of `target`, oldest first. Provisional
    /// artifacts are never listed.
    fn list(&self, target: &TargetId) -> Result<Vec<BackupArtifact>>;

    fn stat(&self, key: &ArtifactKey) -> Result<Option<BackupArtifact>>;

    /// Deletes an artifact and its manifest. Deleting a missing artifact
    /// succeeds.
    fn delete(&self, key: &ArtifactKey) -> Result<()>;

    fn open(&self, key: &ArtifactKey) -> Result<Box<dyn Read + Send + '_>>;

    /// Removes provisional leftovers of `target` from interrupted runs and
    /// returns how many were removed. Only call while holding the target's
    /// lock.
    fn reclaim_provisional(&self, target: &TargetId) -> Result<usize>;

    /// Re-reads a stored artifact and compares it with its manifest.
    fn verify(&self, artifact: &BackupArtifact) -> Result<()> {
        let expected = artifact
            .checksum
            .clone()
            .ok_or_else(|| Error::ArtifactMissing(format!("{} has no manifest", artifact.key)))?;
        let (actual, size) = Sha256Digest::of_reader(self.open(&artifact.key)?)?;
        if actual != expected || size != artifact.size {
            return Err(Error::ChecksumMismatch {
                key: artifact.key.to_string(),
                expected: format!("{} ({} bytes)", expected, artifact.size),
                actual: format!("{} ({} bytes)", actual, size),
            });
        }
        Ok(())
    }
}

/// Per-target destination.
///
/// ```yaml
/// storage: { backend: local, path: /var/backups/mysql }
/// storage: { backend: s3, bucket: backups, region: eu-west-1, ... }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Local(LocalStorageConfig),
    S3(S3StorageConfig),
}

impl Validate for StorageConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            StorageConfig::Local(c) => c.validate(),
            StorageConfig::S3(c) => c.validate(),
        }
    }
}

impl StorageConfig {
    pub fn build(&self) -> Result<Arc<dyn StorageBackend>> {
        Ok(match self {
            StorageConfig::Local(c) => Arc::new(LocalBackend::new(c.path())),
            StorageConfig::S3(c) => Arc::new(S3Backend::new(c)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::class::ErrorClass;
    use chrono::Utc;

    fn handle(size: u64, sha: &str) -> ProvisionalHandle {
        ProvisionalHandle {
            key: ArtifactKey::new(&"shop".into(), Utc::now(), "sql"),
            size,
            sha256: Sha256Digest::from(sha.to_string()),
            location: ProvisionalLocation::File(PathBuf::from("/nowhere")),
        }
    }

    fn manifest(handle: &ProvisionalHandle, size: u64, sha: &str) -> ArtifactManifest {
        ArtifactManifest {
            target: handle.key.target.clone(),
            file_name: handle.key.file_name.clone(),
            created_at: Utc::now(),
            uncompressed_size: 100,
            compressed_size: size,
            sha256: Sha256Digest::from(sha.to_string()),
            compressor: None,
            encryptor: None,
        }
    }

    #[test]
    fn test_confirm() {
        let h = handle(10, "aa");
        assert!(h.confirm(&manifest(&h, 10, "aa")).is_ok());

        let err = h.confirm(&manifest(&h, 10, "bb")).unwrap_err();
        assert_eq!(err.class(), ErrorClass::PermanentData);
        let err = h.confirm(&manifest(&h, 11, "aa")).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_storage_config_tagged() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!("backend: local\npath: {}\n", dir.path().display());
        let config: StorageConfig = serde_yml::from_str(&yaml).unwrap();
        assert!(matches!(config, StorageConfig::Local(_)));
        config.validate().unwrap();
        assert!(config.build().is_ok());
    }
}
