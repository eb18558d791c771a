//! Artifact identity, naming and the manifest stored next to each artifact.

use crate::backup::config::TargetId;
use crate::backup::digest::Sha256Digest;
use crate::backup::retention::Timestamped;
use chrono::{DateTime, NaiveDateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::sync::Arc;

static TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";
static DUMP_EXT: &str = "sql";
static KNOWN_STAGE_EXTS: [&str; 3] = ["xz", "gz", "age"];
static MANIFEST_SUFFIX: &str = ".manifest.json";

/// Names one artifact: `<target>/<target>.<UTC time>.<ext>`.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[display("{target}/{file_name}")]
pub struct ArtifactKey {
    pub target: TargetId,
    pub file_name: Arc<str>,
}

impl ArtifactKey {
    pub fn new(target: &TargetId, created_at: DateTime<Utc>, ext: &str) -> Self {
        Self {
            target: target.clone(),
            file_name: format!("{}.{}.{}", target, created_at.format(TIME_FORMAT), ext).into(),
        }
    }

    /// Recognises an artifact file name of `target` and returns its key and
    /// creation time. Provisional files, manifests and foreign files yield
    /// `None`.
    pub fn parse(target: &TargetId, file_name: &str) -> Option<(Self, DateTime<Utc>)> {
        let rest = file_name.strip_prefix(target.as_ref())?.strip_prefix('.')?;
        let (time, ext) = rest.split_once('.').and_then(|(date_part, after)| {
            // the time contains one '.' before its milliseconds
            let (millis, ext) = after.split_once('.')?;
            Some((format!("{date_part}.{millis}"), ext))
        })?;

        let mut stages = ext.split('.');
        if stages.next()? != DUMP_EXT || !stages.all(|s| KNOWN_STAGE_EXTS.contains(&s)) {
            return None;
        }

        let created_at = NaiveDateTime::parse_from_str(&time, TIME_FORMAT)
            .ok()?
            .and_utc();
        Some((
            Self {
                target: target.clone(),
                file_name: file_name.into(),
            },
            created_at,
        ))
    }

    pub fn manifest_name(&self) -> String {
        format!("{}{}", self.file_name, MANIFEST_SUFFIX)
    }

    /// Data file name a manifest name belongs to.
    pub fn data_name_of_manifest(file_name: &str) -> Option<&str> {
        file_name.strip_suffix(MANIFEST_SUFFIX)
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Written under a provisional name, not yet finalized
    #[display("pending")]
    Pending,
    /// Finalized with a consistent manifest
    #[display("complete")]
    Complete,
    /// Present under a final name but without a matching manifest
    #[display("corrupt")]
    Corrupt,
}

/// Metadata recorded in `<artifact>.manifest.json` during finalize.
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub target: TargetId,
    pub file_name: Arc<str>,
    pub created_at: DateTime<Utc>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    pub sha256: Sha256Digest,
    /// Compression format extension, `None` when stored uncompressed
    #[serde(default)]
    pub compressor: Option<String>,
    #[serde(default)]
    pub encryptor: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupArtifact {
    pub key: ArtifactKey,
    pub created_at: DateTime<Utc>,
    /// Stored size, after compression and encryption
    pub size: u64,
    pub uncompressed_size: Option<u64>,
    pub checksum: Option<Sha256Digest>,
    pub status: ArtifactStatus,
}

impl Timestamped for BackupArtifact {
    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl BackupArtifact {
    pub fn from_manifest(key: ArtifactKey, manifest: &ArtifactManifest) -> Self {
        Self {
            key,
            created_at: manifest.created_at,
            size: manifest.compressed_size,
            uncompressed_size: Some(manifest.uncompressed_size),
            checksum: Some(manifest.sha256.clone()),
            status: ArtifactStatus::Complete,
        }
    }

    /// Builds the listing entry for a stored object. The artifact is only
    /// complete when its manifest exists and agrees with the stored object.
    pub fn from_listing(
        key: ArtifactKey,
        created_at: DateTime<Utc>,
        stored_size: u64,
        manifest: Option<ArtifactManifest>,
    ) -> Self {
        match manifest {
            Some(m) if m.compressed_size == stored_size && m.file_name == key.file_name => {
                Self::from_manifest(key, &m)
            }
            _ => Self {
                key,
                created_at,
                size: stored_size,
                uncompressed_size: None,
                checksum: None,
                status: ArtifactStatus::Corrupt,
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ArtifactStatus::Complete
    }
}
