use crate::backup::config::TargetId;
use crate::backup::digest::{HashingWriter, Sha256Digest};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::storage::artifact::{ArtifactKey, ArtifactManifest, BackupArtifact};
use crate::backup::storage::{ProvisionalHandle, ProvisionalLocation, StorageBackend};
use crate::backup::validate::validate_writable_dir;
use bon::Builder;
use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use validator::Validate;

static PROVISIONAL_SUFFIX: &str = ".tmp";

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct LocalStorageConfig {
    #[validate(custom(function = validate_writable_dir))]
    #[builder(into)]
    path: PathBuf,
}

/// Stores artifacts as files under `<root>/<target>/`.
///
/// Provisional files carry a `.tmp` suffix and are renamed into place by
/// `finalize`, after the manifest was written.
#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn target_dir(&self, target: &TargetId) -> PathBuf {
        self.root.join(target.as_ref())
    }

    fn data_path(&self, key: &ArtifactKey) -> PathBuf {
        self.target_dir(&key.target).join(&*key.file_name)
    }

    fn manifest_path(&self, key: &ArtifactKey) -> PathBuf {
        self.target_dir(&key.target).join(key.manifest_name())
    }

    fn provisional_path(&self, key: &ArtifactKey) -> PathBuf {
        self.target_dir(&key.target)
            .join(format!("{}{}", key.file_name, PROVISIONAL_SUFFIX))
    }

    fn write_file(path: &Path, stream: &mut dyn Read) -> Result<(u64, Sha256Digest)> {
        let file = File::create_new(path)?;
        let mut writer = HashingWriter::new(BufWriter::new(file));
        std::io::copy(stream, &mut writer)?;
        writer.flush()?;
        let (buffered, digest, size) = writer.into_parts();
        let file = buffered.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok((size, digest))
    }

    fn write_manifest(&self, key: &ArtifactKey, manifest: &ArtifactManifest) -> Result<()> {
        let dir = self.target_dir(&key.target);
        let mut tmp = tempfile::Builder::new()
            .prefix(".manifest")
            .suffix(PROVISIONAL_SUFFIX)
            .tempfile_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, manifest)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.manifest_path(key))
            .map_err(|e| Error::from(e.error))?;
        Ok(())
    }

    pub(crate) fn delete_manifest(&self, key: &ArtifactKey) -> Result<()> {
        remove_if_exists(&self.manifest_path(key))?;
        Ok(())
    }

    fn read_manifest(&self, key: &ArtifactKey) -> Option<ArtifactManifest> {
        let bytes = fs::read(self.manifest_path(key)).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Unreadable manifest for {}: {}", key, e);
                None
            }
        }
    }

    fn listing_entry(&self, key: ArtifactKey, created_at: DateTime<Utc>, size: u64) -> BackupArtifact {
        let manifest = self.read_manifest(&key);
        BackupArtifact::from_listing(key, created_at, size, manifest)
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl StorageBackend for LocalBackend {
    fn write_stream(&self, key: &ArtifactKey, stream: &mut dyn Read) -> Result<ProvisionalHandle> {
        fs::create_dir_all(self.target_dir(&key.target))?;
        let path = self.provisional_path(key);
        match Self::write_file(&path, stream) {
            Ok((size, sha256)) => {
                debug!("Wrote provisional {:?} ({} bytes)", path, size);
                Ok(ProvisionalHandle {
                    key: key.clone(),
                    size,
                    sha256,
                    location: ProvisionalLocation::File(path),
                })
            }
            Err(e) => {
                if let Err(remove_err) = remove_if_exists(&path) {
                    warn!("Failed to remove provisional {:?}: {}", path, remove_err);
                }
                Err(e.add_msg(format!("write {key}")))
            }
        }
    }

    fn finalize(
        &self,
        handle: &ProvisionalHandle,
        manifest: &ArtifactManifest,
    ) -> Result<BackupArtifact> {
        handle.confirm(manifest)?;
        let ProvisionalLocation::File(provisional) = &handle.location else {
            return Err(Error::Io(std::io::Error::other(
                "handle was not created by the local backend",
            )));
        };

        let data_path = self.data_path(&handle.key);
        if !provisional.exists() {
            // an earlier attempt already renamed the file into place
            return match self.stat(&handle.key)? {
                Some(artifact) if artifact.is_complete() => Ok(artifact),
                _ => Err(Error::ArtifactMissing(handle.key.to_string())),
            };
        }

        self.write_manifest(&handle.key, manifest)
            .add_msg(format!("write manifest of {}", handle.key))?;
        if let Err(e) = fs::rename(provisional, &data_path) {
            let _ = remove_if_exists(&self.manifest_path(&handle.key));
            return Err(Error::from(e).add_msg(format!("commit {}", handle.key)));
        }
        if let Ok(dir) = File::open(self.target_dir(&handle.key.target)) {
            let _ = dir.sync_all();
        }

        Ok(BackupArtifact::from_manifest(handle.key.clone(), manifest))
    }

    fn abandon(&self, handle: &ProvisionalHandle) -> Result<()> {
        if let ProvisionalLocation::File(path) = &handle.location {
            remove_if_exists(path)?;
        }
        Ok(())
    }

    fn list(&self, target: &TargetId) -> Result<Vec<BackupArtifact>> {
        let entries = match fs::read_dir(self.target_dir(target)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut artifacts = vec![];
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some((key, created_at)) = name.to_str().and_then(|n| ArtifactKey::parse(target, n))
            else {
                continue;
            };
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            artifacts.push(self.listing_entry(key, created_at, metadata.len()));
        }
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        Ok(artifacts)
    }

    fn stat(&self, key: &ArtifactKey) -> Result<Option<BackupArtifact>> {
        let Some((_, created_at)) = ArtifactKey::parse(&key.target, &key.file_name) else {
            return Ok(None);
        };
        match fs::metadata(self.data_path(key)) {
            Ok(metadata) => Ok(Some(self.listing_entry(key.clone(), created_at, metadata.len()))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Manifest goes first: a data file left behind lists as corrupt.
    fn delete(&self, key: &ArtifactKey) -> Result<()> {
        self.delete_manifest(key)?;
        remove_if_exists(&self.data_path(key))?;
        Ok(())
    }

    fn open(&self, key: &ArtifactKey) -> Result<Box<dyn Read + Send + '_>> {
        match File::open(self.data_path(key)) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::ArtifactMissing(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reclaim_provisional(&self, target: &TargetId) -> Result<usize> {
        let dir = self.target_dir(target);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut reclaimed = 0;
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let orphan_manifest = ArtifactKey::data_name_of_manifest(&name)
                .is_some_and(|data| !dir.join(data).exists());
            if name.ends_with(PROVISIONAL_SUFFIX) || orphan_manifest {
                if remove_if_exists(&entry.path())? {
                    debug!("Reclaimed {:?}", entry.path());
                    reclaimed += 1;
                }
            }
        }
        Ok(reclaimed)
    }
}
