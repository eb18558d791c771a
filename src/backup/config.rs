//! Application and per-target configuration, loaded from YAML.

use crate::backup::compress::CompressorConfig;
use crate::backup::encrypt::EncryptorConfig;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::notifications::NotificationConfig;
use crate::backup::orchestrator::retry::RetryConfig;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::retention::RetentionPolicy;
use crate::backup::secret::SecretRef;
use crate::backup::storage::StorageConfig;
use crate::backup::validate::{validate_cron_str, validate_target_id};
use bon::Builder;
use derive_more::{Deref, Display, From};
use getset::Getters;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::{Path, PathBuf};
use std::result;
use std::sync::Arc;
use validator::{Validate, ValidationError, ValidationErrors};

/// Identifier of a backup target; also the artifact name prefix.
#[derive(
    Clone, Debug, Display, From, Deref, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TargetId(Arc<str>);

impl From<&str> for TargetId {
    fn from(value: &str) -> Self {
        TargetId(value.into())
    }
}

impl AsRef<str> for TargetId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    /// One consistent read view for InnoDB tables, no table locks
    #[default]
    SingleTransaction,
    /// Locks each database's tables for the duration of its dump
    LockTables,
    /// Table-by-table dump without locks; not consistent across tables
    None,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseSelector {
    All,
    Databases(Vec<String>),
}

impl Validate for DatabaseSelector {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            DatabaseSelector::Databases(names)
                if names.is_empty() || names.iter().any(String::is_empty) =>
            {
                let mut errors = ValidationErrors::new();
                errors.add(
                    "databases",
                    ValidationError::new("length")
                        .with_message("database list must name at least one database".into()),
                );
                Err(errors)
            }
            _ => Ok(()),
        }
    }
}

fn default_port() -> u16 {
    3306
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct DatabaseConfig {
    #[validate(length(min = 1))]
    #[builder(into)]
    host: String,
    #[serde(default = "default_port")]
    #[builder(default = default_port())]
    port: u16,
    #[validate(length(min = 1))]
    #[builder(into)]
    user: String,
    password: SecretRef,
    #[validate(nested)]
    select: DatabaseSelector,
}

/// One database to protect, with its artifact format, retention and
/// destination. Immutable for the lifetime of a run.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct BackupTarget {
    #[validate(custom(function = validate_target_id))]
    #[builder(into)]
    id: TargetId,
    #[validate(custom(function = validate_cron_str))]
    #[builder(into)]
    schedule: Arc<str>,
    #[validate(nested)]
    database: DatabaseConfig,
    #[serde(default)]
    #[builder(default)]
    snapshot: SnapshotMode,
    #[serde(default)]
    #[validate(nested)]
    #[builder(default)]
    compressor: CompressorConfig,
    #[serde(default)]
    #[validate(nested)]
    #[builder(default)]
    encryptor: EncryptorConfig,
    #[validate(nested)]
    retention: RetentionPolicy,
    #[validate(nested)]
    storage: StorageConfig,
}

static DUMP_FILE_EXT: &str = "sql";

impl FileExtProvider for BackupTarget {
    fn file_ext(&self) -> Option<Arc<str>> {
        Some(
            std::iter::once(Arc::from(DUMP_FILE_EXT))
                .chain(self.compressor.file_ext())
                .chain(self.encryptor.file_ext())
                .join(".")
                .into(),
        )
    }
}

fn default_dump_binary() -> PathBuf {
    PathBuf::from("mysqldump")
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct DumpConfig {
    #[serde(default = "default_dump_binary")]
    #[builder(default = default_dump_binary(), into)]
    binary: PathBuf,
    /// Passed to the dump tool before the database selection
    #[serde(default)]
    #[builder(default)]
    extra_args: Vec<String>,
}

impl Default for DumpConfig {
    fn default() -> Self {
        DumpConfig::builder().build()
    }
}

fn default_concurrency() -> usize {
    2
}

fn default_true() -> bool {
    true
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct AppConfig {
    /// Number of targets backed up at the same time
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1))]
    #[builder(default = default_concurrency())]
    concurrency: usize,
    #[serde(default)]
    #[validate(nested)]
    #[builder(default)]
    dump: DumpConfig,
    #[serde(default)]
    #[validate(nested)]
    #[builder(default)]
    retry: RetryConfig,
    /// Re-read each artifact after finalize and check its digest
    #[serde(default = "default_true")]
    #[builder(default = true)]
    verify_after_upload: bool,
    #[serde(default)]
    #[validate(nested)]
    notification: Option<NotificationConfig>,
    #[validate(length(min = 1))]
    #[validate(nested)]
    #[validate(custom(function = validate_unique_target_ids))]
    targets: Vec<BackupTarget>,
}

fn validate_unique_target_ids(targets: &[BackupTarget]) -> result::Result<(), ValidationError> {
    let duplicates = targets.iter().map(|t| &t.id).duplicates().join(", ");
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new("DuplicateTargetId")
            .with_message(format!("duplicate target ids: {duplicates}").into()))
    }
}

impl AppConfig {
    /// Parses and validates a YAML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
        let path = path.as_ref();
        let config: AppConfig = std::fs::File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader(f).map_err(Error::from))
            .add_msg(format!("Parse YAML config failed: {path:?}"))?;
        config
            .validate()
            .map_err(Error::from)
            .add_msg(format!("Config validation failed: {path:?}"))?;
        Ok(config)
    }

    pub fn target(&self, id: &str) -> Result<&BackupTarget> {
        self.targets
            .iter()
            .find(|t| t.id.as_ref() == id)
            .ok_or_else(|| Error::UnknownTarget(id.to_string()))
    }
}
