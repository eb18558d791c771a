use crate::backup::config::TargetId;
use crate::backup::digest::{HashingWriter, Sha256Digest};
use crate::backup::result_error::class::ErrorClass;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::secret::SecretRef;
use crate::backup::storage::artifact::{ArtifactKey, ArtifactManifest, BackupArtifact};
use crate::backup::storage::{
    ProvisionalHandle, ProvisionalLocation, StorageBackend, UploadedPart,
};
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bon::Builder;
use getset::Getters;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::Debug;
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, warn};
use validator::Validate;

fn default_part_size() -> usize {
    15 * 1024 * 1024
}

/// S3 or any S3-compatible object store.
///
/// Without `access_key_id` and `secret_access_key` the default AWS
/// credential chain is used.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct S3StorageConfig {
    #[validate(length(min = 3, max = 63))]
    #[builder(into)]
    bucket: String,
    #[validate(length(min = 1))]
    #[builder(into)]
    region: String,
    #[builder(into)]
    endpoint: Option<String>,
    /// Key prefix under which `<target>/` directories are created
    #[serde(default)]
    #[builder(default, into)]
    prefix: String,
    access_key_id: Option<SecretRef>,
    secret_access_key: Option<SecretRef>,
    /// Multipart part size; S3 rejects parts below 5 MiB except the last
    #[serde(default = "default_part_size")]
    #[validate(range(min = 5242880usize, max = 5368709120usize))]
    #[builder(default = default_part_size())]
    part_size: usize,
    #[serde(default)]
    #[builder(default)]
    force_path_style: bool,
}

/// Blocking object store operations the S3 backend is built from. Keys are
/// full object keys.
pub trait ObjectStore: Send + Sync + Debug {
    /// Starts a multipart upload and returns its id.
    fn create_upload(&self, key: &str) -> Result<String>;
    /// Uploads one part and returns its entity tag.
    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        body: Vec<u8>,
    ) -> Result<String>;
    /// Makes the uploaded parts visible as one object under `key`.
    fn complete_upload(&self, key: &str, upload_id: &str, parts: &[UploadedPart]) -> Result<()>;
    /// Succeeds when the upload is already gone.
    fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()>;
    /// `(key, upload id)` of every unfinished upload under `prefix`.
    fn list_uploads(&self, prefix: &str) -> Result<Vec<(String, String)>>;
    fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Box<dyn Read + Send + '_>>>;
    /// Size of the object, `None` when absent.
    fn head(&self, key: &str) -> Result<Option<u64>>;
    /// `(key, size)` of every object under `prefix`.
    fn list(&self, prefix: &str) -> Result<Vec<(String, u64)>>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Reads every page of a paginated listing. `fetch` loads the page at the
/// given marker and returns its items with the marker of the next page.
fn collect_pages<T, M, F>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<M>) -> Result<(Vec<T>, Option<M>)>,
{
    let mut items = vec![];
    let mut marker = None;
    loop {
        let (page, next) = fetch(marker.take())?;
        items.extend(page);
        match next {
            Some(next) => marker = Some(next),
            None => return Ok(items),
        }
    }
}

fn status_class(status: u16) -> ErrorClass {
    match status {
        429 => ErrorClass::Transient,
        400..=499 => ErrorClass::PermanentConfig,
        _ => ErrorClass::Transient,
    }
}

fn sdk_error<E>(operation: &str, err: SdkError<E, HttpResponse>) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let class = match &err {
        SdkError::ConstructionFailure(_) => ErrorClass::PermanentConfig,
        SdkError::ServiceError(e) => status_class(e.raw().status().as_u16()),
        _ => ErrorClass::Transient,
    };
    Error::ObjectStore {
        operation: operation.to_string(),
        class,
        message: DisplayErrorContext(&err).to_string(),
    }
}

fn is_not_found<E>(err: &SdkError<E, HttpResponse>) -> bool {
    matches!(err, SdkError::ServiceError(e) if e.raw().status().as_u16() == 404)
}

/// [`ObjectStore`] over the AWS SDK, driven from a private runtime.
#[derive(Debug)]
pub struct SdkObjectStore {
    client: Client,
    bucket: String,
    runtime: Runtime,
}

impl SdkObjectStore {
    pub fn new(config: &S3StorageConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("s3-io")
            .enable_all()
            .build()?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            let credentials = Credentials::new(
                id.resolve()?.inner(),
                secret.resolve()?.inner(),
                None,
                None,
                "db-backup-config",
            );
            loader = loader.credentials_provider(credentials);
        }
        let shared = runtime.block_on(loader.load());
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            runtime,
        })
    }
}

impl ObjectStore for SdkObjectStore {
    fn create_upload(&self, key: &str) -> Result<String> {
        self.runtime
            .block_on(
                self.client
                    .create_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .send(),
            )
            .map_err(|e| sdk_error("create_multipart_upload", e))?
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::ObjectStore {
                operation: "create_multipart_upload".to_string(),
                class: ErrorClass::Transient,
                message: "response carried no upload id".to_string(),
            })
    }

    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        body: Vec<u8>,
    ) -> Result<String> {
        let output = self
            .runtime
            .block_on(
                self.client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(number)
                    .body(ByteStream::from(body))
                    .send(),
            )
            .map_err(|e| sdk_error("upload_part", e))?;
        Ok(output.e_tag().unwrap_or_default().to_string())
    }

    fn complete_upload(&self, key: &str, upload_id: &str, parts: &[UploadedPart]) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.number)
                            .e_tag(&p.e_tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        self.runtime
            .block_on(
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(completed)
                    .send(),
            )
            .map_err(|e| sdk_error("complete_multipart_upload", e))?;
        Ok(())
    }

    fn abort_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        match self.runtime.block_on(
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .send(),
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(sdk_error("abort_multipart_upload", e)),
        }
    }

    fn list_uploads(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        collect_pages(|marker: Option<(Option<String>, Option<String>)>| {
            let (key_marker, upload_id_marker) = marker.unwrap_or_default();
            let output = self
                .runtime
                .block_on(
                    self.client
                        .list_multipart_uploads()
                        .bucket(&self.bucket)
                        .prefix(prefix)
                        .set_key_marker(key_marker)
                        .set_upload_id_marker(upload_id_marker)
                        .send(),
                )
                .map_err(|e| sdk_error("list_multipart_uploads", e))?;
            let page = output
                .uploads()
                .iter()
                .filter_map(|u| Some((u.key()?.to_string(), u.upload_id()?.to_string())))
                .collect();
            let next = match output.next_key_marker() {
                Some(key) if output.is_truncated() == Some(true) => Some((
                    Some(key.to_string()),
                    output.next_upload_id_marker().map(str::to_string),
                )),
                _ => None,
            };
            Ok((page, next))
        })
    }

    fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from(body))
                    .send(),
            )
            .map_err(|e| sdk_error("put_object", e))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Box<dyn Read + Send + '_>>> {
        match self.runtime.block_on(
            self.client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send(),
        ) {
            Ok(output) => Ok(Some(Box::new(ObjectReader {
                runtime: &self.runtime,
                body: output.body,
                chunk: vec![],
                pos: 0,
            }))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(sdk_error("get_object", e)),
        }
    }

    fn head(&self, key: &str) -> Result<Option<u64>> {
        match self.runtime.block_on(
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send(),
        ) {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(sdk_error("head_object", e)),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        collect_pages(|token: Option<String>| {
            let output = self
                .runtime
                .block_on(
                    self.client
                        .list_objects_v2()
                        .bucket(&self.bucket)
                        .prefix(prefix)
                        .set_continuation_token(token)
                        .send(),
                )
                .map_err(|e| sdk_error("list_objects_v2", e))?;
            let page = output
                .contents()
                .iter()
                .filter_map(|object| {
                    Some((object.key()?.to_string(), object.size().unwrap_or(0).max(0) as u64))
                })
                .collect();
            let next = match output.next_continuation_token() {
                Some(next) if output.is_truncated() == Some(true) => Some(next.to_string()),
                _ => None,
            };
            Ok((page, next))
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send(),
            )
            .map_err(|e| sdk_error("delete_object", e))?;
        Ok(())
    }
}

/// Blocking reader over an object body.
struct ObjectReader<'a> {
    runtime: &'a Runtime,
    body: ByteStream,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for ObjectReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.chunk.len() {
                let n = buf.len().min(self.chunk.len() - self.pos);
                buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            match self.runtime.block_on(self.body.try_next()) {
                Ok(Some(bytes)) => {
                    self.chunk = bytes.to_vec();
                    self.pos = 0;
                }
                Ok(None) => return Ok(0),
                Err(e) => return Err(std::io::Error::other(e)),
            }
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Stores artifacts as objects under `<prefix><target>/`.
///
/// `write_stream` uploads the artifact as a multipart upload that is left
/// open; an unfinished upload is invisible to listing. `finalize` puts the
/// manifest and then completes the upload, which makes the object appear
/// atomically under its final key.
#[derive(Debug)]
pub struct S3Backend {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    part_size: usize,
}

impl S3Backend {
    pub fn new(config: &S3StorageConfig) -> Result<Self> {
        Ok(Self::with_store(
            Arc::new(SdkObjectStore::new(config)?),
            &config.prefix,
            config.part_size,
        ))
    }

    pub fn with_store(store: Arc<dyn ObjectStore>, prefix: &str, part_size: usize) -> Self {
        Self {
            store,
            prefix: normalize_prefix(prefix),
            part_size,
        }
    }

    fn target_prefix(&self, target: &TargetId) -> String {
        format!("{}{}/", self.prefix, target)
    }

    fn object_key(&self, key: &ArtifactKey) -> String {
        format!("{}{}", self.target_prefix(&key.target), key.file_name)
    }

    fn manifest_object_key(&self, key: &ArtifactKey) -> String {
        format!("{}{}", self.target_prefix(&key.target), key.manifest_name())
    }

    fn upload_parts(
        &self,
        object_key: &str,
        upload_id: &str,
        stream: &mut dyn Read,
    ) -> Result<(Vec<UploadedPart>, u64, Sha256Digest)> {
        let mut hasher = HashingWriter::new(std::io::sink());
        let mut parts = vec![];
        loop {
            let mut chunk = Vec::with_capacity(self.part_size);
            Read::take(&mut *stream, self.part_size as u64).read_to_end(&mut chunk)?;
            // an empty stream still needs one (empty) part
            if chunk.is_empty() && !parts.is_empty() {
                break;
            }
            let last = chunk.len() < self.part_size;
            hasher.write_all(&chunk)?;

            let number = parts.len() as i32 + 1;
            let e_tag = self.store.upload_part(object_key, upload_id, number, chunk)?;
            parts.push(UploadedPart { number, e_tag });
            if last {
                break;
            }
        }
        let (_, sha256, size) = hasher.into_parts();
        Ok((parts, size, sha256))
    }

    fn read_manifest(&self, key: &ArtifactKey) -> Result<Option<ArtifactManifest>> {
        let Some(mut reader) = self.store.get(&self.manifest_object_key(key))? else {
            return Ok(None);
        };
        let mut bytes = vec![];
        reader.read_to_end(&mut bytes)?;
        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => {
                warn!("Unreadable manifest for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    /// `(name relative to prefix, size)` of every object under `prefix`.
    fn list_names(&self, prefix: &str) -> Result<Vec<(String, u64)>> {
        Ok(self
            .store
            .list(prefix)?
            .into_iter()
            .filter_map(|(key, size)| Some((key.strip_prefix(prefix)?.to_string(), size)))
            .collect())
    }
}

impl StorageBackend for S3Backend {
    fn write_stream(&self, key: &ArtifactKey, stream: &mut dyn Read) -> Result<ProvisionalHandle> {
        let object_key = self.object_key(key);
        let upload_id = self.store.create_upload(&object_key)?;

        match self.upload_parts(&object_key, &upload_id, stream) {
            Ok((parts, size, sha256)) => {
                debug!("Uploaded {} in {} parts ({} bytes)", object_key, parts.len(), size);
                Ok(ProvisionalHandle {
                    key: key.clone(),
                    size,
                    sha256,
                    location: ProvisionalLocation::Multipart {
                        object_key,
                        upload_id,
                        parts,
                    },
                })
            }
            Err(e) => {
                if let Err(abort_err) = self.store.abort_upload(&object_key, &upload_id) {
                    warn!("Failed to abort upload of {}: {}", object_key, abort_err);
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
        let ProvisionalLocation::Multipart {
            object_key,
            upload_id,
            parts,
        } = &handle.location
        else {
            return Err(Error::Io(std::io::Error::other(
                "handle was not created by the S3 backend",
            )));
        };

        self.store.put(
            &self.manifest_object_key(&handle.key),
            serde_json::to_vec_pretty(manifest)?,
        )?;
        if let Err(e) = self.store.complete_upload(object_key, upload_id, parts) {
            // the upload may have been completed by an attempt whose response was lost
            match self.store.head(object_key)? {
                Some(size) if size == handle.size => {
                    debug!("Upload of {} was already complete", object_key)
                }
                _ => return Err(e),
            }
        }

        Ok(BackupArtifact::from_manifest(handle.key.clone(), manifest))
    }

    fn abandon(&self, handle: &ProvisionalHandle) -> Result<()> {
        match &handle.location {
            ProvisionalLocation::Multipart {
                object_key,
                upload_id,
                ..
            } => self.store.abort_upload(object_key, upload_id),
            ProvisionalLocation::File(_) => Ok(()),
        }
    }

    fn list(&self, target: &TargetId) -> Result<Vec<BackupArtifact>> {
        let mut artifacts = vec![];
        for (name, size) in self.list_names(&self.target_prefix(target))? {
            let Some((key, created_at)) = ArtifactKey::parse(target, &name) else {
                continue;
            };
            let manifest = self.read_manifest(&key)?;
            artifacts.push(BackupArtifact::from_listing(key, created_at, size, manifest));
        }
        artifacts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        Ok(artifacts)
    }

    fn stat(&self, key: &ArtifactKey) -> Result<Option<BackupArtifact>> {
        let Some((_, created_at)) = ArtifactKey::parse(&key.target, &key.file_name) else {
            return Ok(None);
        };
        let Some(size) = self.store.head(&self.object_key(key))? else {
            return Ok(None);
        };
        let manifest = self.read_manifest(key)?;
        Ok(Some(BackupArtifact::from_listing(
            key.clone(),
            created_at,
            size,
            manifest,
        )))
    }

    /// Manifest goes first: a data object left behind lists as corrupt.
    fn delete(&self, key: &ArtifactKey) -> Result<()> {
        self.store.delete(&self.manifest_object_key(key))?;
        self.store.delete(&self.object_key(key))
    }

    fn open(&self, key: &ArtifactKey) -> Result<Box<dyn Read + Send + '_>> {
        self.store
            .get(&self.object_key(key))?
            .ok_or_else(|| Error::ArtifactMissing(key.to_string()))
    }

    fn reclaim_provisional(&self, target: &TargetId) -> Result<usize> {
        let prefix = self.target_prefix(target);
        let mut reclaimed = 0;

        for (object_key, upload_id) in self.store.list_uploads(&prefix)? {
            self.store.abort_upload(&object_key, &upload_id)?;
            debug!("Reclaimed upload {} of {}", upload_id, object_key);
            reclaimed += 1;
        }

        let objects = self.list_names(&prefix)?;
        for (name, _) in &objects {
            let Some(data) = ArtifactKey::data_name_of_manifest(name) else {
                continue;
            };
            if objects.iter().any(|(other, _)| other == data) {
                continue;
            }
            self.store.delete(&format!("{prefix}{name}"))?;
            debug!("Reclaimed orphan manifest {}{}", prefix, name);
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}
