//! Fakes shared by the orchestrator and scheduler tests.

use crate::backup::config::{BackupTarget, DatabaseConfig, DatabaseSelector, TargetId};
use crate::backup::dump::{DumpExecutor, DumpStream};
use crate::backup::orchestrator::cancel::CancelToken;
use crate::backup::orchestrator::clock::Clock;
use crate::backup::result_error::class::ErrorClass;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::retention::RetentionPolicy;
use crate::backup::secret::SecretRef;
use crate::backup::storage::artifact::{ArtifactKey, ArtifactManifest, BackupArtifact};
use crate::backup::storage::local::{LocalBackend, LocalStorageConfig};
use crate::backup::storage::{ProvisionalHandle, StorageBackend, StorageConfig};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const DUMP: &[u8] = b"CREATE TABLE t (id INT);\nINSERT INTO t VALUES (1),(2),(3);\n";

pub fn target(id: &str, root: &Path) -> BackupTarget {
    target_with_retention(id, root, RetentionPolicy::new(Some(7), None))
}

pub fn target_with_retention(id: &str, root: &Path, retention: RetentionPolicy) -> BackupTarget {
    BackupTarget::builder()
        .id(id)
        .schedule("0 3 * * *")
        .database(
            DatabaseConfig::builder()
                .host("db.internal")
                .user("backup")
                .password(SecretRef::Value("s3cret".into()))
                .select(DatabaseSelector::All)
                .build(),
        )
        .retention(retention)
        .storage(StorageConfig::Local(
            LocalStorageConfig::builder().path(root).build(),
        ))
        .build()
}

/// Clock whose sleeps return at once and move time forward instead.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
    cancel_on_sleep: Mutex<Option<CancelToken>>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2026, 10, 16, 3, 0, 0).unwrap())
    }
}

impl FakeClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(vec![]),
            cancel_on_sleep: Mutex::new(None),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    /// The next sleep cancels `token` instead of passing time.
    pub fn cancel_on_sleep(&self, token: CancelToken) {
        *self.cancel_on_sleep.lock().unwrap() = Some(token);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> bool {
        self.sleeps.lock().unwrap().push(duration);
        if let Some(token) = self.cancel_on_sleep.lock().unwrap().take() {
            token.cancel();
        }
        if cancel.is_cancelled() {
            return true;
        }
        self.advance(chrono::Duration::from_std(duration).unwrap());
        // let real threads make progress while simulated time passes
        std::thread::sleep(Duration::from_millis(1));
        cancel.is_cancelled()
    }
}

/// What the next dump started by [`ScriptedDumpExecutor`] does.
#[derive(Debug)]
pub enum Script {
    Succeed(Vec<u8>),
    /// Streams the bytes, then the dump tool exits with a failure of `class`
    FailAfter(Vec<u8>, ErrorClass),
    /// Signals `entered` on the first read and holds the stream until
    /// `release` fires
    Gated {
        bytes: Vec<u8>,
        entered: CancelToken,
        release: CancelToken,
    },
    /// Streams the bytes, then blocks like a stuck dump until the job is
    /// cancelled
    HangUntilCancelled(Vec<u8>),
}

#[derive(Debug, Default)]
pub struct ScriptedDumpExecutor {
    scripts: Mutex<VecDeque<Script>>,
    starts: AtomicU32,
}

impl ScriptedDumpExecutor {
    pub fn new<I: IntoIterator<Item = Script>>(scripts: I) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            starts: AtomicU32::new(0),
        }
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }
}

impl DumpExecutor for ScriptedDumpExecutor {
    fn start(&self, target: &BackupTarget, cancel: &CancelToken) -> Result<Box<dyn DumpStream>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::Succeed(DUMP.to_vec()));
        Ok(Box::new(ScriptedStream {
            target: target.id().clone(),
            script,
            pos: 0,
            cancel: cancel.clone(),
        }))
    }
}

struct ScriptedStream {
    target: TargetId,
    script: Script,
    pos: usize,
    cancel: CancelToken,
}

impl Read for ScriptedStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes = match &self.script {
            Script::Succeed(b) | Script::FailAfter(b, _) | Script::HangUntilCancelled(b) => b,
            Script::Gated {
                bytes,
                entered,
                release,
            } => {
                if self.pos == 0 {
                    entered.cancel();
                    release.wait_timeout(Duration::from_secs(10));
                }
                bytes
            }
        };
        if self.pos < bytes.len() {
            let n = buf.len().min(bytes.len() - self.pos);
            buf[..n].copy_from_slice(&bytes[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        if let Script::HangUntilCancelled(_) = self.script {
            while !self.cancel.wait_timeout(Duration::from_millis(10)) {}
        }
        Ok(0)
    }
}

impl DumpStream for ScriptedStream {
    fn finish(self: Box<Self>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.script {
            Script::FailAfter(_, class) => Err(Error::DumpFailed {
                target: self.target.to_string(),
                class,
                diagnostic: "scripted failure".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// Local backend with injectable faults.
#[derive(Debug)]
pub struct FaultyBackend {
    pub inner: LocalBackend,
    finalize_failures: AtomicU32,
    write_calls: AtomicU32,
    finalize_calls: AtomicU32,
    tamper_reads: AtomicBool,
    fail_deletes: AtomicBool,
    cancel_after_finalize: Mutex<Option<CancelToken>>,
}

impl FaultyBackend {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: LocalBackend::new(root),
            finalize_failures: AtomicU32::new(0),
            write_calls: AtomicU32::new(0),
            finalize_calls: AtomicU32::new(0),
            tamper_reads: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            cancel_after_finalize: Mutex::new(None),
        }
    }

    /// The next `n` finalize calls fail with a transient error before
    /// touching the store.
    pub fn fail_finalize(&self, n: u32) {
        self.finalize_failures.store(n, Ordering::SeqCst);
    }

    /// Reads return the stored bytes with the first byte flipped.
    pub fn tamper_reads(&self) {
        self.tamper_reads.store(true, Ordering::SeqCst);
    }

    /// Deletes remove the manifest and then fail on the data file, the way
    /// a store that goes away halfway through a delete leaves things.
    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    /// Cancels `token` once the next finalize succeeded.
    pub fn cancel_after_finalize(&self, token: CancelToken) {
        *self.cancel_after_finalize.lock().unwrap() = Some(token);
    }

    pub fn write_calls(&self) -> u32 {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> u32 {
        self.finalize_calls.load(Ordering::SeqCst)
    }
}

impl StorageBackend for FaultyBackend {
    fn write_stream(&self, key: &ArtifactKey, stream: &mut dyn Read) -> Result<ProvisionalHandle> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.write_stream(key, stream)
    }

    fn finalize(
        &self,
        handle: &ProvisionalHandle,
        manifest: &ArtifactManifest,
    ) -> Result<BackupArtifact> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.finalize_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.finalize_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::ObjectStore {
                operation: "finalize".into(),
                class: ErrorClass::Transient,
                message: "connection reset".into(),
            });
        }
        let artifact = self.inner.finalize(handle, manifest)?;
        if let Some(token) = self.cancel_after_finalize.lock().unwrap().take() {
            token.cancel();
        }
        Ok(artifact)
    }

    fn abandon(&self, handle: &ProvisionalHandle) -> Result<()> {
        self.inner.abandon(handle)
    }

    fn list(&self, target: &TargetId) -> Result<Vec<BackupArtifact>> {
        self.inner.list(target)
    }

    fn stat(&self, key: &ArtifactKey) -> Result<Option<BackupArtifact>> {
        self.inner.stat(key)
    }

    fn delete(&self, key: &ArtifactKey) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            self.inner.delete_manifest(key)?;
            return Err(Error::ObjectStore {
                operation: "delete".into(),
                class: ErrorClass::Transient,
                message: "access temporarily denied".into(),
            });
        }
        self.inner.delete(key)
    }

    fn open(&self, key: &ArtifactKey) -> Result<Box<dyn Read + Send + '_>> {
        let mut reader = self.inner.open(key)?;
        if !self.tamper_reads.load(Ordering::SeqCst) {
            return Ok(reader);
        }
        let mut bytes = vec![];
        reader.read_to_end(&mut bytes)?;
        if let Some(first) = bytes.first_mut() {
            *first ^= 0xff;
        }
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn reclaim_provisional(&self, target: &TargetId) -> Result<usize> {
        self.inner.reclaim_provisional(target)
    }
}
