//! Drives one backup job of one target through its lifecycle.
//!
//! A job takes the target's lock, streams the dump through the artifact
//! pipeline into a provisional artifact, finalizes it, optionally re-reads
//! it, and finally prunes what the retention policy no longer wants. The
//! produce phase (dump, process, upload) and the finalize phase retry
//! independently, so a failed finalize never re-runs the dump.

pub mod cancel;
pub mod clock;
pub mod lock;
pub mod retry;
pub mod state;

use crate::backup::config::BackupTarget;
use crate::backup::dump::DumpExecutor;
use crate::backup::file_ext::FileExtProvider;
use crate::backup::orchestrator::cancel::CancelToken;
use crate::backup::orchestrator::clock::{Clock, SystemClock};
use crate::backup::orchestrator::lock::TargetLocks;
use crate::backup::orchestrator::retry::RetryConfig;
use crate::backup::orchestrator::state::{BackupJob, JobState};
use crate::backup::pipe::pipe;
use crate::backup::pipeline::{ArtifactPipeline, PipelineSummary};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::storage::artifact::{ArtifactKey, ArtifactManifest, BackupArtifact};
use crate::backup::storage::{ProvisionalHandle, StorageBackend};
use bon::Builder;
use chrono::SubsecRound;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Chunks buffered between the pipeline and the upload
const PIPE_DEPTH: usize = 16;

#[derive(Debug, Builder)]
pub struct Orchestrator {
    executor: Arc<dyn DumpExecutor>,
    #[builder(default)]
    locks: TargetLocks,
    #[builder(default)]
    retry: RetryConfig,
    #[builder(default = Arc::new(SystemClock))]
    clock: Arc<dyn Clock>,
    #[builder(default = true)]
    verify_after_upload: bool,
}

impl Orchestrator {
    pub fn locks(&self) -> &TargetLocks {
        &self.locks
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Runs one job of `target` against `backend` to a terminal state.
    ///
    /// Never returns an error: the outcome, including every failure, is
    /// recorded on the returned job.
    ///
    /// Once the artifact is committed a cancellation no longer fails the job:
    /// pruning is skipped, the cancellation is recorded as a cleanup failure
    /// and the job completes.
    pub fn run(
        &self,
        target: &BackupTarget,
        backend: &dyn StorageBackend,
        cancel: &CancelToken,
    ) -> BackupJob {
        let mut job = BackupJob::new(target.id().clone(), self.clock.now());
        job.advance(JobState::AcquiringLock, self.clock.now());
        let Some(_guard) = self.locks.try_acquire(target.id()) else {
            job.fail(Error::ConcurrentRun(target.id().to_string()), self.clock.now());
            return job;
        };

        match backend.reclaim_provisional(target.id()) {
            Ok(0) => {}
            Ok(n) => info!("Reclaimed {} provisional artifact(s) of {}", n, target.id()),
            Err(e) => warn!("Failed to reclaim provisional artifacts of {}: {}", target.id(), e),
        }

        if let Err(e) = self.backup(&mut job, target, backend, cancel) {
            job.fail(e, self.clock.now());
            return job;
        }
        job.advance(JobState::Pruning, self.clock.now());
        if cancel.is_cancelled() {
            job.record_cleanup_failure(Error::Cancelled.add_msg("prune skipped"));
        } else {
            self.prune(&mut job, target, backend);
        }
        job.advance(JobState::Completed, self.clock.now());
        job
    }

    fn backup(
        &self,
        job: &mut BackupJob,
        target: &BackupTarget,
        backend: &dyn StorageBackend,
        cancel: &CancelToken,
    ) -> Result<()> {
        let pipeline = ArtifactPipeline::for_target(target);
        let created_at = self.clock.now().trunc_subsecs(3);
        let ext = target
            .file_ext()
            .map(|ext| ext.to_string())
            .unwrap_or_default();
        let key = ArtifactKey::new(target.id(), created_at, &ext);

        let (handle, summary) = self.retry.run(self.clock.as_ref(), cancel, |attempt| {
            debug!("Produce attempt {} for {}", attempt, key);
            self.produce(job, target, &pipeline, backend, &key, cancel)
        })?;

        let manifest = ArtifactManifest {
            target: target.id().clone(),
            file_name: key.file_name.clone(),
            created_at,
            uncompressed_size: summary.uncompressed_size,
            compressed_size: summary.compressed_size,
            sha256: summary.sha256,
            compressor: pipeline.compressor_ext(),
            encryptor: pipeline.encryptor_ext(),
        };

        let finalized = self.retry.run(self.clock.as_ref(), cancel, |_| {
            job.advance(JobState::Finalizing, self.clock.now());
            backend.finalize(&handle, &manifest)
        });
        let artifact = match finalized {
            Ok(artifact) => artifact,
            Err(e) => {
                if let Err(abandon_err) = backend.abandon(&handle) {
                    warn!("Failed to abandon {}: {}", key, abandon_err);
                }
                return Err(e.add_msg(format!("finalize {key}")));
            }
        };

        if self.verify_after_upload {
            if let Err(e) = verify(backend, &key) {
                // cleanup runs even when the job is being cancelled
                let deleted = self
                    .retry
                    .run(self.clock.as_ref(), &CancelToken::new(), |_| backend.delete(&key));
                if let Err(delete_err) = deleted {
                    warn!("Failed to delete unverified {}: {}", key, delete_err);
                    job.record_cleanup_failure(
                        delete_err.add_msg(format!("delete unverified {key}")),
                    );
                }
                return Err(e.add_msg(format!("verify {key}")));
            }
            debug!("Verified {}", key);
        }

        info!(
            "Stored {} ({} bytes, {} uncompressed)",
            artifact.key, artifact.size, summary.uncompressed_size
        );
        job.set_artifact(artifact);
        Ok(())
    }

    /// One produce attempt: dump, pipeline and upload run concurrently
    /// over a bounded pipe.
    fn produce(
        &self,
        job: &mut BackupJob,
        target: &BackupTarget,
        pipeline: &ArtifactPipeline,
        backend: &dyn StorageBackend,
        key: &ArtifactKey,
        cancel: &CancelToken,
    ) -> Result<(ProvisionalHandle, PipelineSummary)> {
        job.advance(JobState::Dumping, self.clock.now());
        let mut dump = self.executor.start(target, cancel)?;
        job.advance(JobState::Processing, self.clock.now());
        let (writer, mut reader) = pipe(PIPE_DEPTH);
        let abort = writer.abort_handle();
        job.advance(JobState::Uploading, self.clock.now());

        let (produced, stored) = thread::scope(|s| {
            let producer = s.spawn(move || {
                let produced = pipeline
                    .run(&mut dump, writer)
                    .and_then(|(writer, summary)| {
                        dump.finish()?;
                        writer.close().map_err(|_| Error::PipeClosed)?;
                        Ok(summary)
                    });
                if let Err(e) = &produced {
                    abort.abort(e.to_string());
                }
                produced
            });

            let stored = backend.write_stream(key, &mut reader);
            // unblocks the producer if the upload gave up early
            drop(reader);
            let produced = producer.join().unwrap_or_else(|_| {
                Err(Error::Processing(std::io::Error::other(
                    "pipeline thread panicked",
                )))
            });
            (produced, stored)
        });

        match (produced, stored) {
            (Ok(summary), Ok(handle)) => Ok((handle, summary)),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(handle)) => {
                if let Err(abandon_err) = backend.abandon(&handle) {
                    warn!("Failed to abandon {}: {}", key, abandon_err);
                }
                Err(e)
            }
            // a closed pipe only tells that the upload side failed first
            (Err(e), Err(store_err)) if e.is_pipe_closed() => Err(store_err),
            (Err(e), Err(store_err)) => {
                debug!("Upload of {} ended with: {}", key, store_err);
                Err(e)
            }
        }
    }

    /// Deletes corrupt artifacts and whatever retention no longer keeps.
    /// Failures are recorded on the job but never fail it.
    fn prune(&self, job: &mut BackupJob, target: &BackupTarget, backend: &dyn StorageBackend) {
        let artifacts = match backend.list(target.id()) {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!("Failed to list artifacts of {}: {}", target.id(), e);
                job.record_cleanup_failure(e.add_msg(format!("list {}", target.id())));
                return;
            }
        };

        let current = job.artifact().as_ref().map(|a| a.key.clone());
        let (complete, corrupt): (Vec<BackupArtifact>, Vec<BackupArtifact>) =
            artifacts.into_iter().partition(BackupArtifact::is_complete);
        let stale = target
            .retention()
            .get_delete(complete, self.clock.now())
            .into_iter()
            .filter(|a| Some(&a.key) != current.as_ref());

        for artifact in corrupt.into_iter().chain(stale) {
            match backend.delete(&artifact.key) {
                Ok(()) => {
                    info!("Pruned {} ({})", artifact.key, artifact.status);
                    job.record_pruned(artifact.key);
                }
                Err(e) => {
                    warn!("Failed to prune {}: {}", artifact.key, e);
                    job.record_cleanup_failure(e.add_msg(format!("prune {}", artifact.key)));
                }
            }
        }
    }
}

fn verify(backend: &dyn StorageBackend, key: &ArtifactKey) -> Result<()> {
    let artifact = backend
        .stat(key)?
        .ok_or_else(|| Error::ArtifactMissing(key.to_string()))?;
    backend.verify(&artifact)
}
