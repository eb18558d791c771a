//! Triggers orchestrator runs: once on demand, or on each target's cron
//! schedule until cancelled.

use crate::backup::config::{AppConfig, BackupTarget, TargetId};
use crate::backup::dump::mysqldump::MysqldumpExecutor;
use crate::backup::notifications::{Notification, NotificationConfig};
use crate::backup::orchestrator::cancel::CancelToken;
use crate::backup::orchestrator::state::BackupJob;
use crate::backup::orchestrator::Orchestrator;
use crate::backup::result_error::class::ErrorClass;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::storage::artifact::BackupArtifact;
use crate::backup::storage::StorageBackend;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Longest the daemon sleeps before looking at finished jobs and the
/// schedule again
const MAX_IDLE: Duration = Duration::from_secs(60);
/// How often the daemon looks for finished jobs while some are in flight
const BUSY_POLL: Duration = Duration::from_secs(1);

/// Outcome of every job one invocation triggered.
#[derive(Debug)]
pub struct RunReport {
    pub jobs: Vec<BackupJob>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &BackupJob> {
        self.jobs.iter().filter(|job| !job.is_completed())
    }

    /// 0 when every job completed, otherwise the code of the most severe
    /// failure.
    pub fn exit_code(&self) -> i32 {
        self.jobs
            .iter()
            .filter_map(BackupJob::error_class)
            .max()
            .map(|class| class.exit_code())
            .unwrap_or(0)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.jobs.iter().join("\n"))
    }
}

pub struct Runner {
    config: AppConfig,
    orchestrator: Arc<Orchestrator>,
    backends: HashMap<TargetId, Arc<dyn StorageBackend>>,
    pool: ThreadPool,
}

impl Runner {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let orchestrator = Orchestrator::builder()
            .executor(Arc::new(MysqldumpExecutor::new(config.dump())))
            .retry(config.retry().clone())
            .verify_after_upload(*config.verify_after_upload())
            .build();
        Self::new(config.clone(), orchestrator)
    }

    pub fn new(config: AppConfig, orchestrator: Orchestrator) -> Result<Self> {
        let backends = config
            .targets()
            .iter()
            .map(|t| {
                t.storage()
                    .build()
                    .map(|backend| (t.id().clone(), backend))
                    .add_msg(format!("Storage setup failed for {}", t.id()))
            })
            .collect::<Result<HashMap<_, _>>>()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(*config.concurrency())
            .thread_name(|i| format!("backup-worker-{i}"))
            .build()?;
        Ok(Self {
            config,
            orchestrator: Arc::new(orchestrator),
            backends,
            pool,
        })
    }

    fn backend(&self, target: &TargetId) -> Result<Arc<dyn StorageBackend>> {
        self.backends
            .get(target)
            .cloned()
            .ok_or_else(|| Error::UnknownTarget(target.to_string()))
    }

    /// Resolves `ids`; every configured target when empty.
    fn select(&self, ids: &[&str]) -> Result<Vec<&BackupTarget>> {
        if ids.is_empty() {
            return Ok(self.config.targets().iter().collect());
        }
        ids.iter().map(|id| self.config.target(id)).collect()
    }

    /// Runs each selected target once, concurrently up to the configured
    /// concurrency, and waits for all of them.
    pub fn run_once(&self, ids: &[&str], cancel: &CancelToken) -> Result<RunReport> {
        let targets = self.select(ids)?;
        let jobs = self.pool.install(|| {
            targets
                .par_iter()
                .map(|target| match self.backend(target.id()) {
                    Ok(backend) => self.orchestrator.run(target, backend.as_ref(), cancel),
                    Err(e) => failed_job(target.id(), e, self.orchestrator.clock().now()),
                })
                .collect::<Vec<_>>()
        });
        let report = RunReport { jobs };
        self.notify(report.failures());
        Ok(report)
    }

    /// Complete and corrupt artifacts of a target, oldest first.
    pub fn list(&self, id: &str) -> Result<Vec<BackupArtifact>> {
        let target = self.config.target(id)?;
        self.backend(target.id())?.list(target.id())
    }

    /// First time `target` is due: the next schedule instant after its
    /// newest artifact, which is in the past when a run was missed.
    pub fn first_fire(&self, target: &BackupTarget) -> Result<DateTime<Utc>> {
        let newest = match self.backend(target.id())?.list(target.id()) {
            Ok(artifacts) => artifacts
                .iter()
                .filter(|a| a.is_complete())
                .map(|a| a.created_at)
                .max(),
            Err(e) => {
                warn!("Cannot list {} to resume its schedule: {}", target.id(), e);
                None
            }
        };
        next_fire(target, newest.unwrap_or(DateTime::UNIX_EPOCH))
    }

    /// Fires every target on its schedule until `cancel`, then waits for
    /// in-flight jobs, which the cancellation also stops.
    ///
    /// Returns the most severe class among the jobs that failed, leaving out
    /// those stopped by the shutdown itself.
    pub fn daemon(&self, cancel: &CancelToken) -> Result<Option<ErrorClass>> {
        let clock = self.orchestrator.clock().clone();
        let targets = self.config.targets();
        let mut due: HashMap<TargetId, DateTime<Utc>> = targets
            .iter()
            .map(|t| self.first_fire(t).map(|at| (t.id().clone(), at)))
            .collect::<Result<_>>()?;
        for (id, at) in due.iter().sorted() {
            info!("Next backup of {} at {}", id, at);
        }

        let (tx, rx) = mpsc::channel::<BackupJob>();
        let mut in_flight: HashSet<TargetId> = HashSet::new();
        let mut worst: Option<ErrorClass> = None;
        loop {
            for job in rx.try_iter() {
                in_flight.remove(job.target());
                worst = worst.max(self.finished(job, cancel));
            }
            if cancel.is_cancelled() {
                break;
            }

            let now = clock.now();
            for target in targets {
                let id = target.id();
                if in_flight.contains(id) || due.get(id).is_some_and(|at| *at > now) {
                    continue;
                }
                let backend = self.backend(id)?;
                let next = next_fire(target, now)?;
                info!("Starting scheduled backup of {}, next at {}", id, next);
                due.insert(id.clone(), next);
                in_flight.insert(id.clone());

                let orchestrator = self.orchestrator.clone();
                let target = target.clone();
                let cancel = cancel.clone();
                let tx = tx.clone();
                self.pool.spawn(move || {
                    let job = orchestrator.run(&target, backend.as_ref(), &cancel);
                    // the daemon only stops listening after every job reported
                    let _ = tx.send(job);
                });
            }

            let now = clock.now();
            let idle = due
                .iter()
                .filter(|(id, _)| !in_flight.contains(*id))
                .map(|(_, at)| (*at - now).to_std().unwrap_or(Duration::ZERO))
                .min()
                .unwrap_or(MAX_IDLE)
                .min(if in_flight.is_empty() { MAX_IDLE } else { BUSY_POLL });
            if clock.sleep(idle, cancel) {
                info!("Shutdown requested, waiting for {} running job(s)", in_flight.len());
            }
        }

        while !in_flight.is_empty() {
            match rx.recv() {
                Ok(job) => {
                    in_flight.remove(job.target());
                    worst = worst.max(self.finished(job, cancel));
                }
                Err(_) => break,
            }
        }
        Ok(worst)
    }

    /// Logs or notifies a finished job and returns the class it counts
    /// toward the daemon's outcome.
    fn finished(&self, job: BackupJob, cancel: &CancelToken) -> Option<ErrorClass> {
        if job.is_completed() {
            info!("{}", job);
            return None;
        }
        self.notify(std::iter::once(&job));
        job.error_class()
            .filter(|class| !(cancel.is_cancelled() && *class == ErrorClass::Cancelled))
    }

    /// Sends one report for the given failed jobs; a failing notification
    /// is only logged.
    fn notify<'a, I: Iterator<Item = &'a BackupJob>>(&self, failed: I) {
        let Some(notification) = self.config.notification() else {
            return;
        };
        send_report(notification, &failed.collect_vec());
    }
}

fn send_report(notification: &NotificationConfig, failed: &[&BackupJob]) {
    if failed.is_empty() {
        return;
    }
    let topic = format!(
        "[db-backup] backup failed: {}",
        failed.iter().map(|job| job.target()).join(", ")
    );
    let body = failed.iter().join("\n\n");
    if let Err(e) = notification.send(topic, body) {
        warn!("Failed to send failure notification: {}", e);
    }
}

fn failed_job(target: &TargetId, err: Error, now: DateTime<Utc>) -> BackupJob {
    let mut job = BackupJob::new(target.clone(), now);
    job.fail(err, now);
    job
}

/// The first schedule instant of `target` strictly after `after`.
pub fn next_fire(target: &BackupTarget, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    cron_parser::parse(target.schedule(), &after)
        .map_err(|e| Error::InvalidSchedule(format!("{}: {:?}", target.schedule(), e)))
}
