use crate::backup::config::TargetId;
use crate::backup::result_error::class::ErrorClass;
use crate::backup::result_error::error::Error;
use crate::backup::storage::artifact::{ArtifactKey, BackupArtifact};
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use std::fmt;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum JobState {
    #[display("idle")]
    Idle,
    #[display("acquiring-lock")]
    AcquiringLock,
    #[display("dumping")]
    Dumping,
    #[display("processing")]
    Processing,
    #[display("uploading")]
    Uploading,
    #[display("finalizing")]
    Finalizing,
    #[display("pruning")]
    Pruning,
    #[display("completed")]
    Completed,
    #[display("failed")]
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Whether the job may move from `self` to `next`. A failed produce
    /// attempt re-enters `Dumping`, a failed finalize re-enters
    /// `Finalizing`.
    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, AcquiringLock)
            | (AcquiringLock, Dumping)
            | (Dumping, Processing)
            | (Processing, Uploading)
            | (Uploading, Finalizing)
            | (Finalizing, Pruning)
            | (Pruning, Completed) => true,
            (Dumping | Processing | Uploading, Dumping) | (Finalizing, Finalizing) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub state: JobState,
    pub at: DateTime<Utc>,
}

/// One execution of a target's backup, from trigger to a terminal state.
#[derive(Debug, Getters, CopyGetters)]
pub struct BackupJob {
    #[getset(get = "pub")]
    target: TargetId,
    #[getset(get_copy = "pub")]
    started_at: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    state: JobState,
    /// Dump attempts made, the first one included
    #[getset(get_copy = "pub")]
    attempts: u32,
    #[getset(get_copy = "pub")]
    finalize_attempts: u32,
    #[getset(get = "pub")]
    last_error: Option<Error>,
    /// State the job was in when it failed
    #[getset(get_copy = "pub")]
    failed_in: Option<JobState>,
    #[getset(get = "pub")]
    artifact: Option<BackupArtifact>,
    #[getset(get = "pub")]
    pruned: Vec<ArtifactKey>,
    /// Cleanup that did not happen; never changes the job's outcome
    #[getset(get = "pub")]
    cleanup_failures: Vec<Error>,
    #[getset(get = "pub")]
    history: Vec<Transition>,
}

impl BackupJob {
    pub fn new(target: TargetId, now: DateTime<Utc>) -> Self {
        Self {
            target,
            started_at: now,
            state: JobState::Idle,
            attempts: 0,
            finalize_attempts: 0,
            last_error: None,
            failed_in: None,
            artifact: None,
            pruned: vec![],
            cleanup_failures: vec![],
            history: vec![Transition {
                state: JobState::Idle,
                at: now,
            }],
        }
    }

    pub fn advance(&mut self, next: JobState, now: DateTime<Utc>) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        info!(target_id = %self.target, from = %self.state, to = %next, "Job transition");
        match next {
            JobState::Dumping => self.attempts += 1,
            JobState::Finalizing => self.finalize_attempts += 1,
            _ => {}
        }
        self.state = next;
        self.history.push(Transition { state: next, at: now });
    }

    pub fn fail(&mut self, err: Error, now: DateTime<Utc>) {
        error!(
            target_id = %self.target,
            state = %self.state,
            class = %err.class(),
            "Backup failed: {}",
            err
        );
        self.failed_in = Some(self.state);
        self.last_error = Some(err);
        self.advance(JobState::Failed, now);
    }

    pub fn set_artifact(&mut self, artifact: BackupArtifact) {
        self.artifact = Some(artifact);
    }

    pub fn record_pruned(&mut self, key: ArtifactKey) {
        self.pruned.push(key);
    }

    pub fn record_cleanup_failure(&mut self, err: Error) {
        self.cleanup_failures.push(err);
    }

    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }

    /// The class deciding the exit code: `None` for a completed job.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self.state {
            JobState::Completed => None,
            _ => Some(
                self.last_error
                    .as_ref()
                    .map(Error::class)
                    .unwrap_or(ErrorClass::Transient),
            ),
        }
    }

    pub fn visited(&self, state: JobState) -> bool {
        self.history.iter().any(|t| t.state == state)
    }
}

impl fmt::Display for BackupJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.target, self.state)?;
        if let Some(artifact) = &self.artifact {
            write!(f, " {} ({} bytes)", artifact.key, artifact.size)?;
        }
        if !self.pruned.is_empty() {
            write!(f, ", pruned {}", self.pruned.iter().join(", "))?;
        }
        if let (Some(phase), Some(err)) = (self.failed_in, &self.last_error) {
            write!(
                f,
                " in {} after {} attempt(s) ({}):\n{}",
                phase,
                self.attempts,
                err.class(),
                indent::indent_all_with("  ", err.to_string())
            )?;
        }
        for err in &self.cleanup_failures {
            write!(
                f,
                "\n  cleanup ({}): {}",
                ErrorClass::PartialCleanup,
                err
            )?;
        }
        Ok(())
    }
}
