use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Failure classes, declared from least to most severe.
///
/// The orchestrator only ever retries [`ErrorClass::Transient`]; everything
/// else is surfaced immediately. When several errors are aggregated the most
/// severe class wins, which is why the variant order matters.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// A stale artifact could not be pruned. Logged, never fatal.
    #[display("partial-cleanup")]
    PartialCleanup,
    /// Network, connection or timeout failure. Retried with backoff.
    #[display("transient")]
    Transient,
    /// The target already has a job in flight. The run is skipped.
    #[display("concurrency")]
    Concurrency,
    /// The job was cancelled from outside (e.g. shutdown).
    #[display("cancelled")]
    Cancelled,
    /// The dump tool reported a data error, or an integrity check failed.
    #[display("permanent-data")]
    PermanentData,
    /// Bad credentials, permissions or configuration.
    #[display("permanent-config")]
    PermanentConfig,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        self == ErrorClass::Transient
    }

    /// Process exit code for a run whose worst failure has this class.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorClass::PartialCleanup => 0,
            ErrorClass::Transient | ErrorClass::Concurrency | ErrorClass::Cancelled => 75,
            ErrorClass::PermanentData => 65,
            ErrorClass::PermanentConfig => 78,
        }
    }
}
