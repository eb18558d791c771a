use crate::backup::result_error::class::ErrorClass;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use itertools::Itertools;
use std::io::ErrorKind;
use thiserror::Error;
use thiserror_ext::Construct;

#[derive(Error, Debug, Construct)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    LiblzmaStream(#[from] liblzma::stream::Error),
    #[error(transparent)]
    ValidationError(#[from] validator::ValidationErrors),
    #[error(transparent)]
    ThreadPoolBuildError(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    SerdeYml(#[from] serde_yml::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Lettre(#[from] lettre::error::Error),
    #[error(transparent)]
    SmtpTransport(#[from] lettre::transport::smtp::Error),
    #[error("SMTP server rejected message: {0}")]
    SmtpSendError(String),
    #[error("invalid schedule {0:?}")]
    InvalidSchedule(String),
    #[error("unknown target {0:?}")]
    UnknownTarget(String),
    #[error("credential unavailable: {0}")]
    MissingCredential(String),
    #[error("dump of {target:?} failed ({class}): {diagnostic}")]
    DumpFailed {
        target: String,
        class: ErrorClass,
        diagnostic: String,
    },
    #[error("compression/encryption stage failed: {0}")]
    Processing(std::io::Error),
    #[error("object store {operation} failed ({class}): {message}")]
    ObjectStore {
        operation: String,
        class: ErrorClass,
        message: String,
    },
    #[error("checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("artifact {0} not found after finalize")]
    ArtifactMissing(String),
    #[error("backup of {0:?} already in progress")]
    ConcurrentRun(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("byte pipe closed before the stream completed")]
    PipeClosed,
    #[error("{}:\n{}", msg, indent::indent_all_with("  ", error.to_string()))]
    WithMsg { msg: String, error: Box<Error> },
    #[error("{} failed:\n{}", fn_name, indent::indent_all_with("  ", error.to_string()))]
    WithFunctionName { error: Box<Error>, fn_name: String },
    #[error("{}", itertools::join(.0, "\n\n"))]
    LotsOfError(Vec<Error>),
}

impl<S: Into<String>> AddMsg<S> for Error {
    fn add_msg(self, msg: S) -> Self {
        Self::WithMsg {
            msg: msg.into(),
            error: Box::new(self),
        }
    }
}

impl<S: Into<String>> AddFunctionName<S> for Error {
    fn add_fn_name(self, fn_name: S) -> Self {
        Self::WithFunctionName {
            error: Box::new(self),
            fn_name: fn_name.into(),
        }
    }
}

impl From<Vec<Error>> for Error {
    fn from(errors: Vec<Error>) -> Self {
        if errors.is_empty() {
            panic!("Should not create lots of errors when error is empty")
        }
        Self::LotsOfError(errors.into_iter().flat_map(|e| e.into_iter()).collect_vec())
    }
}

fn io_error_class(e: &std::io::Error) -> ErrorClass {
    match e.kind() {
        ErrorKind::PermissionDenied | ErrorKind::NotFound => ErrorClass::PermanentConfig,
        _ => ErrorClass::Transient,
    }
}

impl Error {
    pub fn into_iter(self) -> Box<dyn Iterator<Item = Error>> {
        match self {
            Error::LotsOfError(v) => Box::new(v.into_iter().flat_map(|e| e.into_iter())),
            e => Box::new(std::iter::once(e)),
        }
    }

    /// The failure class that decides retry and exit-code behaviour.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Io(e) => io_error_class(e),
            Error::DumpFailed { class, .. } | Error::ObjectStore { class, .. } => *class,
            Error::LiblzmaStream(_)
            | Error::Processing(_)
            | Error::ChecksumMismatch { .. }
            | Error::ArtifactMissing(_) => ErrorClass::PermanentData,
            Error::ValidationError(_)
            | Error::ThreadPoolBuildError(_)
            | Error::SerdeYml(_)
            | Error::SerdeJson(_)
            | Error::Lettre(_)
            | Error::SmtpTransport(_)
            | Error::SmtpSendError(_)
            | Error::InvalidSchedule(_)
            | Error::UnknownTarget(_)
            | Error::MissingCredential(_) => ErrorClass::PermanentConfig,
            Error::ConcurrentRun(_) => ErrorClass::Concurrency,
            Error::Cancelled => ErrorClass::Cancelled,
            Error::PipeClosed => ErrorClass::Transient,
            Error::WithMsg { error, .. } | Error::WithFunctionName { error, .. } => error.class(),
            Error::LotsOfError(errors) => errors
                .iter()
                .map(Error::class)
                .max()
                .unwrap_or(ErrorClass::Transient),
        }
    }

    /// True when the innermost cause is the pipe being closed by its reader.
    pub fn is_pipe_closed(&self) -> bool {
        match self {
            Error::PipeClosed => true,
            Error::WithMsg { error, .. } | Error::WithFunctionName { error, .. } => {
                error.is_pipe_closed()
            }
            _ => false,
        }
    }
}
