//! Producing the raw SQL dump of a target.

pub mod mysqldump;

use crate::backup::config::BackupTarget;
use crate::backup::orchestrator::cancel::CancelToken;
use crate::backup::result_error::result::Result;
use std::fmt::Debug;
use std::io::Read;

/// A running dump. Read it to the end, then call [`DumpStream::finish`]:
/// bytes read from a stream whose `finish` fails must be discarded.
pub trait DumpStream: Read + Send {
    /// Waits for the dump to end and reports how it ended. A stream dropped
    /// without `finish` terminates the dump.
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait DumpExecutor: Send + Sync + Debug {
    /// Starts dumping `target`. Cancelling `cancel` terminates the dump
    /// promptly; its stream then ends and `finish` reports cancellation.
    fn start(&self, target: &BackupTarget, cancel: &CancelToken) -> Result<Box<dyn DumpStream>>;
}
