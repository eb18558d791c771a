use crate::backup::compress::{Compressor, CompressorBuilder};
use crate::backup::result_error::result::Result;
use liblzma::stream::{Check, MtStreamBuilder};
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use std::num::NonZero;
use validator::Validate;

static DEFAULT_COMPRESSION_LEVEL: u32 = 6;
/// Upper bound for the automatic thread count
static DEFAULT_MAX_PARALLELIZATION: usize = 8;

/// XZ (LZMA) compression.
///
/// Dumps are text and compress very well; level 6 is the usual xz default.
/// With more than one thread the multi-threaded encoder is used, which
/// trades memory for speed on large dumps.
#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct XzConfig {
    /// Compression level (0-9)
    #[validate(range(min = 0, max = 9))]
    #[serde(default)]
    level: Option<u32>,

    /// Encoder threads; a quarter of the available cores when unset, since
    /// several targets may be compressing at the same time
    #[validate(range(min = 1))]
    #[serde(default)]
    thread: Option<u32>,
}

impl XzConfig {
    pub fn new(level: Option<u32>, thread: Option<u32>) -> Self {
        Self { level, thread }
    }

    fn thread_count(&self) -> u32 {
        self.thread.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(NonZero::get)
                .map(|core| (core / 4).clamp(1, DEFAULT_MAX_PARALLELIZATION) as u32)
                .unwrap_or(1)
        })
    }
}

impl<W: Write> CompressorBuilder<W> for XzConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
        let thread = self.thread_count();

        tracing::debug!("Creating XZ compressor with level={}, threads={}", level, thread);

        if thread == 1 {
            Ok(XzEncoder::new(writer, level).into())
        } else {
            let stream = MtStreamBuilder::new()
                .preset(level)
                .check(Check::Crc64)
                .threads(thread)
                .encoder()?;
            Ok(XzEncoder::new_stream(writer, stream).into())
        }
    }
}
