//! Compression, encryption and checksumming of the dump stream.

use crate::backup::compress::{CompressorBuilder, CompressorConfig};
use crate::backup::config::BackupTarget;
use crate::backup::digest::{HashingWriter, Sha256Digest};
use crate::backup::encrypt::{EncryptorBuilder, EncryptorConfig};
use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use std::io::{BufWriter, ErrorKind, IntoInnerError, Read, Write};
use tracing::debug;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// What the pipeline produced for one dump.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineSummary {
    pub uncompressed_size: u64,
    /// Bytes written to the sink, after compression and encryption
    pub compressed_size: u64,
    /// Digest of exactly the bytes written to the sink
    pub sha256: Sha256Digest,
}

#[derive(Clone, Debug)]
pub struct ArtifactPipeline {
    compressor: CompressorConfig,
    encryptor: EncryptorConfig,
}

fn stage_error(e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::BrokenPipe {
        Error::PipeClosed
    } else {
        Error::Processing(e)
    }
}

impl ArtifactPipeline {
    pub fn new(compressor: CompressorConfig, encryptor: EncryptorConfig) -> Self {
        Self {
            compressor,
            encryptor,
        }
    }

    pub fn for_target(target: &BackupTarget) -> Self {
        Self::new(target.compressor().clone(), target.encryptor().clone())
    }

    pub fn compressor_ext(&self) -> Option<String> {
        self.compressor.file_ext().map(|ext| ext.to_string())
    }

    pub fn encryptor_ext(&self) -> Option<String> {
        self.encryptor.file_ext().map(|ext| ext.to_string())
    }

    /// Streams `source` through the compressor and the encryptor into
    /// `sink` and hands `sink` back once every stage flushed its trailer.
    ///
    /// On error the digest is discarded with the chain; whatever already
    /// reached `sink` must not be used.
    pub fn run<R, W>(&self, source: &mut R, sink: W) -> Result<(W, PipelineSummary)>
    where
        R: Read + ?Sized,
        W: Write,
    {
        let mut writer = self
            .encryptor
            .build_encryptor(BufWriter::new(HashingWriter::new(sink)))
            .map(BufWriter::new)
            .and_then(|w| self.compressor.build_compressor(w))?;

        let mut buf = vec![0u8; COPY_BUF_SIZE];
        let mut uncompressed_size = 0u64;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e).add_msg("read dump stream")),
            };
            writer.write_all(&buf[..n]).map_err(stage_error)?;
            uncompressed_size += n as u64;
        }

        let mut hashing = writer
            .finish()
            .map_err(stage_error)?
            .into_inner()
            .map_err(|e| stage_error(IntoInnerError::into_error(e)))?
            .finish()
            .map_err(stage_error)?
            .into_inner()
            .map_err(|e| stage_error(IntoInnerError::into_error(e)))?;
        hashing.flush().map_err(stage_error)?;
        let (sink, sha256, compressed_size) = hashing.into_parts();

        debug!(
            "Pipeline done: {} bytes in, {} bytes out, sha256 {}",
            uncompressed_size, compressed_size, sha256
        );
        Ok((
            sink,
            PipelineSummary {
                uncompressed_size,
                compressed_size,
                sha256,
            },
        ))
    }
}
