//! SHA-256 over a byte stream, computed while the bytes pass through.

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

/// Lower-case hex SHA-256 digest.
#[derive(Clone, Debug, Display, From, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hashes everything `reader` yields.
    pub fn of_reader<R: Read>(mut reader: R) -> std::io::Result<(Self, u64)> {
        let mut writer = HashingWriter::new(std::io::sink());
        let len = std::io::copy(&mut reader, &mut writer)?;
        let (_, digest, _) = writer.into_parts();
        Ok((digest, len))
    }
}

/// Forwards writes to `inner`, hashing and counting exactly the bytes the
/// inner writer accepted.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Consumes the writer. Only call this after the stream ended cleanly;
    /// a digest of a failed stream means nothing.
    pub fn into_parts(self) -> (W, Sha256Digest, u64) {
        let digest = Sha256Digest(format!("{:x}", self.hasher.finalize()));
        (self.inner, digest, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}
