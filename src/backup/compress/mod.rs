pub mod gzip;
pub mod xz;

use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddFunctionName;
use derive_more::From;
use flate2::write::GzEncoder;
use io_enum::Write;
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use std::io;
use std::io::Write;
use std::result;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    XzEncoder(XzEncoder<W>),
    GzEncoder(GzEncoder<W>),
}

#[derive(Clone, Default, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    #[default]
    None,
    Xz(xz::XzConfig),
    Gzip(gzip::GzipConfig),
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Xz(xz) => xz.validate(),
            CompressorConfig::Gzip(gzip) => gzip.validate(),
        }
    }
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::XzEncoder(w) => w.finish(),
            Compressor::GzEncoder(w) => w.finish(),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Xz(xz) => xz.build_compressor(writer),
            CompressorConfig::Gzip(gzip) => gzip.build_compressor(writer),
        }
        .add_fn_name(format!("{self:?} build_compressor"))
    }
}

static XZ_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
static GZ_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();

impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Xz(_) => Some(XZ_FILE_EXT.get_or_init(|| "xz".into()).clone()),
            CompressorConfig::Gzip(_) => Some(GZ_FILE_EXT.get_or_init(|| "gz".into()).clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_ext() {
        assert!(CompressorConfig::None.file_ext().is_none());
        let xz = CompressorConfig::Xz(Default::default());
        assert_eq!(xz.file_ext().unwrap().as_ref(), "xz");
        let gz = CompressorConfig::Gzip(Default::default());
        assert_eq!(gz.file_ext().unwrap().as_ref(), "gz");
    }

    #[test]
    fn test_deserialize_tagged() {
        let config: CompressorConfig =
            serde_yml::from_str("compressor_type: gzip\nlevel: 6\n").unwrap();
        match config {
            CompressorConfig::Gzip(_) => (),
            _ => panic!("Expected gzip"),
        }
        let config: CompressorConfig = serde_yml::from_str("compressor_type: none").unwrap();
        assert_eq!(config, CompressorConfig::None);
    }

    #[test]
    fn test_none_passthrough() {
        let mut compressor = CompressorConfig::None.build_compressor(Vec::new()).unwrap();
        compressor.write_all(b"raw").unwrap();
        assert_eq!(compressor.finish().unwrap(), b"raw");
    }
}
