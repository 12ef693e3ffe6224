use crate::error::StartupError;
use bzip2::read::MultiBzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

const READ_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Xml,
    Bz2,
}

impl DumpFormat {
    pub fn from_path(path: &Path) -> Result<Self, StartupError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("xml") => Ok(DumpFormat::Xml),
            Some("bz2") => Ok(DumpFormat::Bz2),
            _ => Err(StartupError::UnsupportedExtension {
                path: path.to_path_buf(),
            }),
        }
    }
}

/// Opens a dump as a buffered byte stream, decompressing `.bz2` on the fly.
pub struct DumpSource;

impl DumpSource {
    pub fn open(path: &Path) -> Result<Box<dyn BufRead + Send>, StartupError> {
        let format = DumpFormat::from_path(path)?;
        let file = File::open(path).map_err(|source| StartupError::OpenInput {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), format = ?format, "Opened dump");

        let reader: Box<dyn BufRead + Send> = match format {
            DumpFormat::Xml => Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file)),
            // Wikipedia publishes multistream archives; a plain decoder stops after the first stream.
            DumpFormat::Bz2 => Box::new(BufReader::with_capacity(
                READ_BUFFER_SIZE,
                MultiBzDecoder::new(file),
            )),
        };
        Ok(reader)
    }
}
