//! Error kinds raised by the storage layer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(f64),

    #[error("Invalid run name: {0:?}")]
    InvalidRunName(String),

    #[error("Invalid checksum: {0:?}")]
    InvalidChecksum(String),

    #[error("Archive I/O error at {location}: {source}")]
    ArchiveIo {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Run index error: {0}")]
    RunIndex(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an I/O error with the archive location it happened at
    pub fn archive_io(location: impl Into<String>, source: std::io::Error) -> Self {
        Error::ArchiveIo {
            location: location.into(),
            source,
        }
    }
}
