use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] abus_core::Error),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Cannot read source {path}: {source}")]
    Source {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid path: {0:?}")]
    InvalidPath(String),

    #[error("Refusing to delete latest entry {run_name} of {path}")]
    ProtectedEntryDeletion { path: String, run_name: String },

    #[error("Checksum {checksum} is still referenced by {references} backup entries")]
    DanglingReferenceDeletion { checksum: String, references: usize },

    #[error("Invalid retention schedule: {0}")]
    Configuration(String),

    #[error("Corrupt catalog: {0}")]
    Corrupt(String),
}

impl Error {
    /// Whether this error must stop a purge run
    ///
    /// Only archive I/O failures are isolated per item; everything else means
    /// the catalog or the engine itself can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Core(abus_core::Error::ArchiveIo { .. }))
    }
}
