//! abus core - content-addressed storage primitives for the backup archive
//!
//! This crate provides the foundational storage layer:
//! - BLAKE3 checksums (with the stored-compressed suffix flag)
//! - Run naming (minute-resolution time buckets)
//! - Blob encoding (zstd or raw)
//! - The archive storage seam and its file-system backend

pub mod archive;
pub mod blob;
pub mod error;
pub mod hash;
pub mod run_name;

// Re-export main types for convenience
pub use archive::{Archive, FsArchive, RunIndexEntry};
pub use error::Error;
pub use hash::{Blake3Hash, Checksum};
pub use run_name::{make_run_name, RunName};

/// Common result type used throughout abus-core
pub type Result<T> = std::result::Result<T, Error>;
