//! Blob encoding for archived file contents

use crate::hash::{hash_bytes, Checksum};
use std::path::Path;

/// zstd level used for stored blobs
pub const COMPRESSION_LEVEL: i32 = 3;

/// Extensions of formats that are already compressed; storing them through
/// zstd only burns CPU.
const PRECOMPRESSED_EXTENSIONS: &[&str] = &[
    "gz", "tgz", "zst", "xz", "bz2", "zip", "7z", "jpg", "jpeg", "png", "mp3", "mp4",
];

/// Decide whether a source file should be stored compressed
pub fn should_compress(path: &Path) -> bool {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => !PRECOMPRESSED_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext)),
        None => true,
    }
}

/// Encode file bytes for storage under the given checksum
pub fn encode_blob(checksum: &Checksum, data: &[u8]) -> std::io::Result<Vec<u8>> {
    if checksum.is_compressed() {
        zstd::encode_all(data, COMPRESSION_LEVEL)
    } else {
        Ok(data.to_vec())
    }
}

/// Decode stored bytes back to the original file contents
pub fn decode_blob(checksum: &Checksum, stored: &[u8]) -> std::io::Result<Vec<u8>> {
    if checksum.is_compressed() {
        zstd::decode_all(stored)
    } else {
        Ok(stored.to_vec())
    }
}

/// Checksum for in-memory contents, as the backup executor would record them
pub fn checksum_for(path: &Path, data: &[u8]) -> Checksum {
    Checksum::new(hash_bytes(data), should_compress(path))
}
