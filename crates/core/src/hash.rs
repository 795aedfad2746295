//! BLAKE3 hashing primitives for content-addressed storage

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::thread::sleep;
use std::time::Duration;

/// Files larger than this are hashed through a memory map
pub const MMAP_THRESHOLD: u64 = 4 * 1024 * 1024;

/// A BLAKE3 hash (32 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Blake3Hash([u8; 32]);

impl Blake3Hash {
    /// Create a new Blake3Hash from bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the hash as a byte slice
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(Error::InvalidChecksum(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidChecksum(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blake3Hash({})", self.to_hex())
    }
}

impl fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Content checksum as recorded in the backup log
///
/// Rendered as the hex digest of the original file bytes, followed by `z`
/// when the blob is stored zstd-compressed in the archive. The same content
/// stored both ways yields two distinct checksums.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    hash: Blake3Hash,
    compressed: bool,
}

impl Checksum {
    const COMPRESSED_SUFFIX: char = 'z';

    pub fn new(hash: Blake3Hash, compressed: bool) -> Self {
        Self { hash, compressed }
    }

    pub fn hash(&self) -> Blake3Hash {
        self.hash
    }

    /// Whether the blob behind this checksum is stored compressed
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.compressed {
            write!(f, "{}{}", self.hash, Self::COMPRESSED_SUFFIX)
        } else {
            write!(f, "{}", self.hash)
        }
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self)
    }
}

impl FromStr for Checksum {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.strip_suffix(Self::COMPRESSED_SUFFIX) {
            Some(digest) => Ok(Self::new(Blake3Hash::from_hex(digest)?, true)),
            None => Ok(Self::new(Blake3Hash::from_hex(s)?, false)),
        }
    }
}

impl TryFrom<String> for Checksum {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        checksum.to_string()
    }
}

/// Hash bytes using BLAKE3
pub fn hash_bytes(data: &[u8]) -> Blake3Hash {
    let hash = blake3::hash(data);
    Blake3Hash::from_bytes(*hash.as_bytes())
}

/// Hash a file using BLAKE3 (streaming for large files)
pub fn hash_file(path: &Path) -> std::io::Result<Blake3Hash> {
    use std::fs::File;
    use std::io::{BufReader, Read};

    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let hash = hasher.finalize();
    Ok(Blake3Hash::from_bytes(*hash.as_bytes()))
}

/// Hash a file using memory-mapped I/O (optimized for large files)
pub fn hash_file_mmap(path: &Path) -> std::io::Result<Blake3Hash> {
    use memmap2::Mmap;
    use std::fs::File;

    let file = File::open(path)?;
    // SAFETY: the archive is single-writer; a concurrently truncated source
    // file is caught by the double-stat check in `hash_file_stable`.
    let mmap = unsafe { Mmap::map(&file)? };
    let hash = blake3::hash(&mmap);
    Ok(Blake3Hash::from_bytes(*hash.as_bytes()))
}

/// Hash file with stability verification (double-stat pattern)
///
/// Ensures file is not changing during read by checking size and mtime
/// before and after the read. Retries with exponential backoff.
pub fn hash_file_stable(path: &Path, max_retries: u8) -> std::io::Result<Blake3Hash> {
    use std::fs;

    for attempt in 0..max_retries {
        let stat1 = fs::metadata(path)?;

        let hash = if stat1.len() > MMAP_THRESHOLD {
            hash_file_mmap(path)?
        } else {
            hash_file(path)?
        };

        let stat2 = fs::metadata(path)?;

        if stat1.len() == stat2.len() && stat1.modified()? == stat2.modified()? {
            return Ok(hash);
        }

        if attempt + 1 < max_retries {
            let backoff_ms = 50 << attempt; // 50ms, 100ms, 200ms
            sleep(Duration::from_millis(backoff_ms));
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!(
            "File {} is unstable after {} read attempts (file changing too rapidly)",
            path.display(),
            max_retries
        ),
    ))
}
