//! Checksum -> archive location index
//!
//! Lives in the same sled database as the backup log and reads the log's
//! `refs` tree, so it can refuse to drop a blob some row still points at.

use crate::backup_log::{count_refs, REFS_TREE};
use crate::{Error, Result};
use abus_core::{Archive, Checksum};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::BTreeSet;
use std::sync::Arc;

const CHECKSUMS_TREE: &str = "checksums";

/// One stored blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecksumRecord {
    pub checksum: Checksum,
    /// Archive-relative location of the blob
    pub location: String,
    /// Bytes the blob occupies in the archive
    pub stored_size: u64,
}

pub struct ChecksumIndex {
    checksums: Tree,
    refs: Tree,
    archive: Arc<dyn Archive>,
}

impl ChecksumIndex {
    pub fn open(db: &Db, archive: Arc<dyn Archive>) -> Result<Self> {
        Ok(Self {
            checksums: db.open_tree(CHECKSUMS_TREE)?,
            refs: db.open_tree(REFS_TREE)?,
            archive,
        })
    }

    pub fn archive(&self) -> &Arc<dyn Archive> {
        &self.archive
    }

    pub fn exists(&self, checksum: &Checksum) -> Result<bool> {
        Ok(self.checksums.contains_key(key(checksum))?)
    }

    pub fn record(&self, checksum: &Checksum) -> Result<Option<ChecksumRecord>> {
        match self.checksums.get(key(checksum))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn location_of(&self, checksum: &Checksum) -> Result<Option<String>> {
        Ok(self.record(checksum)?.map(|record| record.location))
    }

    /// Record a blob already present in the archive
    ///
    /// Registering a known checksum leaves the existing record untouched.
    /// Returns whether a new record was created.
    pub fn register(&self, checksum: &Checksum, location: &str, stored_size: u64) -> Result<bool> {
        let value = bincode::serialize(&ChecksumRecord {
            checksum: *checksum,
            location: location.to_string(),
            stored_size,
        })?;
        let created = self
            .checksums
            .compare_and_swap(key(checksum), None as Option<&[u8]>, Some(value))?
            .is_ok();
        Ok(created)
    }

    /// Write a blob to the archive (if new) and register it
    pub fn store(&self, checksum: &Checksum, stored: &[u8]) -> Result<ChecksumRecord> {
        if let Some(record) = self.record(checksum)? {
            return Ok(record);
        }
        let (location, stored_size) = self.archive.put_blob(checksum, stored)?;
        self.register(checksum, &location, stored_size)?;
        Ok(ChecksumRecord {
            checksum: *checksum,
            location,
            stored_size,
        })
    }

    /// Remove a blob and its record, returning the bytes reclaimed
    ///
    /// Fails with `DanglingReferenceDeletion` while any backup row still
    /// references the checksum. If the archive refuses the removal the record
    /// is kept, so a later purge retries it. Unknown checksums reclaim nothing.
    pub fn delete(&self, checksum: &Checksum) -> Result<u64> {
        self.ensure_unreferenced(checksum)?;

        let Some(record) = self.record(checksum)? else {
            return Ok(0);
        };

        self.archive.remove_blob(&record.location)?;
        self.checksums.remove(key(checksum))?;
        Ok(record.stored_size)
    }

    /// Remove a blob the index never recorded, returning the bytes freed
    ///
    /// Such blobs are left behind when a backup stops between writing a blob
    /// and registering it. A checksum that does have a record goes through
    /// `delete`.
    pub fn delete_orphan(&self, checksum: &Checksum) -> Result<u64> {
        self.ensure_unreferenced(checksum)?;

        if self.exists(checksum)? {
            return self.delete(checksum);
        }
        Ok(self.archive.remove_blob(&self.archive.blob_location(checksum))?)
    }

    fn ensure_unreferenced(&self, checksum: &Checksum) -> Result<()> {
        match count_refs(&self.refs, checksum)? {
            0 => Ok(()),
            references => Err(Error::DanglingReferenceDeletion {
                checksum: checksum.to_string(),
                references,
            }),
        }
    }

    /// All registered checksums
    pub fn checksums(&self) -> Result<Vec<Checksum>> {
        let mut all = Vec::new();
        for item in self.checksums.iter() {
            let (_, value) = item?;
            let record: ChecksumRecord = bincode::deserialize(&value)?;
            all.push(record.checksum);
        }
        Ok(all)
    }

    /// Blobs physically present in the archive without a record
    pub fn orphans(&self) -> Result<Vec<Checksum>> {
        let registered: BTreeSet<Checksum> = self.checksums()?.into_iter().collect();
        Ok(self
            .archive
            .list_blobs()?
            .into_iter()
            .filter(|checksum| !registered.contains(checksum))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.checksums.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checksums.is_empty()
    }
}

fn key(checksum: &Checksum) -> Vec<u8> {
    checksum.to_string().into_bytes()
}
