//! Archive storage seam and its file-system backend

use crate::hash::Checksum;
use crate::run_name::RunName;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// One row of a run-index file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub path: String,
    pub timestamp: f64,
    pub checksum: Checksum,
}

/// Physical storage for blobs and run-index files
///
/// Locations are archive-relative strings so the catalog stays valid when
/// the archive directory moves.
pub trait Archive: Send + Sync {
    /// Store a blob, returning its location and stored size
    fn put_blob(&self, checksum: &Checksum, stored: &[u8]) -> Result<(String, u64)>;

    /// Location a checksum's blob is stored at
    fn blob_location(&self, checksum: &Checksum) -> String;

    /// Remove a blob, returning the bytes freed
    ///
    /// A blob that is already gone is not an error and frees nothing.
    fn remove_blob(&self, location: &str) -> Result<u64>;

    fn blob_exists(&self, location: &str) -> bool;

    /// Enumerate the checksums physically present
    fn list_blobs(&self) -> Result<Vec<Checksum>>;

    /// Replace a run's index file; an empty index removes the file
    fn write_run_index(&self, run: &RunName, entries: &[RunIndexEntry]) -> Result<()>;

    fn read_run_index(&self, run: &RunName) -> Result<Option<Vec<RunIndexEntry>>>;

    fn list_run_indexes(&self) -> Result<Vec<RunName>>;
}

/// Archive rooted in a local directory
///
/// ```text
/// <root>/
///   objects/<hh>/<rest-of-checksum>
///   runs/<run_name>.json
///   tmp/
/// ```
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    /// Open an archive directory, creating its layout if missing
    pub fn open(root: &Path) -> Result<Self> {
        for dir in ["objects", "runs", "tmp"] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .map_err(|e| Error::archive_io(path.display().to_string(), e))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Archive-relative location of a checksum's blob
    pub fn location_for(checksum: &Checksum) -> String {
        let name = checksum.to_string();
        format!("objects/{}/{}", &name[..2], &name[2..])
    }

    fn run_index_path(&self, run: &RunName) -> PathBuf {
        self.root.join("runs").join(format!("{run}.json"))
    }
}

impl Archive for FsArchive {
    fn blob_location(&self, checksum: &Checksum) -> String {
        Self::location_for(checksum)
    }

    fn put_blob(&self, checksum: &Checksum, stored: &[u8]) -> Result<(String, u64)> {
        let location = Self::location_for(checksum);
        let target = self.root.join(&location);
        if !target.exists() {
            atomic_write(&self.root.join("tmp"), &target, stored)
                .map_err(|e| Error::archive_io(location.clone(), e))?;
        }
        Ok((location, stored.len() as u64))
    }

    fn remove_blob(&self, location: &str) -> Result<u64> {
        let path = self.root.join(location);
        let size = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::archive_io(location, e)),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(Error::archive_io(location, e)),
        }
    }

    fn blob_exists(&self, location: &str) -> bool {
        self.root.join(location).is_file()
    }

    fn list_blobs(&self) -> Result<Vec<Checksum>> {
        let objects = self.root.join("objects");
        let io_err = |e| Error::archive_io("objects", e);
        let mut checksums = Vec::new();

        for prefix in fs::read_dir(&objects).map_err(io_err)? {
            let prefix = prefix.map_err(io_err)?;
            if !prefix.path().is_dir() {
                continue;
            }
            let head = prefix.file_name().to_string_lossy().into_owned();
            for blob in fs::read_dir(prefix.path()).map_err(io_err)? {
                let blob = blob.map_err(io_err)?;
                let tail = blob.file_name().to_string_lossy().into_owned();
                match format!("{head}{tail}").parse::<Checksum>() {
                    Ok(checksum) => checksums.push(checksum),
                    Err(_) => tracing::warn!("Ignoring foreign file in archive: {}/{}", head, tail),
                }
            }
        }

        checksums.sort();
        Ok(checksums)
    }

    fn write_run_index(&self, run: &RunName, entries: &[RunIndexEntry]) -> Result<()> {
        let path = self.run_index_path(run);
        let location = format!("runs/{run}.json");

        if entries.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::archive_io(location, e)),
            };
        }

        let data = serde_json::to_vec_pretty(entries)?;
        atomic_write(&self.root.join("tmp"), &path, &data).map_err(|e| Error::archive_io(location, e))
    }

    fn read_run_index(&self, run: &RunName) -> Result<Option<Vec<RunIndexEntry>>> {
        let path = self.run_index_path(run);
        match fs::read(&path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::archive_io(format!("runs/{run}.json"), e)),
        }
    }

    fn list_run_indexes(&self) -> Result<Vec<RunName>> {
        let io_err = |e| Error::archive_io("runs", e);
        let mut runs = Vec::new();
        for item in fs::read_dir(self.root.join("runs")).map_err(io_err)? {
            let item = item.map_err(io_err)?;
            let name = item.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(run) = RunName::parse(stem) {
                    runs.push(run);
                }
            }
        }
        runs.sort();
        Ok(runs)
    }
}

/// Atomic write helper
///
/// Writes data to a temporary file, fsyncs it, then renames it to the target path.
pub fn atomic_write(tmp_dir: &Path, target: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(tmp_dir)?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());
    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = fs::rename(&tmp_path, target) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }

    if let Some(parent) = target.parent() {
        sync_dir(parent)?;
    }

    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
