//! Exclusive archive lock
//!
//! `backup` and `purge` both mutate the catalog and the archive, so only one
//! of them may run against an archive at a time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "locks/archive.lock";

/// Held for the lifetime of one mutating command
pub struct ArchiveLock {
    path: PathBuf,
    _file: File,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockContent {
    pid: u32,
    command: String,
    started_at: i64,
}

impl ArchiveLock {
    /// Take the lock for `command`, failing fast if another live process holds it
    pub fn acquire(archive_dir: &Path, command: &str) -> Result<Self> {
        let lock_path = archive_dir.join(LOCK_FILE);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create locks directory")?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

        if !try_flock_exclusive(&file)? {
            match read_lock_content(&mut file) {
                Ok(holder) if is_process_alive(holder.pid) => anyhow::bail!(
                    "Archive is locked by `abus {}` (pid {})",
                    holder.command,
                    holder.pid
                ),
                Ok(holder) => {
                    tracing::warn!(pid = holder.pid, "removing stale archive lock");
                }
                // Holder has not written its content yet
                Err(_) => anyhow::bail!("Archive is locked by another process"),
            }
            drop(file);
            std::fs::remove_file(&lock_path).context("Failed to remove stale lock")?;
            return Self::acquire(archive_dir, command);
        }

        write_lock_content(&mut file, command)?;
        Ok(Self {
            path: lock_path,
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_lock_content(file: &mut File, command: &str) -> Result<()> {
    let content = LockContent {
        pid: std::process::id(),
        command: command.to_string(),
        started_at: chrono::Utc::now().timestamp(),
    };
    let serialized = serde_json::to_string(&content).context("Failed to serialize lock content")?;

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serialized.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_lock_content(file: &mut File) -> Result<LockContent> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).context("Failed to deserialize lock content")
}

/// Non-blocking exclusive flock
#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> Result<bool> {
    Ok(true)
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal "0" only checks for existence
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}
