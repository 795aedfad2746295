//! Helpers for driving the `abus` binary in integration tests

#![allow(dead_code)]

use filetime::{set_file_mtime, FileTime};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

pub const DAY: i64 = 86_400;
pub const T0: i64 = 1_600_000_000;

/// Source tree, archive and config file in temporary directories
pub struct TestEnv {
    pub source: TempDir,
    pub archive: TempDir,
    pub config: PathBuf,
}

impl TestEnv {
    pub fn new(retention: &str) -> Self {
        let source = TempDir::new().unwrap();
        let archive = TempDir::new().unwrap();
        let config = archive.path().join("abus-test.toml");
        fs::write(
            &config,
            format!(
                "source_dir = {:?}\narchive_dir = {:?}\n\n{retention}\n",
                source.path().display().to_string(),
                archive.path().display().to_string(),
            ),
        )
        .unwrap();
        Self {
            source,
            archive,
            config,
        }
    }

    /// Write a source file with a fixed modification time
    pub fn write(&self, name: &str, contents: &str, mtime: i64) {
        let path = self.source.path().join(name);
        fs::write(&path, contents).unwrap();
        set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    pub fn abus(&self, args: &[&str]) -> CommandResult {
        let config = self.config.display().to_string();
        let mut full = vec!["--config", config.as_str()];
        full.extend_from_slice(args);
        run_abus(self.source.path(), &full)
    }
}

/// Command execution result
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn assert_success(self) -> Self {
        assert!(
            self.success(),
            "abus failed (exit code {}):\nstdout: {}\nstderr: {}",
            self.exit_code,
            self.stdout,
            self.stderr
        );
        self
    }
}

pub fn run_abus(working_dir: &Path, args: &[&str]) -> CommandResult {
    let output = Command::new(env!("CARGO_BIN_EXE_abus"))
        .args(args)
        .current_dir(working_dir)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run abus");

    CommandResult {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    }
}
