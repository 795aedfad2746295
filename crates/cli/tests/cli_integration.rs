//! End-to-end tests of the `abus` binary

mod common;

use abus_cli::locks::ArchiveLock;
use common::{run_abus, TestEnv, DAY, T0};

const TIGHT: &str = "[retention]\nrounders = [[1, 1]]\nfinal_slots = 0\n";

fn at(secs: i64) -> String {
    secs.to_string()
}

#[test]
fn backup_history_purge_cycle() {
    let env = TestEnv::new(TIGHT);

    env.write("file_a", "first", T0);
    let first = env.abus(&["backup", "--now", &at(T0 + 60)]).assert_success();
    assert!(first.stdout.contains("2020_09_13_1227"), "{}", first.stdout);

    env.write("file_a", "second", T0 + DAY);
    env.abus(&["backup", "--now", &at(T0 + DAY + 60)]).assert_success();

    let history = env.abus(&["history", "file_a"]).assert_success();
    assert!(history.stdout.contains("2020_09_13_1227"));
    assert!(history.stdout.contains("2020_09_14_1227"));

    let later = at(T0 + 400 * DAY);
    let plan = env.abus(&["purge", "--dry-run", "--now", &later]).assert_success();
    assert!(plan.stdout.contains("Would purge 1 versions and 1 blobs"), "{}", plan.stdout);

    let purge = env.abus(&["purge", "--now", &later]).assert_success();
    assert!(purge.stdout.contains("Versions purged"), "{}", purge.stdout);

    let history = env.abus(&["history", "file_a"]).assert_success();
    assert!(!history.stdout.contains("2020_09_13_1227"));
    assert!(history.stdout.contains("2020_09_14_1227"));

    let runs = env.abus(&["runs"]).assert_success();
    assert!(runs.stdout.contains("2020_09_14_1227"));
    assert!(runs.stdout.contains("2020-09-14 12:27:00 UTC"));
    assert!(!runs.stdout.contains("2020_09_13_1227"));

    let again = env.abus(&["purge", "--now", &later]).assert_success();
    assert!(again.stdout.contains("Nothing to purge"));

    assert!(env.archive.path().join("logs").is_dir());
}

#[test]
fn config_prints_effective_settings() {
    let env = TestEnv::new("[purge]\nworkers = 3\n");

    let result = env.abus(&["config"]).assert_success();
    assert!(result.stdout.contains("workers = 3"), "{}", result.stdout);
    assert!(result.stdout.contains("final_slots = 1"));
    assert!(result.stdout.contains("rounders"));
}

#[test]
fn locked_archive_fails_fast() {
    let env = TestEnv::new(TIGHT);
    env.write("file_a", "data", T0);

    let _held = ArchiveLock::acquire(env.archive.path(), "purge").unwrap();
    let result = env.abus(&["backup", "--now", &at(T0)]);

    assert_eq!(result.exit_code, 1);
    assert!(result.stderr.contains("locked"), "{}", result.stderr);
}

#[test]
fn missing_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.toml").display().to_string();

    let result = run_abus(dir.path(), &["--config", &missing, "runs"]);
    assert_eq!(result.exit_code, 1);
    assert!(result.stderr.contains("error:"));
}

#[test]
fn invalid_schedule_is_fatal() {
    let env = TestEnv::new("[retention]\nrounders = [[7, 1], [1, 1]]\nfinal_slots = 1\n");

    let result = env.abus(&["purge", "--now", &at(T0)]);
    assert_eq!(result.exit_code, 1);
    assert!(result.stderr.contains("retention"), "{}", result.stderr);
}
