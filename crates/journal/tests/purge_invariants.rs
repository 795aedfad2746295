//! Seeded randomized checks of the purge invariants

mod common;

use common::{TestArchive, NOW};
use abus_journal::RetentionSchedule;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const HOUR: f64 = 3600.0;
const PATHS: [&str; 4] = ["docs/a.txt", "docs/b.txt", "photo.jpg", "src/main.rs"];
const CONTENTS: [&str; 6] = ["alpha", "beta", "gamma", "delta", "epsilon", "zeta"];

fn random_schedule(rng: &mut ChaCha8Rng) -> RetentionSchedule {
    let tiers = rng.gen_range(1..=3);
    let mut max_age = 0.0;
    let mut rounders = Vec::new();
    for _ in 0..tiers {
        max_age += rng.gen_range(1..=30) as f64;
        rounders.push((max_age, rng.gen_range(0..=5)));
    }
    RetentionSchedule::new(&rounders, rng.gen_range(0..=3)).unwrap()
}

fn populate(t: &TestArchive, rng: &mut ChaCha8Rng) {
    for path in PATHS {
        let versions = rng.gen_range(1..=12);
        // Distinct hours keep run names distinct within a path
        for hours in sample(rng, 24 * 200, versions).into_iter() {
            let content = CONTENTS[rng.gen_range(0..CONTENTS.len())];
            t.record_at(path, NOW - hours as f64 * HOUR, content);
        }
    }
}

#[test]
fn random_histories_keep_latest_and_leave_no_dangling_refs() {
    for seed in 0..25 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let t = TestArchive::new();
        populate(&t, &mut rng);
        let rounders = random_schedule(&mut rng);

        let latest_before = t.latest_runs();
        let report = t.purge(&rounders, NOW);
        assert!(report.is_clean(), "seed {seed}: {report:?}");

        assert_eq!(t.latest_runs(), latest_before, "seed {seed}");
        for (path, run) in &latest_before {
            let history = t.log.history_for_path(path).unwrap();
            assert!(history.iter().any(|e| &e.run_name == run), "seed {seed}: {path} lost its latest");
        }
        t.assert_no_dangling();

        let again = t.purge(&rounders, NOW);
        assert_eq!(again.entries_purged, 0, "seed {seed}");
        assert_eq!(again.checksums_purged, 0, "seed {seed}");
    }
}

#[test]
fn random_histories_never_exceed_era_slots_without_sharing() {
    // One path only, so no row is ever protected by another path
    for seed in 100..125 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let t = TestArchive::new();
        let versions = rng.gen_range(2..=40);
        for (i, hours) in sample(&mut rng, 24 * 200, versions).into_iter().enumerate() {
            t.record_at("only", NOW - hours as f64 * HOUR, &format!("v{i}"));
        }
        let rounders = random_schedule(&mut rng);
        t.purge(&rounders, NOW);

        let latest = t.log.latest_for_path("only").unwrap();
        let mut per_era = vec![0usize; rounders.terminal_era() + 1];
        for entry in t.log.history_for_path("only").unwrap() {
            if entry.run_name != latest {
                per_era[rounders.era_of((NOW - entry.timestamp) / 86_400.0)] += 1;
            }
        }
        for (era, kept) in per_era.iter().enumerate() {
            assert!(*kept <= rounders.slots_for(era), "seed {seed}: era {era} kept {kept}");
        }
    }
}
