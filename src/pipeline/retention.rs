use crate::pipeline::clock::Clock;
use crate::pipeline::fs::FileSystem;
use crate::pipeline::paths::StoragePaths;
use crate::pipeline::runlog::RunLog;
use crate::pipeline::warn::Warning;
use anyhow::Result;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneLogsOutcome {
    pub examined: usize,
    pub removed: usize,
    pub kept: usize,
    pub failed: usize,
    pub pruned_dirs: usize,
}

fn is_run_log(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("log")
}

/// Deletes per-run `.log` files older than `max_age_secs`, then the hour
/// directories they leave empty. The audit trail and the log of the current
/// run are never touched.
pub fn prune_logs(
    paths: &StoragePaths,
    fs: &dyn FileSystem,
    clock: &dyn Clock,
    max_age_secs: i64,
    log: &mut RunLog<'_>,
) -> Result<PruneLogsOutcome> {
    let cutoff = clock.now_secs().saturating_sub(max_age_secs);
    let audit = paths.audit_log();
    let current = log.path().to_path_buf();
    let mut outcome = PruneLogsOutcome::default();

    for entry in fs.list_files_recursive(&paths.logs_dir)? {
        if entry.path == audit || entry.path == current || !is_run_log(&entry.path) {
            continue;
        }
        outcome.examined += 1;
        if entry.modified_epoch_secs >= cutoff {
            outcome.kept += 1;
            continue;
        }
        match fs.remove_file(&entry.path) {
            Ok(()) => outcome.removed += 1,
            Err(err) => {
                outcome.failed += 1;
                log.warn(Warning {
                    code: "LOG_PRUNE_FAILED",
                    path: &entry.path.display().to_string(),
                    retry: "next_run",
                    err: &format!("{err:#}"),
                    ..Default::default()
                });
            }
        }
    }

    outcome.pruned_dirs = fs.prune_empty_subtrees(&paths.logs_dir, false)?;
    log.line(format!(
        "prune-logs: {} removed, {} kept, {} failed, {} empty dir(s) pruned",
        outcome.removed, outcome.kept, outcome.failed, outcome.pruned_dirs
    ));
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fs::DiskFs;
    use crate::pipeline::testkit::FakeClock;
    use std::fs::{self, File};
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    const DAY: u64 = 86_400;

    fn write_aged(path: &Path, age: Duration) {
        DiskFs.write_bytes(path, b"line\n").expect("write");
        let file = File::options().write(true).open(path).expect("open");
        file.set_modified(SystemTime::now() - age).expect("set mtime");
    }

    fn prune(paths: &StoragePaths, max_age: i64) -> (PruneLogsOutcome, PathBuf) {
        let clock = FakeClock::at(chrono::Utc::now().timestamp());
        let current = paths.logs_dir.join("2030-01-01/00/prune-logs-now.log");
        let mut log = RunLog::create(&current, &clock, "prune-logs", true).expect("log");
        let outcome = prune_logs(paths, &DiskFs, &clock, max_age, &mut log).expect("prune");
        (outcome, current)
    }

    #[test]
    fn old_run_logs_go_and_their_hour_dirs_with_them() {
        let tmp = tempdir().expect("tempdir");
        let paths = StoragePaths::new(tmp.path());
        let old = paths.logs_dir.join("2018-01-04/23/filter-2018-01-04T230500Z.log");
        let fresh = paths.logs_dir.join("2018-01-05/17/filter-2018-01-05T170500Z.log");
        write_aged(&old, Duration::from_secs(3 * DAY));
        write_aged(&fresh, Duration::from_secs(60));

        let (outcome, current) = prune(&paths, DAY as i64);
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.kept, 1);
        assert_eq!(outcome.failed, 0);
        assert!(!old.exists());
        assert!(!paths.logs_dir.join("2018-01-04").exists());
        assert!(fresh.is_file());
        assert!(current.is_file());
    }

    #[test]
    fn audit_trail_and_foreign_files_survive_any_age() {
        let tmp = tempdir().expect("tempdir");
        let paths = StoragePaths::new(tmp.path());
        let notes = paths.logs_dir.join("2018-01-04/23/notes.txt");
        write_aged(&paths.audit_log(), Duration::from_secs(30 * DAY));
        write_aged(&notes, Duration::from_secs(30 * DAY));

        let (outcome, _) = prune(&paths, 1);
        assert_eq!(outcome.examined, 0);
        assert!(paths.audit_log().is_file());
        assert!(notes.is_file());
        assert!(fs::read_to_string(paths.audit_log()).is_ok());
    }

    #[test]
    fn missing_logs_dir_is_not_an_error() {
        let tmp = tempdir().expect("tempdir");
        let paths = StoragePaths::new(tmp.path().join("nowhere"));
        let clock = FakeClock::at(1_515_171_600);
        let mut log =
            RunLog::create(&tmp.path().join("p.log"), &clock, "prune-logs", true).expect("log");
        let outcome = prune_logs(&paths, &DiskFs, &clock, 3600, &mut log).expect("prune");
        assert_eq!(outcome.examined, 0);
        assert_eq!(outcome.pruned_dirs, 0);
    }
}
