use crate::pipeline::clock::Clock;
use crate::pipeline::fs::FileSystem;
use crate::pipeline::runlog::RunLog;
use crate::pipeline::schema::Schema;
use crate::pipeline::timefmt::hour_label;
use crate::pipeline::warn::Warning;
use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default)]
pub struct CompressOptions {
    pub limit: Option<usize>,
    pub compress_all: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveRecord {
    pub hour: String,
    pub feed: String,
    pub files: usize,
    pub appended: bool,
    pub md5: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompressOutcome {
    pub hours: usize,
    pub compressed: usize,
    pub files: usize,
    pub failed: usize,
    pub limit_reached: bool,
    pub archives: Vec<ArchiveRecord>,
    pub pruned_dirs: usize,
}

fn compress_feed_hour(
    schema: &Schema,
    fs: &dyn FileSystem,
    hour_ts: i64,
    feed_id: &str,
    new_files: usize,
) -> Result<ArchiveRecord> {
    let dir = schema.filtered_feed_dir(hour_ts, feed_id)?;
    let archive = schema.compressed_path(hour_ts, feed_id)?;
    let appended = fs.is_file(&archive);
    if appended {
        fs.unpack_archive_to_dir(&archive, &dir)?;
    }
    fs.pack_dir_to_archive(&dir, &archive, false)?;
    Ok(ArchiveRecord {
        hour: hour_label(hour_ts)?,
        feed: feed_id.to_string(),
        files: new_files,
        appended,
        md5: fs.content_hash(&archive)?,
    })
}

/// Packs each flagged hour's filtered files into one archive per feed.
///
/// An existing archive is unpacked first so re-runs append. Hitting `limit`
/// stops the run and leaves the current hour's flag for the next one.
pub fn run_compress(
    schema: &Schema,
    fs: &dyn FileSystem,
    clock: &dyn Clock,
    opts: CompressOptions,
    log: &mut RunLog<'_>,
) -> Result<CompressOutcome> {
    let now = clock.now_secs();
    let mut outcome = CompressOutcome::default();

    'hours: for hour in schema.list_filtered_hours(fs, now, !opts.compress_all)? {
        let flag = schema.compress_flag_path(hour.hour_ts)?;
        if !opts.compress_all && !fs.is_file(&flag) {
            continue;
        }
        outcome.hours += 1;
        let label = hour_label(hour.hour_ts)?;

        for feed in &schema.feeds {
            if let Some(limit) = opts.limit
                && outcome.compressed + outcome.failed >= limit
            {
                outcome.limit_reached = true;
                log.line(format!(
                    "compress: limit of {limit} reached at {label}; run again to continue"
                ));
                break 'hours;
            }

            let files = schema.list_filtered_feed_files(fs, hour.hour_ts, &feed.id)?;
            if files.is_empty() {
                outcome.archives.push(ArchiveRecord {
                    hour: label.clone(),
                    feed: feed.id.clone(),
                    files: 0,
                    appended: false,
                    md5: String::new(),
                });
                continue;
            }
            match compress_feed_hour(schema, fs, hour.hour_ts, &feed.id, files.len()) {
                Ok(record) => {
                    log.line(format!(
                        "compressed {} file(s) into {}-{}{} md5={}",
                        record.files,
                        record.feed,
                        record.hour,
                        if record.appended { " (appended)" } else { "" },
                        record.md5
                    ));
                    outcome.compressed += 1;
                    outcome.files += record.files;
                    outcome.archives.push(record);
                }
                Err(err) => {
                    outcome.failed += 1;
                    let path = schema
                        .compressed_path(hour.hour_ts, &feed.id)
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    log.warn(Warning {
                        code: "COMPRESS_FAILED",
                        feed: &feed.id,
                        path: &path,
                        retry: "next_run",
                        err: &format!("{err:#}"),
                        ..Default::default()
                    });
                }
            }
        }

        if fs.is_file(&flag) {
            fs.remove_file(&flag)?;
        }
    }

    outcome.pruned_dirs = fs.prune_empty_subtrees(&schema.paths.filtered_dir, false)?;
    log.line(format!(
        "compress: {} hour(s), {} archive(s), {} file(s), {} failed",
        outcome.hours, outcome.compressed, outcome.files, outcome.failed
    ));
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fs::{DiskFs, archive_member_names};
    use crate::pipeline::testkit::{FakeClock, json_schema, payload};
    use std::path::Path;
    use tempfile::tempdir;

    const HOUR: i64 = 1515171600;

    fn put_filtered(schema: &Schema, ts: i64, feed: &str) {
        DiskFs
            .write_bytes(&schema.filtered_path(ts, feed, "json").expect("path"), &payload(ts))
            .expect("write filtered");
    }

    fn run(schema: &Schema, root: &Path, opts: CompressOptions) -> CompressOutcome {
        let clock = FakeClock::at(HOUR + 7200);
        let mut log =
            RunLog::create(&root.join("compress.log"), &clock, "compress", true).expect("log");
        run_compress(schema, &DiskFs, &clock, opts, &mut log).expect("compress")
    }

    fn all() -> CompressOptions {
        CompressOptions {
            limit: None,
            compress_all: true,
        }
    }

    #[test]
    fn only_flagged_hours_are_compressed() {
        let tmp = tempdir().expect("tempdir");
        let schema = json_schema(tmp.path(), 0);
        put_filtered(&schema, HOUR + 1, "A");
        put_filtered(&schema, HOUR + 3601, "A");
        DiskFs.touch(&schema.compress_flag_path(HOUR).expect("path")).expect("flag");

        let outcome = run(&schema, tmp.path(), CompressOptions::default());
        assert_eq!(outcome.hours, 1);
        assert_eq!(outcome.compressed, 1);
        assert!(schema.compressed_path(HOUR, "A").expect("path").is_file());
        assert!(!schema.compressed_path(HOUR + 3600, "A").expect("path").exists());
        assert!(!schema.compress_flag_path(HOUR).expect("path").exists());
        assert!(!schema.filtered_feed_dir(HOUR, "A").expect("path").exists());
        assert!(schema.filtered_path(HOUR + 3601, "A", "json").expect("path").is_file());
    }

    #[test]
    fn second_run_appends_without_double_counting() {
        let tmp = tempdir().expect("tempdir");
        let schema = json_schema(tmp.path(), 0);
        put_filtered(&schema, HOUR + 1, "A");
        put_filtered(&schema, HOUR + 2, "A");
        let first = run(&schema, tmp.path(), all());
        assert_eq!(first.files, 2);
        assert!(!first.archives[0].appended);

        put_filtered(&schema, HOUR + 3, "A");
        let second = run(&schema, tmp.path(), all());
        assert_eq!(second.files, 1);
        assert!(second.archives[0].appended);

        let archive = schema.compressed_path(HOUR, "A").expect("path");
        let members = archive_member_names(&archive).expect("members");
        assert_eq!(
            members,
            vec![
                "A-2018-01-05T170001Z.json".to_string(),
                "A-2018-01-05T170002Z.json".to_string(),
                "A-2018-01-05T170003Z.json".to_string(),
            ]
        );
        assert_eq!(first.files + second.files, members.len());
    }

    #[test]
    fn feeds_without_files_record_zero_and_write_no_archive() {
        let tmp = tempdir().expect("tempdir");
        let schema = json_schema(tmp.path(), 0);
        put_filtered(&schema, HOUR + 1, "B");
        let outcome = run(&schema, tmp.path(), all());
        assert_eq!(outcome.compressed, 1);
        assert_eq!(outcome.files, 1);
        assert_eq!(outcome.archives.len(), 2);

        let empty = &outcome.archives[0];
        assert_eq!(empty.feed, "A");
        assert_eq!(empty.hour, "2018-01-05T17");
        assert_eq!(empty.files, 0);
        assert!(empty.md5.is_empty());
        assert!(!schema.compressed_path(HOUR, "A").expect("path").exists());

        assert_eq!(outcome.archives[1].feed, "B");
        assert_eq!(outcome.archives[1].files, 1);
        assert!(!outcome.archives[1].md5.is_empty());
    }

    #[test]
    fn limit_leaves_unfinished_hour_flagged() {
        let tmp = tempdir().expect("tempdir");
        let schema = json_schema(tmp.path(), 0);
        put_filtered(&schema, HOUR + 1, "A");
        put_filtered(&schema, HOUR + 1, "B");
        DiskFs.touch(&schema.compress_flag_path(HOUR).expect("path")).expect("flag");

        let outcome = run(
            &schema,
            tmp.path(),
            CompressOptions {
                limit: Some(1),
                compress_all: false,
            },
        );
        assert!(outcome.limit_reached);
        assert_eq!(outcome.compressed, 1);
        assert!(schema.compress_flag_path(HOUR).expect("path").is_file());
        assert!(schema.filtered_path(HOUR + 1, "B", "json").expect("path").is_file());

        let rest = run(&schema, tmp.path(), CompressOptions::default());
        assert_eq!(rest.compressed, 1);
        assert!(!schema.compress_flag_path(HOUR).expect("path").exists());
        assert!(schema.compressed_path(HOUR, "B").expect("path").is_file());
    }

    #[test]
    fn unreadable_existing_archive_counts_as_failure_and_keeps_files() {
        let tmp = tempdir().expect("tempdir");
        let schema = json_schema(tmp.path(), 0);
        put_filtered(&schema, HOUR + 1, "A");
        DiskFs
            .write_bytes(&schema.compressed_path(HOUR, "A").expect("path"), b"not a bzip2 stream")
            .expect("write junk");

        let outcome = run(&schema, tmp.path(), all());
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.compressed, 0);
        assert!(schema.filtered_path(HOUR + 1, "A", "json").expect("path").is_file());
    }
}
