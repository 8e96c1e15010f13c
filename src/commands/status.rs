use anyhow::Result;
use std::env;
use std::path::Path;

use crate::commands::{CommandReport, StageContext};
use crate::pipeline::clock::Clock;
use crate::pipeline::fs::{DiskFs, FileSystem};
use crate::pipeline::schema::Schema;
use crate::pipeline::timefmt::format_timestamp;
use crate::pipeline::watermark::SentinelStore;

include!(concat!(env!("OUT_DIR"), "/rtagg_env_allowlist.rs"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub downloaded: usize,
    pub filtered_hours: usize,
    pub pending_flags: Vec<String>,
    pub compressed: usize,
}

/// Counts ignore the access lag so that everything on disk is visible.
pub fn stage_counts(schema: &Schema, fs: &dyn FileSystem, now: i64) -> Result<StageCounts> {
    let mut unlagged = schema.clone();
    unlagged.file_access_lag_secs = 0;

    let hours = unlagged.list_filtered_hours(fs, now, true)?;
    let mut pending_flags = Vec::new();
    for hour in &hours {
        if fs.is_file(&unlagged.compress_flag_path(hour.hour_ts)?) {
            pending_flags.push(format_timestamp(hour.hour_ts)?);
        }
    }
    Ok(StageCounts {
        downloaded: unlagged.list_downloaded(fs, now)?.len(),
        filtered_hours: hours.len(),
        pending_flags,
        compressed: unlagged.list_compressed(fs, now)?.len(),
    })
}

fn nearest_existing(path: &Path) -> Option<&Path> {
    path.ancestors().find(|p| p.exists())
}

/// Names from the generated allowlist that are set in this process.
pub fn set_env_vars() -> Vec<&'static str> {
    GENERATED_RTAGG_ENV_ALLOWLIST
        .iter()
        .copied()
        .filter(|key| env::var_os(key).is_some())
        .collect()
}

pub fn run(ctx: &StageContext, clock: &dyn Clock) -> Result<CommandReport> {
    let schema = &ctx.schema;
    let paths = &schema.paths;
    let mut report = CommandReport::new("status");

    report.detail(format!("build={}", env!("BUILD_UUID")));
    report.detail(format!("settings={}", ctx.loaded.source.display()));
    report.detail(format!("root={}", paths.root.display()));
    report.detail(format!("feeds_dir={}", paths.feeds_dir.display()));
    report.detail(format!("downloaded_dir={}", paths.downloaded_dir.display()));
    report.detail(format!("filtered_dir={}", paths.filtered_dir.display()));
    report.detail(format!("compressed_dir={}", paths.compressed_dir.display()));
    report.detail(format!("logs_dir={}", paths.logs_dir.display()));
    report.detail(format!(
        "feeds={}",
        schema
            .feeds
            .iter()
            .map(|f| f.id.as_str())
            .collect::<Vec<_>>()
            .join(",")
    ));

    let fs = DiskFs;
    let counts = stage_counts(schema, &fs, clock.now_secs())?;
    report.detail(format!("pending_downloaded={}", counts.downloaded));
    report.detail(format!("filtered_hours={}", counts.filtered_hours));
    report.detail(format!("pending_compressed={}", counts.compressed));
    if counts.pending_flags.is_empty() {
        report.detail("compress_flags=none");
    } else {
        report.detail(format!("compress_flags={}", counts.pending_flags.join(",")));
    }

    match SentinelStore::new(&fs, &paths.watermark_dir).latest_time()? {
        Some(ts) => match format_timestamp(ts) {
            Ok(text) => report.detail(format!("watermark={ts} ({text})")),
            Err(err) => report.issue(format!("watermark {ts} unreadable: {err}")),
        },
        None => report.detail("watermark=none"),
    }

    let remote = ctx.remote();
    if remote.enabled {
        report.detail(format!("remote={:?}", remote.backend).to_lowercase());
    } else {
        report.detail("remote=disabled");
    }

    match nearest_existing(&paths.root) {
        Some(existing) => match fs2::available_space(existing) {
            Ok(bytes) => report.detail(format!("free_bytes={bytes}")),
            Err(err) => report.issue(format!(
                "cannot read free space for {}: {err}",
                existing.display()
            )),
        },
        None => report.issue(format!(
            "storage root {} has no existing ancestor",
            paths.root.display()
        )),
    }

    let vars = set_env_vars();
    if vars.is_empty() {
        report.detail("env=none");
    } else {
        report.detail(format!("env={}", vars.join(",")));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testkit::{json_schema, payload};

    #[test]
    fn counts_cover_every_stage_and_flag() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let schema = json_schema(tmp.path(), 120);
        let fs = DiskFs;
        let ts = 1_515_108_000;

        fs.write_bytes(&schema.downloaded_path(ts, "A", "json").expect("path"), &payload(ts))
            .expect("downloaded");
        fs.write_bytes(&schema.filtered_path(ts, "B", "json").expect("path"), &payload(ts))
            .expect("filtered");
        fs.touch(&schema.compress_flag_path(ts).expect("path")).expect("flag");

        // Files were just written; the lag must not hide them here.
        let counts = stage_counts(&schema, &fs, ts).expect("counts");
        assert_eq!(counts.downloaded, 1);
        assert_eq!(counts.filtered_hours, 1);
        assert_eq!(counts.pending_flags, vec![format_timestamp(1_515_106_800).expect("fmt")]);
        assert_eq!(counts.compressed, 0);
    }

    #[test]
    fn allowlist_only_holds_prefixed_names() {
        assert!(!GENERATED_RTAGG_ENV_ALLOWLIST.is_empty());
        assert!(
            GENERATED_RTAGG_ENV_ALLOWLIST
                .iter()
                .all(|key| key.starts_with("RTAGG_"))
        );
    }
}
