use crate::pipeline::clock::Clock;
use crate::pipeline::fs::{FileEntry, FileSystem};
use crate::pipeline::runlog::RunLog;
use crate::pipeline::schema::{DOWNLOADED_AFFIX, Schema};
use crate::pipeline::timefmt::{date_part, hour_close, hour_part, is_representable};
use crate::pipeline::warn::Warning;
use crate::pipeline::watermark::SentinelStore;
use anyhow::{Result, anyhow};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default)]
pub struct FilterOptions {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterOutcome {
    pub examined: usize,
    pub copied: usize,
    pub duplicates: usize,
    pub corrupt: usize,
    pub zombies: usize,
    pub failed: usize,
    pub cut_short: bool,
    pub last_download_time: Option<i64>,
    pub watermark: Option<i64>,
    pub hours_flagged: Vec<String>,
    pub pruned_dirs: usize,
}

enum Verdict {
    Zombie,
    Corrupt(String),
    Duplicate(i64),
    Copied(i64),
}

fn display(entry: &FileEntry) -> String {
    entry.path.display().to_string()
}

fn classify(schema: &Schema, fs: &dyn FileSystem, entry: &FileEntry) -> Result<Verdict> {
    let parsed = entry
        .path
        .file_name()
        .and_then(|s| s.to_str())
        .and_then(|name| schema.parse_feed_file_name(name, DOWNLOADED_AFFIX));
    let Some((feed_id, _)) = parsed else {
        fs.remove_file(&entry.path)?;
        return Ok(Verdict::Zombie);
    };
    let feed = schema
        .feed(&feed_id)
        .ok_or_else(|| anyhow!("feed `{feed_id}` vanished from schema"))?;

    let payload = fs.read_bytes(&entry.path)?;
    let ts = match feed.validator.extract(&payload) {
        Ok(ts) if is_representable(ts) => ts,
        Ok(ts) => {
            fs.remove_file(&entry.path)?;
            return Ok(Verdict::Corrupt(format!("timestamp {ts} out of range")));
        }
        Err(err) => {
            fs.remove_file(&entry.path)?;
            return Ok(Verdict::Corrupt(format!("{err:#}")));
        }
    };

    let target = schema.filtered_path(ts, &feed.id, &feed.ext)?;
    if fs.is_file(&target) {
        fs.remove_file(&entry.path)?;
        return Ok(Verdict::Duplicate(ts));
    }
    fs.copy_file(&entry.path, &target)?;
    fs.remove_file(&entry.path)?;
    Ok(Verdict::Copied(ts))
}

/// Flags every filtered hour that closed strictly before `watermark`.
fn schedule_compressions(
    schema: &Schema,
    fs: &dyn FileSystem,
    now: i64,
    watermark: i64,
    log: &mut RunLog<'_>,
) -> Result<Vec<String>> {
    let mut flagged = Vec::new();
    for hour in schema.list_filtered_hours(fs, now, true)? {
        if hour_close(hour.hour_ts) >= watermark {
            continue;
        }
        let flag = schema.compress_flag_path(hour.hour_ts)?;
        if fs.is_file(&flag) {
            continue;
        }
        fs.touch(&flag)?;
        let label = format!("{}/{}", date_part(hour.hour_ts)?, hour_part(hour.hour_ts)?);
        log.line(format!("scheduled {label} for compression"));
        flagged.push(label);
    }
    Ok(flagged)
}

/// Validates, dedupes and re-buckets downloaded files by feed time.
///
/// The watermark only moves when every eligible file was examined and none
/// failed; a run cut short by `limit` or an I/O failure leaves it and the
/// compress flags untouched.
pub fn run_filter(
    schema: &Schema,
    fs: &dyn FileSystem,
    clock: &dyn Clock,
    opts: FilterOptions,
    log: &mut RunLog<'_>,
) -> Result<FilterOutcome> {
    let now = clock.now_secs();
    let mut outcome = FilterOutcome::default();
    let files = schema.list_downloaded(fs, now)?;
    log.line(format!("filter: {} candidate file(s)", files.len()));

    for (idx, entry) in files.iter().enumerate() {
        if let Some(limit) = opts.limit
            && outcome.examined >= limit
        {
            outcome.cut_short = idx < files.len();
            log.line(format!(
                "filter: limit of {limit} reached with {} file(s) left",
                files.len() - idx
            ));
            break;
        }

        let verdict = match classify(schema, fs, entry) {
            Ok(v) => v,
            Err(err) => {
                outcome.examined += 1;
                outcome.failed += 1;
                log.warn(Warning {
                    code: "FILTER_IO_FAILED",
                    path: &display(entry),
                    retry: "next_run",
                    err: &format!("{err:#}"),
                    ..Default::default()
                });
                continue;
            }
        };
        match verdict {
            Verdict::Zombie => {
                outcome.zombies += 1;
                log.line(format!("deleted zombie {}", display(entry)));
            }
            Verdict::Corrupt(reason) => {
                outcome.examined += 1;
                outcome.corrupt += 1;
                log.line(format!("deleted corrupt {}: {reason}", display(entry)));
            }
            Verdict::Duplicate(ts) => {
                outcome.examined += 1;
                outcome.duplicates += 1;
                outcome.last_download_time = outcome.last_download_time.max(Some(ts));
            }
            Verdict::Copied(ts) => {
                outcome.examined += 1;
                outcome.copied += 1;
                outcome.last_download_time = outcome.last_download_time.max(Some(ts));
            }
        }
    }

    outcome.pruned_dirs = fs.prune_empty_subtrees(&schema.paths.downloaded_dir, false)?;

    let watermark = SentinelStore::new(fs, &schema.paths.watermark_dir);
    if outcome.failed > 0 {
        log.line(format!(
            "filter: {} file(s) failed; watermark and compress flags held back",
            outcome.failed
        ));
    } else if !outcome.cut_short {
        if let Some(last) = outcome.last_download_time {
            watermark.add_time(last)?;
        }
        if let Some(latest) = watermark.latest_time()? {
            outcome.hours_flagged = schedule_compressions(schema, fs, now, latest, log)?;
        }
    }
    outcome.watermark = watermark.latest_time()?;

    log.line(format!(
        "filter: {} copied, {} duplicate, {} corrupt, {} zombie, {} failed",
        outcome.copied, outcome.duplicates, outcome.corrupt, outcome.zombies, outcome.failed
    ));
    Ok(outcome)
}
