use crate::pipeline::clock::Clock;
use crate::pipeline::fs::FileSystem;
use crate::pipeline::runlog::RunLog;
use crate::pipeline::schema::Schema;
use crate::pipeline::timefmt::{date_part, hour_part};
use crate::pipeline::transport::Transport;
use crate::pipeline::warn::Warning;
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const SLEEP_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    pub frequency: Duration,
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedTally {
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub started_at: i64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadOutcome {
    pub cycles: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub overruns: u64,
    pub cancelled: bool,
    pub per_feed: BTreeMap<String, FeedTally>,
    pub hours_written: BTreeSet<String>,
    #[serde(skip)]
    pub cycle_reports: Vec<CycleReport>,
}

impl DownloadOutcome {
    pub fn success_rate(&self) -> f64 {
        let attempts = self.succeeded + self.failed;
        if attempts == 0 {
            return 0.0;
        }
        self.succeeded as f64 / attempts as f64
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn run_cycle(
    schema: &Schema,
    fs: &dyn FileSystem,
    clock: &dyn Clock,
    transport: &dyn Transport,
    log: &mut RunLog<'_>,
    outcome: &mut DownloadOutcome,
) -> Result<CycleReport> {
    let started_at = clock.now_secs();
    let mut report = CycleReport {
        started_at,
        ..Default::default()
    };
    outcome
        .hours_written
        .insert(format!("{}/{}", date_part(started_at)?, hour_part(started_at)?));

    for feed in &schema.feeds {
        let tally = outcome.per_feed.entry(feed.id.clone()).or_default();
        let target = schema.downloaded_path(started_at, &feed.id, &feed.ext)?;
        let result = transport
            .fetch(&feed.url)
            .and_then(|body| fs.write_bytes(&target, &body));
        match result {
            Ok(()) => {
                tally.succeeded += 1;
                report.succeeded += 1;
            }
            Err(err) => {
                tally.failed += 1;
                report.failed += 1;
                log.warn(Warning {
                    code: "FETCH_FAILED",
                    feed: &feed.id,
                    path: &feed.url,
                    retry: "next_cycle",
                    err: &format!("{err:#}"),
                    ..Default::default()
                });
            }
        }
    }
    outcome.succeeded += report.succeeded;
    outcome.failed += report.failed;
    log.line(format!(
        "cycle {} done: {} downloaded, {} failed",
        outcome.cycles + 1,
        report.succeeded,
        report.failed
    ));
    Ok(report)
}

/// Sleeps until `deadline_ms`, waking early if `cancel` is raised.
fn sleep_until(clock: &dyn Clock, deadline_ms: i64, cancel: &AtomicBool) {
    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let remaining = deadline_ms - clock.now().timestamp_millis();
        if remaining <= 0 {
            return;
        }
        let slice = Duration::from_millis(remaining as u64).min(SLEEP_SLICE);
        clock.sleep(slice);
    }
}

/// Fetches every feed once per cycle until `duration` has elapsed.
///
/// Cycle `n` is scheduled at `start + n * frequency`, so slow fetches never
/// push later cycles back. At least one cycle runs unless cancelled first.
pub fn run_download(
    schema: &Schema,
    fs: &dyn FileSystem,
    clock: &dyn Clock,
    transport: &dyn Transport,
    opts: DownloadOptions,
    cancel: &AtomicBool,
    log: &mut RunLog<'_>,
) -> Result<DownloadOutcome> {
    let mut outcome = DownloadOutcome::default();
    let start_ms = clock.now().timestamp_millis();
    let frequency_ms = millis(opts.frequency).max(1);
    let duration_ms = millis(opts.duration);
    log.line(format!(
        "download: {} feed(s) every {:.3}s for {:.3}s",
        schema.feeds.len(),
        opts.frequency.as_secs_f64(),
        opts.duration.as_secs_f64()
    ));

    loop {
        if cancel.load(Ordering::SeqCst) {
            outcome.cancelled = true;
            log.line("download: interrupted, stopping");
            break;
        }

        let report = run_cycle(schema, fs, clock, transport, log, &mut outcome)?;
        outcome.cycle_reports.push(report);
        outcome.cycles += 1;

        let now_ms = clock.now().timestamp_millis();
        if now_ms - start_ms >= duration_ms {
            break;
        }

        let next_ms = start_ms.saturating_add(frequency_ms.saturating_mul(outcome.cycles as i64));
        if next_ms - start_ms >= duration_ms {
            break;
        }
        if next_ms <= now_ms {
            outcome.overruns += 1;
            log.line(format!(
                "warning: cycle {} overran the {:.3}s frequency by {}ms; starting next cycle now",
                outcome.cycles,
                opts.frequency.as_secs_f64(),
                now_ms - next_ms
            ));
            continue;
        }
        sleep_until(clock, next_ms, cancel);
    }

    for (feed, tally) in &outcome.per_feed {
        log.line(format!(
            "feed {feed}: {} downloaded, {} failed",
            tally.succeeded, tally.failed
        ));
    }
    log.line(format!(
        "download: {} cycle(s), {} downloaded, {} failed, success rate {:.1}%",
        outcome.cycles,
        outcome.succeeded,
        outcome.failed,
        outcome.success_rate() * 100.0
    ));
    Ok(outcome)
}
