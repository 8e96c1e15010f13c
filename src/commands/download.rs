use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::commands::{CommandReport, StageContext, run_stage};
use crate::error::AggregatorError;
use crate::pipeline::clock::Clock;
use crate::pipeline::download::{DownloadOptions, DownloadOutcome, run_download};
use crate::pipeline::fs::DiskFs;
use crate::pipeline::transport::{HttpTransport, Transport};

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadCommandOptions {
    pub frequency_secs: Option<f64>,
    pub duration_secs: Option<f64>,
}

fn seconds(label: &str, value: f64, allow_zero: bool) -> Result<Duration> {
    let in_range = if allow_zero { value >= 0.0 } else { value > 0.0 };
    if !in_range {
        return Err(AggregatorError::InvalidConfig(format!("{label} out of range: {value}")).into());
    }
    Duration::try_from_secs_f64(value)
        .map_err(|err| AggregatorError::InvalidConfig(format!("{label} {value}: {err}")).into())
}

pub fn resolve_options(ctx: &StageContext, opts: DownloadCommandOptions) -> Result<DownloadOptions> {
    let cfg = &ctx.loaded.config.download;
    Ok(DownloadOptions {
        frequency: seconds(
            "download frequency",
            opts.frequency_secs.unwrap_or(cfg.frequency_secs),
            false,
        )?,
        duration: seconds(
            "download duration",
            opts.duration_secs.unwrap_or(cfg.duration_secs),
            true,
        )?,
    })
}

/// Ctrl-C ends the loop after the in-flight cycle. A second handler cannot be
/// installed in the same process, which only matters for `testrun`; in that
/// case the loop simply runs to its duration.
fn install_cancel_flag() -> (Arc<AtomicBool>, Option<String>) {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    let note = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst))
        .err()
        .map(|err| format!("ctrl-c handler not installed: {err}"));
    (flag, note)
}

pub fn run_outcome(
    ctx: &StageContext,
    clock: &dyn Clock,
    transport: &dyn Transport,
    opts: DownloadOptions,
    cancel: &AtomicBool,
) -> Result<DownloadOutcome> {
    run_stage(ctx, clock, "download", |log| {
        run_download(&ctx.schema, &DiskFs, clock, transport, opts, cancel, log)
    })
}

pub fn report(outcome: &DownloadOutcome) -> CommandReport {
    let mut report = CommandReport::new("download");
    report.detail(format!("cycles={}", outcome.cycles));
    report.detail(format!("succeeded={}", outcome.succeeded));
    report.detail(format!("failed={}", outcome.failed));
    report.detail(format!("success_rate={:.3}", outcome.success_rate()));
    if outcome.overruns > 0 {
        report.detail(format!("overruns={}", outcome.overruns));
    }
    if outcome.cancelled {
        report.detail("cancelled before the configured duration");
    }
    for (feed, tally) in &outcome.per_feed {
        report.detail(format!(
            "feed {feed} ok={} failed={}",
            tally.succeeded, tally.failed
        ));
    }
    let attempts = outcome.succeeded + outcome.failed;
    if attempts > 0 && outcome.succeeded == 0 {
        report.issue(format!("all {attempts} download attempt(s) failed"));
    }
    report
}

pub fn run(
    ctx: &StageContext,
    clock: &dyn Clock,
    opts: DownloadCommandOptions,
) -> Result<CommandReport> {
    let resolved = resolve_options(ctx, opts)?;
    let transport = HttpTransport::new(ctx.loaded.config.download.request_timeout_secs)?;
    let (cancel, note) = install_cancel_flag();
    let outcome = run_outcome(ctx, clock, &transport, resolved, &cancel)?;
    let mut summary = report(&outcome);
    if let Some(note) = note {
        summary.detail(note);
    }
    Ok(summary)
}
