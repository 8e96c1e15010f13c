use anyhow::Result;

use crate::commands::{CommandReport, StageContext, run_stage};
use crate::pipeline::clock::Clock;
use crate::pipeline::filter::{FilterOptions, FilterOutcome, run_filter};
use crate::pipeline::fs::DiskFs;

pub fn run_outcome(
    ctx: &StageContext,
    clock: &dyn Clock,
    opts: FilterOptions,
) -> Result<FilterOutcome> {
    run_stage(ctx, clock, "filter", |log| {
        run_filter(&ctx.schema, &DiskFs, clock, opts, log)
    })
}

pub fn report(outcome: &FilterOutcome) -> CommandReport {
    let mut report = CommandReport::new("filter");
    report.detail(format!("copied={}", outcome.copied));
    report.detail(format!("duplicates={}", outcome.duplicates));
    report.detail(format!("corrupt={}", outcome.corrupt));
    report.detail(format!("zombies={}", outcome.zombies));
    report.detail(format!("cut_short={}", outcome.cut_short));
    match outcome.watermark {
        Some(ts) => report.detail(format!("watermark={ts}")),
        None => report.detail("watermark=none"),
    }
    if !outcome.hours_flagged.is_empty() {
        report.detail(format!(
            "scheduled_for_compression={}",
            outcome.hours_flagged.join(",")
        ));
    }
    if outcome.failed > 0 {
        report.issue(format!(
            "{} file(s) could not be moved; they stay in the downloaded tree",
            outcome.failed
        ));
    }
    report
}

pub fn run(ctx: &StageContext, clock: &dyn Clock, opts: FilterOptions) -> Result<CommandReport> {
    Ok(report(&run_outcome(ctx, clock, opts)?))
}
