use anyhow::Result;

use crate::commands::{CommandReport, StageContext, run_stage};
use crate::error::AggregatorError;
use crate::pipeline::clock::Clock;
use crate::pipeline::fs::DiskFs;
use crate::pipeline::retention::prune_logs;

pub const DEFAULT_MAX_AGE_HOURS: f64 = 168.0;

pub fn max_age_secs(hours: f64) -> Result<i64> {
    if !hours.is_finite() || hours <= 0.0 {
        return Err(AggregatorError::InvalidConfig(format!(
            "log max age must be a positive number of hours, got {hours}"
        ))
        .into());
    }
    Ok((hours * 3600.0).round().min(i64::MAX as f64) as i64)
}

pub fn run(ctx: &StageContext, clock: &dyn Clock, max_age_hours: f64) -> Result<CommandReport> {
    let max_age = max_age_secs(max_age_hours)?;
    let outcome = run_stage(ctx, clock, "prune-logs", |log| {
        prune_logs(&ctx.schema.paths, &DiskFs, clock, max_age, log)
    })?;

    let mut report = CommandReport::new("prune-logs");
    report.detail(format!("max_age_hours={max_age_hours}"));
    report.detail(format!("removed={}", outcome.removed));
    report.detail(format!("kept={}", outcome.kept));
    report.detail(format!("pruned_dirs={}", outcome.pruned_dirs));
    if outcome.failed > 0 {
        report.issue(format!("{} log file(s) could not be removed", outcome.failed));
    }
    Ok(report)
}
