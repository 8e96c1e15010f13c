use anyhow::Result;

use crate::commands::{CommandReport, StageContext, run_stage};
use crate::pipeline::clock::Clock;
use crate::pipeline::compress::{CompressOptions, run_compress};
use crate::pipeline::fs::DiskFs;

pub fn run(ctx: &StageContext, clock: &dyn Clock, opts: CompressOptions) -> Result<CommandReport> {
    let outcome = run_stage(ctx, clock, "compress", |log| {
        run_compress(&ctx.schema, &DiskFs, clock, opts, log)
    })?;

    let mut report = CommandReport::new("compress");
    report.detail(format!("hours={}", outcome.hours));
    report.detail(format!("archives={}", outcome.compressed));
    report.detail(format!("files={}", outcome.files));
    for record in &outcome.archives {
        if record.files == 0 && record.md5.is_empty() {
            report.detail(format!("archive {}-{} files=0", record.feed, record.hour));
            continue;
        }
        report.detail(format!(
            "archive {}-{} files={} appended={} md5={}",
            record.feed, record.hour, record.files, record.appended, record.md5
        ));
    }
    if outcome.limit_reached {
        report.detail("limit reached; run again to compress the rest");
    }
    if outcome.failed > 0 {
        report.issue(format!(
            "{} feed-hour compression(s) failed; files left in the filtered tree",
            outcome.failed
        ));
    }
    Ok(report)
}
