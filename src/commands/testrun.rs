use anyhow::Result;

use crate::commands::archive::{self, ArchiveCommandOptions};
use crate::commands::download::{self, DownloadCommandOptions};
use crate::commands::{CommandReport, StageContext, compress, filter};
use crate::pipeline::clock::Clock;
use crate::pipeline::compress::CompressOptions;
use crate::pipeline::filter::FilterOptions;

pub const TESTRUN_FREQUENCY_SECS: f64 = 1.0;
pub const TESTRUN_DURATION_SECS: f64 = 5.0;

/// Short download loop unless the caller asked for something else.
pub fn loop_options(opts: DownloadCommandOptions) -> DownloadCommandOptions {
    DownloadCommandOptions {
        frequency_secs: opts.frequency_secs.or(Some(TESTRUN_FREQUENCY_SECS)),
        duration_secs: opts.duration_secs.or(Some(TESTRUN_DURATION_SECS)),
    }
}

/// One pass through every stage with the access lag disabled, so a fresh
/// install can be checked end to end in a single command.
pub fn run(ctx: StageContext, clock: &dyn Clock, opts: DownloadCommandOptions) -> Result<CommandReport> {
    let ctx = ctx.without_lag();
    let mut report = CommandReport::new("testrun");

    report.merge(download::run(&ctx, clock, loop_options(opts))?);
    report.merge(filter::run(&ctx, clock, FilterOptions { limit: None })?);
    report.merge(compress::run(
        &ctx,
        clock,
        CompressOptions {
            limit: None,
            compress_all: true,
        },
    )?);
    if ctx.remote().enabled {
        report.merge(archive::run(&ctx, clock, &ArchiveCommandOptions::default())?);
    } else {
        report.detail("archive skipped: remote storage disabled");
    }
    Ok(report)
}
