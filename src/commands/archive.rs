use anyhow::Result;

use crate::commands::{CommandReport, StageContext, open_store, run_stage};
use crate::pipeline::archive::{ArchiveOptions, run_archive};
use crate::pipeline::clock::Clock;
use crate::pipeline::fs::DiskFs;

#[derive(Debug, Clone, Default)]
pub struct ArchiveCommandOptions {
    pub limit: Option<usize>,
    pub prefix: Option<String>,
}

pub fn run(
    ctx: &StageContext,
    clock: &dyn Clock,
    opts: &ArchiveCommandOptions,
) -> Result<CommandReport> {
    let mut report = CommandReport::new("archive");
    let remote = ctx.remote();
    if !remote.enabled {
        report.detail("remote storage disabled; nothing to do");
        return Ok(report);
    }

    let store = open_store(remote)?;
    let stage_opts = ArchiveOptions {
        limit: opts.limit,
        global_prefix: remote.global_prefix.clone(),
        local_prefix: opts
            .prefix
            .clone()
            .unwrap_or_else(|| remote.local_prefix.clone()),
    };
    report.detail(format!("remote={}", store.describe()));

    let outcome = run_stage(ctx, clock, "archive", |log| {
        run_archive(&ctx.schema, &DiskFs, clock, store.as_ref(), &stage_opts, log)
    })?;

    report.detail(format!("uploaded={}", outcome.uploaded));
    report.detail(format!("new={}", outcome.fresh));
    report.detail(format!("unchanged={}", outcome.unchanged));
    report.detail(format!("merged={}", outcome.merged));
    if outcome.limit_reached {
        report.detail("limit reached; run again to archive the rest");
    }
    if outcome.member_conflicts > 0 {
        report.issue(format!(
            "{} archive member(s) differed between local and remote copies; local content kept",
            outcome.member_conflicts
        ));
    }
    if outcome.failed > 0 {
        report.issue(format!(
            "{} archive(s) failed to upload and were kept locally",
            outcome.failed
        ));
    }
    Ok(report)
}
