use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::archive::ArchiveCommandOptions;
use crate::commands::download::DownloadCommandOptions;
use crate::commands::init::InitOptions;
use crate::commands::prune_logs::DEFAULT_MAX_AGE_HOURS;
use crate::commands::{
    CommandReport, GlobalOptions, StageContext, archive, compress, download, filter, init,
    prune_logs, status, testrun,
};
use crate::pipeline::clock::SystemClock;
use crate::pipeline::compress::CompressOptions;
use crate::pipeline::filter::FilterOptions;

/// Exit code for a run that finished but reported issues.
pub const EXIT_ISSUES: i32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "rtagg",
    version,
    about = "Realtime transit feed aggregator: download, filter, compress, archive"
)]
pub struct Cli {
    /// Settings file (defaults to RTAGG_SETTINGS, ./aggregator.toml, then the app home).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Override the storage root from settings.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Suppress progress lines and warnings on stderr.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Print the command report as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Copy)]
struct LoopArgs {
    /// Seconds between download cycles.
    #[arg(long)]
    frequency: Option<f64>,
    /// Seconds the download loop runs for.
    #[arg(long)]
    duration: Option<f64>,
}

impl From<LoopArgs> for DownloadCommandOptions {
    fn from(args: LoopArgs) -> Self {
        Self {
            frequency_secs: args.frequency,
            duration_secs: args.duration,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch every feed on a fixed cadence into the downloaded tree.
    Download(LoopArgs),
    /// Validate and deduplicate downloaded files into hour buckets.
    Filter {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Pack flagged hour buckets into per-feed tar.bz2 archives.
    Compress {
        #[arg(long)]
        limit: Option<usize>,
        /// Also compress buckets without a compress flag.
        #[arg(long)]
        compress_all: bool,
    },
    /// Upload archives to remote storage, merging with existing objects.
    Archive {
        #[arg(long)]
        limit: Option<usize>,
        /// Local key prefix, overriding remote.local_prefix.
        #[arg(long)]
        prefix: Option<String>,
    },
    /// Run every stage once with the access lag disabled; downloads every 1s for 5s unless overridden.
    Testrun(LoopArgs),
    /// Write a template settings file and crontab.
    Init {
        #[arg(long)]
        force: bool,
        /// Target directory (defaults to the app home).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Delete run logs older than the given age; the audit trail is kept.
    PruneLogs {
        #[arg(long, default_value_t = DEFAULT_MAX_AGE_HOURS)]
        max_age_hours: f64,
    },
    /// Show paths, pending work and environment.
    Status,
}

fn print_report(report: &CommandReport, json: bool, quiet: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if !quiet {
        println!("{}: {}", report.command, if report.ok { "ok" } else { "issues" });
        for detail in &report.details {
            println!("  {detail}");
        }
    }
    for issue in &report.issues {
        eprintln!("issue: {issue}");
    }
    Ok(())
}

fn dispatch(cli: Cli) -> Result<CommandReport> {
    let global = GlobalOptions {
        settings: cli.settings,
        root: cli.root,
        quiet: cli.quiet,
    };
    let clock = SystemClock;

    let load = || StageContext::load(&global);

    match cli.command {
        Command::Init { force, dir } => init::run(&InitOptions { dir, force }),
        Command::Download(args) => download::run(&load()?, &clock, args.into()),
        Command::Filter { limit } => filter::run(&load()?, &clock, FilterOptions { limit }),
        Command::Compress {
            limit,
            compress_all,
        } => compress::run(
            &load()?,
            &clock,
            CompressOptions {
                limit,
                compress_all,
            },
        ),
        Command::Archive { limit, prefix } => {
            archive::run(&load()?, &clock, &ArchiveCommandOptions { limit, prefix })
        }
        Command::Testrun(args) => testrun::run(load()?, &clock, args.into()),
        Command::PruneLogs { max_age_hours } => {
            prune_logs::run(&load()?, &clock, max_age_hours)
        }
        Command::Status => status::run(&load()?, &clock),
    }
}

/// Parses arguments, runs the command and returns the process exit code.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();
    let (json, quiet) = (cli.json, cli.quiet);
    let report = dispatch(cli)?;
    print_report(&report, json, quiet)?;
    Ok(if report.ok { 0 } else { EXIT_ISSUES })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "rtagg",
            "compress",
            "--compress-all",
            "--limit",
            "3",
            "--root",
            "/srv/agg",
            "--json",
        ])
        .expect("parse");
        assert!(cli.json);
        assert_eq!(cli.root, Some(PathBuf::from("/srv/agg")));
        match cli.command {
            Command::Compress {
                limit,
                compress_all,
            } => {
                assert_eq!(limit, Some(3));
                assert!(compress_all);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn loop_flags_map_to_download_options() {
        let cli = Cli::try_parse_from(["rtagg", "testrun", "--frequency", "0.5", "--duration", "2"])
            .expect("parse");
        let Command::Testrun(args) = cli.command else {
            panic!("expected testrun");
        };
        let opts = DownloadCommandOptions::from(args);
        assert_eq!(opts.frequency_secs, Some(0.5));
        assert_eq!(opts.duration_secs, Some(2.0));
    }

    #[test]
    fn prune_logs_defaults_to_a_week() {
        let cli = Cli::try_parse_from(["rtagg", "prune-logs"]).expect("parse");
        let Command::PruneLogs { max_age_hours } = cli.command else {
            panic!("expected prune-logs");
        };
        assert_eq!(max_age_hours, 168.0);

        let cli = Cli::try_parse_from(["rtagg", "prune-logs", "--max-age-hours", "12"])
            .expect("parse");
        assert!(matches!(cli.command, Command::PruneLogs { max_age_hours } if max_age_hours == 12.0));
    }
}
