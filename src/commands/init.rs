use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::commands::CommandReport;
use crate::pipeline::config::{self, SETTINGS_FILE_NAME};
use crate::pipeline::fs::{DiskFs, FileSystem};

pub const CRONTAB_FILE_NAME: &str = "schedules.crontab";

const SETTINGS_TEMPLATE: &str = r#"# realtime-aggregator settings
[storage]
root = "."
file_access_lag_secs = 120

[download]
frequency_secs = 10.0
duration_secs = 60.0
request_timeout_secs = 20

[[feeds]]
id = "ACE"
url = "https://example.com/feeds/ace"
ext = "gtfs"
validator = { kind = "gtfs-realtime" }

# [[feeds]]
# id = "BUS"
# url = "https://example.com/feeds/bus.json"
# ext = "json"
# validator = { kind = "json-pointer", pointer = "/header/timestamp" }

[remote]
enabled = false
backend = "s3"
bucket = ""
region = "nyc3"
endpoint = "https://nyc3.digitaloceanspaces.com"
path_style = false
global_prefix = ""
local_prefix = ""
"#;

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub dir: Option<PathBuf>,
    pub force: bool,
}

/// Download runs for a minute every minute; the later stages trail it and
/// old run logs are swept once a day.
pub fn crontab_text(binary: &str, settings: &Path) -> String {
    let settings = settings.display();
    format!(
        "# realtime-aggregator schedules\n\
         * * * * * {binary} --settings {settings} --quiet download\n\
         */5 * * * * {binary} --settings {settings} --quiet filter\n\
         7 * * * * {binary} --settings {settings} --quiet compress\n\
         17 * * * * {binary} --settings {settings} --quiet archive\n\
         23 3 * * * {binary} --settings {settings} --quiet prune-logs\n"
    )
}

fn binary_name() -> String {
    std::env::current_exe()
        .ok()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "rtagg".to_string())
}

pub fn run(opts: &InitOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("init");
    let dir = match &opts.dir {
        Some(dir) => dir.clone(),
        None => config::app_home().context("cannot resolve home directory; pass --dir")?,
    };
    let fs = DiskFs;
    fs.ensure_dir(&dir)?;

    let settings_path = dir.join(SETTINGS_FILE_NAME);
    let crontab_path = dir.join(CRONTAB_FILE_NAME);
    let files = [
        (settings_path.clone(), SETTINGS_TEMPLATE.to_string()),
        (crontab_path, crontab_text(&binary_name(), &settings_path)),
    ];

    for (path, body) in files {
        if fs.is_file(&path) && !opts.force {
            report.issue(format!(
                "{} already exists; rerun with --force to overwrite",
                path.display()
            ));
            continue;
        }
        fs.write_bytes(&path, body.as_bytes())
            .with_context(|| format!("failed to write {}", path.display()))?;
        report.detail(format!("wrote {}", path.display()));
    }
    Ok(report)
}
