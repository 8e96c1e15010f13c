pub mod archive;
pub mod compress;
pub mod download;
pub mod filter;
pub mod init;
pub mod prune_logs;
pub mod status;
pub mod testrun;

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;

use crate::error::{AggregatorError, StageStatus};
use crate::pipeline::audit;
use crate::pipeline::clock::Clock;
use crate::pipeline::config::{self, LoadedConfig, RemoteBackend, RemoteConfig};
use crate::pipeline::paths::StoragePaths;
use crate::pipeline::runlog::RunLog;
use crate::pipeline::schema::Schema;
use crate::pipeline::store::{DirectoryStore, ObjectStore, S3Settings, S3Store};

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }

    pub fn merge(&mut self, mut other: CommandReport) {
        self.ok &= other.ok;
        self.details.append(&mut other.details);
        self.issues.append(&mut other.issues);
    }
}

#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub settings: Option<PathBuf>,
    pub root: Option<PathBuf>,
    pub quiet: bool,
}

/// Everything a stage command needs once settings are loaded.
pub struct StageContext {
    pub loaded: LoadedConfig,
    pub schema: Schema,
    pub quiet: bool,
}

impl StageContext {
    pub fn load(global: &GlobalOptions) -> Result<Self> {
        let mut loaded = config::load_config(global.settings.as_deref())?;
        if let Some(root) = &global.root {
            loaded.config.storage.root = root.clone();
        }
        let cfg = &loaded.config;
        config::required_credentials(&cfg.remote, |var| std::env::var(var).ok())?;
        let schema = Schema::new(
            StoragePaths::new(&cfg.storage.root),
            cfg.feed_descriptors(),
            i64::try_from(cfg.storage.file_access_lag_secs).unwrap_or(i64::MAX),
        );
        Ok(Self {
            loaded,
            schema,
            quiet: global.quiet,
        })
    }

    pub fn without_lag(mut self) -> Self {
        self.schema.file_access_lag_secs = 0;
        self
    }

    pub fn remote(&self) -> &RemoteConfig {
        &self.loaded.config.remote
    }
}

pub fn open_store(remote: &RemoteConfig) -> Result<Box<dyn ObjectStore>> {
    match remote.backend {
        RemoteBackend::Directory => {
            let dir = remote
                .directory
                .clone()
                .context("remote.directory is required for the directory backend")?;
            Ok(Box::new(DirectoryStore::new(dir)))
        }
        RemoteBackend::S3 => {
            let creds = config::s3_credentials_from(|var| std::env::var(var).ok())
                .ok_or_else(|| AggregatorError::MissingCredentials("s3 backend".into()))?;
            let store = S3Store::connect(&S3Settings {
                bucket: remote.bucket.clone(),
                region: remote.region.clone(),
                endpoint: remote.endpoint.clone(),
                path_style: remote.path_style,
                access_key: creds.access_key,
                secret_key: creds.secret_key,
            })?;
            Ok(Box::new(store))
        }
    }
}

/// Runs one stage body inside its run log, then records the outcome in the
/// run log and the audit trail. A stage that raised warnings is recorded as
/// `degraded`. Errors are logged with their full chain and returned.
pub fn run_stage<T, F>(ctx: &StageContext, clock: &dyn Clock, task: &str, body: F) -> Result<T>
where
    T: Serialize,
    F: FnOnce(&mut RunLog<'_>) -> Result<T>,
{
    let started = clock.now_secs();
    let log_path = ctx.schema.log_file_path(started, task)?;
    let mut log = RunLog::create(&log_path, clock, task, ctx.quiet)?;
    log.line(format!(
        "{task}: settings {} root {}",
        ctx.loaded.source.display(),
        ctx.schema.paths.root.display()
    ));

    match body(&mut log) {
        Ok(outcome) => {
            let status = if log.warnings() > 0 {
                StageStatus::Degraded
            } else {
                StageStatus::Ok
            };
            log.summary(status.as_str(), &outcome)?;
            let message = serde_json::to_string(&outcome)?;
            audit::append_event(
                &ctx.schema.paths,
                clock.now_secs(),
                task,
                status.as_str(),
                &message,
            )?;
            Ok(outcome)
        }
        Err(err) => {
            let status = StageStatus::Failed.as_str();
            log.line(format!("error: {err:?}"));
            log.summary(status, &serde_json::json!({ "error": format!("{err:#}") }))?;
            audit::append_event(
                &ctx.schema.paths,
                clock.now_secs(),
                task,
                status,
                &format!("{err:#}"),
            )?;
            Err(err.context(format!("{task} stage failed; see {}", log.path().display())))
        }
    }
}
