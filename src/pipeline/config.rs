use crate::error::AggregatorError;
use crate::pipeline::feeds::{FeedDescriptor, ValidatorSpec, is_valid_extension, is_valid_feed_id};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = "aggregator.toml";
pub const APP_DIR_NAME: &str = "realtime-aggregator";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub file_access_lag_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            file_access_lag_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub frequency_secs: f64,
    pub duration_secs: f64,
    pub request_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            frequency_secs: 10.0,
            duration_secs: 60.0,
            request_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    pub id: String,
    pub url: String,
    pub ext: String,
    #[serde(default)]
    pub validator: ValidatorSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    #[default]
    S3,
    Directory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub backend: RemoteBackend,
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
    pub path_style: bool,
    pub global_prefix: String,
    pub local_prefix: String,
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub storage: StorageConfig,
    pub download: DownloadConfig,
    pub feeds: Vec<FeedConfig>,
    pub remote: RemoteConfig,
}

impl AggregatorConfig {
    pub fn feed_descriptors(&self) -> Vec<FeedDescriptor> {
        self.feeds
            .iter()
            .map(|f| FeedDescriptor::new(&f.id, &f.url, &f.ext, f.validator.build()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: AggregatorConfig,
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Credentials {
    pub access_key: String,
    pub secret_key: String,
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => Some(PathBuf::from(v.trim())),
        _ => None,
    }
}

/// `{RTAGG_HOME or ~}/realtime-aggregator`.
pub fn app_home() -> Option<PathBuf> {
    let base = env_path("RTAGG_HOME").or_else(dirs::home_dir)?;
    Some(base.join(APP_DIR_NAME))
}

fn settings_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    if let Some(path) = explicit {
        return vec![path.to_path_buf()];
    }
    if let Some(path) = env_path("RTAGG_SETTINGS") {
        return vec![path];
    }
    let mut out = vec![PathBuf::from(SETTINGS_FILE_NAME)];
    if let Some(home) = app_home() {
        out.push(home.join(SETTINGS_FILE_NAME));
    }
    out
}

pub fn resolve_settings_path(explicit: Option<&Path>) -> Result<PathBuf> {
    let candidates = settings_candidates(explicit);
    if let Some(found) = candidates.iter().find(|p| p.is_file()) {
        return Ok(found.clone());
    }
    let tried = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(AggregatorError::InvalidConfig(format!("no settings file found (tried {tried})")).into())
}

/// Parses settings text. A relative storage root or bucket directory is
/// resolved against `base_dir`, the directory holding the settings file.
pub fn parse_config(raw: &str, base_dir: &Path) -> Result<AggregatorConfig> {
    let mut cfg: AggregatorConfig =
        toml::from_str(raw).map_err(|err| AggregatorError::InvalidConfig(err.to_string()))?;
    if cfg.storage.root.is_relative() {
        cfg.storage.root = base_dir.join(&cfg.storage.root);
    }
    if let Some(dir) = cfg.remote.directory.as_mut()
        && dir.is_relative()
    {
        *dir = base_dir.join(&*dir);
    }
    Ok(cfg)
}

fn apply_env_overrides(cfg: &mut AggregatorConfig) {
    if let Some(root) = env_path("RTAGG_STORAGE_ROOT") {
        cfg.storage.root = root;
    }
    cfg.storage.file_access_lag_secs =
        env_or_u64("RTAGG_FILE_ACCESS_LAG_SECS", cfg.storage.file_access_lag_secs);
    cfg.download.frequency_secs =
        env_or_f64("RTAGG_DOWNLOAD_FREQUENCY_SECS", cfg.download.frequency_secs);
    cfg.download.duration_secs =
        env_or_f64("RTAGG_DOWNLOAD_DURATION_SECS", cfg.download.duration_secs);
    cfg.remote.enabled = env_or_bool("RTAGG_REMOTE_ENABLED", cfg.remote.enabled);
    cfg.remote.local_prefix = env_or_string("RTAGG_REMOTE_PREFIX", &cfg.remote.local_prefix);
}

pub fn validate(cfg: &AggregatorConfig) -> Result<()> {
    let invalid = |msg: String| -> anyhow::Error { AggregatorError::InvalidConfig(msg).into() };

    if cfg.feeds.is_empty() {
        return Err(invalid("at least one [[feeds]] entry is required".into()));
    }
    let mut seen = BTreeSet::new();
    for feed in &cfg.feeds {
        if !is_valid_feed_id(&feed.id) {
            return Err(invalid(format!(
                "invalid feed id `{}`: use ASCII letters, digits and `_`",
                feed.id
            )));
        }
        if !seen.insert(feed.id.as_str()) {
            return Err(invalid(format!("duplicate feed id `{}`", feed.id)));
        }
        if !is_valid_extension(&feed.ext) {
            return Err(invalid(format!("invalid extension for feed `{}`", feed.id)));
        }
        if feed.url.trim().is_empty() {
            return Err(invalid(format!("feed `{}` has no url", feed.id)));
        }
        if let ValidatorSpec::JsonPointer { pointer } = &feed.validator
            && !pointer.is_empty()
            && !pointer.starts_with('/')
        {
            return Err(invalid(format!(
                "feed `{}` json pointer must start with `/`",
                feed.id
            )));
        }
    }
    if !(cfg.download.frequency_secs > 0.0) {
        return Err(invalid("download frequency must be > 0 seconds".into()));
    }
    if !(cfg.download.duration_secs >= 0.0) {
        return Err(invalid("download duration must be >= 0 seconds".into()));
    }
    if cfg.download.request_timeout_secs == 0 {
        return Err(invalid("request timeout must be >= 1 second".into()));
    }
    if cfg.remote.enabled {
        match cfg.remote.backend {
            RemoteBackend::S3 => {
                if cfg.remote.bucket.trim().is_empty() {
                    return Err(invalid("remote.bucket is required for the s3 backend".into()));
                }
                if cfg.remote.region.trim().is_empty() && cfg.remote.endpoint.trim().is_empty() {
                    return Err(invalid(
                        "remote.region or remote.endpoint is required for the s3 backend".into(),
                    ));
                }
            }
            RemoteBackend::Directory => {
                if cfg.remote.directory.is_none() {
                    return Err(invalid(
                        "remote.directory is required for the directory backend".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// First non-empty pair wins: `RTAGG_S3_*`, then `AWS_*`.
pub fn s3_credentials_from(lookup: impl Fn(&str) -> Option<String>) -> Option<S3Credentials> {
    let pairs = [
        ("RTAGG_S3_ACCESS_KEY", "RTAGG_S3_SECRET_KEY"),
        ("AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"),
    ];
    for (key_var, secret_var) in pairs {
        let key = lookup(key_var).filter(|v| !v.trim().is_empty());
        let secret = lookup(secret_var).filter(|v| !v.trim().is_empty());
        if let (Some(access_key), Some(secret_key)) = (key, secret) {
            return Some(S3Credentials {
                access_key: access_key.trim().to_string(),
                secret_key: secret_key.trim().to_string(),
            });
        }
    }
    None
}

/// Credentials needed by the configured remote, if any. Missing credentials
/// for an enabled s3 remote are a setup error.
pub fn required_credentials(
    remote: &RemoteConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<S3Credentials>> {
    if !remote.enabled || remote.backend != RemoteBackend::S3 {
        return Ok(None);
    }
    match s3_credentials_from(lookup) {
        Some(creds) => Ok(Some(creds)),
        None => Err(AggregatorError::MissingCredentials(
            "set RTAGG_S3_ACCESS_KEY/RTAGG_S3_SECRET_KEY or AWS_ACCESS_KEY_ID/AWS_SECRET_ACCESS_KEY"
                .into(),
        )
        .into()),
    }
}

pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let source = resolve_settings_path(explicit)?;
    let raw = fs::read_to_string(&source)
        .with_context(|| format!("failed to read settings {}", source.display()))?;
    let base_dir = source
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut config = parse_config(&raw, &base_dir)
        .with_context(|| format!("failed to load settings {}", source.display()))?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(LoadedConfig { config, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[storage]
root = "data"

[[feeds]]
id = "ACE"
url = "http://example.test/ace"
ext = "gtfs"
"#;

    fn parsed(raw: &str) -> AggregatorConfig {
        parse_config(raw, Path::new("/etc/agg")).expect("parse")
    }

    #[test]
    fn minimal_settings_fill_defaults() {
        let cfg = parsed(MINIMAL);
        assert_eq!(cfg.storage.root, PathBuf::from("/etc/agg/data"));
        assert_eq!(cfg.storage.file_access_lag_secs, 120);
        assert_eq!(cfg.download.frequency_secs, 10.0);
        assert_eq!(cfg.feeds[0].validator, ValidatorSpec::GtfsRealtime);
        assert!(!cfg.remote.enabled);
        validate(&cfg).expect("valid");
    }

    #[test]
    fn json_pointer_validator_parses() {
        let cfg = parsed(
            r#"
[[feeds]]
id = "BUS"
url = "http://example.test/bus"
ext = "json"
validator = { kind = "json-pointer", pointer = "/header/timestamp" }
"#,
        );
        assert_eq!(
            cfg.feeds[0].validator,
            ValidatorSpec::JsonPointer {
                pointer: "/header/timestamp".into()
            }
        );
    }

    #[test]
    fn rejects_duplicate_and_malformed_ids() {
        let mut cfg = parsed(MINIMAL);
        cfg.feeds.push(cfg.feeds[0].clone());
        assert!(validate(&cfg).is_err());

        let mut cfg = parsed(MINIMAL);
        cfg.feeds[0].id = "A-B".into();
        let err = validate(&cfg).expect_err("bad id");
        assert!(err.to_string().contains("invalid feed id"));

        let mut cfg = parsed(MINIMAL);
        cfg.feeds.clear();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_bad_download_cadence() {
        let mut cfg = parsed(MINIMAL);
        cfg.download.frequency_secs = 0.0;
        assert!(validate(&cfg).is_err());
        let mut cfg = parsed(MINIMAL);
        cfg.download.duration_secs = -1.0;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn enabled_remote_requires_backend_fields() {
        let mut cfg = parsed(MINIMAL);
        cfg.remote.enabled = true;
        assert!(validate(&cfg).is_err());
        cfg.remote.bucket = "feeds".into();
        cfg.remote.region = "nyc3".into();
        validate(&cfg).expect("s3 ok");

        cfg.remote.backend = RemoteBackend::Directory;
        assert!(validate(&cfg).is_err());
        cfg.remote.directory = Some(PathBuf::from("/srv/bucket"));
        validate(&cfg).expect("directory ok");
    }

    #[test]
    fn missing_credentials_are_fatal_only_for_enabled_s3() {
        let mut cfg = parsed(MINIMAL);
        let none = |_: &str| None;
        assert_eq!(required_credentials(&cfg.remote, none).expect("disabled"), None);

        cfg.remote.enabled = true;
        let err = required_credentials(&cfg.remote, none).expect_err("missing");
        assert!(matches!(
            err.downcast_ref::<AggregatorError>(),
            Some(AggregatorError::MissingCredentials(_))
        ));

        let aws = |var: &str| match var {
            "AWS_ACCESS_KEY_ID" => Some("AK".to_string()),
            "AWS_SECRET_ACCESS_KEY" => Some("SK".to_string()),
            "RTAGG_S3_ACCESS_KEY" => Some("only-half".to_string()),
            _ => None,
        };
        assert_eq!(
            required_credentials(&cfg.remote, aws).expect("aws fallback"),
            Some(S3Credentials {
                access_key: "AK".into(),
                secret_key: "SK".into()
            })
        );

        cfg.remote.backend = RemoteBackend::Directory;
        assert_eq!(required_credentials(&cfg.remote, none).expect("directory"), None);
    }

    #[test]
    fn parse_error_is_invalid_config() {
        let err = parse_config("[[feeds]\nid=", Path::new(".")).expect_err("bad toml");
        assert!(matches!(
            err.downcast_ref::<AggregatorError>(),
            Some(AggregatorError::InvalidConfig(_))
        ));
    }
}
