use crate::error::AggregatorError;
use crate::pipeline::fs::{DiskFs, FileSystem};
use anyhow::{Context, Result};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use std::fs;
use std::path::{Path, PathBuf};

pub const MD5_METADATA_KEY: &str = "md5chksum";

/// Remote storage surface the archive stage needs.
pub trait ObjectStore {
    /// Stored content hash, or `None` when no object exists at `key`.
    fn head(&self, key: &str) -> Result<Option<String>>;

    fn put(&self, local: &Path, key: &str, md5: &str) -> Result<()>;

    fn get(&self, key: &str, local: &Path) -> Result<()>;

    fn describe(&self) -> String;
}

pub struct S3Store {
    bucket: Bucket,
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: String,
    pub path_style: bool,
    pub access_key: String,
    pub secret_key: String,
}

impl S3Store {
    pub fn connect(settings: &S3Settings) -> Result<Self> {
        let region = if settings.endpoint.trim().is_empty() {
            settings
                .region
                .parse::<Region>()
                .with_context(|| format!("unknown s3 region `{}`", settings.region))?
        } else {
            Region::Custom {
                region: settings.region.clone(),
                endpoint: settings.endpoint.clone(),
            }
        };
        let creds = Credentials::new(
            Some(settings.access_key.as_str()),
            Some(settings.secret_key.as_str()),
            None,
            None,
            None,
        )?;
        let mut bucket = Bucket::new(settings.bucket.as_str(), region, creds)
            .with_context(|| format!("failed to open bucket `{}`", settings.bucket))?;
        if settings.path_style {
            bucket = bucket.with_path_style();
        }
        Ok(Self { bucket })
    }
}

fn is_not_found(err: &S3Error) -> bool {
    matches!(err, S3Error::HttpFailWithBody(404, _))
}

impl ObjectStore for S3Store {
    fn head(&self, key: &str) -> Result<Option<String>> {
        let (head, status) = match self.bucket.head_object(key) {
            Ok(found) => found,
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("HEAD {key} failed")),
        };
        if status == 404 {
            return Ok(None);
        }
        if !(200..300).contains(&status) {
            anyhow::bail!("HEAD {key} returned status {status}");
        }
        let metadata = head.metadata.unwrap_or_default();
        let stored = metadata
            .get(MD5_METADATA_KEY)
            .or_else(|| metadata.get(&format!("x-amz-meta-{MD5_METADATA_KEY}")))
            .cloned();
        // objects written by other tools carry no hash; force a merge
        Ok(Some(stored.unwrap_or_default()))
    }

    fn put(&self, local: &Path, key: &str, md5: &str) -> Result<()> {
        let bytes =
            fs::read(local).with_context(|| format!("failed to read {}", local.display()))?;
        let mut bucket = self.bucket.clone();
        bucket.add_header(&format!("x-amz-meta-{MD5_METADATA_KEY}"), md5);
        let response = bucket
            .put_object_with_content_type(key, &bytes, "application/x-bzip2")
            .with_context(|| format!("PUT {key} failed"))?;
        let status = response.status_code();
        if !(200..300).contains(&status) {
            anyhow::bail!("PUT {key} returned status {status}");
        }
        Ok(())
    }

    fn get(&self, key: &str, local: &Path) -> Result<()> {
        let response = match self.bucket.get_object(key) {
            Ok(response) => response,
            Err(err) if is_not_found(&err) => {
                return Err(AggregatorError::ObjectNotFound(key.to_string()).into());
            }
            Err(err) => return Err(err).with_context(|| format!("GET {key} failed")),
        };
        match response.status_code() {
            200..=299 => {}
            404 => return Err(AggregatorError::ObjectNotFound(key.to_string()).into()),
            status => anyhow::bail!("GET {key} returned status {status}"),
        }
        DiskFs.write_bytes(local, response.bytes())
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket.name())
    }
}

/// A local directory used as a bucket. Hashes live in `{key}.md5` sidecars.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        let object = self.object_path(key);
        let mut name = object.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".md5");
        object.with_file_name(name)
    }
}

impl ObjectStore for DirectoryStore {
    fn head(&self, key: &str) -> Result<Option<String>> {
        let object = self.object_path(key);
        if !object.is_file() {
            return Ok(None);
        }
        let sidecar = self.sidecar_path(key);
        if sidecar.is_file() {
            let raw = fs::read_to_string(&sidecar)
                .with_context(|| format!("failed to read {}", sidecar.display()))?;
            return Ok(Some(raw.trim().to_string()));
        }
        DiskFs.content_hash(&object).map(Some)
    }

    fn put(&self, local: &Path, key: &str, md5: &str) -> Result<()> {
        let bytes = DiskFs.read_bytes(local)?;
        DiskFs.write_bytes(&self.object_path(key), &bytes)?;
        DiskFs.write_bytes(&self.sidecar_path(key), format!("{md5}\n").as_bytes())
    }

    fn get(&self, key: &str, local: &Path) -> Result<()> {
        let object = self.object_path(key);
        if !object.is_file() {
            return Err(AggregatorError::ObjectNotFound(key.to_string()).into());
        }
        DiskFs.copy_file(&object, local)
    }

    fn describe(&self) -> String {
        format!("dir://{}", self.root.display())
    }
}
