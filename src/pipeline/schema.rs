use crate::pipeline::feeds::FeedDescriptor;
use crate::pipeline::fs::{FileEntry, FileSystem};
use crate::pipeline::paths::StoragePaths;
use crate::pipeline::timefmt::{
    date_part, format_timestamp, hour_label, hour_part, hour_start, parse_hour_dir,
    parse_hour_label, parse_timestamp,
};
use anyhow::Result;
use std::path::{Path, PathBuf};

pub const DOWNLOADED_AFFIX: &str = "-dt";
pub const FILTERED_AFFIX: &str = "";
pub const COMPRESS_FLAG: &str = "compress";
pub const ARCHIVE_SUFFIX: &str = ".tar.bz2";

const TIMESTAMP_TEXT_LEN: usize = 18;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredHour {
    pub hour_ts: i64,
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedArchive {
    pub feed_id: String,
    pub hour_ts: i64,
    pub path: PathBuf,
}

/// Maps `(stage, feed, timestamp)` to paths and keys, and back.
#[derive(Debug, Clone)]
pub struct Schema {
    pub paths: StoragePaths,
    pub feeds: Vec<FeedDescriptor>,
    pub file_access_lag_secs: i64,
}

fn hour_dir(base: &Path, ts: i64) -> Result<PathBuf> {
    Ok(base.join(date_part(ts)?).join(hour_part(ts)?))
}

fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn archive_file_name(ts: i64, feed_id: &str) -> Result<String> {
    Ok(format!("{feed_id}-{}{ARCHIVE_SUFFIX}", hour_label(hour_start(ts))?))
}

impl Schema {
    pub fn new(paths: StoragePaths, feeds: Vec<FeedDescriptor>, file_access_lag_secs: i64) -> Self {
        Self {
            paths,
            feeds,
            file_access_lag_secs,
        }
    }

    pub fn feed(&self, feed_id: &str) -> Option<&FeedDescriptor> {
        self.feeds.iter().find(|f| f.id == feed_id)
    }

    // Path and key builders fail only for instants outside `is_representable`.

    pub fn downloaded_path(&self, ts: i64, feed_id: &str, ext: &str) -> Result<PathBuf> {
        Ok(hour_dir(&self.paths.downloaded_dir, ts)?.join(feed_id).join(format!(
            "{feed_id}-{}{DOWNLOADED_AFFIX}.{ext}",
            format_timestamp(ts)?
        )))
    }

    pub fn filtered_path(&self, ts: i64, feed_id: &str, ext: &str) -> Result<PathBuf> {
        Ok(self.filtered_feed_dir(ts, feed_id)?.join(format!(
            "{feed_id}-{}{FILTERED_AFFIX}.{ext}",
            format_timestamp(ts)?
        )))
    }

    pub fn filtered_feed_dir(&self, ts: i64, feed_id: &str) -> Result<PathBuf> {
        Ok(hour_dir(&self.paths.filtered_dir, ts)?.join(feed_id))
    }

    pub fn compressed_path(&self, ts: i64, feed_id: &str) -> Result<PathBuf> {
        let hour = hour_start(ts);
        Ok(hour_dir(&self.paths.compressed_dir, hour)?.join(archive_file_name(hour, feed_id)?))
    }

    pub fn archived_key(&self, ts: i64, feed_id: &str) -> Result<String> {
        let hour = hour_start(ts);
        Ok(join_key(&[
            &date_part(hour)?,
            &hour_part(hour)?,
            &archive_file_name(hour, feed_id)?,
        ]))
    }

    /// `{global}/{local}/{archived_key}`, skipping empty prefixes.
    pub fn remote_key(
        &self,
        global_prefix: &str,
        local_prefix: &str,
        ts: i64,
        feed_id: &str,
    ) -> Result<String> {
        Ok(join_key(&[global_prefix, local_prefix, &self.archived_key(ts, feed_id)?]))
    }

    pub fn compress_flag_path(&self, hour_ts: i64) -> Result<PathBuf> {
        Ok(hour_dir(&self.paths.filtered_dir, hour_ts)?.join(COMPRESS_FLAG))
    }

    pub fn log_file_path(&self, ts: i64, task: &str) -> Result<PathBuf> {
        Ok(hour_dir(&self.paths.logs_dir, ts)?.join(format!("{task}-{}.log", format_timestamp(ts)?)))
    }

    /// Recovers `(feed_id, timestamp)` from `{feed}-{ISO}{affix}.{ext}`.
    ///
    /// Rejects unknown feeds and extensions that differ from the feed's own.
    pub fn parse_feed_file_name(&self, name: &str, affix: &str) -> Option<(String, i64)> {
        let (feed_id, rest) = name.split_once('-')?;
        let feed = self.feed(feed_id)?;
        let stamp = rest.get(..TIMESTAMP_TEXT_LEN)?;
        let ts = parse_timestamp(stamp)?;
        let tail = rest.get(TIMESTAMP_TEXT_LEN..)?;
        let ext = tail.strip_prefix(affix)?.strip_prefix('.')?;
        if ext != feed.ext {
            return None;
        }
        Some((feed.id.clone(), ts))
    }

    /// Recovers `(feed_id, hour_ts)` from `{feed}-{YYYY-MM-DD}T{HH}.tar.bz2`.
    pub fn parse_compressed_file_name(&self, name: &str) -> Option<(String, i64)> {
        let stem = name.strip_suffix(ARCHIVE_SUFFIX)?;
        let (feed_id, label) = stem.split_once('-')?;
        let feed = self.feed(feed_id)?;
        let hour_ts = parse_hour_label(label)?;
        Some((feed.id.clone(), hour_ts))
    }

    fn passes_lag(&self, now: i64, modified: i64) -> bool {
        self.file_access_lag_secs <= 0 || now - modified >= self.file_access_lag_secs
    }

    pub fn list_downloaded(&self, fs: &dyn FileSystem, now: i64) -> Result<Vec<FileEntry>> {
        let files = fs.list_files_recursive(&self.paths.downloaded_dir)?;
        Ok(files
            .into_iter()
            .filter(|entry| self.passes_lag(now, entry.modified_epoch_secs))
            .collect())
    }

    /// Every `{date}/{hour}` directory under the filtered root, oldest first.
    pub fn list_filtered_hours(
        &self,
        fs: &dyn FileSystem,
        now: i64,
        include_recent: bool,
    ) -> Result<Vec<FilteredHour>> {
        let mut out = Vec::new();
        for date_dir in fs.list_dir(&self.paths.filtered_dir)? {
            if !fs.is_dir(&date_dir) {
                continue;
            }
            let Some(date) = date_dir.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            for hour_path in fs.list_dir(&date_dir)? {
                if !fs.is_dir(&hour_path) {
                    continue;
                }
                let Some(hour) = hour_path.file_name().and_then(|s| s.to_str()) else {
                    continue;
                };
                let Some(hour_ts) = parse_hour_dir(date, hour) else {
                    continue;
                };
                if !include_recent && !self.passes_lag(now, hour_ts) {
                    continue;
                }
                out.push(FilteredHour {
                    hour_ts,
                    dir: hour_path,
                });
            }
        }
        out.sort_by_key(|h| h.hour_ts);
        Ok(out)
    }

    pub fn list_compressed(&self, fs: &dyn FileSystem, now: i64) -> Result<Vec<CompressedArchive>> {
        let mut out = Vec::new();
        for entry in fs.list_files_recursive(&self.paths.compressed_dir)? {
            if !self.passes_lag(now, entry.modified_epoch_secs) {
                continue;
            }
            let Some(name) = entry.path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((feed_id, hour_ts)) = self.parse_compressed_file_name(name) else {
                continue;
            };
            out.push(CompressedArchive {
                feed_id,
                hour_ts,
                path: entry.path,
            });
        }
        Ok(out)
    }

    /// Filtered payload files of one feed in one hour bucket.
    pub fn list_filtered_feed_files(
        &self,
        fs: &dyn FileSystem,
        hour_ts: i64,
        feed_id: &str,
    ) -> Result<Vec<PathBuf>> {
        let dir = self.filtered_feed_dir(hour_ts, feed_id)?;
        Ok(fs
            .list_files_recursive(&dir)?
            .into_iter()
            .map(|entry| entry.path)
            .collect())
    }
}
