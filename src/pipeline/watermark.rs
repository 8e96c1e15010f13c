use crate::pipeline::fs::FileSystem;
use anyhow::Result;
use std::path::PathBuf;

/// Latest-time tracker persisted as empty files named by the value.
///
/// Readers take the largest numeric name, so a value is either fully present
/// or absent. Non-numeric names are ignored.
pub struct SentinelStore<'a> {
    fs: &'a dyn FileSystem,
    dir: PathBuf,
}

impl<'a> SentinelStore<'a> {
    pub fn new(fs: &'a dyn FileSystem, dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            dir: dir.into(),
        }
    }

    fn entries(&self) -> Result<Vec<(i64, PathBuf)>> {
        let mut out = Vec::new();
        for path in self.fs.list_dir(&self.dir)? {
            if !self.fs.is_file(&path) {
                continue;
            }
            let value = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok());
            if let Some(value) = value {
                out.push((value, path));
            }
        }
        Ok(out)
    }

    pub fn latest_time(&self) -> Result<Option<i64>> {
        Ok(self.entries()?.into_iter().map(|(v, _)| v).max())
    }

    /// Puts `ts` if it is higher than the current value, then removes every
    /// strictly-smaller sentinel. Returns the value in force afterwards.
    pub fn add_time(&self, ts: i64) -> Result<i64> {
        let current = self.latest_time()?;
        let latest = match current {
            Some(cur) if cur >= ts => cur,
            _ => {
                self.fs.touch(&self.dir.join(ts.to_string()))?;
                ts
            }
        };
        for (value, path) in self.entries()? {
            if value < latest {
                // best-effort; a concurrent add may already have removed it
                let _ = self.fs.remove_file(&path);
            }
        }
        Ok(latest)
    }
}
