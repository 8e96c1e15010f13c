use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub root: PathBuf,
    pub feeds_dir: PathBuf,
    pub downloaded_dir: PathBuf,
    pub filtered_dir: PathBuf,
    pub compressed_dir: PathBuf,
    pub watermark_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let feeds_dir = root.join("feeds");
        Self {
            downloaded_dir: feeds_dir.join("downloaded"),
            filtered_dir: feeds_dir.join("filtered"),
            compressed_dir: feeds_dir.join("compressed"),
            watermark_dir: feeds_dir.join("watermark"),
            logs_dir: root.join("logs"),
            scratch_dir: root.join("tmp"),
            feeds_dir,
            root,
        }
    }

    pub fn audit_log(&self) -> PathBuf {
        self.logs_dir.join("audit.log")
    }
}

#[cfg(test)]
mod tests {
    use super::StoragePaths;
    use std::path::PathBuf;

    #[test]
    fn stage_roots_hang_off_feeds_dir() {
        let paths = StoragePaths::new("/srv/agg");
        assert_eq!(
            paths.downloaded_dir,
            PathBuf::from("/srv/agg/feeds/downloaded")
        );
        assert_eq!(paths.feeds_dir, PathBuf::from("/srv/agg/feeds"));
        assert_eq!(paths.filtered_dir, PathBuf::from("/srv/agg/feeds/filtered"));
        assert_eq!(
            paths.compressed_dir,
            PathBuf::from("/srv/agg/feeds/compressed")
        );
        assert_eq!(paths.audit_log(), PathBuf::from("/srv/agg/logs/audit.log"));
    }
}
