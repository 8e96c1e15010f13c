use crate::error::AggregatorError;
use anyhow::{Context, Result};
use bzip2::Compression;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use md5::{Digest, Md5};
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const HASH_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub modified_epoch_secs: i64,
}

/// Every mutation the pipeline makes to its stage trees goes through here.
pub trait FileSystem {
    fn ensure_dir(&self, dir: &Path) -> Result<()>;
    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()>;
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>>;
    fn copy_file(&self, from: &Path, to: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    fn is_file(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    /// Creates an empty file if it does not exist yet.
    fn touch(&self, path: &Path) -> Result<()>;
    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>>;
    fn list_files_recursive(&self, root: &Path) -> Result<Vec<FileEntry>>;
    fn content_hash(&self, path: &Path) -> Result<String>;
    fn pack_dir_to_archive(&self, dir: &Path, archive: &Path, overwrite: bool) -> Result<usize>;
    fn unpack_archive_to_dir(&self, archive: &Path, dir: &Path) -> Result<()>;
    fn prune_empty_subtrees(&self, root: &Path, delete_self: bool) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFs;

fn modified_epoch_secs(meta: &fs::Metadata) -> i64 {
    let modified = meta.modified().unwrap_or(UNIX_EPOCH);
    match modified.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

fn collect_files(root: &Path, out: &mut Vec<FileEntry>) -> Result<()> {
    let entries =
        fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            // another stage removed it between listing and stat
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("failed to stat {}", path.display()));
            }
        };
        if meta.is_dir() {
            collect_files(&path, out)?;
        } else if meta.is_file() {
            out.push(FileEntry {
                path,
                modified_epoch_secs: modified_epoch_secs(&meta),
            });
        }
    }
    Ok(())
}

fn sibling_temp_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("archive");
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}-{nanos}.part", std::process::id()))
}

fn write_archive(dir: &Path, file: fs::File) -> Result<usize> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let mut builder = tar::Builder::new(BzEncoder::new(file, Compression::best()));
    for entry in &files {
        let name = entry
            .path
            .strip_prefix(dir)
            .with_context(|| format!("{} escaped {}", entry.path.display(), dir.display()))?;
        builder
            .append_path_with_name(&entry.path, name)
            .with_context(|| format!("failed to add {} to archive", entry.path.display()))?;
    }
    let encoder = builder.into_inner().context("failed to finish tar stream")?;
    let mut file = encoder.finish().context("failed to finish bzip2 stream")?;
    file.flush()?;
    file.sync_all()?;
    Ok(files.len())
}

impl FileSystem for DiskFs {
    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))
    }

    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .with_context(|| format!("{} has no parent directory", path.display()))?;
        self.ensure_dir(parent)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".incoming-")
            .suffix(".part")
            .tempfile_in(parent)
            .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
        tmp.write_all(bytes)
            .with_context(|| format!("failed to write {}", tmp.path().display()))?;
        tmp.persist(path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to move payload into {}", path.display()))?;
        Ok(())
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            self.ensure_dir(parent)?;
        }
        fs::copy(from, to)
            .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            self.ensure_dir(parent)?;
        }
        match fs::rename(from, to) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::CrossesDevices => {
                fs::copy(from, to).with_context(|| {
                    format!("failed to copy {} to {}", from.display(), to.display())
                })?;
                self.remove_file(from)
            }
            Err(err) => Err(err)
                .with_context(|| format!("failed to move {} to {}", from.display(), to.display())),
        }
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn touch(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            self.ensure_dir(parent)?;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to touch {}", path.display())),
        }
    }

    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?
        {
            out.push(entry?.path());
        }
        out.sort();
        Ok(out)
    }

    fn list_files_recursive(&self, root: &Path) -> Result<Vec<FileEntry>> {
        let mut out = Vec::new();
        if root.is_dir() {
            collect_files(root, &mut out)?;
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn content_hash(&self, path: &Path) -> Result<String> {
        let mut file =
            fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; HASH_CHUNK_BYTES];
        loop {
            let read = file
                .read(&mut buf)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn pack_dir_to_archive(&self, dir: &Path, archive: &Path, overwrite: bool) -> Result<usize> {
        if let Some(parent) = archive.parent() {
            self.ensure_dir(parent)?;
        }

        let packed = if overwrite {
            let tmp = sibling_temp_path(archive);
            let file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            let packed = match write_archive(dir, file) {
                Ok(n) => n,
                Err(err) => {
                    let _ = fs::remove_file(&tmp);
                    return Err(err);
                }
            };
            fs::rename(&tmp, archive).with_context(|| {
                format!("failed to move {} to {}", tmp.display(), archive.display())
            })?;
            packed
        } else {
            let file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(archive)
            {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    return Err(AggregatorError::ArchiveExists(archive.to_path_buf()).into());
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to create {}", archive.display()));
                }
            };
            match write_archive(dir, file) {
                Ok(n) => n,
                Err(err) => {
                    let _ = fs::remove_file(archive);
                    return Err(err);
                }
            }
        };

        fs::remove_dir_all(dir).with_context(|| format!("failed to remove {}", dir.display()))?;
        Ok(packed)
    }

    fn unpack_archive_to_dir(&self, archive: &Path, dir: &Path) -> Result<()> {
        self.ensure_dir(dir)?;
        let file = fs::File::open(archive)
            .with_context(|| format!("failed to open {}", archive.display()))?;
        let mut tar = tar::Archive::new(BzDecoder::new(file));
        tar.set_overwrite(true);
        tar.unpack(dir).with_context(|| {
            format!("failed to unpack {} into {}", archive.display(), dir.display())
        })?;
        self.remove_file(archive)
    }

    fn prune_empty_subtrees(&self, root: &Path, delete_self: bool) -> Result<usize> {
        if !root.is_dir() {
            return Ok(0);
        }
        let mut contains_files = false;
        let mut removed = 0usize;
        for child in self.list_dir(root)? {
            if child.is_dir() {
                removed += self.prune_empty_subtrees(&child, true)?;
                if child.is_dir() {
                    contains_files = true;
                }
            } else {
                contains_files = true;
            }
        }
        if !contains_files && delete_self {
            match fs::remove_dir(root) {
                Ok(_) => removed += 1,
                // a concurrent writer dropped a file in; keep the directory
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", root.display()));
                }
            }
        }
        Ok(removed)
    }
}

/// Names of the regular files inside a tar.bz2 archive, relative to its root.
#[cfg(test)]
pub fn archive_member_names(archive: &Path) -> Result<Vec<String>> {
    let file =
        fs::File::open(archive).with_context(|| format!("failed to open {}", archive.display()))?;
    let mut tar = tar::Archive::new(BzDecoder::new(file));
    let mut names = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?;
        names.push(path.display().to_string());
    }
    names.sort();
    Ok(names)
}
