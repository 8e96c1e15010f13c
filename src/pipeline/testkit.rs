//! Deterministic stand-ins for the clock, network and remote bucket.

use crate::pipeline::clock::Clock;
use crate::pipeline::feeds::{FeedDescriptor, ValidatorSpec};
use crate::pipeline::fs::{DiskFs, FileEntry, FileSystem};
use crate::pipeline::paths::StoragePaths;
use crate::pipeline::schema::Schema;
use crate::pipeline::store::ObjectStore;
use crate::pipeline::transport::Transport;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub struct FakeClock {
    now_ms: Cell<i64>,
}

impl FakeClock {
    pub fn at(epoch_secs: i64) -> Self {
        Self {
            now_ms: Cell::new(epoch_secs * 1000),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ms
            .set(self.now_ms.get() + duration.as_millis() as i64);
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms.get()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms.get()).unwrap_or(DateTime::UNIX_EPOCH)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Wraps a [`FakeClock`] and raises `cancel` once `after` sleeps have run,
/// the way a Ctrl-C lands while the download loop waits for its next cycle.
pub struct CancellingClock<'a> {
    inner: &'a FakeClock,
    cancel: &'a AtomicBool,
    after: usize,
    sleeps: Cell<usize>,
}

impl<'a> CancellingClock<'a> {
    pub fn new(inner: &'a FakeClock, cancel: &'a AtomicBool, after: usize) -> Self {
        Self {
            inner,
            cancel,
            after,
            sleeps: Cell::new(0),
        }
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.get()
    }
}

impl Clock for CancellingClock<'_> {
    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }

    fn sleep(&self, duration: Duration) {
        self.inner.sleep(duration);
        let done = self.sleeps.get() + 1;
        self.sleeps.set(done);
        if done >= self.after {
            self.cancel.store(true, Ordering::SeqCst);
        }
    }
}

/// Disk-backed filesystem whose copies fail for any source path containing
/// `needle`; everything else goes straight to [`DiskFs`].
pub struct FailingCopyFs {
    pub needle: String,
}

impl FileSystem for FailingCopyFs {
    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        DiskFs.ensure_dir(dir)
    }
    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        DiskFs.write_bytes(path, bytes)
    }
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        DiskFs.read_bytes(path)
    }
    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        if from.to_string_lossy().contains(&self.needle) {
            anyhow::bail!("injected copy failure for {}", from.display());
        }
        DiskFs.copy_file(from, to)
    }
    fn remove_file(&self, path: &Path) -> Result<()> {
        DiskFs.remove_file(path)
    }
    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        DiskFs.rename(from, to)
    }
    fn is_file(&self, path: &Path) -> bool {
        DiskFs.is_file(path)
    }
    fn is_dir(&self, path: &Path) -> bool {
        DiskFs.is_dir(path)
    }
    fn touch(&self, path: &Path) -> Result<()> {
        DiskFs.touch(path)
    }
    fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        DiskFs.list_dir(dir)
    }
    fn list_files_recursive(&self, root: &Path) -> Result<Vec<FileEntry>> {
        DiskFs.list_files_recursive(root)
    }
    fn content_hash(&self, path: &Path) -> Result<String> {
        DiskFs.content_hash(path)
    }
    fn pack_dir_to_archive(&self, dir: &Path, archive: &Path, overwrite: bool) -> Result<usize> {
        DiskFs.pack_dir_to_archive(dir, archive, overwrite)
    }
    fn unpack_archive_to_dir(&self, archive: &Path, dir: &Path) -> Result<()> {
        DiskFs.unpack_archive_to_dir(archive, dir)
    }
    fn prune_empty_subtrees(&self, root: &Path, delete_self: bool) -> Result<usize> {
        DiskFs.prune_empty_subtrees(root, delete_self)
    }
}

/// Serves canned bodies per URL; unknown URLs fail. Each fetch can advance a
/// shared fake clock to model slow responses.
pub struct FakeTransport<'a> {
    clock: Option<&'a FakeClock>,
    latency: Duration,
    bodies: HashMap<String, Vec<u8>>,
    pub calls: RefCell<Vec<(String, i64)>>,
}

impl<'a> FakeTransport<'a> {
    pub fn new() -> Self {
        Self {
            clock: None,
            latency: Duration::ZERO,
            bodies: HashMap::new(),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, clock: &'a FakeClock, latency: Duration) -> Self {
        self.clock = Some(clock);
        self.latency = latency;
        self
    }

    pub fn serve(mut self, url: &str, body: &[u8]) -> Self {
        self.bodies.insert(url.to_string(), body.to_vec());
        self
    }
}

impl Transport for FakeTransport<'_> {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let started = self.clock.map(|c| c.now_ms()).unwrap_or_default();
        self.calls.borrow_mut().push((url.to_string(), started));
        if let Some(clock) = self.clock {
            clock.advance(self.latency);
        }
        match self.bodies.get(url) {
            Some(body) => Ok(body.clone()),
            None => anyhow::bail!("connection refused: {url}"),
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub objects: RefCell<BTreeMap<String, (Vec<u8>, String)>>,
    pub fail_put: Cell<bool>,
    pub fail_head: Cell<bool>,
    pub puts: Cell<usize>,
}

impl MemoryStore {
    pub fn insert(&self, key: &str, bytes: Vec<u8>, md5: &str) {
        self.objects
            .borrow_mut()
            .insert(key.to_string(), (bytes, md5.to_string()));
    }
}

impl ObjectStore for MemoryStore {
    fn head(&self, key: &str) -> Result<Option<String>> {
        if self.fail_head.get() {
            anyhow::bail!("injected head failure for {key}");
        }
        Ok(self.objects.borrow().get(key).map(|(_, md5)| md5.clone()))
    }

    fn put(&self, local: &Path, key: &str, md5: &str) -> Result<()> {
        if self.fail_put.get() {
            anyhow::bail!("injected put failure for {key}");
        }
        let bytes = DiskFs.read_bytes(local)?;
        self.insert(key, bytes, md5);
        self.puts.set(self.puts.get() + 1);
        Ok(())
    }

    fn get(&self, key: &str, local: &Path) -> Result<()> {
        let bytes = self
            .objects
            .borrow()
            .get(key)
            .map(|(b, _)| b.clone())
            .ok_or_else(|| anyhow::anyhow!("no object {key}"))?;
        DiskFs.write_bytes(local, &bytes)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// Two JSON feeds, `A` and `B`, validated at `/ts`.
pub fn json_schema(root: &Path, lag: i64) -> Schema {
    let validator = ValidatorSpec::JsonPointer {
        pointer: "/ts".into(),
    };
    let feeds = vec![
        FeedDescriptor::new("A", "http://feeds.test/a", "json", validator.build()),
        FeedDescriptor::new("B", "http://feeds.test/b", "json", validator.build()),
    ];
    Schema::new(StoragePaths::new(root), feeds, lag)
}

pub fn payload(ts: i64) -> Vec<u8> {
    format!("{{\"ts\":{ts}}}").into_bytes()
}
