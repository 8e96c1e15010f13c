use crate::pipeline::clock::Clock;
use crate::pipeline::fs::FileSystem;
use crate::pipeline::runlog::RunLog;
use crate::pipeline::schema::{CompressedArchive, Schema};
use crate::pipeline::store::ObjectStore;
use crate::pipeline::warn::Warning;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    pub limit: Option<usize>,
    pub global_prefix: String,
    pub local_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveAction {
    Uploaded,
    AlreadyPresent,
    Merged,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiveOutcome {
    pub uploaded: usize,
    pub failed: usize,
    pub fresh: usize,
    pub unchanged: usize,
    pub merged: usize,
    pub member_conflicts: usize,
    pub limit_reached: bool,
    pub pruned_dirs: usize,
}

/// Folds the remote archive at `key` into the local archive at `local`.
///
/// Local members overwrite same-named remote members. Returns the names of
/// members whose content differed.
fn merge_with_remote(
    schema: &Schema,
    fs: &dyn FileSystem,
    store: &dyn ObjectStore,
    local: &Path,
    key: &str,
) -> Result<Vec<String>> {
    fs.ensure_dir(&schema.paths.scratch_dir)?;
    let scratch = tempfile::Builder::new()
        .prefix("merge-")
        .tempdir_in(&schema.paths.scratch_dir)
        .with_context(|| format!("failed to create scratch in {}", schema.paths.scratch_dir.display()))?;

    let remote_archive = scratch.path().join("remote.tar.bz2");
    store.get(key, &remote_archive)?;
    let members = scratch.path().join("members");
    fs.unpack_archive_to_dir(&remote_archive, &members)?;

    let local_copy = scratch.path().join("local.tar.bz2");
    fs.copy_file(local, &local_copy)?;
    let local_dir = scratch.path().join("local");
    fs.unpack_archive_to_dir(&local_copy, &local_dir)?;

    let mut conflicts = Vec::new();
    for entry in fs.list_files_recursive(&local_dir)? {
        let rel = entry
            .path
            .strip_prefix(&local_dir)
            .with_context(|| format!("{} escaped scratch", entry.path.display()))?;
        let dest = members.join(rel);
        if fs.is_file(&dest) && fs.content_hash(&dest)? != fs.content_hash(&entry.path)? {
            conflicts.push(rel.display().to_string());
        }
        fs.rename(&entry.path, &dest)?;
    }

    fs.pack_dir_to_archive(&members, local, true)?;
    Ok(conflicts)
}

fn archive_one(
    schema: &Schema,
    fs: &dyn FileSystem,
    store: &dyn ObjectStore,
    item: &CompressedArchive,
    key: &str,
    log: &mut RunLog<'_>,
    outcome: &mut ArchiveOutcome,
) -> Result<ArchiveAction> {
    let local_md5 = fs.content_hash(&item.path)?;
    let action = match store.head(key)? {
        None => {
            store.put(&item.path, key, &local_md5)?;
            ArchiveAction::Uploaded
        }
        Some(remote_md5) if remote_md5 == local_md5 => ArchiveAction::AlreadyPresent,
        Some(_) => {
            let conflicts = merge_with_remote(schema, fs, store, &item.path, key)?;
            for member in &conflicts {
                log.warn(Warning {
                    code: "MEMBER_CONFLICT",
                    feed: &item.feed_id,
                    path: member,
                    retry: "none",
                    err: "remote member replaced by local member with different content",
                    ..Default::default()
                });
            }
            outcome.member_conflicts += conflicts.len();
            let merged_md5 = fs.content_hash(&item.path)?;
            store.put(&item.path, key, &merged_md5)?;
            ArchiveAction::Merged
        }
    };
    fs.remove_file(&item.path)?;
    Ok(action)
}

/// Ships compressed archives to the object store, merging on hash mismatch.
///
/// A local archive is deleted only after the remote copy is confirmed.
pub fn run_archive(
    schema: &Schema,
    fs: &dyn FileSystem,
    clock: &dyn Clock,
    store: &dyn ObjectStore,
    opts: &ArchiveOptions,
    log: &mut RunLog<'_>,
) -> Result<ArchiveOutcome> {
    let now = clock.now_secs();
    let mut outcome = ArchiveOutcome::default();
    let candidates = schema.list_compressed(fs, now)?;
    log.line(format!(
        "archive: {} candidate archive(s) for {}",
        candidates.len(),
        store.describe()
    ));

    for item in &candidates {
        if let Some(limit) = opts.limit
            && outcome.uploaded + outcome.failed >= limit
        {
            outcome.limit_reached = true;
            log.line(format!("archive: limit of {limit} reached; run again to continue"));
            break;
        }

        let key = schema.remote_key(
            &opts.global_prefix,
            &opts.local_prefix,
            item.hour_ts,
            &item.feed_id,
        )?;
        match archive_one(schema, fs, store, item, &key, log, &mut outcome) {
            Ok(action) => {
                outcome.uploaded += 1;
                match action {
                    ArchiveAction::Uploaded => outcome.fresh += 1,
                    ArchiveAction::AlreadyPresent => outcome.unchanged += 1,
                    ArchiveAction::Merged => outcome.merged += 1,
                }
                log.line(format!("archived {} -> {key} ({action:?})", item.path.display()));
            }
            Err(err) => {
                outcome.failed += 1;
                log.warn(Warning {
                    code: "ARCHIVE_FAILED",
                    feed: &item.feed_id,
                    path: &item.path.display().to_string(),
                    retry: "next_run",
                    err: &format!("{err:#}"),
                    ..Default::default()
                });
            }
        }
    }

    outcome.pruned_dirs = fs.prune_empty_subtrees(&schema.paths.compressed_dir, false)?;
    log.line(format!(
        "archive: {} uploaded ({} new, {} unchanged, {} merged), {} failed",
        outcome.uploaded, outcome.fresh, outcome.unchanged, outcome.merged, outcome.failed
    ));
    Ok(outcome)
}
