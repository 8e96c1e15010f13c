//! Per-run log file with changed-stamp prefixes.
//!
//! One `RunLog` is built per stage run and passed down explicitly. A line
//! gets a `[YYYY/MM/DD HH:MM:SS]` prefix only when the stamp differs from the
//! previous line; otherwise it is padded to the same width.

use crate::pipeline::clock::Clock;
use crate::pipeline::timefmt::log_stamp;
use crate::pipeline::warn::{self, Warning};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub struct RunLog<'a> {
    clock: &'a dyn Clock,
    task: String,
    path: PathBuf,
    file: Option<fs::File>,
    quiet: bool,
    last_stamp: Option<String>,
    warnings: usize,
}

impl<'a> RunLog<'a> {
    pub fn create(path: &Path, clock: &'a dyn Clock, task: &str, quiet: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open run log {}", path.display()))?;
        Ok(Self {
            clock,
            task: task.to_string(),
            path: path.to_path_buf(),
            file: Some(file),
            quiet,
            last_stamp: None,
            warnings: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }

    fn prefix(&mut self) -> String {
        let stamp = format!("[{}]", log_stamp(self.clock.now()));
        if self.last_stamp.as_deref() == Some(stamp.as_str()) {
            " ".repeat(stamp.len())
        } else {
            self.last_stamp = Some(stamp.clone());
            stamp
        }
    }

    pub fn line(&mut self, message: impl AsRef<str>) {
        let text = format!("{} {}", self.prefix(), message.as_ref());
        if !self.quiet {
            println!("{text}");
        }
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(err) = writeln!(file, "{text}") {
            eprintln!("rtagg: run log {} unwritable: {err}", self.path.display());
            self.file = None;
        }
    }

    /// Logs a per-item failure and emits the matching `RTAGG_WARN` line.
    pub fn warn(&mut self, w: Warning<'_>) {
        self.warnings += 1;
        self.line(format!("warning [{}] {} {}", w.code, w.path, w.err));
        if !self.quiet {
            warn::emit(&Warning {
                stage: &self.task,
                ..w
            });
        }
    }

    pub fn summary<T: Serialize>(&mut self, status: &str, outcome: &T) -> Result<()> {
        let mut body = serde_json::to_value(outcome)?;
        if let Some(map) = body.as_object_mut() {
            map.insert("status".into(), status.into());
        }
        self.line(format!("summary {}", serde_json::to_string(&body)?));
        Ok(())
    }
}
