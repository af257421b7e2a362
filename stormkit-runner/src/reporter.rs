//! Build log reporter.
//!
//! Collects the deployment log: one line per executed step, raw command
//! output appended to the log file. The file is what users see as their
//! deployment logs.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone)]
pub struct Reporter {
    inner: Arc<Mutex<Inner>>,
    log_path: PathBuf,
}

struct Inner {
    file: File,
    steps: Vec<String>,
}

impl Reporter {
    pub fn new(log_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let log_path = log_path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                file,
                steps: Vec::new(),
            })),
            log_path,
        })
    }

    /// Record an executed step, e.g. `npm ci --no-audit --include=dev`.
    pub fn add_step(&self, step: &str) {
        tracing::info!(step, "build step");
        let mut inner = self.inner.lock();
        inner.steps.push(step.to_string());
        let _ = writeln!(inner.file, "$ {step}");
    }

    /// Append a plain line to the log.
    pub fn add_line(&self, line: &str) {
        let mut inner = self.inner.lock();
        let _ = writeln!(inner.file, "{line}");
    }

    /// Clone of the log file handle, used as stdout/stderr for spawned
    /// commands.
    pub fn file(&self) -> std::io::Result<File> {
        self.inner.lock().file.try_clone()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Steps recorded so far, in execution order.
    pub fn steps(&self) -> Vec<String> {
        self.inner.lock().steps.clone()
    }
}
