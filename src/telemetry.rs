//! Failure records.
//!
//! Every failed `/query` produces one newline-delimited JSON record in the
//! optional `LOG_FILE`, and a matching `tracing` event. The file is rotated
//! by size with `keep` numbered backups; the newest backup can be gzipped.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::RotationConfig;

/// Size-based rotating writer. Backups are named `<path>.1` .. `<path>.N`
/// (extension replaced), newest first.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(path: &str, rotation: &RotationConfig) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes: rotation.max_bytes,
            keep: rotation.keep,
            compress: rotation.compress,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.max_bytes {
            if self.exceeds_limit(limit) {
                self.rotate_backups();
                self.compress_latest_backup();
                self.reopen_current()?;
            }
        }
        writeln!(self.file, "{}", line)
    }

    fn exceeds_limit(&self, limit: u64) -> bool {
        self.path
            .metadata()
            .map(|meta| meta.len() >= limit)
            .unwrap_or(false)
    }

    fn rotate_backups(&self) {
        if self.keep == 0 {
            return;
        }
        for idx in (1..=self.keep).rev() {
            let old = if idx == 1 {
                self.path.clone()
            } else {
                self.path.with_extension(format!("{}", idx - 1))
            };
            if old.exists() {
                let new = self.path.with_extension(format!("{}", idx));
                let _ = fs::rename(&old, &new);
            }
            if self.compress && idx > 1 {
                let old_gz = self.path.with_extension(format!("{}.gz", idx - 1));
                if old_gz.exists() {
                    let new_gz = self.path.with_extension(format!("{}.gz", idx));
                    let _ = fs::rename(&old_gz, &new_gz);
                }
            }
        }
    }

    fn compress_latest_backup(&self) {
        if !self.compress || self.keep == 0 {
            return;
        }
        let rotated = self.path.with_extension("1");
        let Ok(data) = fs::read(&rotated) else {
            return;
        };
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        if gz.write_all(&data).is_err() {
            return;
        }
        if let Ok(buf) = gz.finish() {
            if fs::write(rotated.with_extension("1.gz"), buf).is_ok() {
                let _ = fs::remove_file(&rotated);
            }
        }
    }

    fn reopen_current(&mut self) -> std::io::Result<()> {
        self.file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }
}

/// Fields mirrored to the `tracing` event for a failure.
pub struct FailureLogFields<'a> {
    pub kind: &'a str,
    pub status: u16,
    pub query: Option<&'a str>,
    pub error: &'a str,
    pub chain: &'a [String],
}

#[derive(Clone)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(writer: Option<RotatingWriter>) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open `log_file` if configured. Failure to open disables the file
    /// sink but never prevents startup.
    pub fn from_config(log_file: Option<&str>, rotation: &RotationConfig) -> Self {
        let writer = match log_file {
            Some(path) => match RotatingWriter::open(path, rotation) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to open LOG_FILE; failure records disabled");
                    None
                }
            },
            None => None,
        };
        Self::new(writer)
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Log the failure and append its record. The file write runs on the
    /// blocking pool since rotation may gzip a whole backup.
    pub async fn emit_failure(&self, record: &serde_json::Value, log: &FailureLogFields<'_>) {
        Self::trace_failure(log);
        if self.writer.is_none() {
            return;
        }
        let sink = self.clone();
        let line = record.to_string();
        if let Err(e) = tokio::task::spawn_blocking(move || sink.write_record(&line)).await {
            tracing::warn!(error = %e, "Failure record task did not complete");
            self.write_errors_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Same as [`emit_failure`](Self::emit_failure) but writes on the
    /// calling thread. Used where no async context is available.
    pub fn emit_failure_blocking(&self, record: &serde_json::Value, log: &FailureLogFields<'_>) {
        Self::trace_failure(log);
        if self.writer.is_some() {
            self.write_record(&record.to_string());
        }
    }

    fn trace_failure(log: &FailureLogFields<'_>) {
        tracing::error!(
            target: "wordroot::failure",
            kind = log.kind,
            status = log.status,
            query = ?log.query,
            error = %log.error,
            chain = ?log.chain,
            "query failed"
        );
    }

    fn write_record(&self, line: &str) {
        let Some(writer) = self.writer.as_ref() else {
            return;
        };
        let mut guard = match writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Failure record writer lock poisoned; recovering");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                poisoned.into_inner()
            }
        };
        match guard.write_line(line) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to write failure record");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }
}
