//! Operator log: bounded in-memory ring plus an append-only file
//!
//! Every entry is also mirrored to the console through `tracing`.

use crate::error::Result;
use chrono::Local;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Default log file name
pub const LOG_FILE: &str = "harbormaster.log";

/// Entries kept in memory
pub const MAX_LOG_LINES: usize = 200;

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warning => write!(f, "WARNING"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Thread-safe log sink
pub struct Logbook {
    /// Backing file (None = memory only)
    path: Option<PathBuf>,
    /// Ring buffer capacity
    capacity: usize,
    /// Recent entries, oldest first
    entries: Mutex<VecDeque<String>>,
    /// Serializes file appends; never held together with `entries`
    file_lock: Mutex<()>,
}

impl Logbook {
    /// Sink appending to `path`
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: Some(path.into()),
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            file_lock: Mutex::new(()),
        }
    }

    /// Sink without a file
    #[cfg(test)]
    pub fn memory(capacity: usize) -> Self {
        Self {
            path: None,
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            file_lock: Mutex::new(()),
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an entry
    ///
    /// The ring update always succeeds; file errors are swallowed.
    pub fn append(&self, message: &str, level: LogLevel) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let entry = format!("[{}] [{}] {}", timestamp, level, message);

        {
            let mut entries = self.entries.lock();
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        if let Some(path) = &self.path {
            // One write per line so concurrent appends never interleave
            let line = format!("{}\n", entry);
            let _guard = self.file_lock.lock();
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut file| file.write_all(line.as_bytes()));
            if let Err(e) = written {
                tracing::debug!(path = %path.display(), error = %e, "log file append failed");
            }
        }

        match level {
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
    }

    pub fn info(&self, message: &str) {
        self.append(message, LogLevel::Info);
    }

    pub fn warn(&self, message: &str) {
        self.append(message, LogLevel::Warning);
    }

    pub fn error(&self, message: &str) {
        self.append(message, LogLevel::Error);
    }

    /// Last `count` entries in chronological order
    pub fn recent(&self, count: usize) -> Vec<String> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(count);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Number of entries held in memory
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Last `count` lines of the backing file, including earlier runs
    pub fn tail_file(&self, count: usize) -> Result<Vec<String>> {
        let Some(path) = &self.path else {
            return Ok(self.recent(count));
        };
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<&str> = content.lines().collect();
        let skip = lines.len().saturating_sub(count);
        Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
    }
}
