use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Local, LocalResult, TimeZone};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Warn,
    Error,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ActivityLogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl ActivityLogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        ActivityLogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }
}

/// Append-only JSON-lines record of warnings and failures.
#[derive(Clone, Debug)]
pub struct ActivityLog {
    path: PathBuf,
}

impl ActivityLog {
    pub fn new(path: PathBuf) -> Self {
        ActivityLog { path }
    }

    pub fn warn(&self, message: impl Into<String>) -> Result<()> {
        self.append(&ActivityLogEntry::new(LogLevel::Warn, message))
    }

    pub fn error(&self, message: impl Into<String>) -> Result<()> {
        self.append(&ActivityLogEntry::new(LogLevel::Error, message))
    }

    pub fn load(&self) -> Result<Vec<ActivityLogEntry>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(stored) = serde_json::from_str::<StoredActivityLogEntry>(&line) {
                entries.push(stored.into_entry());
            }
        }
        Ok(entries)
    }

    /// The last `limit` entries, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<ActivityLogEntry>> {
        let mut entries = self.load()?;
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
        Ok(entries)
    }

    fn append(&self, entry: &ActivityLogEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        serde_json::to_writer(&mut file, &StoredActivityLogEntry::from(entry))?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredActivityLogEntry {
    timestamp_ms: i64,
    level: LogLevel,
    message: String,
}

impl StoredActivityLogEntry {
    fn into_entry(self) -> ActivityLogEntry {
        let timestamp = match Local.timestamp_millis_opt(self.timestamp_ms) {
            LocalResult::Single(dt) => dt,
            _ => Local::now(),
        };
        ActivityLogEntry {
            timestamp,
            level: self.level,
            message: self.message,
        }
    }
}

impl From<&ActivityLogEntry> for StoredActivityLogEntry {
    fn from(entry: &ActivityLogEntry) -> Self {
        StoredActivityLogEntry {
            timestamp_ms: entry.timestamp.timestamp_millis(),
            level: entry.level,
            message: entry.message.clone(),
        }
    }
}
