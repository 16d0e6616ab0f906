use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Opened,
    Closed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HandleLogEntry {
    pub timestamp: String,
    pub handle_id: Uuid,
    pub path: String,
    pub status: HandleStatus,
    pub bytes_served: u64,
    pub seeks: u64,
    pub error: Option<String>,
}

impl HandleLogEntry {
    pub fn new(handle_id: Uuid, path: &str, status: HandleStatus) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            handle_id,
            path: path.to_string(),
            status,
            bytes_served: 0,
            seeks: 0,
            error: None,
        }
    }
}

/// Append-only JSONL log of opened and closed handles
pub struct AccessLog {
    log_file_path: PathBuf,
    // One writer at a time so concurrent handles never interleave lines
    write_lock: Mutex<()>,
}

impl AccessLog {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        AccessLog {
            log_file_path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn add_entry(&self, entry: &HandleLogEntry) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.log_file_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .context("Failed to open access log file")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<HandleLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .context("Failed to open access log file for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: HandleLogEntry = serde_json::from_str(&line)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
