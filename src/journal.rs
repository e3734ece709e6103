//! JSONL record of every file the receiver accepted or gave up on.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransferEntry {
    pub timestamp: String,
    pub session_id: String,
    pub peer: String,
    pub filename: Option<String>,
    pub destination: Option<PathBuf>,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub error: Option<String>,
}

impl TransferEntry {
    pub fn completed(session_id: &str, peer: &str, filename: &str, dst: &Path, bytes: u64) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            peer: peer.to_string(),
            filename: Some(filename.to_string()),
            destination: Some(dst.to_path_buf()),
            status: TransferStatus::Completed,
            bytes_transferred: bytes,
            error: None,
        }
    }

    pub fn failed(session_id: &str, peer: &str, error: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            session_id: session_id.to_string(),
            peer: peer.to_string(),
            filename: None,
            destination: None,
            status: TransferStatus::Failed,
            bytes_transferred: 0,
            error: Some(error.to_string()),
        }
    }

    /// Attach the file a failure interrupted and how much of it arrived.
    pub fn with_file(mut self, filename: &str, dst: &Path, bytes: u64) -> Self {
        self.filename = Some(filename.to_string());
        self.destination = Some(dst.to_path_buf());
        self.bytes_transferred = bytes;
        self
    }
}

pub struct TransferJournal {
    path: PathBuf,
    // serialises appends from the receive loop and any external reader
    lock: Mutex<()>,
}

impl TransferJournal {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn add_entry(&self, entry: &TransferEntry) -> Result<()> {
        let _guard = self.lock.lock();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open transfer journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_entries(&self) -> Result<Vec<TransferEntry>> {
        let _guard = self.lock.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).context("Failed to open transfer journal for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = TransferJournal::new(dir.path().join("journal.jsonl"));
        assert!(journal.read_entries().unwrap().is_empty());

        let dst = dir.path().join("report.txt");
        journal
            .add_entry(&TransferEntry::completed("s1", "127.0.0.1:5000", "report.txt", &dst, 42))
            .unwrap();
        journal
            .add_entry(&TransferEntry::failed("s2", "127.0.0.1:5001", "unexpected end of stream"))
            .unwrap();
        let cut = dir.path().join("cut.bin");
        journal
            .add_entry(
                &TransferEntry::failed("s3", "127.0.0.1:5002", "connection ended").with_file(
                    "cut.bin", &cut, 10,
                ),
            )
            .unwrap();

        let entries = journal.read_entries().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].status, TransferStatus::Completed);
        assert_eq!(entries[0].filename.as_deref(), Some("report.txt"));
        assert_eq!(entries[0].bytes_transferred, 42);
        assert_eq!(entries[1].status, TransferStatus::Failed);
        assert_eq!(entries[1].error.as_deref(), Some("unexpected end of stream"));
        assert_eq!(entries[1].filename, None);
        assert_eq!(entries[2].status, TransferStatus::Failed);
        assert_eq!(entries[2].filename.as_deref(), Some("cut.bin"));
        assert_eq!(entries[2].destination.as_deref(), Some(cut.as_path()));
        assert_eq!(entries[2].bytes_transferred, 10);
    }
}
