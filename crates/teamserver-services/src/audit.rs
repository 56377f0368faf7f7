//! Append-only audit trail of session activity.
//!
//! The core only ever appends. What happens to the records (a file, a
//! database owned by another subsystem, nothing) is up to the sink.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;

use teamserver_core::wire::{unix_millis, DisconnectReason};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditRecord {
    SessionCreated {
        session_id: String,
        address: String,
        timestamp: u64,
    },
    SessionCheckin {
        session_id: String,
        hostname: String,
        username: String,
        os: String,
        timestamp: u64,
    },
    SessionClosed {
        session_id: String,
        reason: DisconnectReason,
        timestamp: u64,
    },
}

impl AuditRecord {
    pub fn created(session_id: &str, address: &str) -> Self {
        Self::SessionCreated {
            session_id: session_id.into(),
            address: address.into(),
            timestamp: unix_millis(),
        }
    }

    pub fn closed(session_id: &str, reason: DisconnectReason) -> Self {
        Self::SessionClosed {
            session_id: session_id.into(),
            reason,
            timestamp: unix_millis(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to open audit log {0}: {1}")]
    Open(PathBuf, std::io::Error),
    #[error("failed to append audit record: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("audit log lock poisoned")]
    Poisoned,
}

pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// Append and log on failure. Audit problems never reach the caller.
pub fn record(sink: &dyn AuditSink, record: AuditRecord) {
    if let Err(e) = sink.append(&record) {
        tracing::warn!(error = %e, "audit append failed");
    }
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn append(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Ok(())
    }
}

/// One JSON object per line, flushed per record.
pub struct JsonLinesAudit {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesAudit {
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AuditError::Open(path.to_path_buf(), e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| AuditError::Open(path.to_path_buf(), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonLinesAudit {
    fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().map_err(|_| AuditError::Poisoned)?;
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}
