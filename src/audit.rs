//! Audit trail: one record per SafeFs operation, whatever its outcome.
//!
//! Sinks are best-effort. A sink failure is logged and never changes the result returned to
//! the caller.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOp {
    Read,
    Write,
    ApplyPatch,
    UpsertBlock,
    Revert,
}

impl AuditOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ApplyPatch => "apply_patch",
            Self::UpsertBlock => "upsert_block",
            Self::Revert => "revert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Applied,
    Read,
    Denied,
    Rejected,
    Conflict,
    Failed,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Read => "read",
            Self::Denied => "denied",
            Self::Rejected => "rejected",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub op: AuditOp,
    /// Canonical path when the policy resolved one, otherwise the requested path.
    pub path: PathBuf,
    pub uid: u32,
    pub require_confirmation: bool,
    /// The caller explicitly overrode the managed-block scope check.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub scope_override: bool,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_written: Option<u64>,
    /// Error code or denial reason, for non-applied outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRecord {
    pub fn new(op: AuditOp, path: impl Into<PathBuf>, uid: u32, outcome: AuditOutcome) -> Self {
        Self {
            at: Utc::now(),
            op,
            path: path.into(),
            uid,
            require_confirmation: false,
            scope_override: false,
            outcome,
            backup: None,
            bytes_written: None,
            detail: None,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<()>;

    /// File the sink writes to, if any. SafeFS refuses to mutate it.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// Emits each record as a structured `tracing` event on the `safefs::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        tracing::info!(
            target: "safefs::audit",
            op = record.op.as_str(),
            path = %record.path.display(),
            uid = record.uid,
            outcome = record.outcome.as_str(),
            require_confirmation = record.require_confirmation,
            scope_override = record.scope_override,
            backup = ?record.backup,
            bytes_written = record.bytes_written,
            detail = record.detail.as_deref(),
            "safefs operation"
        );
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|err| Error::io_path("create_dir", parent, err))?;
        }
        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(path)
            .map_err(|err| Error::io_path("open", path, err))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = lock_recover(&self.file);
        file.write_all(&line)
            .map_err(|err| Error::io_path("append", &self.path, err))
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Keeps records in memory. Useful for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        lock_recover(&self.records).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        lock_recover(&self.records).push(record.clone());
        Ok(())
    }
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("audit sink lock was poisoned; recovering");
        poisoned.into_inner()
    })
}
