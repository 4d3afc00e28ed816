use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::blocks::ScopeViolation;
use crate::patch::PatchConflict;
use crate::path_policy::DenyReason;
use crate::privilege::PrivilegeDenial;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("io error during {op} ({path}): {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("caller identity is unavailable: {0}")]
    Identity(String),

    #[error("path denied ({reason}): {path}")]
    PathDenied { path: PathBuf, reason: DenyReason },

    #[error("operation is not permitted: {0}")]
    PrivilegeDenied(PrivilegeDenial),

    #[error("patch conflict: {0}")]
    PatchConflict(PatchConflict),

    #[error("patch rejected: {0}")]
    ScopeViolation(ScopeViolation),

    #[error("backup failed during {op} ({path}): {source}")]
    BackupIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("backup not found: {0}")]
    BackupNotFound(PathBuf),

    #[error("write failed during {op} ({path}): {source}")]
    WriteIo {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("content is too large ({size_bytes} bytes; max {max_bytes} bytes): {path}")]
    TooLarge {
        path: PathBuf,
        size_bytes: u64,
        max_bytes: u64,
    },

    #[error("invalid utf-8 in file: {0}")]
    InvalidUtf8(PathBuf),

    #[error("failed to parse patch: {0}")]
    Patch(String),

    #[error("malformed managed blocks: {0}")]
    ManagedBlock(String),
}

impl Error {
    pub const CODE_IO: &'static str = "io";
    pub const CODE_IO_PATH: &'static str = "io_path";
    pub const CODE_JSON: &'static str = "json";
    pub const CODE_INVALID_POLICY: &'static str = "invalid_policy";
    pub const CODE_INVALID_PATH: &'static str = "invalid_path";
    pub const CODE_IDENTITY: &'static str = "identity";
    pub const CODE_PATH_DENIED: &'static str = "path_denied";
    pub const CODE_PRIVILEGE_DENIED: &'static str = "privilege_denied";
    pub const CODE_PATCH_CONFLICT: &'static str = "patch_conflict";
    pub const CODE_SCOPE_VIOLATION: &'static str = "scope_violation";
    pub const CODE_BACKUP_IO: &'static str = "backup_io";
    pub const CODE_BACKUP_NOT_FOUND: &'static str = "backup_not_found";
    pub const CODE_WRITE_IO: &'static str = "write_io";
    pub const CODE_TOO_LARGE: &'static str = "too_large";
    pub const CODE_INVALID_UTF8: &'static str = "invalid_utf8";
    pub const CODE_PATCH: &'static str = "patch";
    pub const CODE_MANAGED_BLOCK: &'static str = "managed_block";

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => Self::CODE_IO,
            Self::IoPath { .. } => Self::CODE_IO_PATH,
            Self::Json(_) => Self::CODE_JSON,
            Self::InvalidPolicy(_) => Self::CODE_INVALID_POLICY,
            Self::InvalidPath(_) => Self::CODE_INVALID_PATH,
            Self::Identity(_) => Self::CODE_IDENTITY,
            Self::PathDenied { .. } => Self::CODE_PATH_DENIED,
            Self::PrivilegeDenied(_) => Self::CODE_PRIVILEGE_DENIED,
            Self::PatchConflict(_) => Self::CODE_PATCH_CONFLICT,
            Self::ScopeViolation(_) => Self::CODE_SCOPE_VIOLATION,
            Self::BackupIo { .. } => Self::CODE_BACKUP_IO,
            Self::BackupNotFound(_) => Self::CODE_BACKUP_NOT_FOUND,
            Self::WriteIo { .. } => Self::CODE_WRITE_IO,
            Self::TooLarge { .. } => Self::CODE_TOO_LARGE,
            Self::InvalidUtf8(_) => Self::CODE_INVALID_UTF8,
            Self::Patch(_) => Self::CODE_PATCH,
            Self::ManagedBlock(_) => Self::CODE_MANAGED_BLOCK,
        }
    }

    pub(crate) fn io_path(op: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn backup_io(
        op: &'static str,
        path: impl AsRef<Path>,
        source: std::io::Error,
    ) -> Self {
        Self::BackupIo {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn write_io(op: &'static str, path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::WriteIo {
            op,
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether this error is a policy decision rather than a transient fault.
    ///
    /// Policy errors are terminal; retrying the same request yields the same answer.
    pub fn is_policy_decision(&self) -> bool {
        matches!(
            self,
            Self::PathDenied { .. }
                | Self::PrivilegeDenied(_)
                | Self::ScopeViolation(_)
                | Self::TooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
