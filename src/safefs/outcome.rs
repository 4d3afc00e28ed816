use std::path::PathBuf;

use serde::Serialize;

use crate::backup::BackupOutcome;
use crate::blocks::ScopeViolation;
use crate::error::{Error, Result};
use crate::patch::{PatchConflict, PatchRequest};
use crate::path_policy::DenyReason;
use crate::privilege::PrivilegeDenial;

/// How the managed-block scope check treats a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeCheck {
    /// Patches against files with managed blocks may only touch block bodies or append.
    #[default]
    Enforce,
    /// The user explicitly confirmed an edit outside managed regions.
    UserOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOptions {
    /// The change was shown to and approved by a human before this call.
    pub require_confirmation: bool,
    pub scope: ScopeCheck,
}

impl WriteOptions {
    /// An automated change with no human in the loop.
    pub fn automated() -> Self {
        Self::default()
    }

    /// A change the user approved.
    pub fn confirmed() -> Self {
        Self {
            require_confirmation: true,
            scope: ScopeCheck::Enforce,
        }
    }

    /// Approve an edit outside managed regions as well.
    pub fn with_scope_override(mut self) -> Self {
        self.scope = ScopeCheck::UserOverride;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Applied {
    /// Canonical target.
    pub path: PathBuf,
    pub backup: BackupOutcome,
    pub bytes_written: u64,
}

/// Why a mutation was refused before anything was touched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Rejection {
    PathDenied {
        path: PathBuf,
        reason: DenyReason,
        detail: String,
    },
    PrivilegeDenied {
        reason: PrivilegeDenial,
    },
    ScopeViolation {
        path: PathBuf,
        violation: ScopeViolation,
    },
    TooLarge {
        path: PathBuf,
        size_bytes: u64,
        max_bytes: u64,
    },
}

impl Rejection {
    /// Plain-language explanation for the user.
    pub fn explain(&self) -> String {
        match self {
            Self::PathDenied { reason, detail, .. } => format!("{}: {detail}", reason.explain()),
            Self::PrivilegeDenied { reason } => reason.to_string(),
            Self::ScopeViolation { violation, .. } => format!(
                "{violation}; confirm the edit explicitly to change lines outside managed blocks"
            ),
            Self::TooLarge {
                size_bytes,
                max_bytes,
                ..
            } => format!("content is too large ({size_bytes} bytes; max {max_bytes} bytes)"),
        }
    }

    fn into_error(self) -> Error {
        match self {
            Self::PathDenied { path, reason, .. } => Error::PathDenied { path, reason },
            Self::PrivilegeDenied { reason } => Error::PrivilegeDenied(reason),
            Self::ScopeViolation { violation, .. } => Error::ScopeViolation(violation),
            Self::TooLarge {
                path,
                size_bytes,
                max_bytes,
            } => Error::TooLarge {
                path,
                size_bytes,
                max_bytes,
            },
        }
    }
}

/// Outcome of a mutation. Exactly one variant; nothing was touched unless it is `Applied`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum WriteResult {
    Applied(Applied),
    Rejected(Rejection),
    Conflict(PatchConflict),
}

impl WriteResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Convert non-applied outcomes into the matching [`Error`].
    pub fn into_applied(self) -> Result<Applied> {
        match self {
            Self::Applied(applied) => Ok(applied),
            Self::Rejected(rejection) => Err(rejection.into_error()),
            Self::Conflict(conflict) => Err(Error::PatchConflict(conflict)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadContent {
    pub path: PathBuf,
    pub content: String,
    pub truncated: bool,
    pub bytes_read: u64,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ReadResult {
    Content(ReadContent),
    Denied { reason: DenyReason, detail: String },
    TooLarge { requested: u64, max_bytes: u64 },
}

impl ReadResult {
    pub fn content(&self) -> Option<&ReadContent> {
        match self {
            Self::Content(content) => Some(content),
            _ => None,
        }
    }
}

/// A computed but uncommitted patch. Holds no lock; dropping it cancels.
#[derive(Debug, Clone, Serialize)]
pub struct Proposal {
    /// Path as the caller named it; re-evaluated on commit.
    pub requested: PathBuf,
    pub path: PathBuf,
    pub preview: String,
    pub original_bytes: u64,
    pub updated_bytes: u64,
    #[serde(skip)]
    pub(crate) request: PatchRequest,
}

impl Proposal {
    pub fn request(&self) -> &PatchRequest {
        &self.request
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ProposeResult {
    Proposal(Proposal),
    Rejected(Rejection),
    Conflict(PatchConflict),
}
