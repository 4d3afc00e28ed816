//! `safefs` is the mediated write layer between an AI assistant and the user's files.
//!
//! Every mutation passes a privilege gate (root is read-only), a home-scoped allowlist with
//! symlink resolution, an optional managed-block scope check, and a per-path lock. The prior
//! content is backed up before an atomic replace, and backups are thinned by age afterwards.
//! [`SafeFs`] is the entry point; the pieces it composes are public for embedding and tests.

pub mod audit;
pub mod backup;
pub mod blocks;
mod error;
pub mod identity;
mod io;
pub mod patch;
pub mod path_policy;
#[path = "path_utils.rs"]
mod path_utils_impl;
pub mod path_utils {
    pub use super::path_utils_impl::{is_descendant_or_self, strip_prefix_lexical};

    pub(crate) use super::path_utils_impl::{
        build_glob, expand_tilde, mirrored_relative, normalize_path_lexical, to_slash,
    };
}
pub mod policy;
#[cfg(feature = "policy-io")]
pub mod policy_io;
pub mod privilege;
pub mod safefs;
pub mod session;

pub use error::{Error, Result};

pub use audit::{AuditOp, AuditOutcome, AuditRecord, AuditSink, JsonlAuditSink, MemoryAuditSink};
pub use backup::{Backup, BackupOutcome, BackupReason, BackupStore};
pub use blocks::{ManagedBlock, ManagedBlockEditor, ScopeDecision, ScopeViolation};
pub use identity::Identity;
pub use patch::{ConflictKind, PatchConflict, PatchEngine, PatchRequest, UnifiedDiff};
pub use path_policy::{DenyReason, GrantSource, PathDecision, PathPolicy};
pub use policy::{AccessMode, AllowRule, Limits, RetentionPolicy, SafeFsPolicy};
pub use privilege::{GateDecision, PrivilegeDenial, PrivilegeGate};
pub use safefs::{
    Applied, Proposal, ProposeResult, ReadContent, ReadResult, Rejection, SafeFs, ScopeCheck,
    WriteOptions, WriteResult,
};
pub use session::Session;
