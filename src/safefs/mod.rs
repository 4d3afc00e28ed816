//! The public facade: every read and mutation an agent performs goes through [`SafeFs`].
//!
//! A mutation runs, in order: privilege gate, path policy, per-path lock, a second gate and
//! policy pass, snapshot of the current content, new-content computation (patch engine or
//! managed-block editor), backup, atomic replace, unlock, background thinning. Any refusal
//! before the backup leaves the filesystem untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;

use crate::audit::{AuditOp, AuditOutcome, AuditRecord, AuditSink, TracingAuditSink};
use crate::backup::{Backup, BackupOutcome, BackupReason, BackupStore};
use crate::blocks::{ManagedBlock, ManagedBlockEditor, ScopeDecision};
use crate::error::{Error, Result};
use crate::io;
use crate::patch::{PatchConflict, PatchEngine, PatchRequest};
use crate::path_policy::{DenyReason, PathDecision, PathPolicy};
use crate::path_utils;
use crate::policy::{AccessMode, POLICY_FILE_NAME, SafeFsPolicy, config_home};
use crate::privilege::{GateDecision, PrivilegeGate};
use crate::session::Session;

mod lock;
mod outcome;

pub use outcome::{
    Applied, Proposal, ProposeResult, ReadContent, ReadResult, Rejection, ScopeCheck,
    WriteOptions, WriteResult,
};

use lock::PathLocks;

/// The new content a mutation wants, before it is computed against the current file.
enum Mutation<'a> {
    Replace(&'a str),
    Patch(&'a PatchRequest),
    UpsertBlock { name: &'a str, body: &'a str },
    Restore(&'a Backup),
}

impl Mutation<'_> {
    fn op(&self) -> AuditOp {
        match self {
            Self::Replace(_) => AuditOp::Write,
            Self::Patch(_) => AuditOp::ApplyPatch,
            Self::UpsertBlock { .. } => AuditOp::UpsertBlock,
            Self::Restore(_) => AuditOp::Revert,
        }
    }

    fn backup_reason(&self) -> BackupReason {
        match self {
            Self::Replace(_) => BackupReason::PreWrite,
            Self::Patch(_) | Self::UpsertBlock { .. } => BackupReason::PrePatch,
            Self::Restore(_) => BackupReason::PreRevert,
        }
    }
}

/// Either a gate/policy refusal or the canonical target it allowed.
enum Gated {
    Target(PathBuf),
    Refused(Rejection),
}

pub struct SafeFs {
    policy: SafeFsPolicy,
    path_policy: PathPolicy,
    engine: PatchEngine,
    blocks: ManagedBlockEditor,
    backups: Arc<BackupStore>,
    locks: PathLocks,
    audit: Arc<dyn AuditSink>,
    /// SafeFS's own state. Writes to these paths or below them are refused.
    protected: Vec<PathBuf>,
}

impl std::fmt::Debug for SafeFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeFs")
            .field("policy", &self.policy)
            .field("backup_root", &self.backups.root())
            .field("protected", &self.protected)
            .finish_non_exhaustive()
    }
}

impl SafeFs {
    /// Validate `policy` and build a facade with a tracing audit sink.
    ///
    /// The backup root and the default policy file are protected from writes.
    pub fn new(policy: SafeFsPolicy) -> Result<Self> {
        policy.validate()?;
        let backups = BackupStore::from_policy(&policy)?;
        let mut protected = vec![backups.root().to_path_buf()];
        if let Ok(config_home) = config_home() {
            protected.push(config_home.join(POLICY_FILE_NAME));
        }
        Ok(Self {
            path_policy: PathPolicy::new(&policy.allow)?,
            engine: PatchEngine::new(&policy.limits),
            blocks: ManagedBlockEditor::new(&policy.blocks),
            backups: Arc::new(backups),
            locks: PathLocks::default(),
            audit: Arc::new(TracingAuditSink),
            protected,
            policy,
        })
    }

    /// Replace the audit sink. A file-backed sink's location becomes protected.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        if let Some(location) = sink.location() {
            self.protected.push(location.to_path_buf());
        }
        self.audit = sink;
        self
    }

    /// Refuse writes to `path` (and below it), e.g. a policy file loaded from a custom location.
    pub fn with_protected_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.protected.push(path.into());
        self
    }

    /// Whether a write to `canonical` would touch SafeFS's own state.
    pub fn is_protected(&self, canonical: &Path) -> bool {
        self.protected.iter().any(|protected| {
            path_utils::is_descendant_or_self(canonical, &resolve_existing(protected))
        })
    }

    pub fn policy(&self) -> &SafeFsPolicy {
        &self.policy
    }

    pub fn backup_store(&self) -> &BackupStore {
        &self.backups
    }

    pub fn block_editor(&self) -> &ManagedBlockEditor {
        &self.blocks
    }

    /// Evaluate `path` without touching it.
    pub fn evaluate(&self, session: &Session, path: &Path) -> PathDecision {
        self.path_policy.evaluate(path, session)
    }

    /// Parse unified-diff text, enforcing the patch input limit.
    pub fn parse_patch(&self, text: &str) -> Result<PatchRequest> {
        let max_bytes = self.policy.limits.effective_max_patch_bytes();
        let size_bytes = u64::try_from(text.len()).unwrap_or(u64::MAX);
        if size_bytes > max_bytes {
            return Err(Error::TooLarge {
                path: PathBuf::from("<patch>"),
                size_bytes,
                max_bytes,
            });
        }
        PatchRequest::parse_diff(text)
    }

    /// Read up to `max_bytes` of `path`, truncating at a UTF-8 boundary.
    ///
    /// A `max_bytes` above the policy's read limit is refused as `TooLarge`.
    pub fn read(&self, session: &Session, path: &Path, max_bytes: u64) -> Result<ReadResult> {
        let result = self.read_inner(session, path, max_bytes);
        let mut record = AuditRecord::new(
            AuditOp::Read,
            path,
            session.identity().uid(),
            AuditOutcome::Failed,
        );
        match &result {
            Ok(ReadResult::Content(content)) => {
                record.path = content.path.clone();
                record.outcome = AuditOutcome::Read;
            }
            Ok(ReadResult::Denied { reason, .. }) => {
                record.outcome = AuditOutcome::Denied;
                record.detail = Some(reason.as_str().to_string());
            }
            Ok(ReadResult::TooLarge { .. }) => {
                record.outcome = AuditOutcome::Rejected;
                record.detail = Some(Error::CODE_TOO_LARGE.to_string());
            }
            Err(err) => record.detail = Some(err.code().to_string()),
        }
        self.emit(&record);
        result
    }

    fn read_inner(&self, session: &Session, path: &Path, max_bytes: u64) -> Result<ReadResult> {
        let limit = self.policy.limits.max_read_bytes;
        if max_bytes > limit {
            return Ok(ReadResult::TooLarge {
                requested: max_bytes,
                max_bytes: limit,
            });
        }
        let decision = self
            .path_policy
            .evaluate(path, session)
            .require(AccessMode::Read);
        let canonical = match decision {
            PathDecision::Allowed { canonical, .. } => canonical,
            PathDecision::Denied { reason, detail } => {
                return Ok(ReadResult::Denied { reason, detail });
            }
        };

        let (bytes, size_bytes) = io::read_prefix(&canonical, max_bytes)?;
        let bytes_read = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let truncated = bytes_read < size_bytes;
        let content = match String::from_utf8(bytes) {
            Ok(content) => content,
            // A multi-byte character cut by the limit: back off to the last full character.
            Err(err) if truncated && err.utf8_error().error_len().is_none() => {
                let valid = err.utf8_error().valid_up_to();
                let mut bytes = err.into_bytes();
                bytes.truncate(valid);
                String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8(canonical.clone()))?
            }
            Err(_) => return Err(Error::InvalidUtf8(canonical)),
        };
        Ok(ReadResult::Content(ReadContent {
            path: canonical,
            bytes_read: u64::try_from(content.len()).unwrap_or(u64::MAX),
            content,
            truncated,
            size_bytes,
        }))
    }

    /// Replace the whole content of `path`.
    pub fn write(
        &self,
        session: &Session,
        path: &Path,
        content: &str,
        options: WriteOptions,
    ) -> Result<WriteResult> {
        self.mutate(session, path, Mutation::Replace(content), options)
    }

    /// Apply `request` to the current content of `path`.
    ///
    /// A missing file is patched as empty content. When the file holds managed blocks and the
    /// scope check is enforced, the patch must stay inside block bodies or append at the end.
    pub fn apply_patch(
        &self,
        session: &Session,
        path: &Path,
        request: &PatchRequest,
        options: WriteOptions,
    ) -> Result<WriteResult> {
        self.mutate(session, path, Mutation::Patch(request), options)
    }

    /// Compute what `apply_patch` would do, without locking or mutating anything.
    pub fn propose_patch(
        &self,
        session: &Session,
        path: &Path,
        request: &PatchRequest,
    ) -> Result<ProposeResult> {
        let canonical = match self.gate(session, path) {
            Gated::Target(canonical) => canonical,
            Gated::Refused(rejection) => return Ok(ProposeResult::Rejected(rejection)),
        };
        let snapshot = match self.snapshot(&canonical) {
            Ok(snapshot) => snapshot,
            Err(err) => return refusal(err, &canonical).map(ProposeResult::from),
        };
        let original = current_text(&canonical, snapshot.as_ref())?;
        let updated = match self.compute_patch(&canonical, original, request, ScopeCheck::Enforce)
        {
            Ok(updated) => updated,
            Err(err) => return refusal(err, &canonical).map(ProposeResult::from),
        };
        Ok(ProposeResult::Proposal(Proposal {
            requested: path.to_path_buf(),
            preview: PatchEngine::preview(original, &updated),
            original_bytes: u64::try_from(original.len()).unwrap_or(u64::MAX),
            updated_bytes: u64::try_from(updated.len()).unwrap_or(u64::MAX),
            path: canonical,
            request: request.clone(),
        }))
    }

    /// Apply a proposal the user approved. Hunks are re-located against the content current at
    /// commit time, so drift since the proposal surfaces as a conflict.
    pub fn commit_proposal(
        &self,
        session: &Session,
        proposal: &Proposal,
        options: WriteOptions,
    ) -> Result<WriteResult> {
        self.apply_patch(session, &proposal.requested, &proposal.request, options)
    }

    /// Replace or append managed block `name` in `path`.
    pub fn upsert_block(
        &self,
        session: &Session,
        path: &Path,
        name: &str,
        body: &str,
        options: WriteOptions,
    ) -> Result<WriteResult> {
        self.mutate(session, path, Mutation::UpsertBlock { name, body }, options)
    }

    /// Restore `backup` into `path`. The content being replaced is backed up first.
    pub fn revert(
        &self,
        session: &Session,
        path: &Path,
        backup: &Backup,
        options: WriteOptions,
    ) -> Result<WriteResult> {
        self.mutate(session, path, Mutation::Restore(backup), options)
    }

    /// Backups of `path`, newest first. Requires read access to the path.
    pub fn backups(&self, session: &Session, path: &Path) -> Result<Vec<Backup>> {
        let canonical = self.require_read(session, path)?;
        self.backups.list(&canonical)
    }

    /// Apply retention to the backups of `path` now.
    pub fn thin_backups(&self, session: &Session, path: &Path) -> Result<Vec<Backup>> {
        let canonical = self.require_read(session, path)?;
        self.backups.thin(&canonical)
    }

    /// Managed blocks in `path`. Requires read access to the path.
    pub fn blocks(&self, session: &Session, path: &Path) -> Result<Vec<ManagedBlock>> {
        let canonical = self.require_read(session, path)?;
        let snapshot = self.snapshot(&canonical)?;
        self.blocks
            .parse_blocks(current_text(&canonical, snapshot.as_ref())?)
    }

    fn require_read(&self, session: &Session, path: &Path) -> Result<PathBuf> {
        match self.path_policy.evaluate(path, session).require(AccessMode::Read) {
            PathDecision::Allowed { canonical, .. } => Ok(canonical),
            PathDecision::Denied { reason, .. } => Err(Error::PathDenied {
                path: path.to_path_buf(),
                reason,
            }),
        }
    }

    /// Privilege gate, then path policy, for a write.
    fn gate(&self, session: &Session, path: &Path) -> Gated {
        if let GateDecision::Denied(reason) =
            PrivilegeGate::check(session.identity(), AccessMode::Write)
        {
            return Gated::Refused(Rejection::PrivilegeDenied { reason });
        }
        match self.path_policy.evaluate(path, session).require(AccessMode::Write) {
            PathDecision::Allowed { canonical, .. } if self.is_protected(&canonical) => {
                tracing::debug!(path = %canonical.display(), "write to protected state refused");
                Gated::Refused(Rejection::PathDenied {
                    path: path.to_path_buf(),
                    reason: DenyReason::ProtectedState,
                    detail: format!("{} belongs to safefs", canonical.display()),
                })
            }
            PathDecision::Allowed { canonical, .. } => Gated::Target(canonical),
            PathDecision::Denied { reason, detail } => Gated::Refused(Rejection::PathDenied {
                path: path.to_path_buf(),
                reason,
                detail,
            }),
        }
    }

    fn snapshot(&self, canonical: &Path) -> Result<Option<io::Snapshot>> {
        io::read_snapshot(canonical, self.policy.limits.max_read_bytes)
    }

    fn mutate(
        &self,
        session: &Session,
        path: &Path,
        mutation: Mutation<'_>,
        options: WriteOptions,
    ) -> Result<WriteResult> {
        let op = mutation.op();
        let result = self.mutate_inner(session, path, mutation, options);

        let mut record = AuditRecord::new(op, path, session.identity().uid(), AuditOutcome::Failed);
        record.require_confirmation = options.require_confirmation;
        record.scope_override = options.scope == ScopeCheck::UserOverride;
        match &result {
            Ok(WriteResult::Applied(applied)) => {
                record.path = applied.path.clone();
                record.outcome = AuditOutcome::Applied;
                record.backup = applied.backup.backup().map(|backup| backup.path.clone());
                record.bytes_written = Some(applied.bytes_written);
            }
            Ok(WriteResult::Rejected(rejection)) => {
                record.outcome = match rejection {
                    Rejection::PathDenied { .. } | Rejection::PrivilegeDenied { .. } => {
                        AuditOutcome::Denied
                    }
                    Rejection::ScopeViolation { .. } | Rejection::TooLarge { .. } => {
                        AuditOutcome::Rejected
                    }
                };
                record.detail = Some(rejection_detail(rejection));
            }
            Ok(WriteResult::Conflict(conflict)) => {
                record.outcome = AuditOutcome::Conflict;
                record.detail = Some(conflict.to_string());
            }
            Err(err) => record.detail = Some(err.code().to_string()),
        }
        self.emit(&record);
        result
    }

    fn mutate_inner(
        &self,
        session: &Session,
        path: &Path,
        mutation: Mutation<'_>,
        options: WriteOptions,
    ) -> Result<WriteResult> {
        let canonical = match self.gate(session, path) {
            Gated::Target(canonical) => canonical,
            Gated::Refused(rejection) => return Ok(WriteResult::Rejected(rejection)),
        };

        let guard = self.locks.acquire(&canonical);
        // Privilege or symlinks may have changed while this call waited for the lock.
        match self.gate(session, path) {
            Gated::Target(current) if current == canonical => {}
            Gated::Target(current) => {
                return Err(Error::InvalidPath(format!(
                    "target of {} changed from {} to {} while waiting for the lock",
                    path.display(),
                    canonical.display(),
                    current.display()
                )));
            }
            Gated::Refused(rejection) => return Ok(WriteResult::Rejected(rejection)),
        }

        let snapshot = match self.snapshot(&canonical) {
            Ok(snapshot) => snapshot,
            Err(err) => return refusal(err, &canonical).map(WriteResult::from),
        };
        let updated = match self
            .compute(&canonical, snapshot.as_ref(), &mutation, options)
            .and_then(|updated| {
                self.engine.check_size(&canonical, updated.len())?;
                Ok(updated)
            }) {
            Ok(updated) => updated,
            Err(err) => return refusal(err, &canonical).map(WriteResult::from),
        };

        let backup = match &snapshot {
            Some(snapshot) => BackupOutcome::Created(self.backups.store_at(
                &canonical,
                &snapshot.bytes,
                snapshot.mode(),
                mutation.backup_reason(),
                Utc::now(),
            )?),
            None => BackupOutcome::NoPriorContent,
        };
        io::write_atomic(&canonical, &updated, snapshot.as_ref())?;
        drop(guard);

        if backup.backup().is_some() {
            self.schedule_thin(&canonical);
        }
        tracing::info!(
            path = %canonical.display(),
            op = mutation.op().as_str(),
            bytes = updated.len(),
            "mutation committed"
        );
        Ok(WriteResult::Applied(Applied {
            path: canonical,
            backup,
            bytes_written: u64::try_from(updated.len()).unwrap_or(u64::MAX),
        }))
    }

    fn compute(
        &self,
        canonical: &Path,
        snapshot: Option<&io::Snapshot>,
        mutation: &Mutation<'_>,
        options: WriteOptions,
    ) -> Result<Vec<u8>> {
        match mutation {
            Mutation::Replace(content) => Ok(content.as_bytes().to_vec()),
            Mutation::Patch(request) => self
                .compute_patch(
                    canonical,
                    current_text(canonical, snapshot)?,
                    request,
                    options.scope,
                )
                .map(String::into_bytes),
            Mutation::UpsertBlock { name, body } => self
                .blocks
                .upsert_block(current_text(canonical, snapshot)?, name, body)
                .map(String::into_bytes),
            Mutation::Restore(backup) => {
                if backup.original != canonical {
                    return Err(Error::BackupNotFound(backup.path.clone()));
                }
                self.backups.restore(backup)
            }
        }
    }

    fn compute_patch(
        &self,
        canonical: &Path,
        original: &str,
        request: &PatchRequest,
        scope: ScopeCheck,
    ) -> Result<String> {
        if scope == ScopeCheck::Enforce
            && self.blocks.has_markers(original)
            && let ScopeDecision::Rejected(violation) =
                self.blocks.validate_patch_scope(original, request)
        {
            tracing::debug!(
                path = %canonical.display(),
                %violation,
                "patch outside managed blocks"
            );
            return Err(Error::ScopeViolation(violation));
        }
        self.engine.apply(canonical, original, request)
    }

    fn schedule_thin(&self, canonical: &Path) {
        let backups = Arc::clone(&self.backups);
        let canonical = canonical.to_path_buf();
        let thin = move || {
            if let Err(err) = backups.thin(&canonical) {
                tracing::warn!(
                    path = %canonical.display(),
                    error = %err,
                    "backup thinning failed"
                );
            }
        };
        if !self.policy.retention.thin_in_background {
            thin();
            return;
        }
        if let Err(err) = std::thread::Builder::new()
            .name("safefs-thin".to_string())
            .spawn(thin)
        {
            tracing::warn!(error = %err, "failed to spawn backup thinning thread");
        }
    }

    fn emit(&self, record: &AuditRecord) {
        if let Err(err) = self.audit.record(record) {
            tracing::warn!(
                op = record.op.as_str(),
                path = %record.path.display(),
                error = %err,
                "failed to record audit entry"
            );
        }
    }
}

/// Canonical form of `path`, resolving symlinks through its deepest existing ancestor. The
/// protected paths need not exist yet.
fn resolve_existing(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let absolute = path_utils::normalize_path_lexical(&absolute);
    for ancestor in absolute.ancestors() {
        if let Ok(resolved) = ancestor.canonicalize() {
            return match absolute.strip_prefix(ancestor) {
                Ok(rest) if !rest.as_os_str().is_empty() => resolved.join(rest),
                _ => resolved,
            };
        }
    }
    absolute
}

/// Current content as text; a missing file reads as empty.
fn current_text<'a>(path: &Path, snapshot: Option<&'a io::Snapshot>) -> Result<&'a str> {
    match snapshot {
        Some(snapshot) => std::str::from_utf8(&snapshot.bytes)
            .map_err(|_| Error::InvalidUtf8(path.to_path_buf())),
        None => Ok(""),
    }
}

/// A refusal computed after the gate: nothing has been touched.
enum Refusal {
    Rejected(Rejection),
    Conflict(PatchConflict),
}

impl From<Refusal> for WriteResult {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::Rejected(rejection) => Self::Rejected(rejection),
            Refusal::Conflict(conflict) => Self::Conflict(conflict),
        }
    }
}

impl From<Refusal> for ProposeResult {
    fn from(refusal: Refusal) -> Self {
        match refusal {
            Refusal::Rejected(rejection) => Self::Rejected(rejection),
            Refusal::Conflict(conflict) => Self::Conflict(conflict),
        }
    }
}

/// Policy refusals and conflicts become result variants; faults stay errors.
fn refusal(err: Error, canonical: &Path) -> Result<Refusal> {
    match err {
        Error::PatchConflict(conflict) => Ok(Refusal::Conflict(conflict)),
        Error::ScopeViolation(violation) => Ok(Refusal::Rejected(Rejection::ScopeViolation {
            path: canonical.to_path_buf(),
            violation,
        })),
        Error::TooLarge {
            path,
            size_bytes,
            max_bytes,
        } => Ok(Refusal::Rejected(Rejection::TooLarge {
            path,
            size_bytes,
            max_bytes,
        })),
        other => Err(other),
    }
}

fn rejection_detail(rejection: &Rejection) -> String {
    match rejection {
        Rejection::PathDenied { reason, .. } => reason.as_str().to_string(),
        Rejection::PrivilegeDenied { .. } => Error::CODE_PRIVILEGE_DENIED.to_string(),
        Rejection::ScopeViolation { violation, .. } => violation.code().to_string(),
        Rejection::TooLarge { .. } => Error::CODE_TOO_LARGE.to_string(),
    }
}
