use std::path::Path;
use std::sync::Arc;

use safefs::{
    AccessMode, Identity, JsonlAuditSink, PathDecision, ProposeResult, SafeFs, SafeFsPolicy,
    Session, WriteOptions, WriteResult,
};

use crate::error::CliError;
use crate::input::load_text_limited;
use crate::{Cli, Command, ProjectMode};

/// How the process should exit after printing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Done,
    /// Printed a refusal or conflict; nothing was written.
    Refused,
}

impl Status {
    pub(crate) fn exit_code(self) -> i32 {
        match self {
            Self::Done => 0,
            Self::Refused => 2,
        }
    }
}

pub(crate) fn run(cli: &Cli) -> Result<Status, CliError> {
    let policy = match &cli.policy {
        Some(path) => safefs::policy_io::load_policy(path)?,
        None => safefs::policy_io::load_default_policy()?,
    };
    let identity = Identity::current()?;
    let cwd = match &cli.cwd {
        Some(cwd) => cwd.clone(),
        None => std::env::current_dir().map_err(safefs::Error::Io)?,
    };
    let session = Session::discover(identity, cwd, project_access(cli.project_mode));
    run_with_policy(cli, policy, &session)
}

fn project_access(mode: ProjectMode) -> AccessMode {
    match mode {
        ProjectMode::Read => AccessMode::Read,
        ProjectMode::ReadWrite => AccessMode::ReadWrite,
    }
}

pub(crate) fn run_with_policy(
    cli: &Cli,
    policy: SafeFsPolicy,
    session: &Session,
) -> Result<Status, CliError> {
    let mut safefs = SafeFs::new(policy)?;
    if let Some(path) = &cli.policy {
        safefs = safefs.with_protected_path(path.clone());
    }
    if let Some(path) = &cli.audit_log {
        safefs = safefs.with_audit_sink(Arc::new(JsonlAuditSink::open(path)?));
    }

    let (value, status) = execute_command(&safefs, session, &cli.command)?;
    let out = crate::serialize_json(&value, cli.pretty)?;
    crate::write_stdout_line(&out)?;
    Ok(status)
}

fn options(confirmed: bool) -> WriteOptions {
    if confirmed {
        WriteOptions::confirmed()
    } else {
        WriteOptions::automated()
    }
}

fn write_status(result: &WriteResult) -> Status {
    if result.is_applied() {
        Status::Done
    } else {
        Status::Refused
    }
}

fn load_input(safefs: &SafeFs, path: &Path) -> Result<String, CliError> {
    Ok(load_text_limited(
        path,
        safefs.policy().limits.max_write_bytes,
    )?)
}

pub(crate) fn execute_command(
    safefs: &SafeFs,
    session: &Session,
    command: &Command,
) -> Result<(serde_json::Value, Status), CliError> {
    match command {
        Command::Check { path } => Ok((decision_json(&safefs.evaluate(session, path)), Status::Done)),
        Command::Read { path, max_bytes } => {
            let max_bytes = max_bytes.unwrap_or(safefs.policy().limits.max_read_bytes);
            let result = safefs.read(session, path, max_bytes)?;
            let status = if result.content().is_some() {
                Status::Done
            } else {
                Status::Refused
            };
            Ok((serde_json::to_value(result)?, status))
        }
        Command::Write {
            path,
            content_file,
            confirmed,
        } => {
            let content = load_input(safefs, content_file)?;
            let result = safefs.write(session, path, &content, options(*confirmed))?;
            let status = write_status(&result);
            Ok((serde_json::to_value(result)?, status))
        }
        Command::Patch {
            path,
            patch_file,
            confirmed,
            override_scope,
        } => {
            let max_patch_bytes = safefs.policy().limits.effective_max_patch_bytes();
            let request = safefs.parse_patch(&load_text_limited(patch_file, max_patch_bytes)?)?;
            let mut options = options(*confirmed);
            if *override_scope {
                options = options.with_scope_override();
            }
            let result = safefs.apply_patch(session, path, &request, options)?;
            let status = write_status(&result);
            Ok((serde_json::to_value(result)?, status))
        }
        Command::Propose { path, patch_file } => {
            let max_patch_bytes = safefs.policy().limits.effective_max_patch_bytes();
            let request = safefs.parse_patch(&load_text_limited(patch_file, max_patch_bytes)?)?;
            let result = safefs.propose_patch(session, path, &request)?;
            let status = match result {
                ProposeResult::Proposal(_) => Status::Done,
                _ => Status::Refused,
            };
            Ok((serde_json::to_value(result)?, status))
        }
        Command::UpsertBlock {
            path,
            name,
            body_file,
            confirmed,
        } => {
            let body = load_input(safefs, body_file)?;
            let result = safefs.upsert_block(session, path, name, &body, options(*confirmed))?;
            let status = write_status(&result);
            Ok((serde_json::to_value(result)?, status))
        }
        Command::Blocks { path } => Ok((
            serde_json::to_value(safefs.blocks(session, path)?)?,
            Status::Done,
        )),
        Command::Backups { path } => Ok((
            serde_json::to_value(safefs.backups(session, path)?)?,
            Status::Done,
        )),
        Command::Restore {
            path,
            backup,
            confirmed,
        } => {
            let canonical = match safefs.evaluate(session, path) {
                PathDecision::Allowed { canonical, .. } => canonical,
                PathDecision::Denied { reason, .. } => {
                    return Err(safefs::Error::PathDenied {
                        path: path.clone(),
                        reason,
                    }
                    .into());
                }
            };
            let backup = safefs.backup_store().find(&canonical, backup)?;
            let result = safefs.revert(session, path, &backup, options(*confirmed))?;
            let status = write_status(&result);
            Ok((serde_json::to_value(result)?, status))
        }
        Command::Thin { path } => {
            let removed = safefs.thin_backups(session, path)?;
            Ok((
                serde_json::json!({ "removed": removed }),
                Status::Done,
            ))
        }
    }
}

fn decision_json(decision: &PathDecision) -> serde_json::Value {
    match decision {
        PathDecision::Allowed {
            canonical,
            mode,
            source,
        } => serde_json::json!({
            "decision": "allowed",
            "canonical": canonical.display().to_string(),
            "mode": mode,
            "source": source,
        }),
        PathDecision::Denied { reason, detail } => serde_json::json!({
            "decision": "denied",
            "reason": reason,
            "explanation": reason.explain(),
            "detail": detail,
        }),
    }
}
