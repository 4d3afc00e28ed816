use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment override for the configuration home.
pub const CONFIG_HOME_ENV: &str = "SHELLPILOT_CONFIG_HOME";
const APP_DIR: &str = "shellpilot";
/// Policy file name inside the configuration home.
pub const POLICY_FILE_NAME: &str = "safefs.toml";

/// `$SHELLPILOT_CONFIG_HOME`, else `<platform config dir>/shellpilot`.
pub fn config_home() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_HOME_ENV).filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.config_dir().join(APP_DIR))
        .ok_or_else(|| Error::Identity("cannot determine the configuration directory".to_string()))
}

/// Access granted by an allow rule or a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    pub fn can_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }

    /// Whether a grant of `self` covers a request for `requested`.
    pub fn permits(self, requested: AccessMode) -> bool {
        match requested {
            AccessMode::Read => self.can_read(),
            AccessMode::Write => self.can_write(),
            AccessMode::ReadWrite => self.can_read() && self.can_write(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadWrite => "read_write",
        }
    }
}

/// One allowlist entry.
///
/// `pattern` is relative to the caller's home directory (a leading `~/` is accepted and
/// stripped). It is either an exact path (`.bashrc`) or a glob (`.config/nvim/**`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowRule {
    pub pattern: String,
    #[serde(default)]
    pub mode: AccessMode,
}

impl AllowRule {
    pub fn new(pattern: impl Into<String>, mode: AccessMode) -> Self {
        Self {
            pattern: pattern.into(),
            mode,
        }
    }

    /// The pattern with any `~/` prefix removed.
    pub fn home_relative_pattern(&self) -> &str {
        let pattern = self.pattern.trim();
        if pattern == "~" {
            return ".";
        }
        pattern.strip_prefix("~/").unwrap_or(pattern)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Limits {
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,
    #[serde(default = "default_max_write_bytes")]
    pub max_write_bytes: u64,
    /// Optional cap for unified-diff patch *input* size (bytes).
    ///
    /// - `None` => defaults to `max_read_bytes`.
    /// - `Some(0)` is invalid and rejected by policy validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_patch_bytes: Option<u64>,
}

const fn default_max_read_bytes() -> u64 {
    1024 * 1024
}

const fn default_max_write_bytes() -> u64 {
    1024 * 1024
}

impl Limits {
    pub fn effective_max_patch_bytes(&self) -> u64 {
        self.max_patch_bytes.unwrap_or(self.max_read_bytes)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_read_bytes: default_max_read_bytes(),
            max_write_bytes: default_max_write_bytes(),
            max_patch_bytes: None,
        }
    }
}

/// Two-tier backup retention window.
///
/// - younger than `keep_all_days`: kept unconditionally
/// - up to `daily_until_days`: newest backup per UTC day
/// - up to `max_age_days`: newest backup per ISO week
/// - older than `max_age_days`: deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionPolicy {
    #[serde(default = "default_keep_all_days")]
    pub keep_all_days: u32,
    #[serde(default = "default_daily_until_days")]
    pub daily_until_days: u32,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
    #[serde(default = "default_thin_in_background")]
    pub thin_in_background: bool,
}

const fn default_keep_all_days() -> u32 {
    7
}

const fn default_daily_until_days() -> u32 {
    30
}

const fn default_max_age_days() -> u32 {
    90
}

const fn default_thin_in_background() -> bool {
    true
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_all_days: default_keep_all_days(),
            daily_until_days: default_daily_until_days(),
            max_age_days: default_max_age_days(),
            thin_in_background: default_thin_in_background(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BackupSettings {
    /// Backup root. Defaults to `<config_home>/ai/backups`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl BackupSettings {
    pub fn resolve_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config_home()?.join("ai").join("backups")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockSettings {
    #[serde(default = "default_block_tag")]
    pub tag: String,
    /// Comment leader written in front of markers when a new block is appended.
    #[serde(default = "default_block_comment")]
    pub comment: String,
}

fn default_block_tag() -> String {
    "shellpilot".to_string()
}

fn default_block_comment() -> String {
    "#".to_string()
}

impl Default for BlockSettings {
    fn default() -> Self {
        Self {
            tag: default_block_tag(),
            comment: default_block_comment(),
        }
    }
}

const MAX_ALLOW_RULES: usize = 512;
const MAX_PATTERN_BYTES: usize = 4 * 1024;
const MAX_TAG_LEN: usize = 32;
const MAX_COMMENT_LEN: usize = 8;
const MAX_RETENTION_DAYS: u32 = 10 * 365;
// Hard caps are policy-level guardrails against misconfiguration.
const MAX_READ_BYTES_HARD_CAP: u64 = 256 * 1024 * 1024;
const MAX_PATCH_BYTES_HARD_CAP: u64 = 256 * 1024 * 1024;
const MAX_WRITE_BYTES_HARD_CAP: u64 = 256 * 1024 * 1024;

fn validate_u64_limit(value: u64, field: &str, hard_cap: u64) -> Result<()> {
    if value == 0 {
        return Err(Error::InvalidPolicy(format!("{field} must be > 0")));
    }
    if value > hard_cap {
        return Err(Error::InvalidPolicy(format!(
            "{field} must be <= {hard_cap}"
        )));
    }
    Ok(())
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.as_bytes().iter().all(|byte| {
            matches!(
                byte,
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-'
            )
        })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SafeFsPolicy {
    #[serde(default)]
    pub allow: Vec<AllowRule>,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub backups: BackupSettings,
    #[serde(default)]
    pub blocks: BlockSettings,
}

impl SafeFsPolicy {
    pub fn with_rules(allow: Vec<AllowRule>) -> Self {
        Self {
            allow,
            ..Self::default()
        }
    }

    /// Structural validation only: checks rule syntax and limit values.
    ///
    /// This does not touch the filesystem. Glob compilation happens in
    /// [`crate::path_policy::PathPolicy::new`].
    pub fn validate(&self) -> Result<()> {
        validate_u64_limit(
            self.limits.max_read_bytes,
            "limits.max_read_bytes",
            MAX_READ_BYTES_HARD_CAP,
        )?;
        validate_u64_limit(
            self.limits.max_write_bytes,
            "limits.max_write_bytes",
            MAX_WRITE_BYTES_HARD_CAP,
        )?;
        if let Some(max_patch_bytes) = self.limits.max_patch_bytes {
            validate_u64_limit(
                max_patch_bytes,
                "limits.max_patch_bytes",
                MAX_PATCH_BYTES_HARD_CAP,
            )?;
        }

        let retention = &self.retention;
        if retention.keep_all_days == 0 {
            return Err(Error::InvalidPolicy(
                "retention.keep_all_days must be > 0".to_string(),
            ));
        }
        if retention.keep_all_days > retention.daily_until_days
            || retention.daily_until_days > retention.max_age_days
        {
            return Err(Error::InvalidPolicy(
                "retention must satisfy keep_all_days <= daily_until_days <= max_age_days"
                    .to_string(),
            ));
        }
        if retention.max_age_days > MAX_RETENTION_DAYS {
            return Err(Error::InvalidPolicy(format!(
                "retention.max_age_days must be <= {MAX_RETENTION_DAYS}"
            )));
        }

        if self.allow.len() > MAX_ALLOW_RULES {
            return Err(Error::InvalidPolicy(format!(
                "too many allow rules ({} > {MAX_ALLOW_RULES})",
                self.allow.len()
            )));
        }
        for (idx, rule) in self.allow.iter().enumerate() {
            validate_allow_pattern(idx, rule)?;
        }

        if !is_valid_name(&self.blocks.tag) || self.blocks.tag.len() > MAX_TAG_LEN {
            return Err(Error::InvalidPolicy(format!(
                "blocks.tag must match [A-Za-z0-9._-]{{1,{MAX_TAG_LEN}}}: {:?}",
                self.blocks.tag
            )));
        }
        let comment = &self.blocks.comment;
        if comment.len() > MAX_COMMENT_LEN
            || comment
                .chars()
                .any(|ch| ch.is_alphanumeric() || ch.is_whitespace())
        {
            return Err(Error::InvalidPolicy(format!(
                "blocks.comment must be at most {MAX_COMMENT_LEN} punctuation characters: {comment:?}"
            )));
        }

        if let Some(dir) = &self.backups.dir
            && !dir.is_absolute()
        {
            return Err(Error::InvalidPolicy(format!(
                "backups.dir must be absolute: {}",
                dir.display()
            )));
        }
        Ok(())
    }
}

fn validate_allow_pattern(idx: usize, rule: &AllowRule) -> Result<()> {
    let raw = rule.pattern.trim();
    if raw.is_empty() {
        return Err(Error::InvalidPolicy(format!(
            "allow[{idx}].pattern must not be empty"
        )));
    }
    if raw.len() > MAX_PATTERN_BYTES {
        return Err(Error::InvalidPolicy(format!(
            "allow[{idx}].pattern is too long ({} bytes > {MAX_PATTERN_BYTES} bytes)",
            raw.len()
        )));
    }
    let pattern = rule.home_relative_pattern();
    let as_path = Path::new(pattern);
    if pattern.starts_with('/') || as_path.is_absolute() {
        return Err(Error::InvalidPolicy(format!(
            "allow[{idx}].pattern must be home-relative (use `~/...`): {:?}",
            rule.pattern
        )));
    }
    if as_path
        .components()
        .any(|comp| matches!(comp, Component::ParentDir))
        || pattern.split('/').any(|segment| segment == "..")
    {
        return Err(Error::InvalidPolicy(format!(
            "allow[{idx}].pattern must not contain '..' segments: {:?}",
            rule.pattern
        )));
    }
    Ok(())
}
