//! Path eligibility: home boundary, symlink escapes, allowlist, and project root.
//!
//! Rules are applied in order and the first match wins:
//!
//! 1. canonicalize; a literal in-home path whose canonical form leaves home is a symlink escape
//! 2. anything outside home is denied
//! 3. a write-capable allow rule grants its mode
//! 4. a descendant of the session's project root gets the session's mode
//! 5. a read allow rule grants read
//! 6. everything else is not allowlisted
//!
//! Evaluation is a pure function of the path, the session, the filesystem's current symlink
//! layout, and the immutable rule set. Nothing is cached between calls.

use std::fmt;
use std::path::{Path, PathBuf};

use globset::{GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path_utils;
use crate::policy::{AccessMode, AllowRule};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    OutsideHome,
    SymlinkEscape,
    NotAllowlisted,
    InvalidPath,
    /// The target is SafeFS's own state: backups, policy, or audit log.
    ProtectedState,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OutsideHome => "outside_home",
            Self::SymlinkEscape => "symlink_escape",
            Self::NotAllowlisted => "not_allowlisted",
            Self::InvalidPath => "invalid_path",
            Self::ProtectedState => "protected_state",
        }
    }

    /// A plain-language explanation suitable for showing to the user.
    pub fn explain(self) -> &'static str {
        match self {
            Self::OutsideHome => "only files inside your home directory can be accessed",
            Self::SymlinkEscape => {
                "the path is a symbolic link that resolves outside your home directory"
            }
            Self::NotAllowlisted => {
                "the path is not on the allowlist for this access; add an allow rule or edit it manually"
            }
            Self::InvalidPath => "the path does not exist or cannot be resolved",
            Self::ProtectedState => {
                "the path holds backups, policy, or audit data and can only be changed manually"
            }
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which rule produced an `Allowed` decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GrantSource {
    AllowRule { index: usize, pattern: String },
    Project { root: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    Allowed {
        /// Fully resolved target. Locks, backups, and writes all key on this path.
        canonical: PathBuf,
        mode: AccessMode,
        source: GrantSource,
    },
    Denied {
        reason: DenyReason,
        detail: String,
    },
}

impl PathDecision {
    fn denied(reason: DenyReason, detail: impl Into<String>) -> Self {
        Self::Denied {
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn permits(&self, requested: AccessMode) -> bool {
        matches!(self, Self::Allowed { mode, .. } if mode.permits(requested))
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::Allowed { .. } => None,
            Self::Denied { reason, .. } => Some(*reason),
        }
    }

    pub fn canonical(&self) -> Option<&Path> {
        match self {
            Self::Allowed { canonical, .. } => Some(canonical),
            Self::Denied { .. } => None,
        }
    }

    /// Narrow this decision to `requested`: an allowed decision that does not grant the
    /// requested access becomes `NotAllowlisted`.
    pub fn require(self, requested: AccessMode) -> Self {
        match self {
            Self::Allowed { ref mode, .. } if !mode.permits(requested) => Self::denied(
                DenyReason::NotAllowlisted,
                format!(
                    "path is allowlisted for {} but {} was requested",
                    mode.as_str(),
                    requested.as_str()
                ),
            ),
            other => other,
        }
    }
}

#[derive(Debug)]
pub struct PathPolicy {
    rules: Vec<AllowRule>,
    globs: GlobSet,
    /// Maps a glob index in `globs` back to its rule in `rules`.
    glob_rule: Vec<usize>,
}

enum Resolution {
    Canonical(PathBuf),
    DanglingLink { lexical_target: PathBuf },
    Invalid(String),
}

impl PathPolicy {
    pub fn new(rules: &[AllowRule]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut glob_rule = Vec::<usize>::new();
        for (idx, rule) in rules.iter().enumerate() {
            let pattern = normalize_rule_pattern(rule.home_relative_pattern());
            add_glob(&mut builder, idx, &rule.pattern, &pattern)?;
            glob_rule.push(idx);

            // `dir/**` also covers `dir` itself.
            if let Some(dir) = pattern.strip_suffix("/**").filter(|dir| !dir.is_empty()) {
                add_glob(&mut builder, idx, &rule.pattern, dir)?;
                glob_rule.push(idx);
            }
        }
        let globs = builder
            .build()
            .map_err(|err| Error::InvalidPolicy(format!("failed to build allow rules: {err}")))?;
        Ok(Self {
            rules: rules.to_vec(),
            globs,
            glob_rule,
        })
    }

    pub fn rules(&self) -> &[AllowRule] {
        &self.rules
    }

    /// Evaluate `path` for `session`. Never fails: unresolvable input becomes
    /// `Denied(InvalidPath)`.
    pub fn evaluate(&self, path: &Path, session: &Session) -> PathDecision {
        let decision = self.evaluate_inner(path, session);
        match &decision {
            PathDecision::Allowed { canonical, mode, .. } => tracing::debug!(
                path = %path.display(),
                canonical = %canonical.display(),
                mode = mode.as_str(),
                "path allowed"
            ),
            PathDecision::Denied { reason, detail } => tracing::debug!(
                path = %path.display(),
                reason = reason.as_str(),
                detail = %detail,
                "path denied"
            ),
        }
        decision
    }

    fn evaluate_inner(&self, path: &Path, session: &Session) -> PathDecision {
        if path.as_os_str().is_empty() {
            return PathDecision::denied(DenyReason::InvalidPath, "path is empty");
        }
        let identity = session.identity();
        let home = identity.home();
        let Ok(canonical_home) = home.canonicalize() else {
            return PathDecision::denied(
                DenyReason::InvalidPath,
                format!("home directory {} cannot be resolved", home.display()),
            );
        };

        let expanded = path_utils::expand_tilde(path, home);
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            session.cwd().join(expanded)
        };
        let literal = path_utils::normalize_path_lexical(&absolute);
        let literal_in_home = path_utils::is_descendant_or_self(&literal, home)
            || path_utils::is_descendant_or_self(&literal, &canonical_home);

        let canonical = match resolve(&absolute) {
            Resolution::Canonical(canonical) => canonical,
            Resolution::DanglingLink { lexical_target } => {
                if literal_in_home
                    && !path_utils::is_descendant_or_self(&lexical_target, &canonical_home)
                {
                    return PathDecision::denied(
                        DenyReason::SymlinkEscape,
                        format!(
                            "dangling symlink points outside home: {}",
                            lexical_target.display()
                        ),
                    );
                }
                return PathDecision::denied(
                    DenyReason::InvalidPath,
                    format!("dangling symlink: {}", literal.display()),
                );
            }
            Resolution::Invalid(detail) => {
                return PathDecision::denied(DenyReason::InvalidPath, detail);
            }
        };

        let canonical_in_home = path_utils::is_descendant_or_self(&canonical, &canonical_home);
        if canonical != literal && literal_in_home && !canonical_in_home {
            return PathDecision::denied(
                DenyReason::SymlinkEscape,
                format!(
                    "{} resolves to {} outside home",
                    literal.display(),
                    canonical.display()
                ),
            );
        }
        if !canonical_in_home {
            return PathDecision::denied(
                DenyReason::OutsideHome,
                format!("{} is outside {}", canonical.display(), home.display()),
            );
        }

        let Some(relative) = path_utils::strip_prefix_lexical(&canonical, &canonical_home) else {
            return PathDecision::denied(
                DenyReason::InvalidPath,
                format!("failed to derive home-relative path for {}", canonical.display()),
            );
        };
        let relative = if relative.as_os_str().is_empty() {
            ".".to_string()
        } else {
            path_utils::to_slash(&relative)
        };
        let matched = self.matching_rules(&relative);

        if let Some(&idx) = matched.iter().find(|&&idx| self.rules[idx].mode.can_write()) {
            return self.allowed_by_rule(canonical, idx);
        }

        let project_root = session
            .project_root()
            .canonicalize()
            .unwrap_or_else(|_| path_utils::normalize_path_lexical(session.project_root()));
        if path_utils::is_descendant_or_self(&canonical, &project_root) {
            return PathDecision::Allowed {
                canonical,
                mode: session.project_mode(),
                source: GrantSource::Project { root: project_root },
            };
        }

        if let Some(&idx) = matched.iter().find(|&&idx| self.rules[idx].mode.can_read()) {
            return self.allowed_by_rule(canonical, idx);
        }

        PathDecision::denied(
            DenyReason::NotAllowlisted,
            format!("no allow rule matches ~/{relative}"),
        )
    }

    fn matching_rules(&self, relative: &str) -> Vec<usize> {
        let mut matched: Vec<usize> = self
            .globs
            .matches(relative)
            .into_iter()
            .map(|glob_idx| self.glob_rule[glob_idx])
            .collect();
        matched.sort_unstable();
        matched.dedup();
        matched
    }

    fn allowed_by_rule(&self, canonical: PathBuf, idx: usize) -> PathDecision {
        let rule = &self.rules[idx];
        PathDecision::Allowed {
            canonical,
            mode: rule.mode,
            source: GrantSource::AllowRule {
                index: idx,
                pattern: rule.pattern.clone(),
            },
        }
    }
}

fn normalize_rule_pattern(pattern: &str) -> String {
    let mut trimmed = pattern;
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.to_string()
    }
}

fn add_glob(builder: &mut GlobSetBuilder, idx: usize, raw: &str, pattern: &str) -> Result<()> {
    let glob = path_utils::build_glob(pattern).map_err(|err| {
        Error::InvalidPolicy(format!("invalid allow[{idx}].pattern {raw:?}: {err}"))
    })?;
    builder.add(glob);
    Ok(())
}

fn resolve(absolute: &Path) -> Resolution {
    match absolute.canonicalize() {
        Ok(canonical) => return Resolution::Canonical(canonical),
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
            return Resolution::Invalid(format!(
                "failed to resolve {}: {err}",
                absolute.display()
            ));
        }
        Err(_) => {}
    }

    let Some(file_name) = absolute.file_name() else {
        return Resolution::Invalid(format!("path {} has no file name", absolute.display()));
    };
    let Some(parent) = absolute.parent() else {
        return Resolution::Invalid(format!("path {} has no parent", absolute.display()));
    };
    let canonical_parent = match parent.canonicalize() {
        Ok(parent) => parent,
        Err(err) => {
            return Resolution::Invalid(format!(
                "parent directory {} cannot be resolved: {err}",
                parent.display()
            ));
        }
    };
    let candidate = canonical_parent.join(file_name);

    if let Ok(meta) = std::fs::symlink_metadata(&candidate)
        && meta.file_type().is_symlink()
    {
        let lexical_target = match std::fs::read_link(&candidate) {
            Ok(target) if target.is_absolute() => path_utils::normalize_path_lexical(&target),
            Ok(target) => path_utils::normalize_path_lexical(&canonical_parent.join(target)),
            Err(err) => {
                return Resolution::Invalid(format!(
                    "failed to read symlink {}: {err}",
                    candidate.display()
                ));
            }
        };
        return Resolution::DanglingLink { lexical_target };
    }

    Resolution::Canonical(candidate)
}
