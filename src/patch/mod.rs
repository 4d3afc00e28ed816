//! In-memory patch application.
//!
//! Hunks are located by matching their context and deleted lines verbatim against the original
//! content. Header line numbers are never trusted: a hunk whose context is missing, or present
//! at more than one place, is a conflict rather than a guess.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::policy::Limits;

mod hunk;

pub use hunk::{Hunk, HunkLine, UnifiedDiff};

const MAX_REPORTED_CANDIDATES: usize = 8;

/// The desired mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchRequest {
    FullReplace(String),
    UnifiedDiff(UnifiedDiff),
}

impl PatchRequest {
    pub fn full_replace(content: impl Into<String>) -> Self {
        Self::FullReplace(content.into())
    }

    pub fn parse_diff(text: &str) -> Result<Self> {
        UnifiedDiff::parse(text).map(Self::UnifiedDiff)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FullReplace(_) => "full_replace",
            Self::UnifiedDiff(_) => "unified_diff",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    ContextNotFound,
    AmbiguousContext,
}

/// Why a hunk could not be placed, with enough detail to regenerate it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchConflict {
    /// Zero-based hunk index.
    pub hunk: usize,
    pub kind: ConflictKind,
    /// One-based line numbers where the hunk's context matched (ambiguous case only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<usize>,
    /// First expected line of the hunk, trimmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

impl fmt::Display for PatchConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hunk = self.hunk + 1;
        match self.kind {
            ConflictKind::ContextNotFound => {
                write!(f, "hunk {hunk}: context not found in current content")?;
            }
            ConflictKind::AmbiguousContext if self.candidates.is_empty() => {
                write!(f, "hunk {hunk}: hunk has no context to anchor on")?;
            }
            ConflictKind::AmbiguousContext => {
                let lines: Vec<String> = self.candidates.iter().map(usize::to_string).collect();
                write!(
                    f,
                    "hunk {hunk}: context matches at several lines ({})",
                    lines.join(", ")
                )?;
            }
        }
        if let Some(anchor) = &self.anchor {
            write!(f, " near {anchor:?}")?;
        }
        Ok(())
    }
}

/// Where a hunk landed in the original content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedHunk {
    pub index: usize,
    /// Zero-based index of the first original line the hunk covers.
    pub start: usize,
    /// Number of original lines covered (context plus deletions).
    pub old_len: usize,
    /// Zero-based original line indices removed by the hunk.
    pub deleted: Vec<usize>,
    /// For each inserted line, the zero-based original line index it is inserted before.
    /// `line_count` means end of file.
    pub inserted_before: Vec<usize>,
}

/// Split text into lines, keeping terminators.
pub(crate) fn split_lines(content: &str) -> Vec<&str> {
    if content.is_empty() {
        Vec::new()
    } else {
        content.split_inclusive('\n').collect()
    }
}

#[derive(Debug, Clone)]
pub struct PatchEngine {
    max_write_bytes: u64,
}

impl PatchEngine {
    pub fn new(limits: &Limits) -> Self {
        Self {
            max_write_bytes: limits.max_write_bytes,
        }
    }

    /// Compute the patched content. `path` only labels errors.
    ///
    /// Conflicts surface as [`Error::PatchConflict`]; oversized output as [`Error::TooLarge`].
    /// The result is a pure function of `original` and `request`.
    pub fn apply(&self, path: &Path, original: &str, request: &PatchRequest) -> Result<String> {
        let updated = match request {
            PatchRequest::FullReplace(content) => content.clone(),
            PatchRequest::UnifiedDiff(diff) => {
                let lines = split_lines(original);
                let located = locate_lines(&lines, diff)?;
                splice(&lines, diff, &located)
            }
        };
        self.check_size(path, updated.len())?;
        Ok(updated)
    }

    pub fn check_size(&self, path: &Path, len: usize) -> Result<()> {
        let size_bytes = u64::try_from(len).unwrap_or(u64::MAX);
        if size_bytes > self.max_write_bytes {
            return Err(Error::TooLarge {
                path: path.to_path_buf(),
                size_bytes,
                max_bytes: self.max_write_bytes,
            });
        }
        Ok(())
    }

    /// Locate every hunk of `diff` in `original` without applying anything.
    pub fn locate(original: &str, diff: &UnifiedDiff) -> Result<Vec<LocatedHunk>> {
        locate_lines(&split_lines(original), diff)
    }

    /// Render a unified diff between two texts for confirmation prompts.
    pub fn preview(original: &str, updated: &str) -> String {
        diffy::create_patch(original, updated).to_string()
    }
}

fn locate_lines(lines: &[&str], diff: &UnifiedDiff) -> Result<Vec<LocatedHunk>> {
    let mut located = Vec::with_capacity(diff.hunks().len());
    let mut cursor = 0usize;

    for (index, hunk) in diff.hunks().iter().enumerate() {
        let old = hunk.old_side();
        let start = find_unique(lines, cursor, &old).map_err(|(kind, candidates)| {
            Error::PatchConflict(PatchConflict {
                hunk: index,
                kind,
                candidates,
                anchor: old.first().map(|line| line.trim().to_string()),
            })
        })?;

        located.push(place(index, hunk, start));
        cursor = start + old.len();
    }
    Ok(located)
}

/// Place hunks where their `@@` headers say, for diffs this crate generated itself.
pub(crate) fn locate_by_header(diff: &UnifiedDiff) -> Option<Vec<LocatedHunk>> {
    diff.hunks()
        .iter()
        .enumerate()
        .map(|(index, hunk)| Some(place(index, hunk, hunk.header_start()?)))
        .collect()
}

fn place(index: usize, hunk: &Hunk, start: usize) -> LocatedHunk {
    let mut deleted = Vec::new();
    let mut inserted_before = Vec::new();
    let mut position = start;
    for line in hunk.lines() {
        match line {
            HunkLine::Context(_) => position += 1,
            HunkLine::Delete(_) => {
                deleted.push(position);
                position += 1;
            }
            HunkLine::Insert(_) => inserted_before.push(position),
        }
    }
    LocatedHunk {
        index,
        start,
        old_len: position - start,
        deleted,
        inserted_before,
    }
}

/// Find the single offset at or after `cursor` where `needle` matches `lines`.
fn find_unique(
    lines: &[&str],
    cursor: usize,
    needle: &[&str],
) -> std::result::Result<usize, (ConflictKind, Vec<usize>)> {
    if needle.is_empty() {
        // Nothing to anchor on: only an empty original gives a unique position.
        if lines.is_empty() {
            return Ok(0);
        }
        return Err((ConflictKind::AmbiguousContext, Vec::new()));
    }
    if lines.len() < cursor + needle.len() {
        return Err((ConflictKind::ContextNotFound, Vec::new()));
    }

    let mut candidates = Vec::new();
    for start in cursor..=lines.len() - needle.len() {
        if lines[start..start + needle.len()] == *needle {
            candidates.push(start);
        }
    }
    match candidates.as_slice() {
        [] => Err((ConflictKind::ContextNotFound, Vec::new())),
        [only] => Ok(*only),
        _ => Err((
            ConflictKind::AmbiguousContext,
            candidates
                .into_iter()
                .take(MAX_REPORTED_CANDIDATES)
                .map(|start| start + 1)
                .collect(),
        )),
    }
}

fn splice(lines: &[&str], diff: &UnifiedDiff, located: &[LocatedHunk]) -> String {
    let mut out = String::new();
    let mut cursor = 0usize;
    for (hunk, place) in diff.hunks().iter().zip(located) {
        for line in &lines[cursor..place.start] {
            out.push_str(line);
        }
        for line in hunk.new_side() {
            out.push_str(line);
        }
        cursor = place.start + place.old_len;
    }
    for line in &lines[cursor..] {
        out.push_str(line);
    }
    out
}
