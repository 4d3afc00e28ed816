//! Managed blocks: named regions inside user files that automated edits are confined to.
//!
//! A block is delimited by a pair of marker lines carrying the configured tag and the block
//! name, optionally behind a comment leader:
//!
//! ```text
//! # >>> shellpilot:venv-activate >>>
//! source ~/.venvs/default/bin/activate
//! # <<< shellpilot:venv-activate <<<
//! ```
//!
//! Marker text is never escaped. Any line matching the grammar is a marker, which is why a block
//! body may not itself contain marker lines.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::patch::{self, LocatedHunk, PatchEngine, PatchRequest, UnifiedDiff};
use crate::policy::{BlockSettings, is_valid_name};

/// One parsed block. Line indices are zero-based and point at the marker lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedBlock {
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
}

impl ManagedBlock {
    /// Whether original line `idx` is a body line of this block.
    fn contains_line(&self, idx: usize) -> bool {
        self.start_line < idx && idx < self.end_line
    }

    /// Whether a line inserted before original line `idx` lands inside the body.
    fn accepts_insert_before(&self, idx: usize) -> bool {
        self.start_line < idx && idx <= self.end_line
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ScopeViolation {
    /// A hunk adds or removes a line outside every managed region and is not a trailing append.
    OutsideManagedRegion {
        /// Zero-based hunk index.
        hunk: usize,
        /// One-based original line number the change touches.
        line: usize,
    },
    /// The file's markers do not form valid blocks, so no region can be trusted.
    MalformedBlocks { detail: String },
}

impl ScopeViolation {
    pub fn code(&self) -> &'static str {
        "outside_managed_region"
    }
}

impl fmt::Display for ScopeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutsideManagedRegion { hunk, line } => write!(
                f,
                "outside managed region: hunk {} changes line {line}, which is not inside a managed block",
                hunk + 1
            ),
            Self::MalformedBlocks { detail } => {
                write!(f, "outside managed region: managed blocks are malformed ({detail})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeDecision {
    Allowed,
    Rejected(ScopeViolation),
}

impl ScopeDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerKind {
    Start,
    End,
}

#[derive(Debug)]
struct Marker<'a> {
    kind: MarkerKind,
    name: &'a str,
}

#[derive(Debug, Clone)]
pub struct ManagedBlockEditor {
    tag: String,
    comment: String,
}

impl ManagedBlockEditor {
    pub fn new(settings: &BlockSettings) -> Self {
        Self {
            tag: settings.tag.clone(),
            comment: settings.comment.clone(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn start_marker(&self, name: &str) -> String {
        self.marker(">>>", name)
    }

    pub fn end_marker(&self, name: &str) -> String {
        self.marker("<<<", name)
    }

    fn marker(&self, arrows: &str, name: &str) -> String {
        if self.comment.is_empty() {
            format!("{arrows} {}:{name} {arrows}", self.tag)
        } else {
            format!("{} {arrows} {}:{name} {arrows}", self.comment, self.tag)
        }
    }

    fn classify<'a>(&self, line: &'a str) -> Option<Marker<'a>> {
        let trimmed = line.trim();
        // The configured leader may itself contain arrows (`<!--`), so strip it literally first.
        let trimmed = if self.comment.is_empty() {
            trimmed
        } else {
            trimmed.strip_prefix(self.comment.as_str()).unwrap_or(trimmed)
        };
        let rest = trimmed
            .trim_start_matches(|ch: char| {
                !ch.is_alphanumeric() && !ch.is_whitespace() && ch != '<' && ch != '>'
            })
            .trim_start();
        let (kind, arrows) = if rest.starts_with(">>>") {
            (MarkerKind::Start, ">>>")
        } else if rest.starts_with("<<<") {
            (MarkerKind::End, "<<<")
        } else {
            return None;
        };
        let inner = rest
            .strip_prefix(arrows)?
            .strip_suffix(arrows)?
            .trim();
        let (tag, name) = inner.split_once(':')?;
        if tag != self.tag || !is_valid_name(name) {
            return None;
        }
        Some(Marker { kind, name })
    }

    /// Whether `content` contains any marker line for this editor's tag, well-formed or not.
    pub fn has_markers(&self, content: &str) -> bool {
        content.lines().any(|line| self.classify(line).is_some())
    }

    /// Parse every block, ordered by start line.
    ///
    /// Fails on duplicate names (across nesting levels too), unterminated blocks, stray end
    /// markers, and crossing blocks.
    pub fn parse_blocks(&self, content: &str) -> Result<Vec<ManagedBlock>> {
        let mut open: Vec<(&str, usize)> = Vec::new();
        let mut seen = HashSet::<&str>::new();
        let mut blocks = Vec::new();

        for (idx, line) in patch::split_lines(content).into_iter().enumerate() {
            let Some(marker) = self.classify(line) else {
                continue;
            };
            let line_no = idx + 1;
            match marker.kind {
                MarkerKind::Start => {
                    if !seen.insert(marker.name) {
                        return Err(malformed(format!(
                            "block {:?} is defined more than once (line {line_no})",
                            marker.name
                        )));
                    }
                    open.push((marker.name, idx));
                }
                MarkerKind::End => match open.pop() {
                    Some((name, start_line)) if name == marker.name => {
                        blocks.push(ManagedBlock {
                            name: name.to_string(),
                            start_line,
                            end_line: idx,
                        });
                    }
                    Some((name, _)) if open.iter().any(|(outer, _)| *outer == marker.name) => {
                        return Err(malformed(format!(
                            "block {:?} crosses block {name:?} (line {line_no})",
                            marker.name
                        )));
                    }
                    _ => {
                        return Err(malformed(format!(
                            "end marker for {:?} has no matching start (line {line_no})",
                            marker.name
                        )));
                    }
                },
            }
        }

        if let Some((name, start_line)) = open.pop() {
            return Err(malformed(format!(
                "block {name:?} starting at line {} is never closed",
                start_line + 1
            )));
        }
        blocks.sort_by_key(|block| block.start_line);
        Ok(blocks)
    }

    pub fn list_blocks(&self, content: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .parse_blocks(content)?
            .into_iter()
            .map(|block| block.name)
            .collect())
    }

    /// Replace the body of block `name`, or append a new block at end of file.
    ///
    /// Bytes outside the targeted body are preserved exactly.
    pub fn upsert_block(&self, content: &str, name: &str, body: &str) -> Result<String> {
        if !is_valid_name(name) {
            return Err(Error::ManagedBlock(format!(
                "invalid block name {name:?}: expected [A-Za-z0-9._-]{{1,64}}"
            )));
        }
        let blocks = self.parse_blocks(content)?;
        if let Some(line) = body.lines().position(|line| self.classify(line).is_some()) {
            return Err(Error::ManagedBlock(format!(
                "block body line {} is a block marker; marker text cannot appear inside a body",
                line + 1
            )));
        }

        let newline = dominant_newline(content);
        let mut body = normalize_line_endings(body, newline);
        if !body.is_empty() && !body.ends_with('\n') {
            body.push_str(newline);
        }

        let lines = patch::split_lines(content);
        if let Some(block) = blocks.iter().find(|block| block.name == name) {
            let mut out = String::with_capacity(content.len() + body.len());
            for line in &lines[..=block.start_line] {
                out.push_str(line);
            }
            out.push_str(&body);
            for line in &lines[block.end_line..] {
                out.push_str(line);
            }
            return Ok(out);
        }

        let mut out = String::with_capacity(content.len() + body.len() + 128);
        out.push_str(content);
        if !content.is_empty() && !content.ends_with('\n') {
            out.push_str(newline);
        }
        out.push_str(&self.start_marker(name));
        out.push_str(newline);
        out.push_str(&body);
        out.push_str(&self.end_marker(name));
        out.push_str(newline);
        Ok(out)
    }

    /// Check that `request` only changes managed-block bodies or appends after the last block.
    ///
    /// A unified diff whose hunks cannot be located is allowed here; applying it reports the
    /// conflict.
    pub fn validate_patch_scope(&self, content: &str, request: &PatchRequest) -> ScopeDecision {
        let blocks = match self.parse_blocks(content) {
            Ok(blocks) => blocks,
            Err(err) => {
                return ScopeDecision::Rejected(ScopeViolation::MalformedBlocks {
                    detail: err.to_string(),
                });
            }
        };

        let generated;
        let (diff, located) = match request {
            PatchRequest::UnifiedDiff(diff) => match PatchEngine::locate(content, diff) {
                Ok(located) => (diff, located),
                Err(_) => return ScopeDecision::Allowed,
            },
            PatchRequest::FullReplace(updated) => match UnifiedDiff::between(content, updated) {
                Ok(Some(diff)) => {
                    generated = diff;
                    match patch::locate_by_header(&generated) {
                        Some(located) => (&generated, located),
                        None => return reject_whole_file(),
                    }
                }
                Ok(None) => return ScopeDecision::Allowed,
                Err(_) => return reject_whole_file(),
            },
        };

        let lines = patch::split_lines(content);
        let markers: HashSet<usize> = blocks
            .iter()
            .flat_map(|block| [block.start_line, block.end_line])
            .collect();
        for (place, hunk) in located.iter().zip(diff.hunks()) {
            if let Some(line) = first_out_of_scope(&blocks, &markers, &lines, place, hunk) {
                return ScopeDecision::Rejected(ScopeViolation::OutsideManagedRegion {
                    hunk: place.index,
                    line,
                });
            }
        }
        ScopeDecision::Allowed
    }
}

fn reject_whole_file() -> ScopeDecision {
    ScopeDecision::Rejected(ScopeViolation::OutsideManagedRegion { hunk: 0, line: 1 })
}

/// One-based line number of the first change in `place` that falls outside every block body.
///
/// Marker lines of nested blocks sit inside the outer body but are never editable.
fn first_out_of_scope(
    blocks: &[ManagedBlock],
    markers: &HashSet<usize>,
    lines: &[&str],
    place: &LocatedHunk,
    hunk: &patch::Hunk,
) -> Option<usize> {
    let line_count = lines.len();
    let (skip_delete, skip_insert) = newline_fix(lines, place, hunk);

    for &idx in &place.deleted {
        if Some(idx) == skip_delete {
            continue;
        }
        if markers.contains(&idx) || !blocks.iter().any(|block| block.contains_line(idx)) {
            return Some(idx + 1);
        }
    }
    for (n, &idx) in place.inserted_before.iter().enumerate() {
        if Some(n) == skip_insert || idx == line_count {
            continue;
        }
        if !blocks.iter().any(|block| block.accepts_insert_before(idx)) {
            return Some(idx + 1);
        }
    }
    None
}

/// Detect "delete the unterminated last line, re-insert it terminated": diffs express an append
/// to a file without a trailing newline that way. Returns the deleted line index and the position
/// of the matching insert within `inserted_before`.
fn newline_fix(
    lines: &[&str],
    place: &LocatedHunk,
    hunk: &patch::Hunk,
) -> (Option<usize>, Option<usize>) {
    let Some(last_idx) = lines.len().checked_sub(1) else {
        return (None, None);
    };
    let last = lines[last_idx];
    if last.ends_with('\n') || !place.deleted.contains(&last_idx) {
        return (None, None);
    }
    let inserts: Vec<&str> = hunk
        .lines()
        .iter()
        .filter_map(|line| match line {
            patch::HunkLine::Insert(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    let restored = inserts.iter().position(|text| {
        text.strip_suffix('\n')
            .map(|text| text.strip_suffix('\r').unwrap_or(text))
            == Some(last)
    });
    match restored {
        Some(n) if place.inserted_before[n] == lines.len() => (Some(last_idx), Some(n)),
        _ => (None, None),
    }
}

fn malformed(detail: String) -> Error {
    Error::ManagedBlock(detail)
}

fn dominant_newline(content: &str) -> &'static str {
    let total = content.matches('\n').count();
    let crlf = content.matches("\r\n").count();
    if crlf > 0 && crlf * 2 >= total {
        "\r\n"
    } else {
        "\n"
    }
}

fn normalize_line_endings(text: &str, newline: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    let _ = chars.next();
                }
                out.push_str(newline);
            }
            '\n' => out.push_str(newline),
            _ => out.push(ch),
        }
    }
    out
}
