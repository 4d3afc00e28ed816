use std::str::FromStr;

use crate::error::{Error, Result};

/// One line of a hunk. Text includes its line terminator, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Delete(String),
    Insert(String),
}

impl HunkLine {
    pub fn text(&self) -> &str {
        match self {
            Self::Context(text) | Self::Delete(text) | Self::Insert(text) => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    lines: Vec<HunkLine>,
    /// Zero-based original line the `@@` header claims the hunk starts at. Advisory only.
    header_start: Option<usize>,
}

impl Hunk {
    pub fn new(lines: Vec<HunkLine>) -> Self {
        Self {
            lines,
            header_start: None,
        }
    }

    pub fn header_start(&self) -> Option<usize> {
        self.header_start
    }

    pub fn lines(&self) -> &[HunkLine] {
        &self.lines
    }

    /// The lines this hunk expects to find in the original: context and deletions, in order.
    pub fn old_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Delete(text) => Some(text.as_str()),
                HunkLine::Insert(_) => None,
            })
            .collect()
    }

    /// The lines this hunk leaves behind: context and insertions, in order.
    pub fn new_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                HunkLine::Context(text) | HunkLine::Insert(text) => Some(text.as_str()),
                HunkLine::Delete(_) => None,
            })
            .collect()
    }
}

/// A parsed unified diff. Line numbers in `@@` headers are ignored when applying: hunks are
/// anchored by their context lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnifiedDiff {
    hunks: Vec<Hunk>,
}

impl UnifiedDiff {
    pub fn parse(text: &str) -> Result<Self> {
        let text = with_file_header(text);
        let parsed = diffy::Patch::from_str(&text)
            .map_err(|err| Error::Patch(format!("invalid unified diff: {err}")))?;
        let hunks: Vec<Hunk> = parsed
            .hunks()
            .iter()
            .map(|hunk| {
                let old = hunk.old_range();
                let lines = hunk
                    .lines()
                    .iter()
                    .map(|line| match line {
                        diffy::Line::Context(text) => HunkLine::Context((*text).to_string()),
                        diffy::Line::Delete(text) => HunkLine::Delete((*text).to_string()),
                        diffy::Line::Insert(text) => HunkLine::Insert((*text).to_string()),
                    })
                    .collect();
                Hunk {
                    lines,
                    // An empty old range names the line *after which* the hunk inserts.
                    header_start: Some(if old.len() == 0 {
                        old.start()
                    } else {
                        old.start().saturating_sub(1)
                    }),
                }
            })
            .collect();
        Self::from_hunks(hunks)
    }

    pub fn from_hunks(hunks: Vec<Hunk>) -> Result<Self> {
        if hunks.is_empty() {
            return Err(Error::Patch("diff contains no hunks".to_string()));
        }
        if let Some(idx) = hunks.iter().position(|hunk| hunk.lines.is_empty()) {
            return Err(Error::Patch(format!("hunk {} is empty", idx + 1)));
        }
        Ok(Self { hunks })
    }

    /// Diff between two texts, as produced for previews and full-replace scope checks.
    pub fn between(original: &str, modified: &str) -> Result<Option<Self>> {
        if original == modified {
            return Ok(None);
        }
        let text = diffy::create_patch(original, modified).to_string();
        Self::parse(&text).map(Some)
    }

    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }
}

/// Drop extended headers (`diff --git`, `index ...`) ahead of the file header and synthesize a
/// `---`/`+++` pair for bare hunk lists.
fn with_file_header(text: &str) -> String {
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        if line.starts_with("--- ") {
            return text[offset..].to_string();
        }
        if line.starts_with("@@") {
            return format!("--- original\n+++ modified\n{}", &text[offset..]);
        }
        offset += line.len();
    }
    text.to_string()
}

impl FromStr for UnifiedDiff {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        Self::parse(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_keeps_line_terminators() {
        let text = diffy::create_patch("a\nb\nc\n", "a\nB\nc\n").to_string();
        let diff = UnifiedDiff::parse(&text).expect("parse");
        assert_eq!(diff.hunks().len(), 1);
        let hunk = &diff.hunks()[0];
        assert_eq!(hunk.old_side(), vec!["a\n", "b\n", "c\n"]);
        assert_eq!(hunk.new_side(), vec!["a\n", "B\n", "c\n"]);
    }

    #[test]
    fn parse_rejects_text_without_hunks() {
        let err = UnifiedDiff::parse("--- a\n+++ b\n").expect_err("no hunks");
        assert!(matches!(err, Error::Patch(_)), "unexpected error: {err:?}");
    }

    #[test]
    fn parse_accepts_bare_hunks_and_git_headers() {
        let bare = "@@ -1,2 +1,2 @@\n a\n-b\n+c\n";
        let diff = UnifiedDiff::parse(bare).expect("bare hunk");
        assert_eq!(diff.hunks()[0].header_start(), Some(0));

        let git = format!("diff --git a/x b/x\nindex 1..2 100644\n--- a/x\n+++ b/x\n{bare}");
        assert_eq!(UnifiedDiff::parse(&git).expect("git diff"), diff);
    }

    #[test]
    fn between_identical_texts_is_none() {
        assert!(UnifiedDiff::between("x\n", "x\n").expect("diff").is_none());
    }
}
