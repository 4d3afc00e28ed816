//! Path utilities shared by path evaluation and the backup layout.
//!
//! Everything here is **lexical**: nothing touches the filesystem or resolves symlinks.
//!
//! Invariants of `normalize_path_lexical`:
//! - Removes `.` segments.
//! - Resolves `..` against preceding *normal* segments when possible.
//! - Preserves leading `..` for relative paths (e.g. `../../a/../b` → `../../b`).
//! - For absolute paths, `..` cannot escape the filesystem root (e.g. `/../etc` → `/etc`).
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use globset::GlobBuilder;

pub(crate) fn normalize_path_lexical(path: &Path) -> PathBuf {
    #[derive(Debug)]
    enum Segment {
        ParentDir,
        Normal(OsString),
    }

    let mut path_prefix: Option<OsString> = None;
    let mut has_root = false;
    let mut segments: Vec<Segment> = Vec::new();

    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(segments.last(), Some(Segment::Normal(_))) {
                    segments.pop();
                } else if !has_root {
                    segments.push(Segment::ParentDir);
                }
            }
            Component::Normal(part) => segments.push(Segment::Normal(part.to_os_string())),
            Component::RootDir => {
                has_root = true;
            }
            Component::Prefix(prefix_comp) => {
                path_prefix = Some(prefix_comp.as_os_str().to_os_string());
            }
        }
    }

    let mut out = PathBuf::new();
    if let Some(prefix) = path_prefix {
        out.push(Path::new(&prefix));
    }
    if has_root {
        if out.as_os_str().is_empty() {
            out.push(std::path::MAIN_SEPARATOR.to_string());
        } else {
            // Pushing `RootDir` after a Windows `Prefix` would drop the prefix.
            out.as_mut_os_string()
                .push(std::path::MAIN_SEPARATOR.to_string());
        }
    }
    for segment in segments {
        match segment {
            Segment::ParentDir => out.push(".."),
            Segment::Normal(part) => out.push(part),
        }
    }

    if out.as_os_str().is_empty() && path.is_relative() {
        PathBuf::from(".")
    } else {
        out
    }
}

#[cfg(windows)]
fn components_eq(a: Component<'_>, b: Component<'_>) -> bool {
    a.as_os_str()
        .to_string_lossy()
        .eq_ignore_ascii_case(&b.as_os_str().to_string_lossy())
}

#[cfg(not(windows))]
fn components_eq(a: Component<'_>, b: Component<'_>) -> bool {
    a == b
}

/// Component-wise `Path::starts_with` on lexically normalized inputs.
///
/// Case-insensitive on Windows; equivalent to `Path::starts_with` elsewhere.
pub fn is_descendant_or_self(path: &Path, ancestor: &Path) -> bool {
    strip_prefix_lexical(path, ancestor).is_some()
}

/// Component-wise `Path::strip_prefix` on lexically normalized inputs.
pub fn strip_prefix_lexical(path: &Path, prefix: &Path) -> Option<PathBuf> {
    let path = normalize_path_lexical(path);
    let prefix = normalize_path_lexical(prefix);
    let mut path_components = path.components();
    for prefix_comp in prefix.components() {
        let path_comp = path_components.next()?;
        if !components_eq(path_comp, prefix_comp) {
            return None;
        }
    }
    Some(path_components.as_path().to_path_buf())
}

/// Expand a leading `~` against `home`. Other paths are returned unchanged.
pub(crate) fn expand_tilde(path: &Path, home: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => home.join(components.as_path()),
        _ => path.to_path_buf(),
    }
}

/// The path with any root or prefix removed, suitable for mirroring under another directory.
///
/// Returns `None` when nothing but `.`/root components remain or when `..` is present.
pub(crate) fn mirrored_relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(prefix) => {
                let raw = prefix.as_os_str().to_string_lossy();
                let cleaned: String = raw
                    .chars()
                    .filter(|ch| ch.is_ascii_alphanumeric())
                    .collect();
                if !cleaned.is_empty() {
                    out.push(cleaned);
                }
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => return None,
            Component::Normal(part) => out.push(part),
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

pub(crate) fn build_glob(pattern: &str) -> std::result::Result<globset::Glob, globset::Error> {
    let mut builder = GlobBuilder::new(pattern);
    builder.literal_separator(true);
    #[cfg(windows)]
    builder.case_insensitive(true);
    builder.build()
}

/// Path rendered with `/` separators for glob matching.
pub(crate) fn to_slash(path: &Path) -> String {
    let raw = path.to_string_lossy();
    #[cfg(windows)]
    {
        raw.replace('\\', "/")
    }
    #[cfg(not(windows))]
    {
        raw.into_owned()
    }
}
