//! On-disk naming for backups.
//!
//! `<root>/<mirrored original path>/<YYYYmmddTHHMMSS.ffffffZ>-<seq>.bak`, each with a
//! `<same name>.meta.json` sidecar. Names sort lexically in creation order.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Error, Result};
use crate::path_utils;

pub(crate) const BACKUP_EXT: &str = ".bak";
pub(crate) const META_EXT: &str = ".meta.json";
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// Directory holding every backup of `original`.
pub(crate) fn backup_dir(root: &Path, original: &Path) -> Result<PathBuf> {
    let mirrored = path_utils::mirrored_relative(original).ok_or_else(|| {
        Error::InvalidPath(format!(
            "cannot derive a backup directory for {}",
            original.display()
        ))
    })?;
    Ok(root.join(mirrored))
}

pub(crate) fn file_stem(created_at: DateTime<Utc>, sequence: u64) -> String {
    format!("{}-{sequence:06}", created_at.format(STAMP_FORMAT))
}

pub(crate) fn backup_file_name(created_at: DateTime<Utc>, sequence: u64) -> String {
    format!("{}{BACKUP_EXT}", file_stem(created_at, sequence))
}

pub(crate) fn meta_path_for(backup_path: &Path) -> PathBuf {
    let mut raw = backup_path.as_os_str().to_os_string();
    raw.push(META_EXT);
    PathBuf::from(raw)
}

/// Parse `<stamp>-<seq>.bak`. Anything else in a backup directory is ignored.
pub(crate) fn parse_backup_file_name(name: &str) -> Option<(DateTime<Utc>, u64)> {
    let stem = name.strip_suffix(BACKUP_EXT)?;
    let (stamp, sequence) = stem.rsplit_once('-')?;
    if sequence.is_empty() || !sequence.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let sequence = sequence.parse::<u64>().ok()?;
    let created_at = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()?
        .and_utc();
    Some((created_at, sequence))
}
