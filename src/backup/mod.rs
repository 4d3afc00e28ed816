//! Versioned backups of prior file content.
//!
//! Every original path gets its own directory under the backup root. Backups are immutable once
//! written and are only ever removed by retention thinning.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::io;
use crate::path_utils;
use crate::policy::{RetentionPolicy, SafeFsPolicy};

mod layout;
pub mod retention;

const MAX_CREATE_ATTEMPTS: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupReason {
    PreWrite,
    PrePatch,
    PreRevert,
}

impl BackupReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreWrite => "pre_write",
            Self::PrePatch => "pre_patch",
            Self::PreRevert => "pre_revert",
        }
    }
}

/// A stored backup. Identified by `(original, created_at, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub original: PathBuf,
    /// Location of the `.bak` file holding the prior bytes.
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub sequence: u64,
    /// `None` when the sidecar is missing or unreadable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<BackupReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    pub size_bytes: u64,
}

impl Backup {
    pub(crate) fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.sequence)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

/// What a write recorded about the content it replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackupOutcome {
    Created(Backup),
    /// The target did not exist, so there was nothing to back up.
    NoPriorContent,
}

impl BackupOutcome {
    pub fn backup(&self) -> Option<&Backup> {
        match self {
            Self::Created(backup) => Some(backup),
            Self::NoPriorContent => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackupMeta {
    original: PathBuf,
    created_at: DateTime<Utc>,
    sequence: u64,
    reason: BackupReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<u32>,
    size_bytes: u64,
}

#[derive(Debug)]
pub struct BackupStore {
    root: PathBuf,
    retention: RetentionPolicy,
    thin_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("backup store lock was poisoned; recovering");
        poisoned.into_inner()
    })
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>, retention: RetentionPolicy) -> Self {
        Self {
            root: root.into(),
            retention,
            thin_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_policy(policy: &SafeFsPolicy) -> Result<Self> {
        Ok(Self::new(
            policy.backups.resolve_dir()?,
            policy.retention.clone(),
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Back up the current content of `original`.
    pub fn backup(&self, original: &Path, reason: BackupReason) -> Result<BackupOutcome> {
        self.backup_at(original, reason, Utc::now())
    }

    pub fn backup_at(
        &self,
        original: &Path,
        reason: BackupReason,
        now: DateTime<Utc>,
    ) -> Result<BackupOutcome> {
        let bytes = match fs::read(original) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BackupOutcome::NoPriorContent);
            }
            Err(err) => return Err(Error::backup_io("read_original", original, err)),
        };
        let mode = original_mode(original);
        self.store_at(original, &bytes, mode, reason, now)
            .map(BackupOutcome::Created)
    }

    /// Persist `bytes` as a new backup of `original`.
    ///
    /// The sidecar lands first, then the `.bak` is created without replacing anything, so a
    /// crash never leaves a partial backup that `restore` could return.
    pub(crate) fn store_at(
        &self,
        original: &Path,
        bytes: &[u8],
        mode: Option<u32>,
        reason: BackupReason,
        now: DateTime<Utc>,
    ) -> Result<Backup> {
        let dir = layout::backup_dir(&self.root, original)?;
        io::create_private_dir_all(&dir).map_err(|err| Error::backup_io("create_dir", &dir, err))?;

        let size_bytes = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        let mut sequence = self.next_sequence(&dir)?;
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let path = dir.join(layout::backup_file_name(now, sequence));
            let meta_path = layout::meta_path_for(&path);
            let meta = BackupMeta {
                original: original.to_path_buf(),
                created_at: now,
                sequence,
                reason,
                mode,
                size_bytes,
            };
            let meta_bytes = serde_json::to_vec_pretty(&meta)?;

            match io::create_private_file(&meta_path, &meta_bytes) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    sequence += 1;
                    continue;
                }
                Err(err) => return Err(Error::backup_io("write_sidecar", &meta_path, err)),
            }
            match io::create_private_file(&path, bytes) {
                Ok(()) => {}
                Err(err) => {
                    let _ = fs::remove_file(&meta_path);
                    if err.kind() == std::io::ErrorKind::AlreadyExists {
                        sequence += 1;
                        continue;
                    }
                    return Err(Error::backup_io("write_backup", &path, err));
                }
            }
            io::sync_parent_directory(&path)
                .map_err(|err| Error::backup_io("sync_dir", &dir, err))?;

            tracing::info!(
                original = %original.display(),
                backup = %path.display(),
                reason = reason.as_str(),
                size_bytes,
                "backup created"
            );
            return Ok(Backup {
                original: original.to_path_buf(),
                path,
                created_at: now,
                sequence,
                reason: Some(reason),
                mode,
                size_bytes,
            });
        }
        Err(Error::backup_io(
            "allocate_name",
            &dir,
            std::io::Error::from(std::io::ErrorKind::AlreadyExists),
        ))
    }

    fn next_sequence(&self, dir: &Path) -> Result<u64> {
        let max = scan(dir)?
            .into_iter()
            .map(|(_, _, sequence)| sequence)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// Full prior content of `backup`.
    pub fn restore(&self, backup: &Backup) -> Result<Vec<u8>> {
        if !path_utils::is_descendant_or_self(&backup.path, &self.root) {
            return Err(Error::BackupNotFound(backup.path.clone()));
        }
        match fs::read(&backup.path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::BackupNotFound(backup.path.clone()))
            }
            Err(err) => Err(Error::backup_io("read_backup", &backup.path, err)),
        }
    }

    /// Backups of `original`, newest first.
    pub fn list(&self, original: &Path) -> Result<Vec<Backup>> {
        let dir = layout::backup_dir(&self.root, original)?;
        let mut backups: Vec<Backup> = scan(&dir)?
            .into_iter()
            .map(|(path, created_at, sequence)| load_backup(original, path, created_at, sequence))
            .collect();
        backups.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
        Ok(backups)
    }

    /// Look up a backup of `original` by its file name.
    pub fn find(&self, original: &Path, file_name: &str) -> Result<Backup> {
        self.list(original)?
            .into_iter()
            .find(|backup| backup.file_name() == Some(file_name))
            .ok_or_else(|| {
                Error::BackupNotFound(
                    layout::backup_dir(&self.root, original)
                        .map(|dir| dir.join(file_name))
                        .unwrap_or_else(|_| PathBuf::from(file_name)),
                )
            })
    }

    /// Apply retention to the backups of `original`. Returns the deleted backups.
    pub fn thin(&self, original: &Path) -> Result<Vec<Backup>> {
        self.thin_at(original, Utc::now())
    }

    pub fn thin_at(&self, original: &Path, now: DateTime<Utc>) -> Result<Vec<Backup>> {
        let path_lock = {
            let mut locks = lock_recover(&self.thin_locks);
            Arc::clone(locks.entry(original.to_path_buf()).or_default())
        };
        let result = {
            let _guard = lock_recover(&path_lock);
            self.thin_locked(original, now)
        };

        // Clones are only taken under the map lock: the map's and ours means nobody waits.
        let mut locks = lock_recover(&self.thin_locks);
        if Arc::strong_count(&path_lock) == 2 {
            locks.remove(original);
        }
        result
    }

    fn thin_locked(&self, original: &Path, now: DateTime<Utc>) -> Result<Vec<Backup>> {
        let backups = self.list(original)?;
        let doomed = retention::plan(&backups, now, &self.retention);
        for backup in &doomed {
            remove_if_present(&backup.path)?;
            remove_if_present(&layout::meta_path_for(&backup.path))?;
        }
        if !doomed.is_empty() {
            tracing::debug!(
                original = %original.display(),
                deleted = doomed.len(),
                kept = backups.len() - doomed.len(),
                "thinned backups"
            );
        }
        Ok(doomed)
    }
}

/// `(path, created_at, sequence)` for every well-named `.bak` in `dir`.
fn scan(dir: &Path) -> Result<Vec<(PathBuf, DateTime<Utc>, u64)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::backup_io("read_dir", dir, err)),
    };
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| Error::backup_io("read_dir", dir, err))?;
        let name = entry.file_name();
        let Some((created_at, sequence)) =
            name.to_str().and_then(layout::parse_backup_file_name)
        else {
            continue;
        };
        found.push((entry.path(), created_at, sequence));
    }
    Ok(found)
}

fn load_backup(
    original: &Path,
    path: PathBuf,
    created_at: DateTime<Utc>,
    sequence: u64,
) -> Backup {
    let meta = fs::read(layout::meta_path_for(&path))
        .ok()
        .and_then(|raw| serde_json::from_slice::<BackupMeta>(&raw).ok());
    let size_bytes = match &meta {
        Some(meta) => meta.size_bytes,
        None => fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0),
    };
    Backup {
        original: original.to_path_buf(),
        path,
        created_at,
        sequence,
        reason: meta.as_ref().map(|meta| meta.reason),
        mode: meta.and_then(|meta| meta.mode),
        size_bytes,
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::backup_io("remove", path, err)),
    }
}

#[cfg(unix)]
fn original_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .ok()
        .map(|meta| meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn original_mode(_path: &Path) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn store(root: &Path) -> BackupStore {
        BackupStore::new(root, RetentionPolicy::default())
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, hour, 0, 0)
            .single()
            .expect("valid date")
    }

    #[test]
    fn thin_lock_entries_are_dropped_after_use() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("rc");
        std::fs::write(&original, "v1").expect("seed");
        let store = store(&dir.path().join("backups"));
        store
            .backup_at(&original, BackupReason::PreWrite, at(1, 8))
            .expect("backup");

        assert!(store.thin_at(&original, at(2, 8)).expect("thin").is_empty());
        assert!(store.thin_at(&dir.path().join("other"), at(2, 8)).expect("thin").is_empty());
        assert!(lock_recover(&store.thin_locks).is_empty());
    }

    #[test]
    fn missing_original_records_no_prior_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir.path().join("backups"));
        let outcome = store
            .backup(&dir.path().join("absent"), BackupReason::PreWrite)
            .expect("backup");
        assert_eq!(outcome, BackupOutcome::NoPriorContent);
    }

    #[test]
    fn backup_restore_and_list_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("rc");
        let store = store(&dir.path().join("backups"));

        std::fs::write(&original, "v1").expect("seed");
        let first = store
            .backup_at(&original, BackupReason::PreWrite, at(1, 8))
            .expect("first");
        std::fs::write(&original, "v2").expect("update");
        let second = store
            .backup_at(&original, BackupReason::PrePatch, at(1, 8))
            .expect("second");

        let first = first.backup().expect("created").clone();
        let second = second.backup().expect("created").clone();
        assert_eq!(first.sequence + 1, second.sequence);
        assert_eq!(store.restore(&first).expect("restore"), b"v1");
        assert_eq!(store.restore(&second).expect("restore"), b"v2");

        let listed = store.list(&original).expect("list");
        assert_eq!(listed, vec![second.clone(), first]);
        assert_eq!(listed[0].reason, Some(BackupReason::PrePatch));
        assert_eq!(
            store
                .find(&original, second.file_name().expect("name"))
                .expect("find"),
            second
        );
    }

    #[test]
    fn restore_of_deleted_backup_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("rc");
        let store = store(&dir.path().join("backups"));
        std::fs::write(&original, "v1").expect("seed");
        let backup = store
            .backup(&original, BackupReason::PreWrite)
            .expect("backup")
            .backup()
            .expect("created")
            .clone();
        std::fs::remove_file(&backup.path).expect("remove");
        let err = store.restore(&backup).expect_err("missing");
        assert!(matches!(err, Error::BackupNotFound(_)), "{err:?}");
    }

    #[test]
    #[cfg(unix)]
    fn backups_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("rc");
        let store = store(&dir.path().join("backups"));
        std::fs::write(&original, "secret").expect("seed");
        let backup = store
            .backup(&original, BackupReason::PreWrite)
            .expect("backup")
            .backup()
            .expect("created")
            .clone();

        let file_mode = std::fs::metadata(&backup.path)
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let parent = backup.path.parent().expect("parent");
        let dir_mode = std::fs::metadata(parent).expect("meta").permissions().mode();
        assert_eq!(dir_mode & 0o077, 0);
    }

    #[test]
    fn thin_removes_sidecars_with_backups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("rc");
        let store = store(&dir.path().join("backups"));
        std::fs::write(&original, "x").expect("seed");

        let old = at(1, 8) - Duration::days(200);
        let backup = store
            .backup_at(&original, BackupReason::PreWrite, old)
            .expect("backup")
            .backup()
            .expect("created")
            .clone();

        let deleted = store.thin_at(&original, at(1, 8)).expect("thin");
        assert_eq!(deleted, vec![backup.clone()]);
        assert!(!backup.path.exists());
        assert!(!layout::meta_path_for(&backup.path).exists());
        assert!(store.thin_at(&original, at(1, 8)).expect("again").is_empty());
    }
}
