use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Exclusive per-path locks for the backup-then-commit critical section.
///
/// Waiters block on a shared condvar; unrelated paths never contend beyond the brief map access.
#[derive(Debug, Default)]
pub(crate) struct PathLocks {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

pub(crate) struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: PathBuf,
}

impl PathLocks {
    fn held(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.held.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("path lock table was poisoned; recovering");
            poisoned.into_inner()
        })
    }

    pub(crate) fn acquire(&self, path: &Path) -> PathGuard<'_> {
        let mut held = self.held();
        while held.contains(path) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        held.insert(path.to_path_buf());
        PathGuard {
            locks: self,
            path: path.to_path_buf(),
        }
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held();
        held.remove(&self.path);
        drop(held);
        self.locks.released.notify_all();
    }
}
