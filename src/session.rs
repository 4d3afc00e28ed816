use std::path::{Path, PathBuf};

use crate::identity::Identity;
use crate::policy::AccessMode;

const PROJECT_MARKER: &str = ".git";

/// Per-session context threaded into every SafeFs call.
///
/// Holds the caller identity, the working directory used for relative paths, and the project
/// root together with the access mode granted inside it. The mode is fixed for the lifetime of
/// the session.
#[derive(Debug, Clone)]
pub struct Session {
    identity: Identity,
    cwd: PathBuf,
    project_root: PathBuf,
    project_mode: AccessMode,
}

impl Session {
    /// Build a session whose project root is the nearest ancestor of `cwd` containing a `.git`
    /// marker, or `cwd` itself when there is none.
    pub fn discover(identity: Identity, cwd: impl Into<PathBuf>, project_mode: AccessMode) -> Self {
        let cwd = cwd.into();
        let project_root = find_project_root(&cwd).unwrap_or_else(|| cwd.clone());
        Self {
            identity,
            cwd,
            project_root,
            project_mode,
        }
    }

    pub fn with_project_root(
        identity: Identity,
        cwd: impl Into<PathBuf>,
        project_root: impl Into<PathBuf>,
        project_mode: AccessMode,
    ) -> Self {
        Self {
            identity,
            cwd: cwd.into(),
            project_root: project_root.into(),
            project_mode,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn project_mode(&self) -> AccessMode {
        self.project_mode
    }
}

/// Walk upward from `start` looking for a repository marker.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    start
        .ancestors()
        .find(|dir| dir.join(PROJECT_MARKER).exists())
        .map(Path::to_path_buf)
}
