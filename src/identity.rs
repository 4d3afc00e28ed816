use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Who is calling: effective uid, username, and home directory.
///
/// Read once at startup via [`Identity::current`] and then passed around by value. Never cache
/// an `Identity` across a privilege change; build a new one instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    uid: u32,
    username: String,
    home: PathBuf,
}

impl Identity {
    pub fn new(uid: u32, username: impl Into<String>, home: impl Into<PathBuf>) -> Self {
        Self {
            uid,
            username: username.into(),
            home: home.into(),
        }
    }

    /// Identity of the current process.
    pub fn current() -> Result<Self> {
        let uid = effective_uid()?;
        let home = directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .ok_or_else(|| Error::Identity("home directory is unknown".to_string()))?;
        let username = ["USER", "LOGNAME", "USERNAME"]
            .iter()
            .find_map(|key| std::env::var(key).ok().filter(|value| !value.is_empty()))
            .unwrap_or_else(|| format!("uid-{uid}"));
        Ok(Self::new(uid, username, home))
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

#[cfg(unix)]
fn effective_uid() -> Result<u32> {
    // Safety: `geteuid` has no preconditions and cannot fail.
    Ok(unsafe { libc::geteuid() })
}

#[cfg(not(unix))]
fn effective_uid() -> Result<u32> {
    Err(Error::Identity(
        "effective uid is unavailable on this platform".to_string(),
    ))
}
