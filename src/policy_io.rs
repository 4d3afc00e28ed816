use std::io::Read;
use std::path::{Path, PathBuf};

use crate::policy::{POLICY_FILE_NAME, config_home};
use crate::{Error, Result, SafeFsPolicy};

const DEFAULT_MAX_POLICY_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFormat {
    Toml,
    Json,
}

pub fn parse_policy(raw: &str, format: PolicyFormat) -> Result<SafeFsPolicy> {
    let policy: SafeFsPolicy = match format {
        PolicyFormat::Json => serde_json::from_str(raw)
            .map_err(|err| Error::InvalidPolicy(format!("invalid json policy: {err}")))?,
        PolicyFormat::Toml => toml::from_str(raw)
            .map_err(|err| Error::InvalidPolicy(format!("invalid toml policy: {err}")))?,
    };
    policy.validate()?;
    Ok(policy)
}

/// `<config_home>/safefs.toml`.
pub fn default_policy_path() -> Result<PathBuf> {
    Ok(config_home()?.join(POLICY_FILE_NAME))
}

/// The policy at [`default_policy_path`], or the built-in default when no file exists there.
pub fn load_default_policy() -> Result<SafeFsPolicy> {
    let path = default_policy_path()?;
    match std::fs::symlink_metadata(&path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no policy file; using defaults");
            Ok(SafeFsPolicy::default())
        }
        _ => load_policy(&path),
    }
}

pub fn load_policy(path: impl AsRef<Path>) -> Result<SafeFsPolicy> {
    load_policy_limited(path, DEFAULT_MAX_POLICY_BYTES)
}

/// Load and validate a policy file from disk with a byte limit.
///
/// Format detection is by file extension:
/// - `.json` => JSON
/// - `.toml` or no extension => TOML
///
/// Symlinks and non-regular files are refused, so a FIFO planted at the policy path cannot
/// block startup.
pub fn load_policy_limited(path: impl AsRef<Path>, max_bytes: u64) -> Result<SafeFsPolicy> {
    if max_bytes == 0 {
        return Err(Error::InvalidPolicy(
            "max policy bytes must be > 0".to_string(),
        ));
    }

    let path = path.as_ref();
    let meta =
        std::fs::symlink_metadata(path).map_err(|err| Error::io_path("metadata", path, err))?;
    if meta.file_type().is_symlink() {
        return Err(Error::InvalidPath(format!(
            "policy path {} is a symlink",
            path.display()
        )));
    }
    if !meta.is_file() {
        return Err(Error::InvalidPath(format!(
            "policy path {} is not a regular file",
            path.display()
        )));
    }

    let mut bytes = Vec::<u8>::new();
    std::fs::File::open(path)
        .map_err(|err| Error::io_path("open", path, err))?
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|err| Error::io_path("read", path, err))?;

    let size_bytes = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
    if size_bytes > max_bytes {
        return Err(Error::TooLarge {
            path: path.to_path_buf(),
            size_bytes,
            max_bytes,
        });
    }

    let raw = std::str::from_utf8(&bytes).map_err(|_| Error::InvalidUtf8(path.to_path_buf()))?;
    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => PolicyFormat::Json,
        Some("toml") | None => PolicyFormat::Toml,
        Some(other) => {
            return Err(Error::InvalidPolicy(format!(
                "unsupported policy format {other:?}; expected .toml or .json"
            )));
        }
    };
    let policy = parse_policy(raw, format)?;
    tracing::debug!(
        path = %path.display(),
        rules = policy.allow.len(),
        "policy loaded"
    );
    Ok(policy)
}
