//! Durable file primitives: no-follow reads, atomic replacement, no-clobber creation.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileIdentity {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
}

impl FileIdentity {
    fn from_metadata(meta: &fs::Metadata) -> Option<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;

            Some(Self {
                dev: meta.dev(),
                ino: meta.ino(),
            })
        }
        #[cfg(not(unix))]
        {
            let _ = meta;
            None
        }
    }
}

#[cfg(unix)]
const NEW_FILE_MODE: u32 = 0o644;

/// Current content of an existing target, captured under the path lock.
#[derive(Debug)]
pub(crate) struct Snapshot {
    pub(crate) bytes: Vec<u8>,
    pub(crate) identity: Option<FileIdentity>,
    pub(crate) permissions: fs::Permissions,
}

impl Snapshot {
    pub(crate) fn mode(&self) -> Option<u32> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            Some(self.permissions.mode() & 0o7777)
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

#[cfg(unix)]
fn is_symlink_open_error(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ELOOP)
}

#[cfg(not(unix))]
fn is_symlink_open_error(_err: &std::io::Error) -> bool {
    false
}

#[cfg(unix)]
fn open_readonly_nofollow(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = fs::OpenOptions::new();
    options
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK);
    options.open(path)
}

#[cfg(windows)]
fn open_readonly_nofollow(path: &Path) -> std::io::Result<fs::File> {
    use std::os::windows::fs::OpenOptionsExt;
    use windows_sys::Win32::Storage::FileSystem::FILE_FLAG_OPEN_REPARSE_POINT;

    let mut options = fs::OpenOptions::new();
    options
        .read(true)
        .custom_flags(FILE_FLAG_OPEN_REPARSE_POINT);
    options.open(path)
}

#[cfg(all(not(unix), not(windows)))]
fn open_readonly_nofollow(path: &Path) -> std::io::Result<fs::File> {
    fs::File::open(path)
}

/// Open a regular file without following a final symlink. `Ok(None)` when it does not exist.
fn open_regular_file(path: &Path) -> Result<Option<(fs::File, fs::Metadata)>> {
    let file = match open_readonly_nofollow(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) if is_symlink_open_error(&err) => {
            return Err(Error::InvalidPath(format!(
                "path {} became a symlink",
                path.display()
            )));
        }
        Err(err) => return Err(Error::io_path("open", path, err)),
    };
    let meta = file
        .metadata()
        .map_err(|err| Error::io_path("metadata", path, err))?;
    if !meta.is_file() {
        return Err(Error::InvalidPath(format!(
            "path {} is not a regular file",
            path.display()
        )));
    }
    Ok(Some((file, meta)))
}

/// Read an existing target for replacement, refusing anything larger than `max_bytes`.
pub(crate) fn read_snapshot(path: &Path, max_bytes: u64) -> Result<Option<Snapshot>> {
    let Some((file, meta)) = open_regular_file(path)? else {
        return Ok(None);
    };
    if meta.len() > max_bytes {
        return Err(too_large(path, meta.len(), max_bytes));
    }
    let bytes = read_limited(file, path, max_bytes)?;
    let read_size = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
    if read_size > max_bytes {
        return Err(too_large(path, read_size, max_bytes));
    }
    Ok(Some(Snapshot {
        bytes,
        identity: FileIdentity::from_metadata(&meta),
        permissions: meta.permissions(),
    }))
}

/// Read at most `max_bytes` from the start of `path`. Returns the bytes and the file size.
pub(crate) fn read_prefix(path: &Path, max_bytes: u64) -> Result<(Vec<u8>, u64)> {
    let Some((file, meta)) = open_regular_file(path)? else {
        return Err(Error::io_path(
            "open",
            path,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ));
    };
    let mut bytes = read_limited(file, path, max_bytes)?;
    let mut size = meta.len();
    if let Ok(limit) = usize::try_from(max_bytes)
        && bytes.len() > limit
    {
        size = size.max(u64::try_from(bytes.len()).unwrap_or(u64::MAX));
        bytes.truncate(limit);
    }
    Ok((bytes, size))
}

fn read_limited(file: fs::File, path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let mut bytes = Vec::<u8>::new();
    file.take(max_bytes.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|err| Error::io_path("read", path, err))?;
    Ok(bytes)
}

fn too_large(path: &Path, size_bytes: u64, max_bytes: u64) -> Error {
    Error::TooLarge {
        path: path.to_path_buf(),
        size_bytes,
        max_bytes,
    }
}

/// Atomically replace `path` with `bytes`.
///
/// With a `prior` snapshot the target must still be the same file (device/inode) and its
/// permissions carry over. Without one the target must not exist yet.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], prior: Option<&Snapshot>) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::InvalidPath(format!(
            "invalid path {}: missing parent directory",
            path.display()
        ))
    })?;

    if let Some(prior) = prior {
        let current =
            fs::symlink_metadata(path).map_err(|err| Error::write_io("metadata", path, err))?;
        if !current.is_file() {
            return Err(Error::InvalidPath(format!(
                "path {} is no longer a regular file",
                path.display()
            )));
        }
        match (prior.identity, FileIdentity::from_metadata(&current)) {
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(Error::InvalidPath(format!(
                    "path {} changed during operation",
                    path.display()
                )));
            }
            _ => {}
        }
    }

    let mut tmp_file = tempfile::Builder::new()
        .prefix(".safefs.")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|err| Error::write_io("create_temp", path, err))?;
    tmp_file
        .as_file_mut()
        .write_all(bytes)
        .map_err(|err| Error::write_io("write", path, err))?;
    tmp_file
        .as_file_mut()
        .sync_all()
        .map_err(|err| Error::write_io("sync", path, err))?;

    match prior {
        Some(prior) => {
            let tmp_path = tmp_file.into_temp_path();
            fs::set_permissions(&tmp_path, prior.permissions.clone())
                .map_err(|err| Error::write_io("set_permissions", path, err))?;
            rename_replace(tmp_path.as_ref(), path)
                .map_err(|err| Error::write_io("replace_file", path, err))?;
            // Already renamed into place.
            let _ = tmp_path.keep();
        }
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tmp_file
                    .as_file()
                    .set_permissions(fs::Permissions::from_mode(NEW_FILE_MODE))
                    .map_err(|err| Error::write_io("set_permissions", path, err))?;
            }
            tmp_file
                .persist_noclobber(path)
                .map_err(|err| Error::write_io("create_file", path, err.error))?;
            sync_parent_directory(path).map_err(|err| Error::write_io("sync_parent", path, err))?;
        }
    }
    Ok(())
}

/// Create `path` with `bytes`, private to the owner, failing if it already exists.
pub(crate) fn create_private_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp_file = tempfile::Builder::new()
        .prefix(".safefs.")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp_file
            .as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    tmp_file.as_file_mut().write_all(bytes)?;
    tmp_file.as_file_mut().sync_all()?;
    tmp_file.persist_noclobber(path).map_err(|err| err.error)?;
    Ok(())
}

/// `create_dir_all` with owner-only permissions on every directory it creates.
pub(crate) fn create_private_dir_all(dir: &Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

#[cfg(unix)]
pub(crate) fn sync_parent_directory(path: &Path) -> std::io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_parent_directory(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(windows)]
fn rename_replace(src_path: &Path, dest_path: &Path) -> std::io::Result<()> {
    use std::os::windows::ffi::OsStrExt;

    use windows_sys::Win32::Storage::FileSystem::{MOVEFILE_REPLACE_EXISTING, MoveFileExW};

    fn to_wide_null(p: &Path) -> Vec<u16> {
        let mut wide: Vec<u16> = p.as_os_str().encode_wide().collect();
        wide.push(0);
        wide
    }

    let src_w = to_wide_null(src_path);
    let dest_w = to_wide_null(dest_path);

    // `fs::rename` is not an atomic overwrite on every Windows version; MoveFileExW with
    // MOVEFILE_REPLACE_EXISTING is.
    //
    // Safety: both buffers are owned, NUL-terminated UTF-16 and outlive this synchronous call;
    // Win32 does not retain the pointers.
    let moved = unsafe { MoveFileExW(src_w.as_ptr(), dest_w.as_ptr(), MOVEFILE_REPLACE_EXISTING) };
    if moved == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(windows))]
fn rename_replace(src_path: &Path, dest_path: &Path) -> std::io::Result<()> {
    fs::rename(src_path, dest_path)?;
    sync_parent_directory(dest_path)
}
