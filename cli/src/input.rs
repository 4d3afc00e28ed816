use std::fs::File;
use std::io::Read;
use std::path::Path;

use safefs::Error;

/// Content and patch inputs share the library's hard cap on write sizes.
const HARD_MAX_INPUT_BYTES: u64 = 256 * 1024 * 1024;

fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::IoPath {
        op,
        path: path.to_path_buf(),
        source,
    }
}

fn symlink_refused(path: &Path) -> Error {
    Error::InvalidPath(format!(
        "input {} is a symlink; pass the target path instead",
        path.display()
    ))
}

/// Open `path` for reading without following a final symlink.
#[cfg(unix)]
fn open_input(path: &Path) -> Result<File, Error> {
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(path)
        .map_err(|err| {
            if err.raw_os_error() == Some(libc::ELOOP) {
                symlink_refused(path)
            } else {
                io_error("open", path, err)
            }
        })
}

/// Open `path` for reading, refusing a final symlink.
///
/// Without `O_NOFOLLOW` the link check and the open are two steps.
#[cfg(not(unix))]
fn open_input(path: &Path) -> Result<File, Error> {
    let meta = std::fs::symlink_metadata(path).map_err(|err| io_error("stat", path, err))?;
    if meta.file_type().is_symlink() {
        return Err(symlink_refused(path));
    }
    File::open(path).map_err(|err| io_error("open", path, err))
}

fn too_large(path: &Path, size_bytes: u64, max_bytes: u64) -> Error {
    Error::TooLarge {
        path: path.to_path_buf(),
        size_bytes,
        max_bytes,
    }
}

/// Read a text input (`-` for stdin) of at most `max_bytes`.
pub(crate) fn load_text_limited(path: &Path, max_bytes: u64) -> Result<String, Error> {
    if max_bytes == 0 || max_bytes > HARD_MAX_INPUT_BYTES {
        return Err(Error::InvalidPolicy(format!(
            "input limit must be within 1..={HARD_MAX_INPUT_BYTES} bytes"
        )));
    }

    // One byte past the limit tells "exactly at the limit" apart from "over it".
    let probe = max_bytes + 1;
    let mut bytes = Vec::new();
    let mut declared_size = 0;
    if path.as_os_str() == "-" {
        std::io::stdin()
            .take(probe)
            .read_to_end(&mut bytes)
            .map_err(|err| io_error("read_stdin", path, err))?;
    } else {
        let file = open_input(path)?;
        let meta = file
            .metadata()
            .map_err(|err| io_error("metadata", path, err))?;
        if !meta.is_file() {
            return Err(Error::InvalidPath(format!(
                "input {} is not a regular file",
                path.display()
            )));
        }
        declared_size = meta.len();
        if declared_size > max_bytes {
            return Err(too_large(path, declared_size, max_bytes));
        }
        file.take(probe)
            .read_to_end(&mut bytes)
            .map_err(|err| io_error("read", path, err))?;
    }

    let read_size = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
    if read_size > max_bytes {
        // The file grew between stat and read, or stdin ran past the limit.
        return Err(too_large(path, read_size.max(declared_size), max_bytes));
    }
    String::from_utf8(bytes).map_err(|_| Error::InvalidUtf8(path.to_path_buf()))
}
