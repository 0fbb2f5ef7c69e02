use std::fs;
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

fn fs_err(path: &Path, e: std::io::Error) -> Error {
    let errno = e.raw_os_error();
    let mut err = Error::new(ErrorKind::Filesystem, format!("{}: {e}", path.display()));
    err.errno = errno;
    err
}

/// Recursively ensure a directory exists.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| fs_err(path, e))
}

/// Read a file to string, returning a descriptive error on failure.
pub fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| fs_err(path, e))
}

/// Write contents to a file, creating parent directories if needed.
pub fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, contents).map_err(|e| fs_err(path, e))
}

/// Read `path` and trim the trailing newline kernel files carry.
pub fn read_knob_file(path: &Path) -> Result<String> {
    Ok(read_to_string(path)?.trim_end_matches('\n').to_string())
}
