//! Crash-safe file writes
//!
//! Every write lands in a uniquely named temporary file in the target's
//! directory and is renamed over the target once complete. If anything fails
//! the temporary file is removed and the target is left as it was.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use tempfile::{Builder, TempDir};

const TEMP_PREFIX: &str = ".rivet-tmp-";

/// Atomically replace `path` with `contents`
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_atomic_with(path, |file| file.write_all(contents))
}

/// Atomically replace `path` with whatever `write` produces.
///
/// The parent directory must already exist.
pub fn write_atomic_with<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    // Dropping the NamedTempFile on any error path deletes it.
    let mut temp = Builder::new().prefix(TEMP_PREFIX).tempfile_in(parent)?;
    write(temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Atomically copy `src` to `dest`, creating parent directories of `dest`.
///
/// Returns the number of bytes copied.
pub fn copy_atomic(src: &Path, dest: &Path) -> io::Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut source = File::open(src)?;
    let mut copied = 0;
    write_atomic_with(dest, |file| {
        copied = io::copy(&mut source, file)?;
        Ok(())
    })?;
    Ok(copied)
}

/// Create a uniquely named directory in `parent` that is removed on drop
/// unless it has been renamed away
pub fn staging_dir(parent: &Path) -> io::Result<TempDir> {
    Builder::new().prefix(TEMP_PREFIX).tempdir_in(parent)
}

/// Whether a file name belongs to an abandoned temporary file
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX)
}
