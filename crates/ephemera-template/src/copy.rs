//! Recursive copy of template data into workspace and mount directories.
//!
//! Regular files keep their permissions; symlinks are recreated pointing at
//! the same target rather than followed.

use std::fs;
use std::path::Path;

use ephemera_common::error::{EphemeraError, Result};

/// Copies `src` (file, directory or symlink) to `dst`, creating parents.
///
/// # Errors
///
/// Returns an I/O error naming the path that failed.
pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(src).map_err(|e| EphemeraError::io(src, e))?;

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| EphemeraError::io(parent, e))?;
    }

    if metadata.file_type().is_symlink() {
        copy_symlink(src, dst)
    } else if metadata.is_dir() {
        copy_dir(src, dst)
    } else {
        let _ = fs::copy(src, dst).map_err(|e| EphemeraError::io(dst, e))?;
        Ok(())
    }
}

/// Copies the contents of directory `src` into `dst`.
///
/// # Errors
///
/// Returns an I/O error naming the path that failed.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::metadata(src).map_err(|e| EphemeraError::io(src, e))?;
    fs::create_dir_all(dst).map_err(|e| EphemeraError::io(dst, e))?;
    fs::set_permissions(dst, metadata.permissions()).map_err(|e| EphemeraError::io(dst, e))?;

    let entries = fs::read_dir(src).map_err(|e| EphemeraError::io(src, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| EphemeraError::io(src, e))?;
        copy_path(&entry.path(), &dst.join(entry.file_name()))?;
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src).map_err(|e| EphemeraError::io(src, e))?;
    std::os::unix::fs::symlink(&target, dst).map_err(|e| EphemeraError::io(dst, e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let _ = fs::copy(src, dst).map_err(|e| EphemeraError::io(dst, e))?;
    Ok(())
}
