//! Build-context archives.
//!
//! A build context is a plain tar of the image workspace directory, with
//! entries relative to that directory.

use std::io::Read;
use std::path::Path;

use ephemera_common::error::{EphemeraError, Result};

/// Packs the contents of `dir` into an in-memory tar archive.
///
/// # Errors
///
/// Returns an error if the directory cannot be walked or read.
pub fn build_context(dir: &Path) -> Result<Vec<u8>> {
    tracing::debug!(dir = %dir.display(), "packing build context");

    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .map_err(|e| EphemeraError::io(dir, e))?;
    builder.into_inner().map_err(|e| EphemeraError::io(dir, e))
}

/// Lists the regular file paths of a build context, relative to its root.
///
/// # Errors
///
/// Returns an error if the archive is malformed.
pub fn list_files(context: &[u8]) -> Result<Vec<String>> {
    let mut archive = tar::Archive::new(context);
    let entries = archive
        .entries()
        .map_err(|e| EphemeraError::io("<build context>", e))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EphemeraError::io("<build context>", e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| EphemeraError::io("<build context>", e))?;
        files.push(normalize(&path));
    }
    files.sort();
    Ok(files)
}

/// Reads one file of a build context as UTF-8 text.
///
/// # Errors
///
/// Returns an error if the archive is malformed or the file is not UTF-8.
pub fn read_file(context: &[u8], name: &str) -> Result<Option<String>> {
    let mut archive = tar::Archive::new(context);
    let entries = archive
        .entries()
        .map_err(|e| EphemeraError::io("<build context>", e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| EphemeraError::io("<build context>", e))?;
        let path = entry
            .path()
            .map_err(|e| EphemeraError::io("<build context>", e))?;
        if normalize(&path) != name {
            continue;
        }
        let mut text = String::new();
        let _ = entry
            .read_to_string(&mut text)
            .map_err(|e| EphemeraError::io(name, e))?;
        return Ok(Some(text));
    }
    Ok(None)
}

fn normalize(path: &Path) -> String {
    let text = path.to_string_lossy();
    text.trim_start_matches("./").to_owned()
}
