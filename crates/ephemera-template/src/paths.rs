//! Template name resolution and path confinement.

use std::path::{Component, Path, PathBuf};

use ephemera_common::constants::{TEMPLATE_DATA_SUFFIX, TEMPLATE_EXTENSION};
use ephemera_common::error::{EphemeraError, Result};

/// Location of a template script and its data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplatePaths {
    /// Normalized template name, e.g. `db/mongo`.
    pub name: String,
    /// Script file, `<root>/<name>.tpl.rhai`.
    pub script: PathBuf,
    /// Data directory, `<root>/<name>.tpl.data`. May not exist.
    pub data_dir: PathBuf,
}

/// Resolves a template name against the template root.
///
/// Leading slashes are ignored. Names containing `..` are refused, as is
/// anything that would resolve outside `root`.
///
/// # Errors
///
/// Returns `EphemeraError::Template` for refused names.
pub fn resolve(root: &Path, name: &str) -> Result<TemplatePaths> {
    let invalid = |message: &str| EphemeraError::Template {
        template: name.to_owned(),
        message: message.to_owned(),
    };

    let trimmed = name.trim();
    if trimmed.contains("..") {
        return Err(invalid("template name must not contain '..'"));
    }
    let relative = trimmed.trim_start_matches('/');
    if relative.is_empty() {
        return Err(invalid("template name is empty"));
    }

    let script = confine(&root.join(format!("{relative}{TEMPLATE_EXTENSION}")), root)
        .map_err(|_| invalid("template resolves outside of the template directory"))?;
    let data_dir = root.join(format!("{relative}{TEMPLATE_DATA_SUFFIX}"));

    Ok(TemplatePaths {
        name: relative.to_owned(),
        script,
        data_dir,
    })
}

/// Lexically normalizes `path` and checks that it stays within `base`.
///
/// Neither path has to exist. Symlinks are not followed.
///
/// # Errors
///
/// Returns `EphemeraError::InvalidPath` if the normalized path escapes `base`.
pub fn confine(path: &Path, base: &Path) -> Result<PathBuf> {
    let escaped = || EphemeraError::InvalidPath {
        path: path.to_path_buf(),
        base: base.to_path_buf(),
    };

    let normalized = normalize(path).ok_or_else(escaped)?;
    let base = normalize(base).ok_or_else(escaped)?;
    if normalized.starts_with(&base) {
        Ok(normalized)
    } else {
        Err(escaped())
    }
}

/// Joins a script-supplied relative path onto `base`, confined to `base`.
///
/// # Errors
///
/// Returns `EphemeraError::InvalidPath` if the result escapes `base`.
pub fn join_confined(base: &Path, relative: &str) -> Result<PathBuf> {
    confine(&base.join(relative.trim_start_matches('/')), base)
}

fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}
