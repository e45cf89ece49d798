//! Listing of available templates and their self-documentation.
//!
//! A script may define `info()` returning a map such as
//! `#{ description: "...", parameters: #{ port: #{ description: "...", "type": "int", mandatory: true } } }`.
//! The function runs in the same sandbox as `execute`, without a builder.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use ephemera_common::constants::TEMPLATE_EXTENSION;
use ephemera_common::error::{EphemeraError, Result};
use rhai::{Dynamic, Scope};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::paths;
use crate::sandbox;

const INFO_FN: &str = "info";

/// Documentation of one template parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterInfo {
    /// Free-form description.
    pub description: String,
    /// Expected type, as documented by the template.
    #[serde(rename = "type")]
    pub kind: String,
    /// Whether `execute` fails without it.
    pub mandatory: bool,
}

/// Documentation of one template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInfo {
    /// Template name relative to the template root.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Documented parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterInfo>,
    /// Files of the template data directory, relative to it.
    #[serde(default)]
    pub data_files: Vec<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawInfo {
    description: String,
    parameters: BTreeMap<String, ParameterInfo>,
}

/// Lists every template under `root`, sorted by name.
///
/// Templates whose `info()` fails are still listed, with the failure as
/// description.
///
/// # Errors
///
/// Returns an I/O error if `root` cannot be walked.
pub fn list_templates(root: &Path) -> Result<Vec<TemplateInfo>> {
    let mut scripts = Vec::new();
    walk(root, &mut scripts)?;
    let mut templates: Vec<_> = scripts
        .iter()
        .filter_map(|script| template_name(root, script))
        .map(|name| match template_info(root, &name) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(template = %name, error = %e, "cannot read template info");
                TemplateInfo {
                    description: format!("<{e}>"),
                    name,
                    ..TemplateInfo::default()
                }
            }
        })
        .collect();
    templates.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(templates)
}

/// Reads the documentation of template `name`.
///
/// # Errors
///
/// Returns `EphemeraError::Template` if the script cannot be loaded or its
/// `info()` fails or returns something other than a map.
pub fn template_info(root: &Path, name: &str) -> Result<TemplateInfo> {
    let paths = paths::resolve(root, name)?;
    let failed = |message: String| EphemeraError::Template {
        template: name.to_owned(),
        message,
    };
    let script = fs::read_to_string(&paths.script)
        .map_err(|e| failed(format!("cannot read {}: {e}", paths.script.display())))?;

    let engine = sandbox::new_engine(CancellationToken::new());
    let ast = engine
        .compile(&script)
        .map_err(|e| failed(format!("script error: {e}")))?;

    let raw = if ast.iter_functions().any(|f| f.name == INFO_FN && f.params.is_empty()) {
        let value = engine
            .call_fn::<Dynamic>(&mut Scope::new(), &ast, INFO_FN, ())
            .map_err(|e| failed(e.to_string()))?;
        rhai::serde::from_dynamic::<RawInfo>(&value)
            .map_err(|e| failed(format!("invalid info: {e}")))?
    } else {
        RawInfo::default()
    };

    Ok(TemplateInfo {
        name: paths.name,
        description: raw.description,
        parameters: raw.parameters,
        data_files: data_files(&paths.data_dir)?,
    })
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| EphemeraError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| EphemeraError::io(dir, e))?.path();
        if path.is_dir() {
            walk(&path, out)?;
        } else if path.to_string_lossy().ends_with(TEMPLATE_EXTENSION) {
            out.push(path);
        }
    }
    Ok(())
}

fn template_name(root: &Path, script: &Path) -> Option<String> {
    let relative = script.strip_prefix(root).ok()?.to_string_lossy().replace('\\', "/");
    relative.strip_suffix(TEMPLATE_EXTENSION).map(str::to_owned)
}

fn data_files(data_dir: &Path) -> Result<Vec<PathBuf>> {
    if !data_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    walk_files(data_dir, &mut files)?;
    let mut relative: Vec<_> = files
        .into_iter()
        .filter_map(|f| f.strip_prefix(data_dir).ok().map(Path::to_path_buf))
        .collect();
    relative.sort();
    Ok(relative)
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| EphemeraError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| EphemeraError::io(dir, e))?.path();
        if path.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}
