//! Sandboxed template execution.
//!
//! A template script defines `execute(tpl, params)` and optionally
//! `info()`. It runs in an embedded interpreter that offers no file, network
//! or process access of its own; the builder handles are its only side
//! channel. Execution happens on the blocking pool. A panic anywhere in the
//! interpreter or the builder is recovered into a template error, and
//! cancellation of the execution token interrupts the script.

use std::any::Any;
use std::path::{Path, PathBuf};

use ephemera_common::error::{EphemeraError, Result};
use ephemera_common::types::{Port, TemplateParams};
use base64::Engine as _;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, INT, Map, Scope};
use tokio_util::sync::CancellationToken;

use crate::builder::{ContainerHandle, ImageHandle, InstanceContext, MountOptions, TemplateHandle};
use crate::paths::{self, TemplatePaths};
use crate::spec::TemplateInstantiation;

const EXECUTE_FN: &str = "execute";
const MAX_CALL_LEVELS: usize = 64;
const MAX_EXPR_DEPTH: usize = 128;

type ScriptResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Where a template's script comes from.
#[derive(Debug, Clone)]
pub enum TemplateSource {
    /// A script under the template root.
    File(TemplatePaths),
    /// A script compiled into the binary.
    Embedded {
        /// Template name.
        name: String,
        /// Script text.
        script: String,
    },
}

impl TemplateSource {
    /// Resolves `name` under `root`.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Template` for refused names.
    pub fn resolve(root: &Path, name: &str) -> Result<Self> {
        paths::resolve(root, name).map(Self::File)
    }

    /// Wraps an embedded script.
    #[must_use]
    pub fn embedded(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::Embedded {
            name: name.into(),
            script: script.into(),
        }
    }

    /// Returns the template name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::File(paths) => &paths.name,
            Self::Embedded { name, .. } => name,
        }
    }

    fn data_dir(&self) -> PathBuf {
        match self {
            Self::File(paths) => paths.data_dir.clone(),
            Self::Embedded { .. } => PathBuf::new(),
        }
    }

    fn load(&self) -> Result<String> {
        match self {
            Self::File(paths) => std::fs::read_to_string(&paths.script).map_err(|e| {
                EphemeraError::Template {
                    template: paths.name.clone(),
                    message: format!("cannot read {}: {e}", paths.script.display()),
                }
            }),
            Self::Embedded { script, .. } => Ok(script.clone()),
        }
    }
}

/// Inputs of one execution.
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    /// Owning environment id.
    pub env_id: String,
    /// Workspace base of the environment.
    pub workspace_dir: PathBuf,
    /// Mount base of the environment.
    pub mount_dir: PathBuf,
    /// Parameters passed to `execute`.
    pub parameters: TemplateParams,
    /// Cancellation of the execution phase.
    pub cancel: CancellationToken,
}

/// Executes a template instantiation on the blocking pool.
///
/// # Errors
///
/// Returns `EphemeraError::Template` when the script is missing, malformed,
/// throws, or panics, and `EphemeraError::TemplateCancelled` when the
/// execution token fired.
pub async fn execute(
    source: TemplateSource,
    index: usize,
    params: ExecuteParams,
) -> Result<TemplateInstantiation> {
    let template = source.name().to_owned();
    match tokio::task::spawn_blocking(move || execute_blocking(&source, index, params)).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            tracing::error!(template = %template, panic = %message, "template execution panicked");
            Err(EphemeraError::Template {
                template,
                message: format!("panicked: {message}"),
            })
        }
        Err(_) => Err(EphemeraError::TemplateCancelled { template }),
    }
}

/// Executes a template instantiation on the current thread.
///
/// # Errors
///
/// See [`execute`].
pub fn execute_blocking(
    source: &TemplateSource,
    index: usize,
    params: ExecuteParams,
) -> Result<TemplateInstantiation> {
    recover_panics(source.name(), || run_script(source, index, params))
}

/// Runs `f`, turning a panic into a template error.
fn recover_panics<T>(template: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload);
        tracing::error!(template = %template, panic = %message, "template execution panicked");
        Err(EphemeraError::Template {
            template: template.to_owned(),
            message: format!("panicked: {message}"),
        })
    })
}

fn run_script(
    source: &TemplateSource,
    index: usize,
    params: ExecuteParams,
) -> Result<TemplateInstantiation> {
    let template = source.name().to_owned();
    let failed = |message: String| EphemeraError::Template {
        template: template.clone(),
        message,
    };
    let cancelled = || EphemeraError::TemplateCancelled {
        template: template.clone(),
    };

    let script = source.load()?;
    if params.cancel.is_cancelled() {
        return Err(cancelled());
    }

    let engine = new_engine(params.cancel.clone());
    let ast = engine
        .compile(&script)
        .map_err(|e| failed(format!("script error: {e}")))?;
    if !ast.iter_functions().any(|f| f.name == EXECUTE_FN) {
        return Err(failed(format!("script defines no {EXECUTE_FN}(tpl, params) function")));
    }

    let handle = TemplateHandle::new(InstanceContext {
        env_id: params.env_id.clone(),
        template: template.clone(),
        index,
        data_dir: source.data_dir(),
        workspace: params.workspace_dir.join(&template).join(index.to_string()),
        mount_dir: params.mount_dir.clone(),
        cancel: params.cancel.clone(),
    })?;
    let arguments = rhai::serde::to_dynamic(serde_json::Value::Object(params.parameters))
        .map_err(|e| failed(format!("invalid parameters: {e}")))?;

    tracing::debug!(env = %params.env_id, template = %template, index, "executing template");
    let mut scope = Scope::new();
    match engine.call_fn::<Dynamic>(&mut scope, &ast, EXECUTE_FN, (handle.clone(), arguments)) {
        Ok(_) => {
            let instantiation = handle.finish();
            tracing::info!(
                env = %params.env_id,
                template = %template,
                index,
                images = instantiation.images.len(),
                "template executed"
            );
            Ok(instantiation)
        }
        Err(_) if params.cancel.is_cancelled() => {
            tracing::info!(env = %params.env_id, template = %template, "template execution cancelled");
            Err(cancelled())
        }
        Err(e) => Err(failed(e.to_string())),
    }
}

/// Creates an interpreter with the builder API and helper library.
pub(crate) fn new_engine(cancel: CancellationToken) -> Engine {
    let mut engine = Engine::new();
    let _ = engine
        .set_module_resolver(DummyModuleResolver::new())
        .set_max_call_levels(MAX_CALL_LEVELS)
        .set_max_expr_depths(MAX_EXPR_DEPTH, MAX_EXPR_DEPTH)
        .disable_symbol("eval")
        .on_progress(move |_| cancel.is_cancelled().then_some(Dynamic::UNIT))
        .on_print(|text| tracing::info!(target: "ephemera::template", "{text}"))
        .on_debug(|text, source, pos| {
            tracing::debug!(target: "ephemera::template", source = source.unwrap_or(""), %pos, "{text}");
        });
    register_library(&mut engine);
    register_builder(&mut engine);
    engine
}

fn script_error(error: EphemeraError) -> Box<EvalAltResult> {
    error.to_string().into()
}

fn to_json(value: Dynamic) -> ScriptResult<serde_json::Value> {
    rhai::serde::from_dynamic(&value)
}

fn strings(items: Array) -> Vec<String> {
    items.into_iter().map(|item| item.to_string()).collect()
}

fn port(value: &Dynamic) -> ScriptResult<Port> {
    let number = value
        .as_int()
        .map_err(|kind| format!("port must be an integer, got {kind}"))?;
    Port::try_from(number).map_err(|_| format!("port {number} out of range").into())
}

fn mode(value: INT) -> ScriptResult<u32> {
    u32::try_from(value).map_err(|_| format!("invalid file mode {value}").into())
}

fn options(map: Map) -> ScriptResult<MountOptions> {
    MountOptions::from_value(to_json(Dynamic::from(map))?).map_err(script_error)
}

fn register_library(engine: &mut Engine) {
    let _ = engine
        .register_fn("is_defined", |value: Dynamic| !value.is_unit())
        .register_fn("is_array", |value: Dynamic| value.is_array())
        .register_fn("from_base64", |name: &str, value: Dynamic| -> ScriptResult<Blob> {
            let Some(text) = value.read_lock::<rhai::ImmutableString>() else {
                return Err(format!("{name}: expected string but got {}", value.type_name()).into());
            };
            base64::engine::general_purpose::STANDARD
                .decode(text.as_bytes())
                .map_err(|e| format!("{name}: invalid base64: {e}").into())
        })
        .register_fn("ensure_string", |name: &str, value: Dynamic| -> ScriptResult<()> {
            if value.is_unit() || value.is_string() {
                Ok(())
            } else {
                Err(format!("{name}: expected string but got {}", value.type_name()).into())
            }
        })
        .register_fn("ensure_list_of_strings", |name: &str, value: Dynamic| -> ScriptResult<()> {
            ensure_list(name, &value, "string", Dynamic::is_string)
        })
        .register_fn("ensure_list_of_numbers", |name: &str, value: Dynamic| -> ScriptResult<()> {
            ensure_list(name, &value, "number", |v| v.is_int() || v.is_float())
        });
}

fn ensure_list(
    name: &str,
    value: &Dynamic,
    kind: &str,
    accept: impl Fn(&Dynamic) -> bool,
) -> ScriptResult<()> {
    if value.is_unit() {
        return Ok(());
    }
    let Some(items) = value.read_lock::<Array>() else {
        return Err(format!("{name}: expected array of {kind}s but got {}", value.type_name()).into());
    };
    match items.iter().find(|item| !accept(item)) {
        Some(item) => Err(format!("{name}: found non-{kind} element {}", item.type_name()).into()),
        None => Ok(()),
    }
}

fn register_builder(engine: &mut Engine) {
    let _ = engine
        .register_type_with_name::<TemplateHandle>("Template")
        .register_get("name", |t: &mut TemplateHandle| t.name().to_owned())
        .register_get("index", |t: &mut TemplateHandle| {
            INT::try_from(t.index()).unwrap_or(INT::MAX)
        })
        .register_fn("build_image", |t: &mut TemplateHandle, name: &str| {
            t.build_image(name).map_err(script_error)
        })
        .register_fn("fetch_image", |t: &mut TemplateHandle, reference: &str| {
            t.fetch_image(reference).map_err(script_error)
        });

    let _ = engine
        .register_type_with_name::<ImageHandle>("Image")
        .register_get("tag", |i: &mut ImageHandle| i.tag())
        .register_fn("new_container", |i: &mut ImageHandle, name: &str| {
            i.new_container(name).map_err(script_error)
        })
        .register_fn("copy_data_to_workspace", |i: &mut ImageHandle, entry: &str| {
            i.copy_data_to_workspace(&[entry.to_owned()]).map_err(script_error)
        })
        .register_fn("copy_data_to_workspace", |i: &mut ImageHandle, entries: Array| {
            i.copy_data_to_workspace(&strings(entries)).map_err(script_error)
        })
        .register_fn(
            "add_file_to_workspace",
            |i: &mut ImageHandle, file: &str, data: &str, file_mode: INT| -> ScriptResult<()> {
                i.add_file_to_workspace(file, data.as_bytes(), mode(file_mode)?)
                    .map_err(script_error)
            },
        )
        .register_fn(
            "add_file_to_workspace",
            |i: &mut ImageHandle, file: &str, data: Blob, file_mode: INT| -> ScriptResult<()> {
                i.add_file_to_workspace(file, &data, mode(file_mode)?)
                    .map_err(script_error)
            },
        )
        .register_fn("interpolate_workspace_file", |i: &mut ImageHandle, file: &str, data: Map| -> ScriptResult<()> {
            let data = to_json(Dynamic::from(data))?;
            i.interpolate_workspace_file(file, &data).map_err(script_error)
        });

    let _ = engine
        .register_type_with_name::<ContainerHandle>("Container")
        .register_get("name", |c: &mut ContainerHandle| c.name())
        .register_get("hostname", |c: &mut ContainerHandle| c.hostname())
        .register_fn("set_env", |c: &mut ContainerHandle, key: &str, value: Dynamic| {
            c.set_env(key, &value.to_string()).map_err(script_error)
        })
        .register_fn("set_label", |c: &mut ContainerHandle, key: &str, value: Dynamic| {
            c.set_label(key, &value.to_string()).map_err(script_error)
        })
        .register_fn("set_cmd", |c: &mut ContainerHandle, cmd: Array| {
            c.set_cmd(strings(cmd)).map_err(script_error)
        })
        .register_fn("set_cmd", |c: &mut ContainerHandle, cmd: &str| {
            c.set_cmd(vec![cmd.to_owned()]).map_err(script_error)
        })
        .register_fn("set_entrypoint", |c: &mut ContainerHandle, entrypoint: Array| {
            c.set_entrypoint(strings(entrypoint)).map_err(script_error)
        })
        .register_fn("set_entrypoint", |c: &mut ContainerHandle, entrypoint: &str| {
            c.set_entrypoint(vec![entrypoint.to_owned()]).map_err(script_error)
        })
        .register_fn("set_ports", |c: &mut ContainerHandle, ports: Array| -> ScriptResult<()> {
            let ports = ports.iter().map(port).collect::<ScriptResult<Vec<_>>>()?;
            c.set_ports(ports).map_err(script_error)
        })
        .register_fn("set_ports", |c: &mut ContainerHandle, single: INT| -> ScriptResult<()> {
            c.set_ports(vec![port(&Dynamic::from_int(single))?]).map_err(script_error)
        })
        .register_fn(
            "mount_string",
            |c: &mut ContainerHandle, data: &str, file: &str, file_mode: INT, opts: Map| -> ScriptResult<()> {
                c.mount_string(data, file, mode(file_mode)?, options(opts)?)
                    .map_err(script_error)
            },
        )
        .register_fn(
            "mount_string",
            |c: &mut ContainerHandle, data: &str, file: &str, file_mode: INT| -> ScriptResult<()> {
                c.mount_string(data, file, mode(file_mode)?, MountOptions::default())
                    .map_err(script_error)
            },
        )
        .register_fn(
            "mount_data",
            |c: &mut ContainerHandle, data_file: &str, file: &str, opts: Map| -> ScriptResult<()> {
                c.mount_data(data_file, file, options(opts)?).map_err(script_error)
            },
        )
        .register_fn("mount_data", |c: &mut ContainerHandle, data_file: &str, file: &str| {
            c.mount_data(data_file, file, MountOptions::default())
                .map_err(script_error)
        })
        .register_fn(
            "add_readiness_check",
            |c: &mut ContainerHandle, kind: &str, params: Map| -> ScriptResult<()> {
                let params = to_json(Dynamic::from(params))?;
                c.add_readiness_check(kind, params).map_err(script_error)
            },
        );
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
