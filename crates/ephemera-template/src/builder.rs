//! Builder handles driven by template scripts.
//!
//! A [`TemplateHandle`] declares images, an [`ImageHandle`] declares
//! containers and assembles its workspace, a [`ContainerHandle`] collects
//! runtime settings. Handles are cheap clones sharing state, so the
//! script and the host see the same declarations. Every operation fails
//! once the instantiation's cancellation token fires, and every path
//! argument is confined to the instantiation's own directories.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ephemera_common::error::{EphemeraError, Result};
use ephemera_common::types::{FileMount, Port, short_id};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::copy;
use crate::paths::join_confined;
use crate::readiness::ReadinessCheck;
use crate::render;
use crate::spec::{self, ContainerSpec, ImageSpec, TemplateInstantiation};

/// Directories and identity of one template instantiation.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    /// Owning environment id.
    pub env_id: String,
    /// Template name.
    pub template: String,
    /// Instance index.
    pub index: usize,
    /// Template data directory (may not exist).
    pub data_dir: PathBuf,
    /// Workspace of this instantiation: `<env ws>/<template>/<index>`.
    pub workspace: PathBuf,
    /// Mount base of the environment.
    pub mount_dir: PathBuf,
    /// Cancellation of the execution phase.
    pub cancel: CancellationToken,
}

impl InstanceContext {
    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(EphemeraError::TemplateCancelled {
                template: self.template.clone(),
            });
        }
        Ok(())
    }

    fn fail(&self, message: impl Into<String>) -> EphemeraError {
        EphemeraError::Template {
            template: self.template.clone(),
            message: message.into(),
        }
    }
}

/// Options accepted by `mount_string` and `mount_data`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Mount read-only.
    pub readonly: bool,
    /// Interpolate placeholders in the file before the container starts.
    pub interpolate: bool,
    /// Silently skip `mount_data` when the data file does not exist.
    #[serde(alias = "skip-if-nonexistent")]
    pub skip_if_nonexistent: bool,
    /// Extra data exposed to the file's placeholders as `extra`.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            readonly: true,
            interpolate: false,
            skip_if_nonexistent: false,
            extra: serde_json::Map::new(),
        }
    }
}

impl MountOptions {
    /// Parses options from a script-supplied object.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Config` for fields of the wrong type.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value).map_err(|e| EphemeraError::Config {
            message: format!("invalid mount options: {e}"),
        })
    }
}

/// Script-facing handle of the template being executed.
#[derive(Debug, Clone)]
pub struct TemplateHandle {
    ctx: Arc<InstanceContext>,
    images: Arc<Mutex<Vec<ImageHandle>>>,
}

impl TemplateHandle {
    /// Creates the handle and the instantiation's workspace directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the workspace cannot be created.
    pub fn new(ctx: InstanceContext) -> Result<Self> {
        fs::create_dir_all(&ctx.workspace).map_err(|e| EphemeraError::io(&ctx.workspace, e))?;
        Ok(Self {
            ctx: Arc::new(ctx),
            images: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Returns the template name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.ctx.template
    }

    /// Returns the instance index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.ctx.index
    }

    /// Declares an image built from this instantiation's workspace.
    ///
    /// # Errors
    ///
    /// Fails when cancelled, on an escaping name, or if the workspace cannot
    /// be created.
    pub fn build_image(&self, name: &str) -> Result<ImageHandle> {
        self.ctx.ensure_active()?;
        let tag = spec::build_tag(&self.ctx.template, name, &self.ctx.env_id, self.ctx.index);
        let workspace = join_confined(&self.ctx.workspace, &dir_name(&tag))?;
        tracing::debug!(env = %self.ctx.env_id, tag = %tag, "declaring build image");
        self.push_image(ImageKind::Build { name: name.to_owned() }, tag, workspace)
    }

    /// Declares an image pulled from a registry.
    ///
    /// # Errors
    ///
    /// Fails when cancelled or if the scratch workspace cannot be created.
    pub fn fetch_image(&self, reference: &str) -> Result<ImageHandle> {
        self.ctx.ensure_active()?;
        let dir = format!("{}-{}", dir_name(reference), short_id());
        let workspace = join_confined(&self.ctx.workspace, &dir)?;
        tracing::debug!(env = %self.ctx.env_id, reference, "declaring fetch image");
        self.push_image(ImageKind::Fetch, reference.to_owned(), workspace)
    }

    fn push_image(&self, kind: ImageKind, tag: String, workspace: PathBuf) -> Result<ImageHandle> {
        fs::create_dir_all(&workspace).map_err(|e| EphemeraError::io(&workspace, e))?;
        let image = ImageHandle {
            ctx: Arc::clone(&self.ctx),
            state: Arc::new(Mutex::new(ImageState {
                kind,
                tag,
                workspace,
                containers: Vec::new(),
            })),
        };
        self.images.lock().push(image.clone());
        Ok(image)
    }

    /// Snapshots every declaration made so far.
    #[must_use]
    pub fn finish(&self) -> TemplateInstantiation {
        TemplateInstantiation {
            template: self.ctx.template.clone(),
            index: self.ctx.index,
            images: self.images.lock().iter().map(ImageHandle::finish).collect(),
        }
    }
}

#[derive(Debug)]
enum ImageKind {
    Build { name: String },
    Fetch,
}

#[derive(Debug)]
struct ImageState {
    kind: ImageKind,
    tag: String,
    workspace: PathBuf,
    containers: Vec<ContainerHandle>,
}

/// Script-facing handle of a declared image.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    ctx: Arc<InstanceContext>,
    state: Arc<Mutex<ImageState>>,
}

impl ImageHandle {
    /// Returns the image tag.
    #[must_use]
    pub fn tag(&self) -> String {
        self.state.lock().tag.clone()
    }

    /// Returns the image workspace directory.
    #[must_use]
    pub fn workspace(&self) -> PathBuf {
        self.state.lock().workspace.clone()
    }

    /// Declares a container running this image. A container with the same
    /// name replaces the earlier declaration.
    ///
    /// # Errors
    ///
    /// Fails when cancelled, on an escaping name, or if the mount directory
    /// cannot be created.
    pub fn new_container(&self, name: &str) -> Result<ContainerHandle> {
        self.ctx.ensure_active()?;
        if name.trim().is_empty() {
            return Err(self.ctx.fail("container name is empty"));
        }
        let mount_dir = join_confined(&self.ctx.mount_dir, name)?;
        let mount_dir = join_confined(&mount_dir, &short_id())?;
        fs::create_dir_all(&mount_dir).map_err(|e| EphemeraError::io(&mount_dir, e))?;

        let mut state = self.state.lock();
        let container = ContainerHandle {
            ctx: Arc::clone(&self.ctx),
            mount_dir,
            spec: Arc::new(Mutex::new(ContainerSpec::new(
                name,
                state.tag.clone(),
                self.ctx.template.clone(),
                self.ctx.index,
            ))),
        };
        tracing::debug!(env = %self.ctx.env_id, image = %state.tag, container = name, "declaring container");
        state.containers.retain(|c| c.name() != name);
        state.containers.push(container.clone());
        Ok(container)
    }

    /// Copies entries of the template data directory into the workspace.
    /// `"*"` copies the whole data directory.
    ///
    /// # Errors
    ///
    /// Fails when cancelled, on an escaping path, or on copy errors.
    pub fn copy_data_to_workspace(&self, entries: &[String]) -> Result<()> {
        self.ctx.ensure_active()?;
        let workspace = self.workspace();
        for entry in entries {
            if entry == "*" {
                tracing::debug!(env = %self.ctx.env_id, from = %self.ctx.data_dir.display(), "copying data directory");
                return copy::copy_dir(&self.ctx.data_dir, &workspace);
            }
            let src = join_confined(&self.ctx.data_dir, entry)?;
            let dst = join_confined(&workspace, entry)?;
            copy::copy_path(&src, &dst)?;
        }
        Ok(())
    }

    /// Writes `data` to `file` in the workspace with permission bits `mode`.
    /// Build images only.
    ///
    /// # Errors
    ///
    /// Fails for fetch images, when cancelled, on an escaping path, or on
    /// write errors.
    pub fn add_file_to_workspace(&self, file: &str, data: &[u8], mode: u32) -> Result<()> {
        self.ensure_build("add_file_to_workspace")?;
        let path = join_confined(&self.workspace(), file)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| EphemeraError::io(parent, e))?;
        }
        fs::write(&path, data).map_err(|e| EphemeraError::io(&path, e))?;
        set_mode(&path, mode)
    }

    /// Renders placeholders of a workspace file against `data`, in place.
    /// Build images only.
    ///
    /// # Errors
    ///
    /// Fails for fetch images, when cancelled, on an escaping or missing
    /// path, or on rendering errors.
    pub fn interpolate_workspace_file(&self, file: &str, data: &serde_json::Value) -> Result<()> {
        self.ensure_build("interpolate_workspace_file")?;
        let path = join_confined(&self.workspace(), file)?;
        let text = fs::read_to_string(&path).map_err(|e| EphemeraError::io(&path, e))?;
        let data = if data.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            data.clone()
        };
        let rendered = render::render_with_data(&text, &data)?;
        fs::write(&path, rendered).map_err(|e| EphemeraError::io(&path, e))
    }

    fn ensure_build(&self, operation: &str) -> Result<()> {
        self.ctx.ensure_active()?;
        match self.state.lock().kind {
            ImageKind::Build { .. } => Ok(()),
            ImageKind::Fetch => Err(self.ctx.fail(format!(
                "{operation} is only available on build images"
            ))),
        }
    }

    fn finish(&self) -> ImageSpec {
        let state = self.state.lock();
        let containers = state.containers.iter().map(ContainerHandle::snapshot).collect();
        match &state.kind {
            ImageKind::Build { name } => ImageSpec::Build {
                name: name.clone(),
                tag: state.tag.clone(),
                workspace: state.workspace.clone(),
                containers,
            },
            ImageKind::Fetch => ImageSpec::Fetch {
                reference: state.tag.clone(),
                workspace: state.workspace.clone(),
                containers,
            },
        }
    }
}

/// Script-facing handle of a declared container.
#[derive(Debug, Clone)]
pub struct ContainerHandle {
    ctx: Arc<InstanceContext>,
    mount_dir: PathBuf,
    spec: Arc<Mutex<ContainerSpec>>,
}

impl ContainerHandle {
    /// Returns the container name.
    #[must_use]
    pub fn name(&self) -> String {
        self.spec.lock().name.clone()
    }

    /// Returns the container hostname.
    #[must_use]
    pub fn hostname(&self) -> String {
        self.spec.lock().hostname()
    }

    /// Sets an environment variable.
    ///
    /// # Errors
    ///
    /// Fails when cancelled.
    pub fn set_env(&self, key: &str, value: &str) -> Result<()> {
        self.ctx.ensure_active()?;
        let _ = self.spec.lock().environ.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    /// Sets a label.
    ///
    /// # Errors
    ///
    /// Fails when cancelled.
    pub fn set_label(&self, key: &str, value: &str) -> Result<()> {
        self.ctx.ensure_active()?;
        let _ = self.spec.lock().labels.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    /// Overrides the image command.
    ///
    /// # Errors
    ///
    /// Fails when cancelled.
    pub fn set_cmd(&self, cmd: Vec<String>) -> Result<()> {
        self.ctx.ensure_active()?;
        self.spec.lock().cmd = cmd;
        Ok(())
    }

    /// Overrides the image entrypoint.
    ///
    /// # Errors
    ///
    /// Fails when cancelled.
    pub fn set_entrypoint(&self, entrypoint: Vec<String>) -> Result<()> {
        self.ctx.ensure_active()?;
        self.spec.lock().entrypoint = entrypoint;
        Ok(())
    }

    /// Declares the internal ports to publish.
    ///
    /// # Errors
    ///
    /// Fails when cancelled.
    pub fn set_ports(&self, ports: Vec<Port>) -> Result<()> {
        self.ctx.ensure_active()?;
        self.spec.lock().ports = ports;
        Ok(())
    }

    /// Writes `data` into a new file of the container's mount directory and
    /// mounts it at `container_file`.
    ///
    /// # Errors
    ///
    /// Fails when cancelled or on write errors.
    pub fn mount_string(
        &self,
        data: &str,
        container_file: &str,
        mode: u32,
        options: MountOptions,
    ) -> Result<()> {
        self.ctx.ensure_active()?;
        let path = join_confined(&self.mount_dir, &short_id())?;
        fs::write(&path, data).map_err(|e| EphemeraError::io(&path, e))?;
        set_mode(&path, mode)?;
        self.mount(path, container_file, options);
        Ok(())
    }

    /// Copies `data_file` from the template data directory into the mount
    /// directory and mounts it at `container_file`.
    ///
    /// # Errors
    ///
    /// Fails when cancelled, on an escaping path, or when the data file is
    /// missing and `skip_if_nonexistent` is not set.
    pub fn mount_data(
        &self,
        data_file: &str,
        container_file: &str,
        options: MountOptions,
    ) -> Result<()> {
        self.ctx.ensure_active()?;
        let src = join_confined(&self.ctx.data_dir, data_file)?;
        let dst = join_confined(&self.mount_dir, data_file)?;

        if !src.exists() {
            if options.skip_if_nonexistent {
                tracing::info!(
                    env = %self.ctx.env_id,
                    container = %self.hostname(),
                    file = %src.display(),
                    "data file does not exist, skipping mount"
                );
                return Ok(());
            }
            return Err(self.ctx.fail(format!("data file does not exist: {}", src.display())));
        }

        copy::copy_path(&src, &dst)?;
        self.mount(dst, container_file, options);
        Ok(())
    }

    /// Declares a readiness check of `kind` with `params`.
    ///
    /// # Errors
    ///
    /// Fails when cancelled or for invalid check parameters.
    pub fn add_readiness_check(&self, kind: &str, params: serde_json::Value) -> Result<()> {
        self.ctx.ensure_active()?;
        let check = ReadinessCheck::from_params(kind, params)?;
        self.spec.lock().readiness.push(check);
        Ok(())
    }

    fn mount(&self, host_file: PathBuf, container_file: &str, options: MountOptions) {
        tracing::debug!(
            env = %self.ctx.env_id,
            host = %host_file.display(),
            container = container_file,
            readonly = options.readonly,
            "declaring mount"
        );
        let mut spec = self.spec.lock();
        if options.interpolate {
            let _ = spec.interpolate.insert(host_file.clone(), options.extra);
        }
        spec.mounts.push(FileMount {
            host_file,
            container_file: container_file.to_owned(),
            readonly: options.readonly,
        });
    }

    fn snapshot(&self) -> ContainerSpec {
        self.spec.lock().clone()
    }
}

/// Turns an image reference or tag into a single directory name.
fn dir_name(reference: &str) -> String {
    reference.replace(['/', ':'], "-")
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| EphemeraError::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
