//! Plain-data output of a template instantiation.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ephemera_common::constants::{HOSTNAME_SUFFIX, IMAGE_TAG_PREFIX};
use ephemera_common::types::{FileMount, Port};
use serde::Serialize;

use crate::readiness::ReadinessCheck;

/// Returns the tag of an image built by a template instantiation:
/// `eph-<template>-<image>:<env id>-<index>`.
#[must_use]
pub fn build_tag(template: &str, image: &str, env_id: &str, index: usize) -> String {
    format!(
        "{IMAGE_TAG_PREFIX}-{}-{image}:{env_id}-{index}",
        flatten(template)
    )
}

/// Returns the hostname of a container: `<name>.<index>.<template>.eph`.
#[must_use]
pub fn hostname(container: &str, template: &str, index: usize) -> String {
    format!("{container}.{index}.{}.{HOSTNAME_SUFFIX}", flatten(template))
}

/// Replaces path separators so a template name fits in a single label.
#[must_use]
pub fn flatten(template: &str) -> String {
    template.replace('/', "-")
}

/// An image declared by a template.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSpec {
    /// Built from the files assembled in `workspace`.
    Build {
        /// Short image name given by the template.
        name: String,
        /// Deterministic tag, see [`build_tag`].
        tag: String,
        /// Build context directory.
        workspace: PathBuf,
        /// Containers running this image.
        containers: Vec<ContainerSpec>,
    },
    /// Pulled from a registry.
    Fetch {
        /// Remote reference, also used as tag.
        reference: String,
        /// Scratch directory for data copied by the template.
        workspace: PathBuf,
        /// Containers running this image.
        containers: Vec<ContainerSpec>,
    },
}

impl ImageSpec {
    /// Returns the tag containers reference.
    #[must_use]
    pub fn tag(&self) -> &str {
        match self {
            Self::Build { tag, .. } => tag,
            Self::Fetch { reference, .. } => reference,
        }
    }

    /// Returns `true` for build images.
    #[must_use]
    pub const fn is_build(&self) -> bool {
        matches!(self, Self::Build { .. })
    }

    /// Returns the image's workspace directory.
    #[must_use]
    pub const fn workspace(&self) -> &PathBuf {
        match self {
            Self::Build { workspace, .. } | Self::Fetch { workspace, .. } => workspace,
        }
    }

    /// Returns the declared containers.
    #[must_use]
    pub fn containers(&self) -> &[ContainerSpec] {
        match self {
            Self::Build { containers, .. } | Self::Fetch { containers, .. } => containers,
        }
    }
}

/// A container declared by a template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSpec {
    /// Name, unique within its image.
    pub name: String,
    /// Tag of the image it runs.
    pub image: String,
    /// Owning template name.
    pub template: String,
    /// Owning instance index.
    pub index: usize,
    /// Environment variables, interpolated before start.
    pub environ: BTreeMap<String, String>,
    /// Command override.
    pub cmd: Vec<String>,
    /// Entrypoint override.
    pub entrypoint: Vec<String>,
    /// Internal ports; empty means the image's exposed ports.
    pub ports: Vec<Port>,
    /// Mounted host files.
    pub mounts: Vec<FileMount>,
    /// Host files among `mounts` to interpolate before start, with the
    /// extra data exposed to each file's placeholders.
    pub interpolate: BTreeMap<PathBuf, serde_json::Map<String, serde_json::Value>>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Readiness checks, run after start.
    pub readiness: Vec<ReadinessCheck>,
}

impl ContainerSpec {
    /// Creates an empty container declaration.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        template: impl Into<String>,
        index: usize,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            template: template.into(),
            index,
            environ: BTreeMap::new(),
            cmd: Vec::new(),
            entrypoint: Vec::new(),
            ports: Vec::new(),
            mounts: Vec::new(),
            interpolate: BTreeMap::new(),
            labels: BTreeMap::new(),
            readiness: Vec::new(),
        }
    }

    /// Returns the container's fully qualified hostname.
    #[must_use]
    pub fn hostname(&self) -> String {
        hostname(&self.name, &self.template, self.index)
    }

    /// Returns the value of `label`, if set.
    #[must_use]
    pub fn label(&self, label: &str) -> Option<&str> {
        self.labels.get(label).map(String::as_str)
    }
}

/// Result of executing one template instantiation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateInstantiation {
    /// Template name.
    pub template: String,
    /// Instance index within the environment.
    pub index: usize,
    /// Declared images in declaration order.
    pub images: Vec<ImageSpec>,
}

impl TemplateInstantiation {
    /// Iterates over every declared container.
    pub fn containers(&self) -> impl Iterator<Item = &ContainerSpec> {
        self.images.iter().flat_map(ImageSpec::containers)
    }
}
