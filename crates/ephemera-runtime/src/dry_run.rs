//! In-memory container engine that records every call.
//!
//! Identifiers are deterministic (`net-0`, `ctr-0`, `ctr-1`, ...). Ports of
//! built images are read from `EXPOSE` lines of the context's `Dockerfile`;
//! ports of fetched images are configured up front. Any operation can be
//! made to fail for targets containing a given substring.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use ephemera_common::error::{EphemeraError, Result};
use ephemera_common::types::{ContainerId, Port};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::archive;
use crate::engine::{ContainerEngine, NetworkHandle, RunContainerParams};

/// Subnet handed out when none is configured.
pub const DEFAULT_SUBNET: &str = "10.99.0.0/24";

/// Driver operations, used to select injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// `create_network`
    CreateNetwork,
    /// `build_image`
    BuildImage,
    /// `image_ports`
    ImagePorts,
    /// `fetch_image`
    FetchImage,
    /// `run_container`
    RunContainer,
    /// `stop_container`
    StopContainer,
    /// `restart_container`
    RestartContainer,
    /// `remove_container`
    RemoveContainer,
    /// `remove_image`
    RemoveImage,
    /// `remove_network`
    RemoveNetwork,
}

impl Operation {
    const fn label(self) -> &'static str {
        match self {
            Self::CreateNetwork => "create network",
            Self::BuildImage => "build image",
            Self::ImagePorts => "inspect image",
            Self::FetchImage => "fetch image",
            Self::RunContainer => "run container",
            Self::StopContainer => "stop container",
            Self::RestartContainer => "restart container",
            Self::RemoveContainer => "remove container",
            Self::RemoveImage => "remove image",
            Self::RemoveNetwork => "remove network",
        }
    }
}

/// One recorded driver call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    /// A network was requested.
    CreateNetwork {
        /// Requested network name.
        name: String,
    },
    /// An image build was requested.
    BuildImage {
        /// Image tag.
        tag: String,
        /// Files contained in the build context.
        files: Vec<String>,
    },
    /// Exposed ports of an image were queried.
    ImagePorts {
        /// Image tag.
        tag: String,
    },
    /// An image pull was requested.
    FetchImage {
        /// Remote reference.
        reference: String,
    },
    /// A container was started.
    RunContainer {
        /// Container name.
        name: String,
        /// Image tag.
        tag: String,
        /// Full run parameters.
        params: RunContainerParams,
    },
    /// A container was stopped.
    StopContainer {
        /// Container id.
        id: ContainerId,
    },
    /// A container was restarted.
    RestartContainer {
        /// Container id.
        id: ContainerId,
    },
    /// A container was removed.
    RemoveContainer {
        /// Container id.
        id: ContainerId,
    },
    /// An image was removed.
    RemoveImage {
        /// Image tag.
        tag: String,
    },
    /// A network was removed.
    RemoveNetwork {
        /// Network id.
        id: String,
    },
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<Call>,
    next_network: usize,
    next_container: usize,
    images: BTreeMap<String, Vec<Port>>,
    containers: BTreeMap<ContainerId, String>,
    networks: BTreeSet<String>,
}

/// Recording, failure-injectable [`ContainerEngine`].
#[derive(Debug)]
pub struct DryRunEngine {
    subnet: String,
    fetched_ports: BTreeMap<String, Vec<Port>>,
    failures: Vec<(Operation, String)>,
    state: Mutex<State>,
}

impl Default for DryRunEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunEngine {
    /// Creates an engine handing out [`DEFAULT_SUBNET`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            subnet: DEFAULT_SUBNET.into(),
            fetched_ports: BTreeMap::new(),
            failures: Vec::new(),
            state: Mutex::new(State::default()),
        }
    }

    /// Sets the subnet reported for every created network.
    #[must_use]
    pub fn with_subnet(mut self, subnet: impl Into<String>) -> Self {
        self.subnet = subnet.into();
        self
    }

    /// Declares the exposed ports of a fetchable image.
    #[must_use]
    pub fn with_image_ports(mut self, reference: impl Into<String>, ports: &[Port]) -> Self {
        let _ = self.fetched_ports.insert(reference.into(), ports.to_vec());
        self
    }

    /// Makes `operation` fail whenever its target contains `needle`.
    #[must_use]
    pub fn fail_on(mut self, operation: Operation, needle: impl Into<String>) -> Self {
        self.failures.push((operation, needle.into()));
        self
    }

    /// Returns a copy of all recorded calls, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Returns the ids of containers that exist (created, not removed).
    #[must_use]
    pub fn live_containers(&self) -> Vec<ContainerId> {
        self.state.lock().containers.keys().cloned().collect()
    }

    /// Returns the tags of images that exist (built or fetched, not removed).
    #[must_use]
    pub fn live_images(&self) -> Vec<String> {
        self.state.lock().images.keys().cloned().collect()
    }

    /// Returns the ids of networks that exist.
    #[must_use]
    pub fn live_networks(&self) -> Vec<String> {
        self.state.lock().networks.iter().cloned().collect()
    }

    fn check(&self, cancel: &CancellationToken, operation: Operation, target: &str) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(EphemeraError::Cancelled);
        }
        if self
            .failures
            .iter()
            .any(|(op, needle)| *op == operation && target.contains(needle.as_str()))
        {
            return Err(EphemeraError::driver(
                operation.label(),
                target,
                "injected failure",
            ));
        }
        Ok(())
    }

    fn record(&self, call: Call) {
        tracing::debug!(?call, "dry-run driver call");
        self.state.lock().calls.push(call);
    }
}

/// Extracts `EXPOSE` ports from a Dockerfile, ignoring protocol suffixes.
fn exposed_ports(dockerfile: &str) -> Vec<Port> {
    let mut ports: Vec<Port> = dockerfile
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (keyword, rest) = line.split_once(char::is_whitespace)?;
            keyword.eq_ignore_ascii_case("EXPOSE").then_some(rest)
        })
        .flat_map(str::split_whitespace)
        .filter_map(|token| token.split('/').next()?.parse().ok())
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[async_trait]
impl ContainerEngine for DryRunEngine {
    async fn create_network(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<NetworkHandle> {
        self.check(cancel, Operation::CreateNetwork, name)?;
        self.record(Call::CreateNetwork { name: name.into() });

        let mut state = self.state.lock();
        let id = format!("net-{}", state.next_network);
        state.next_network += 1;
        let _ = state.networks.insert(id.clone());
        Ok(NetworkHandle {
            id,
            subnet: self.subnet.clone(),
        })
    }

    async fn build_image(
        &self,
        cancel: &CancellationToken,
        tag: &str,
        context: Vec<u8>,
    ) -> Result<()> {
        self.check(cancel, Operation::BuildImage, tag)?;
        let files = archive::list_files(&context)?;
        let ports = archive::read_file(&context, "Dockerfile")?
            .map(|text| exposed_ports(&text))
            .unwrap_or_default();
        self.record(Call::BuildImage {
            tag: tag.into(),
            files,
        });
        let _ = self.state.lock().images.insert(tag.into(), ports);
        Ok(())
    }

    async fn image_ports(&self, cancel: &CancellationToken, tag: &str) -> Result<Vec<Port>> {
        self.check(cancel, Operation::ImagePorts, tag)?;
        self.record(Call::ImagePorts { tag: tag.into() });
        self.state
            .lock()
            .images
            .get(tag)
            .cloned()
            .ok_or_else(|| EphemeraError::driver("inspect image", tag, "no such image"))
    }

    async fn fetch_image(&self, cancel: &CancellationToken, reference: &str) -> Result<()> {
        self.check(cancel, Operation::FetchImage, reference)?;
        self.record(Call::FetchImage {
            reference: reference.into(),
        });
        let ports = self.fetched_ports.get(reference).cloned().unwrap_or_default();
        let _ = self.state.lock().images.insert(reference.into(), ports);
        Ok(())
    }

    async fn run_container(
        &self,
        cancel: &CancellationToken,
        name: &str,
        tag: &str,
        params: &RunContainerParams,
    ) -> Result<ContainerId> {
        self.check(cancel, Operation::RunContainer, name)?;
        self.record(Call::RunContainer {
            name: name.into(),
            tag: tag.into(),
            params: params.clone(),
        });

        let mut state = self.state.lock();
        let id = ContainerId::new(format!("ctr-{}", state.next_container));
        state.next_container += 1;
        let _ = state.containers.insert(id.clone(), name.into());
        Ok(id)
    }

    async fn stop_container(&self, cancel: &CancellationToken, id: &ContainerId) -> Result<()> {
        self.check(cancel, Operation::StopContainer, id.as_str())?;
        self.record(Call::StopContainer { id: id.clone() });
        Ok(())
    }

    async fn restart_container(
        &self,
        cancel: &CancellationToken,
        id: &ContainerId,
    ) -> Result<()> {
        self.check(cancel, Operation::RestartContainer, id.as_str())?;
        self.record(Call::RestartContainer { id: id.clone() });
        Ok(())
    }

    async fn remove_container(
        &self,
        cancel: &CancellationToken,
        id: &ContainerId,
    ) -> Result<()> {
        self.check(cancel, Operation::RemoveContainer, id.as_str())?;
        self.record(Call::RemoveContainer { id: id.clone() });
        let _ = self.state.lock().containers.remove(id);
        Ok(())
    }

    async fn remove_image(&self, cancel: &CancellationToken, tag: &str) -> Result<()> {
        self.check(cancel, Operation::RemoveImage, tag)?;
        self.record(Call::RemoveImage { tag: tag.into() });
        let _ = self.state.lock().images.remove(tag);
        Ok(())
    }

    async fn remove_network(&self, cancel: &CancellationToken, id: &str) -> Result<()> {
        self.check(cancel, Operation::RemoveNetwork, id)?;
        self.record(Call::RemoveNetwork { id: id.into() });
        let _ = self.state.lock().networks.remove(id);
        Ok(())
    }
}
