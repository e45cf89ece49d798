//! Container runtime driver abstraction.
//!
//! Every operation takes the cancellation token of the phase it runs in.
//! Implementations should abort long operations once it fires and report
//! `EphemeraError::Cancelled`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use ephemera_common::error::Result;
use ephemera_common::types::{ContainerId, FileMount, Port};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// A network created for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkHandle {
    /// Driver identifier of the network.
    pub id: String,
    /// Subnet in CIDR notation.
    pub subnet: String,
}

/// How a container resolves the hostnames of its siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NameResolution {
    /// Use the environment's discovery agent as DNS server.
    DiscoveryDns(Ipv4Addr),
    /// Write a static `hostname -> ip` map into the container.
    StaticHosts(BTreeMap<String, Ipv4Addr>),
}

/// Everything the driver needs to start one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunContainerParams {
    /// Network the container joins.
    pub network_id: String,
    /// Address inside the network.
    pub ip: Ipv4Addr,
    /// Fully qualified hostname.
    pub hostname: String,
    /// Published ports, internal to external.
    pub ports: BTreeMap<Port, Port>,
    /// Sibling name resolution.
    pub resolution: NameResolution,
    /// Environment variables after interpolation.
    pub environ: BTreeMap<String, String>,
    /// Command override; empty keeps the image default.
    pub cmd: Vec<String>,
    /// Entrypoint override; empty keeps the image default.
    pub entrypoint: Vec<String>,
    /// Host files mounted into the container.
    pub mounts: Vec<FileMount>,
    /// Container labels.
    pub labels: BTreeMap<String, String>,
}

/// Asynchronous container runtime driver.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates an isolated network and reports its subnet.
    ///
    /// # Errors
    ///
    /// Returns an error if the network cannot be created.
    async fn create_network(&self, cancel: &CancellationToken, name: &str)
    -> Result<NetworkHandle>;

    /// Builds an image from a tar build context.
    ///
    /// # Errors
    ///
    /// Returns an error if the build fails.
    async fn build_image(&self, cancel: &CancellationToken, tag: &str, context: Vec<u8>)
    -> Result<()>;

    /// Returns the ports an image declares as exposed.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be inspected.
    async fn image_ports(&self, cancel: &CancellationToken, tag: &str) -> Result<Vec<Port>>;

    /// Pulls an image by remote reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the pull fails.
    async fn fetch_image(&self, cancel: &CancellationToken, reference: &str) -> Result<()>;

    /// Creates and starts a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be created or started.
    async fn run_container(
        &self,
        cancel: &CancellationToken,
        name: &str,
        tag: &str,
        params: &RunContainerParams,
    ) -> Result<ContainerId>;

    /// Stops a running container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be stopped.
    async fn stop_container(&self, cancel: &CancellationToken, id: &ContainerId) -> Result<()>;

    /// Restarts a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be restarted.
    async fn restart_container(&self, cancel: &CancellationToken, id: &ContainerId)
    -> Result<()>;

    /// Force-removes a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be removed.
    async fn remove_container(&self, cancel: &CancellationToken, id: &ContainerId) -> Result<()>;

    /// Removes an image by tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be removed.
    async fn remove_image(&self, cancel: &CancellationToken, tag: &str) -> Result<()>;

    /// Removes a network.
    ///
    /// # Errors
    ///
    /// Returns an error if the network cannot be removed.
    async fn remove_network(&self, cancel: &CancellationToken, id: &str) -> Result<()>;
}
