//! One ephemeral environment.
//!
//! An apply pass runs in phases. Template execution, image build/fetch and
//! readiness checks each fan out concurrently; the phases themselves never
//! overlap. Allocation state lives behind the environment's `RwLock`, the
//! port allocator has its own mutex, and neither lock is held across an
//! `.await` or while the other is taken.
//!
//! ```text
//! execute templates -> build/fetch images -> network -> addresses -> ports
//!     -> interpolate + run containers -> readiness -> notify discovery
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ephemera_common::config::EngineConfig;
use ephemera_common::error::{EphemeraError, Result};
use ephemera_common::types::{ContainerId, EnvironmentSpec, Port, TemplateRef, short_id};
use ephemera_core::ip::IpAllocator;
use ephemera_core::ports::PortAllocator;
use ephemera_runtime::archive;
use ephemera_runtime::engine::{
    ContainerEngine, NameResolution, NetworkHandle, RunContainerParams,
};
use ephemera_template::sandbox::{self, ExecuteParams, TemplateSource};
use ephemera_template::spec::{self, ContainerSpec, ImageSpec, TemplateInstantiation};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::discovery;
use crate::export::{ExportedContainer, ExportedEnvironment, ExportedInstance};
use crate::fanout::FanOut;
use crate::interpolate::{ConfigInterpolator, ContainerView, ReadinessInterpolator};
use crate::ports::{PortMap, PortTable};
use crate::registry::ContainerRegistry;

/// Inputs of [`Environment::create`].
pub struct EnvParams {
    /// The submitted environment description.
    pub spec: EnvironmentSpec,
    /// Container runtime driver.
    pub engine: Arc<dyn ContainerEngine>,
    /// Process-wide external port allocator.
    pub ports: Arc<PortAllocator>,
    /// Engine configuration.
    pub config: Arc<EngineConfig>,
    /// Governing token; cancelling it stops every operation of the
    /// environment but does not tear it down.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
struct DiscoveryAgent {
    hostname: String,
    url: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    network: Option<NetworkHandle>,
    ips: Option<IpAllocator>,
    hosts: BTreeMap<String, Ipv4Addr>,
    ports: PortTable,
    registry: ContainerRegistry,
    built_images: BTreeSet<String>,
    instantiations: Vec<TemplateInstantiation>,
    counts: BTreeMap<String, usize>,
    discovery: Option<DiscoveryAgent>,
    terminating: bool,
    last_keep_alive: Option<DateTime<Utc>>,
}

/// Images and containers collected from one apply pass.
#[derive(Debug, Default)]
struct Collected {
    builds: BTreeMap<String, PathBuf>,
    fetches: BTreeSet<String>,
    containers: Vec<ContainerSpec>,
}

impl Collected {
    fn from_instantiations(instantiations: &[TemplateInstantiation]) -> Self {
        let mut collected = Self::default();
        for image in instantiations.iter().flat_map(|inst| &inst.images) {
            match image {
                ImageSpec::Build { tag, workspace, .. } => {
                    let _ = collected.builds.insert(tag.clone(), workspace.clone());
                }
                ImageSpec::Fetch { reference, .. } => {
                    let _ = collected.fetches.insert(reference.clone());
                }
            }
            collected.containers.extend(image.containers().iter().cloned());
        }
        collected
    }
}

/// A running ephemeral environment.
pub struct Environment {
    id: String,
    spec: EnvironmentSpec,
    workspace_dir: PathBuf,
    mount_dir: PathBuf,
    engine: Arc<dyn ContainerEngine>,
    ports: Arc<PortAllocator>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
    created: DateTime<Utc>,
    keep_alive: Duration,
    keep_alive_tx: Mutex<Option<mpsc::Sender<()>>>,
    apply_lock: tokio::sync::Mutex<()>,
    state: RwLock<State>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Creates an environment and applies its initial templates.
    ///
    /// Any failure tears down what was allocated before the error is
    /// returned. A non-zero keepalive starts the expiry watchdog.
    ///
    /// # Errors
    ///
    /// Returns the first error of the apply pass, or `EphemeraError::Config`
    /// for an invalid spec.
    pub async fn create(params: EnvParams) -> Result<Arc<Self>> {
        params.spec.validate()?;
        let id = new_env_id(&params.spec.name);
        let keep_alive = params
            .spec
            .options
            .keep_alive
            .unwrap_or(params.config.default_keep_alive);
        let need_discovery = !params.spec.options.disable_discovery;

        let env = Arc::new(Self {
            workspace_dir: params.config.workspace_dir.join(&id),
            mount_dir: params.config.mount_dir.join(&id),
            id,
            spec: params.spec,
            engine: params.engine,
            ports: params.ports,
            config: params.config,
            cancel: params.cancel.child_token(),
            created: Utc::now(),
            keep_alive,
            keep_alive_tx: Mutex::new(None),
            apply_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(State::default()),
        });
        tracing::info!(
            env = %env.id,
            templates = env.spec.templates.len(),
            discovery = need_discovery,
            "creating environment"
        );

        let templates = env.spec.templates.clone();
        if let Err(e) = env.apply_templates(&templates, need_discovery, false).await {
            tracing::error!(env = %env.id, error = %e, "environment creation failed, tearing down");
            if let Err(teardown) = env.terminate().await {
                tracing::warn!(env = %env.id, error = %teardown, "teardown after failed creation");
            }
            return Err(e);
        }

        if !keep_alive.is_zero() {
            env.spawn_watchdog();
        }
        tracing::info!(env = %env.id, "environment created");
        Ok(env)
    }

    /// Returns the environment id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the environment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Returns the creation time.
    #[must_use]
    pub const fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Returns the keepalive period; zero never expires.
    #[must_use]
    pub const fn keep_alive_period(&self) -> Duration {
        self.keep_alive
    }

    /// Returns `true` until teardown started.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.state.read().terminating
    }

    /// Returns `true` if a discovery agent runs in the environment.
    #[must_use]
    pub fn has_discovery(&self) -> bool {
        self.state.read().discovery.is_some()
    }

    /// Returns the ids of every created container.
    #[must_use]
    pub fn container_ids(&self) -> Vec<ContainerId> {
        self.state.read().registry.ids()
    }

    /// Returns every applied template instantiation, in apply order.
    #[must_use]
    pub fn instantiations(&self) -> Vec<TemplateInstantiation> {
        self.state.read().instantiations.clone()
    }

    /// Resets the keepalive timer.
    pub fn keep_alive(&self) {
        self.state.write().last_keep_alive = Some(Utc::now());
        if let Some(tx) = self.keep_alive_tx.lock().as_ref() {
            // A full channel already holds a pending reset.
            let _ = tx.try_send(());
        }
    }

    /// Applies templates to the environment.
    ///
    /// `need_discovery` adds the built-in discovery template to the pass.
    /// `notify_discovery` registers the new hostnames with the running
    /// discovery agent afterwards. Passes on one environment are
    /// serialized. A failed pass keeps what earlier passes created.
    ///
    /// # Errors
    ///
    /// Returns the first error of any phase.
    pub async fn apply_templates(
        &self,
        templates: &[TemplateRef],
        need_discovery: bool,
        notify_discovery: bool,
    ) -> Result<()> {
        let _pass = self.apply_lock.lock().await;
        self.ensure_alive()?;

        let instantiations = self.execute_templates(templates, need_discovery).await?;
        let collected = Collected::from_instantiations(&instantiations);
        tracing::info!(
            env = %self.id,
            builds = collected.builds.len(),
            fetches = collected.fetches.len(),
            containers = collected.containers.len(),
            "templates executed"
        );

        let image_ports = self
            .build_and_fetch(collected.builds, collected.fetches)
            .await?;
        let network = self.ensure_network().await?;
        let containers = collected.containers;
        let addresses = self.assign_ips(&containers)?;
        let published = self.publish_ports(&containers, &image_ports)?;
        let new_hosts: BTreeMap<String, Ipv4Addr> = containers
            .iter()
            .map(ContainerSpec::hostname)
            .zip(addresses.iter().copied())
            .collect();

        let created = self
            .start_containers(containers, &addresses, &published, &network)
            .await?;
        self.wait_until_ready(&created).await?;
        self.state.write().instantiations.extend(instantiations);

        if notify_discovery {
            self.notify_discovery(&new_hosts).await?;
        }
        Ok(())
    }

    /// Stops containers, then waits until their readiness checks fail.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::NotFound` for an unknown id, the driver
    /// error, or `EphemeraError::Readiness` if a check keeps passing.
    pub async fn stop_containers(&self, ids: &[ContainerId]) -> Result<()> {
        self.cycle_containers(ids, false).await
    }

    /// Restarts containers, then waits until their readiness checks pass.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::NotFound` for an unknown id, the driver
    /// error, or `EphemeraError::Readiness` if a check keeps failing.
    pub async fn restart_containers(&self, ids: &[ContainerId]) -> Result<()> {
        self.cycle_containers(ids, true).await
    }

    /// Tears the environment down. Only the first call does any work.
    ///
    /// New passes are refused and the running one is cancelled; teardown
    /// starts once that pass has unwound, so whatever it produced is
    /// released too. Removes containers, the workspace and mount
    /// directories, built images and the network. Every step is attempted.
    ///
    /// # Errors
    ///
    /// Returns the first container removal error, else the network removal
    /// error.
    pub async fn terminate(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.terminating {
                return Ok(());
            }
            state.terminating = true;
        }
        self.cancel.cancel();
        let _pass = self.apply_lock.lock().await;
        let (containers, images, network) = {
            let mut state = self.state.write();
            (
                state.registry.ids(),
                std::mem::take(&mut state.built_images),
                state.network.clone(),
            )
        };
        tracing::info!(env = %self.id, containers = containers.len(), "terminating environment");

        let teardown = CancellationToken::new();
        let mut first_error = None;
        for id in &containers {
            match self
                .engine
                .remove_container(&teardown, id)
                .await
                .map_err(driver_error("remove container", id))
            {
                Ok(()) => tracing::debug!(env = %self.id, container = %id, "container removed"),
                Err(e) => {
                    tracing::error!(env = %self.id, container = %id, error = %e, "cannot remove container");
                    let _ = first_error.get_or_insert(e);
                }
            }
        }

        for dir in [&self.workspace_dir, &self.mount_dir] {
            if let Err(e) = remove_dir(dir).await {
                tracing::error!(env = %self.id, error = %e, "cannot remove directory");
            }
        }

        for tag in &images {
            if let Err(e) = self.engine.remove_image(&teardown, tag).await {
                tracing::warn!(env = %self.id, tag = %tag, error = %e, "cannot remove image");
            }
        }

        let network_result = match &network {
            Some(network) => self
                .engine
                .remove_network(&teardown, &network.id)
                .await
                .map_err(driver_error("remove network", &network.id)),
            None => Ok(()),
        };
        if let Err(e) = &network_result {
            tracing::error!(env = %self.id, error = %e, "cannot remove network");
        }

        tracing::info!(env = %self.id, "environment terminated");
        first_error.map_or(network_result, Err)
    }

    /// Snapshots the environment without any I/O.
    #[must_use]
    pub fn export(&self) -> ExportedEnvironment {
        let state = self.state.read();
        let mut templates: BTreeMap<String, Vec<ExportedInstance>> = BTreeMap::new();
        for (template, index, name, ports) in state.ports.iter() {
            let Some(id) = state.registry.id_of(template, index, name) else {
                continue;
            };
            let instances = templates.entry(template.to_owned()).or_default();
            if instances.len() <= index {
                instances.resize_with(index + 1, ExportedInstance::default);
            }
            let _ = instances[index].containers.insert(
                name.to_owned(),
                ExportedContainer {
                    id: id.clone(),
                    hostname: spec::hostname(name, template, index),
                    ports: ports
                        .iter()
                        .map(|(internal, external)| (internal.to_string(), *external))
                        .collect(),
                },
            );
        }

        ExportedEnvironment {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            description: self.spec.description.clone(),
            workspace_dir: self.workspace_dir.clone(),
            mount_dir: self.mount_dir.clone(),
            network_id: state.network.as_ref().map(|n| n.id.clone()),
            created: self.created,
            last_keep_alive: state.last_keep_alive.unwrap_or(self.created),
            keep_alive: humantime::format_duration(self.keep_alive).to_string(),
            external_address: self.config.export_address.clone(),
            templates,
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(EphemeraError::Config {
                message: format!("environment {} is terminating", self.id),
            })
        }
    }

    fn spawn_watchdog(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::channel(1);
        *self.keep_alive_tx.lock() = Some(tx);
        let period = self.keep_alive;
        let env = Arc::clone(self);
        tracing::info!(
            env = %self.id,
            keep_alive = %humantime::format_duration(period),
            "keepalive watchdog started"
        );

        let _watchdog = tokio::spawn(async move {
            let expiry = tokio::time::sleep(period);
            tokio::pin!(expiry);
            loop {
                tokio::select! {
                    () = env.cancel.cancelled() => return,
                    received = rx.recv() => match received {
                        Some(()) => expiry.as_mut().reset(tokio::time::Instant::now() + period),
                        None => return,
                    },
                    () = &mut expiry => {
                        tracing::info!(env = %env.id, "keepalive expired, terminating");
                        if let Err(e) = env.terminate().await {
                            tracing::error!(env = %env.id, error = %e, "teardown after keepalive expiry");
                        }
                        return;
                    }
                }
            }
        });
    }

    async fn execute_templates(
        &self,
        templates: &[TemplateRef],
        need_discovery: bool,
    ) -> Result<Vec<TemplateInstantiation>> {
        let mut sources = templates
            .iter()
            .map(|tref| {
                TemplateSource::resolve(&self.config.template_dir, &tref.template)
                    .map(|source| (source, tref.parameters.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        if need_discovery {
            sources.push(discovery::template(&self.config.discovery));
        }

        let jobs: Vec<_> = {
            let mut state = self.state.write();
            sources
                .into_iter()
                .map(|(source, parameters)| {
                    let counter = state.counts.entry(source.name().to_owned()).or_default();
                    let index = *counter;
                    *counter += 1;
                    (source, index, parameters)
                })
                .collect()
        };

        let mut fan = FanOut::new("execute templates", &self.cancel);
        for (seq, (source, index, parameters)) in jobs.into_iter().enumerate() {
            let env_id = self.id.clone();
            let workspace_dir = self.workspace_dir.clone();
            let mount_dir = self.mounts_dir();
            fan.spawn(move |cancel| async move {
                let params = ExecuteParams {
                    env_id,
                    workspace_dir,
                    mount_dir,
                    parameters,
                    cancel,
                };
                let inst = sandbox::execute(source, index, params).await?;
                Ok::<_, EphemeraError>((index, seq, inst))
            });
        }

        let mut results = fan.join().await?;
        results.sort_by_key(|(index, seq, _)| (*index, *seq));
        Ok(results.into_iter().map(|(_, _, inst)| inst).collect())
    }

    async fn build_and_fetch(
        &self,
        builds: BTreeMap<String, PathBuf>,
        fetches: BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<Port>>> {
        let built = Arc::new(Mutex::new(Vec::new()));
        let mut fan = FanOut::new("build and fetch images", &self.cancel);

        for (tag, workspace) in builds {
            let engine = Arc::clone(&self.engine);
            let built = Arc::clone(&built);
            let env_id = self.id.clone();
            fan.spawn(move |cancel| async move {
                let dir = workspace.clone();
                let context = tokio::task::spawn_blocking(move || archive::build_context(&dir))
                    .await
                    .map_err(|e| {
                        EphemeraError::driver("pack build context", workspace.display().to_string(), e)
                    })??;
                tracing::info!(env = %env_id, tag = %tag, bytes = context.len(), "building image");
                engine
                    .build_image(&cancel, &tag, context)
                    .await
                    .map_err(driver_error("build image", &tag))?;
                built.lock().push(tag.clone());
                let ports = image_ports(engine.as_ref(), &cancel, &env_id, &tag).await;
                Ok::<_, EphemeraError>((tag, ports))
            });
        }

        for reference in fetches {
            let engine = Arc::clone(&self.engine);
            let env_id = self.id.clone();
            fan.spawn(move |cancel| async move {
                tracing::info!(env = %env_id, reference = %reference, "fetching image");
                engine
                    .fetch_image(&cancel, &reference)
                    .await
                    .map_err(driver_error("fetch image", &reference))?;
                let ports = image_ports(engine.as_ref(), &cancel, &env_id, &reference).await;
                Ok::<_, EphemeraError>((reference, ports))
            });
        }

        let result = fan.join().await;
        let tags = std::mem::take(&mut *built.lock());
        self.state.write().built_images.extend(tags);
        Ok(result?.into_iter().collect())
    }

    async fn ensure_network(&self) -> Result<NetworkHandle> {
        let existing = self.state.read().network.clone();
        if let Some(network) = existing {
            return Ok(network);
        }

        let network = self
            .engine
            .create_network(&self.cancel, &self.id)
            .await
            .map_err(driver_error("create network", &self.id))?;
        tracing::info!(env = %self.id, network = %network.id, subnet = %network.subnet, "network created");
        self.state.write().network = Some(network.clone());

        let mut ips = IpAllocator::new(&network.subnet)?;
        let _gateway = ips.next_ip();
        self.state.write().ips = Some(ips);
        Ok(network)
    }

    fn assign_ips(&self, containers: &[ContainerSpec]) -> Result<Vec<Ipv4Addr>> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let ips = state.ips.as_mut().ok_or_else(|| EphemeraError::Config {
            message: format!("environment {} has no address pool", self.id),
        })?;

        let mut assigned = Vec::with_capacity(containers.len());
        for spec in containers {
            let ip = ips.next_ip().ok_or_else(|| EphemeraError::Exhausted {
                resource: "ip addresses",
                range: ips.subnet(),
            })?;
            let hostname = spec.hostname();
            tracing::debug!(env = %self.id, %ip, hostname = %hostname, "address assigned");
            let _ = state.hosts.insert(hostname, ip);
            assigned.push(ip);
        }
        Ok(assigned)
    }

    fn publish_ports(
        &self,
        containers: &[ContainerSpec],
        image_ports: &BTreeMap<String, Vec<Port>>,
    ) -> Result<Vec<PortMap>> {
        let mut published = Vec::with_capacity(containers.len());
        for spec in containers {
            let internal = if spec.ports.is_empty() {
                image_ports.get(&spec.image).cloned().unwrap_or_default()
            } else {
                spec.ports.clone()
            };

            let mut ports = PortMap::new();
            for port in internal {
                if ports.contains_key(&port) {
                    continue;
                }
                let external = self.ports.next_port()?;
                tracing::debug!(env = %self.id, container = %spec.hostname(), port, external, "publishing port");
                let _ = ports.insert(port, external);
            }

            let agent = discovery::agent_port(spec).map(|api_port| DiscoveryAgent {
                hostname: spec.hostname(),
                url: ports
                    .get(&api_port)
                    .map(|external| discovery::api_url(&self.config.export_address, *external)),
            });

            let mut state = self.state.write();
            state.ports.insert(&spec.template, spec.index, &spec.name, ports.clone());
            if agent.is_some() {
                state.discovery = agent;
            }
            drop(state);
            published.push(ports);
        }
        Ok(published)
    }

    async fn start_containers(
        &self,
        containers: Vec<ContainerSpec>,
        addresses: &[Ipv4Addr],
        published: &[PortMap],
        network: &NetworkHandle,
    ) -> Result<Vec<(ContainerId, ContainerSpec)>> {
        let (views, resolution) = {
            let state = self.state.read();
            let mut views: Vec<ContainerView> = state
                .registry
                .iter()
                .map(|(_, spec)| {
                    ContainerView::new(
                        spec,
                        state.hosts.get(&spec.hostname()).copied(),
                        state.ports.get(&spec.template, spec.index, &spec.name),
                    )
                })
                .collect();
            views.extend(
                containers
                    .iter()
                    .zip(addresses)
                    .zip(published)
                    .map(|((spec, ip), ports)| ContainerView::new(spec, Some(*ip), Some(ports))),
            );
            let resolution = match state
                .discovery
                .as_ref()
                .and_then(|agent| state.hosts.get(&agent.hostname))
            {
                Some(dns) => NameResolution::DiscoveryDns(*dns),
                None => NameResolution::StaticHosts(state.hosts.clone()),
            };
            (Arc::new(views), resolution)
        };
        match &resolution {
            NameResolution::DiscoveryDns(dns) => {
                tracing::info!(env = %self.id, %dns, "using discovery DNS");
            }
            NameResolution::StaticHosts(_) => tracing::info!(env = %self.id, "using static hosts"),
        }

        let no_extra = serde_json::Map::new();
        let mut created = Vec::with_capacity(containers.len());
        for ((mut spec, ip), ports) in containers.into_iter().zip(addresses).zip(published) {
            self.ensure_alive()?;
            let hostname = spec.hostname();

            let mut interpolator = ConfigInterpolator::new(
                &self.config.export_address,
                ContainerView::new(&spec, Some(*ip), Some(ports)),
                Arc::clone(&views),
            );
            for value in spec.environ.values_mut() {
                *value = interpolator.interpolate(value, &no_extra)?;
            }
            for (file, extra) in &spec.interpolate {
                interpolate_file(&mut interpolator, file, extra)?;
                tracing::debug!(env = %self.id, file = %file.display(), "file interpolated");
            }
            let readiness = self.readiness_interpolator(&spec);
            for check in &mut spec.readiness {
                check.interpolate_parameters(&readiness)?;
            }

            let params = RunContainerParams {
                network_id: network.id.clone(),
                ip: *ip,
                hostname: hostname.clone(),
                ports: ports.clone(),
                resolution: resolution.clone(),
                environ: spec.environ.clone(),
                cmd: spec.cmd.clone(),
                entrypoint: spec.entrypoint.clone(),
                mounts: spec.mounts.clone(),
                labels: spec.labels.clone(),
            };
            let id = self
                .engine
                .run_container(&self.cancel, &hostname, &spec.image, &params)
                .await
                .map_err(driver_error("run container", &hostname))?;
            tracing::info!(env = %self.id, container = %hostname, id = %id, %ip, "container started");

            if let Err(e) = self.register(id.clone(), spec.clone()) {
                if let Err(remove) = self
                    .engine
                    .remove_container(&CancellationToken::new(), &id)
                    .await
                {
                    tracing::error!(env = %self.id, container = %id, error = %remove, "cannot remove orphaned container");
                }
                return Err(e);
            }
            created.push((id, spec));
        }
        Ok(created)
    }

    fn register(&self, id: ContainerId, spec: ContainerSpec) -> Result<()> {
        let mut state = self.state.write();
        if state.terminating {
            return Err(EphemeraError::Cancelled);
        }
        state.registry.insert(id, spec);
        Ok(())
    }

    fn readiness_interpolator(&self, owner: &ContainerSpec) -> ReadinessInterpolator {
        let state = self.state.read();
        let local = state
            .ports
            .instance(&owner.template, owner.index)
            .cloned()
            .unwrap_or_default();
        let global = state
            .ports
            .iter()
            .map(|(template, index, name, ports)| {
                (spec::hostname(name, template, index), ports.clone())
            })
            .collect();
        ReadinessInterpolator::new(&self.config.export_address, local, global)
    }

    async fn wait_until_ready(&self, created: &[(ContainerId, ContainerSpec)]) -> Result<()> {
        let checks: Vec<_> = created
            .iter()
            .flat_map(|(_, spec)| spec.readiness.iter().cloned())
            .collect();
        if checks.is_empty() {
            tracing::info!(env = %self.id, "no readiness checks");
            return Ok(());
        }

        let mut fan = FanOut::new("readiness checks", &self.cancel);
        for check in checks {
            let env_id = self.id.clone();
            fan.spawn(move |cancel| async move {
                if check.wait(&cancel, true).await {
                    tracing::info!(env = %env_id, check = %check, "readiness check passed");
                    Ok(())
                } else if cancel.is_cancelled() {
                    Err(EphemeraError::Cancelled)
                } else {
                    Err(EphemeraError::Readiness {
                        check: check.to_string(),
                    })
                }
            });
        }
        let _ = fan.join().await?;
        tracing::info!(env = %self.id, "environment is ready");
        Ok(())
    }

    async fn notify_discovery(&self, hosts: &BTreeMap<String, Ipv4Addr>) -> Result<()> {
        let url = self
            .state
            .read()
            .discovery
            .as_ref()
            .and_then(|agent| agent.url.clone())
            .ok_or_else(|| EphemeraError::Discovery {
                message: format!("environment {} has no reachable discovery agent", self.id),
            })?;
        discovery::notify(&url, hosts).await
    }

    async fn cycle_containers(&self, ids: &[ContainerId], restart: bool) -> Result<()> {
        for id in ids {
            let checks = self
                .state
                .read()
                .registry
                .get(id)
                .map(|spec| spec.readiness.clone())
                .ok_or_else(|| EphemeraError::NotFound {
                    kind: "container",
                    id: id.to_string(),
                })?;

            if restart {
                tracing::info!(env = %self.id, container = %id, "restarting container");
                self.engine
                    .restart_container(&self.cancel, id)
                    .await
                    .map_err(driver_error("restart container", id))?;
            } else {
                tracing::info!(env = %self.id, container = %id, "stopping container");
                self.engine
                    .stop_container(&self.cancel, id)
                    .await
                    .map_err(driver_error("stop container", id))?;
            }

            for check in &checks {
                if !check.wait(&self.cancel, restart).await {
                    return Err(EphemeraError::Readiness {
                        check: check.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn mounts_dir(&self) -> PathBuf {
        self.mount_dir.join("mounts")
    }
}

/// Returns `<name>-<YYYYmmddHHMMSS>-<short random>`.
fn new_env_id(name: &str) -> String {
    format!(
        "{name}-{}-{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        short_id()
    )
}

/// Attributes a driver failure to `operation` on `target`. Failures the
/// driver already attributed, and cancellations, pass through unchanged.
fn driver_error(
    operation: &'static str,
    target: impl fmt::Display,
) -> impl FnOnce(EphemeraError) -> EphemeraError {
    move |error| {
        if matches!(error, EphemeraError::Driver { .. }) || error.is_cancellation() {
            error
        } else {
            EphemeraError::driver(operation, target.to_string(), error)
        }
    }
}

async fn image_ports(
    engine: &dyn ContainerEngine,
    cancel: &CancellationToken,
    env_id: &str,
    tag: &str,
) -> Vec<Port> {
    match engine.image_ports(cancel, tag).await {
        Ok(ports) => {
            tracing::debug!(env = %env_id, tag = %tag, ?ports, "image exposed ports");
            ports
        }
        Err(e) => {
            tracing::warn!(env = %env_id, tag = %tag, error = %e, "cannot read image exposed ports");
            Vec::new()
        }
    }
}

fn interpolate_file(
    interpolator: &mut ConfigInterpolator,
    file: &Path,
    extra: &serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    let text = std::fs::read_to_string(file).map_err(|e| EphemeraError::io(file, e))?;
    let rendered = interpolator.interpolate(&text, extra)?;
    std::fs::write(file, rendered).map_err(|e| EphemeraError::io(file, e))
}

async fn remove_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(EphemeraError::io(dir, e)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_id_contains_name_timestamp_and_suffix() {
        let id = new_env_id("web");
        let parts: Vec<_> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "web");
        assert_eq!(parts[1].len(), 14);
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), ephemera_common::constants::SHORT_ID_LENGTH);
        assert_ne!(new_env_id("web"), id);
    }

    #[test]
    fn driver_error_attributes_only_unattributed_failures() {
        let raw = EphemeraError::io(
            "/run/engine.sock",
            std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        );
        let err = driver_error("build image", "eph-t-app:e-0")(raw);
        let EphemeraError::Driver { operation, target, message } = &err else {
            panic!("expected a driver error, got {err}");
        };
        assert_eq!(*operation, "build image");
        assert_eq!(target, "eph-t-app:e-0");
        assert!(message.contains("/run/engine.sock"), "{message}");

        let attributed = EphemeraError::driver("pull", "redis:7", "denied");
        let err = driver_error("fetch image", "redis:7")(attributed);
        assert!(matches!(err, EphemeraError::Driver { operation: "pull", .. }), "{err}");
        assert!(matches!(
            driver_error("run container", "x")(EphemeraError::Cancelled),
            EphemeraError::Cancelled
        ));
    }

    #[test]
    fn collected_deduplicates_images_by_tag() {
        let fetch = |workspace: &str| ImageSpec::Fetch {
            reference: "redis:7".into(),
            workspace: PathBuf::from(workspace),
            containers: vec![ContainerSpec::new("cache", "redis:7", "t", 0)],
        };
        let instantiations = vec![
            TemplateInstantiation {
                template: "t".into(),
                index: 0,
                images: vec![fetch("/a")],
            },
            TemplateInstantiation {
                template: "t".into(),
                index: 1,
                images: vec![
                    fetch("/b"),
                    ImageSpec::Build {
                        name: "app".into(),
                        tag: "eph-t-app:e-1".into(),
                        workspace: PathBuf::from("/c"),
                        containers: Vec::new(),
                    },
                ],
            },
        ];
        let collected = Collected::from_instantiations(&instantiations);
        assert_eq!(collected.fetches.len(), 1);
        assert_eq!(collected.builds.len(), 1);
        assert_eq!(collected.containers.len(), 2);
    }

    #[tokio::test]
    async fn remove_dir_ignores_missing_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        remove_dir(&dir.path().join("missing")).await.expect("missing is fine");
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        remove_dir(&dir.path().join("a")).await.expect("remove");
        assert!(!dir.path().join("a").exists());
    }
}
