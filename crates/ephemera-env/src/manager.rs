//! The set of live environments of one process.

use std::collections::BTreeMap;
use std::sync::Arc;

use ephemera_common::config::EngineConfig;
use ephemera_common::error::{EphemeraError, Result};
use ephemera_common::types::{ContainerId, EnvironmentSpec, TemplateRef};
use ephemera_core::ports::PortAllocator;
use ephemera_runtime::engine::ContainerEngine;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::environment::{EnvParams, Environment};
use crate::export::ExportedEnvironment;

/// Creates, looks up and tears down environments sharing one runtime and
/// one external port range.
pub struct EnvManager {
    engine: Arc<dyn ContainerEngine>,
    ports: Arc<PortAllocator>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
    envs: RwLock<BTreeMap<String, Arc<Environment>>>,
}

impl std::fmt::Debug for EnvManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvManager")
            .field("ports", &self.ports)
            .field("environments", &self.envs.read().len())
            .finish_non_exhaustive()
    }
}

impl EnvManager {
    /// Creates a manager.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Config` for an invalid configuration.
    pub fn new(config: EngineConfig, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        config.validate()?;
        let ports = PortAllocator::new(config.ports.min, config.ports.max)?;
        Ok(Self {
            engine,
            ports: Arc::new(ports),
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            envs: RwLock::new(BTreeMap::new()),
        })
    }

    /// Returns the engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Creates an environment and registers it.
    ///
    /// # Errors
    ///
    /// Returns the creation error; nothing is registered then.
    pub async fn create(&self, spec: EnvironmentSpec) -> Result<Arc<Environment>> {
        let env = Environment::create(EnvParams {
            spec,
            engine: Arc::clone(&self.engine),
            ports: Arc::clone(&self.ports),
            config: Arc::clone(&self.config),
            cancel: self.cancel.clone(),
        })
        .await?;
        let _ = self
            .envs
            .write()
            .insert(env.id().to_owned(), Arc::clone(&env));
        Ok(env)
    }

    /// Looks up a live environment.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::NotFound` for unknown or terminated ids.
    pub fn get(&self, id: &str) -> Result<Arc<Environment>> {
        self.envs
            .read()
            .get(id)
            .filter(|env| env.is_alive())
            .cloned()
            .ok_or_else(|| EphemeraError::NotFound {
                kind: "environment",
                id: id.to_owned(),
            })
    }

    /// Snapshots every live environment, dropping terminated ones.
    pub fn list(&self) -> Vec<ExportedEnvironment> {
        let mut envs = self.envs.write();
        envs.retain(|_, env| env.is_alive());
        envs.values().map(|env| env.export()).collect()
    }

    /// Applies templates to an existing environment. New hostnames are
    /// pushed to its discovery agent if it runs one.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::NotFound` or the apply error.
    pub async fn apply(&self, id: &str, templates: &[TemplateRef]) -> Result<ExportedEnvironment> {
        let env = self.get(id)?;
        env.apply_templates(templates, false, env.has_discovery())
            .await?;
        Ok(env.export())
    }

    /// Resets the keepalive timer of an environment.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::NotFound` for unknown ids.
    pub fn keep_alive(&self, id: &str) -> Result<()> {
        self.get(id)?.keep_alive();
        Ok(())
    }

    /// Stops containers of an environment.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::NotFound` or the stop error.
    pub async fn stop_containers(&self, id: &str, containers: &[ContainerId]) -> Result<()> {
        self.get(id)?.stop_containers(containers).await
    }

    /// Restarts containers of an environment.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::NotFound` or the restart error.
    pub async fn restart_containers(&self, id: &str, containers: &[ContainerId]) -> Result<()> {
        self.get(id)?.restart_containers(containers).await
    }

    /// Tears an environment down and forgets it.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::NotFound` or the teardown error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let env = self
            .envs
            .write()
            .remove(id)
            .ok_or_else(|| EphemeraError::NotFound {
                kind: "environment",
                id: id.to_owned(),
            })?;
        env.terminate().await
    }

    /// Tears every environment down, then cancels in-flight work.
    ///
    /// # Errors
    ///
    /// Returns the first teardown error; every environment is still
    /// attempted.
    pub async fn shutdown(&self) -> Result<()> {
        let envs: Vec<_> = std::mem::take(&mut *self.envs.write())
            .into_values()
            .collect();
        tracing::info!(environments = envs.len(), "shutting down");

        let mut first_error = None;
        for env in envs {
            if let Err(e) = env.terminate().await {
                tracing::error!(env = %env.id(), error = %e, "teardown during shutdown failed");
                let _ = first_error.get_or_insert(e);
            }
        }
        self.cancel.cancel();
        first_error.map_or(Ok(()), Err)
    }
}
