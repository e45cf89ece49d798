//! Containers created by an environment.

use std::collections::BTreeMap;

use ephemera_common::types::ContainerId;
use ephemera_template::spec::ContainerSpec;

/// `container id -> spec` plus `template -> [index] -> name -> id`.
#[derive(Debug, Clone, Default)]
pub struct ContainerRegistry {
    specs: BTreeMap<ContainerId, ContainerSpec>,
    ids: BTreeMap<String, Vec<BTreeMap<String, ContainerId>>>,
}

impl ContainerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a created container.
    pub fn insert(&mut self, id: ContainerId, spec: ContainerSpec) {
        let instances = self.ids.entry(spec.template.clone()).or_default();
        if instances.len() <= spec.index {
            instances.resize_with(spec.index + 1, BTreeMap::new);
        }
        let _ = instances[spec.index].insert(spec.name.clone(), id.clone());
        let _ = self.specs.insert(id, spec);
    }

    /// Returns the declaration of a container.
    #[must_use]
    pub fn get(&self, id: &ContainerId) -> Option<&ContainerSpec> {
        self.specs.get(id)
    }

    /// Looks up a container id by owner and name.
    #[must_use]
    pub fn id_of(&self, template: &str, index: usize, name: &str) -> Option<&ContainerId> {
        self.ids.get(template)?.get(index)?.get(name)
    }

    /// Iterates over every created container.
    pub fn iter(&self) -> impl Iterator<Item = (&ContainerId, &ContainerSpec)> {
        self.specs.iter()
    }

    /// Returns the ids of every created container.
    #[must_use]
    pub fn ids(&self) -> Vec<ContainerId> {
        self.specs.keys().cloned().collect()
    }

    /// Returns the number of created containers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// Returns `true` if no container was created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
