//! Published port bookkeeping.

use std::collections::BTreeMap;

use ephemera_common::types::Port;

/// Internal port to external port of one container.
pub type PortMap = BTreeMap<Port, Port>;

/// `template -> instance index -> container name -> ports`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortTable {
    templates: BTreeMap<String, BTreeMap<usize, BTreeMap<String, PortMap>>>,
}

impl PortTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the published ports of a container, replacing earlier ones.
    pub fn insert(&mut self, template: &str, index: usize, container: &str, ports: PortMap) {
        let _ = self
            .templates
            .entry(template.to_owned())
            .or_default()
            .entry(index)
            .or_default()
            .insert(container.to_owned(), ports);
    }

    /// Returns the published ports of a container.
    #[must_use]
    pub fn get(&self, template: &str, index: usize, container: &str) -> Option<&PortMap> {
        self.templates.get(template)?.get(&index)?.get(container)
    }

    /// Returns the containers of one instantiation with their ports.
    #[must_use]
    pub fn instance(&self, template: &str, index: usize) -> Option<&BTreeMap<String, PortMap>> {
        self.templates.get(template)?.get(&index)
    }

    /// Iterates over `(template, index, container, ports)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, &str, &PortMap)> {
        self.templates.iter().flat_map(|(template, instances)| {
            instances.iter().flat_map(move |(index, containers)| {
                containers
                    .iter()
                    .map(move |(name, ports)| (template.as_str(), *index, name.as_str(), ports))
            })
        })
    }

    /// Returns `true` if no container published a port.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
