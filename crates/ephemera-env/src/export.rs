//! Serializable snapshot of an environment.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ephemera_common::types::{ContainerId, Port};
use serde::{Deserialize, Serialize};

/// A created container as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedContainer {
    /// Driver container id.
    pub id: ContainerId,
    /// Fully qualified hostname.
    pub hostname: String,
    /// Internal port (as string) to external port.
    pub ports: BTreeMap<String, Port>,
}

/// One instantiation of a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedInstance {
    /// Containers by name.
    pub containers: BTreeMap<String, ExportedContainer>,
}

/// Immutable view of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedEnvironment {
    /// Environment id.
    pub id: String,
    /// Requested name.
    pub name: String,
    /// Requested description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Workspace directory.
    pub workspace_dir: PathBuf,
    /// Mount directory.
    pub mount_dir: PathBuf,
    /// Network id, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last keepalive (creation time if none was received).
    pub last_keep_alive: DateTime<Utc>,
    /// Keepalive period, humantime notation; `0s` never expires.
    pub keep_alive: String,
    /// Address clients use to reach published ports.
    pub external_address: String,
    /// `template -> [instance index] -> containers`.
    pub templates: BTreeMap<String, Vec<ExportedInstance>>,
}

impl ExportedEnvironment {
    /// Looks up a container by owner and name.
    #[must_use]
    pub fn container(&self, template: &str, index: usize, name: &str) -> Option<&ExportedContainer> {
        self.templates.get(template)?.get(index)?.containers.get(name)
    }

    /// Returns the number of exported containers.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.templates
            .values()
            .flatten()
            .map(|instance| instance.containers.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exported() -> ExportedEnvironment {
        let container = ExportedContainer {
            id: ContainerId::new("ctr-1"),
            hostname: "api.1.web.eph".into(),
            ports: BTreeMap::from([("8080".to_owned(), 20001)]),
        };
        ExportedEnvironment {
            id: "web-20240101000000-abcd1234".into(),
            name: "web".into(),
            description: String::new(),
            workspace_dir: PathBuf::from("/tmp/ws"),
            mount_dir: PathBuf::from("/tmp/mounts"),
            network_id: Some("net-1".into()),
            created: DateTime::<Utc>::UNIX_EPOCH,
            last_keep_alive: DateTime::<Utc>::UNIX_EPOCH,
            keep_alive: "2m".into(),
            external_address: "127.0.0.1".into(),
            templates: BTreeMap::from([(
                "web".to_owned(),
                vec![
                    ExportedInstance::default(),
                    ExportedInstance {
                        containers: BTreeMap::from([("api".to_owned(), container)]),
                    },
                ],
            )]),
        }
    }

    #[test]
    fn container_lookup_by_owner_and_name() {
        let env = exported();
        assert_eq!(env.container_count(), 1);
        let api = env.container("web", 1, "api").expect("container");
        assert_eq!(api.ports["8080"], 20001);
        assert!(env.container("web", 0, "api").is_none());
    }

    #[test]
    fn json_uses_string_port_keys_and_skips_empty_fields() {
        let json = serde_json::to_value(exported()).expect("json");
        assert_eq!(json["templates"]["web"][1]["containers"]["api"]["ports"]["8080"], 20001);
        assert!(json.get("description").is_none());
        assert_eq!(json["network_id"], "net-1");
    }
}
