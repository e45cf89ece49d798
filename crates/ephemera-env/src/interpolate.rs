//! Placeholder data for container configuration and readiness checks.
//!
//! Configuration placeholders (environment values, files mounted with
//! `interpolate`) see:
//!
//! - `this`: the container being configured (`name`, `hostname`, `ip`,
//!   `labels`, `ports` keyed by internal port).
//! - `external_address`: where clients reach published ports.
//! - `containers`: every container of the environment.
//! - `extra`: data attached to the mounted file.
//! - `self_port(port=N)`: the external port published for internal port `N`.
//! - `containers_with_labels(labels=[..])`: containers carrying any of the
//!   labels.
//! - `container_with_label(label=L, value=V)`: the first container whose
//!   label `L` equals `V` (any value when `V` is empty), or null.
//!
//! Readiness check parameters see only `external_address` and
//! `exposed_port(container=NAME, port=N)`. `NAME` is looked up among the
//! owning instantiation's containers first, then as a hostname.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use ephemera_common::error::Result;
use ephemera_common::types::Port;
use ephemera_template::readiness::ParamInterpolator;
use ephemera_template::render::{Renderer, required_arg};
use ephemera_template::spec::ContainerSpec;
use parking_lot::Mutex;
use serde::Serialize;
use tera::{Context, Value};

use crate::ports::PortMap;

/// What placeholders can see of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerView {
    /// Container name.
    pub name: String,
    /// Fully qualified hostname.
    pub hostname: String,
    /// Address inside the environment network.
    pub ip: Option<String>,
    /// Labels.
    pub labels: BTreeMap<String, String>,
    /// Published ports, internal (as string) to external.
    pub ports: BTreeMap<String, Port>,
}

impl ContainerView {
    /// Builds the view of `spec` with its allocated address and ports.
    #[must_use]
    pub fn new(spec: &ContainerSpec, ip: Option<Ipv4Addr>, ports: Option<&PortMap>) -> Self {
        Self {
            name: spec.name.clone(),
            hostname: spec.hostname(),
            ip: ip.map(|ip| ip.to_string()),
            labels: spec.labels.clone(),
            ports: ports
                .into_iter()
                .flatten()
                .map(|(internal, external)| (internal.to_string(), *external))
                .collect(),
        }
    }
}

/// Interpolates environment values and mounted files of one container.
pub struct ConfigInterpolator {
    external_address: String,
    this: ContainerView,
    containers: Arc<Vec<ContainerView>>,
    renderer: Renderer,
}

impl std::fmt::Debug for ConfigInterpolator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigInterpolator")
            .field("this", &self.this.hostname)
            .finish_non_exhaustive()
    }
}

impl ConfigInterpolator {
    /// Creates the interpolator of `this` among `containers`.
    #[must_use]
    pub fn new(
        external_address: &str,
        this: ContainerView,
        containers: Arc<Vec<ContainerView>>,
    ) -> Self {
        let mut renderer = Renderer::new();

        let own_ports = this.ports.clone();
        let own_name = this.hostname.clone();
        renderer.register_function("self_port", move |args| {
            let port: Port = required_arg("self_port", args, "port")?;
            own_ports
                .get(&port.to_string())
                .map(|external| Value::from(*external))
                .ok_or_else(|| {
                    tera::Error::msg(format!("port {port} is not exposed for {own_name}"))
                })
        });

        let all = Arc::clone(&containers);
        renderer.register_function("containers_with_labels", move |args| {
            let labels: Vec<String> = required_arg("containers_with_labels", args, "labels")?;
            let matching: Vec<&ContainerView> = all
                .iter()
                .filter(|c| labels.iter().any(|label| c.labels.contains_key(label)))
                .collect();
            to_value(&matching)
        });

        let all = Arc::clone(&containers);
        renderer.register_function("container_with_label", move |args| {
            let label: String = required_arg("container_with_label", args, "label")?;
            let value = optional_str(args, "value");
            all.iter()
                .find(|c| {
                    c.labels
                        .get(&label)
                        .is_some_and(|v| value.is_empty() || *v == value)
                })
                .map_or(Ok(Value::Null), to_value)
        });

        Self {
            external_address: external_address.to_owned(),
            this,
            containers,
            renderer,
        }
    }

    /// Renders `text` with `extra` exposed as `extra`.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Interpolation` naming the offending text.
    pub fn interpolate(
        &mut self,
        text: &str,
        extra: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let mut context = Context::new();
        context.insert("this", &self.this);
        context.insert("external_address", &self.external_address);
        context.insert("containers", self.containers.as_slice());
        context.insert("extra", extra);
        self.renderer.render(text, &context)
    }
}

/// Interpolates readiness check parameters of one container.
pub struct ReadinessInterpolator {
    external_address: String,
    renderer: Mutex<Renderer>,
}

impl std::fmt::Debug for ReadinessInterpolator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessInterpolator")
            .field("external_address", &self.external_address)
            .finish_non_exhaustive()
    }
}

impl ReadinessInterpolator {
    /// Creates the interpolator. `local` maps container names of the owning
    /// instantiation to their ports, `global` maps hostnames.
    #[must_use]
    pub fn new(
        external_address: &str,
        local: BTreeMap<String, PortMap>,
        global: BTreeMap<String, PortMap>,
    ) -> Self {
        let mut renderer = Renderer::new();
        renderer.register_function("exposed_port", move |args| {
            let container: String = required_arg("exposed_port", args, "container")?;
            let port: Port = required_arg("exposed_port", args, "port")?;
            let ports = local
                .get(&container)
                .or_else(|| global.get(&container))
                .ok_or_else(|| tera::Error::msg(format!("no ports for container {container}")))?;
            ports.get(&port).map(|external| Value::from(*external)).ok_or_else(|| {
                tera::Error::msg(format!("port {port} is not exposed for {container}"))
            })
        });
        Self {
            external_address: external_address.to_owned(),
            renderer: Mutex::new(renderer),
        }
    }
}

impl ParamInterpolator for ReadinessInterpolator {
    fn interpolate(&self, text: &str) -> Result<String> {
        let mut context = Context::new();
        context.insert("external_address", &self.external_address);
        self.renderer.lock().render(text, &context)
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> tera::Result<Value> {
    serde_json::to_value(value).map_err(|e| tera::Error::msg(e.to_string()))
}

fn optional_str(args: &HashMap<String, Value>, name: &str) -> String {
    args.get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use ephemera_common::error::EphemeraError;

    use super::*;

    fn spec(name: &str, labels: &[(&str, &str)]) -> ContainerSpec {
        let mut spec = ContainerSpec::new(name, "img", "web", 0);
        for (k, v) in labels {
            let _ = spec.labels.insert((*k).into(), (*v).into());
        }
        spec
    }

    fn views() -> Arc<Vec<ContainerView>> {
        Arc::new(vec![
            ContainerView::new(
                &spec("api", &[("role", "backend")]),
                Some(Ipv4Addr::new(10, 0, 0, 2)),
                Some(&PortMap::from([(8080, 20010)])),
            ),
            ContainerView::new(
                &spec("db", &[("role", "storage"), ("primary", "yes")]),
                Some(Ipv4Addr::new(10, 0, 0, 3)),
                Some(&PortMap::from([(5432, 20011)])),
            ),
        ])
    }

    fn interpolator() -> ConfigInterpolator {
        let all = views();
        ConfigInterpolator::new("localhost", all[0].clone(), all)
    }

    #[test]
    fn self_port_and_external_address() {
        let out = interpolator()
            .interpolate("{{ external_address }}:{{ self_port(port=8080) }}", &serde_json::Map::new())
            .expect("interpolate");
        assert_eq!(out, "localhost:20010");
    }

    #[test]
    fn unexposed_self_port_fails_descriptively() {
        let err = interpolator()
            .interpolate("{{ self_port(port=9999) }}", &serde_json::Map::new())
            .expect_err("unexposed");
        assert!(matches!(err, EphemeraError::Interpolation { .. }));
        assert!(err.to_string().contains("port 9999 is not exposed for api.0.web.eph"), "{err}");
    }

    #[test]
    fn label_lookups_select_containers() {
        let mut i = interpolator();
        let out = i
            .interpolate(
                "{% set found = containers_with_labels(labels=[\"primary\"]) %}{% for c in found %}{{ c.hostname }}={{ c.ip }}{% endfor %}",
                &serde_json::Map::new(),
            )
            .expect("interpolate");
        assert_eq!(out, "db.0.web.eph=10.0.0.3");

        let out = i
            .interpolate(
                "{% set c = container_with_label(label=\"role\", value=\"storage\") %}{{ c.name }}",
                &serde_json::Map::new(),
            )
            .expect("interpolate");
        assert_eq!(out, "db");

        let out = i
            .interpolate(
                "{% set c = container_with_label(label=\"missing\") %}{% if c %}yes{% else %}no{% endif %}",
                &serde_json::Map::new(),
            )
            .expect("interpolate");
        assert_eq!(out, "no");
    }

    #[test]
    fn extra_and_this_are_visible() {
        let mut extra = serde_json::Map::new();
        let _ = extra.insert("key".into(), "WUT".into());
        let out = interpolator()
            .interpolate("{{ this.hostname }}\n>>>{{ extra.key }}<<<\n", &extra)
            .expect("interpolate");
        assert_eq!(out, "api.0.web.eph\n>>>WUT<<<\n");
    }

    #[test]
    fn readiness_lookup_prefers_local_names() {
        let local = BTreeMap::from([("api".to_owned(), PortMap::from([(8080, 21000)]))]);
        let global = BTreeMap::from([
            ("api".to_owned(), PortMap::from([(8080, 1)])),
            ("db.0.web.eph".to_owned(), PortMap::from([(5432, 21001)])),
        ]);
        let i = ReadinessInterpolator::new("127.0.0.1", local, global);

        let out = i
            .interpolate("{{ external_address }}:{{ exposed_port(container=\"api\", port=8080) }}")
            .expect("local");
        assert_eq!(out, "127.0.0.1:21000");
        let out = i
            .interpolate("{{ exposed_port(container=\"db.0.web.eph\", port=5432) }}")
            .expect("global");
        assert_eq!(out, "21001");
    }

    #[test]
    fn readiness_lookup_of_unknown_container_or_port_fails() {
        let i = ReadinessInterpolator::new("127.0.0.1", BTreeMap::new(), BTreeMap::new());
        let err = i
            .interpolate("{{ exposed_port(container=\"ghost\", port=1) }}")
            .expect_err("unknown");
        assert!(err.to_string().contains("no ports for container ghost"), "{err}");
    }
}
