//! The built-in discovery agent.
//!
//! Unless an environment disables it, every apply of its initial templates
//! also instantiates the embedded `discovery` template. The container it
//! declares is marked with [`DISCOVERY_LABEL`]; the environment then points
//! every container's resolver at it and, for later apply passes, PATCHes
//! its HTTP API with the new hostnames.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ephemera_common::config::DiscoveryConfig;
use ephemera_common::constants::{
    DISCOVERY_API_PATH, DISCOVERY_API_PORT, DISCOVERY_LABEL, DISCOVERY_NOTIFY_TIMEOUT,
    DISCOVERY_PORT_LABEL, DISCOVERY_TEMPLATE,
};
use ephemera_common::error::{EphemeraError, Result};
use ephemera_common::types::{Port, TemplateParams};
use ephemera_template::sandbox::TemplateSource;
use ephemera_template::spec::ContainerSpec;

const SCRIPT: &str = include_str!("discovery.tpl.rhai");

/// Returns the embedded discovery template and its parameters.
#[must_use]
pub fn template(config: &DiscoveryConfig) -> (TemplateSource, TemplateParams) {
    let mut params = TemplateParams::new();
    let _ = params.insert("image".into(), config.image.clone().into());
    let _ = params.insert("recursor".into(), config.dns_recursor.clone().into());
    let _ = params.insert("port".into(), DISCOVERY_API_PORT.into());
    (TemplateSource::embedded(DISCOVERY_TEMPLATE, SCRIPT), params)
}

/// Returns the API port of `spec` if it is a discovery agent.
#[must_use]
pub fn agent_port(spec: &ContainerSpec) -> Option<Port> {
    if spec.label(DISCOVERY_LABEL) != Some("true") {
        return None;
    }
    Some(
        spec.label(DISCOVERY_PORT_LABEL)
            .and_then(|port| port.trim().parse().ok())
            .unwrap_or(DISCOVERY_API_PORT),
    )
}

/// Returns the agent API URL reachable through a published port.
#[must_use]
pub fn api_url(external_address: &str, external_port: Port) -> String {
    format!("http://{external_address}:{external_port}{DISCOVERY_API_PATH}")
}

/// Adds `hosts` to the agent behind `url`.
///
/// # Errors
///
/// Returns `EphemeraError::Discovery` on transport errors or a status other
/// than 200.
pub async fn notify(url: &str, hosts: &BTreeMap<String, Ipv4Addr>) -> Result<()> {
    let body: BTreeMap<String, String> = hosts
        .iter()
        .map(|(hostname, ip)| (format!("{hostname}."), ip.to_string()))
        .collect();
    let failed = |message: String| EphemeraError::Discovery { message };

    let client = reqwest::Client::builder()
        .timeout(DISCOVERY_NOTIFY_TIMEOUT)
        .build()
        .map_err(|e| failed(e.to_string()))?;
    let response = client
        .patch(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| failed(format!("{url}: {e}")))?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(failed(format!(
            "expected 200 from {url} but got {}",
            response.status()
        )));
    }
    tracing::debug!(url, hosts = body.len(), "discovery agent updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use super::*;

    async fn agent(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buf = [0_u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.expect("read");
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if n == 0 || (text.contains("\r\n\r\n") && text.trim_end().ends_with('}')) {
                    break;
                }
            }
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            stream.write_all(response.as_bytes()).await.expect("write");
            String::from_utf8_lossy(&request).into_owned()
        });
        (api_url("127.0.0.1", port), handle)
    }

    #[tokio::test]
    async fn notify_patches_hostnames_with_trailing_dot() {
        let (url, server) = agent("200 OK").await;
        let hosts = BTreeMap::from([("api.0.web.eph".to_owned(), Ipv4Addr::new(10, 0, 0, 5))]);
        notify(&url, &hosts).await.expect("notify");

        let request = server.await.expect("server");
        assert!(request.starts_with("PATCH /api/v1/domains"), "{request}");
        assert!(request.contains(r#"{"api.0.web.eph.":"10.0.0.5"}"#), "{request}");
    }

    #[tokio::test]
    async fn notify_rejects_non_200() {
        let (url, _server) = agent("500 Internal Server Error").await;
        let err = notify(&url, &BTreeMap::new()).await.expect_err("status");
        assert!(matches!(err, EphemeraError::Discovery { .. }));
        assert!(err.to_string().contains("500"), "{err}");
    }

    #[test]
    fn agent_port_requires_marker_label() {
        let mut spec = ContainerSpec::new("discovery", "img", "discovery", 0);
        assert_eq!(agent_port(&spec), None);
        let _ = spec.labels.insert(DISCOVERY_LABEL.into(), "true".into());
        assert_eq!(agent_port(&spec), Some(DISCOVERY_API_PORT));
        let _ = spec.labels.insert(DISCOVERY_PORT_LABEL.into(), "9090".into());
        assert_eq!(agent_port(&spec), Some(9090));
    }

    #[tokio::test]
    async fn embedded_template_declares_marked_agent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (source, parameters) = template(&DiscoveryConfig::default());
        let inst = ephemera_template::sandbox::execute(
            source,
            0,
            ephemera_template::sandbox::ExecuteParams {
                env_id: "t-20240101000000-00000000".into(),
                workspace_dir: dir.path().join("ws"),
                mount_dir: dir.path().join("mounts"),
                parameters,
                cancel: CancellationToken::new(),
            },
        )
        .await
        .expect("execute");

        let agent = inst.containers().next().expect("agent");
        assert_eq!(agent.hostname(), "discovery.0.discovery.eph");
        assert_eq!(agent_port(agent), Some(DISCOVERY_API_PORT));
        assert_eq!(agent.ports, vec![DISCOVERY_API_PORT]);
        assert!(agent.cmd.contains(&"--recursors=8.8.8.8".to_owned()));
        assert_eq!(agent.interpolate.len(), 1);
        assert!(agent.mounts[0].host_file.starts_with(dir.path().join("mounts")));
    }
}
