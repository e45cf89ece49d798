//! Environment lifecycle against the recording dry-run driver.
//!
//! Templates live in `tests/templates`. Every test gets its own workspace
//! and mount directories and its own driver, so driver call logs are exact.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ephemera_common::config::{DiscoveryConfig, EngineConfig, PortRange};
use ephemera_common::constants::DEFAULT_DISCOVERY_IMAGE;
use ephemera_common::error::EphemeraError;
use async_trait::async_trait;
use ephemera_common::types::{ContainerId, EnvOptions, EnvironmentSpec, Port, TemplateRef};
use ephemera_env::environment::Environment;
use ephemera_env::manager::EnvManager;
use ephemera_runtime::dry_run::{Call, DryRunEngine, Operation};
use ephemera_runtime::engine::{
    ContainerEngine, NameResolution, NetworkHandle, RunContainerParams,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const PORT_MIN: u16 = 41_000;
const PORT_MAX: u16 = 41_999;

struct Harness {
    dirs: tempfile::TempDir,
    engine: Arc<DryRunEngine>,
    manager: EnvManager,
}

impl Harness {
    fn new(engine: DryRunEngine) -> Self {
        let engine = Arc::new(engine);
        let driver: Arc<dyn ContainerEngine> = Arc::<DryRunEngine>::clone(&engine);
        Self::with_driver(engine, driver)
    }

    /// Records through `engine` while the environment talks to `driver`.
    fn with_driver(engine: Arc<DryRunEngine>, driver: Arc<dyn ContainerEngine>) -> Self {
        let dirs = tempfile::tempdir().expect("tempdir");
        let config = EngineConfig {
            template_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/templates"),
            workspace_dir: dirs.path().join("ws"),
            mount_dir: dirs.path().join("mounts"),
            ports: PortRange {
                min: PORT_MIN,
                max: PORT_MAX,
            },
            export_address: "127.0.0.1".into(),
            default_keep_alive: Duration::ZERO,
            discovery: DiscoveryConfig::default(),
        };
        let manager = EnvManager::new(config, driver).expect("manager");
        Self {
            dirs,
            engine,
            manager,
        }
    }

    async fn create(&self, templates: Vec<TemplateRef>) -> Arc<Environment> {
        self.manager
            .create(spec(templates, static_hosts()))
            .await
            .expect("create")
    }

    fn runs(&self) -> Vec<(String, String, RunContainerParams)> {
        self.engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::RunContainer { name, tag, params } => Some((name, tag, params)),
                _ => None,
            })
            .collect()
    }

    fn run_of(&self, hostname: &str) -> RunContainerParams {
        self.runs()
            .into_iter()
            .find(|(name, _, _)| name == hostname)
            .map(|(_, _, params)| params)
            .expect("container was started")
    }

    fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.engine.calls().iter().filter(|call| matches(call)).count()
    }
}

fn static_hosts() -> EnvOptions {
    EnvOptions {
        keep_alive: None,
        disable_discovery: true,
    }
}

fn spec(templates: Vec<TemplateRef>, options: EnvOptions) -> EnvironmentSpec {
    EnvironmentSpec {
        name: "test".into(),
        description: String::new(),
        templates,
        options,
    }
}

fn with_keep_alive(keep_alive: Duration) -> EnvOptions {
    EnvOptions {
        keep_alive: Some(keep_alive),
        disable_discovery: true,
    }
}

/// Dry-run driver whose builds ignore cancellation and take `build_delay`,
/// or fail with an error the driver did not attribute.
struct UnrulyBuilds {
    inner: Arc<DryRunEngine>,
    build_delay: Duration,
    unattributed_failure: bool,
}

impl UnrulyBuilds {
    fn slow(inner: &Arc<DryRunEngine>, build_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::clone(inner),
            build_delay,
            unattributed_failure: false,
        })
    }

    fn failing(inner: &Arc<DryRunEngine>) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::clone(inner),
            build_delay: Duration::ZERO,
            unattributed_failure: true,
        })
    }
}

#[async_trait]
impl ContainerEngine for UnrulyBuilds {
    async fn create_network(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> ephemera_common::error::Result<NetworkHandle> {
        self.inner.create_network(cancel, name).await
    }

    async fn build_image(
        &self,
        _cancel: &CancellationToken,
        tag: &str,
        context: Vec<u8>,
    ) -> ephemera_common::error::Result<()> {
        if self.unattributed_failure {
            return Err(EphemeraError::io(
                "/run/engine.sock",
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            ));
        }
        tokio::time::sleep(self.build_delay).await;
        self.inner
            .build_image(&CancellationToken::new(), tag, context)
            .await
    }

    async fn image_ports(
        &self,
        cancel: &CancellationToken,
        tag: &str,
    ) -> ephemera_common::error::Result<Vec<Port>> {
        self.inner.image_ports(cancel, tag).await
    }

    async fn fetch_image(
        &self,
        cancel: &CancellationToken,
        reference: &str,
    ) -> ephemera_common::error::Result<()> {
        self.inner.fetch_image(cancel, reference).await
    }

    async fn run_container(
        &self,
        cancel: &CancellationToken,
        name: &str,
        tag: &str,
        params: &RunContainerParams,
    ) -> ephemera_common::error::Result<ContainerId> {
        self.inner.run_container(cancel, name, tag, params).await
    }

    async fn stop_container(
        &self,
        cancel: &CancellationToken,
        id: &ContainerId,
    ) -> ephemera_common::error::Result<()> {
        self.inner.stop_container(cancel, id).await
    }

    async fn restart_container(
        &self,
        cancel: &CancellationToken,
        id: &ContainerId,
    ) -> ephemera_common::error::Result<()> {
        self.inner.restart_container(cancel, id).await
    }

    async fn remove_container(
        &self,
        cancel: &CancellationToken,
        id: &ContainerId,
    ) -> ephemera_common::error::Result<()> {
        self.inner.remove_container(cancel, id).await
    }

    async fn remove_image(
        &self,
        cancel: &CancellationToken,
        tag: &str,
    ) -> ephemera_common::error::Result<()> {
        self.inner.remove_image(cancel, tag).await
    }

    async fn remove_network(
        &self,
        cancel: &CancellationToken,
        id: &str,
    ) -> ephemera_common::error::Result<()> {
        self.inner.remove_network(cancel, id).await
    }
}

async fn wait_until_dead(env: &Environment, engine: &DryRunEngine) {
    for _ in 0..100 {
        if !env.is_alive() && engine.live_networks().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("environment {} still alive", env.id());
}

// ── Creation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn create_fetches_image_before_network_and_starts_container() {
    let h = Harness::new(DryRunEngine::new());
    let env = h.create(vec![TemplateRef::new("simple")]).await;

    assert!(env.id().starts_with("test-"));
    let calls = h.engine.calls();
    assert_eq!(
        calls[0],
        Call::FetchImage {
            reference: "alpine:3".into()
        }
    );
    let network_at = calls
        .iter()
        .position(|call| matches!(call, Call::CreateNetwork { name } if name == env.id()))
        .expect("network created");
    assert!(network_at > 0);

    let runs = h.runs();
    assert_eq!(runs.len(), 1);
    let (name, tag, params) = &runs[0];
    assert_eq!(name, "main.0.simple.eph");
    assert_eq!(tag, "alpine:3");
    assert_eq!(params.network_id, "net-0");
    assert_eq!(params.ip, Ipv4Addr::new(10, 99, 0, 2));

    let export = env.export();
    assert_eq!(export.container_count(), 1);
    let main = export.container("simple", 0, "main").expect("exported");
    assert_eq!(main.id, ContainerId::new("ctr-0"));
    assert_eq!(main.hostname, "main.0.simple.eph");
}

#[tokio::test]
async fn same_template_twice_gets_consecutive_indices() {
    let h = Harness::new(DryRunEngine::new());
    let env = h
        .create(vec![TemplateRef::new("simple"), TemplateRef::new("/simple")])
        .await;

    let names: Vec<_> = h.runs().into_iter().map(|(name, _, _)| name).collect();
    assert_eq!(names, vec!["main.0.simple.eph", "main.1.simple.eph"]);
    assert_eq!(h.count(|call| matches!(call, Call::FetchImage { .. })), 1);
    assert_eq!(env.export().templates["simple"].len(), 2);
    assert_eq!(env.instantiations().len(), 2);
}

#[tokio::test]
async fn unknown_template_fails_without_allocating_anything() {
    let h = Harness::new(DryRunEngine::new());
    let err = h
        .manager
        .create(spec(
            vec![TemplateRef::new("nonexistent")],
            static_hosts(),
        ))
        .await
        .expect_err("missing template");

    assert!(matches!(err, EphemeraError::Template { .. }), "{err}");
    assert!(err.to_string().contains("cannot read"), "{err}");
    assert!(h.engine.calls().is_empty());
    assert!(h.manager.list().is_empty());
}

#[tokio::test]
async fn empty_name_is_rejected() {
    let h = Harness::new(DryRunEngine::new());
    let mut env_spec = spec(vec![TemplateRef::new("simple")], static_hosts());
    env_spec.name = "  ".into();
    let err = h.manager.create(env_spec).await.expect_err("empty name");
    assert!(matches!(err, EphemeraError::Config { .. }));
}

#[tokio::test]
async fn name_escaping_the_workspace_is_rejected() {
    let h = Harness::new(DryRunEngine::new());
    let mut env_spec = spec(vec![TemplateRef::new("simple")], static_hosts());
    env_spec.name = "../../escaped/x".into();

    let err = h.manager.create(env_spec).await.expect_err("escaping name");
    assert!(matches!(err, EphemeraError::Config { .. }), "{err}");
    assert!(h.engine.calls().is_empty());
    let outside = h.dirs.path().parent().expect("parent").join("escaped");
    assert!(!outside.exists());
}

// ── Images, ports and interpolation ──────────────────────────────────

#[tokio::test]
async fn built_image_exposed_port_is_published_in_range() {
    let h = Harness::new(DryRunEngine::new());
    let env = h.create(vec![TemplateRef::new("app")]).await;

    let tag = format!("eph-app-app:{}-0", env.id());
    assert!(h.engine.calls().iter().any(|call| matches!(
        call,
        Call::BuildImage { tag: built, files } if *built == tag && files.contains(&"Dockerfile".to_owned())
    )));

    let export = env.export();
    let web = export.container("app", 0, "web").expect("exported");
    let external = web.ports["8080"];
    assert!((PORT_MIN..=PORT_MAX).contains(&external));

    let params = h.run_of("web.0.app.eph");
    assert_eq!(params.ports.get(&8080), Some(&external));
}

#[tokio::test]
async fn mounted_file_is_interpolated_with_extra_data() {
    let h = Harness::new(DryRunEngine::new());
    let env = h.create(vec![TemplateRef::new("app")]).await;
    let external = env.export().container("app", 0, "web").expect("web").ports["8080"];

    let params = h.run_of("web.0.app.eph");
    assert_eq!(params.mounts.len(), 1);
    assert_eq!(params.mounts[0].container_file, "/etc/app.conf");
    let content = std::fs::read_to_string(&params.mounts[0].host_file).expect("mounted file");
    assert_eq!(
        content,
        format!("hello from web.0.app.eph at 10.99.0.2:{external}\n")
    );
}

#[tokio::test]
async fn env_values_see_external_address_and_own_ports() {
    let h = Harness::new(DryRunEngine::new());
    let _env = h
        .create(vec![TemplateRef::new("simple").param("port", 80)])
        .await;

    let params = h.run_of("main.0.simple.eph");
    let external = params.ports[&80];
    assert_eq!(params.environ["ADDR"], format!("127.0.0.1:{external}"));
}

#[tokio::test]
async fn interpolation_failure_aborts_and_tears_down() {
    let h = Harness::new(DryRunEngine::new());
    let err = h
        .manager
        .create(spec(
            vec![TemplateRef::new("badenv")],
            static_hosts(),
        ))
        .await
        .expect_err("unpublished port");

    assert!(matches!(err, EphemeraError::Interpolation { .. }), "{err}");
    assert!(h.runs().is_empty());
    assert!(h.engine.live_networks().is_empty());
}

// ── Failures and teardown ────────────────────────────────────────────

#[tokio::test]
async fn driver_failure_tears_environment_down() {
    let h = Harness::new(DryRunEngine::new().fail_on(Operation::RunContainer, "web"));
    let err = h
        .manager
        .create(spec(vec![TemplateRef::new("app")], static_hosts()))
        .await
        .expect_err("run fails");

    assert!(matches!(err, EphemeraError::Driver { .. }), "{err}");
    assert!(h.engine.live_images().is_empty());
    assert!(h.engine.live_networks().is_empty());
    assert!(h.engine.live_containers().is_empty());
    assert!(h.manager.list().is_empty());
}

#[tokio::test]
async fn unattributed_driver_failure_names_operation_and_target() {
    let engine = Arc::new(DryRunEngine::new());
    let driver: Arc<dyn ContainerEngine> = UnrulyBuilds::failing(&engine);
    let h = Harness::with_driver(engine, driver);

    let err = h
        .manager
        .create(spec(vec![TemplateRef::new("app")], static_hosts()))
        .await
        .expect_err("build fails");
    let EphemeraError::Driver {
        operation,
        target,
        message,
    } = &err
    else {
        panic!("expected a driver error, got {err}");
    };
    assert_eq!(*operation, "build image");
    assert!(target.starts_with("eph-app-app:test-"), "{target}");
    assert!(message.contains("/run/engine.sock"), "{message}");
}

#[tokio::test]
async fn delete_during_apply_removes_images_built_late() {
    let engine = Arc::new(DryRunEngine::new());
    let driver: Arc<dyn ContainerEngine> =
        UnrulyBuilds::slow(&engine, Duration::from_millis(300));
    let h = Harness::with_driver(Arc::clone(&engine), driver);
    let env = h.create(vec![TemplateRef::new("simple")]).await;
    let id = env.id().to_owned();

    let app_templates = [TemplateRef::new("app")];
    let apply = h.manager.apply(&id, &app_templates);
    let delete = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.manager.delete(&id).await
    };
    let (applied, deleted) = tokio::join!(apply, delete);

    assert!(applied.is_err());
    deleted.expect("delete");
    assert!(
        h.engine.calls().iter().any(|call| matches!(call, Call::BuildImage { .. })),
        "the build finished after teardown began"
    );
    assert!(
        !engine.live_images().iter().any(|tag| tag.starts_with("eph-")),
        "{:?}",
        engine.live_images()
    );
    assert!(engine.live_containers().is_empty());
    assert!(engine.live_networks().is_empty());
}

#[tokio::test]
async fn terminate_removes_everything_and_is_idempotent() {
    let h = Harness::new(DryRunEngine::new());
    let env = h
        .create(vec![TemplateRef::new("app"), TemplateRef::new("simple")])
        .await;
    let id = env.id().to_owned();
    assert!(h.dirs.path().join("ws").join(&id).exists());

    h.manager.delete(&id).await.expect("delete");

    assert!(!env.is_alive());
    assert!(h.engine.live_containers().is_empty());
    assert!(h.engine.live_networks().is_empty());
    assert!(!h.engine.live_images().iter().any(|tag| tag.starts_with("eph-")));
    assert!(!h.dirs.path().join("ws").join(&id).exists());
    assert!(!h.dirs.path().join("mounts").join(&id).exists());

    let calls = h.engine.calls().len();
    env.terminate().await.expect("second terminate");
    assert_eq!(h.engine.calls().len(), calls);

    let err = h.manager.get(&id).expect_err("forgotten");
    assert!(matches!(err, EphemeraError::NotFound { kind: "environment", .. }));
    assert!(matches!(
        h.manager.delete(&id).await,
        Err(EphemeraError::NotFound { .. })
    ));
}

#[tokio::test]
async fn readiness_check_gates_creation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();

    let h = Harness::new(DryRunEngine::new());
    let env = h
        .create(vec![TemplateRef::new("simple").param("ready", address)])
        .await;
    assert!(env.is_alive());
}

#[tokio::test]
async fn failing_readiness_check_tears_environment_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();
    drop(listener);

    let h = Harness::new(DryRunEngine::new());
    let err = h
        .manager
        .create(spec(
            vec![TemplateRef::new("simple").param("ready", address)],
            static_hosts(),
        ))
        .await
        .expect_err("nothing listens");

    assert!(matches!(err, EphemeraError::Readiness { .. }), "{err}");
    assert!(h.engine.live_containers().is_empty());
    assert!(h.engine.live_networks().is_empty());
}

// ── Keepalive ────────────────────────────────────────────────────────

#[tokio::test]
async fn keepalive_expiry_terminates_environment() {
    let h = Harness::new(DryRunEngine::new());
    let env = h
        .manager
        .create(spec(
            vec![TemplateRef::new("simple")],
            with_keep_alive(Duration::from_millis(50)),
        ))
        .await
        .expect("create");

    wait_until_dead(&env, &h.engine).await;
    assert!(h.engine.live_containers().is_empty());
    assert!(h.manager.list().is_empty());
}

#[tokio::test]
async fn keepalive_resets_expiry_timer() {
    let h = Harness::new(DryRunEngine::new());
    let env = h
        .manager
        .create(spec(
            vec![TemplateRef::new("simple")],
            with_keep_alive(Duration::from_millis(400)),
        ))
        .await
        .expect("create");

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.manager.keep_alive(env.id()).expect("keepalive");
    }
    assert!(env.is_alive());
    assert!(env.export().last_keep_alive > env.created());

    wait_until_dead(&env, &h.engine).await;
}

#[tokio::test]
async fn zero_keepalive_never_expires() {
    let h = Harness::new(DryRunEngine::new());
    let env = h
        .manager
        .create(spec(
            vec![TemplateRef::new("simple")],
            with_keep_alive(Duration::ZERO),
        ))
        .await
        .expect("create");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(env.is_alive());
    assert_eq!(env.export().keep_alive, "0s");
}

// ── Container operations ─────────────────────────────────────────────

#[tokio::test]
async fn stop_and_restart_reach_the_driver() {
    let h = Harness::new(DryRunEngine::new());
    let env = h.create(vec![TemplateRef::new("simple")]).await;
    let ids = env.container_ids();

    h.manager.stop_containers(env.id(), &ids).await.expect("stop");
    h.manager
        .restart_containers(env.id(), &ids)
        .await
        .expect("restart");

    assert_eq!(
        h.count(|call| matches!(call, Call::StopContainer { id } if *id == ids[0])),
        1
    );
    assert_eq!(
        h.count(|call| matches!(call, Call::RestartContainer { id } if *id == ids[0])),
        1
    );
}

#[tokio::test]
async fn stop_waits_until_readiness_checks_fail() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr");

    let h = Harness::new(DryRunEngine::new());
    let env = h
        .create(vec![TemplateRef::new("simple").param("ready", address.to_string())])
        .await;
    let ids = env.container_ids();

    drop(listener);
    h.manager.stop_containers(env.id(), &ids).await.expect("stop");

    let _listener = TcpListener::bind(address).await.expect("rebind");
    h.manager
        .restart_containers(env.id(), &ids)
        .await
        .expect("restart");
}

#[tokio::test]
async fn stop_fails_while_container_stays_reachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();

    let h = Harness::new(DryRunEngine::new());
    let env = h
        .create(vec![TemplateRef::new("simple").param("ready", address)])
        .await;
    let ids = env.container_ids();

    let err = h
        .manager
        .stop_containers(env.id(), &ids)
        .await
        .expect_err("still reachable");
    assert!(matches!(err, EphemeraError::Readiness { .. }), "{err}");
    assert_eq!(
        h.count(|call| matches!(call, Call::StopContainer { id } if *id == ids[0])),
        1
    );
    drop(listener);
}

#[tokio::test]
async fn restart_fails_when_readiness_never_returns() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("addr").to_string();

    let h = Harness::new(DryRunEngine::new());
    let env = h
        .create(vec![TemplateRef::new("simple").param("ready", address)])
        .await;
    let ids = env.container_ids();
    drop(listener);

    let err = h
        .manager
        .restart_containers(env.id(), &ids)
        .await
        .expect_err("nothing listens");
    assert!(matches!(err, EphemeraError::Readiness { .. }), "{err}");
}

#[tokio::test]
async fn stop_of_unknown_container_is_not_found() {
    let h = Harness::new(DryRunEngine::new());
    let env = h.create(vec![TemplateRef::new("simple")]).await;

    let err = env
        .stop_containers(&[ContainerId::new("nope")])
        .await
        .expect_err("unknown");
    assert!(matches!(err, EphemeraError::NotFound { kind: "container", .. }));
    let err = env
        .restart_containers(&[ContainerId::new("nope")])
        .await
        .expect_err("unknown");
    assert!(matches!(err, EphemeraError::NotFound { kind: "container", .. }));
    assert_eq!(h.count(|call| matches!(call, Call::StopContainer { .. })), 0);
}

// ── Name resolution ──────────────────────────────────────────────────

#[tokio::test]
async fn discovery_agent_serves_dns_for_every_container() {
    let h = Harness::new(DryRunEngine::new());
    let env = h
        .manager
        .create(spec(vec![TemplateRef::new("simple")], EnvOptions::default()))
        .await
        .expect("create");
    assert!(env.has_discovery());
    assert!(h.engine.calls().contains(&Call::FetchImage {
        reference: DEFAULT_DISCOVERY_IMAGE.into()
    }));

    let agent = h.run_of("discovery.0.discovery.eph");
    let main = h.run_of("main.0.simple.eph");
    assert_eq!(main.resolution, NameResolution::DiscoveryDns(agent.ip));
    assert_eq!(agent.resolution, NameResolution::DiscoveryDns(agent.ip));
    assert!(agent.ports.contains_key(&8080));

    let domains = std::fs::read_to_string(&agent.mounts[0].host_file).expect("domains");
    let domains: serde_json::Value = serde_json::from_str(&domains).expect("json");
    assert_eq!(domains["main.0.simple.eph."], main.ip.to_string());
    assert_eq!(domains["discovery.0.discovery.eph."], agent.ip.to_string());
}

#[tokio::test]
async fn disabled_discovery_uses_static_hosts() {
    let h = Harness::new(DryRunEngine::new());
    let env = h
        .create(vec![TemplateRef::new("simple"), TemplateRef::new("app")])
        .await;
    assert!(!env.has_discovery());

    let main = h.run_of("main.0.simple.eph");
    let NameResolution::StaticHosts(hosts) = &main.resolution else {
        panic!("expected static hosts, got {:?}", main.resolution);
    };
    assert_eq!(hosts["main.0.simple.eph"], main.ip);
    assert_eq!(hosts["web.0.app.eph"], h.run_of("web.0.app.eph").ip);
}

// ── Applying to a running environment ────────────────────────────────

#[tokio::test]
async fn apply_adds_instances_on_the_same_network() {
    let h = Harness::new(DryRunEngine::new());
    let env = h.create(vec![TemplateRef::new("simple")]).await;

    let export = h
        .manager
        .apply(env.id(), &[TemplateRef::new("simple"), TemplateRef::new("app")])
        .await
        .expect("apply");

    assert_eq!(export.templates["simple"].len(), 2);
    assert!(export.container("app", 0, "web").is_some());
    assert_eq!(h.count(|call| matches!(call, Call::CreateNetwork { .. })), 1);
    let second = h.run_of("main.1.simple.eph");
    assert_eq!(second.network_id, "net-0");
    assert_eq!(second.ip, Ipv4Addr::new(10, 99, 0, 3));
}

#[tokio::test]
async fn apply_with_unreachable_discovery_agent_reports_discovery_error() {
    let h = Harness::new(DryRunEngine::new());
    let env = h
        .manager
        .create(spec(vec![TemplateRef::new("simple")], EnvOptions::default()))
        .await
        .expect("create");

    let err = h
        .manager
        .apply(env.id(), &[TemplateRef::new("simple")])
        .await
        .expect_err("no agent listening");
    assert!(matches!(err, EphemeraError::Discovery { .. }), "{err}");
    assert_eq!(h.count(|call| matches!(call, Call::RunContainer { .. })), 3);
    assert!(env.is_alive());
}

#[tokio::test]
async fn apply_to_terminated_environment_is_refused() {
    let h = Harness::new(DryRunEngine::new());
    let env = h.create(vec![TemplateRef::new("simple")]).await;
    env.terminate().await.expect("terminate");

    let err = env
        .apply_templates(&[TemplateRef::new("simple")], false, false)
        .await
        .expect_err("terminated");
    assert!(err.to_string().contains("terminating"), "{err}");
    assert!(matches!(
        h.manager.apply(env.id(), &[]).await,
        Err(EphemeraError::NotFound { .. })
    ));
}

#[tokio::test]
async fn shutdown_terminates_every_environment() {
    let h = Harness::new(DryRunEngine::new());
    let first = h.create(vec![TemplateRef::new("simple")]).await;
    let second = h.create(vec![TemplateRef::new("app")]).await;

    h.manager.shutdown().await.expect("shutdown");
    assert!(!first.is_alive());
    assert!(!second.is_alive());
    assert!(h.engine.live_networks().is_empty());
    assert!(h.manager.list().is_empty());
}
