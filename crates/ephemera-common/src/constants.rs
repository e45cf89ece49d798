//! System-wide constants, naming conventions and defaults.

use std::time::Duration;

/// Application name used in CLI output and generated names.
pub const APP_NAME: &str = "ephemera";

/// Suffix appended to every container hostname.
pub const HOSTNAME_SUFFIX: &str = "eph";

/// Prefix of every image tag built for an environment.
pub const IMAGE_TAG_PREFIX: &str = "eph";

/// File extension of a template script.
pub const TEMPLATE_EXTENSION: &str = ".tpl.rhai";

/// Suffix of the optional data directory next to a template script.
pub const TEMPLATE_DATA_SUFFIX: &str = ".tpl.data";

/// Name of the built-in discovery template.
pub const DISCOVERY_TEMPLATE: &str = "discovery";

/// Label marking the discovery agent container.
pub const DISCOVERY_LABEL: &str = "eph-discovery";

/// Label carrying the discovery agent's HTTP API port.
pub const DISCOVERY_PORT_LABEL: &str = "eph-discovery-port";

/// HTTP API port of the discovery agent inside its container.
pub const DISCOVERY_API_PORT: u16 = 8080;

/// Path of the discovery agent's domain update endpoint.
pub const DISCOVERY_API_PATH: &str = "/api/v1/domains";

/// Timeout of a single discovery agent update.
pub const DISCOVERY_NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default discovery agent image.
pub const DEFAULT_DISCOVERY_IMAGE: &str = "ephemera/discovery:latest";

/// Default upstream DNS recursor for the discovery agent.
pub const DEFAULT_DNS_RECURSOR: &str = "8.8.8.8";

/// Default lower bound of the external port range.
pub const DEFAULT_PORT_MIN: u16 = 20_000;

/// Default upper bound of the external port range.
pub const DEFAULT_PORT_MAX: u16 = 30_000;

/// Default keepalive of an environment.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(120);

/// Default address clients use to reach exposed ports.
pub const DEFAULT_EXPORT_ADDRESS: &str = "127.0.0.1";

/// Default readiness retry budget.
pub const DEFAULT_READINESS_RETRY_LIMIT: u32 = 5;

/// Default pause between readiness polls.
pub const DEFAULT_READINESS_INTERVAL: Duration = Duration::from_secs(2);

/// Timeout of a single HTTP readiness poll.
pub const READINESS_HTTP_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout of a single TCP readiness dial.
pub const READINESS_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest accepted environment name.
pub const MAX_ENV_NAME_LENGTH: usize = 64;

/// Length of the random suffix in generated identifiers.
pub const SHORT_ID_LENGTH: usize = 8;
