//! Domain primitive types used across the Ephemera workspace.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_ENV_NAME_LENGTH;
use crate::error::{EphemeraError, Result};

/// A TCP port number, internal or external.
pub type Port = u16;

/// Free-form template parameters as submitted by the caller.
pub type TemplateParams = serde_json::Map<String, serde_json::Value>;

/// Identifier handed out by the runtime driver for a created container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns a short random lowercase hex token for generated names.
#[must_use]
pub fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(crate::constants::SHORT_ID_LENGTH);
    id
}

/// Reference to a template to instantiate, with its parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateRef {
    /// Template name relative to the template root, e.g. `db/mongo`.
    #[serde(rename = "tpl")]
    pub template: String,
    /// Parameters passed to the template's `execute` function.
    #[serde(default)]
    pub parameters: TemplateParams,
}

impl TemplateRef {
    /// Creates a reference with no parameters.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            parameters: TemplateParams::new(),
        }
    }

    /// Adds a parameter, replacing any previous value under the same key.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let _ = self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Per-environment options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvOptions {
    /// Inactivity period after which the environment is reclaimed.
    /// `None` falls back to the engine default; zero disables expiry.
    #[serde(default, with = "duration_serde", skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<Duration>,
    /// Skips the built-in discovery agent and uses static host maps.
    #[serde(default)]
    pub disable_discovery: bool,
}

/// Caller-submitted description of an environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Environment name, part of the generated id.
    pub name: String,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Templates to instantiate, in submission order.
    #[serde(default)]
    pub templates: Vec<TemplateRef>,
    /// Additional options.
    #[serde(default)]
    pub options: EnvOptions,
}

impl EnvironmentSpec {
    /// Checks for required fields.
    ///
    /// # Errors
    ///
    /// Returns `EphemeraError::Config` if the name is empty, too long, or
    /// not usable inside a directory name and an image tag: only ASCII
    /// letters, digits, `_`, `.` and `-`, starting with a letter, digit or
    /// `_`, and never containing `..`.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| EphemeraError::Config {
            message: format!("invalid environment name {:?}: {reason}", self.name),
        };
        let name = self.name.as_str();
        if name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if name.len() > MAX_ENV_NAME_LENGTH {
            return Err(invalid(&format!("longer than {MAX_ENV_NAME_LENGTH} characters")));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(invalid("only letters, digits, '_', '.' and '-' are allowed"));
        }
        if name.starts_with(['.', '-']) || name.contains("..") {
            return Err(invalid("must not start with '.' or '-' or contain '..'"));
        }
        Ok(())
    }

    /// Parses a spec from a JSON or YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document matches neither format.
    pub fn parse(content: &str) -> Result<Self> {
        match serde_json::from_str(content) {
            Ok(spec) => Ok(spec),
            Err(json_err) => serde_yaml::from_str(content).map_err(|yaml_err| {
                EphemeraError::Config {
                    message: format!(
                        "environment spec is neither JSON ({json_err}) nor YAML ({yaml_err})"
                    ),
                }
            }),
        }
    }
}

/// A host file mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMount {
    /// Absolute path of the file on the host.
    pub host_file: PathBuf,
    /// Path inside the container.
    pub container_file: String,
    /// Whether the mount is read-only.
    pub readonly: bool,
}

/// Serde adapter for optional human-readable durations (`"30s"`, `"1h 5m"`),
/// also accepting a bare integer number of seconds.
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }

    /// Serializes a duration as a humantime string.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    #[allow(clippy::ref_option)]
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes a humantime string or integer seconds.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed duration strings.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
            Some(Raw::Text(text)) => humantime::parse_duration(text.trim())
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}
