//! Hosting configuration.
//!
//! Maps a host location to the kind of host to run there and the contracts
//! it serves:
//!
//! ```toml
//! ["servers/main"]
//! type = "Worker"
//! contracts = ["logic", "history", "favorites"]
//! ```
//!
//! The same shape is accepted as JSON, which is also how it travels on the
//! registry channel as the `config` event.

use courier_core::{ChannelError, HostKind, Hub, REGISTRY_CHANNEL, RegistryMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML hosting configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid JSON hosting configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config event carries no configuration")]
    Missing,
}

/// One host location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    #[serde(rename = "type")]
    pub kind: HostKind,
    #[serde(default)]
    pub contracts: Vec<String>,
}

/// Location → host entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostingConfig {
    hosts: BTreeMap<String, HostEntry>,
}

impl HostingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host<I, S>(mut self, location: &str, kind: HostKind, contracts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hosts.insert(
            location.to_string(),
            HostEntry {
                kind,
                contracts: contracts.into_iter().map(Into::into).collect(),
            },
        );
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Load from a file. `.json` files are read as JSON, anything else as
    /// TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
    }

    /// The location serving `contract`, if any.
    pub fn host_for(&self, contract: &str) -> Option<(&str, &HostEntry)> {
        self.hosts
            .iter()
            .find(|(_, entry)| entry.contracts.iter().any(|c| c == contract))
            .map(|(location, entry)| (location.as_str(), entry))
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&str, &HostEntry)> {
        self.hosts.iter().map(|(l, e)| (l.as_str(), e))
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn to_value(&self) -> Result<Value, ConfigError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Send this configuration to the broker as a `config` event.
    pub fn publish(&self, hub: &Hub) -> Result<usize, ChannelError> {
        let value = serde_json::to_value(self).map_err(ChannelError::Encode)?;
        hub.post(REGISTRY_CHANNEL, &RegistryMessage::config(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RADIO: &str = r#"
["servers/main"]
type = "Worker"
contracts = ["logic", "history", "favorites"]

["sw.js"]
type = "ServiceWorker"
contracts = ["rendercache"]
"#;

    #[test]
    fn parses_toml_and_finds_hosts() {
        let config = HostingConfig::from_toml_str(RADIO).unwrap();
        let (location, entry) = config.host_for("history").unwrap();
        assert_eq!(location, "servers/main");
        assert_eq!(entry.kind, HostKind::Worker);
        assert_eq!(config.host_for("rendercache").unwrap().1.kind, HostKind::ServiceWorker);
        assert!(config.host_for("dialer").is_none());
    }

    #[test]
    fn json_matches_the_config_event_shape() {
        let value = json!({
            "servers/main": { "type": "Worker", "contracts": ["logic"] },
            "views/hidden.html": { "type": "Window", "contracts": ["dialog"] }
        });
        let config = HostingConfig::from_value(value.clone()).unwrap();
        assert_eq!(config.to_value().unwrap(), value);
        assert_eq!(
            config,
            HostingConfig::new()
                .with_host("servers/main", HostKind::Worker, ["logic"])
                .with_host("views/hidden.html", HostKind::Window, ["dialog"])
        );
    }

    #[test]
    fn rejects_unknown_host_kinds() {
        let err = HostingConfig::from_value(json!({ "a": { "type": "Thread", "contracts": [] } }));
        assert!(matches!(err, Err(ConfigError::Json(_))));
    }

    #[test]
    fn loads_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("hosting.toml");
        std::fs::write(&toml_path, RADIO).unwrap();
        let json_path = dir.path().join("hosting.json");
        std::fs::write(
            &json_path,
            r#"{ "servers/main": { "type": "SharedWorker", "contracts": ["logic"] } }"#,
        )
        .unwrap();

        assert_eq!(HostingConfig::load(&toml_path).unwrap().hosts().count(), 2);
        let json = HostingConfig::load(&json_path).unwrap();
        assert_eq!(json.host_for("logic").unwrap().1.kind, HostKind::SharedWorker);
        assert!(matches!(
            HostingConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn publish_posts_a_config_event() {
        let hub = Hub::new();
        let mut registry = hub.open(REGISTRY_CHANNEL);
        let config = HostingConfig::new().with_host("servers/main", HostKind::Worker, ["logic"]);

        assert_eq!(config.publish(&hub).unwrap(), 1);
        let msg: RegistryMessage = registry.recv_as().await.unwrap().unwrap();
        assert_eq!(msg.name, "config");
        assert_eq!(HostingConfig::from_value(msg.config.unwrap()).unwrap(), config);
    }
}
