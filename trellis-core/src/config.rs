// Configuration contract and the in-memory provider

use crate::container::{Injectable, Service, ServiceKey};
use crate::controller::DEFAULT_MAX_BODY_SIZE;
use crate::error::Error;
use crate::service_key;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

service_key!(
    /// Named configuration sections.
    pub CONFIG: dyn ConfigProvider = "trellis.config"
);

/// Source of named configuration sections.
///
/// A missing section is an empty object, never an error.
pub trait ConfigProvider: Send + Sync {
    fn section(&self, name: &str) -> Value;

    /// The `global` section.
    fn global(&self) -> GlobalConfig {
        serde_json::from_value(self.section("global")).unwrap_or_default()
    }
}

impl dyn ConfigProvider {
    /// Deserialize a section, filling missing fields from their defaults.
    pub fn section_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, Error> {
        serde_json::from_value(self.section(name))
            .map_err(|e| Error::Config(format!("section '{name}': {e}")))
    }
}

/// The `global` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Keep parsed sections in memory
    pub cache: bool,
    pub watch: bool,
    /// Verbose logging
    pub debug: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            cache: true,
            watch: false,
            debug: false,
        }
    }
}

/// The `server` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Directory served by the static file controller
    #[serde(alias = "public_files")]
    pub public_files: Option<PathBuf>,
    /// Allowed `Host` header values; unset allows every host
    #[serde(alias = "trusted_hosts")]
    pub trusted_hosts: Option<Vec<String>>,
    #[serde(alias = "max_body_size")]
    pub max_body_size: Option<usize>,
}

impl ServerConfig {
    pub fn max_body_size(&self) -> usize {
        self.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE)
    }

    /// True when no allowlist is configured or `host` is on it.
    ///
    /// A configured list rejects requests without a host.
    pub fn is_trusted_host(&self, host: Option<&str>) -> bool {
        match (&self.trusted_hosts, host) {
            (None, _) => true,
            (Some(hosts), Some(host)) => hosts.iter().any(|trusted| trusted == host),
            (Some(_), None) => false,
        }
    }
}

/// Sections held in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct StaticConfig {
    sections: RwLock<HashMap<String, Value>>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_section(self, name: impl Into<String>, value: Value) -> Self {
        self.set_section(name, value);
        self
    }

    /// Serialize `value` as a section.
    pub fn with_typed<T: Serialize>(self, name: impl Into<String>, value: &T) -> Result<Self, Error> {
        let value = serde_json::to_value(value).map_err(|e| Error::Config(e.to_string()))?;
        Ok(self.with_section(name, value))
    }

    pub fn set_section(&self, name: impl Into<String>, value: Value) {
        self.sections.write().insert(name.into(), value);
    }
}

impl ConfigProvider for StaticConfig {
    fn section(&self, name: &str) -> Value {
        self.sections
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()))
    }
}

impl Injectable for StaticConfig {}

impl Service for StaticConfig {
    type Contract = dyn ConfigProvider;
    const KEY: ServiceKey<dyn ConfigProvider> = CONFIG;

    fn into_contract(self: Arc<Self>) -> Arc<dyn ConfigProvider> {
        self
    }
}
