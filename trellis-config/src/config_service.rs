// ConfigService - file backed implementation of the core config contract

use crate::env::{EnvLoader, merge};
use crate::loader::load_section;
use crate::{ConfigError, Result};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trellis_core::logging::{debug, warn};
use trellis_core::{CONFIG, ConfigProvider, Injectable, Service, ServiceKey};

/// Where [`ConfigService`] looks for sections.
#[derive(Debug, Clone)]
pub struct ConfigOptions {
    pub defaults_path: PathBuf,
    /// Searched before `defaults_path` and written by `set_config`
    pub overrides_path: Option<PathBuf>,
    pub use_cache: bool,
    pub warn_if_missing: bool,
    /// Prefix of environment overrides; `None` disables them
    pub env_prefix: Option<String>,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            defaults_path: PathBuf::from("config"),
            overrides_path: None,
            use_cache: true,
            warn_if_missing: true,
            env_prefix: Some(crate::env::DEFAULT_PREFIX.to_string()),
        }
    }
}

impl ConfigOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defaults_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.defaults_path = path.into();
        self
    }

    pub fn overrides_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.overrides_path = Some(path.into());
        self
    }

    pub fn use_cache(mut self, enable: bool) -> Self {
        self.use_cache = enable;
        self
    }

    pub fn warn_if_missing(mut self, enable: bool) -> Self {
        self.warn_if_missing = enable;
        self
    }

    pub fn env_prefix(mut self, prefix: Option<String>) -> Self {
        self.env_prefix = prefix;
        self
    }
}

/// Configuration sections read from TOML or JSON files.
///
/// A section `name` comes from the overrides directory if it holds a
/// usable `name.toml` or `name.json`, otherwise from the defaults
/// directory, otherwise it is `{}`. Environment overrides are merged on
/// top. With caching on, each section is read from disk once.
pub struct ConfigService {
    options: ConfigOptions,
    env: HashMap<String, Value>,
    cache: RwLock<HashMap<String, Value>>,
}

impl ConfigService {
    /// Service reading overrides from the process environment.
    pub fn new(options: ConfigOptions) -> Self {
        let env = match &options.env_prefix {
            Some(prefix) => EnvLoader::new(prefix.clone()).load(),
            None => HashMap::new(),
        };
        Self::with_env(options, env)
    }

    /// Service with an explicit set of per-section overrides.
    pub fn with_env(options: ConfigOptions, env: HashMap<String, Value>) -> Self {
        Self {
            options,
            env,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Like [`new`](Self::new), after loading a `.env` file into the
    /// environment.
    pub fn from_dotenv(options: ConfigOptions, path: Option<&Path>) -> Result<Self> {
        let env = match &options.env_prefix {
            Some(prefix) => EnvLoader::new(prefix.clone()).load_dotenv(path)?,
            None => HashMap::new(),
        };
        Ok(Self::with_env(options, env))
    }

    pub fn options(&self) -> &ConfigOptions {
        &self.options
    }

    pub fn get_config(&self, name: &str) -> Value {
        if self.options.use_cache {
            if let Some(value) = self.cache.read().get(name) {
                return value.clone();
            }
        }

        let value = self.load(name);
        if self.options.use_cache {
            self.cache.write().insert(name.to_string(), value.clone());
        }
        value
    }

    /// Write `value` to `<name>.json` in the overrides directory (or the
    /// defaults directory when none is set) and update the cache.
    pub fn set_config<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let value =
            serde_json::to_value(value).map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        let dir = self
            .options
            .overrides_path
            .as_deref()
            .unwrap_or(&self.options.defaults_path);
        let content = serde_json::to_string_pretty(&value)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        fs::create_dir_all(dir)?;
        fs::write(dir.join(format!("{name}.json")), content)?;
        debug!(section = name, dir = %dir.display(), "Configuration written");

        if self.options.use_cache {
            self.cache.write().insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Forget cached sections so the next lookup rereads the files.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    fn load(&self, name: &str) -> Value {
        let from_file = self
            .options
            .overrides_path
            .as_deref()
            .and_then(|dir| load_section(dir, name))
            .or_else(|| load_section(&self.options.defaults_path, name));

        let mut value = match from_file {
            Some(value) => value,
            None => {
                if self.options.warn_if_missing && !self.env.contains_key(name) {
                    warn!(section = name, "Configuration file does not exist");
                }
                Value::Object(Map::new())
            }
        };
        if let Some(overrides) = self.env.get(name) {
            merge(&mut value, overrides);
        }
        value
    }
}

impl Default for ConfigService {
    fn default() -> Self {
        Self::new(ConfigOptions::default())
    }
}

impl ConfigProvider for ConfigService {
    fn section(&self, name: &str) -> Value {
        self.get_config(name)
    }
}

impl Injectable for ConfigService {}

impl Service for ConfigService {
    type Contract = dyn ConfigProvider;
    const KEY: ServiceKey<dyn ConfigProvider> = CONFIG;

    fn into_contract(self: Arc<Self>) -> Arc<dyn ConfigProvider> {
        self
    }
}
