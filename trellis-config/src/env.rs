// Environment variable overrides

use crate::{ConfigError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::env;
use std::path::Path;

pub const DEFAULT_PREFIX: &str = "TRELLIS";

/// Collects `<PREFIX>__<SECTION>__<KEY>[__<KEY>...]=value` variables into
/// per-section override objects.
///
/// Section and key names are lowercased. Values that parse as JSON keep
/// their type (`8080`, `true`, `["a"]`); anything else is a string.
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Overrides from the process environment.
    pub fn load(&self) -> HashMap<String, Value> {
        self.load_from(env::vars())
    }

    /// Read a `.env` file into the process environment, then load.
    ///
    /// Without a path a missing `.env` in the working directory is ignored.
    pub fn load_dotenv(&self, path: Option<&Path>) -> Result<HashMap<String, Value>> {
        if let Some(path) = path {
            dotenvy::from_path(path).map_err(|e| ConfigError::LoadError(e.to_string()))?;
        } else {
            dotenvy::dotenv().ok();
        }
        Ok(self.load())
    }

    pub fn load_from<I, K, V>(&self, vars: I) -> HashMap<String, Value>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let marker = format!("{}__", self.prefix);
        let mut sections: HashMap<String, Map<String, Value>> = HashMap::new();

        for (key, value) in vars {
            let Some(rest) = key.as_ref().strip_prefix(&marker) else {
                continue;
            };
            let path: Vec<String> = rest.split("__").map(str::to_lowercase).collect();
            let [section, keys @ ..] = path.as_slice() else {
                continue;
            };
            if section.is_empty() || keys.is_empty() || keys.iter().any(String::is_empty) {
                continue;
            }

            let root = sections.entry(section.clone()).or_default();
            insert_path(root, keys, parse_value(value.as_ref()));
        }

        sections
            .into_iter()
            .map(|(section, map)| (section, Value::Object(map)))
            .collect()
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn insert_path(target: &mut Map<String, Value>, keys: &[String], value: Value) {
    match keys {
        [] => {}
        [last] => {
            target.insert(last.clone(), value);
        }
        [first, rest @ ..] => {
            let child = target
                .entry(first.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_path(map, rest, value);
            }
        }
    }
}

/// Deep-merge `overrides` into `base`; objects merge key by key, anything
/// else replaces.
pub fn merge(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}
