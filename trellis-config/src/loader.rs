// Configuration file loaders

use crate::{ConfigError, Result};
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use trellis_core::logging::warn;

/// Supported configuration file formats, in lookup order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    Toml,
    Json,
}

impl FileFormat {
    pub const LOOKUP_ORDER: [FileFormat; 2] = [FileFormat::Toml, FileFormat::Json];

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "toml" => Some(FileFormat::Toml),
            "json" => Some(FileFormat::Json),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Toml => "toml",
            FileFormat::Json => "json",
        }
    }
}

/// Configuration file loader
pub struct ConfigLoader {
    format: FileFormat,
}

impl ConfigLoader {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    /// Auto-detect format from file extension
    pub fn auto(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::LoadError("No file extension found".to_string()))?;

        let format = FileFormat::from_extension(ext)
            .ok_or_else(|| ConfigError::LoadError(format!("Unsupported format: {}", ext)))?;

        Ok(Self::new(format))
    }

    pub fn load_file(&self, path: &Path) -> Result<Value> {
        let content = fs::read_to_string(path)?;
        self.parse(&content)
    }

    pub fn parse(&self, content: &str) -> Result<Value> {
        match self.format {
            FileFormat::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::ParseError(format!("JSON parse error: {}", e))),
            FileFormat::Toml => {
                let value: toml::Value = toml::from_str(content)
                    .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;
                serde_json::to_value(value)
                    .map_err(|e| ConfigError::SerializationError(e.to_string()))
            }
        }
    }
}

/// Load section `name` from `dir`, trying `<name>.toml` then `<name>.json`.
///
/// Unreadable or unparsable files are logged and skipped, so `None` means
/// no usable file exists.
pub fn load_section(dir: &Path, name: &str) -> Option<Value> {
    for format in FileFormat::LOOKUP_ORDER {
        let path = dir.join(format!("{name}.{}", format.extension()));
        match ConfigLoader::new(format).load_file(&path) {
            Ok(value) => return Some(value),
            Err(ConfigError::IoError(err)) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "Skipping configuration file"),
        }
    }
    None
}
