//! Configuration structures and loading

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ini::Ini;
use thiserror::Error;
use tracing::debug;

/// Primary configuration file
pub const SYSTEM_CONFIG: &str = "/etc/kapsule.conf";

/// Vendor fallback consulted when the primary file is absent
pub const VENDOR_CONFIG: &str = "/usr/lib/kapsule.conf";

/// Image used when a create request and the config both leave it empty
const DEFAULT_IMAGE: &str = "images:archlinux";

/// INI section holding the daemon keys
const SECTION: &str = "kapsule";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: ini::Error,
    },
}

/// Daemon configuration
///
/// Read once at startup. Containers and their metadata live in the backend;
/// this file is the only state the daemon reads from disk.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Container entered when `PrepareEnter` is called without a name
    pub default_container: String,

    /// Image substituted when `CreateContainer` receives an empty image
    pub default_image: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            default_container: String::new(),
            default_image: DEFAULT_IMAGE.to_string(),
        }
    }
}

impl Configuration {
    /// Load from the standard locations, first match wins
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_paths(&[Path::new(SYSTEM_CONFIG), Path::new(VENDOR_CONFIG)])
    }

    /// Load from an ordered list of candidate paths.
    ///
    /// Missing files fall through to the next candidate; a present but
    /// malformed file is an error. No candidate present yields defaults.
    pub fn load_from_paths(paths: &[&Path]) -> Result<Self, ConfigError> {
        for path in paths {
            if !path.exists() {
                continue;
            }
            debug!("Loading configuration from {}", path.display());
            return Self::load_from(path);
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    /// Load from one specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|source| ConfigError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::default();
        if let Some(section) = ini.section(Some(SECTION)) {
            if let Some(value) = section.get("default_container") {
                config.default_container = value.to_string();
            }
            if let Some(value) = section.get("default_image") {
                if !value.is_empty() {
                    config.default_image = value.to_string();
                }
            }
        }

        Ok(config)
    }

    /// The recognized keys, as surfaced by `GetConfig`
    pub fn entries(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                "default_container".to_string(),
                self.default_container.clone(),
            ),
            ("default_image".to_string(), self.default_image.clone()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_recognized_keys() {
        let file = write_config(
            "[kapsule]\ndefault_container = devbox\ndefault_image = images:ubuntu/24.04\n",
        );

        let config = Configuration::load_from(file.path()).unwrap();
        assert_eq!(config.default_container, "devbox");
        assert_eq!(config.default_image, "images:ubuntu/24.04");
    }

    #[test]
    fn test_missing_section_yields_defaults() {
        let file = write_config("[other]\nkey = value\n");

        let config = Configuration::load_from(file.path()).unwrap();
        assert_eq!(config.default_container, "");
        assert_eq!(config.default_image, DEFAULT_IMAGE);
    }

    #[test]
    fn test_fallback_path_order() {
        let missing = Path::new("/nonexistent/kapsule.conf");
        let file = write_config("[kapsule]\ndefault_container = fallback\n");

        let config = Configuration::load_from_paths(&[missing, file.path()]).unwrap();
        assert_eq!(config.default_container, "fallback");
    }

    #[test]
    fn test_no_candidates_yields_defaults() {
        let config =
            Configuration::load_from_paths(&[Path::new("/nonexistent/kapsule.conf")]).unwrap();
        assert_eq!(config.default_image, DEFAULT_IMAGE);
        assert!(config.default_container.is_empty());
    }

    #[test]
    fn test_entries_exposes_both_keys() {
        let config = Configuration::default();
        let entries = config.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains_key("default_container"));
        assert!(entries.contains_key("default_image"));
    }
}
