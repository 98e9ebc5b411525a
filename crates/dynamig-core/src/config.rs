//! Configuration types for dynamig

use crate::profile::{GpuModel, Profile, ProfileCatalog};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamigConfig {
    /// Profile catalog configuration
    pub catalog: CatalogConfig,
    /// Driver backend configuration
    pub driver: DriverConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DynamigConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, crate::MigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::MigError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load from `path` if given, otherwise use defaults
    pub fn load(path: Option<&Path>) -> Result<Self, crate::MigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

/// Profile catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Built-in table to start from
    pub model: GpuModel,
    /// Extra or overriding profiles, keyed by name
    pub profiles: BTreeMap<String, Profile>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            model: GpuModel::A100,
            profiles: BTreeMap::new(),
        }
    }
}

impl CatalogConfig {
    /// Assemble the read-only catalog for this process
    pub fn build(&self) -> ProfileCatalog {
        ProfileCatalog::for_model(self.model).with_profiles(
            self.profiles
                .iter()
                .map(|(name, profile)| (name.clone(), *profile)),
        )
    }
}

/// Driver backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverBackend {
    /// NVIDIA Management Library
    Nvml,
    /// In-memory device model, for dry runs
    Simulated,
}

/// Driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Backend type
    pub backend: DriverBackend,
    /// Path to libnvidia-ml (defaults to the system library)
    pub library_path: Option<PathBuf>,
    /// Devices exposed by the simulated backend
    pub simulated_devices: u32,
    /// Placement slots per simulated device
    pub simulated_slots: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            backend: DriverBackend::Nvml,
            library_path: None,
            simulated_devices: 1,
            simulated_slots: 8,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DynamigConfig::default();
        assert_eq!(config.catalog.model, GpuModel::A100);
        assert_eq!(config.driver.backend, DriverBackend::Nvml);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_parse() {
        let toml_str = r#"
[catalog]
model = "a30"

[catalog.profiles."1g.6gb"]
gi_template = 0
ci_template = 0
slot_width = 1

[catalog.profiles."custom.3g"]
gi_template = 2
ci_template = 2
slot_width = 4

[driver]
backend = "simulated"
simulated_devices = 2
"#;
        let config: DynamigConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.driver.backend, DriverBackend::Simulated);
        assert_eq!(config.driver.simulated_devices, 2);
        assert_eq!(config.driver.simulated_slots, 8);

        let catalog = config.catalog.build();
        assert_eq!(catalog.name(), "a30*");
        assert_eq!(catalog.lookup("custom.3g").unwrap().slot_width, 4);
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[logging]\nlevel = \"debug\"").unwrap();

        let config = DynamigConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.catalog.build().name(), "a100");
    }

    #[test]
    fn test_config_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[driver]\nbackend = \"opencl\"").unwrap();

        let err = DynamigConfig::load(Some(file.path())).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_config_missing_file() {
        let err = DynamigConfig::from_file(Path::new("/nonexistent/dynamig.toml")).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }
}
