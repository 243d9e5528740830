use std::collections::HashSet;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

/// Errors raised while loading the chip-family configuration.
#[derive(Debug, derive_more::Display)]
pub enum ConfigError {
    #[display("Failed to read device config: {path}")]
    Read { path: String },
    #[display("Failed to parse device config: {path}")]
    Parse { path: String },
    #[display("Invalid device config: {message}")]
    Invalid { message: String },
    #[display("No device config entry matches chip {chip_name}")]
    UnknownChip { chip_name: String },
}

impl core::error::Error for ConfigError {}

/// One virtualization granularity offered by a chip family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityTemplate {
    pub name: String,
    /// Memory carried by one instance of this template, in MiB
    pub memory: u64,
    #[serde(default)]
    pub ai_core: u32,
}

/// Per-chip-family entry of the device config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChipFamilyConfig {
    pub chip_name: String,
    /// Word used in the socket name and annotation keys (e.g. "Ascend910B3")
    pub common_word: String,
    /// Extended resource advertised to kubelet (e.g. "huawei.com/Ascend910B3")
    pub resource_name: String,
    /// Memory that may be carved into virtual devices, in MiB
    pub memory_allocatable: u64,
    #[serde(default)]
    pub memory_capacity: u64,
    pub ai_core: u32,
    /// Hardware cap on virtual devices per chip, defaults to the core count
    #[serde(default)]
    pub max_virtual_devices: Option<u32>,
    #[serde(default)]
    pub templates: Vec<CapacityTemplate>,
}

impl ChipFamilyConfig {
    /// Effective upper bound on virtual slots per physical device.
    pub fn virtual_device_limit(&self) -> u32 {
        self.max_virtual_devices.unwrap_or(self.ai_core).max(1)
    }

    fn validate(&self) -> Result<(), Report<ConfigError>> {
        if self.common_word.is_empty() || self.resource_name.is_empty() {
            return Err(Report::new(ConfigError::Invalid {
                message: format!(
                    "chip {} needs both commonWord and resourceName",
                    self.chip_name
                ),
            }));
        }
        if self.memory_allocatable == 0 {
            return Err(Report::new(ConfigError::Invalid {
                message: format!("chip {} has zero memoryAllocatable", self.chip_name),
            }));
        }
        if let Some(template) = self.templates.iter().find(|t| t.memory == 0) {
            return Err(Report::new(ConfigError::Invalid {
                message: format!(
                    "template {} of chip {} has zero memory",
                    template.name, self.chip_name
                ),
            }));
        }
        Ok(())
    }
}

/// Whole device config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub vnpus: Vec<ChipFamilyConfig>,
}

impl DeviceConfig {
    /// Parse and validate a config document, sorting every family's templates
    /// ascending by memory.
    pub fn from_yaml(content: &str, origin: &str) -> Result<Self, Report<ConfigError>> {
        let mut config: DeviceConfig =
            serde_yaml::from_str(content).change_context(ConfigError::Parse {
                path: origin.to_string(),
            })?;

        if config.vnpus.is_empty() {
            return Err(Report::new(ConfigError::Invalid {
                message: format!("{origin} declares no chip families"),
            }));
        }

        let mut seen = HashSet::new();
        for family in &mut config.vnpus {
            if !seen.insert(family.chip_name.clone()) {
                return Err(Report::new(ConfigError::Invalid {
                    message: format!("chip {} is declared twice", family.chip_name),
                }));
            }
            family.validate()?;
            family.templates.sort_by_key(|t| t.memory);
        }

        Ok(config)
    }

    /// Load the config file from disk.
    pub fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        tracing::info!("Loading device configuration from {:?}", path);

        let content = std::fs::read_to_string(path).change_context(ConfigError::Read {
            path: path.display().to_string(),
        })?;
        let config = Self::from_yaml(&content, &path.display().to_string())?;

        tracing::info!("Loaded {} chip family configurations", config.vnpus.len());
        Ok(config)
    }

    /// Pick the entry for the given chip name.
    pub fn family(&self, chip_name: &str) -> Result<&ChipFamilyConfig, Report<ConfigError>> {
        self.vnpus
            .iter()
            .find(|f| f.chip_name == chip_name)
            .ok_or_else(|| {
                Report::new(ConfigError::UnknownChip {
                    chip_name: chip_name.to_string(),
                })
            })
    }
}
