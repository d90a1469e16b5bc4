//! Configuration management

use crate::loopback::LoopbackOptions;
use crate::registry::MAX_INSTANCE_NAME_LEN;
use anyhow::{Context, Result, anyhow};
use protocol::UsbSpeed;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GadgetConfig {
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub loopback: LoopbackSettings,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default = "RuntimeSettings::default_log_level")]
    pub log_level: String,
    /// Deferred completions that may be outstanding at once
    #[serde(default = "RuntimeSettings::default_work_queue_capacity")]
    pub work_queue_capacity: usize,
    /// Recheck interval of interruptible waits, in milliseconds
    #[serde(default = "RuntimeSettings::default_wait_tick_ms")]
    pub wait_tick_ms: u64,
}

impl RuntimeSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_work_queue_capacity() -> usize {
        64
    }

    fn default_wait_tick_ms() -> u64 {
        10
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            work_queue_capacity: Self::default_work_queue_capacity(),
            wait_tick_ms: Self::default_wait_tick_ms(),
        }
    }
}

/// Software controller used by `simulate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackSettings {
    #[serde(default = "LoopbackSettings::default_speed")]
    pub speed: UsbSpeed,
    #[serde(default = "LoopbackSettings::default_max_speed")]
    pub max_speed: UsbSpeed,
    #[serde(default)]
    pub use_os_strings: bool,
    #[serde(default)]
    pub align_out_transfers: bool,
}

impl LoopbackSettings {
    fn default_speed() -> UsbSpeed {
        UsbSpeed::High
    }

    fn default_max_speed() -> UsbSpeed {
        UsbSpeed::Super
    }
}

impl Default for LoopbackSettings {
    fn default() -> Self {
        Self {
            speed: Self::default_speed(),
            max_speed: Self::default_max_speed(),
            use_os_strings: false,
            align_out_transfers: false,
        }
    }
}

/// A function instance created at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,
    #[serde(default)]
    pub no_disconnect: bool,
    /// Descriptor upload to write on startup
    #[serde(default)]
    pub descriptors: Option<PathBuf>,
    /// String upload to write after the descriptors
    #[serde(default)]
    pub strings: Option<PathBuf>,
}

impl GadgetConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/ffs-gadget/gadget.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: GadgetConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        tracing::debug!("Config: {} instances", config.instances.len());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                // Logging is not initialized yet
                eprintln!("Config: {}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("ffs-gadget").join("gadget.toml")
        } else {
            PathBuf::from(".config/ffs-gadget/gadget.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.runtime.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.runtime.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.runtime.work_queue_capacity == 0 {
            return Err(anyhow!("work_queue_capacity must be at least 1"));
        }
        if self.runtime.wait_tick_ms == 0 {
            return Err(anyhow!("wait_tick_ms must be at least 1"));
        }
        if self.loopback.speed > self.loopback.max_speed {
            return Err(anyhow!(
                "Loopback speed {:?} exceeds max_speed {:?}",
                self.loopback.speed,
                self.loopback.max_speed
            ));
        }

        let mut names = HashSet::new();
        for instance in &self.instances {
            if instance.name.is_empty() {
                return Err(anyhow!("Empty instance name"));
            }
            if instance.name.len() > MAX_INSTANCE_NAME_LEN {
                return Err(anyhow!(
                    "Instance name '{}' longer than {} bytes",
                    instance.name,
                    MAX_INSTANCE_NAME_LEN
                ));
            }
            if !names.insert(instance.name.as_str()) {
                return Err(anyhow!("Duplicate instance name '{}'", instance.name));
            }
            if instance.strings.is_some() && instance.descriptors.is_none() {
                return Err(anyhow!(
                    "Instance '{}' has strings but no descriptors",
                    instance.name
                ));
            }
        }

        Ok(())
    }

    pub fn wait_tick(&self) -> Duration {
        Duration::from_millis(self.runtime.wait_tick_ms)
    }

    pub fn loopback_options(&self) -> LoopbackOptions {
        LoopbackOptions {
            speed: self.loopback.speed,
            max_speed: self.loopback.max_speed,
            use_os_strings: self.loopback.use_os_strings,
            align_out: self.loopback.align_out_transfers,
            ..LoopbackOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GadgetConfig::default();
        assert_eq!(config.runtime.log_level, "info");
        assert_eq!(config.runtime.work_queue_capacity, 64);
        assert_eq!(config.wait_tick(), Duration::from_millis(10));
        assert!(config.instances.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_parses() {
        let config: GadgetConfig = toml::from_str(
            r#"
            [loopback]
            speed = "full"

            [[instances]]
            name = "usb0"
            "#,
        )
        .unwrap();
        assert_eq!(config.loopback.speed, UsbSpeed::Full);
        assert_eq!(config.loopback.max_speed, UsbSpeed::Super);
        assert_eq!(config.runtime.wait_tick_ms, 10);
        assert!(!config.instances[0].no_disconnect);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = GadgetConfig::default();
        config.runtime.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_instances_rejected() {
        let mut config = GadgetConfig::default();
        for _ in 0..2 {
            config.instances.push(InstanceConfig {
                name: "usb0".to_string(),
                no_disconnect: false,
                descriptors: None,
                strings: None,
            });
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_speed_above_max_rejected() {
        let mut config = GadgetConfig::default();
        config.loopback.speed = UsbSpeed::Super;
        config.loopback.max_speed = UsbSpeed::High;
        assert!(config.validate().is_err());
    }
}
