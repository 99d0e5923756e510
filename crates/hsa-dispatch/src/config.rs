use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, DispatchResult};

pub const DEFAULT_PROGRAM_CACHE_CAPACITY: usize = 32;
pub const DEFAULT_KERNEL_CACHE_CAPACITY: usize = 64;
pub const DEFAULT_QUEUE_SIZE: u32 = 4;

const LLC_ENV: &str = "HSA_DISPATCH_LLC";
const HSAILASM_ENV: &str = "HSA_DISPATCH_HSAILASM";
const QUEUE_SIZE_ENV: &str = "HSA_DISPATCH_QUEUE_SIZE";

/// External tools that lower `parallel.bc` into a BRIG module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub llc: PathBuf,
    pub hsail_asm: PathBuf,
    /// Extra arguments appended to the lowering step after the fixed ones.
    pub llc_extra_args: Vec<String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            llc: PathBuf::from("llc"),
            hsail_asm: PathBuf::from("HSAILasm"),
            llc_extra_args: Vec::new(),
        }
    }
}

impl ToolchainConfig {
    /// Defaults overridden by `HSA_DISPATCH_LLC` / `HSA_DISPATCH_HSAILASM`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_override(LLC_ENV) {
            config.llc = PathBuf::from(value);
        }
        if let Some(value) = env_override(HSAILASM_ENV) {
            config.hsail_asm = PathBuf::from(value);
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub program_capacity: usize,
    pub kernel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            program_capacity: DEFAULT_PROGRAM_CACHE_CAPACITY,
            kernel_capacity: DEFAULT_KERNEL_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub toolchain: ToolchainConfig,
    pub cache: CacheConfig,
    /// Packet slots in the dispatch ring; must be a power of two.
    pub queue_size: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            toolchain: ToolchainConfig::default(),
            cache: CacheConfig::default(),
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl DeviceConfig {
    pub fn from_env() -> DispatchResult<Self> {
        let mut config = Self {
            toolchain: ToolchainConfig::from_env(),
            ..Self::default()
        };
        if let Some(value) = env_override(QUEUE_SIZE_ENV) {
            config.queue_size = value.parse().map_err(|_| {
                DispatchError::invalid_config(format!("{QUEUE_SIZE_ENV}='{value}' is not a number"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> DispatchResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| DispatchError::invalid_config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DispatchResult<()> {
        if !self.queue_size.is_power_of_two() {
            return Err(DispatchError::invalid_config(format!(
                "queue size {} is not a power of two",
                self.queue_size
            )));
        }
        if self.toolchain.llc.as_os_str().is_empty() || self.toolchain.hsail_asm.as_os_str().is_empty()
        {
            return Err(DispatchError::invalid_config("toolchain paths must not be empty"));
        }
        Ok(())
    }
}

fn env_override(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cache_and_queue_limits() {
        let config = DeviceConfig::default();
        assert_eq!(config.cache.program_capacity, 32);
        assert_eq!(config.cache.kernel_capacity, 64);
        assert_eq!(config.queue_size, 4);
        config.validate().expect("default config is valid");
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = DeviceConfig::from_json_str(
            r#"{ "queue_size": 64, "cache": { "kernel_capacity": 2 } }"#,
        )
        .expect("config parses");
        assert_eq!(config.queue_size, 64);
        assert_eq!(config.cache.kernel_capacity, 2);
        assert_eq!(config.cache.program_capacity, DEFAULT_PROGRAM_CACHE_CAPACITY);
        assert_eq!(config.toolchain, ToolchainConfig::default());
    }

    #[test]
    fn non_power_of_two_queue_is_rejected() {
        let err = DeviceConfig::from_json_str(r#"{ "queue_size": 6 }"#).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidConfig(_)));
        assert!(!err.is_fatal());
    }
}
