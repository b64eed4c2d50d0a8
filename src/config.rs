// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::kernels::{self, INCREMENT_LOCAL_SIZE};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub instance: InstanceConfig,
    pub benchmark: BenchmarkConfig,
    pub debug: DebugConfig,
}

/// Vulkan instance settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub app_name: String,
    pub validation_layers: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "vkcompute".to_string(),
            validation_layers: false,
        }
    }
}

/// Increment benchmark settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    /// Number of f64 elements in the buffer.
    pub buffer_size: usize,
    /// (dispatch, barrier) pairs recorded into the command buffer.
    pub increment_passes: u32,
    /// Times the recorded command buffer is submitted.
    pub runs: u32,
    /// Work groups per dispatch.
    pub workgroups: [u32; 3],
    /// SPIR-V file to run instead of the built-in increment kernel. It must
    /// have the same interface (local size 1024, one f64 storage buffer).
    pub kernel: Option<PathBuf>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10240,
            increment_passes: 100_000,
            runs: 5,
            workgroups: [10, 1, 1],
            kernel: None,
        }
    }
}

impl BenchmarkConfig {
    /// Value every element must hold after all runs.
    pub fn expected_value(&self) -> f64 {
        f64::from(self.increment_passes) * f64::from(self.runs)
    }

    /// Invocations launched by one dispatch, `None` if that overflows `u64`.
    pub fn invocations(&self) -> Option<u64> {
        self.workgroups
            .iter()
            .try_fold(u64::from(INCREMENT_LOCAL_SIZE), |total, &n| {
                total.checked_mul(u64::from(n))
            })
    }

    /// Kernel bytes: the configured file, or the built-in increment kernel.
    pub fn kernel_bytes(&self) -> Result<Vec<u8>> {
        match &self.kernel {
            Some(path) => std::fs::read(path)
                .with_context(|| format!("Failed to read kernel: {:?}", path)),
            None => Ok(kernels::increment_f64()),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Default log level; RUST_LOG overrides it.
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from config.toml, falling back to defaults if not found
    pub fn load() -> Result<Self> {
        Self::load_from_path("config.toml")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the increment kernel cannot run correctly with.
    ///
    /// The kernel has no bounds check, so the dispatch grid must launch exactly
    /// one invocation per element.
    pub fn validate(&self) -> Result<()> {
        let bench = &self.benchmark;

        if bench.buffer_size == 0 || bench.increment_passes == 0 || bench.runs == 0 {
            anyhow::bail!("buffer_size, increment_passes and runs must all be non-zero");
        }

        let Some(invocations) = bench.invocations() else {
            anyhow::bail!(
                "workgroups {:?} launch more invocations than can be counted",
                bench.workgroups
            );
        };

        if invocations != bench.buffer_size as u64 {
            anyhow::bail!(
                "workgroups {:?} launch {} invocations (local size {}), buffer_size is {}",
                bench.workgroups,
                invocations,
                INCREMENT_LOCAL_SIZE,
                bench.buffer_size
            );
        }

        Ok(())
    }

    /// Parse the configured log level, defaulting to Info.
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            log::warn!(
                "Unknown log level '{}', defaulting to info",
                self.debug.log_level
            );
            log::LevelFilter::Info
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_benchmark() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.benchmark.expected_value(), 500_000.0);
        assert!(!config.instance.validation_layers);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [benchmark]
            buffer_size = 2048
            workgroups = [2, 1, 1]
            runs = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.benchmark.buffer_size, 2048);
        assert_eq!(config.benchmark.increment_passes, 100_000);
        assert_eq!(config.instance.app_name, "vkcompute");
        assert_eq!(config.benchmark.expected_value(), 200_000.0);
    }

    #[test]
    fn grid_must_cover_buffer_exactly() {
        let err = Config::from_toml(
            r#"
            [benchmark]
            buffer_size = 10240
            workgroups = [9, 1, 1]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invocations"));
    }

    #[test]
    fn huge_grid_is_an_error_not_an_overflow() {
        let err = Config::from_toml(
            "[benchmark]\nworkgroups = [4294967295, 4294967295, 4294967295]",
        )
        .unwrap_err();
        assert!(err.to_string().contains("more invocations"));
    }

    #[test]
    fn zero_workgroup_is_rejected() {
        assert!(Config::from_toml("[benchmark]\nworkgroups = [10, 0, 1]").is_err());
    }

    #[test]
    fn built_in_kernel_without_path() {
        let bench = BenchmarkConfig::default();
        assert_eq!(bench.invocations(), Some(10240));
        assert_eq!(bench.kernel_bytes().unwrap(), kernels::increment_f64());
    }

    #[test]
    fn kernel_path_is_read() {
        let path = std::env::temp_dir().join(format!("vkcompute-{}.spv", std::process::id()));
        std::fs::write(&path, kernels::increment_f64()).unwrap();

        let config = Config::from_toml(&format!(
            "[benchmark]\nkernel = {:?}",
            path.to_string_lossy()
        ))
        .unwrap();
        let bytes = config.benchmark.kernel_bytes();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(bytes.unwrap(), kernels::increment_f64());
    }

    #[test]
    fn missing_kernel_file_is_an_error() {
        let config = Config::from_toml("[benchmark]\nkernel = \"no/such/kernel.spv\"").unwrap();
        let err = config.benchmark.kernel_bytes().unwrap_err();
        assert!(err.to_string().contains("Failed to read kernel"));
    }

    #[test]
    fn zero_runs_rejected() {
        assert!(Config::from_toml("[benchmark]\nruns = 0").is_err());
    }

    #[test]
    fn log_level_parses_case_insensitively() {
        let config = Config::from_toml("[debug]\nlog_level = \"DEBUG\"").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Debug);

        let config = Config::from_toml("[debug]\nlog_level = \"chatty\"").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.benchmark.runs, 5);
    }
}
