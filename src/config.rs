//! Gateway configuration files.
//!
//! Operators describe a deployment in one flat document; [`GatewayConfig`]
//! turns it into the nested [`EngineConfig`] plus the device list and the
//! backend / L2 choices the binary needs to assemble an [`Engine`].
//!
//! Sources, later ones winning:
//!
//! 1. built-in defaults,
//! 2. `embedgate.{yaml,toml,json}` in the working directory (optional),
//! 3. `EMBEDGATE__*` environment variables (`EMBEDGATE__MAX_CACHE_SIZE=5000`).
//!
//! ## Example YAML Configuration
//!
//! ```yaml
//! version: "1.0"
//! name: "edge-gateway"
//! log_level: "info"
//!
//! dimension: 384
//! max_cache_size: 10000
//! cache_ttl_seconds: 3600
//! hybrid_mode_enabled: true
//! multi_gpu_enabled: false
//! quantization_enabled: true
//! quantization_dtype: "i8"
//! semantic_cache_enabled: true
//! semantic_cache_threshold: 0.95
//! circuit_failure_threshold: 5
//! circuit_recovery_timeout_seconds: 30
//! memory_budget_mb: 512
//!
//! devices:
//!   - { id: "cpu", kind: "cpu" }
//!   - { id: "gpu:0", kind: "gpu" }
//!
//! l2:
//!   kind: "redis"
//!   url: "redis://127.0.0.1:6379"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use cache::{CacheConfig, Dtype, QuantizationConfig, SemanticBackend};
use engine::{DeviceSpec, EngineConfig, PredictiveConfig, SchedulerConfig, SloDefinition};
use resilience::{CircuitBreakerConfig, ResilienceConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading gateway configuration.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("failed to assemble layered config: {0}")]
    Layered(#[from] config::ConfigError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unsupported config version: {0}")]
    UnsupportedVersion(String),
}

/// Which backend the binary wires behind every device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Deterministic hash-seeded vectors; no model required.
    #[default]
    Stub,
    /// Remote feature-extraction endpoint (needs the `http` feature).
    Http,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub kind: BackendKind,

    #[cfg(feature = "http")]
    #[serde(default)]
    pub http: Option<engine::HttpBackendConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum L2Kind {
    /// L1 and the semantic index only.
    #[default]
    None,
    /// Process-local map; useful for tests and single instances.
    Memory,
    /// Shared Redis (needs the `redis` feature).
    Redis,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct L2Section {
    #[serde(default)]
    pub kind: L2Kind,

    #[serde(default)]
    pub url: Option<String>,
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GatewayConfig {
    /// Configuration format version
    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub name: Option<String>,

    /// `tracing` env-filter directive for the binary.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_dimension")]
    pub dimension: usize,

    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,

    #[serde(default = "default_max_batch_texts")]
    pub max_batch_texts: usize,

    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// `None` keeps entries until evicted or invalidated.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: Option<u64>,

    #[serde(default = "true_value")]
    pub hybrid_mode_enabled: bool,

    #[serde(default = "true_value")]
    pub multi_gpu_enabled: bool,

    #[serde(default)]
    pub quantization_enabled: bool,

    #[serde(default = "default_quantization_dtype")]
    pub quantization_dtype: Dtype,

    #[serde(default = "default_recalibrate_every")]
    pub quantization_recalibrate_every: usize,

    #[serde(default = "default_recalibrate_interval_seconds")]
    pub quantization_recalibrate_interval_seconds: u64,

    #[serde(default = "true_value")]
    pub semantic_cache_enabled: bool,

    #[serde(default = "default_semantic_threshold")]
    pub semantic_cache_threshold: f32,

    #[serde(default = "default_semantic_capacity")]
    pub semantic_cache_capacity: usize,

    #[serde(default)]
    pub semantic_backend: SemanticBackend,

    #[serde(default = "default_failure_threshold")]
    pub circuit_failure_threshold: u32,

    #[serde(default = "default_recovery_timeout_seconds")]
    pub circuit_recovery_timeout_seconds: u64,

    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: f64,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub batching: PredictiveConfig,

    #[serde(default = "SloDefinition::defaults")]
    pub slos: Vec<SloDefinition>,

    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceSpec>,

    #[serde(default)]
    pub backend: BackendSection,

    #[serde(default)]
    pub l2: L2Section,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            name: None,
            log_level: default_log_level(),
            dimension: default_dimension(),
            max_text_length: default_max_text_length(),
            max_batch_texts: default_max_batch_texts(),
            max_cache_size: default_max_cache_size(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            hybrid_mode_enabled: true,
            multi_gpu_enabled: true,
            quantization_enabled: false,
            quantization_dtype: default_quantization_dtype(),
            quantization_recalibrate_every: default_recalibrate_every(),
            quantization_recalibrate_interval_seconds: default_recalibrate_interval_seconds(),
            semantic_cache_enabled: true,
            semantic_cache_threshold: default_semantic_threshold(),
            semantic_cache_capacity: default_semantic_capacity(),
            semantic_backend: SemanticBackend::default(),
            circuit_failure_threshold: default_failure_threshold(),
            circuit_recovery_timeout_seconds: default_recovery_timeout_seconds(),
            memory_budget_mb: default_memory_budget_mb(),
            retry: RetryConfig::default(),
            batching: PredictiveConfig::default(),
            slos: SloDefinition::defaults(),
            devices: default_devices(),
            backend: BackendSection::default(),
            l2: L2Section::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults, then `embedgate.*` in the working directory, then
    /// `EMBEDGATE__*` environment variables.
    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_layered(None, None)
    }

    /// Like [`load`](Self::load) with an explicit file and, for tests, an
    /// explicit environment map instead of the process environment.
    pub fn load_layered(
        file: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigLoadError> {
        let file_source = match file {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("embedgate").required(false),
        };
        let builder = config::Config::builder()
            .add_source(file_source)
            .add_source(
                config::Environment::with_prefix("EMBEDGATE")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            );

        let config: GatewayConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file from the given path
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse YAML configuration from a string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigLoadError> {
        let config: GatewayConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        match self.version.as_str() {
            "1.0" | "1" => Ok(()),
            v => Err(ConfigLoadError::UnsupportedVersion(v.to_string())),
        }?;

        if self.devices.is_empty() {
            return Err(ConfigLoadError::Validation(
                "at least one device must be configured".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id.as_str()) {
                return Err(ConfigLoadError::Validation(format!(
                    "device id `{}` appears twice",
                    device.id
                )));
            }
        }

        if self.l2.kind == L2Kind::Redis && self.l2.url.is_none() {
            return Err(ConfigLoadError::Validation(
                "l2.url is required for the redis store".to_string(),
            ));
        }

        #[cfg(feature = "http")]
        if self.backend.kind == BackendKind::Http {
            match self.backend.http.as_ref() {
                None => {
                    return Err(ConfigLoadError::Validation(
                        "backend.http is required for the http backend".to_string(),
                    ));
                }
                Some(http) if http.dimension != self.dimension => {
                    return Err(ConfigLoadError::Validation(format!(
                        "backend.http.dimension {} does not match dimension {}",
                        http.dimension, self.dimension
                    )));
                }
                Some(_) => {}
            }
        }

        self.engine_config()
            .validate()
            .map_err(|err| ConfigLoadError::Validation(err.to_string()))
    }

    /// The nested engine configuration these settings describe.
    pub fn engine_config(&self) -> EngineConfig {
        let cache = CacheConfig {
            dimension: self.dimension,
            max_cache_size: self.max_cache_size,
            ttl: self.cache_ttl_seconds.map(Duration::from_secs),
            semantic_enabled: self.semantic_cache_enabled,
            semantic_threshold: self.semantic_cache_threshold,
            semantic_capacity: self.semantic_cache_capacity,
            semantic_backend: self.semantic_backend,
            quantization: QuantizationConfig {
                enabled: self.quantization_enabled,
                dtype: self.quantization_dtype,
                recalibrate_every: self.quantization_recalibrate_every,
                recalibrate_interval: Duration::from_secs(
                    self.quantization_recalibrate_interval_seconds,
                ),
                ..QuantizationConfig::default()
            },
            ..CacheConfig::default()
        };

        let resilience = ResilienceConfig::default()
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(self.circuit_failure_threshold)
                    .with_recovery_timeout(Duration::from_secs(
                        self.circuit_recovery_timeout_seconds,
                    )),
            )
            .with_retry(self.retry);

        EngineConfig::default()
            .with_dimension(self.dimension)
            .with_cache(cache)
            .with_scheduler(
                SchedulerConfig::default()
                    .with_hybrid_mode(self.hybrid_mode_enabled)
                    .with_multi_gpu(self.multi_gpu_enabled),
            )
            .with_resilience(resilience)
            .with_memory_budget_mb(self.memory_budget_mb)
            .with_limits(self.max_text_length, self.max_batch_texts)
            .with_batching(self.batching.clone())
            .with_slos(self.slos.clone())
    }
}

fn default_version() -> String {
    "1.0".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn true_value() -> bool {
    true
}
fn default_dimension() -> usize {
    384
}
fn default_max_text_length() -> usize {
    8192
}
fn default_max_batch_texts() -> usize {
    1024
}
fn default_max_cache_size() -> usize {
    10_000
}
fn default_cache_ttl_seconds() -> Option<u64> {
    Some(3600)
}
fn default_quantization_dtype() -> Dtype {
    Dtype::I8
}
fn default_recalibrate_every() -> usize {
    1000
}
fn default_recalibrate_interval_seconds() -> u64 {
    300
}
fn default_semantic_threshold() -> f32 {
    0.95
}
fn default_semantic_capacity() -> usize {
    10_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout_seconds() -> u64 {
    30
}
fn default_memory_budget_mb() -> f64 {
    512.0
}
fn default_devices() -> Vec<DeviceSpec> {
    vec![DeviceSpec::cpu()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::DeviceKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.version, "1.0");
        assert!(config.name.is_none());
        assert_eq!(config.devices, vec![DeviceSpec::cpu()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_valid_yaml() {
        let yaml = r#"
version: "1.0"
name: "edge"
dimension: 64
max_cache_size: 3
cache_ttl_seconds: 60
quantization_enabled: true
quantization_dtype: "i16"
hybrid_mode_enabled: false
devices:
  - { id: "cpu", kind: "cpu" }
  - { id: "gpu:0", kind: "gpu", weight: 8.0 }
"#;

        let config = GatewayConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.name, Some("edge".to_string()));
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[1].kind, DeviceKind::Gpu);
        assert_eq!(config.devices[1].weight, Some(8.0));

        let engine = config.engine_config();
        assert_eq!(engine.dimension, 64);
        assert_eq!(engine.cache.dimension, 64);
        assert_eq!(engine.cache.max_cache_size, 3);
        assert_eq!(engine.cache.ttl, Some(Duration::from_secs(60)));
        assert!(engine.cache.quantization.enabled);
        assert_eq!(engine.cache.quantization.dtype, Dtype::I16);
        assert!(!engine.scheduler.hybrid_mode_enabled);
        assert_eq!(engine.resilience.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_load_from_file() {
        let yaml = r#"
version: "1"
circuit_failure_threshold: 2
circuit_recovery_timeout_seconds: 5
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml.as_bytes()).unwrap();

        let config = GatewayConfig::from_yaml_file(temp_file.path()).unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.resilience.circuit_breaker.failure_threshold, 2);
        assert_eq!(
            engine.resilience.circuit_breaker.recovery_timeout,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut temp_file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        temp_file
            .write_all(b"max_cache_size: 100\nmemory_budget_mb: 64\n")
            .unwrap();

        let mut env = config::Map::new();
        env.insert("EMBEDGATE__MAX_CACHE_SIZE".to_string(), "7".to_string());
        env.insert("EMBEDGATE__MULTI_GPU_ENABLED".to_string(), "false".to_string());

        let config = GatewayConfig::load_layered(Some(temp_file.path()), Some(env)).unwrap();
        assert_eq!(config.max_cache_size, 7);
        assert_eq!(config.memory_budget_mb, 64.0);
        assert!(!config.multi_gpu_enabled);
    }

    #[test]
    fn test_version_and_device_validation() {
        let result = GatewayConfig::from_yaml_str("version: \"2.0\"\n");
        assert!(matches!(result, Err(ConfigLoadError::UnsupportedVersion(_))));

        let result = GatewayConfig::from_yaml_str("devices: []\n");
        assert!(result.unwrap_err().to_string().contains("at least one device"));

        let yaml = r#"
devices:
  - { id: "cpu", kind: "cpu" }
  - { id: "cpu", kind: "cpu" }
"#;
        let result = GatewayConfig::from_yaml_str(yaml);
        assert!(result.unwrap_err().to_string().contains("appears twice"));
    }

    #[test]
    fn test_engine_validation_surfaces() {
        let result = GatewayConfig::from_yaml_str("semantic_cache_threshold: 1.5\n");
        assert!(result.unwrap_err().to_string().contains("semantic threshold"));

        let result = GatewayConfig::from_yaml_str("l2: { kind: redis }\n");
        assert!(result.unwrap_err().to_string().contains("l2.url"));
    }
}
