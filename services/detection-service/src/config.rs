//! Layered, refreshable configuration (spec.md §6).
//!
//! Defaults, then an optional YAML file (`DETECTION_CONFIG_FILE`), then
//! `DETECTION__`-prefixed environment variables, mirroring swarm-core's
//! `load_config` layering.

use arc_swap::ArcSwap;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct PortScanConfig {
    pub port_threshold: u32,
    pub time_window_secs: u32,
    pub confidence_threshold: f64,
}

impl Default for PortScanConfig {
    fn default() -> Self {
        Self { port_threshold: 20, time_window_secs: 60, confidence_threshold: 0.8 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DdosConfig {
    pub packet_rate_threshold: f64,
    pub time_window_secs: u32,
    pub confidence_threshold: f64,
}

impl Default for DdosConfig {
    fn default() -> Self {
        Self { packet_rate_threshold: 1000.0, time_window_secs: 10, confidence_threshold: 0.8 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct C2BeaconConfig {
    pub min_connections: u32,
    pub cv_threshold: f64,
    pub confidence_threshold: f64,
}

impl Default for C2BeaconConfig {
    fn default() -> Self {
        Self { min_connections: 10, cv_threshold: 15.0, confidence_threshold: 0.8 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CryptoMiningConfig {
    pub min_connections: u32,
    pub data_threshold_bytes: u64,
    pub confidence_threshold: f64,
}

impl Default for CryptoMiningConfig {
    fn default() -> Self {
        Self { min_connections: 5, data_threshold_bytes: 1024 * 1024, confidence_threshold: 0.8 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TorUsageConfig {
    pub min_connections: u32,
    pub confidence_threshold: f64,
}

impl Default for TorUsageConfig {
    fn default() -> Self {
        Self { min_connections: 3, confidence_threshold: 0.8 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    pub time_window_secs: u32,
    pub entity_threshold: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self { time_window_secs: 300, entity_threshold: 0.7 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    pub whitelist_addrs: Vec<String>,
    pub whitelist_subnets: Vec<String>,
    pub business_hours_start: u32,
    pub business_hours_end: u32,
    pub weekend_factor: f64,
    pub min_group_confidence: f64,
    pub max_false_positive_rate_port_scan: f64,
    pub max_false_positive_rate_ddos: f64,
    pub max_false_positive_rate_c2_beacon: f64,
    pub max_false_positive_rate_crypto_mining: f64,
    pub max_false_positive_rate_tor_usage: f64,
    pub max_pattern_repetition_score: f64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            whitelist_addrs: Vec::new(),
            whitelist_subnets: Vec::new(),
            business_hours_start: 8,
            business_hours_end: 18,
            weekend_factor: 0.8,
            min_group_confidence: 0.8,
            max_false_positive_rate_port_scan: 0.03,
            max_false_positive_rate_ddos: 0.02,
            max_false_positive_rate_c2_beacon: 0.04,
            max_false_positive_rate_crypto_mining: 0.05,
            max_false_positive_rate_tor_usage: 0.03,
            max_pattern_repetition_score: 0.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateStoreConfig {
    pub ttl_secs: i64,
    pub max_history: usize,
    pub cleanup_interval_secs: i64,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self { ttl_secs: 1800, max_history: 100, cleanup_interval_secs: 300 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelManagerConfig {
    pub max_error_count: u32,
    pub health_check_interval_secs: i64,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self { max_error_count: 5, health_check_interval_secs: 300 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub success_threshold: u32,
    pub call_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout_secs: 60, success_threshold: 3, call_timeout_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadlinesConfig {
    pub tier1_secs: u64,
    pub tier2_secs: u64,
    pub tier3_secs: u64,
    pub tier4_secs: u64,
    pub batch_secs: u64,
    pub state_store_secs: u64,
    pub publisher_secs: u64,
}

impl Default for DeadlinesConfig {
    fn default() -> Self {
        Self { tier1_secs: 30, tier2_secs: 120, tier3_secs: 180, tier4_secs: 120, batch_secs: 300, state_store_secs: 5, publisher_secs: 10 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub port_scan: PortScanConfig,
    #[serde(default)]
    pub ddos: DdosConfig,
    #[serde(default)]
    pub c2_beacon: C2BeaconConfig,
    #[serde(default)]
    pub crypto_mining: CryptoMiningConfig,
    #[serde(default)]
    pub tor_usage: TorUsageConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub state_store: StateStoreConfig,
    #[serde(default)]
    pub model_manager: ModelManagerConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub deadlines: DeadlinesConfig,
}

fn builder_with_defaults() -> config::ConfigBuilder<config::builder::DefaultState> {
    config::Config::builder()
}

/// Reads `DETECTION_CONFIG_FILE` and parses it as YAML via `serde_yaml`,
/// re-serializing to JSON so it can be layered into the `config` builder
/// alongside the environment source.
fn yaml_file_source() -> Option<config::File<config::FileSourceString, config::FileFormat>> {
    let path = std::env::var("DETECTION_CONFIG_FILE").ok()?;
    let contents = std::fs::read_to_string(&path).ok()?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&contents).ok()?;
    let json = serde_json::to_string(&yaml_value).ok()?;
    Some(config::File::from_str(&json, config::FileFormat::Json))
}

/// Builds a `ServiceConfig` from defaults, an optional YAML file, then env overrides.
pub fn load() -> Result<ServiceConfig, config::ConfigError> {
    let mut builder = builder_with_defaults();
    if let Some(source) = yaml_file_source() {
        builder = builder.add_source(source);
    }
    builder = builder.add_source(config::Environment::with_prefix("DETECTION").separator("__"));
    match builder.build() {
        Ok(raw) => raw.try_deserialize().or_else(|_| Ok(ServiceConfig::default())),
        Err(_) => Ok(ServiceConfig::default()),
    }
}

/// Hot-reloadable handle shared across the pipeline; a batch keeps using the
/// snapshot it started with even if `reload()` runs concurrently.
pub struct ConfigHandle {
    current: ArcSwap<ServiceConfig>,
}

impl ConfigHandle {
    pub fn new(initial: ServiceConfig) -> Self {
        Self { current: ArcSwap::from_pointee(initial) }
    }

    pub fn snapshot(&self) -> Arc<ServiceConfig> {
        self.current.load_full()
    }

    pub fn reload(&self) -> Result<(), config::ConfigError> {
        let fresh = load()?;
        self.current.store(Arc::new(fresh));
        Ok(())
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}
