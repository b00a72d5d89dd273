use crate::candle::Timeframe;
use crate::error::PipelineError;
use crate::storage_utils::AsyncStorageManager;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// CONFIGURATION STRUCTS
// Loaded once at startup and passed by reference; nothing reads config globally.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TimeframeRequest {
    pub timeframe: Timeframe,
    pub bars: usize, // e.g., 500 candles
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ExtremaConfig {
    #[serde(default = "default_extrema_window")]
    pub left: usize,
    #[serde(default = "default_extrema_window")]
    pub right: usize,
}

impl Default for ExtremaConfig {
    fn default() -> Self {
        Self {
            left: default_extrema_window(),
            right: default_extrema_window(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}

/// Where latest-completed-candle records are written.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LatestCandleNaming {
    /// One file per granularity: `latest_completed` and `latest_completed_<size>`.
    #[default]
    Distinct,
    /// Every granularity writes `latest_completed`; the last writer wins.
    Shared,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AppConfig {
    #[serde(default = "default_brokers_file")]
    pub brokers_file: String,
    #[serde(default = "default_catalog_file")]
    pub catalog_file: String,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<TimeframeRequest>,
    #[serde(default = "default_slice_sizes")]
    pub slice_sizes: Vec<usize>,
    #[serde(default)]
    pub extrema: ExtremaConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default)]
    pub parallel_brokers: bool,
    #[serde(default)]
    pub latest_candle_naming: LatestCandleNaming,
    #[serde(default = "default_terminal_bridge_url")]
    pub terminal_bridge_url: String,
    #[serde(default = "default_error_log_file")]
    pub error_log_file: String,
    #[serde(default = "default_tick_metadata_file")]
    pub tick_metadata_file: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            brokers_file: default_brokers_file(),
            catalog_file: default_catalog_file(),
            timeframes: default_timeframes(),
            slice_sizes: default_slice_sizes(),
            extrema: ExtremaConfig::default(),
            retry: RetryConfig::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            parallel_brokers: false,
            latest_candle_naming: LatestCandleNaming::default(),
            terminal_bridge_url: default_terminal_bridge_url(),
            error_log_file: default_error_log_file(),
            tick_metadata_file: default_tick_metadata_file(),
        }
    }
}

impl AppConfig {
    fn validate(&self) -> Result<(), PipelineError> {
        if self.timeframes.is_empty() {
            return Err(PipelineError::Configuration(
                "at least one timeframe must be configured".to_string(),
            ));
        }
        if let Some(tf) = self.timeframes.iter().find(|tf| tf.bars == 0) {
            return Err(PipelineError::Configuration(format!(
                "timeframe {} requests zero bars",
                tf.timeframe
            )));
        }
        if self.slice_sizes.contains(&0) {
            return Err(PipelineError::Configuration(
                "slice sizes must be positive".to_string(),
            ));
        }
        if self.retry.attempts == 0 {
            return Err(PipelineError::Configuration(
                "retry.attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One entry of the broker configuration store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub terminal_path: PathBuf,
    pub login: u64,
    pub password: String,
    pub server: String,
    pub base_folder: PathBuf,
}

/// Broker identity -> settings. Sorted by identity, which fixes evaluation order.
pub type BrokerStore = BTreeMap<String, BrokerSettings>;

/// Category -> symbols in catalog order.
pub type SymbolCatalog = BTreeMap<String, Vec<String>>;

/// Everything loaded at startup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub app: AppConfig,
    pub brokers: BrokerStore,
    pub catalog: SymbolCatalog,
}

impl RunConfig {
    /// Loads `config.json`, the broker store and the catalog.
    /// Any failure here is a [`PipelineError::Configuration`] and aborts the run.
    pub async fn load(storage: &AsyncStorageManager) -> Result<Self, PipelineError> {
        let app: AppConfig = storage
            .load("config")
            .await
            .map_err(|e| PipelineError::Configuration(format!("{e:#}")))?;
        app.validate()?;

        let brokers: BrokerStore = storage
            .load(&app.brokers_file)
            .await
            .map_err(|e| PipelineError::Configuration(format!("{e:#}")))?;
        if brokers.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "broker store '{}' is empty",
                app.brokers_file
            )));
        }

        let catalog: SymbolCatalog = storage
            .load(&app.catalog_file)
            .await
            .map_err(|e| PipelineError::Configuration(format!("{e:#}")))?;

        Ok(Self {
            app,
            brokers,
            catalog,
        })
    }
}

fn default_brokers_file() -> String {
    "brokers".to_string()
}

fn default_catalog_file() -> String {
    "symbol_catalog".to_string()
}

fn default_timeframes() -> Vec<TimeframeRequest> {
    vec![TimeframeRequest {
        timeframe: Timeframe::H4,
        bars: 500,
    }]
}

fn default_slice_sizes() -> Vec<usize> {
    vec![301]
}

fn default_extrema_window() -> usize {
    5
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    60_000
}

fn default_circuit_breaker_threshold() -> u32 {
    3
}

fn default_terminal_bridge_url() -> String {
    "http://127.0.0.1:8787".to_string()
}

fn default_error_log_file() -> String {
    "error_log".to_string()
}

fn default_tick_metadata_file() -> String {
    "tick_metadata".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn empty_config_uses_defaults() {
        let config: AppConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.slice_sizes, vec![301]);
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.latest_candle_naming, LatestCandleNaming::Distinct);
    }

    #[tokio::test]
    async fn load_reads_all_three_files() {
        let dir = tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        storage
            .save(
                "config",
                &json!({ "timeframes": [{ "timeframe": "d1", "bars": 100 }], "latest_candle_naming": "shared" }),
            )
            .await
            .unwrap();
        storage
            .save(
                "brokers",
                &json!({
                    "deriv1": {
                        "terminal_path": "/opt/deriv1/terminal64.exe",
                        "login": 1001,
                        "password": "pw",
                        "server": "Deriv-Demo",
                        "base_folder": "/data/deriv"
                    }
                }),
            )
            .await
            .unwrap();
        storage
            .save("symbol_catalog", &json!({ "forex": ["EURUSD", "GBPUSD"] }))
            .await
            .unwrap();

        let run = RunConfig::load(&storage).await.unwrap();
        assert_eq!(run.app.timeframes[0].timeframe, Timeframe::D1);
        assert_eq!(run.app.latest_candle_naming, LatestCandleNaming::Shared);
        assert_eq!(run.brokers["deriv1"].login, 1001);
        assert_eq!(run.catalog["forex"], vec!["EURUSD", "GBPUSD"]);
    }

    #[tokio::test]
    async fn missing_catalog_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let storage = AsyncStorageManager::new(dir.path()).await.unwrap();
        storage.save("config", &json!({})).await.unwrap();
        storage
            .save(
                "brokers",
                &json!({
                    "deriv1": {
                        "terminal_path": "/x",
                        "login": 1,
                        "password": "",
                        "server": "s",
                        "base_folder": "/b"
                    }
                }),
            )
            .await
            .unwrap();

        let err = RunConfig::load(&storage).await.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn zero_bars_is_rejected() {
        let config = AppConfig {
            timeframes: vec![TimeframeRequest {
                timeframe: Timeframe::H1,
                bars: 0,
            }],
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
