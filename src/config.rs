//! Configuration management for the transaction pipeline
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::ledger::Ledger;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub ledgers: LedgersConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub fee_cache_ttl_secs: u64,
    pub monitor_poll_interval_secs: u64,
    pub replacement_min_bump_percent: u64,
    pub cancel_bump_percent: u64,
    pub batch_concurrency: usize,
    pub fee_history_concurrency: usize,
    pub settled_cache_size: usize,
    pub health_check_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fee_cache_ttl_secs: 15,
            monitor_poll_interval_secs: 5,
            replacement_min_bump_percent: 10,
            cancel_bump_percent: 20,
            batch_concurrency: 8,
            fee_history_concurrency: 4,
            settled_cache_size: 1024,
            health_check_interval_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn fee_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.fee_cache_ttl_secs)
    }

    pub fn monitor_poll_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_poll_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgersConfig {
    pub account: Option<AccountConfig>,
    pub utxo: Option<UtxoConfig>,
    pub blockhash: Option<BlockhashConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub rpc_urls: Vec<String>,
    pub chain_id: u64,
    #[serde(default = "default_gas_limit")]
    pub default_gas_limit: u64,
    /// Ceiling for every fee tier
    pub max_fee_gwei: Option<u64>,
    #[serde(default)]
    pub dust_threshold: u64,
}

impl AccountConfig {
    pub fn max_fee_per_gas(&self) -> Option<u128> {
        self.max_fee_gwei
            .map(|gwei| u128::from(gwei) * 1_000_000_000)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UtxoConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_utxo_dust")]
    pub dust_threshold: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockhashConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_fee_per_signature")]
    pub fee_per_signature: u64,
    #[serde(default = "default_blockhash_dust")]
    pub dust_threshold: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_gas_limit() -> u64 {
    21_000
}

fn default_utxo_dust() -> u64 {
    546
}

fn default_fee_per_signature() -> u64 {
    5_000
}

fn default_blockhash_dust() -> u64 {
    890_880
}

impl Settings {
    /// Load settings from the file named by `TX_PIPELINE_CONFIG`, or the default path
    pub fn load() -> Result<Self> {
        let config_path = env::var("TX_PIPELINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&config_str)
    }

    /// Parse TOML after substituting environment variables
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_ledgers().is_empty() {
            anyhow::bail!("At least one ledger must be enabled");
        }

        for ledger in self.enabled_ledgers() {
            if self.rpc_urls(ledger).map_or(true, |urls| urls.is_empty()) {
                anyhow::bail!("Ledger {} has no RPC URLs configured", ledger);
            }
        }

        if self.pipeline.monitor_poll_interval_secs == 0 {
            anyhow::bail!("monitor_poll_interval_secs must be positive");
        }

        Ok(())
    }

    /// Enabled ledgers in declaration order
    pub fn enabled_ledgers(&self) -> Vec<Ledger> {
        let ledgers = &self.ledgers;
        let mut enabled = Vec::new();
        if ledgers.account.as_ref().is_some_and(|c| c.enabled) {
            enabled.push(Ledger::Account);
        }
        if ledgers.utxo.as_ref().is_some_and(|c| c.enabled) {
            enabled.push(Ledger::Utxo);
        }
        if ledgers.blockhash.as_ref().is_some_and(|c| c.enabled) {
            enabled.push(Ledger::Blockhash);
        }
        enabled
    }

    pub fn rpc_urls(&self, ledger: Ledger) -> Option<&[String]> {
        match ledger {
            Ledger::Account => self.ledgers.account.as_ref().map(|c| c.rpc_urls.as_slice()),
            Ledger::Utxo => self.ledgers.utxo.as_ref().map(|c| c.rpc_urls.as_slice()),
            Ledger::Blockhash => self
                .ledgers
                .blockhash
                .as_ref()
                .map(|c| c.rpc_urls.as_slice()),
        }
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[pipeline]
fee_cache_ttl_secs = 30

[ledgers.account]
rpc_urls = ["http://127.0.0.1:8545"]
chain_id = 1
max_fee_gwei = 200

[ledgers.utxo]
enabled = false
rpc_urls = []
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TX_PIPELINE_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TX_PIPELINE_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings = Settings::parse(SAMPLE).unwrap();
        assert_eq!(settings.pipeline.fee_cache_ttl_secs, 30);
        assert_eq!(settings.pipeline.monitor_poll_interval_secs, 5);
        assert_eq!(settings.pipeline.replacement_min_bump_percent, 10);
        assert_eq!(settings.enabled_ledgers(), vec![Ledger::Account]);

        let account = settings.ledgers.account.as_ref().unwrap();
        assert_eq!(account.default_gas_limit, 21_000);
        assert_eq!(account.max_fee_per_gas(), Some(200_000_000_000));
        assert_eq!(settings.api.port, 8080);
    }

    #[test]
    fn test_requires_an_enabled_ledger() {
        let err = Settings::parse("[pipeline]\n").unwrap_err();
        assert!(err.to_string().contains("At least one ledger"));
    }

    #[test]
    fn test_enabled_ledger_needs_rpc_urls() {
        let err = Settings::parse("[ledgers.utxo]\nrpc_urls = []\n").unwrap_err();
        assert!(err.to_string().contains("no RPC URLs"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[ledgers.blockhash]\nrpc_urls = [\"http://127.0.0.1:8899\"]\n"
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        let blockhash = settings.ledgers.blockhash.unwrap();
        assert_eq!(blockhash.fee_per_signature, 5_000);
        assert_eq!(blockhash.dust_threshold, 890_880);
    }
}
