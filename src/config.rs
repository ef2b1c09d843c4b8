//! Configuration management for the Cosmos relay
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tx::RetryPolicy;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub chain: ChainConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub min_connections: u32,
}

/// Per-chain relay parameters
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: String,
    #[serde(default = "default_bech32_prefix")]
    pub bech32_prefix: String,
    #[serde(default = "default_gas_token")]
    pub gas_token: String,
    #[serde(default = "default_fallback_gas_price")]
    pub fallback_gas_price: Decimal,
    /// Upper bound on the gas price of a signed tx, whatever the estimators say
    #[serde(default)]
    pub max_gas_price: Option<Decimal>,
    #[serde(default = "default_gas_limit_multiplier")]
    pub gas_limit_multiplier: f64,
    #[serde(default = "default_max_msgs_per_batch")]
    pub max_msgs_per_batch: i64,
    #[serde(default = "default_block_rate_ms")]
    pub block_rate_ms: u64,
    #[serde(default = "default_blocks_until_tx_timeout")]
    pub blocks_until_tx_timeout: i64,
    #[serde(default = "default_confirm_poll_period_ms")]
    pub confirm_poll_period_ms: u64,
    #[serde(default = "default_tx_msg_timeout_secs")]
    pub tx_msg_timeout_secs: u64,
    #[serde(default = "default_ocr2_cache_poll_period_ms")]
    pub ocr2_cache_poll_period_ms: u64,
    #[serde(default = "default_ocr2_cache_ttl_secs")]
    pub ocr2_cache_ttl_secs: u64,
    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

fn default_max_connections() -> u32 {
    5
}

fn default_bech32_prefix() -> String {
    "wasm".to_string()
}

fn default_gas_token() -> String {
    "ucosm".to_string()
}

fn default_fallback_gas_price() -> Decimal {
    Decimal::new(15, 3)
}

fn default_gas_limit_multiplier() -> f64 {
    1.5
}

fn default_max_msgs_per_batch() -> i64 {
    100
}

fn default_block_rate_ms() -> u64 {
    6_000
}

fn default_blocks_until_tx_timeout() -> i64 {
    30
}

fn default_confirm_poll_period_ms() -> u64 {
    1_000
}

fn default_tx_msg_timeout_secs() -> u64 {
    600
}

fn default_ocr2_cache_poll_period_ms() -> u64 {
    4_000
}

fn default_ocr2_cache_ttl_secs() -> u64 {
    60
}

fn default_close_timeout_secs() -> u64 {
    10
}

impl ChainConfig {
    /// Defaults for a chain, everything but the id filled in
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            bech32_prefix: default_bech32_prefix(),
            gas_token: default_gas_token(),
            fallback_gas_price: default_fallback_gas_price(),
            max_gas_price: None,
            gas_limit_multiplier: default_gas_limit_multiplier(),
            max_msgs_per_batch: default_max_msgs_per_batch(),
            block_rate_ms: default_block_rate_ms(),
            blocks_until_tx_timeout: default_blocks_until_tx_timeout(),
            confirm_poll_period_ms: default_confirm_poll_period_ms(),
            tx_msg_timeout_secs: default_tx_msg_timeout_secs(),
            ocr2_cache_poll_period_ms: default_ocr2_cache_poll_period_ms(),
            ocr2_cache_ttl_secs: default_ocr2_cache_ttl_secs(),
            close_timeout_secs: default_close_timeout_secs(),
        }
    }

    pub fn block_rate(&self) -> Duration {
        Duration::from_millis(self.block_rate_ms)
    }

    pub fn confirm_poll_period(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_period_ms)
    }

    pub fn tx_msg_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_msg_timeout_secs)
    }

    pub fn ocr2_cache_poll_period(&self) -> Duration {
        Duration::from_millis(self.ocr2_cache_poll_period_ms)
    }

    pub fn ocr2_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.ocr2_cache_ttl_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    /// Confirmation polling: fixed interval, spanning the blocks a tx may
    /// wait before it times out on chain.
    pub fn confirm_retry_policy(&self) -> RetryPolicy {
        let window = self
            .block_rate_ms
            .saturating_mul(self.blocks_until_tx_timeout.max(1) as u64);
        let period = self.confirm_poll_period_ms.max(1);
        let attempts = u32::try_from(window / period).unwrap_or(u32::MAX).max(1);
        RetryPolicy::fixed(attempts, self.confirm_poll_period())
    }

    /// Validate chain parameters
    pub fn validate(&self) -> Result<()> {
        if self.chain_id.is_empty() {
            anyhow::bail!("chain_id must be set");
        }
        if self.gas_token.is_empty() {
            anyhow::bail!("Chain {} has no gas token configured", self.chain_id);
        }
        if self.max_msgs_per_batch < 1 {
            anyhow::bail!("max_msgs_per_batch must be at least 1");
        }
        if self.gas_limit_multiplier < 1.0 {
            anyhow::bail!("gas_limit_multiplier must be at least 1.0");
        }
        if self.blocks_until_tx_timeout < 1 {
            anyhow::bail!("blocks_until_tx_timeout must be at least 1");
        }
        if self.block_rate_ms == 0 || self.confirm_poll_period_ms == 0 {
            anyhow::bail!("Chain {} has a zero poll period", self.chain_id);
        }
        if self.fallback_gas_price.is_sign_negative() {
            anyhow::bail!("fallback_gas_price must not be negative");
        }
        if let Some(max) = self.max_gas_price {
            if max <= Decimal::ZERO {
                anyhow::bail!("max_gas_price must be positive");
            }
        }
        Ok(())
    }
}

impl Settings {
    /// Load settings from the file named by `COSMOS_RELAY_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("COSMOS_RELAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database url must be set");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be at least 1");
        }
        self.chain
            .validate()
            .with_context(|| format!("Invalid chain config for {}", self.chain.chain_id))
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
