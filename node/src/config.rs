//! # Node Configuration
//!
//! Optional JSON file read by `run` and written by `init`. Missing fields
//! fall back to the engine defaults.
//!
//! ```json
//! {
//!   "operator": "operator",
//!   "treasury": { "address": "treasury", "fee_bps": 50 },
//!   "liquidity_manager": {
//!     "enabled": true,
//!     "check_interval": 3600,
//!     "min_rebalance_threshold": 500,
//!     "auto_rebalance": true
//!   },
//!   "venue": { "price_impact_bps": 30 },
//!   "logging": { "filter": "marketpulse_node=info,marketpulse_engine=info", "format": "pretty" }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use marketpulse_engine::config::{
    DEFAULT_CHECK_INTERVAL, DEFAULT_MIN_REBALANCE_THRESHOLD_BPS, DEFAULT_TREASURY,
    DEFAULT_TREASURY_FEE_BPS,
};
use marketpulse_engine::RegistryConfig;

use crate::logging::LoggingConfig;

/// Operator account used when none is configured.
pub const DEFAULT_OPERATOR: &str = "operator";

/// Simulated venue impact used when none is configured.
pub const DEFAULT_VENUE_PRICE_IMPACT_BPS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Account the manager loop acts as. Only vaults it owns are managed.
    pub operator: String,
    pub treasury: TreasuryConfig,
    pub liquidity_manager: ManagerConfig,
    pub venue: VenueConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreasuryConfig {
    pub address: String,
    pub fee_bps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub enabled: bool,
    /// Seconds between manager sweeps.
    pub check_interval: u64,
    /// Deviation from target (bps) that makes a vault need a rebalance.
    pub min_rebalance_threshold: u32,
    /// Rebalance right after each deposit.
    pub auto_rebalance: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VenueConfig {
    pub price_impact_bps: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            operator: DEFAULT_OPERATOR.to_string(),
            treasury: TreasuryConfig::default(),
            liquidity_manager: ManagerConfig::default(),
            venue: VenueConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_TREASURY.to_string(),
            fee_bps: DEFAULT_TREASURY_FEE_BPS,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: DEFAULT_CHECK_INTERVAL.as_secs(),
            min_rebalance_threshold: DEFAULT_MIN_REBALANCE_THRESHOLD_BPS,
            auto_rebalance: true,
        }
    }
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            price_impact_bps: DEFAULT_VENUE_PRICE_IMPACT_BPS,
        }
    }
}

impl NodeConfig {
    /// Reads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes this configuration as pretty-printed JSON.
    pub fn write(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(self).context("failed to encode config")?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.operator.trim().is_empty() {
            bail!("operator must not be empty");
        }
        if self.liquidity_manager.check_interval == 0 {
            bail!("liquidity_manager.check_interval must be positive");
        }
        self.registry_config()
            .validate()
            .context("invalid registry settings")?;
        self.logging.env_filter()?;
        Ok(())
    }

    /// The registry settings this node creates vaults with.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            treasury: self.treasury.address.clone(),
            treasury_fee_bps: self.treasury.fee_bps,
            min_rebalance_threshold_bps: self.liquidity_manager.min_rebalance_threshold,
            auto_rebalance: self.liquidity_manager.auto_rebalance,
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.liquidity_manager.check_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_engine() {
        let cfg = NodeConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.registry_config(), RegistryConfig::default());
        assert_eq!(cfg.check_interval(), DEFAULT_CHECK_INTERVAL);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: NodeConfig =
            serde_json::from_str(r#"{ "liquidity_manager": { "check_interval": 60 } }"#).unwrap();
        assert_eq!(cfg.check_interval(), Duration::from_secs(60));
        assert!(cfg.liquidity_manager.enabled);
        assert_eq!(cfg.operator, DEFAULT_OPERATOR);
        assert_eq!(cfg.treasury.fee_bps, DEFAULT_TREASURY_FEE_BPS);
    }

    #[test]
    fn out_of_range_fee_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.treasury.fee_bps = 10_001;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.liquidity_manager.check_interval = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_log_filter_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.logging.filter = "marketpulse_engine=loud".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marketpulse.json");

        let mut cfg = NodeConfig::default();
        cfg.operator = "desk".into();
        cfg.venue.price_impact_bps = 5;
        cfg.logging.format = crate::logging::LogFormat::Json;
        cfg.write(&path).unwrap();

        assert_eq!(NodeConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = NodeConfig::load(Path::new("/nonexistent/marketpulse.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
