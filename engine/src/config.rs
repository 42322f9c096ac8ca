//! # Engine Configuration & Constants
//!
//! Every basis-point bound and default the vault engine relies on lives here.
//! Vault-level parameters are validated against these at creation time;
//! registry-wide settings are grouped in [`RegistryConfig`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::ledger::AccountId;

// ---------------------------------------------------------------------------
// Basis Points
// ---------------------------------------------------------------------------

/// 100% expressed in basis points.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Upper bound (inclusive) for every bps-valued parameter.
pub const MAX_BPS: u32 = BPS_DENOMINATOR;

// ---------------------------------------------------------------------------
// Vault Defaults
// ---------------------------------------------------------------------------

/// Default share of assets deployed to the liquidity venue (80%).
pub const DEFAULT_TARGET_LIQUIDITY_BPS: u32 = 8_000;

/// Default maximum tolerated price impact for a rebalancing move (1%).
pub const DEFAULT_MAX_SLIPPAGE_BPS: u32 = 100;

/// Default vault lifetime: seven days.
pub const DEFAULT_EXPIRY_DURATION: Duration = Duration::from_secs(604_800);

/// Minimum deviation from target before a rebalance is worth doing (5%).
pub const DEFAULT_MIN_REBALANCE_THRESHOLD_BPS: u32 = 500;

/// Default factory fee on distributed yield (0.5%).
pub const DEFAULT_TREASURY_FEE_BPS: u32 = 50;

/// Default treasury account used when none is configured.
pub const DEFAULT_TREASURY: &str = "treasury";

/// Maximum length of a claim-token name.
pub const MAX_TOKEN_NAME_LENGTH: usize = 64;

/// Maximum length of a claim-token symbol.
pub const MAX_TOKEN_SYMBOL_LENGTH: usize = 16;

// ---------------------------------------------------------------------------
// Manager Defaults
// ---------------------------------------------------------------------------

/// How often the vault manager loop inspects vaults (one hour).
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(3_600);

/// Broadcast channel capacity for vault events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Registry-wide settings applied to every vault the factory creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Account that receives the treasury fee on distributed yield.
    pub treasury: AccountId,

    /// Fee on distributed yield, in basis points.
    pub treasury_fee_bps: u32,

    /// Deviation from target (bps) that triggers a rebalance.
    pub min_rebalance_threshold_bps: u32,

    /// Whether a deposit is followed by a best-effort rebalance.
    pub auto_rebalance: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            treasury: DEFAULT_TREASURY.to_string(),
            treasury_fee_bps: DEFAULT_TREASURY_FEE_BPS,
            min_rebalance_threshold_bps: DEFAULT_MIN_REBALANCE_THRESHOLD_BPS,
            auto_rebalance: true,
        }
    }
}

impl RegistryConfig {
    /// Rejects out-of-range settings before any vault is created with them.
    pub fn validate(&self) -> VaultResult<()> {
        validate_bps("treasury_fee_bps", self.treasury_fee_bps)?;
        validate_bps(
            "min_rebalance_threshold_bps",
            self.min_rebalance_threshold_bps,
        )?;
        if self.treasury.is_empty() {
            return Err(VaultError::InvalidParameter(
                "treasury account must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Utility
// ---------------------------------------------------------------------------

/// Checks that a basis-point parameter lies in `[0, 10000]`.
pub fn validate_bps(name: &str, value: u32) -> VaultResult<()> {
    if value > MAX_BPS {
        return Err(VaultError::InvalidParameter(format!(
            "{} must be within [0, {}], got {}",
            name, MAX_BPS, value
        )));
    }
    Ok(())
}

/// `floor(amount * bps / 10000)` without intermediate overflow.
pub fn apply_bps(amount: u64, bps: u32) -> u64 {
    // bps <= 10000 keeps the quotient <= amount, so the narrowing is lossless.
    ((amount as u128 * bps as u128) / BPS_DENOMINATOR as u128) as u64
}
