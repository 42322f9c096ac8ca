//! # External Collaborators
//!
//! The vault engine never moves tokens or talks to a DEX directly. It calls
//! two narrow interfaces:
//!
//! - [`AssetTransfer`]: pulls deposits in, pays withdrawals and fees out,
//!   and reports custodied balances.
//! - [`LiquidityVenue`]: provisions and withdraws liquidity, bounded by a
//!   maximum price impact, and reports the value of the vault's position.
//!
//! Both are synchronous: a vault operation holds its vault's lock for the
//! whole call, so a collaborator call must complete (or fail) within it.
//!
//! [`InMemoryBank`] and [`SimulatedVenue`] are complete in-process
//! implementations used by the node and the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::apply_bps;

/// Identifier of an underlying asset (token address, ticker, ...).
pub type AssetId = String;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures reported by an [`AssetTransfer`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The source account cannot cover the transfer.
    #[error("insufficient balance: {account} has {available}, requested {requested}")]
    InsufficientBalance {
        /// The debited account.
        account: String,
        /// Its balance of the asset.
        available: u64,
        /// The requested amount.
        requested: u64,
    },

    /// Crediting the destination would overflow.
    #[error("balance overflow crediting {account}")]
    Overflow {
        /// The credited account.
        account: String,
    },

    /// The transfer was refused (frozen account, compliance hold, ...).
    #[error("transfer rejected: {0}")]
    Rejected(String),
}

/// Failures reported by a [`LiquidityVenue`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VenueError {
    /// Execution would move the price further than the caller allows.
    /// The venue did not settle anything.
    #[error("price impact {price_impact_bps} bps exceeds bound {max_slippage_bps} bps")]
    PriceImpactTooHigh {
        /// Impact the execution would have had.
        price_impact_bps: u32,
        /// The caller's bound.
        max_slippage_bps: u32,
    },

    /// Withdrawal larger than the vault's position.
    #[error("insufficient position: available {available}, requested {requested}")]
    InsufficientPosition {
        /// Current position value.
        available: u64,
        /// Requested withdrawal.
        requested: u64,
    },

    /// Moving funds to or from the venue failed.
    #[error("settlement transfer failed: {0}")]
    Transfer(#[from] TransferError),

    /// The venue is unreachable or paused.
    #[error("venue unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Moves underlying assets between holders and vault custody.
pub trait AssetTransfer: Send + Sync {
    /// Pulls `amount` of `asset` from `from` into the vault account.
    fn transfer_in(
        &self,
        asset: &str,
        from: &str,
        vault: &str,
        amount: u64,
    ) -> Result<(), TransferError>;

    /// Pays `amount` of `asset` from the vault account to `to`.
    fn transfer_out(&self, asset: &str, vault: &str, to: &str, amount: u64)
        -> Result<(), TransferError>;

    /// Balance of `asset` held by `account`.
    fn balance_of(&self, asset: &str, account: &str) -> u64;
}

/// Result of a settled venue execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueFill {
    /// Units actually provisioned (provide) or returned (withdraw).
    pub amount: u64,
    /// Realized price impact of the execution.
    pub price_impact_bps: u32,
}

/// A liquidity venue (DEX pool, lending market) the vault deploys into.
pub trait LiquidityVenue: Send + Sync {
    /// Moves `amount` idle units from the vault into its venue position.
    /// Must not settle if the impact would exceed `max_slippage_bps`.
    fn provide_liquidity(
        &self,
        vault: &str,
        asset: &str,
        amount: u64,
        max_slippage_bps: u32,
    ) -> Result<VenueFill, VenueError>;

    /// Moves `amount` of position value back to the vault account.
    /// Must not settle if the impact would exceed `max_slippage_bps`.
    fn withdraw_liquidity(
        &self,
        vault: &str,
        asset: &str,
        amount: u64,
        max_slippage_bps: u32,
    ) -> Result<VenueFill, VenueError>;

    /// Current value of the vault's position, including accrued fees.
    fn position_value(&self, vault: &str, asset: &str) -> u64;
}

// ---------------------------------------------------------------------------
// InMemoryBank
// ---------------------------------------------------------------------------

/// A thread-safe multi-asset balance book.
///
/// Transfers are atomic: both legs are applied under one write lock, and
/// nothing is written if either leg fails.
#[derive(Debug, Default)]
pub struct InMemoryBank {
    balances: RwLock<HashMap<(AssetId, String), u64>>,
    frozen: RwLock<Vec<String>>,
}

impl InMemoryBank {
    /// Creates an empty bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `amount` new units of `asset` in `account`. Used for faucets
    /// and to back simulated venue fees.
    pub fn mint(&self, asset: &str, account: &str, amount: u64) -> Result<u64, TransferError> {
        let mut balances = self.balances.write();
        let entry = balances
            .entry((asset.to_string(), account.to_string()))
            .or_insert(0);
        *entry = entry.checked_add(amount).ok_or(TransferError::Overflow {
            account: account.to_string(),
        })?;
        Ok(*entry)
    }

    /// Moves `amount` of `asset` from `from` to `to`.
    pub fn transfer(
        &self,
        asset: &str,
        from: &str,
        to: &str,
        amount: u64,
    ) -> Result<(), TransferError> {
        {
            let frozen = self.frozen.read();
            if let Some(account) = frozen.iter().find(|a| *a == from || *a == to) {
                return Err(TransferError::Rejected(format!("account {} is frozen", account)));
            }
        }

        let mut balances = self.balances.write();
        let from_key = (asset.to_string(), from.to_string());
        let to_key = (asset.to_string(), to.to_string());

        let available = balances.get(&from_key).copied().unwrap_or(0);
        if available < amount {
            return Err(TransferError::InsufficientBalance {
                account: from.to_string(),
                available,
                requested: amount,
            });
        }
        if from == to {
            return Ok(());
        }
        let credited = balances
            .get(&to_key)
            .copied()
            .unwrap_or(0)
            .checked_add(amount)
            .ok_or(TransferError::Overflow {
                account: to.to_string(),
            })?;

        balances.insert(from_key, available - amount);
        balances.insert(to_key, credited);
        Ok(())
    }

    /// Balance of `asset` held by `account`.
    pub fn balance(&self, asset: &str, account: &str) -> u64 {
        self.balances
            .read()
            .get(&(asset.to_string(), account.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Rejects every transfer touching `account` until [`unfreeze`](Self::unfreeze).
    pub fn freeze(&self, account: &str) {
        let mut frozen = self.frozen.write();
        if !frozen.iter().any(|a| a == account) {
            frozen.push(account.to_string());
        }
    }

    /// Lifts a freeze placed by [`freeze`](Self::freeze).
    pub fn unfreeze(&self, account: &str) {
        self.frozen.write().retain(|a| a != account);
    }
}

impl AssetTransfer for InMemoryBank {
    fn transfer_in(
        &self,
        asset: &str,
        from: &str,
        vault: &str,
        amount: u64,
    ) -> Result<(), TransferError> {
        self.transfer(asset, from, vault, amount)
    }

    fn transfer_out(
        &self,
        asset: &str,
        vault: &str,
        to: &str,
        amount: u64,
    ) -> Result<(), TransferError> {
        self.transfer(asset, vault, to, amount)
    }

    fn balance_of(&self, asset: &str, account: &str) -> u64 {
        self.balance(asset, account)
    }
}

// ---------------------------------------------------------------------------
// SimulatedVenue
// ---------------------------------------------------------------------------

/// Account name under which [`SimulatedVenue`] holds provisioned funds.
pub const SIMULATED_VENUE_ACCOUNT: &str = "venue:simulated";

/// An in-process liquidity venue with a configurable, uniform price impact.
///
/// Every execution loses `price_impact_bps` of its notional. Provisioned
/// funds move through the shared [`InMemoryBank`], so custodied balances
/// stay consistent with the vault's books. [`accrue_fees`](Self::accrue_fees)
/// simulates LP fee income.
pub struct SimulatedVenue {
    bank: Arc<InMemoryBank>,
    positions: RwLock<HashMap<(String, AssetId), u64>>,
    price_impact_bps: AtomicU32,
}

impl std::fmt::Debug for SimulatedVenue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedVenue")
            .field("positions", &self.positions.read().len())
            .field("price_impact_bps", &self.price_impact_bps())
            .finish()
    }
}

impl SimulatedVenue {
    /// Creates a venue settling through `bank` with the given impact.
    pub fn new(bank: Arc<InMemoryBank>, price_impact_bps: u32) -> Self {
        Self {
            bank,
            positions: RwLock::new(HashMap::new()),
            price_impact_bps: AtomicU32::new(price_impact_bps),
        }
    }

    /// Current simulated price impact.
    pub fn price_impact_bps(&self) -> u32 {
        self.price_impact_bps.load(Ordering::Relaxed)
    }

    /// Changes the simulated price impact for subsequent executions.
    pub fn set_price_impact_bps(&self, bps: u32) {
        self.price_impact_bps.store(bps, Ordering::Relaxed);
    }

    /// Credits fee income to a vault's position.
    pub fn accrue_fees(&self, vault: &str, asset: &str, amount: u64) -> Result<u64, VenueError> {
        let mut positions = self.positions.write();
        let key = (vault.to_string(), asset.to_string());
        let current = positions.get(&key).copied().unwrap_or(0);
        let updated = current
            .checked_add(amount)
            .ok_or(VenueError::Transfer(TransferError::Overflow {
                account: vault.to_string(),
            }))?;
        self.bank.mint(asset, SIMULATED_VENUE_ACCOUNT, amount)?;
        positions.insert(key, updated);
        Ok(updated)
    }

    fn check_impact(&self, max_slippage_bps: u32) -> Result<u32, VenueError> {
        let impact = self.price_impact_bps();
        if impact > max_slippage_bps {
            return Err(VenueError::PriceImpactTooHigh {
                price_impact_bps: impact,
                max_slippage_bps,
            });
        }
        Ok(impact)
    }
}

impl LiquidityVenue for SimulatedVenue {
    fn provide_liquidity(
        &self,
        vault: &str,
        asset: &str,
        amount: u64,
        max_slippage_bps: u32,
    ) -> Result<VenueFill, VenueError> {
        let impact = self.check_impact(max_slippage_bps)?;
        let provisioned = amount - apply_bps(amount, impact);

        let mut positions = self.positions.write();
        let key = (vault.to_string(), asset.to_string());
        let updated = positions
            .get(&key)
            .copied()
            .unwrap_or(0)
            .checked_add(provisioned)
            .ok_or(VenueError::Transfer(TransferError::Overflow {
                account: vault.to_string(),
            }))?;

        self.bank
            .transfer(asset, vault, SIMULATED_VENUE_ACCOUNT, amount)?;
        positions.insert(key, updated);

        Ok(VenueFill {
            amount: provisioned,
            price_impact_bps: impact,
        })
    }

    fn withdraw_liquidity(
        &self,
        vault: &str,
        asset: &str,
        amount: u64,
        max_slippage_bps: u32,
    ) -> Result<VenueFill, VenueError> {
        let impact = self.check_impact(max_slippage_bps)?;

        let mut positions = self.positions.write();
        let key = (vault.to_string(), asset.to_string());
        let available = positions.get(&key).copied().unwrap_or(0);
        if amount > available {
            return Err(VenueError::InsufficientPosition {
                available,
                requested: amount,
            });
        }

        let returned = amount - apply_bps(amount, impact);
        self.bank
            .transfer(asset, SIMULATED_VENUE_ACCOUNT, vault, returned)?;
        positions.insert(key, available - amount);

        Ok(VenueFill {
            amount: returned,
            price_impact_bps: impact,
        })
    }

    fn position_value(&self, vault: &str, asset: &str) -> u64 {
        self.positions
            .read()
            .get(&(vault.to_string(), asset.to_string()))
            .copied()
            .unwrap_or(0)
    }
}
