//! # Vault Error Taxonomy
//!
//! Every fallible vault operation returns a [`VaultError`]. All variants are
//! local, synchronous failures: nothing is retried internally, and a failed
//! operation leaves the ledger exactly as it was before the call. The caller
//! decides whether to retry with different parameters.

use thiserror::Error;

use crate::collaborators::{TransferError, VenueError};
use crate::storage::StoreError;

/// Errors that can occur during vault, ledger, and registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// A debit would drive the vault's asset balance below zero.
    #[error("insufficient assets: available {available}, requested {requested}")]
    InsufficientAssets {
        /// Assets currently available on the debited side of the ledger.
        available: u64,
        /// Amount the operation tried to remove.
        requested: u64,
    },

    /// A burn exceeds the holder's claim balance.
    #[error("insufficient claims: holder {holder} has {balance}, tried to burn {requested}")]
    InsufficientClaims {
        /// The holder whose balance was checked.
        holder: String,
        /// The holder's current claim balance.
        balance: u64,
        /// Amount the caller tried to burn.
        requested: u64,
    },

    /// The deposit would be rounded down to zero shares.
    #[error("deposit of {deposit} would mint zero shares")]
    ZeroSharesMinted {
        /// The rejected deposit amount.
        deposit: u64,
    },

    /// Burn amount is zero, exceeds the holder's balance, redeems nothing,
    /// or the vault has no outstanding supply.
    #[error("invalid burn amount {amount}: {reason}")]
    InvalidBurnAmount {
        /// The rejected burn amount.
        amount: u64,
        /// Why the amount was rejected.
        reason: String,
    },

    /// Checked arithmetic overflowed.
    #[error("arithmetic overflow")]
    ArithmeticOverflow,

    /// The liquidity venue reported a price impact above the vault's bound.
    #[error("slippage exceeded: price impact {price_impact_bps} bps > max {max_slippage_bps} bps")]
    SlippageExceeded {
        /// Impact reported by the venue.
        price_impact_bps: u32,
        /// The vault's configured maximum.
        max_slippage_bps: u32,
    },

    /// The caller is not allowed to perform this operation.
    #[error("unauthorized: {caller} is not the vault owner")]
    Unauthorized {
        /// The rejected caller identity.
        caller: String,
    },

    /// The vault's expiry time has passed.
    #[error("vault has expired")]
    VaultExpired,

    /// The vault has been deactivated by its owner.
    #[error("vault is not active")]
    VaultNotActive,

    /// `deactivate()` was called on an already deactivated vault.
    #[error("vault is already deactivated")]
    AlreadyDeactivated,

    /// A creation or configuration parameter is out of range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The asset transfer collaborator rejected a transfer.
    #[error("asset transfer failed: {0}")]
    TransferFailed(#[from] TransferError),

    /// The liquidity venue failed to execute the requested move.
    #[error("liquidity venue failed: {0}")]
    VenueFailed(VenueError),

    /// No vault is registered under the given identifier.
    #[error("vault not found: {0}")]
    VaultNotFound(String),

    /// The persistence layer failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<VenueError> for VaultError {
    fn from(e: VenueError) -> Self {
        match e {
            VenueError::PriceImpactTooHigh {
                price_impact_bps,
                max_slippage_bps,
            } => VaultError::SlippageExceeded {
                price_impact_bps,
                max_slippage_bps,
            },
            other => VaultError::VenueFailed(other),
        }
    }
}

impl From<StoreError> for VaultError {
    fn from(e: StoreError) -> Self {
        VaultError::Storage(e.to_string())
    }
}

/// Convenience alias used throughout the engine.
pub type VaultResult<T> = Result<T, VaultError>;
