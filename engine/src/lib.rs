// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # MarketPulse Vault Engine
//!
//! Share-based custodial vaults for market-event liquidity. A vault accepts
//! deposits of one underlying asset, mints proportional claim units, keeps a
//! target share of its assets deployed at a liquidity venue, folds venue
//! yield back into the claim value, and closes to deposits when it expires
//! or its owner deactivates it.
//!
//! ## Architecture
//!
//! Leaves first:
//!
//! - **ledger**: asset totals (idle / liquidity) and the claim balance sheet.
//! - **shares**: mint and redeem math. Floors both ways.
//! - **rebalance**: drift detection, move sizing, slippage bound.
//! - **distributor**: surplus detection and treasury fee.
//! - **lifecycle**: Active / Expired / Deactivated gating.
//! - **vault**: one vault composing the above over its collaborators.
//! - **registry**: the factory: identity, locking, persistence, events.
//! - **collaborators**: asset-transfer and venue traits, plus in-memory
//!   implementations.
//! - **storage**: sled persistence.
//! - **events**, **clock**, **config**, **error**: plumbing.
//!
//! ## Guarantees
//!
//! 1. Holder balances always sum to the claim supply.
//! 2. Deposits only land in an active, unexpired vault.
//! 3. Rounding never moves value from existing holders to a new depositor.
//! 4. A failed operation leaves the books as they were.

pub mod clock;
pub mod collaborators;
pub mod config;
pub mod distributor;
pub mod error;
pub mod events;
pub mod ledger;
pub mod lifecycle;
pub mod rebalance;
pub mod registry;
pub mod shares;
pub mod storage;
pub mod vault;

pub use collaborators::{AssetTransfer, InMemoryBank, LiquidityVenue, SimulatedVenue, VenueFill};
pub use config::RegistryConfig;
pub use error::{VaultError, VaultResult};
pub use events::VaultEvent;
pub use registry::{VaultHandle, VaultRegistry};
pub use vault::{VaultContext, VaultId, VaultParams, VaultSnapshot};
