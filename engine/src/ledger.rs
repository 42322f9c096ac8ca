//! # Asset Ledger
//!
//! Pure bookkeeping for a single vault: how many underlying units it custodies
//! (split into idle and liquidity-provisioned capital) and how many claim
//! units each holder owns.
//!
//! The ledger enforces two things on every mutation:
//!
//! 1. **Share conservation**: the sum of holder balances always equals
//!    `claim_supply`. Mint and burn update both sides or neither.
//! 2. **No wraparound**: every addition and subtraction is checked. An
//!    overflow is an [`VaultError::ArithmeticOverflow`], never a silent wrap.
//!
//! Every method validates first and mutates last, so an `Err` return always
//! leaves the ledger untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

/// Identity of a depositor, owner, or treasury account.
pub type AccountId = String;

/// The vault's books: asset totals plus the claim-token balance sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetLedger {
    /// Idle + liquidity-provisioned underlying units.
    total_assets_held: u64,

    /// The part of `total_assets_held` currently deployed at the venue.
    liquidity_amount: u64,

    /// Outstanding claim units.
    claim_supply: u64,

    /// Claim units per holder. Zero balances are pruned.
    holder_balances: BTreeMap<AccountId, u64>,
}

impl AssetLedger {
    /// Creates an empty ledger: zero assets, zero supply, no holders.
    pub fn new() -> Self {
        Self::default()
    }

    // -- Queries ------------------------------------------------------------

    /// Total underlying units custodied (idle + liquidity).
    pub fn total_assets_held(&self) -> u64 {
        self.total_assets_held
    }

    /// Underlying units deployed at the liquidity venue.
    pub fn liquidity_amount(&self) -> u64 {
        self.liquidity_amount
    }

    /// Underlying units held directly by the vault.
    pub fn idle_amount(&self) -> u64 {
        // liquidity_amount <= total_assets_held is maintained by every mutator.
        self.total_assets_held - self.liquidity_amount
    }

    /// Outstanding claim units.
    pub fn claim_supply(&self) -> u64 {
        self.claim_supply
    }

    /// Claim units held by `holder` (0 if unknown).
    pub fn balance_of(&self, holder: &str) -> u64 {
        self.holder_balances.get(holder).copied().unwrap_or(0)
    }

    /// Number of holders with a non-zero balance.
    pub fn holder_count(&self) -> usize {
        self.holder_balances.len()
    }

    /// Iterates `(holder, balance)` pairs in holder order.
    pub fn holders(&self) -> impl Iterator<Item = (&AccountId, u64)> {
        self.holder_balances.iter().map(|(h, b)| (h, *b))
    }

    /// Returns `true` if holder balances sum to the supply and the
    /// liquidity split fits inside the total.
    pub fn is_consistent(&self) -> bool {
        let sum = self
            .holder_balances
            .values()
            .try_fold(0u64, |acc, b| acc.checked_add(*b));
        sum == Some(self.claim_supply) && self.liquidity_amount <= self.total_assets_held
    }

    // -- Asset side ---------------------------------------------------------

    /// Adds `amount` idle units. Returns the new total.
    pub fn credit_assets(&mut self, amount: u64) -> VaultResult<u64> {
        let total = self
            .total_assets_held
            .checked_add(amount)
            .ok_or(VaultError::ArithmeticOverflow)?;
        self.total_assets_held = total;
        Ok(total)
    }

    /// Removes `amount` idle units. Returns the new total.
    ///
    /// # Errors
    ///
    /// [`VaultError::InsufficientAssets`] if idle capital cannot cover the debit.
    pub fn debit_assets(&mut self, amount: u64) -> VaultResult<u64> {
        let idle = self.idle_amount();
        if amount > idle {
            return Err(VaultError::InsufficientAssets {
                available: idle,
                requested: amount,
            });
        }
        self.total_assets_held -= amount;
        Ok(self.total_assets_held)
    }

    /// Records `sent` idle units leaving for the venue and `received` units
    /// of position value arriving there. Any difference is a venue fee or
    /// gain and adjusts the total.
    pub fn move_to_liquidity(&mut self, sent: u64, received: u64) -> VaultResult<()> {
        let idle = self.idle_amount();
        if sent > idle {
            return Err(VaultError::InsufficientAssets {
                available: idle,
                requested: sent,
            });
        }
        let total = (self.total_assets_held - sent)
            .checked_add(received)
            .ok_or(VaultError::ArithmeticOverflow)?;
        let liquidity = self
            .liquidity_amount
            .checked_add(received)
            .ok_or(VaultError::ArithmeticOverflow)?;

        self.total_assets_held = total;
        self.liquidity_amount = liquidity;
        Ok(())
    }

    /// Records `sent` units of position value leaving the venue and
    /// `received` idle units coming back.
    pub fn move_to_idle(&mut self, sent: u64, received: u64) -> VaultResult<()> {
        if sent > self.liquidity_amount {
            return Err(VaultError::InsufficientAssets {
                available: self.liquidity_amount,
                requested: sent,
            });
        }
        let total = (self.total_assets_held - sent)
            .checked_add(received)
            .ok_or(VaultError::ArithmeticOverflow)?;

        self.total_assets_held = total;
        self.liquidity_amount -= sent;
        Ok(())
    }

    /// Adds surplus to the books without touching the claim side. This is
    /// how yield raises the value of every existing share.
    pub fn fold_surplus(&mut self, to_idle: u64, to_liquidity: u64) -> VaultResult<u64> {
        let total = self
            .total_assets_held
            .checked_add(to_idle)
            .and_then(|t| t.checked_add(to_liquidity))
            .ok_or(VaultError::ArithmeticOverflow)?;
        let liquidity = self
            .liquidity_amount
            .checked_add(to_liquidity)
            .ok_or(VaultError::ArithmeticOverflow)?;

        self.total_assets_held = total;
        self.liquidity_amount = liquidity;
        Ok(total)
    }

    // -- Claim side ---------------------------------------------------------

    /// Mints `amount` claim units to `holder`. Returns the holder's new balance.
    pub fn mint_claims(&mut self, holder: &str, amount: u64) -> VaultResult<u64> {
        let supply = self
            .claim_supply
            .checked_add(amount)
            .ok_or(VaultError::ArithmeticOverflow)?;
        let balance = self
            .balance_of(holder)
            .checked_add(amount)
            .ok_or(VaultError::ArithmeticOverflow)?;

        self.claim_supply = supply;
        if balance > 0 {
            self.holder_balances.insert(holder.to_string(), balance);
        }
        Ok(balance)
    }

    /// Burns `amount` claim units from `holder`. Returns the holder's new balance.
    ///
    /// # Errors
    ///
    /// [`VaultError::InsufficientClaims`] if `amount` exceeds the holder's balance.
    pub fn burn_claims(&mut self, holder: &str, amount: u64) -> VaultResult<u64> {
        let balance = self.balance_of(holder);
        if amount > balance {
            return Err(VaultError::InsufficientClaims {
                holder: holder.to_string(),
                balance,
                requested: amount,
            });
        }

        let remaining = balance - amount;
        // balance <= claim_supply, so this cannot underflow.
        self.claim_supply -= amount;
        if remaining == 0 {
            self.holder_balances.remove(holder);
        } else {
            self.holder_balances.insert(holder.to_string(), remaining);
        }
        Ok(remaining)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
