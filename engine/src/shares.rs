//! # Share Mint/Burn Policy
//!
//! Converts between underlying units and claim units at the vault's current
//! exchange rate. Both directions round down:
//!
//! ```text
//! shares = floor(deposit * claim_supply / total_assets_held)
//! assets = floor(burn    * total_assets_held / claim_supply)
//! ```
//!
//! Flooring on mint means a depositor never receives more claim than they
//! paid for; flooring on redeem means a holder never leaves with more than
//! their proportional share. Any rounding dust stays in the vault and
//! accrues to the remaining holders.
//!
//! Intermediate products are computed in `u128` so that two `u64` operands
//! cannot overflow before the division.

use crate::error::{VaultError, VaultResult};

/// Shares to mint for `deposit_amount` given the current ledger state.
///
/// A vault with no supply mints 1:1, which establishes the initial
/// exchange rate.
///
/// # Errors
///
/// - [`VaultError::ZeroSharesMinted`] if the result rounds to zero, or if
///   claims are outstanding with no assets behind them. There is no rate at
///   which such a vault can take a deposit without handing it to the
///   existing holders.
/// - [`VaultError::ArithmeticOverflow`] if the result does not fit in `u64`.
pub fn shares_for_deposit(
    deposit_amount: u64,
    total_assets_held: u64,
    claim_supply: u64,
) -> VaultResult<u64> {
    let shares = if claim_supply == 0 {
        deposit_amount
    } else if total_assets_held == 0 {
        0
    } else {
        let scaled = (deposit_amount as u128) * (claim_supply as u128);
        u64::try_from(scaled / total_assets_held as u128)
            .map_err(|_| VaultError::ArithmeticOverflow)?
    };

    if shares == 0 {
        return Err(VaultError::ZeroSharesMinted {
            deposit: deposit_amount,
        });
    }
    Ok(shares)
}

/// Underlying units released for burning `burn_amount` claim units.
///
/// # Errors
///
/// [`VaultError::InvalidBurnAmount`] if the burn is zero, exceeds
/// `holder_balance`, the vault has no supply, or the burn is too small to
/// redeem a single unit.
pub fn assets_for_withdrawal(
    burn_amount: u64,
    holder_balance: u64,
    total_assets_held: u64,
    claim_supply: u64,
) -> VaultResult<u64> {
    let reject = |reason: &str| VaultError::InvalidBurnAmount {
        amount: burn_amount,
        reason: reason.to_string(),
    };

    if claim_supply == 0 {
        return Err(reject("vault has no outstanding claims"));
    }
    if burn_amount == 0 {
        return Err(reject("burn amount must be positive"));
    }
    if burn_amount > holder_balance {
        return Err(reject("burn amount exceeds holder balance"));
    }

    let assets = preview_redeem(burn_amount, total_assets_held, claim_supply);
    if assets == 0 {
        return Err(reject("burn amount redeems zero assets"));
    }
    Ok(assets)
}

/// Current redeemable value of `claims` units, without any validation.
/// Returns 0 for an empty vault.
pub fn preview_redeem(claims: u64, total_assets_held: u64, claim_supply: u64) -> u64 {
    if claim_supply == 0 {
        return 0;
    }
    // claims <= claim_supply keeps the quotient <= total_assets_held; for
    // larger inputs saturate rather than wrap.
    let scaled = (claims as u128) * (total_assets_held as u128) / claim_supply as u128;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}
