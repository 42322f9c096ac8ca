//! # Rebalance Policy
//!
//! Decides when a vault's idle/liquidity split has drifted far enough from
//! its target to be worth correcting, and how large the correction is.
//!
//! ```text
//! current_bps = liquidity_amount * 10000 / total_assets_held
//! rebalance   ⇔ |current_bps - target_bps| >= min_rebalance_threshold_bps
//! target_liq  = floor(total_assets_held * target_bps / 10000)
//! action      = target_liq - liquidity_amount   (signed)
//! ```
//!
//! The policy never touches the venue itself. [`crate::vault::Vault`] executes
//! the action, then asks [`RebalancePolicy::check_fill`] whether the reported
//! price impact is acceptable before committing anything to the ledger.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collaborators::VenueFill;
use crate::config::{apply_bps, validate_bps, BPS_DENOMINATOR};
use crate::error::{VaultError, VaultResult};
use crate::ledger::AssetLedger;

// ---------------------------------------------------------------------------
// RebalanceAction
// ---------------------------------------------------------------------------

/// A corrective liquidity move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceAction {
    /// Move this many idle units into the venue.
    Provide(u64),
    /// Pull this many units of position value back to idle.
    Withdraw(u64),
    /// Already on target.
    Hold,
}

impl RebalanceAction {
    /// Signed view of the move: positive is idle→liquidity, negative is
    /// liquidity→idle, zero is no move.
    pub fn signed_amount(&self) -> i128 {
        match self {
            RebalanceAction::Provide(a) => *a as i128,
            RebalanceAction::Withdraw(a) => -(*a as i128),
            RebalanceAction::Hold => 0,
        }
    }

    /// Builds an action from a signed amount.
    pub fn from_signed(amount: i128) -> Self {
        match amount {
            0 => RebalanceAction::Hold,
            a if a > 0 => RebalanceAction::Provide(a.min(u64::MAX as i128) as u64),
            a => RebalanceAction::Withdraw(a.unsigned_abs().min(u64::MAX as u128) as u64),
        }
    }

    /// Returns `true` for [`RebalanceAction::Hold`].
    pub fn is_hold(&self) -> bool {
        matches!(self, RebalanceAction::Hold)
    }
}

impl fmt::Display for RebalanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalanceAction::Provide(a) => write!(f, "provide {}", a),
            RebalanceAction::Withdraw(a) => write!(f, "withdraw {}", a),
            RebalanceAction::Hold => write!(f, "hold"),
        }
    }
}

// ---------------------------------------------------------------------------
// RebalancePolicy
// ---------------------------------------------------------------------------

/// Target allocation and tolerances for one vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalancePolicy {
    /// Share of `total_assets_held` that should sit at the venue (bps).
    pub target_liquidity_bps: u32,
    /// Deviation from target that triggers a rebalance (bps).
    pub min_rebalance_threshold_bps: u32,
    /// Maximum acceptable price impact for a venue move (bps).
    pub max_slippage_bps: u32,
}

impl RebalancePolicy {
    /// Creates a policy, validating every bps parameter.
    pub fn new(
        target_liquidity_bps: u32,
        min_rebalance_threshold_bps: u32,
        max_slippage_bps: u32,
    ) -> VaultResult<Self> {
        validate_bps("target_liquidity_percent", target_liquidity_bps)?;
        validate_bps("min_rebalance_threshold_bps", min_rebalance_threshold_bps)?;
        validate_bps("max_slippage_bps", max_slippage_bps)?;
        Ok(Self {
            target_liquidity_bps,
            min_rebalance_threshold_bps,
            max_slippage_bps,
        })
    }

    /// Current liquidity share in bps, or `None` for an empty vault.
    pub fn current_liquidity_bps(&self, ledger: &AssetLedger) -> Option<u32> {
        let total = ledger.total_assets_held();
        if total == 0 {
            return None;
        }
        let bps = ledger.liquidity_amount() as u128 * BPS_DENOMINATOR as u128 / total as u128;
        Some(bps as u32)
    }

    /// Absolute distance from target in bps (0 for an empty vault).
    pub fn deviation_bps(&self, ledger: &AssetLedger) -> u32 {
        self.current_liquidity_bps(ledger)
            .map(|current| current.abs_diff(self.target_liquidity_bps))
            .unwrap_or(0)
    }

    /// Whether the split has drifted at least the threshold from target.
    /// Always `false` when the vault holds nothing.
    pub fn needs_rebalance(&self, ledger: &AssetLedger) -> bool {
        match self.current_liquidity_bps(ledger) {
            None => false,
            Some(current) => {
                current.abs_diff(self.target_liquidity_bps) >= self.min_rebalance_threshold_bps
            }
        }
    }

    /// The liquidity amount the target ratio calls for.
    pub fn target_liquidity_amount(&self, ledger: &AssetLedger) -> u64 {
        apply_bps(ledger.total_assets_held(), self.target_liquidity_bps)
    }

    /// The move that brings liquidity exactly to target.
    pub fn compute_rebalance_action(&self, ledger: &AssetLedger) -> RebalanceAction {
        let target = self.target_liquidity_amount(ledger) as i128;
        RebalanceAction::from_signed(target - ledger.liquidity_amount() as i128)
    }

    /// Rejects a venue fill whose price impact exceeds the bound.
    pub fn check_fill(&self, fill: &VenueFill) -> VaultResult<()> {
        if fill.price_impact_bps > self.max_slippage_bps {
            return Err(VaultError::SlippageExceeded {
                price_impact_bps: fill.price_impact_bps,
                max_slippage_bps: self.max_slippage_bps,
            });
        }
        Ok(())
    }

    /// Smallest venue withdrawal whose worst-case fill still covers `needed`
    /// idle units, capped at what is deployed.
    pub fn gross_up_for_slippage(&self, needed: u64, available: u64) -> u64 {
        let keep_bps = BPS_DENOMINATOR - self.max_slippage_bps;
        if keep_bps == 0 {
            return available;
        }
        let gross = (needed as u128 * BPS_DENOMINATOR as u128).div_ceil(keep_bps as u128);
        gross.min(available as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(total: u64, liquidity: u64) -> AssetLedger {
        let mut ledger = AssetLedger::new();
        ledger.credit_assets(total).unwrap();
        if liquidity > 0 {
            ledger.move_to_liquidity(liquidity, liquidity).unwrap();
        }
        ledger
    }

    fn policy() -> RebalancePolicy {
        RebalancePolicy::new(8_000, 500, 100).unwrap()
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(RebalancePolicy::new(10_001, 500, 100).is_err());
        assert!(RebalancePolicy::new(8_000, 500, 10_001).is_err());
        assert!(RebalancePolicy::new(10_000, 0, 10_000).is_ok());
    }

    #[test]
    fn empty_vault_never_needs_rebalance() {
        assert!(!policy().needs_rebalance(&AssetLedger::new()));
        assert_eq!(policy().deviation_bps(&AssetLedger::new()), 0);
    }

    #[test]
    fn all_idle_vault_needs_rebalance() {
        let ledger = ledger_with(10_000, 0);
        assert!(policy().needs_rebalance(&ledger));
        assert_eq!(
            policy().compute_rebalance_action(&ledger),
            RebalanceAction::Provide(8_000)
        );
    }

    #[test]
    fn within_threshold_holds() {
        // 77% deployed vs 80% target: 300 bps < 500 bps.
        let ledger = ledger_with(10_000, 7_700);
        assert!(!policy().needs_rebalance(&ledger));
    }

    #[test]
    fn threshold_is_inclusive() {
        let ledger = ledger_with(10_000, 7_500);
        assert!(policy().needs_rebalance(&ledger));
    }

    #[test]
    fn over_deployed_vault_withdraws() {
        let ledger = ledger_with(10_000, 9_500);
        assert!(policy().needs_rebalance(&ledger));
        let action = policy().compute_rebalance_action(&ledger);
        assert_eq!(action, RebalanceAction::Withdraw(1_500));
        assert_eq!(action.signed_amount(), -1_500);
    }

    #[test]
    fn on_target_is_hold() {
        let ledger = ledger_with(3_000, 2_400);
        assert!(policy().compute_rebalance_action(&ledger).is_hold());
    }

    #[test]
    fn signed_roundtrip() {
        for amount in [-5i128, 0, 7] {
            assert_eq!(RebalanceAction::from_signed(amount).signed_amount(), amount);
        }
    }

    #[test]
    fn fill_within_bound_accepted() {
        let fill = VenueFill {
            amount: 100,
            price_impact_bps: 100,
        };
        assert!(policy().check_fill(&fill).is_ok());
    }

    #[test]
    fn fill_beyond_bound_rejected() {
        let fill = VenueFill {
            amount: 100,
            price_impact_bps: 101,
        };
        assert_eq!(
            policy().check_fill(&fill).unwrap_err(),
            VaultError::SlippageExceeded {
                price_impact_bps: 101,
                max_slippage_bps: 100
            }
        );
    }

    #[test]
    fn gross_up_covers_worst_case_fill() {
        let p = policy();
        let gross = p.gross_up_for_slippage(990, 10_000);
        assert_eq!(gross, 1_000);
        assert!(gross - apply_bps(gross, p.max_slippage_bps) >= 990);
        assert_eq!(p.gross_up_for_slippage(990, 500), 500);
    }
}
