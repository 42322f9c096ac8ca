//! # Yield Distribution
//!
//! Yield is whatever the vault actually controls beyond what its books say
//! it holds:
//!
//! ```text
//! actual    = custodied idle balance + venue position value
//! surplus   = actual - total_assets_held          (0 if negative)
//! fee       = floor(surplus * treasury_fee_bps / 10000)
//! folded in = surplus - fee                       (no shares minted)
//! ```
//!
//! Folding the surplus into `total_assets_held` without touching
//! `claim_supply` raises the redeemable value of every outstanding claim
//! proportionally. This module only plans the distribution; the vault pays
//! the fee and applies the plan.
//!
//! The surplus is credited to the side of the books where it was observed
//! (venue gains to liquidity, the rest to idle). The treasury fee is paid
//! out of custodied idle funds, so it is debited from the idle side. That
//! keeps both sides of the ledger equal to what the collaborators report.

use serde::{Deserialize, Serialize};

use crate::config::apply_bps;
use crate::error::{VaultError, VaultResult};
use crate::ledger::AssetLedger;

/// Outcome of one yield-distribution pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct YieldDistribution {
    /// `total_assets_held` before distribution.
    pub accounted: u64,
    /// Idle balance plus position value observed at the collaborators.
    pub actual: u64,
    /// `actual - accounted`, floored at zero.
    pub surplus: u64,
    /// Portion of the surplus paid to the treasury.
    pub treasury_fee: u64,
    /// Portion of the surplus folded into the vault.
    pub distributed: u64,
    /// Part of the surplus observed in custody (credited to idle).
    pub to_idle: u64,
    /// Part of the surplus observed at the venue (credited to liquidity).
    pub to_liquidity: u64,
}

impl YieldDistribution {
    /// `true` when there was nothing to distribute.
    pub fn is_empty(&self) -> bool {
        self.surplus == 0
    }
}

/// Plans a distribution from the collaborators' view of the vault.
///
/// `to_idle + to_liquidity == surplus` and
/// `treasury_fee + distributed == surplus`.
pub fn plan_distribution(
    ledger: &AssetLedger,
    idle_balance: u64,
    position_value: u64,
    treasury_fee_bps: u32,
) -> VaultResult<YieldDistribution> {
    let accounted = ledger.total_assets_held();
    let actual = idle_balance
        .checked_add(position_value)
        .ok_or(VaultError::ArithmeticOverflow)?;
    let surplus = actual.saturating_sub(accounted);
    if surplus == 0 {
        return Ok(YieldDistribution {
            accounted,
            actual,
            ..YieldDistribution::default()
        });
    }

    let treasury_fee = apply_bps(surplus, treasury_fee_bps);
    let distributed = surplus - treasury_fee;
    let venue_gain = position_value.saturating_sub(ledger.liquidity_amount());
    let to_liquidity = venue_gain.min(surplus);

    Ok(YieldDistribution {
        accounted,
        actual,
        surplus,
        treasury_fee,
        distributed,
        to_idle: surplus - to_liquidity,
        to_liquidity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger(total: u64, liquidity: u64) -> AssetLedger {
        let mut l = AssetLedger::new();
        l.credit_assets(total).unwrap();
        l.mint_claims("alice", total).unwrap();
        if liquidity > 0 {
            l.move_to_liquidity(liquidity, liquidity).unwrap();
        }
        l
    }

    #[test]
    fn no_surplus_is_noop() {
        let plan = plan_distribution(&ledger(1_000, 800), 200, 800, 50).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.distributed, 0);
        assert_eq!(plan.treasury_fee, 0);
    }

    #[test]
    fn loss_is_not_distributed() {
        let plan = plan_distribution(&ledger(1_000, 800), 200, 700, 50).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.actual, 900);
    }

    #[test]
    fn fee_is_floored_share_of_surplus() {
        // 1000 surplus at 50 bps: fee 5, 995 distributed.
        let plan = plan_distribution(&ledger(10_000, 8_000), 2_000, 9_000, 50).unwrap();
        assert_eq!(plan.surplus, 1_000);
        assert_eq!(plan.treasury_fee, 5);
        assert_eq!(plan.distributed, 995);
        assert_eq!(plan.to_liquidity, 1_000);
        assert_eq!(plan.to_idle, 0);
    }

    #[test]
    fn idle_gain_goes_to_idle() {
        let plan = plan_distribution(&ledger(1_000, 0), 1_100, 0, 0).unwrap();
        assert_eq!(plan.distributed, 100);
        assert_eq!(plan.to_idle, 100);
        assert_eq!(plan.to_liquidity, 0);
    }

    #[test]
    fn mixed_gain_splits() {
        let plan = plan_distribution(&ledger(1_000, 800), 230, 870, 0).unwrap();
        assert_eq!(plan.surplus, 100);
        assert_eq!(plan.to_liquidity, 70);
        assert_eq!(plan.to_idle, 30);
    }

    #[test]
    fn full_fee_distributes_nothing() {
        let plan = plan_distribution(&ledger(1_000, 0), 1_100, 0, 10_000).unwrap();
        assert_eq!(plan.treasury_fee, 100);
        assert_eq!(plan.distributed, 0);
        assert_eq!(plan.to_idle, 100);
        assert!(!plan.is_empty());
    }
}
