//! Vault events.
//!
//! Every committed mutation produces one or more [`VaultEvent`]s. The
//! registry publishes them on a `tokio::sync::broadcast` channel after the
//! new state is persisted, so a subscriber never observes an event for a
//! change that was rolled back.

use serde::{Deserialize, Serialize};

use crate::vault::VaultId;

/// A committed change to a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VaultEvent {
    VaultCreated {
        vault_id: VaultId,
        address: String,
        token_address: String,
        asset: String,
        event_id: String,
        owner: String,
        target_liquidity_bps: u32,
    },
    Deposited {
        vault_id: VaultId,
        depositor: String,
        amount: u64,
        shares: u64,
    },
    Withdrawn {
        vault_id: VaultId,
        holder: String,
        shares: u64,
        amount: u64,
    },
    /// Idle funds moved into the venue.
    LiquidityAdded {
        vault_id: VaultId,
        sent: u64,
        provisioned: u64,
        price_impact_bps: u32,
    },
    /// Position value moved back to idle.
    LiquidityRemoved {
        vault_id: VaultId,
        withdrawn: u64,
        returned: u64,
        price_impact_bps: u32,
    },
    /// A rebalance was attempted and refused. Nothing was committed.
    RebalanceRejected {
        vault_id: VaultId,
        reason: String,
        slippage: bool,
    },
    YieldDistributed {
        vault_id: VaultId,
        surplus: u64,
        treasury_fee: u64,
        distributed: u64,
    },
    VaultDeactivated {
        vault_id: VaultId,
        by: String,
    },
}

impl VaultEvent {
    /// The vault the event belongs to.
    pub fn vault_id(&self) -> VaultId {
        match self {
            VaultEvent::VaultCreated { vault_id, .. }
            | VaultEvent::Deposited { vault_id, .. }
            | VaultEvent::Withdrawn { vault_id, .. }
            | VaultEvent::LiquidityAdded { vault_id, .. }
            | VaultEvent::LiquidityRemoved { vault_id, .. }
            | VaultEvent::RebalanceRejected { vault_id, .. }
            | VaultEvent::YieldDistributed { vault_id, .. }
            | VaultEvent::VaultDeactivated { vault_id, .. } => *vault_id,
        }
    }

    /// Short machine-readable name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultEvent::VaultCreated { .. } => "vault_created",
            VaultEvent::Deposited { .. } => "deposited",
            VaultEvent::Withdrawn { .. } => "withdrawn",
            VaultEvent::LiquidityAdded { .. } => "liquidity_added",
            VaultEvent::LiquidityRemoved { .. } => "liquidity_removed",
            VaultEvent::RebalanceRejected { .. } => "rebalance_rejected",
            VaultEvent::YieldDistributed { .. } => "yield_distributed",
            VaultEvent::VaultDeactivated { .. } => "vault_deactivated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_tag_matches_kind() {
        let event = VaultEvent::Deposited {
            vault_id: 3,
            depositor: "alice".into(),
            amount: 1_000,
            shares: 1_000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
        assert_eq!(json["vault_id"], 3);
        assert_eq!(event.vault_id(), 3);
    }
}
