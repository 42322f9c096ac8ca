//! # Simulated Collaborators
//!
//! The node runs vaults against an in-process bank and venue. Neither keeps
//! its own persistent state, so on restart their balances are rebuilt from
//! the books of the vaults loaded from disk.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use marketpulse_engine::clock::Clock;
use marketpulse_engine::{InMemoryBank, SimulatedVenue, VaultContext, VaultRegistry};

/// Shared handles to the simulated bank and venue.
#[derive(Clone)]
pub struct Simulation {
    pub bank: Arc<InMemoryBank>,
    pub venue: Arc<SimulatedVenue>,
}

impl Simulation {
    pub fn new(price_impact_bps: u32) -> Self {
        let bank = Arc::new(InMemoryBank::new());
        let venue = Arc::new(SimulatedVenue::new(Arc::clone(&bank), price_impact_bps));
        Self { bank, venue }
    }

    /// A vault context over these collaborators.
    pub fn context(&self, clock: Arc<dyn Clock>) -> VaultContext {
        VaultContext::new(self.bank.clone(), self.venue.clone(), clock)
    }

    /// Re-funds every vault's custody and venue position from its ledger.
    ///
    /// Returns the number of vaults restored.
    pub fn restore(&self, registry: &VaultRegistry) -> Result<usize> {
        let snapshots = registry.snapshots();
        for snap in &snapshots {
            if snap.idle_amount > 0 {
                self.bank
                    .mint(&snap.underlying_asset, &snap.address, snap.idle_amount)
                    .with_context(|| format!("failed to restore custody of vault {}", snap.id))?;
            }
            if snap.liquidity_amount > 0 {
                self.venue
                    .accrue_fees(&snap.address, &snap.underlying_asset, snap.liquidity_amount)
                    .with_context(|| format!("failed to restore position of vault {}", snap.id))?;
            }
        }
        info!(vaults = snapshots.len(), "simulated balances restored");
        Ok(snapshots.len())
    }
}
