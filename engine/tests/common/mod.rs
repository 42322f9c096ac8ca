//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;

use marketpulse_engine::clock::ManualClock;
use marketpulse_engine::{
    InMemoryBank, LiquidityVenue, RegistryConfig, SimulatedVenue, VaultContext, VaultRegistry,
};

pub const ASSET: &str = "USDC";
pub const OWNER: &str = "operator";

/// A registry wired to in-memory collaborators, with handles to each so
/// tests can fund accounts, move the clock, and tune the venue.
pub struct Env {
    pub registry: VaultRegistry,
    pub bank: Arc<InMemoryBank>,
    pub venue: Arc<SimulatedVenue>,
    pub clock: Arc<ManualClock>,
}

impl Env {
    pub fn new(config: RegistryConfig) -> Self {
        let bank = Arc::new(InMemoryBank::new());
        let venue = Arc::new(SimulatedVenue::new(Arc::clone(&bank), 0));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = VaultRegistry::new(config, Self::context(&bank, &venue, &clock))
            .expect("valid registry config");
        Self {
            registry,
            bank,
            venue,
            clock,
        }
    }

    /// Auto-rebalance off, so each test controls when liquidity moves.
    pub fn manual() -> Self {
        Self::new(RegistryConfig {
            auto_rebalance: false,
            ..RegistryConfig::default()
        })
    }

    pub fn context(
        bank: &Arc<InMemoryBank>,
        venue: &Arc<SimulatedVenue>,
        clock: &Arc<ManualClock>,
    ) -> VaultContext {
        VaultContext::new(bank.clone(), venue.clone(), clock.clone())
    }

    pub fn fund(&self, account: &str, amount: u64) {
        self.bank.mint(ASSET, account, amount).expect("mint");
    }

    pub fn venue_position(&self, vault: &str) -> u64 {
        self.venue.position_value(vault, ASSET)
    }
}
