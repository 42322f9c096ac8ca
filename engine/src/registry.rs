//! # Vault Registry (Factory)
//!
//! Creates vaults, hands out their identity, and is the only path through
//! which vault operations run.
//!
//! ## Concurrency
//!
//! Vaults live in a `DashMap<VaultId, Arc<Mutex<Vault>>>`. An operation
//! clones the `Arc` out of the map, releases the shard lock, then takes the
//! vault's own mutex for the whole call. Operations on one vault are
//! therefore serialized while different vaults proceed in parallel.
//! Creation is serialized by a separate lock so that indices are dense and
//! monotonic.
//!
//! ## Commit Order
//!
//! For every operation that committed something: persist the new state,
//! release the vault lock, then publish the events. Subscribers never see an
//! event for state that was rolled back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::{RegistryConfig, EVENT_CHANNEL_CAPACITY};
use crate::distributor::YieldDistribution;
use crate::error::{VaultError, VaultResult};
use crate::events::VaultEvent;
use crate::storage::VaultStore;
use crate::vault::{
    DepositReceipt, RebalanceReceipt, Vault, VaultContext, VaultId, VaultParams, VaultSnapshot,
    WithdrawReceipt,
};

/// Identity of a newly created vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHandle {
    pub id: VaultId,
    pub address: String,
    pub token_address: String,
}

/// The set of all vaults, their identities, and shared settings.
pub struct VaultRegistry {
    vaults: DashMap<VaultId, Arc<Mutex<Vault>>>,
    addresses: DashMap<String, VaultId>,
    count: AtomicU64,
    create_lock: Mutex<()>,
    config: RegistryConfig,
    ctx: VaultContext,
    store: Option<VaultStore>,
    events: broadcast::Sender<VaultEvent>,
}

impl std::fmt::Debug for VaultRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultRegistry")
            .field("vault_count", &self.vault_count())
            .field("config", &self.config)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl VaultRegistry {
    /// An in-memory registry.
    pub fn new(config: RegistryConfig, ctx: VaultContext) -> VaultResult<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            vaults: DashMap::new(),
            addresses: DashMap::new(),
            count: AtomicU64::new(0),
            create_lock: Mutex::new(()),
            config,
            ctx,
            store: None,
            events,
        })
    }

    /// A registry backed by `store`. Every vault already in the store is
    /// loaded and rebound to `ctx`.
    pub fn open(config: RegistryConfig, ctx: VaultContext, store: VaultStore) -> VaultResult<Self> {
        let mut registry = Self::new(config, ctx)?;

        let states = store.load_all()?;
        let restored = states.len();
        for state in states {
            let id = state.id;
            registry.addresses.insert(state.address.clone(), id);
            let vault = Vault::from_state(state, registry.ctx.clone());
            registry.vaults.insert(id, Arc::new(Mutex::new(vault)));
        }
        registry.count.store(store.vault_count()?, Ordering::SeqCst);
        registry.store = Some(store);

        info!(restored, "vault registry opened");
        Ok(registry)
    }

    /// Receives every event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<VaultEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    // -- Factory ------------------------------------------------------------

    /// Creates a vault owned by `caller`.
    pub fn create_vault(&self, caller: &str, params: VaultParams) -> VaultResult<VaultHandle> {
        let guard = self.create_lock.lock();
        let id = self.count.load(Ordering::SeqCst) + 1;

        let mut vault = Vault::create(id, caller, params, &self.config, self.ctx.clone())?;
        if self.addresses.contains_key(vault.address()) {
            return Err(VaultError::InvalidParameter(format!(
                "vault address {} already registered",
                vault.address()
            )));
        }
        if let Some(store) = &self.store {
            store.put_vault(vault.state())?;
        }

        let handle = VaultHandle {
            id,
            address: vault.address().to_string(),
            token_address: vault.token_address().to_string(),
        };
        let events = vault.take_events();
        self.addresses.insert(handle.address.clone(), id);
        self.vaults.insert(id, Arc::new(Mutex::new(vault)));
        self.count.store(id, Ordering::SeqCst);
        drop(guard);

        self.publish(events);
        Ok(handle)
    }

    // -- Queries --------------------------------------------------------------

    /// Whether `address` belongs to a vault created by this registry.
    pub fn is_vault(&self, address: &str) -> bool {
        self.addresses.contains_key(address)
    }

    pub fn vault_count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves a vault address to its index.
    pub fn resolve(&self, address: &str) -> Option<VaultId> {
        self.addresses.get(address).map(|e| *e.value())
    }

    /// The vault created `index`-th (1-based).
    pub fn vault_by_index(&self, index: u64) -> VaultResult<VaultHandle> {
        self.read(index, |v| VaultHandle {
            id: v.id(),
            address: v.address().to_string(),
            token_address: v.token_address().to_string(),
        })
    }

    /// All vault indices, ascending.
    pub fn vault_ids(&self) -> Vec<VaultId> {
        let mut ids: Vec<VaultId> = self.vaults.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self, id: VaultId) -> VaultResult<VaultSnapshot> {
        self.read(id, Vault::snapshot)
    }

    /// Snapshots of every vault, ascending by index.
    pub fn snapshots(&self) -> Vec<VaultSnapshot> {
        self.vault_ids()
            .into_iter()
            .filter_map(|id| self.snapshot(id).ok())
            .collect()
    }

    pub fn balance_of(&self, id: VaultId, holder: &str) -> VaultResult<u64> {
        self.read(id, |v| v.balance_of(holder))
    }

    pub fn preview_redeem(&self, id: VaultId, holder: &str) -> VaultResult<u64> {
        self.read(id, |v| v.preview_redeem(holder))
    }

    pub fn is_active(&self, id: VaultId) -> VaultResult<bool> {
        self.read(id, Vault::is_active)
    }

    pub fn target_liquidity_percent(&self, id: VaultId) -> VaultResult<u32> {
        self.read(id, Vault::target_liquidity_bps)
    }

    pub fn token_address(&self, id: VaultId) -> VaultResult<String> {
        self.read(id, |v| v.token_address().to_string())
    }

    pub fn needs_rebalance(&self, id: VaultId) -> VaultResult<bool> {
        self.read(id, Vault::needs_rebalance)
    }

    /// Sum of `total_assets_held` across all vaults.
    pub fn total_value_locked(&self) -> u64 {
        self.vaults
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect::<Vec<_>>()
            .into_iter()
            .fold(0u64, |acc, v| {
                acc.saturating_add(v.lock().ledger().total_assets_held())
            })
    }

    // -- Operations -----------------------------------------------------------

    pub fn deposit(&self, id: VaultId, depositor: &str, amount: u64) -> VaultResult<DepositReceipt> {
        self.mutate(id, |v| v.deposit(depositor, amount))
    }

    pub fn withdraw(&self, id: VaultId, holder: &str, shares: u64) -> VaultResult<WithdrawReceipt> {
        self.mutate(id, |v| v.withdraw(holder, shares))
    }

    pub fn rebalance(&self, id: VaultId, caller: &str) -> VaultResult<RebalanceReceipt> {
        self.mutate(id, |v| v.rebalance(caller))
    }

    pub fn distribute_yield(&self, id: VaultId, caller: &str) -> VaultResult<YieldDistribution> {
        self.mutate(id, |v| v.distribute_yield(caller))
    }

    pub fn deactivate(&self, id: VaultId, caller: &str) -> VaultResult<()> {
        self.mutate(id, |v| v.deactivate(caller))
    }

    // -- Internals ------------------------------------------------------------

    fn entry(&self, id: VaultId) -> VaultResult<Arc<Mutex<Vault>>> {
        self.vaults
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| VaultError::VaultNotFound(id.to_string()))
    }

    fn read<T>(&self, id: VaultId, f: impl FnOnce(&Vault) -> T) -> VaultResult<T> {
        let entry = self.entry(id)?;
        let vault = entry.lock();
        Ok(f(&vault))
    }

    /// Runs `op` under the vault lock, then persists and publishes whatever
    /// it committed. A failed operation may still have committed a step (a
    /// liquidity unwind, or the booking of a venue fill that settled beyond
    /// the bound), so failures are always persisted.
    fn mutate<T>(
        &self,
        id: VaultId,
        op: impl FnOnce(&mut Vault) -> VaultResult<T>,
    ) -> VaultResult<T> {
        let entry = self.entry(id)?;
        let mut vault = entry.lock();
        let result = op(&mut vault);

        let events = vault.take_events();
        if !events.is_empty() || result.is_err() {
            if let Some(store) = &self.store {
                // The collaborators have already settled, so the in-memory
                // state stays authoritative.
                if let Err(e) = store.put_vault(vault.state()) {
                    error!(vault = id, error = %e, "failed to persist vault state");
                }
            }
        }
        drop(vault);

        self.publish(events);
        result
    }

    fn publish(&self, events: Vec<VaultEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::{InMemoryBank, SimulatedVenue};

    fn registry() -> (VaultRegistry, Arc<InMemoryBank>) {
        let bank = Arc::new(InMemoryBank::new());
        let venue = Arc::new(SimulatedVenue::new(Arc::clone(&bank), 0));
        let ctx = VaultContext::new(bank.clone(), venue, Arc::new(ManualClock::default()));
        let config = RegistryConfig {
            auto_rebalance: false,
            ..RegistryConfig::default()
        };
        (VaultRegistry::new(config, ctx).unwrap(), bank)
    }

    fn params() -> VaultParams {
        VaultParams::new("USDC", "evt-42", "Event 42 Claim", "E42")
    }

    #[test]
    fn indices_are_dense_and_one_based() {
        let (reg, _) = registry();
        let a = reg.create_vault("owner", params()).unwrap();
        let b = reg.create_vault("owner", params()).unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(reg.vault_count(), 2);
        assert_eq!(reg.vault_by_index(2).unwrap(), b);
        assert!(reg.is_vault(&a.address));
        assert!(!reg.is_vault("0xdeadbeef"));
        assert_eq!(reg.vault_ids(), vec![1, 2]);
    }

    #[test]
    fn failed_creation_does_not_consume_an_index() {
        let (reg, _) = registry();
        assert!(reg
            .create_vault("owner", params().with_target_liquidity_bps(20_000))
            .is_err());
        assert_eq!(reg.vault_count(), 0);
        assert_eq!(reg.create_vault("owner", params()).unwrap().id, 1);
    }

    #[test]
    fn unknown_vault_is_not_found() {
        let (reg, _) = registry();
        assert!(matches!(
            reg.deposit(9, "alice", 1),
            Err(VaultError::VaultNotFound(_))
        ));
        assert!(matches!(reg.vault_by_index(0), Err(VaultError::VaultNotFound(_))));
    }

    #[test]
    fn events_published_after_commit_only() {
        let (reg, bank) = registry();
        let mut rx = reg.subscribe();
        let handle = reg.create_vault("owner", params()).unwrap();
        bank.mint("USDC", "alice", 100).unwrap();

        reg.deposit(handle.id, "alice", 100).unwrap();
        assert!(reg.deposit(handle.id, "alice", 100).is_err());

        assert_eq!(rx.try_recv().unwrap().kind(), "vault_created");
        assert_eq!(rx.try_recv().unwrap().kind(), "deposited");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn queries_route_to_vault() {
        let (reg, bank) = registry();
        let h = reg.create_vault("owner", params()).unwrap();
        bank.mint("USDC", "alice", 500).unwrap();
        reg.deposit(h.id, "alice", 500).unwrap();

        assert_eq!(reg.balance_of(h.id, "alice").unwrap(), 500);
        assert_eq!(reg.preview_redeem(h.id, "alice").unwrap(), 500);
        assert!(reg.is_active(h.id).unwrap());
        assert_eq!(reg.target_liquidity_percent(h.id).unwrap(), 8_000);
        assert_eq!(reg.token_address(h.id).unwrap(), h.token_address);
        assert_eq!(reg.total_value_locked(), 500);
        assert_eq!(reg.resolve(&h.address), Some(h.id));
    }
}
