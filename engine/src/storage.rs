//! # VaultStore: Persistent Vault State
//!
//! sled-backed persistence for the registry. Each committed vault mutation
//! rewrites that vault's full [`VaultState`]; states are small, so there is
//! no delta log.
//!
//! ## Tree Layout
//!
//! | Tree        | Key                  | Value                  |
//! |-------------|----------------------|------------------------|
//! | `vaults`    | `index` (8B BE)      | `bincode(VaultState)`  |
//! | `addresses` | `address` (UTF-8)    | `index` (8B BE)        |
//! | `metadata`  | key (UTF-8)          | value (bytes)          |
//!
//! Indices are big-endian so that sled's lexicographic order is creation
//! order, which lets [`VaultStore::load_all`] return vaults sorted.

use std::path::Path;

use sled::{Db, Tree};

use crate::vault::{VaultId, VaultState};

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Well-known key in the `metadata` tree for the number of vaults created.
const META_VAULT_COUNT: &[u8] = b"vault_count";

/// Persistent storage for vault state.
///
/// sled trees are safe for concurrent use, so a `VaultStore` can be shared
/// behind an `Arc` without extra locking.
#[derive(Debug, Clone)]
pub struct VaultStore {
    db: Db,
    vaults: Tree,
    addresses: Tree,
    metadata: Tree,
}

impl VaultStore {
    /// Opens (or creates) a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// An in-memory store discarded on drop. Used by `--ephemeral` nodes
    /// and tests.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let vaults = db.open_tree("vaults")?;
        let addresses = db.open_tree("addresses")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            vaults,
            addresses,
            metadata,
        })
    }

    /// Writes a vault's state and its address index entry, then bumps the
    /// stored vault count if this index is new.
    pub fn put_vault(&self, state: &VaultState) -> StoreResult<()> {
        let key = state.id.to_be_bytes();
        let bytes =
            bincode::serialize(state).map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.vaults.insert(key, bytes)?;
        self.addresses.insert(state.address.as_bytes(), &key)?;
        if state.id > self.vault_count()? {
            self.metadata.insert(META_VAULT_COUNT, &key)?;
        }
        self.db.flush()?;
        Ok(())
    }

    /// Loads one vault by index.
    pub fn get_vault(&self, id: VaultId) -> StoreResult<Option<VaultState>> {
        match self.vaults.get(id.to_be_bytes())? {
            Some(bytes) => {
                let state = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Resolves a vault address to its index.
    pub fn index_of(&self, address: &str) -> StoreResult<Option<VaultId>> {
        match self.addresses.get(address.as_bytes())? {
            Some(bytes) => Ok(Some(decode_index(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every stored vault, in creation order.
    pub fn load_all(&self) -> StoreResult<Vec<VaultState>> {
        let mut states = Vec::new();
        for entry in self.vaults.iter() {
            let (_, bytes) = entry?;
            let state: VaultState = bincode::deserialize(&bytes)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            states.push(state);
        }
        Ok(states)
    }

    /// Number of vaults ever created (0 for a fresh store).
    pub fn vault_count(&self) -> StoreResult<u64> {
        match self.metadata.get(META_VAULT_COUNT)? {
            Some(bytes) => decode_index(&bytes),
            None => Ok(0),
        }
    }

    /// Approximate on-disk size in bytes.
    pub fn size_on_disk(&self) -> StoreResult<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

fn decode_index(bytes: &[u8]) -> StoreResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("expected 8-byte index, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::collaborators::{InMemoryBank, SimulatedVenue};
    use crate::config::RegistryConfig;
    use crate::vault::{Vault, VaultContext, VaultParams};

    fn sample_state(id: VaultId) -> VaultState {
        let bank = Arc::new(InMemoryBank::new());
        let ctx = VaultContext::new(
            bank.clone(),
            Arc::new(SimulatedVenue::new(bank, 0)),
            Arc::new(ManualClock::default()),
        );
        let params = VaultParams::new("USDC", "evt", "Claim", "CLM");
        Vault::create(id, "owner", params, &RegistryConfig::default(), ctx)
            .unwrap()
            .state()
            .clone()
    }

    #[test]
    fn fresh_store_is_empty() {
        let store = VaultStore::open_temporary().unwrap();
        assert_eq!(store.vault_count().unwrap(), 0);
        assert!(store.load_all().unwrap().is_empty());
        assert!(store.get_vault(1).unwrap().is_none());
    }

    #[test]
    fn put_and_get_vault() {
        let store = VaultStore::open_temporary().unwrap();
        let state = sample_state(1);
        store.put_vault(&state).unwrap();

        assert_eq!(store.get_vault(1).unwrap(), Some(state.clone()));
        assert_eq!(store.index_of(&state.address).unwrap(), Some(1));
        assert_eq!(store.vault_count().unwrap(), 1);
    }

    #[test]
    fn rewriting_a_vault_keeps_count() {
        let store = VaultStore::open_temporary().unwrap();
        store.put_vault(&sample_state(1)).unwrap();
        store.put_vault(&sample_state(2)).unwrap();
        store.put_vault(&sample_state(1)).unwrap();
        assert_eq!(store.vault_count().unwrap(), 2);
    }

    #[test]
    fn load_all_is_in_index_order() {
        let store = VaultStore::open_temporary().unwrap();
        for id in [3, 1, 2, 256] {
            store.put_vault(&sample_state(id)).unwrap();
        }
        let ids: Vec<_> = store.load_all().unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 256]);
    }

    #[test]
    fn short_index_is_corrupt() {
        assert!(matches!(decode_index(&[1, 2, 3]), Err(StoreError::Corrupt(_))));
    }
}
