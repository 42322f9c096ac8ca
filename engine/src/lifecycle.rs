//! # Vault Lifecycle
//!
//! ```text
//!            now >= created_at + expiry
//!   Active ─────────────────────────────▶ Expired      (derived, lazy)
//!     │
//!     │ deactivate(owner)
//!     ▼
//!   Deactivated                                       (stored, irreversible)
//! ```
//!
//! Only `Active` and `Deactivated` are stored. Expiry is never written down;
//! it is recomputed from the clock every time a gate is checked. Both
//! terminal phases close the vault to deposits, rebalancing and yield
//! distribution. Withdrawals are never gated here.

use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::ledger::AccountId;

/// The stored part of a vault's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultStatus {
    Active,
    Deactivated,
}

/// The observable phase: [`VaultStatus`] combined with the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultPhase {
    Active,
    Expired,
    Deactivated,
}

impl fmt::Display for VaultPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaultPhase::Active => write!(f, "active"),
            VaultPhase::Expired => write!(f, "expired"),
            VaultPhase::Deactivated => write!(f, "deactivated"),
        }
    }
}

/// Ownership, timing and status of one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultLifecycle {
    owner: AccountId,
    created_at: DateTime<Utc>,
    expiry_duration_secs: u64,
    status: VaultStatus,
    deactivated_at: Option<DateTime<Utc>>,
}

impl VaultLifecycle {
    /// Starts an `Active` lifecycle.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidParameter`] for an empty owner, a zero expiry,
    /// or an expiry too large to add to `created_at`.
    pub fn new(
        owner: &str,
        created_at: DateTime<Utc>,
        expiry_duration: StdDuration,
    ) -> VaultResult<Self> {
        if owner.is_empty() {
            return Err(VaultError::InvalidParameter(
                "owner must not be empty".into(),
            ));
        }
        if expiry_duration.is_zero() {
            return Err(VaultError::InvalidParameter(
                "expiry_duration must be positive".into(),
            ));
        }
        let lifecycle = Self {
            owner: owner.to_string(),
            created_at,
            expiry_duration_secs: expiry_duration.as_secs().max(1),
            status: VaultStatus::Active,
            deactivated_at: None,
        };
        if lifecycle.checked_expires_at().is_none() {
            return Err(VaultError::InvalidParameter(
                "expiry_duration out of range".into(),
            ));
        }
        Ok(lifecycle)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expiry_duration(&self) -> StdDuration {
        StdDuration::from_secs(self.expiry_duration_secs)
    }

    pub fn status(&self) -> VaultStatus {
        self.status
    }

    pub fn deactivated_at(&self) -> Option<DateTime<Utc>> {
        self.deactivated_at
    }

    fn checked_expires_at(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.expiry_duration_secs).ok()?;
        self.created_at
            .checked_add_signed(Duration::try_seconds(secs)?)
    }

    /// The first instant at which deposits are refused.
    pub fn expires_at(&self) -> DateTime<Utc> {
        // Range-checked in `new`.
        self.checked_expires_at().unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// `now >= created_at + expiry_duration`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn phase(&self, now: DateTime<Utc>) -> VaultPhase {
        match self.status {
            VaultStatus::Deactivated => VaultPhase::Deactivated,
            VaultStatus::Active if self.is_expired(now) => VaultPhase::Expired,
            VaultStatus::Active => VaultPhase::Active,
        }
    }

    /// Not deactivated. Expiry closes deposits but leaves the vault active
    /// until its owner deactivates it; see [`Self::phase`] for expiry.
    pub fn is_active(&self) -> bool {
        self.status == VaultStatus::Active
    }

    /// Fails with [`VaultError::Unauthorized`] unless `caller` owns the vault.
    pub fn ensure_owner(&self, caller: &str) -> VaultResult<()> {
        if caller != self.owner {
            return Err(VaultError::Unauthorized {
                caller: caller.to_string(),
            });
        }
        Ok(())
    }

    /// Gate shared by deposits, rebalances and yield distribution.
    /// Deactivation takes precedence over expiry.
    pub fn ensure_open(&self, now: DateTime<Utc>) -> VaultResult<()> {
        match self.phase(now) {
            VaultPhase::Active => Ok(()),
            VaultPhase::Deactivated => Err(VaultError::VaultNotActive),
            VaultPhase::Expired => Err(VaultError::VaultExpired),
        }
    }

    /// Owner-only, irreversible transition to `Deactivated`.
    pub fn deactivate(&mut self, caller: &str, now: DateTime<Utc>) -> VaultResult<()> {
        self.ensure_owner(caller)?;
        if self.status == VaultStatus::Deactivated {
            return Err(VaultError::AlreadyDeactivated);
        }
        self.status = VaultStatus::Deactivated;
        self.deactivated_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_EXPIRY_DURATION;

    fn lifecycle(created_at: DateTime<Utc>) -> VaultLifecycle {
        VaultLifecycle::new("owner", created_at, DEFAULT_EXPIRY_DURATION).unwrap()
    }

    #[test]
    fn new_lifecycle_is_active() {
        let t0 = Utc::now();
        let lc = lifecycle(t0);
        assert_eq!(lc.phase(t0), VaultPhase::Active);
        assert!(lc.ensure_open(t0).is_ok());
        assert_eq!(lc.expires_at(), t0 + Duration::seconds(604_800));
    }

    #[test]
    fn zero_expiry_rejected() {
        assert!(matches!(
            VaultLifecycle::new("owner", Utc::now(), StdDuration::ZERO),
            Err(VaultError::InvalidParameter(_))
        ));
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let t0 = Utc::now();
        let lc = lifecycle(t0);
        let edge = t0 + Duration::seconds(604_800);
        assert!(lc.ensure_open(edge - Duration::seconds(1)).is_ok());
        assert_eq!(lc.ensure_open(edge), Err(VaultError::VaultExpired));
        assert_eq!(lc.phase(edge), VaultPhase::Expired);
        assert!(lc.is_active());
    }

    #[test]
    fn deactivate_is_owner_only_and_once() {
        let t0 = Utc::now();
        let mut lc = lifecycle(t0);
        assert!(matches!(
            lc.deactivate("mallory", t0),
            Err(VaultError::Unauthorized { .. })
        ));
        assert_eq!(lc.status(), VaultStatus::Active);

        lc.deactivate("owner", t0).unwrap();
        assert!(!lc.is_active());
        assert_eq!(lc.deactivated_at(), Some(t0));
        assert_eq!(lc.deactivate("owner", t0), Err(VaultError::AlreadyDeactivated));
    }

    #[test]
    fn deactivation_reported_before_expiry() {
        let t0 = Utc::now();
        let mut lc = lifecycle(t0);
        lc.deactivate("owner", t0).unwrap();
        let later = t0 + Duration::days(30);
        assert_eq!(lc.ensure_open(later), Err(VaultError::VaultNotActive));
        assert_eq!(lc.phase(later), VaultPhase::Deactivated);
    }
}
