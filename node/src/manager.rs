//! # Vault Manager
//!
//! Background loop that looks after the vaults the operator owns. Each sweep
//! walks every vault and, for those that are active and have not been checked
//! within `check_interval`:
//!
//! 1. rebalances if the idle/liquidity split has drifted past the threshold;
//! 2. distributes yield (a no-op when there is no surplus).
//!
//! Failures are logged and recorded against the vault. They never stop the
//! loop.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use marketpulse_engine::clock::Clock;
use marketpulse_engine::lifecycle::VaultPhase;
use marketpulse_engine::rebalance::RebalanceAction;
use marketpulse_engine::{VaultId, VaultRegistry};

use crate::metrics::SharedMetrics;

/// What the manager last did to one vault.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VaultWatch {
    pub last_check: Option<DateTime<Utc>>,
    pub last_rebalance: Option<DateTime<Utc>>,
    pub last_yield_distribution: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub skipped: usize,
    pub rebalanced: usize,
    pub distributed: usize,
    pub failed: usize,
}

/// Manager state exposed on `/status`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerStatus {
    pub enabled: bool,
    pub operator: String,
    pub check_interval_secs: u64,
    pub sweeps: u64,
    pub last_sweep: Option<DateTime<Utc>>,
    pub last_report: Option<SweepReport>,
    pub vaults: BTreeMap<VaultId, VaultWatch>,
}

pub type SharedManagerStatus = Arc<RwLock<ManagerStatus>>;

pub struct VaultManager {
    registry: Arc<VaultRegistry>,
    clock: Arc<dyn Clock>,
    operator: String,
    check_interval: Duration,
    status: SharedManagerStatus,
    metrics: Option<SharedMetrics>,
}

impl VaultManager {
    pub fn new(
        registry: Arc<VaultRegistry>,
        clock: Arc<dyn Clock>,
        operator: &str,
        check_interval: Duration,
    ) -> Self {
        let status = ManagerStatus {
            enabled: true,
            operator: operator.to_string(),
            check_interval_secs: check_interval.as_secs(),
            ..ManagerStatus::default()
        };
        Self {
            registry,
            clock,
            operator: operator.to_string(),
            check_interval,
            status: Arc::new(RwLock::new(status)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// A handle to the state the manager publishes.
    pub fn status(&self) -> SharedManagerStatus {
        Arc::clone(&self.status)
    }

    /// Runs one pass over every vault.
    pub fn sweep(&self) -> SweepReport {
        let started = Instant::now();
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for id in self.registry.vault_ids() {
            if self.is_due(id, now) {
                self.manage(id, now, &mut report);
            } else {
                report.skipped += 1;
            }
        }

        {
            let mut status = self.status.write();
            status.sweeps += 1;
            status.last_sweep = Some(now);
            status.last_report = Some(report);
        }
        if let Some(metrics) = &self.metrics {
            metrics.manager_sweeps_total.inc();
            metrics
                .manager_sweep_seconds
                .observe(started.elapsed().as_secs_f64());
        }

        info!(
            checked = report.checked,
            skipped = report.skipped,
            rebalanced = report.rebalanced,
            distributed = report.distributed,
            failed = report.failed,
            "vault sweep finished"
        );
        report
    }

    /// Sweeps every `check_interval` until the task is aborted.
    pub async fn run(self) {
        info!(
            operator = %self.operator,
            interval_secs = self.check_interval.as_secs(),
            "starting vault manager loop"
        );
        let manager = Arc::new(self);
        let mut interval = tokio::time::interval(manager.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let m = Arc::clone(&manager);
            if let Err(e) = tokio::task::spawn_blocking(move || m.sweep()).await {
                warn!("vault sweep panicked: {}", e);
            }
        }
    }

    fn is_due(&self, id: VaultId, now: DateTime<Utc>) -> bool {
        let status = self.status.read();
        match status.vaults.get(&id).and_then(|w| w.last_check) {
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed >= self.check_interval,
                Err(_) => false,
            },
            None => true,
        }
    }

    fn manage(&self, id: VaultId, now: DateTime<Utc>, report: &mut SweepReport) {
        let snapshot = match self.registry.snapshot(id) {
            Ok(s) => s,
            Err(e) => {
                warn!(vault = id, "failed to read vault: {}", e);
                report.failed += 1;
                return;
            }
        };
        if snapshot.owner != self.operator {
            debug!(vault = id, owner = %snapshot.owner, "not operator-owned, skipping");
            report.skipped += 1;
            return;
        }
        if snapshot.phase != VaultPhase::Active {
            debug!(vault = id, phase = %snapshot.phase, "vault closed, skipping");
            report.skipped += 1;
            return;
        }

        report.checked += 1;
        let mut watch = self.watch(id);
        watch.last_check = Some(now);
        watch.last_error = None;

        if snapshot.needs_rebalance {
            match self.registry.rebalance(id, &self.operator) {
                Ok(receipt) if receipt.action != RebalanceAction::Hold => {
                    watch.last_rebalance = Some(now);
                    report.rebalanced += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(vault = id, "managed rebalance failed: {}", e);
                    watch.last_error = Some(e.to_string());
                    report.failed += 1;
                }
            }
        }

        match self.registry.distribute_yield(id, &self.operator) {
            Ok(plan) if !plan.is_empty() => {
                watch.last_yield_distribution = Some(now);
                report.distributed += 1;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(vault = id, "managed yield distribution failed: {}", e);
                watch.last_error = Some(e.to_string());
                report.failed += 1;
            }
        }

        self.status.write().vaults.insert(id, watch);
    }

    fn watch(&self, id: VaultId) -> VaultWatch {
        self.status.read().vaults.get(&id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketpulse_engine::clock::ManualClock;
    use marketpulse_engine::{RegistryConfig, VaultParams};

    use crate::simulation::Simulation;

    const OPERATOR: &str = "operator";

    struct Fixture {
        sim: Simulation,
        clock: Arc<ManualClock>,
        registry: Arc<VaultRegistry>,
    }

    fn fixture(price_impact_bps: u32) -> Fixture {
        let sim = Simulation::new(price_impact_bps);
        let clock = Arc::new(ManualClock::default());
        let config = RegistryConfig {
            auto_rebalance: false,
            ..RegistryConfig::default()
        };
        let registry = Arc::new(VaultRegistry::new(config, sim.context(clock.clone())).unwrap());
        Fixture {
            sim,
            clock,
            registry,
        }
    }

    fn manager(f: &Fixture) -> VaultManager {
        VaultManager::new(
            f.registry.clone(),
            f.clock.clone(),
            OPERATOR,
            Duration::from_secs(3_600),
        )
    }

    fn funded_vault(f: &Fixture, owner: &str) -> VaultId {
        let vault = f
            .registry
            .create_vault(owner, VaultParams::new("USDC", "evt", "Claim", "CLM"))
            .unwrap();
        f.sim.bank.mint("USDC", "alice", 10_000).unwrap();
        f.registry.deposit(vault.id, "alice", 10_000).unwrap();
        vault.id
    }

    #[test]
    fn sweep_rebalances_drifted_vault() {
        let f = fixture(0);
        let id = funded_vault(&f, OPERATOR);
        assert!(f.registry.needs_rebalance(id).unwrap());

        let report = manager(&f).sweep();
        assert_eq!(report.checked, 1);
        assert_eq!(report.rebalanced, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(f.registry.snapshot(id).unwrap().liquidity_amount, 8_000);
    }

    #[test]
    fn sweep_distributes_venue_fees() {
        let f = fixture(0);
        let id = funded_vault(&f, OPERATOR);
        let m = manager(&f);
        m.sweep();

        let address = f.registry.snapshot(id).unwrap().address;
        f.sim.venue.accrue_fees(&address, "USDC", 1_000).unwrap();
        f.clock.advance(chrono::Duration::hours(1));

        let report = m.sweep();
        assert_eq!(report.distributed, 1);
        let watch = m.status().read().vaults[&id].clone();
        assert!(watch.last_yield_distribution.is_some());
        // 1000 surplus, 0.5% fee.
        assert_eq!(f.registry.snapshot(id).unwrap().total_assets_held, 10_995);
    }

    #[test]
    fn fully_deployed_vault_yield_is_distributed() {
        let f = fixture(0);
        let params =
            VaultParams::new("USDC", "evt", "Claim", "CLM").with_target_liquidity_bps(10_000);
        let vault = f.registry.create_vault(OPERATOR, params).unwrap();
        f.sim.bank.mint("USDC", "alice", 10_000).unwrap();
        f.registry.deposit(vault.id, "alice", 10_000).unwrap();
        let m = manager(&f);
        assert_eq!(m.sweep().rebalanced, 1);

        f.sim.venue.accrue_fees(&vault.address, "USDC", 1_000).unwrap();
        f.clock.advance(chrono::Duration::hours(1));
        let report = m.sweep();
        assert_eq!(report.failed, 0);
        assert_eq!(report.distributed, 1);
        assert_eq!(f.sim.bank.balance("USDC", "treasury"), 5);
        assert!(m.status().read().vaults[&vault.id].last_error.is_none());
    }

    #[test]
    fn recently_checked_vault_is_skipped() {
        let f = fixture(0);
        funded_vault(&f, OPERATOR);
        let m = manager(&f);

        assert_eq!(m.sweep().checked, 1);
        f.clock.advance(chrono::Duration::minutes(30));
        let second = m.sweep();
        assert_eq!(second.checked, 0);
        assert_eq!(second.skipped, 1);

        f.clock.advance(chrono::Duration::minutes(30));
        assert_eq!(m.sweep().checked, 1);
    }

    #[test]
    fn foreign_and_closed_vaults_are_skipped() {
        let f = fixture(0);
        let foreign = funded_vault(&f, "someone-else");
        let closed = funded_vault(&f, OPERATOR);
        f.registry.deactivate(closed, OPERATOR).unwrap();

        let report = manager(&f).sweep();
        assert_eq!(report.checked, 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(f.registry.snapshot(foreign).unwrap().liquidity_amount, 0);
    }

    #[test]
    fn slippage_failure_is_recorded_not_fatal() {
        let f = fixture(500);
        let id = funded_vault(&f, OPERATOR);
        let m = manager(&f);

        let report = m.sweep();
        assert_eq!(report.failed, 1);
        assert_eq!(report.rebalanced, 0);

        let status = m.status();
        let status = status.read();
        assert_eq!(status.sweeps, 1);
        assert!(status.vaults[&id]
            .last_error
            .as_deref()
            .unwrap()
            .contains("slippage"));
    }
}
