//! # Prometheus Metrics
//!
//! Vault activity counters and registry gauges, scraped at `/metrics` on the
//! metrics port. Counters are fed from the registry's event stream by
//! [`spawn_event_feed`]; gauges are refreshed after every event.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] under the
//! `marketpulse` namespace.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use marketpulse_engine::{VaultEvent, VaultRegistry};

/// Metric handles for the node. Prometheus handles are internally
/// reference-counted, so clones share the same series.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub vaults_created_total: IntCounter,
    pub deposits_total: IntCounter,
    pub deposited_assets_total: IntCounter,
    pub withdrawals_total: IntCounter,
    pub withdrawn_assets_total: IntCounter,
    /// Executed liquidity moves, labelled `direction` = provide | withdraw.
    pub rebalances_total: IntCounterVec,
    pub slippage_rejections_total: IntCounter,
    pub rebalance_failures_total: IntCounter,
    pub yield_distributed_total: IntCounter,
    pub treasury_fees_total: IntCounter,
    pub deactivations_total: IntCounter,
    pub vault_count: IntGauge,
    pub total_value_locked: IntGauge,
    pub manager_sweeps_total: IntCounter,
    pub manager_sweep_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("marketpulse".into()), None)?;

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let vaults_created_total = counter("vaults_created_total", "Vaults created")?;
        let deposits_total = counter("deposits_total", "Committed deposits")?;
        let deposited_assets_total =
            counter("deposited_assets_total", "Underlying units deposited")?;
        let withdrawals_total = counter("withdrawals_total", "Committed withdrawals")?;
        let withdrawn_assets_total =
            counter("withdrawn_assets_total", "Underlying units paid out")?;

        let rebalances_total = IntCounterVec::new(
            Opts::new("rebalances_total", "Executed liquidity moves"),
            &["direction"],
        )?;
        registry.register(Box::new(rebalances_total.clone()))?;

        let slippage_rejections_total = counter(
            "slippage_rejections_total",
            "Rebalances refused for exceeding the slippage bound",
        )?;
        let rebalance_failures_total = counter(
            "rebalance_failures_total",
            "Rebalances that failed for reasons other than slippage",
        )?;
        let yield_distributed_total = counter(
            "yield_distributed_total",
            "Yield folded into vaults, net of treasury fees",
        )?;
        let treasury_fees_total = counter("treasury_fees_total", "Treasury fees paid")?;
        let deactivations_total = counter("deactivations_total", "Vaults deactivated")?;
        let vault_count = gauge("vault_count", "Vaults in the registry")?;
        let total_value_locked = gauge(
            "total_value_locked",
            "Sum of total_assets_held across all vaults",
        )?;
        let manager_sweeps_total = counter("manager_sweeps_total", "Vault manager sweeps run")?;

        let manager_sweep_seconds = Histogram::with_opts(
            HistogramOpts::new("manager_sweep_seconds", "Duration of one manager sweep")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(manager_sweep_seconds.clone()))?;

        Ok(Self {
            registry,
            vaults_created_total,
            deposits_total,
            deposited_assets_total,
            withdrawals_total,
            withdrawn_assets_total,
            rebalances_total,
            slippage_rejections_total,
            rebalance_failures_total,
            yield_distributed_total,
            treasury_fees_total,
            deactivations_total,
            vault_count,
            total_value_locked,
            manager_sweeps_total,
            manager_sweep_seconds,
        })
    }

    /// Bumps the counters an event accounts for.
    pub fn record(&self, event: &VaultEvent) {
        match event {
            VaultEvent::VaultCreated { .. } => self.vaults_created_total.inc(),
            VaultEvent::Deposited { amount, .. } => {
                self.deposits_total.inc();
                self.deposited_assets_total.inc_by(*amount);
            }
            VaultEvent::Withdrawn { amount, .. } => {
                self.withdrawals_total.inc();
                self.withdrawn_assets_total.inc_by(*amount);
            }
            VaultEvent::LiquidityAdded { .. } => {
                self.rebalances_total.with_label_values(&["provide"]).inc()
            }
            VaultEvent::LiquidityRemoved { .. } => {
                self.rebalances_total.with_label_values(&["withdraw"]).inc()
            }
            VaultEvent::RebalanceRejected { slippage, .. } => {
                if *slippage {
                    self.slippage_rejections_total.inc();
                } else {
                    self.rebalance_failures_total.inc();
                }
            }
            VaultEvent::YieldDistributed {
                treasury_fee,
                distributed,
                ..
            } => {
                self.yield_distributed_total.inc_by(*distributed);
                self.treasury_fees_total.inc_by(*treasury_fee);
            }
            VaultEvent::VaultDeactivated { .. } => self.deactivations_total.inc(),
        }
    }

    /// Sets the registry-wide gauges.
    pub fn refresh_gauges(&self, registry: &VaultRegistry) {
        self.vault_count.set(gauge_value(registry.vault_count()));
        self.total_value_locked
            .set(gauge_value(registry.total_value_locked()));
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn gauge_value(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Records every registry event into `metrics` until the registry is
/// dropped.
pub fn spawn_event_feed(metrics: SharedMetrics, registry: Arc<VaultRegistry>) -> JoinHandle<()> {
    let mut rx = registry.subscribe();
    metrics.refresh_gauges(&registry);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    metrics.record(&event);
                    metrics.refresh_gauges(&registry);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "metrics feed lagged, counters undercount");
                    metrics.refresh_gauges(&registry);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Axum handler that renders `/metrics`.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
