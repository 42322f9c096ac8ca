//! # Vault
//!
//! One vault instance: an [`AssetLedger`] plus the policies that govern it,
//! wired to the external collaborators through a [`VaultContext`].
//!
//! ## Atomicity
//!
//! Every mutating operation follows the same shape:
//!
//! 1. Check authorization and lifecycle gates.
//! 2. Compute amounts from the current ledger.
//! 3. Apply the mutation to a **clone** of the ledger.
//! 4. Call the collaborator (transfer or venue).
//! 5. Only if that succeeds, replace the live ledger with the staged one.
//!
//! A failure at any step therefore leaves the vault exactly as it was, with
//! two exceptions. When a withdrawal or a treasury fee needs more idle funds
//! than the vault holds, the liquidity unwind is committed as its own step
//! before the payout is attempted. And a venue fill that settled beyond the
//! slippage bound is reversed and its round-trip cost booked, so the ledger
//! keeps matching custody even though the move is refused.
//!
//! Callers must serialize access to a vault; [`crate::registry::VaultRegistry`]
//! does so with a per-vault mutex.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::collaborators::{AssetId, AssetTransfer, LiquidityVenue, VenueError, VenueFill};
use crate::config::{
    validate_bps, RegistryConfig, BPS_DENOMINATOR, DEFAULT_EXPIRY_DURATION,
    DEFAULT_MAX_SLIPPAGE_BPS, DEFAULT_TARGET_LIQUIDITY_BPS, MAX_TOKEN_NAME_LENGTH,
    MAX_TOKEN_SYMBOL_LENGTH,
};
use crate::distributor::{plan_distribution, YieldDistribution};
use crate::error::{VaultError, VaultResult};
use crate::events::VaultEvent;
use crate::ledger::{AccountId, AssetLedger};
use crate::lifecycle::{VaultLifecycle, VaultPhase};
use crate::rebalance::{RebalanceAction, RebalancePolicy};
use crate::shares::{assets_for_withdrawal, preview_redeem, shares_for_deposit};

/// Registry index of a vault (1-based).
pub type VaultId = u64;

// ---------------------------------------------------------------------------
// Creation Parameters
// ---------------------------------------------------------------------------

/// Everything needed to create a vault, apart from its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultParams {
    /// Asset accepted for deposit.
    pub asset: AssetId,
    /// The market event the vault was created for.
    pub event_id: String,
    /// Claim-token name.
    pub name: String,
    /// Claim-token symbol.
    pub symbol: String,
    /// Share of assets to keep at the venue (bps).
    pub target_liquidity_bps: u32,
    /// Maximum price impact tolerated for venue moves (bps).
    pub max_slippage_bps: u32,
    /// Deposits close this long after creation.
    pub expiry_duration: StdDuration,
}

impl VaultParams {
    /// Parameters with the default target, slippage bound and expiry.
    pub fn new(asset: &str, event_id: &str, name: &str, symbol: &str) -> Self {
        Self {
            asset: asset.to_string(),
            event_id: event_id.to_string(),
            name: name.to_string(),
            symbol: symbol.to_string(),
            target_liquidity_bps: DEFAULT_TARGET_LIQUIDITY_BPS,
            max_slippage_bps: DEFAULT_MAX_SLIPPAGE_BPS,
            expiry_duration: DEFAULT_EXPIRY_DURATION,
        }
    }

    pub fn with_target_liquidity_bps(mut self, bps: u32) -> Self {
        self.target_liquidity_bps = bps;
        self
    }

    pub fn with_max_slippage_bps(mut self, bps: u32) -> Self {
        self.max_slippage_bps = bps;
        self
    }

    pub fn with_expiry(mut self, expiry: StdDuration) -> Self {
        self.expiry_duration = expiry;
        self
    }

    /// Checks every field that does not depend on registry settings.
    pub fn validate(&self) -> VaultResult<()> {
        if self.asset.is_empty() {
            return Err(VaultError::InvalidParameter("asset must not be empty".into()));
        }
        if self.name.trim().is_empty() || self.name.len() > MAX_TOKEN_NAME_LENGTH {
            return Err(VaultError::InvalidParameter(format!(
                "token name must be 1-{} characters",
                MAX_TOKEN_NAME_LENGTH
            )));
        }
        if self.symbol.trim().is_empty() || self.symbol.len() > MAX_TOKEN_SYMBOL_LENGTH {
            return Err(VaultError::InvalidParameter(format!(
                "token symbol must be 1-{} characters",
                MAX_TOKEN_SYMBOL_LENGTH
            )));
        }
        validate_bps("target_liquidity_percent", self.target_liquidity_bps)?;
        validate_bps("max_slippage_bps", self.max_slippage_bps)?;
        if self.expiry_duration.is_zero() {
            return Err(VaultError::InvalidParameter(
                "expiry_duration must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Persisted State
// ---------------------------------------------------------------------------

/// Claim-token metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimToken {
    pub address: String,
    pub name: String,
    pub symbol: String,
}

/// The complete, serializable state of one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultState {
    pub id: VaultId,
    pub address: String,
    pub underlying_asset: AssetId,
    pub event_id: String,
    pub claim_token: ClaimToken,
    pub ledger: AssetLedger,
    pub policy: RebalancePolicy,
    pub lifecycle: VaultLifecycle,
    pub treasury: AccountId,
    pub treasury_fee_bps: u32,
    pub auto_rebalance: bool,
}

/// A read-only view of a vault for queries and the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSnapshot {
    pub id: VaultId,
    pub address: String,
    pub token_address: String,
    pub token_name: String,
    pub token_symbol: String,
    pub underlying_asset: AssetId,
    pub event_id: String,
    pub owner: AccountId,
    pub phase: VaultPhase,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub total_assets_held: u64,
    pub liquidity_amount: u64,
    pub idle_amount: u64,
    pub claim_supply: u64,
    pub holder_count: usize,
    pub target_liquidity_bps: u32,
    pub current_liquidity_bps: Option<u32>,
    pub max_slippage_bps: u32,
    pub min_rebalance_threshold_bps: u32,
    pub needs_rebalance: bool,
    pub treasury: AccountId,
    pub treasury_fee_bps: u32,
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// Outcome of a liquidity move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalanceReceipt {
    pub action: RebalanceAction,
    /// `None` when the action was [`RebalanceAction::Hold`].
    pub fill: Option<VenueFill>,
    pub liquidity_before: u64,
    pub liquidity_after: u64,
    pub total_assets_after: u64,
}

/// What happened to the rebalance that follows a deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AutoRebalance {
    Executed(RebalanceReceipt),
    /// The deposit stands; only the liquidity move was refused.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositReceipt {
    pub vault_id: VaultId,
    pub depositor: AccountId,
    pub amount: u64,
    pub shares_minted: u64,
    pub claim_balance: u64,
    /// `None` if no rebalance was needed or auto-rebalance is off.
    pub auto_rebalance: Option<AutoRebalance>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawReceipt {
    pub vault_id: VaultId,
    pub holder: AccountId,
    pub shares_burned: u64,
    pub assets_returned: u64,
    pub remaining_claims: u64,
    /// Liquidity pulled back from the venue to fund the payout.
    pub unwind: Option<RebalanceReceipt>,
}

// ---------------------------------------------------------------------------
// Collaborator Context
// ---------------------------------------------------------------------------

/// The collaborators a vault operates against.
#[derive(Clone)]
pub struct VaultContext {
    pub bank: Arc<dyn AssetTransfer>,
    pub venue: Arc<dyn LiquidityVenue>,
    pub clock: Arc<dyn Clock>,
}

impl VaultContext {
    pub fn new(
        bank: Arc<dyn AssetTransfer>,
        venue: Arc<dyn LiquidityVenue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { bank, venue, clock }
    }
}

impl std::fmt::Debug for VaultContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultContext")
            .field("now", &self.clock.now())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// A single vault bound to its collaborators.
#[derive(Debug)]
pub struct Vault {
    state: VaultState,
    ctx: VaultContext,
    /// Events for committed changes not yet collected by the registry.
    pending: Vec<VaultEvent>,
}

impl Vault {
    /// Creates a fresh `Active` vault owned by `owner`.
    pub fn create(
        id: VaultId,
        owner: &str,
        params: VaultParams,
        config: &RegistryConfig,
        ctx: VaultContext,
    ) -> VaultResult<Self> {
        params.validate()?;
        config.validate()?;

        let created_at = ctx.clock.now();
        let policy = RebalancePolicy::new(
            params.target_liquidity_bps,
            config.min_rebalance_threshold_bps,
            params.max_slippage_bps,
        )?;
        let lifecycle = VaultLifecycle::new(owner, created_at, params.expiry_duration)?;

        let address = derive_address(
            "marketpulse v1 vault address",
            &[
                &id.to_be_bytes(),
                params.asset.as_bytes(),
                params.event_id.as_bytes(),
                owner.as_bytes(),
                &created_at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes(),
            ],
        );
        let token_address =
            derive_address("marketpulse v1 claim token address", &[address.as_bytes()]);

        let state = VaultState {
            id,
            address,
            underlying_asset: params.asset,
            event_id: params.event_id,
            claim_token: ClaimToken {
                address: token_address,
                name: params.name,
                symbol: params.symbol,
            },
            ledger: AssetLedger::new(),
            policy,
            lifecycle,
            treasury: config.treasury.clone(),
            treasury_fee_bps: config.treasury_fee_bps,
            auto_rebalance: config.auto_rebalance,
        };

        info!(
            vault = id,
            address = %state.address,
            asset = %state.underlying_asset,
            event_id = %state.event_id,
            owner,
            target_bps = policy.target_liquidity_bps,
            "vault created"
        );

        let created = VaultEvent::VaultCreated {
            vault_id: id,
            address: state.address.clone(),
            token_address: state.claim_token.address.clone(),
            asset: state.underlying_asset.clone(),
            event_id: state.event_id.clone(),
            owner: owner.to_string(),
            target_liquidity_bps: policy.target_liquidity_bps,
        };

        Ok(Self {
            state,
            ctx,
            pending: vec![created],
        })
    }

    /// Rebinds persisted state to live collaborators.
    pub fn from_state(state: VaultState, ctx: VaultContext) -> Self {
        Self {
            state,
            ctx,
            pending: Vec::new(),
        }
    }

    // -- Queries ------------------------------------------------------------

    pub fn id(&self) -> VaultId {
        self.state.id
    }

    pub fn address(&self) -> &str {
        &self.state.address
    }

    pub fn state(&self) -> &VaultState {
        &self.state
    }

    pub fn ledger(&self) -> &AssetLedger {
        &self.state.ledger
    }

    pub fn owner(&self) -> &str {
        self.state.lifecycle.owner()
    }

    pub fn token_address(&self) -> &str {
        &self.state.claim_token.address
    }

    pub fn target_liquidity_bps(&self) -> u32 {
        self.state.policy.target_liquidity_bps
    }

    pub fn balance_of(&self, holder: &str) -> u64 {
        self.state.ledger.balance_of(holder)
    }

    /// Underlying units `holder` would receive for burning their whole balance.
    pub fn preview_redeem(&self, holder: &str) -> u64 {
        let ledger = &self.state.ledger;
        preview_redeem(
            ledger.balance_of(holder),
            ledger.total_assets_held(),
            ledger.claim_supply(),
        )
    }

    /// True until the owner deactivates the vault, expired or not.
    pub fn is_active(&self) -> bool {
        self.state.lifecycle.is_active()
    }

    pub fn phase(&self) -> VaultPhase {
        self.state.lifecycle.phase(self.now())
    }

    pub fn needs_rebalance(&self) -> bool {
        self.state.policy.needs_rebalance(&self.state.ledger)
    }

    pub fn snapshot(&self) -> VaultSnapshot {
        let s = &self.state;
        let ledger = &s.ledger;
        VaultSnapshot {
            id: s.id,
            address: s.address.clone(),
            token_address: s.claim_token.address.clone(),
            token_name: s.claim_token.name.clone(),
            token_symbol: s.claim_token.symbol.clone(),
            underlying_asset: s.underlying_asset.clone(),
            event_id: s.event_id.clone(),
            owner: s.lifecycle.owner().to_string(),
            phase: self.phase(),
            created_at: s.lifecycle.created_at(),
            expires_at: s.lifecycle.expires_at(),
            total_assets_held: ledger.total_assets_held(),
            liquidity_amount: ledger.liquidity_amount(),
            idle_amount: ledger.idle_amount(),
            claim_supply: ledger.claim_supply(),
            holder_count: ledger.holder_count(),
            target_liquidity_bps: s.policy.target_liquidity_bps,
            current_liquidity_bps: s.policy.current_liquidity_bps(ledger),
            max_slippage_bps: s.policy.max_slippage_bps,
            min_rebalance_threshold_bps: s.policy.min_rebalance_threshold_bps,
            needs_rebalance: s.policy.needs_rebalance(ledger),
            treasury: s.treasury.clone(),
            treasury_fee_bps: s.treasury_fee_bps,
        }
    }

    /// Drains events for changes committed since the last call.
    pub fn take_events(&mut self) -> Vec<VaultEvent> {
        std::mem::take(&mut self.pending)
    }

    // -- Operations -----------------------------------------------------------

    /// Deposits `amount` underlying units from `depositor` and mints claims.
    ///
    /// If auto-rebalance is on and the deposit pushes the split past the
    /// threshold, a rebalance follows. Its failure is reported in the
    /// receipt and does not undo the deposit.
    pub fn deposit(&mut self, depositor: &str, amount: u64) -> VaultResult<DepositReceipt> {
        self.state.lifecycle.ensure_open(self.now())?;
        if depositor.is_empty() {
            return Err(VaultError::InvalidParameter(
                "depositor must not be empty".into(),
            ));
        }
        self.ensure_external(depositor)?;

        let ledger = &self.state.ledger;
        let shares = shares_for_deposit(amount, ledger.total_assets_held(), ledger.claim_supply())?;

        let mut staged = ledger.clone();
        staged.credit_assets(amount)?;
        let claim_balance = staged.mint_claims(depositor, shares)?;

        self.ctx.bank.transfer_in(
            &self.state.underlying_asset,
            depositor,
            &self.state.address,
            amount,
        )?;
        self.state.ledger = staged;

        info!(
            vault = self.state.id,
            depositor,
            amount,
            shares,
            total = self.state.ledger.total_assets_held(),
            supply = self.state.ledger.claim_supply(),
            "deposit committed"
        );
        self.pending.push(VaultEvent::Deposited {
            vault_id: self.state.id,
            depositor: depositor.to_string(),
            amount,
            shares,
        });

        let auto_rebalance = if self.state.auto_rebalance && self.needs_rebalance() {
            Some(match self.execute_rebalance() {
                Ok(receipt) => AutoRebalance::Executed(receipt),
                Err(e) => {
                    self.record_rejection(&e);
                    AutoRebalance::Failed {
                        reason: e.to_string(),
                    }
                }
            })
        } else {
            None
        };

        Ok(DepositReceipt {
            vault_id: self.state.id,
            depositor: depositor.to_string(),
            amount,
            shares_minted: shares,
            claim_balance,
            auto_rebalance,
        })
    }

    /// Burns `shares` claim units from `holder` and pays out their
    /// proportional share of the vault. Allowed in every lifecycle phase.
    pub fn withdraw(&mut self, holder: &str, shares: u64) -> VaultResult<WithdrawReceipt> {
        self.ensure_external(holder)?;
        let balance = self.state.ledger.balance_of(holder);
        let mut assets = assets_for_withdrawal(
            shares,
            balance,
            self.state.ledger.total_assets_held(),
            self.state.ledger.claim_supply(),
        )?;

        let mut unwind = None;
        let idle = self.state.ledger.idle_amount();
        if assets > idle {
            let liquidity_before = self.state.ledger.liquidity_amount();
            let gross = self
                .state
                .policy
                .gross_up_for_slippage(assets - idle, liquidity_before);
            debug!(
                vault = self.state.id,
                shortfall = assets - idle,
                gross,
                "unwinding liquidity to fund withdrawal"
            );
            let fill = self.withdraw_from_venue(gross)?;
            unwind = Some(RebalanceReceipt {
                action: RebalanceAction::Withdraw(gross),
                fill: Some(fill),
                liquidity_before,
                liquidity_after: self.state.ledger.liquidity_amount(),
                total_assets_after: self.state.ledger.total_assets_held(),
            });
            // The unwind's venue loss is shared by all holders.
            assets = assets_for_withdrawal(
                shares,
                balance,
                self.state.ledger.total_assets_held(),
                self.state.ledger.claim_supply(),
            )?;
        }

        let mut staged = self.state.ledger.clone();
        let remaining_claims = staged.burn_claims(holder, shares)?;
        staged.debit_assets(assets)?;

        self.ctx.bank.transfer_out(
            &self.state.underlying_asset,
            &self.state.address,
            holder,
            assets,
        )?;
        self.state.ledger = staged;

        info!(
            vault = self.state.id,
            holder,
            shares,
            assets,
            total = self.state.ledger.total_assets_held(),
            supply = self.state.ledger.claim_supply(),
            "withdrawal committed"
        );
        self.pending.push(VaultEvent::Withdrawn {
            vault_id: self.state.id,
            holder: holder.to_string(),
            shares,
            amount: assets,
        });

        Ok(WithdrawReceipt {
            vault_id: self.state.id,
            holder: holder.to_string(),
            shares_burned: shares,
            assets_returned: assets,
            remaining_claims,
            unwind,
        })
    }

    /// Owner-only. Moves liquidity to target if the split has drifted at
    /// least the threshold; otherwise returns a `Hold` receipt.
    pub fn rebalance(&mut self, caller: &str) -> VaultResult<RebalanceReceipt> {
        self.state.lifecycle.ensure_owner(caller)?;
        self.state.lifecycle.ensure_open(self.now())?;

        if !self.needs_rebalance() {
            let liquidity = self.state.ledger.liquidity_amount();
            debug!(
                vault = self.state.id,
                deviation_bps = self.state.policy.deviation_bps(&self.state.ledger),
                "rebalance not needed"
            );
            return Ok(RebalanceReceipt {
                action: RebalanceAction::Hold,
                fill: None,
                liquidity_before: liquidity,
                liquidity_after: liquidity,
                total_assets_after: self.state.ledger.total_assets_held(),
            });
        }

        self.execute_rebalance().map_err(|e| {
            self.record_rejection(&e);
            e
        })
    }

    /// Owner-only. Folds any surplus the collaborators report into the
    /// vault, net of the treasury fee. Returns the plan that was applied.
    pub fn distribute_yield(&mut self, caller: &str) -> VaultResult<YieldDistribution> {
        self.state.lifecycle.ensure_owner(caller)?;
        self.state.lifecycle.ensure_open(self.now())?;

        let mut plan = self.plan_yield()?;
        if plan.is_empty() {
            debug!(
                vault = self.state.id,
                accounted = plan.accounted,
                actual = plan.actual,
                "no yield to distribute"
            );
            return Ok(plan);
        }

        // The fee is paid from idle. Yield earned at the venue may leave
        // idle short of it, so pull the difference out first and re-plan.
        let idle_after_fold = self.state.ledger.idle_amount().saturating_add(plan.to_idle);
        if plan.treasury_fee > idle_after_fold {
            let shortfall = plan.treasury_fee - idle_after_fold;
            let gross = self
                .state
                .policy
                .gross_up_for_slippage(shortfall, self.state.ledger.liquidity_amount());
            debug!(
                vault = self.state.id,
                shortfall, gross, "unwinding liquidity to fund treasury fee"
            );
            if gross > 0 {
                self.withdraw_from_venue(gross)?;
            }
            plan = self.plan_yield()?;
        }

        let mut staged = self.state.ledger.clone();
        staged.fold_surplus(plan.to_idle, plan.to_liquidity)?;
        if plan.treasury_fee > 0 {
            staged.debit_assets(plan.treasury_fee)?;
            self.ctx.bank.transfer_out(
                &self.state.underlying_asset,
                &self.state.address,
                &self.state.treasury,
                plan.treasury_fee,
            )?;
        }
        self.state.ledger = staged;

        info!(
            vault = self.state.id,
            surplus = plan.surplus,
            fee = plan.treasury_fee,
            distributed = plan.distributed,
            total = self.state.ledger.total_assets_held(),
            "yield distributed"
        );
        self.pending.push(VaultEvent::YieldDistributed {
            vault_id: self.state.id,
            surplus: plan.surplus,
            treasury_fee: plan.treasury_fee,
            distributed: plan.distributed,
        });
        Ok(plan)
    }

    /// Owner-only, irreversible. Closes the vault to deposits.
    pub fn deactivate(&mut self, caller: &str) -> VaultResult<()> {
        let now = self.now();
        self.state.lifecycle.deactivate(caller, now)?;
        info!(vault = self.state.id, caller, "vault deactivated");
        self.pending.push(VaultEvent::VaultDeactivated {
            vault_id: self.state.id,
            by: caller.to_string(),
        });
        Ok(())
    }

    // -- Internals ------------------------------------------------------------

    fn now(&self) -> DateTime<Utc> {
        self.ctx.clock.now()
    }

    /// The vault cannot deposit into or redeem from itself: a transfer to
    /// its own account moves nothing, so the books would drift from custody.
    fn ensure_external(&self, account: &str) -> VaultResult<()> {
        if account == self.state.address {
            return Err(VaultError::InvalidParameter(format!(
                "{} is the vault's own address",
                account
            )));
        }
        Ok(())
    }

    fn plan_yield(&self) -> VaultResult<YieldDistribution> {
        let asset = &self.state.underlying_asset;
        plan_distribution(
            &self.state.ledger,
            self.ctx.bank.balance_of(asset, &self.state.address),
            self.ctx.venue.position_value(&self.state.address, asset),
            self.state.treasury_fee_bps,
        )
    }

    fn execute_rebalance(&mut self) -> VaultResult<RebalanceReceipt> {
        let liquidity_before = self.state.ledger.liquidity_amount();
        let action = self.state.policy.compute_rebalance_action(&self.state.ledger);
        debug!(vault = self.state.id, %action, "executing rebalance");

        let fill = match action {
            RebalanceAction::Hold => None,
            RebalanceAction::Provide(amount) => Some(self.provide_to_venue(amount)?),
            RebalanceAction::Withdraw(amount) => Some(self.withdraw_from_venue(amount)?),
        };

        Ok(RebalanceReceipt {
            action,
            fill,
            liquidity_before,
            liquidity_after: self.state.ledger.liquidity_amount(),
            total_assets_after: self.state.ledger.total_assets_held(),
        })
    }

    fn provide_to_venue(&mut self, amount: u64) -> VaultResult<VenueFill> {
        let idle = self.state.ledger.idle_amount();
        if amount > idle {
            return Err(VaultError::InsufficientAssets {
                available: idle,
                requested: amount,
            });
        }

        let fill = self.ctx.venue.provide_liquidity(
            &self.state.address,
            &self.state.underlying_asset,
            amount,
            self.state.policy.max_slippage_bps,
        )?;

        let mut staged = self.state.ledger.clone();
        staged.move_to_liquidity(amount, fill.amount)?;
        if let Err(e) = self.check_fill(&fill) {
            let reversal = self.ctx.venue.withdraw_liquidity(
                &self.state.address,
                &self.state.underlying_asset,
                fill.amount,
                BPS_DENOMINATOR,
            );
            return Err(self.settle_rejected_fill(
                e,
                staged,
                fill.amount,
                reversal,
                AssetLedger::move_to_idle,
            ));
        }
        self.state.ledger = staged;

        info!(
            vault = self.state.id,
            sent = amount,
            provisioned = fill.amount,
            impact_bps = fill.price_impact_bps,
            "liquidity added"
        );
        self.pending.push(VaultEvent::LiquidityAdded {
            vault_id: self.state.id,
            sent: amount,
            provisioned: fill.amount,
            price_impact_bps: fill.price_impact_bps,
        });
        Ok(fill)
    }

    fn withdraw_from_venue(&mut self, amount: u64) -> VaultResult<VenueFill> {
        let liquidity = self.state.ledger.liquidity_amount();
        if amount > liquidity {
            return Err(VaultError::InsufficientAssets {
                available: liquidity,
                requested: amount,
            });
        }

        let fill = self.ctx.venue.withdraw_liquidity(
            &self.state.address,
            &self.state.underlying_asset,
            amount,
            self.state.policy.max_slippage_bps,
        )?;

        let mut staged = self.state.ledger.clone();
        staged.move_to_idle(amount, fill.amount)?;
        if let Err(e) = self.check_fill(&fill) {
            let reversal = self.ctx.venue.provide_liquidity(
                &self.state.address,
                &self.state.underlying_asset,
                fill.amount,
                BPS_DENOMINATOR,
            );
            return Err(self.settle_rejected_fill(
                e,
                staged,
                fill.amount,
                reversal,
                AssetLedger::move_to_liquidity,
            ));
        }
        self.state.ledger = staged;

        info!(
            vault = self.state.id,
            withdrawn = amount,
            returned = fill.amount,
            impact_bps = fill.price_impact_bps,
            "liquidity removed"
        );
        self.pending.push(VaultEvent::LiquidityRemoved {
            vault_id: self.state.id,
            withdrawn: amount,
            returned: fill.amount,
            price_impact_bps: fill.price_impact_bps,
        });
        Ok(fill)
    }

    /// Venues are expected to refuse out-of-bound fills themselves.
    fn check_fill(&self, fill: &VenueFill) -> VaultResult<()> {
        self.state.policy.check_fill(fill).map_err(|e| {
            warn!(
                vault = self.state.id,
                impact_bps = fill.price_impact_bps,
                max_bps = self.state.policy.max_slippage_bps,
                "venue settled a fill beyond the slippage bound"
            );
            e
        })
    }

    /// Books the outcome of reversing a fill that settled beyond the bound.
    ///
    /// `settled` already holds the out-of-bound move. A successful reversal
    /// of `sent` units is booked on top of it with `book_reversal`, so only
    /// the round-trip cost remains. A failed reversal leaves the move booked
    /// as settled. Either way the ledger matches custody and `rejection` is
    /// returned.
    fn settle_rejected_fill(
        &mut self,
        rejection: VaultError,
        mut settled: AssetLedger,
        sent: u64,
        reversal: Result<VenueFill, VenueError>,
        book_reversal: fn(&mut AssetLedger, u64, u64) -> VaultResult<()>,
    ) -> VaultError {
        match reversal {
            Ok(back) => {
                if let Err(e) = book_reversal(&mut settled, sent, back.amount) {
                    return e;
                }
                info!(
                    vault = self.state.id,
                    sent,
                    returned = back.amount,
                    "out-of-bound fill reversed"
                );
            }
            Err(e) => warn!(
                vault = self.state.id,
                sent,
                error = %e,
                "out-of-bound fill could not be reversed, booked as settled"
            ),
        }
        self.state.ledger = settled;
        rejection
    }

    fn record_rejection(&mut self, e: &VaultError) {
        let slippage = matches!(e, VaultError::SlippageExceeded { .. });
        warn!(vault = self.state.id, error = %e, slippage, "rebalance rejected");
        self.pending.push(VaultEvent::RebalanceRejected {
            vault_id: self.state.id,
            reason: e.to_string(),
            slippage,
        });
    }
}

/// `0x` + the first 20 bytes of a domain-separated BLAKE3 hash.
fn derive_address(context: &str, parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let hash = hasher.finalize();
    format!("0x{}", hex::encode(&hash.as_bytes()[..20]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::collaborators::{InMemoryBank, SimulatedVenue};
    use chrono::Duration;

    const ASSET: &str = "EVT";
    const OWNER: &str = "owner";

    struct Harness {
        bank: Arc<InMemoryBank>,
        venue: Arc<SimulatedVenue>,
        clock: Arc<ManualClock>,
        vault: Vault,
    }

    fn harness_with(config: RegistryConfig, params: VaultParams) -> Harness {
        let bank = Arc::new(InMemoryBank::new());
        let venue = Arc::new(SimulatedVenue::new(Arc::clone(&bank), 0));
        let clock = Arc::new(ManualClock::default());
        let ctx = VaultContext::new(bank.clone(), venue.clone(), clock.clone());
        let vault = Vault::create(1, OWNER, params, &config, ctx).unwrap();
        for who in ["alice", "bob"] {
            bank.mint(ASSET, who, 1_000_000).unwrap();
        }
        Harness {
            bank,
            venue,
            clock,
            vault,
        }
    }

    fn manual_harness() -> Harness {
        let config = RegistryConfig {
            auto_rebalance: false,
            ..RegistryConfig::default()
        };
        harness_with(config, VaultParams::new(ASSET, "evt-1", "Claim", "CLM"))
    }

    #[test]
    fn create_emits_event_and_derives_addresses() {
        let mut h = manual_harness();
        assert!(h.vault.address().starts_with("0x"));
        assert_eq!(h.vault.address().len(), 42);
        assert_ne!(h.vault.address(), h.vault.token_address());
        let events = h.vault.take_events();
        assert!(matches!(events[0], VaultEvent::VaultCreated { vault_id: 1, .. }));
        assert!(h.vault.take_events().is_empty());
    }

    #[test]
    fn create_rejects_bad_params() {
        let bank = Arc::new(InMemoryBank::new());
        let ctx = VaultContext::new(
            bank.clone(),
            Arc::new(SimulatedVenue::new(bank, 0)),
            Arc::new(ManualClock::default()),
        );
        let cfg = RegistryConfig::default();
        for params in [
            VaultParams::new(ASSET, "e", "", "CLM"),
            VaultParams::new(ASSET, "e", "Claim", ""),
            VaultParams::new(ASSET, "e", "Claim", "CLM").with_target_liquidity_bps(10_001),
            VaultParams::new(ASSET, "e", "Claim", "CLM").with_max_slippage_bps(10_001),
            VaultParams::new(ASSET, "e", "Claim", "CLM").with_expiry(StdDuration::ZERO),
        ] {
            assert!(matches!(
                Vault::create(1, OWNER, params, &cfg, ctx.clone()),
                Err(VaultError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn deposit_moves_funds_and_mints() {
        let mut h = manual_harness();
        let receipt = h.vault.deposit("alice", 1_000).unwrap();
        assert_eq!(receipt.shares_minted, 1_000);
        assert_eq!(receipt.auto_rebalance, None);
        assert_eq!(h.bank.balance(ASSET, h.vault.address()), 1_000);
        assert_eq!(h.bank.balance(ASSET, "alice"), 999_000);
    }

    #[test]
    fn failed_transfer_leaves_ledger_untouched() {
        let mut h = manual_harness();
        let before = h.vault.ledger().clone();
        let err = h.vault.deposit("carol", 500).unwrap_err();
        assert!(matches!(err, VaultError::TransferFailed(_)));
        assert_eq!(h.vault.ledger(), &before);
    }

    #[test]
    fn auto_rebalance_follows_deposit() {
        let mut h = harness_with(
            RegistryConfig::default(),
            VaultParams::new(ASSET, "evt-1", "Claim", "CLM"),
        );
        let receipt = h.vault.deposit("alice", 10_000).unwrap();
        match receipt.auto_rebalance {
            Some(AutoRebalance::Executed(r)) => {
                assert_eq!(r.action, RebalanceAction::Provide(8_000));
                assert_eq!(r.liquidity_after, 8_000);
            }
            other => panic!("unexpected auto rebalance: {:?}", other),
        }
        assert_eq!(h.venue.position_value(h.vault.address(), ASSET), 8_000);
    }

    #[test]
    fn auto_rebalance_failure_keeps_deposit() {
        let mut h = harness_with(
            RegistryConfig::default(),
            VaultParams::new(ASSET, "evt-1", "Claim", "CLM"),
        );
        h.venue.set_price_impact_bps(500);
        let receipt = h.vault.deposit("alice", 10_000).unwrap();
        assert!(matches!(
            receipt.auto_rebalance,
            Some(AutoRebalance::Failed { .. })
        ));
        assert_eq!(h.vault.ledger().total_assets_held(), 10_000);
        assert_eq!(h.vault.ledger().liquidity_amount(), 0);
        let events = h.vault.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            VaultEvent::RebalanceRejected { slippage: true, .. }
        )));
    }

    #[test]
    fn rebalance_is_owner_only() {
        let mut h = manual_harness();
        h.vault.deposit("alice", 10_000).unwrap();
        assert!(matches!(
            h.vault.rebalance("alice"),
            Err(VaultError::Unauthorized { .. })
        ));
        let r = h.vault.rebalance(OWNER).unwrap();
        assert_eq!(r.action, RebalanceAction::Provide(8_000));
        let again = h.vault.rebalance(OWNER).unwrap();
        assert!(again.action.is_hold());
    }

    #[test]
    fn rebalance_refused_after_expiry() {
        let mut h = manual_harness();
        h.vault.deposit("alice", 10_000).unwrap();
        h.clock.advance(Duration::days(8));
        assert_eq!(h.vault.rebalance(OWNER), Err(VaultError::VaultExpired));
    }

    #[test]
    fn withdrawal_unwinds_liquidity_when_idle_is_short() {
        let mut h = manual_harness();
        h.vault.deposit("alice", 10_000).unwrap();
        h.vault.rebalance(OWNER).unwrap();
        assert_eq!(h.vault.ledger().idle_amount(), 2_000);

        let receipt = h.vault.withdraw("alice", 5_000).unwrap();
        assert_eq!(receipt.assets_returned, 5_000);
        assert!(receipt.unwind.is_some());
        assert_eq!(h.bank.balance(ASSET, "alice"), 1_000_000 - 10_000 + 5_000);
        assert!(h.vault.ledger().is_consistent());
        assert_eq!(h.vault.ledger().total_assets_held(), 5_000);
    }

    #[test]
    fn deactivate_twice_fails() {
        let mut h = manual_harness();
        h.vault.deactivate(OWNER).unwrap();
        assert_eq!(h.vault.deactivate(OWNER), Err(VaultError::AlreadyDeactivated));
        assert_eq!(h.vault.deposit("alice", 1), Err(VaultError::VaultNotActive));
    }

    #[test]
    fn yield_pays_treasury_and_raises_share_value() {
        let mut h = manual_harness();
        h.vault.deposit("alice", 10_000).unwrap();
        h.vault.rebalance(OWNER).unwrap();
        h.venue.accrue_fees(h.vault.address(), ASSET, 1_000).unwrap();

        let plan = h.vault.distribute_yield(OWNER).unwrap();
        assert_eq!(plan.surplus, 1_000);
        assert_eq!(plan.treasury_fee, 5);
        assert_eq!(plan.distributed, 995);
        assert_eq!(h.bank.balance(ASSET, "treasury"), 5);
        assert_eq!(h.vault.ledger().total_assets_held(), 10_995);
        assert_eq!(h.vault.ledger().claim_supply(), 10_000);
        assert_eq!(h.vault.ledger().idle_amount(), h.bank.balance(ASSET, h.vault.address()));
        assert_eq!(h.vault.preview_redeem("alice"), 10_995);
    }

    #[test]
    fn fully_deployed_vault_funds_treasury_fee_from_venue() {
        let config = RegistryConfig {
            auto_rebalance: false,
            ..RegistryConfig::default()
        };
        let params =
            VaultParams::new(ASSET, "evt-1", "Claim", "CLM").with_target_liquidity_bps(10_000);
        let mut h = harness_with(config, params);
        h.vault.deposit("alice", 10_000).unwrap();
        h.vault.rebalance(OWNER).unwrap();
        assert_eq!(h.vault.ledger().idle_amount(), 0);
        h.venue.accrue_fees(h.vault.address(), ASSET, 1_000).unwrap();

        let plan = h.vault.distribute_yield(OWNER).unwrap();
        assert_eq!(plan.surplus, 1_000);
        assert_eq!(plan.treasury_fee, 5);
        assert_eq!(h.bank.balance(ASSET, "treasury"), 5);
        assert_eq!(h.vault.ledger().total_assets_held(), 10_995);
        assert_eq!(
            h.vault.ledger().idle_amount(),
            h.bank.balance(ASSET, h.vault.address())
        );
        assert_eq!(
            h.vault.ledger().liquidity_amount(),
            h.venue.position_value(h.vault.address(), ASSET)
        );
        let events = h.vault.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, VaultEvent::LiquidityRemoved { .. })));
        assert!(matches!(
            events.last(),
            Some(VaultEvent::YieldDistributed { treasury_fee: 5, .. })
        ));
    }

    #[test]
    fn vault_address_cannot_deposit_or_withdraw() {
        let mut h = manual_harness();
        h.vault.deposit("alice", 1_000).unwrap();
        let address = h.vault.address().to_string();
        let before = h.vault.ledger().clone();

        assert!(matches!(
            h.vault.deposit(&address, 1_000),
            Err(VaultError::InvalidParameter(_))
        ));
        assert!(matches!(
            h.vault.withdraw(&address, 1),
            Err(VaultError::InvalidParameter(_))
        ));
        assert_eq!(h.vault.ledger(), &before);
        assert_eq!(h.bank.balance(ASSET, &address), 1_000);
    }

    #[test]
    fn expired_vault_stays_active_until_deactivated() {
        let mut h = manual_harness();
        h.clock.advance(Duration::days(8));
        assert_eq!(h.vault.phase(), VaultPhase::Expired);
        assert!(h.vault.is_active());
        assert_eq!(h.vault.deposit("alice", 1_000), Err(VaultError::VaultExpired));

        h.vault.deactivate(OWNER).unwrap();
        assert!(!h.vault.is_active());
        assert_eq!(h.vault.phase(), VaultPhase::Deactivated);
    }

    #[test]
    fn snapshot_reflects_state() {
        let mut h = manual_harness();
        h.vault.deposit("alice", 3_000).unwrap();
        let snap = h.vault.snapshot();
        assert_eq!(snap.total_assets_held, 3_000);
        assert_eq!(snap.current_liquidity_bps, Some(0));
        assert!(snap.needs_rebalance);
        assert_eq!(snap.phase, VaultPhase::Active);
        assert_eq!(snap.owner, OWNER);
    }
}
