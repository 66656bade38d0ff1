//! Autonomous Engine (C9, §4.9): three cooperating `tokio` tasks — Decision
//! Loop, Monitor Loop, Snapshot Loop — connected to their collaborators
//! only through message channels, never through shared mutable state
//! (§5: "independent tasks; they share no mutable state, only message
//! channels to the Store and Router").
//!
//! Like the Mode Orchestrator and the Modularity Substrate, the Snapshot
//! Loop is I/O-free: it forces a fresh snapshot through the Portfolio State
//! Store's single writer and queues it internally, leaving persistence to
//! whoever drains it (`aegis-runtime`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use aegis_lifecycle::LifecycleManager;
use aegis_modularity::CircuitBreaker;
use aegis_money::Ratio;
use aegis_portfolio::PortfolioStore;
use aegis_pricefeed::PriceFeedCache;
use aegis_risk::{CorrelationOracle, SectorTable};
use aegis_schemas::{CloseReason, Position, PortfolioSnapshot, PositionId, RiskLimits, TradeProposal, ViolatedCheck};
use aegis_sizer::LotSizeTable;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Failures surfaced by the Autonomous Engine's control surface (§7).
#[derive(Debug)]
pub enum EngineError {
    /// The engine has not been `start()`-ed, or `stop()` has already run.
    NotRunning,
    /// The Position Lifecycle Manager is under an emergency halt; no new
    /// proposals are accepted (§4.8, §4.9).
    Halted,
    /// The Risk Gate rejected the proposal — every violated check, not
    /// just the first (§4.3, §8 "Gate Completeness").
    RiskRejected(Vec<ViolatedCheck>),
    /// The Lifecycle Manager failed to open the position after the Risk
    /// Gate passed it.
    Lifecycle(aegis_lifecycle::LifecycleError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotRunning => write!(f, "autonomous engine is not running"),
            EngineError::Halted => write!(f, "autonomous engine is under emergency halt"),
            EngineError::RiskRejected(checks) => {
                write!(f, "risk gate rejected proposal: {} check(s) violated", checks.len())
            }
            EngineError::Lifecycle(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Lifecycle(e) => Some(e),
            _ => None,
        }
    }
}

enum DecisionRequest {
    Propose { proposal: TradeProposal, reply: oneshot::Sender<Result<Position, EngineError>> },
}

/// Everything the three loops need, shared behind an `Arc` rather than
/// owned by any single loop.
struct EngineContext {
    store: PortfolioStore,
    lifecycle: Arc<LifecycleManager>,
    limits: RiskLimits,
    sectors: SectorTable,
    lot_sizes: LotSizeTable,
    oracle: Arc<dyn CorrelationOracle>,
    correlation_breaker: Arc<CircuitBreaker>,
    pricefeed: Arc<PriceFeedCache>,
    monitor_interval: StdDuration,
    snapshot_interval: StdDuration,
    pending_snapshots: Mutex<Vec<PortfolioSnapshot>>,
}

/// The Autonomous Engine (C9). Holds weak references to every collaborator
/// it drives — the Store, the Lifecycle Manager, the Risk Gate's inputs —
/// and owns none of their data (§3 "Ownership").
pub struct AutonomousEngine {
    ctx: Arc<EngineContext>,
    proposal_tx: Mutex<Option<mpsc::Sender<DecisionRequest>>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

#[allow(clippy::too_many_arguments)]
impl AutonomousEngine {
    pub fn new(
        store: PortfolioStore,
        lifecycle: Arc<LifecycleManager>,
        limits: RiskLimits,
        sectors: SectorTable,
        lot_sizes: LotSizeTable,
        oracle: Arc<dyn CorrelationOracle>,
        correlation_breaker: Arc<CircuitBreaker>,
        pricefeed: Arc<PriceFeedCache>,
    ) -> Self {
        let monitor_interval = limits.monitor_interval.to_std().unwrap_or(StdDuration::from_secs(1));
        let snapshot_interval = limits.snapshot_interval.to_std().unwrap_or(StdDuration::from_secs(60));
        let (shutdown_tx, _) = watch::channel(false);
        AutonomousEngine {
            ctx: Arc::new(EngineContext {
                store,
                lifecycle,
                limits,
                sectors,
                lot_sizes,
                oracle,
                correlation_breaker,
                pricefeed,
                monitor_interval,
                snapshot_interval,
                pending_snapshots: Mutex::new(Vec::new()),
            }),
            proposal_tx: Mutex::new(None),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Spawns the three loops. Idempotent: calling `start` again while
    /// already running is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(false);

        let (tx, rx) = mpsc::channel(256);
        *self.proposal_tx.lock().await = Some(tx);

        let decision_handle = tokio::spawn(decision_loop(Arc::clone(&self.ctx), rx));
        let monitor_handle = tokio::spawn(monitor_loop(Arc::clone(&self.ctx), self.shutdown_tx.subscribe()));
        let snapshot_handle = tokio::spawn(snapshot_loop(Arc::clone(&self.ctx), self.shutdown_tx.subscribe()));

        *self.handles.lock().await = vec![decision_handle, monitor_handle, snapshot_handle];
        tracing::info!("autonomous engine started");
    }

    /// Submits a proposal to the Decision Loop and awaits its outcome.
    pub async fn submit_proposal(&self, proposal: TradeProposal) -> Result<Position, EngineError> {
        let tx = {
            let guard = self.proposal_tx.lock().await;
            guard.clone().ok_or(EngineError::NotRunning)?
        };
        let (reply, rx) = oneshot::channel();
        tx.send(DecisionRequest::Propose { proposal, reply }).await.map_err(|_| EngineError::NotRunning)?;
        rx.await.map_err(|_| EngineError::NotRunning)?
    }

    /// Closes all open positions with `EMERGENCY_CLOSE` and halts the
    /// Lifecycle Manager, refusing new opens until explicitly cleared
    /// (§4.9). Does not stop the Monitor/Snapshot loops — monitoring
    /// continues under a halt, only new work is refused.
    pub async fn emergency_stop(&self, now: DateTime<Utc>) -> Vec<PositionId> {
        let prices = self.ctx.pricefeed.fresh_snapshot(now).await;
        self.ctx
            .lifecycle
            .emergency_stop(&prices, now)
            .await
            .into_iter()
            .map(|outcome| outcome.position_id)
            .collect()
    }

    /// Orderly shutdown (§4.9): stops accepting new proposals, lets the
    /// Decision Loop drain whatever is already queued, lets the Monitor
    /// Loop perform one final sweep, then joins every task. Clean
    /// shutdown never leaves a position `PENDING` — the Decision Loop only
    /// ever produces `OPEN` or nothing (`open` either fully succeeds or
    /// fails before any state is recorded).
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.proposal_tx.lock().await.take();
        let _ = self.shutdown_tx.send(true);

        let handles = { self.handles.lock().await.drain(..).collect::<Vec<_>>() };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("autonomous engine stopped");
    }

    /// Drains every snapshot queued by the Snapshot Loop since the last
    /// drain, for the caller to persist (`aegis-db::append_portfolio_snapshot`).
    pub async fn drain_snapshots(&self) -> Vec<PortfolioSnapshot> {
        std::mem::take(&mut *self.ctx.pending_snapshots.lock().await)
    }
}

async fn decision_loop(ctx: Arc<EngineContext>, mut rx: mpsc::Receiver<DecisionRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            DecisionRequest::Propose { proposal, reply } => {
                let outcome = handle_proposal(&ctx, proposal).await;
                let _ = reply.send(outcome);
            }
        }
    }
    tracing::info!("decision loop drained and exiting");
}

async fn handle_proposal(ctx: &EngineContext, proposal: TradeProposal) -> Result<Position, EngineError> {
    if ctx.lifecycle.is_halted() {
        return Err(EngineError::Halted);
    }

    let now = Utc::now();
    let snapshot = ctx.store.snapshot();
    let decision = aegis_risk::evaluate(
        &proposal,
        &snapshot,
        &ctx.limits,
        &ctx.sectors,
        &ctx.lot_sizes,
        ctx.oracle.as_ref(),
        &ctx.correlation_breaker,
        now,
    )
    .await;

    if !decision.passed {
        return Err(EngineError::RiskRejected(decision.violated_checks));
    }
    let sized = decision.sized_proposal.expect("a passed RiskDecision always carries a sized proposal");

    let client_order_id = PositionId::new().to_string();
    ctx.lifecycle
        .open(
            &sized,
            client_order_id,
            ctx.limits.max_hold_duration,
            aegis_lifecycle::TrailingStopPolicy::off(),
            now,
        )
        .await
        .map_err(EngineError::Lifecycle)
}

async fn monitor_loop(ctx: Arc<EngineContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ctx.monitor_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                run_monitor_sweep(&ctx).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    // One final sweep before exiting (§4.9: "lets the monitor
                    // loop do one final sweep").
                    run_monitor_sweep(&ctx).await;
                    break;
                }
            }
        }
    }
    tracing::info!("monitor loop exiting after final sweep");
}

async fn run_monitor_sweep(ctx: &EngineContext) {
    let now = Utc::now();
    let prices = ctx.pricefeed.fresh_snapshot(now).await;
    let outcomes = ctx.lifecycle.monitor_tick(&prices, now).await;
    for outcome in &outcomes {
        tracing::info!(position = %outcome.position_id, reason = %reason_label(outcome.reason), "monitor tick closed position");
    }
}

fn reason_label(reason: CloseReason) -> &'static str {
    match reason {
        CloseReason::ClosedByTarget => "CLOSED_BY_TARGET",
        CloseReason::StoppedOut => "STOPPED_OUT",
        CloseReason::TimedOut => "TIMED_OUT",
        CloseReason::ManualClose => "MANUAL_CLOSE",
        CloseReason::EmergencyClose => "EMERGENCY_CLOSE",
    }
}

async fn snapshot_loop(ctx: Arc<EngineContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(ctx.snapshot_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                take_snapshot(&ctx).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("snapshot loop exiting");
}

async fn take_snapshot(ctx: &EngineContext) {
    let now = Utc::now();
    match ctx.store.snapshot_via_actor(now).await {
        Ok(snapshot) => ctx.pending_snapshots.lock().await.push(snapshot),
        Err(e) => tracing::error!(error = %e, "snapshot loop failed to force a fresh snapshot"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_execution::ExecutionRouter;
    use aegis_money::Amount;
    use aegis_risk::CorrelationError;
    use aegis_schemas::{ExecutionMode, Instrument, Side};
    use async_trait::async_trait;

    struct ZeroOracle;

    #[async_trait]
    impl CorrelationOracle for ZeroOracle {
        async fn correlation(&self, _a: &Instrument, _b: &Instrument) -> Result<Ratio, CorrelationError> {
            Ok(Ratio::ZERO)
        }
    }

    fn proposal() -> TradeProposal {
        TradeProposal {
            instrument: Instrument::new("BTCZAR"),
            side: Side::Long,
            reference_price: Amount::from_units_cents(1_200_000, 0),
            advisory_size_pct: Ratio::from_decimal_str("0.05").unwrap(),
            advisory_leverage: Ratio::ONE,
            advisory_stop_loss_pct: Ratio::from_decimal_str("0.02").unwrap(),
            advisory_take_profit_pct: Ratio::from_decimal_str("0.06").unwrap(),
            confidence: Ratio::from_decimal_str("0.85").unwrap(),
            volatility_forecast_annualized: Ratio::from_decimal_str("0.40").unwrap(),
            rationale: "reference scenario".to_string(),
        }
    }

    async fn engine() -> AutonomousEngine {
        let pool = sqlx::PgPool::connect_lazy("postgres://unused/unused").unwrap();
        let store = PortfolioStore::opening(pool, Amount::from_units_cents(1_000_000, 0), Utc::now());
        let backend = Arc::new(aegis_broker_paper::PaperBroker::new(Ratio::ZERO));
        let router = Arc::new(ExecutionRouter::new(backend, ExecutionMode::Paper, chrono::Duration::seconds(5)));
        let lifecycle = Arc::new(LifecycleManager::new(store.clone(), router, 3));
        let pricefeed = Arc::new(PriceFeedCache::new(chrono::Duration::seconds(60)));
        pricefeed.record_price(Instrument::new("BTCZAR"), Amount::from_units_cents(1_200_000, 0), Utc::now()).await;
        let breaker = Arc::new(CircuitBreaker::new("correlation", aegis_modularity::BreakerConfig::sane_defaults()));
        AutonomousEngine::new(
            store,
            lifecycle,
            RiskLimits::sane_defaults(),
            SectorTable::new(),
            LotSizeTable::new(),
            Arc::new(ZeroOracle),
            breaker,
            pricefeed,
        )
    }

    #[tokio::test]
    async fn submit_proposal_before_start_is_not_running() {
        let engine = engine().await;
        let err = engine.submit_proposal(proposal()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotRunning));
    }

    #[tokio::test]
    async fn accepted_proposal_opens_a_position() {
        let engine = engine().await;
        engine.start().await;
        let position = engine.submit_proposal(proposal()).await.unwrap();
        assert!(position.status.is_open());
        engine.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_the_decision_loop_and_rejects_further_work() {
        let engine = engine().await;
        engine.start().await;
        engine.submit_proposal(proposal()).await.unwrap();
        engine.stop().await;
        let err = engine.submit_proposal(proposal()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotRunning));
    }
}
