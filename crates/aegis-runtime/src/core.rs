//! `ExecutionCore`: the object graph wiring every collaborator crate
//! together and the single surface `aegis-cli` (and any future transport
//! layer) drives. Owns the durable pool and the hash-chained audit log;
//! every other component stays exactly as I/O-free as its own crate
//! promises, with persistence performed here, once, after each call.

use std::sync::Arc;

use aegis_audit::AuditWriter;
use aegis_db::DbError;
use aegis_execution::{ExecutionBackend, ExecutionRouter};
use aegis_engine::{AutonomousEngine, EngineError};
use aegis_lifecycle::{LifecycleError, LifecycleManager};
use aegis_mode::{ModeChangeError, ModeChanged, ModeOrchestrator};
use aegis_modularity::{CircuitBreaker, FlagRegistry, FlagStrategy, ModuleRegistry, ModuleSwapRejected};
use aegis_money::Amount;
use aegis_portfolio::PortfolioStore;
use aegis_pricefeed::PriceFeedCache;
use aegis_risk::SectorTable;
use aegis_schemas::{CloseReason, ExecutionMode, Position, PositionId, PortfolioSnapshot, RiskLimits, TradeProposal};
use aegis_sizer::LotSizeTable;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Failures surfaced while persisting a side effect of an otherwise
/// successful control-surface call. Never rolls back the call itself —
/// the in-memory/durable-log state the call already committed is the
/// source of truth; a failed audit append is logged and retried on the
/// next drain rather than treated as the call having failed.
#[derive(Debug)]
pub enum PersistError {
    Db(DbError),
    Audit(anyhow::Error),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Db(e) => write!(f, "{e}"),
            PersistError::Audit(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<DbError> for PersistError {
    fn from(e: DbError) -> Self {
        PersistError::Db(e)
    }
}

/// The full object graph (§5): Portfolio State Store, Price Feed Cache,
/// Execution Router, Position Lifecycle Manager, Autonomous Engine, Mode
/// Orchestrator, and the feature-flag/circuit-breaker modularity
/// substrate, behind the control-surface verbs of §7.
pub struct ExecutionCore {
    pub(crate) run_id: Uuid,
    pub(crate) pool: PgPool,
    pub(crate) store: PortfolioStore,
    pub(crate) router: Arc<ExecutionRouter>,
    pub(crate) lifecycle: Arc<LifecycleManager>,
    pub(crate) engine: AutonomousEngine,
    pub(crate) mode: ModeOrchestrator,
    pub(crate) flags: Mutex<FlagRegistry>,
    pub(crate) correlation_breaker: Arc<CircuitBreaker>,
    pub(crate) backend_registry: ModuleRegistry<dyn ExecutionBackend>,
    pub(crate) pricefeed: Arc<PriceFeedCache>,
    pub(crate) limits: RiskLimits,
    pub(crate) sectors: SectorTable,
    pub(crate) lot_sizes: LotSizeTable,
    pub(crate) audit: Mutex<AuditWriter>,
}

impl ExecutionCore {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn risk_limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn sectors(&self) -> &SectorTable {
        &self.sectors
    }

    pub fn lot_sizes(&self) -> &LotSizeTable {
        &self.lot_sizes
    }

    pub fn price_feed(&self) -> &Arc<PriceFeedCache> {
        &self.pricefeed
    }

    /// Starts the Autonomous Engine's three loops (§4.9).
    pub async fn start(&self) {
        self.engine.start().await;
    }

    /// Orderly shutdown: drains the Decision Loop, lets the Monitor Loop
    /// sweep once more, joins every task, then performs one final drain
    /// of whatever the engine queued in its last tick.
    pub async fn stop(&self) {
        self.engine.stop().await;
        if let Err(e) = self.drain_and_persist().await {
            tracing::error!(error = %e, "final drain on shutdown did not fully persist");
        }
    }

    pub fn get_portfolio_snapshot(&self) -> Arc<PortfolioSnapshot> {
        self.store.snapshot()
    }

    pub fn get_position(&self, id: PositionId) -> Option<Position> {
        self.store.get_position(id)
    }

    pub fn list_positions(&self) -> Vec<Position> {
        self.store.list_open_positions()
    }

    /// Submits a proposal through the Autonomous Engine's Decision Loop
    /// and persists the resulting risk decision (§6 `risk_decisions`).
    ///
    /// The engine's own control surface only ever returns the final
    /// `Position` on acceptance, or the violated checks on rejection — it
    /// never hands back the full `RiskDecision` it evaluated internally,
    /// since by the time a caller could read `sized_proposal`'s
    /// intermediate Kelly scalars the position may already be open against
    /// a different, newer snapshot. The record persisted here is
    /// therefore reconstructed rather than the gate's original output: a
    /// rejection carries every violated check verbatim (the case §8 cares
    /// about auditing in full), while an acceptance carries the sized
    /// quantity/value/leverage actually booked onto the position, not the
    /// Kelly/volatility intermediates the gate computed to get there.
    pub async fn submit_proposal(&self, proposal: TradeProposal) -> Result<Position, EngineError> {
        let proposal_json = serde_json::to_value(&proposal).unwrap_or(Value::Null);
        let outcome = self.engine.submit_proposal(proposal).await;

        let decision_json = match &outcome {
            Ok(position) => json!({
                "passed": true,
                "violated_checks": [],
                "booked_position": {
                    "instrument": position.instrument,
                    "side": position.side,
                    "quantity": position.quantity,
                    "entry_price": position.entry_price,
                    "entry_value": position.entry_value,
                    "leverage": position.leverage,
                    "stop_loss_price": position.stop_loss_price,
                    "take_profit_price": position.take_profit_price,
                },
            }),
            Err(EngineError::RiskRejected(checks)) => json!({
                "passed": false,
                "violated_checks": checks,
            }),
            Err(other) => json!({
                "passed": false,
                "refused_before_evaluation": other.to_string(),
            }),
        };

        if let Err(e) = aegis_db::append_risk_decision(&self.pool, &proposal_json, &decision_json).await {
            tracing::error!(error = %e, "failed to persist risk decision");
        }
        if let Err(e) = self.audit.lock().await.append(self.run_id, "risk", "risk_decision", decision_json) {
            tracing::error!(error = %e, "failed to append risk decision to audit log");
        }

        outcome
    }

    /// Closes a position outside the Monitor Loop's own sweep, e.g. an
    /// operator-initiated manual close.
    pub async fn close_position(
        &self,
        position_id: PositionId,
        reason: CloseReason,
        mark_price: Option<Amount>,
        now: DateTime<Utc>,
    ) -> Result<Position, LifecycleError> {
        self.lifecycle.close(position_id, reason, mark_price, now).await
    }

    /// Closes every open position with `EMERGENCY_CLOSE` and halts new
    /// opens until `clear_halt` (§4.9).
    pub async fn emergency_stop(&self, now: DateTime<Utc>) -> Vec<PositionId> {
        let closed = self.engine.emergency_stop(now).await;
        if let Err(e) = self.drain_and_persist().await {
            tracing::error!(error = %e, "drain after emergency_stop did not fully persist");
        }
        closed
    }

    pub fn clear_halt(&self) {
        self.lifecycle.clear_halt();
    }

    pub fn is_halted(&self) -> bool {
        self.lifecycle.is_halted()
    }

    /// Requests a PAPER <-> LIVE transition (§4.7), persisting the
    /// attempt — accepted or rejected — to `mode_audit` and the
    /// hash-chained log before returning.
    pub async fn set_mode(
        &self,
        new_mode: ExecutionMode,
        operator_token: &str,
        candidate: Arc<dyn ExecutionBackend>,
        now: DateTime<Utc>,
    ) -> Result<ModeChanged, ModeChangeError> {
        let open_positions = self.store.list_open_positions();
        let result = self
            .mode
            .request_mode(new_mode, operator_token, &open_positions, &self.limits, candidate.clone(), now)
            .await;

        if result.is_ok() {
            // The Execution Router already performed the authoritative swap
            // above; this mirrors it into the registry purely so the prior
            // backend stays reachable as an audited fallback for its grace
            // window (§4.10) — it never gates the router's own decision.
            match self
                .backend_registry
                .swap(candidate, |c| async move { c.health_check().await })
                .await
            {
                Ok(()) => {}
                Err(ModuleSwapRejected::FailedHealthCheck) => {
                    tracing::warn!("backend registry swap skipped: candidate failed its own health check again");
                }
            }
        }

        for t in self.mode.drain_transitions().await {
            if let Err(e) = aegis_db::append_mode_audit(
                &self.pool,
                &t.from.to_string(),
                &t.to.to_string(),
                &t.operator,
                t.accepted,
                t.reason.as_deref(),
            )
            .await
            {
                tracing::error!(error = %e, "failed to persist mode transition");
            }
            let payload = json!({
                "from": t.from.to_string(),
                "to": t.to.to_string(),
                "operator": t.operator,
                "accepted": t.accepted,
                "reason": t.reason,
                "at": t.at,
            });
            if let Err(e) = self.audit.lock().await.append(self.run_id, "mode", "mode_transition", payload) {
                tracing::error!(error = %e, "failed to append mode transition to audit log");
            }
        }

        result
    }

    pub fn active_mode(&self) -> impl std::future::Future<Output = ExecutionMode> + '_ {
        self.router.active_mode()
    }

    /// The backend instance displaced by the most recent mode swap, if
    /// still within its fallback window (§4.10). Informational only — the
    /// Execution Router is the only path that ever actually executes
    /// orders against it.
    pub async fn backend_fallback(&self) -> Option<Arc<dyn ExecutionBackend>> {
        self.backend_registry.fallback().await
    }

    /// Sets `name`'s evaluation strategy, persisting the before/after
    /// change to `flag_audit` and the hash-chained log.
    pub async fn set_feature_flag(&self, name: &str, strategy: FlagStrategy, operator: &str) -> Result<(), PersistError> {
        let mut flags = self.flags.lock().await;
        flags.set_flag(name, strategy, operator);
        for t in flags.drain_transitions() {
            let before_json = t.before.as_ref().map(|b| serde_json::to_value(b).unwrap_or(Value::Null));
            let after_json = serde_json::to_value(&t.after).unwrap_or(Value::Null);
            aegis_db::append_flag_audit(&self.pool, &t.flag_name, before_json.as_ref(), &after_json, &t.operator)
                .await?;
            let payload = json!({
                "flag_name": t.flag_name,
                "before": before_json,
                "after": after_json,
                "operator": t.operator,
                "at": t.at,
            });
            self.audit
                .lock()
                .await
                .append(self.run_id, "flags", "flag_changed", payload)
                .map_err(PersistError::Audit)?;
        }
        Ok(())
    }

    /// Evaluates `name` for `context_key` (§4.10). Unregistered flags
    /// default to off.
    pub async fn evaluate_flag(&self, name: &str, context_key: &str) -> bool {
        self.flags.lock().await.evaluate(name, context_key)
    }

    pub fn get_flag(&self) -> &Mutex<FlagRegistry> {
        &self.flags
    }

    /// Drains the engine's queued snapshots and the correlation breaker's
    /// state transitions into their durable tables and the hash-chained
    /// audit log. Called on an interval by `aegis-cli` and once more on
    /// `stop()`; idempotent on an empty queue.
    pub async fn drain_and_persist(&self) -> Result<(), PersistError> {
        for snapshot in self.engine.drain_snapshots().await {
            let snapshot_json = serde_json::to_value(&snapshot).map_err(|e| PersistError::Audit(anyhow::anyhow!(e)))?;
            aegis_db::append_portfolio_snapshot(&self.pool, &snapshot_json).await?;
            self.audit
                .lock()
                .await
                .append(self.run_id, "portfolio", "snapshot_taken", snapshot_json)
                .map_err(PersistError::Audit)?;
        }

        for t in self.correlation_breaker.drain_transitions() {
            aegis_db::append_breaker_audit(&self.pool, &t.breaker_name, &t.before.to_string(), &t.after.to_string())
                .await?;
            let payload = json!({
                "breaker_name": t.breaker_name,
                "before": t.before.to_string(),
                "after": t.after.to_string(),
                "at": t.at,
            });
            self.audit
                .lock()
                .await
                .append(self.run_id, "breaker", "breaker_transition", payload)
                .map_err(PersistError::Audit)?;
        }

        Ok(())
    }
}
