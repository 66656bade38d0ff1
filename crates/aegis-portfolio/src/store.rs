//! The single-writer Portfolio State Store actor (§4.1, §5).
//!
//! All mutation flows through one `tokio::spawn`ed task reading a bounded
//! `mpsc` command queue, matching the reference workspace's preference for
//! explicit actor boundaries over shared mutable state guarded by ad-hoc
//! locking. Readers never wait on the writer: they take a snapshot of an
//! `Arc<PortfolioSnapshot>` behind a `std::sync::RwLock`, so a slow reader
//! cannot stall the write path and a concurrent write never blocks a read.

use std::sync::{Arc, RwLock};

use aegis_db::DbError;
use aegis_money::Amount;
use aegis_schemas::{PortfolioEvent, PortfolioSnapshot, Position, PositionId};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};

use crate::error::PortfolioError;
use crate::state::Internal;

const COMMAND_QUEUE_DEPTH: usize = 1024;

enum Command {
    Apply {
        event: PortfolioEvent,
        at: DateTime<Utc>,
        reply: oneshot::Sender<Result<PortfolioSnapshot, PortfolioError>>,
    },
    Snapshot {
        at: DateTime<Utc>,
        reply: oneshot::Sender<PortfolioSnapshot>,
    },
}

/// Handle to the running actor. Cheap to clone; every clone shares the same
/// command queue and the same reader-side snapshot cell.
#[derive(Clone)]
pub struct PortfolioStore {
    commands: mpsc::Sender<Command>,
    latest: Arc<RwLock<Arc<PortfolioSnapshot>>>,
}

impl PortfolioStore {
    /// Starts a fresh store with no durable history, e.g. for a brand new
    /// deployment or for tests.
    pub fn opening(pool: PgPool, cash_balance: Amount, at: DateTime<Utc>) -> Self {
        let internal = Internal::opening(cash_balance, at);
        Self::spawn(pool, internal, at)
    }

    /// Rebuilds in-memory state from the durable log on restart (§4.1:
    /// "on restart, rebuild in-memory state from durable log").
    pub async fn restore(pool: PgPool, now: DateTime<Utc>) -> Result<Self, PortfolioError> {
        let committed = aegis_db::load_latest_committed_portfolio_state(&pool)
            .await
            .map_err(wrap_db)?;
        let state = match committed {
            Some(json) => serde_json::from_value(json)
                .map_err(|e| PortfolioError::InvariantViolated(format!("corrupt committed portfolio_state row: {e}")))?,
            None => aegis_schemas::PortfolioState::opening(Amount::ZERO, now),
        };

        let transitions = aegis_db::load_all_latest_transitions(&pool).await.map_err(wrap_db)?;
        let mut positions = std::collections::BTreeMap::new();
        for (id, json) in transitions {
            let position: Position = serde_json::from_value(json).map_err(|e| {
                PortfolioError::InvariantViolated(format!("corrupt position transition row for {id}: {e}"))
            })?;
            positions.insert(position.id, position);
        }

        let internal = Internal {
            state,
            positions,
            prices: std::collections::BTreeMap::new(),
        };
        Ok(Self::spawn(pool, internal, now))
    }

    fn spawn(pool: PgPool, internal: Internal, at: DateTime<Utc>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let latest = Arc::new(RwLock::new(Arc::new(internal.snapshot(at))));
        let actor_latest = Arc::clone(&latest);
        tokio::spawn(run_actor(pool, internal, rx, actor_latest));
        PortfolioStore { commands: tx, latest }
    }

    /// Lock-free read of the most recently published snapshot. Never
    /// contends with the writer task.
    pub fn snapshot(&self) -> Arc<PortfolioSnapshot> {
        Arc::clone(&self.latest.read().expect("portfolio snapshot lock poisoned"))
    }

    pub fn get_position(&self, id: PositionId) -> Option<Position> {
        self.snapshot().get_position(id).cloned()
    }

    pub fn list_open_positions(&self) -> Vec<Position> {
        self.snapshot().open_positions.clone()
    }

    /// Applies `event`, persisting it write-ahead before publishing the new
    /// snapshot (§4.1). On any error the store is left exactly as it was.
    pub async fn apply(&self, event: PortfolioEvent, at: DateTime<Utc>) -> Result<PortfolioSnapshot, PortfolioError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .try_send(Command::Apply { event, at, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PortfolioError::Overloaded,
                mpsc::error::TrySendError::Closed(_) => PortfolioError::ActorGone,
            })?;
        rx.await.map_err(|_| PortfolioError::ActorGone)?
    }

    /// Forces a fresh snapshot through the single writer, used by the
    /// snapshot loop (§4.9) so persisted snapshots are never torn.
    pub async fn snapshot_via_actor(&self, at: DateTime<Utc>) -> Result<PortfolioSnapshot, PortfolioError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .try_send(Command::Snapshot { at, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => PortfolioError::Overloaded,
                mpsc::error::TrySendError::Closed(_) => PortfolioError::ActorGone,
            })?;
        rx.await.map_err(|_| PortfolioError::ActorGone)
    }
}

fn wrap_db(e: DbError) -> PortfolioError {
    PortfolioError::Durable(anyhow::anyhow!(e))
}

async fn run_actor(
    pool: PgPool,
    mut internal: Internal,
    mut rx: mpsc::Receiver<Command>,
    latest: Arc<RwLock<Arc<PortfolioSnapshot>>>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Apply { event, at, reply } => {
                let result = apply_one(&pool, &internal, &event).await;
                match result {
                    Ok(next) => {
                        let snapshot = next.snapshot(at);
                        *latest.write().expect("portfolio snapshot lock poisoned") = Arc::new(snapshot.clone());
                        internal = next;
                        let _ = reply.send(Ok(snapshot));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "portfolio event rejected, state unchanged");
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Snapshot { at, reply } => {
                let snapshot = internal.snapshot(at);
                *latest.write().expect("portfolio snapshot lock poisoned") = Arc::new(snapshot.clone());
                let _ = reply.send(snapshot);
            }
        }
    }
}

/// One write-ahead step: insert a pending row, apply in-memory (which
/// re-verifies every invariant), and only then flip the row to committed
/// and append the position transition. A crash between the pending insert
/// and the commit leaves the row `pending` forever — the in-memory state
/// it describes was never published, so nothing was half-applied.
async fn apply_one(pool: &PgPool, internal: &Internal, event: &PortfolioEvent) -> Result<Internal, PortfolioError> {
    let next = internal.apply(event)?;

    let state_json = serde_json::to_value(&next.state)
        .map_err(|e| PortfolioError::Durable(anyhow::anyhow!(e)))?;
    let pending_id = aegis_db::write_portfolio_state_pending(pool, &state_json)
        .await
        .map_err(wrap_db)?;

    if let Some(position_id) = touched_position(event) {
        if let Some(position) = next.get_position(position_id) {
            let transition_json =
                serde_json::to_value(&position).map_err(|e| PortfolioError::Durable(anyhow::anyhow!(e)))?;
            aegis_db::append_position_transition(pool, position_id.0, &transition_json)
                .await
                .map_err(wrap_db)?;
        }
    }

    aegis_db::commit_portfolio_state(pool, pending_id).await.map_err(wrap_db)?;
    Ok(next)
}

fn touched_position(event: &PortfolioEvent) -> Option<PositionId> {
    match event {
        PortfolioEvent::PositionOpened { position, .. } => Some(position.id),
        PortfolioEvent::PositionClosed { id, .. } => Some(*id),
        _ => None,
    }
}
