//! Durable Postgres-backed persistence for the portfolio risk and execution
//! core: the seven logical tables of §6, each as a real table behind `sqlx`
//! migrations, with the write-ahead commit-marker pattern the Portfolio
//! State Store relies on for crash safety (§4.1).

mod error;

pub use error::DbError;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub const ENV_DB_URL: &str = "AEGIS_DATABASE_URL";

/// Connect using `AEGIS_DATABASE_URL`. Fatal at boot if unset or
/// unreachable (`aegis-cli` exit code 20).
pub async fn connect_from_env() -> Result<PgPool, DbError> {
    let url = std::env::var(ENV_DB_URL).map_err(|_| DbError::MissingEnvVar(ENV_DB_URL))?;
    PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .map_err(DbError::Connect)
}

/// Apply embedded migrations. Idempotent on an already-migrated database.
pub async fn migrate(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(DbError::Migrate)
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub reachable: bool,
    pub applied_migrations: i64,
}

pub async fn status(pool: &PgPool) -> Result<DbStatus, DbError> {
    let row = sqlx::query("SELECT count(*) AS n FROM _sqlx_migrations")
        .fetch_one(pool)
        .await
        .map_err(|source| DbError::Query {
            context: "query migration count",
            source,
        })?;
    let n: i64 = row.try_get("n").unwrap_or(0);
    Ok(DbStatus {
        reachable: true,
        applied_migrations: n,
    })
}

// ---------------------------------------------------------------------------
// portfolio_state — write-ahead singleton
// ---------------------------------------------------------------------------

/// Insert a pending portfolio-state row. Returns its id so the caller can
/// flip it to `committed` once the in-memory mutation has also succeeded.
pub async fn write_portfolio_state_pending(
    pool: &PgPool,
    state_json: &Value,
) -> Result<i64, DbError> {
    let row = sqlx::query(
        "INSERT INTO portfolio_state (state_json, status) VALUES ($1, 'pending') RETURNING id",
    )
    .bind(state_json)
    .fetch_one(pool)
    .await
    .map_err(|source| DbError::Query {
        context: "insert pending portfolio_state",
        source,
    })?;
    Ok(row.try_get("id").unwrap_or_default())
}

/// Flip a pending portfolio-state row to `committed`. Called only after the
/// corresponding in-memory `apply()` has re-verified invariants.
pub async fn commit_portfolio_state(pool: &PgPool, id: i64) -> Result<(), DbError> {
    sqlx::query("UPDATE portfolio_state SET status = 'committed', committed_at = now() WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .map_err(|source| DbError::Query {
            context: "commit portfolio_state",
            source,
        })?;
    Ok(())
}

/// The most recent committed portfolio-state row, used to rebuild
/// in-memory state on restart. `None` on a freshly migrated, empty store.
pub async fn load_latest_committed_portfolio_state(
    pool: &PgPool,
) -> Result<Option<Value>, DbError> {
    let row = sqlx::query(
        "SELECT state_json FROM portfolio_state WHERE status = 'committed' ORDER BY id DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .map_err(|source| DbError::Query {
        context: "load latest committed portfolio_state",
        source,
    })?;
    Ok(row.map(|r| r.try_get("state_json").unwrap_or(Value::Null)))
}

// ---------------------------------------------------------------------------
// positions — append-only transitions
// ---------------------------------------------------------------------------

pub async fn append_position_transition(
    pool: &PgPool,
    position_id: Uuid,
    transition_json: &Value,
) -> Result<(), DbError> {
    sqlx::query("INSERT INTO positions (position_id, transition_json) VALUES ($1, $2)")
        .bind(position_id)
        .bind(transition_json)
        .execute(pool)
        .await
        .map_err(|source| DbError::Query {
            context: "append position transition",
            source,
        })?;
    Ok(())
}

pub async fn load_position_transitions(
    pool: &PgPool,
    position_id: Uuid,
) -> Result<Vec<Value>, DbError> {
    let rows = sqlx::query("SELECT transition_json FROM positions WHERE position_id = $1 ORDER BY id ASC")
        .bind(position_id)
        .fetch_all(pool)
        .await
        .map_err(|source| DbError::Query {
            context: "load position transitions",
            source,
        })?;
    Ok(rows
        .into_iter()
        .map(|r| r.try_get("transition_json").unwrap_or(Value::Null))
        .collect())
}

/// Every position's last transition, in insertion order of first
/// appearance — the basis for rebuilding the open-position set on restart.
pub async fn load_all_latest_transitions(pool: &PgPool) -> Result<Vec<(Uuid, Value)>, DbError> {
    let rows = sqlx::query(
        "SELECT DISTINCT ON (position_id) position_id, transition_json \
         FROM positions ORDER BY position_id, id DESC",
    )
    .fetch_all(pool)
    .await
    .map_err(|source| DbError::Query {
        context: "load all latest position transitions",
        source,
    })?;
    Ok(rows
        .into_iter()
        .map(|r| {
            let id: Uuid = r.try_get("position_id").unwrap_or_default();
            let json: Value = r.try_get("transition_json").unwrap_or(Value::Null);
            (id, json)
        })
        .collect())
}

// ---------------------------------------------------------------------------
// mode_audit
// ---------------------------------------------------------------------------

pub async fn append_mode_audit(
    pool: &PgPool,
    from_mode: &str,
    to_mode: &str,
    operator: &str,
    accepted: bool,
    reason: Option<&str>,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO mode_audit (from_mode, to_mode, operator, accepted, reason) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(from_mode)
    .bind(to_mode)
    .bind(operator)
    .bind(accepted)
    .bind(reason)
    .execute(pool)
    .await
    .map_err(|source| DbError::Query {
        context: "append mode_audit",
        source,
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// risk_decisions
// ---------------------------------------------------------------------------

pub async fn append_risk_decision(
    pool: &PgPool,
    proposal_json: &Value,
    decision_json: &Value,
) -> Result<(), DbError> {
    sqlx::query("INSERT INTO risk_decisions (proposal_json, decision_json) VALUES ($1, $2)")
        .bind(proposal_json)
        .bind(decision_json)
        .execute(pool)
        .await
        .map_err(|source| DbError::Query {
            context: "append risk_decisions",
            source,
        })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// portfolio_snapshots
// ---------------------------------------------------------------------------

pub async fn append_portfolio_snapshot(
    pool: &PgPool,
    snapshot_json: &Value,
) -> Result<(), DbError> {
    sqlx::query("INSERT INTO portfolio_snapshots (snapshot_json) VALUES ($1)")
        .bind(snapshot_json)
        .execute(pool)
        .await
        .map_err(|source| DbError::Query {
            context: "append portfolio_snapshots",
            source,
        })?;
    Ok(())
}

pub async fn load_latest_snapshot_at(pool: &PgPool) -> Result<Option<DateTime<Utc>>, DbError> {
    let row = sqlx::query("SELECT at FROM portfolio_snapshots ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(|source| DbError::Query {
            context: "load latest snapshot timestamp",
            source,
        })?;
    Ok(row.map(|r| r.try_get("at").unwrap_or_else(|_| Utc::now())))
}

// ---------------------------------------------------------------------------
// flag_audit / breaker_audit
// ---------------------------------------------------------------------------

pub async fn append_flag_audit(
    pool: &PgPool,
    flag_name: &str,
    before_json: Option<&Value>,
    after_json: &Value,
    operator: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO flag_audit (flag_name, before_json, after_json, operator) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(flag_name)
    .bind(before_json)
    .bind(after_json)
    .bind(operator)
    .execute(pool)
    .await
    .map_err(|source| DbError::Query {
        context: "append flag_audit",
        source,
    })?;
    Ok(())
}

pub async fn append_breaker_audit(
    pool: &PgPool,
    breaker_name: &str,
    before_state: &str,
    after_state: &str,
) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO breaker_audit (breaker_name, before_state, after_state) VALUES ($1, $2, $3)",
    )
    .bind(breaker_name)
    .bind(before_state)
    .bind(after_state)
    .execute(pool)
    .await
    .map_err(|source| DbError::Query {
        context: "append breaker_audit",
        source,
    })?;
    Ok(())
}
