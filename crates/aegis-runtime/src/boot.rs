//! Boot sequencing: load config, connect the durable store, resolve the
//! requested execution backend, and assemble an [`ExecutionCore`]. The
//! exit-code taxonomy (§9) lives on [`BootError::exit_code`] so
//! `aegis-cli` never has to duplicate the mapping.

use std::sync::Arc;

use aegis_broker_live::LiveBroker;
use aegis_broker_paper::PaperBroker;
use aegis_config::secrets::LiveExchangeSecrets;
use aegis_db::DbError;
use aegis_execution::{ExecutionBackend, ExecutionRouter};
use aegis_lifecycle::LifecycleManager;
use aegis_modularity::{BreakerConfig, CircuitBreaker, FlagRegistry, ModuleRegistry};
use aegis_mode::ModeOrchestrator;
use aegis_money::{Amount, Ratio};
use aegis_portfolio::PortfolioStore;
use aegis_pricefeed::PriceFeedCache;
use aegis_risk::SectorTable;
use aegis_schemas::{ExecutionMode, RiskLimits};
use aegis_sizer::LotSizeTable;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::ExecutionCore;
use crate::oracle::NullCorrelationOracle;

/// Everything a boot needs beyond what's already layered into
/// `RiskLimits` by `aegis-config`. `aegis-cli` builds this from layered
/// YAML plus environment secrets before calling [`boot`].
pub struct BootConfig {
    pub risk_limits: RiskLimits,
    pub sectors: SectorTable,
    pub lot_sizes: LotSizeTable,
    pub requested_mode: ExecutionMode,
    pub initial_cash_balance: Amount,
    pub paper_slippage_bps: Ratio,
    pub live_base_url: Option<String>,
    pub live_exchange_secrets: Option<LiveExchangeSecrets>,
    pub operator_token: Option<String>,
    pub swap_deadline: chrono::Duration,
    pub fallback_window: chrono::Duration,
    pub audit_log_path: String,
    pub hash_chain_audit: bool,
}

/// Boot-time failures, mapped onto the process exit-code taxonomy (§9):
/// 0 clean shutdown, 10 config invalid (never constructed here —
/// `aegis-cli` catches that before calling `boot`), 20 durable store
/// unavailable, 30 missing operator/live credentials for the requested
/// mode, 40 an unrecoverable invariant violation.
#[derive(Debug)]
pub enum BootError {
    Durable(DbError),
    OperatorTokenMissing,
    LiveCredentialsMissing,
    InvalidBootTarget(ExecutionMode),
    InvariantViolated(String),
    Audit(anyhow::Error),
}

impl std::fmt::Display for BootError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootError::Durable(e) => write!(f, "durable store unavailable at boot: {e}"),
            BootError::OperatorTokenMissing => write!(f, "operator token required for a live boot is not configured"),
            BootError::LiveCredentialsMissing => write!(f, "live exchange credentials required for a live boot are not configured"),
            BootError::InvalidBootTarget(mode) => write!(f, "{mode} is not a valid boot target"),
            BootError::InvariantViolated(msg) => write!(f, "invariant violated at boot: {msg}"),
            BootError::Audit(e) => write!(f, "audit log unavailable at boot: {e}"),
        }
    }
}

impl std::error::Error for BootError {}

impl BootError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BootError::Durable(_) => 20,
            BootError::OperatorTokenMissing | BootError::LiveCredentialsMissing => 30,
            BootError::InvalidBootTarget(_) | BootError::InvariantViolated(_) | BootError::Audit(_) => 40,
        }
    }
}

impl From<DbError> for BootError {
    fn from(e: DbError) -> Self {
        BootError::Durable(e)
    }
}

/// Connects the durable store, restores (or opens) portfolio state,
/// resolves the requested execution backend, and wires the full object
/// graph. Does not start the Autonomous Engine's loops — call
/// `ExecutionCore::start` once the caller is ready to run.
pub async fn boot(config: BootConfig, now: DateTime<Utc>) -> Result<ExecutionCore, BootError> {
    let pool = aegis_db::connect_from_env().await?;
    aegis_db::migrate(&pool).await?;

    // `PortfolioStore::restore` silently defaults to zero cash when no
    // committed row exists yet; check directly so a fresh deployment
    // actually gets the configured opening balance instead of losing it
    // to that default.
    let store = match aegis_db::load_latest_committed_portfolio_state(&pool).await? {
        Some(_) => PortfolioStore::restore(pool.clone(), now)
            .await
            .map_err(|e| BootError::InvariantViolated(e.to_string()))?,
        None => PortfolioStore::opening(pool.clone(), config.initial_cash_balance, now),
    };

    let pricefeed = Arc::new(PriceFeedCache::new(config.risk_limits.max_price_age));

    let initial_backend: Arc<dyn ExecutionBackend> = match config.requested_mode {
        ExecutionMode::Paper => Arc::new(PaperBroker::new(config.paper_slippage_bps)),
        ExecutionMode::Live => {
            let operator_token = config.operator_token.clone().ok_or(BootError::OperatorTokenMissing)?;
            if operator_token.is_empty() {
                return Err(BootError::OperatorTokenMissing);
            }
            let secrets = config.live_exchange_secrets.clone().ok_or(BootError::LiveCredentialsMissing)?;
            let base_url = config.live_base_url.clone().ok_or(BootError::LiveCredentialsMissing)?;
            let live: Arc<dyn ExecutionBackend> = Arc::new(LiveBroker::new(base_url, secrets));
            if !live.health_check().await {
                return Err(BootError::InvariantViolated(
                    "live exchange adapter failed its boot-time health check".to_string(),
                ));
            }
            live
        }
        ExecutionMode::Transitioning => return Err(BootError::InvalidBootTarget(ExecutionMode::Transitioning)),
    };

    let backend_registry = ModuleRegistry::new("execution_backend", initial_backend.clone(), config.fallback_window);
    let router = Arc::new(ExecutionRouter::new(initial_backend, config.requested_mode, config.swap_deadline));
    let lifecycle = Arc::new(LifecycleManager::new(store.clone(), router.clone(), config.risk_limits.max_close_attempts));
    let correlation_breaker = Arc::new(CircuitBreaker::new("correlation", BreakerConfig::sane_defaults()));
    let oracle: Arc<dyn aegis_risk::CorrelationOracle> = Arc::new(NullCorrelationOracle);

    let engine = aegis_engine::AutonomousEngine::new(
        store.clone(),
        lifecycle.clone(),
        config.risk_limits.clone(),
        config.sectors.clone(),
        config.lot_sizes.clone(),
        oracle,
        correlation_breaker.clone(),
        pricefeed.clone(),
    );

    // An absent operator token is only fatal for a requested live boot
    // (above); registering an empty token here just means every future
    // live transition is refused, never that this boot itself fails.
    let registered_operator_token = config.operator_token.clone().unwrap_or_default();
    let mode = ModeOrchestrator::new(router.clone(), registered_operator_token);

    let audit = aegis_audit::AuditWriter::new(&config.audit_log_path, config.hash_chain_audit).map_err(BootError::Audit)?;

    Ok(ExecutionCore {
        run_id: Uuid::new_v4(),
        pool,
        store,
        router,
        lifecycle,
        engine,
        mode,
        flags: Mutex::new(FlagRegistry::new()),
        correlation_breaker,
        backend_registry,
        pricefeed,
        limits: config.risk_limits,
        sectors: config.sectors,
        lot_sizes: config.lot_sizes,
        audit: Mutex::new(audit),
    })
}
