use std::sync::Arc;

use aegis_money::{Amount, Ratio};
use aegis_risk::SectorTable;
use aegis_runtime::BootConfig;
use aegis_schemas::ExecutionMode;
use aegis_sizer::LotSizeTable;
use aegis_testkit::{sample_risk_limits, sample_trade_proposal, FakeExecutionBackend};
use chrono::Utc;

/// Boots an `ExecutionCore` against a real, migrated database, submits a
/// proposal through the Decision Loop, and confirms the booked position
/// shows up in the live snapshot. Then requests a Live transition with a
/// fake backend and confirms it lands in `backend_fallback`'s mirror once
/// displaced by a second swap.
///
/// DB-backed test, skipped if AEGIS_DATABASE_URL is not set.
#[tokio::test]
async fn boot_submit_proposal_and_mode_swap() -> anyhow::Result<()> {
    let url = match std::env::var(aegis_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: {} not set", aegis_db::ENV_DB_URL);
            return Ok(());
        }
    };
    std::env::set_var(aegis_db::ENV_DB_URL, &url);

    let audit_dir = tempfile::tempdir()?;
    let audit_log_path = audit_dir.path().join("audit.jsonl").to_string_lossy().to_string();

    let boot_config = BootConfig {
        risk_limits: sample_risk_limits(),
        sectors: SectorTable::new(),
        lot_sizes: LotSizeTable::new(),
        requested_mode: ExecutionMode::Paper,
        initial_cash_balance: Amount::from_units_cents(100_000, 0),
        paper_slippage_bps: Ratio::from_decimal_str("0.0005").unwrap(),
        live_base_url: None,
        live_exchange_secrets: None,
        operator_token: Some("test-operator-token".to_string()),
        swap_deadline: chrono::Duration::seconds(5),
        fallback_window: chrono::Duration::seconds(300),
        audit_log_path,
        hash_chain_audit: true,
    };

    let core = aegis_runtime::boot(boot_config, Utc::now()).await?;
    core.start().await;

    // Mode transitions first, while no positions are open — going Live
    // with open positions is one of the gated-reject conditions.
    let first_candidate: Arc<dyn aegis_execution::ExecutionBackend> = Arc::new(FakeExecutionBackend::new("candidate-a"));
    let changed = core
        .set_mode(ExecutionMode::Live, "test-operator-token", first_candidate.clone(), Utc::now())
        .await
        .expect("a healthy candidate backend with no open-position blockers should be accepted");
    assert_eq!(changed.to, ExecutionMode::Live);
    assert_eq!(core.active_mode().await, ExecutionMode::Live);

    let second_candidate: Arc<dyn aegis_execution::ExecutionBackend> = Arc::new(FakeExecutionBackend::new("candidate-b"));
    core.set_mode(ExecutionMode::Paper, "test-operator-token", second_candidate, Utc::now())
        .await
        .expect("returning to paper must also be accepted");

    let fallback = core.backend_fallback().await;
    assert!(fallback.is_some(), "the displaced backend must remain reachable within its fallback window");

    let proposal = sample_trade_proposal("ETHZAR");
    let position = core
        .submit_proposal(proposal)
        .await
        .expect("a within-limits proposal against an empty portfolio must be accepted");

    let snapshot = core.get_portfolio_snapshot();
    assert!(
        snapshot.open_positions.iter().any(|p| p.id == position.id),
        "booked position must appear in the live snapshot"
    );

    core.stop().await;
    Ok(())
}
