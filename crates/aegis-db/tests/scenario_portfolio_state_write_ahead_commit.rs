/// A pending portfolio_state row that is never committed must not be
/// returned by `load_latest_committed_portfolio_state` — this is the crash
/// -mid-write case the write-ahead commit marker exists to cover.
///
/// DB-backed test, skipped if AEGIS_DATABASE_URL is not set.
#[tokio::test]
async fn uncommitted_row_is_not_visible_as_latest() -> anyhow::Result<()> {
    let url = match std::env::var(aegis_db::ENV_DB_URL) {
        Ok(v) => v,
        Err(_) => {
            eprintln!("SKIP: {} not set", aegis_db::ENV_DB_URL);
            return Ok(());
        }
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await?;
    aegis_db::migrate(&pool).await?;

    let committed_state = serde_json::json!({"total_value": "100000.00"});
    let id = aegis_db::write_portfolio_state_pending(&pool, &committed_state).await?;
    aegis_db::commit_portfolio_state(&pool, id).await?;

    let pending_state = serde_json::json!({"total_value": "999999.00"});
    aegis_db::write_portfolio_state_pending(&pool, &pending_state).await?;

    let latest = aegis_db::load_latest_committed_portfolio_state(&pool)
        .await?
        .expect("a committed row must exist");
    assert_eq!(latest, committed_state);

    Ok(())
}
