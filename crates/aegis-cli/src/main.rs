//! `aegis` CLI entry point: config load, boot sequencing, and the exit-code
//! taxonomy. Thin by design — every verb below is a direct call into
//! `aegis-config`/`aegis-db`/`aegis-runtime`; no business logic lives here.

use std::sync::Arc;

use aegis_money::{Amount, Ratio};
use aegis_risk::SectorTable;
use aegis_runtime::{BootConfig, BootError};
use aegis_schemas::ExecutionMode;
use aegis_sizer::LotSizeTable;
use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "aegis")]
#[command(about = "Portfolio risk and execution core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered risk-limits config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> environment -> operator overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Boot the execution core and run until interrupted
    Run {
        /// Layered config paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,

        /// Requested execution mode at boot
        #[arg(long, default_value = "paper")]
        mode: String,

        /// Opening cash balance for a fresh deployment, in decimal dollars
        #[arg(long, default_value = "100000")]
        initial_cash_balance: String,

        /// Paper broker slippage, in basis points expressed as a decimal ratio
        #[arg(long, default_value = "0.0005")]
        paper_slippage_bps: String,

        /// Live exchange REST base URL, required for --mode live
        #[arg(long)]
        live_base_url: Option<String>,

        /// Execution Router swap lease timeout, in seconds
        #[arg(long, default_value_t = 5)]
        swap_deadline_secs: i64,

        /// Module Registry fallback window, in seconds
        #[arg(long, default_value_t = 300)]
        fallback_window_secs: i64,

        /// Path to the hash-chained JSON Lines audit log
        #[arg(long, default_value = "aegis-audit.jsonl")]
        audit_log: String,

        /// Disable hash-chain verification on the audit log (testing only)
        #[arg(long)]
        no_hash_chain: bool,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => run_db_cmd(cmd).await,

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(String::as_str).collect();
            let loaded = match aegis_config::load_layered_yaml(&path_refs) {
                Ok(l) => l,
                Err(e) => fail_config(e),
            };
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
            Ok(())
        }

        Commands::Run {
            config_paths,
            mode,
            initial_cash_balance,
            paper_slippage_bps,
            live_base_url,
            swap_deadline_secs,
            fallback_window_secs,
            audit_log,
            no_hash_chain,
        } => {
            run_core(
                config_paths,
                mode,
                initial_cash_balance,
                paper_slippage_bps,
                live_base_url,
                swap_deadline_secs,
                fallback_window_secs,
                audit_log,
                no_hash_chain,
            )
            .await
        }
    }
}

async fn run_db_cmd(cmd: DbCmd) -> Result<()> {
    let pool = match aegis_db::connect_from_env().await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "durable store unavailable");
            std::process::exit(20);
        }
    };
    match cmd {
        DbCmd::Status => {
            let s = aegis_db::status(&pool).await?;
            println!("reachable={} applied_migrations={}", s.reachable, s.applied_migrations);
        }
        DbCmd::Migrate => {
            aegis_db::migrate(&pool).await?;
            println!("migrations_applied=true");
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_core(
    config_paths: Vec<String>,
    mode: String,
    initial_cash_balance: String,
    paper_slippage_bps: String,
    live_base_url: Option<String>,
    swap_deadline_secs: i64,
    fallback_window_secs: i64,
    audit_log: String,
    no_hash_chain: bool,
) -> Result<()> {
    let path_refs: Vec<&str> = config_paths.iter().map(String::as_str).collect();
    let loaded = match aegis_config::load_layered_yaml(&path_refs) {
        Ok(l) => l,
        Err(e) => fail_config(e),
    };
    let risk_limits = match aegis_config::parse_risk_limits(&loaded) {
        Ok(l) => l,
        Err(e) => fail_config(e),
    };

    let requested_mode = match mode.to_ascii_lowercase().as_str() {
        "paper" => ExecutionMode::Paper,
        "live" => ExecutionMode::Live,
        other => {
            tracing::error!(mode = other, "invalid --mode, expected paper or live");
            std::process::exit(10);
        }
    };

    let initial_cash_balance = match parse_amount_dollars(&initial_cash_balance) {
        Some(a) => a,
        None => {
            tracing::error!(value = %initial_cash_balance, "invalid --initial-cash-balance");
            std::process::exit(10);
        }
    };
    let paper_slippage_bps = match Ratio::from_decimal_str(&paper_slippage_bps) {
        Some(r) => r,
        None => {
            tracing::error!(value = %paper_slippage_bps, "invalid --paper-slippage-bps");
            std::process::exit(10);
        }
    };

    let operator_token = aegis_config::secrets::load_operator_secrets()
        .ok()
        .map(|s| s.confirmation_token.expose().clone());
    let live_exchange_secrets = aegis_config::secrets::load_live_exchange_secrets().ok();

    let boot_config = BootConfig {
        risk_limits,
        sectors: SectorTable::new(),
        lot_sizes: LotSizeTable::new(),
        requested_mode,
        initial_cash_balance,
        paper_slippage_bps,
        live_base_url,
        live_exchange_secrets,
        operator_token,
        swap_deadline: chrono::Duration::seconds(swap_deadline_secs),
        fallback_window: chrono::Duration::seconds(fallback_window_secs),
        audit_log_path: audit_log,
        hash_chain_audit: !no_hash_chain,
    };

    let core = match aegis_runtime::boot(boot_config, chrono::Utc::now()).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "boot failed");
            std::process::exit(e.exit_code());
        }
    };
    let core = Arc::new(core);

    tracing::info!(run_id = %core.run_id(), mode = %mode, "aegis boot complete");
    core.start().await;

    let drain_core = core.clone();
    let drain_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            ticker.tick().await;
            if let Err(e) = drain_core.drain_and_persist().await {
                tracing::error!(error = %e, "periodic drain did not fully persist");
            }
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
    }

    tracing::info!("shutdown requested");
    drain_handle.abort();
    core.stop().await;
    Ok(())
}

/// Parses a decimal dollar string ("100000" or "100000.50") into `Amount`
/// cents without ever routing the value through a binary float.
fn parse_amount_dollars(s: &str) -> Option<Amount> {
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    let whole: i64 = whole.parse().ok()?;
    let frac = format!("{frac:0<2}");
    let cents: i64 = frac[..2].parse().ok()?;
    if whole < 0 {
        return None;
    }
    Some(Amount::from_units_cents(whole, cents))
}

fn fail_config<T, E: std::fmt::Display>(e: E) -> T {
    tracing::error!(error = %e, "invalid configuration");
    std::process::exit(10);
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
