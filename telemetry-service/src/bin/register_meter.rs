use anyhow::{bail, Result};
use ledger_core::LedgerStore;
use std::env;
use telemetry_service::{config::AppConfig, observability};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: register_meter <meter_number> [owner]");
    }
    let meter_number = &args[1];
    let owner = args.get(2).map(String::as_str);

    let cfg = AppConfig::load()?;
    let store = LedgerStore::connect(&cfg.database.url, cfg.database.max_connections).await?;
    store.migrate().await?;

    store.create_account(meter_number, owner).await?;
    tracing::info!(meter = %meter_number, owner = ?owner, "account created with zero balance");

    Ok(())
}
