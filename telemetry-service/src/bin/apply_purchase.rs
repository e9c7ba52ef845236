use anyhow::{bail, Result};
use ledger_core::LedgerStore;
use std::{env, sync::Arc};
use telemetry_service::{config::AppConfig, observability, service::MeterService};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: apply_purchase <meter_number> <amount_paid> [payment_method]");
    }
    let meter_number = &args[1];
    let amount_paid: f64 = args[2]
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid amount '{}': {e}", args[2]))?;
    let payment_method = args.get(3).map(String::as_str);

    let cfg = AppConfig::load()?;
    let store = Arc::new(
        LedgerStore::connect(&cfg.database.url, cfg.database.max_connections).await?,
    );
    store.migrate().await?;

    let service = MeterService::new(store, cfg.ledger.conversion_rate);
    let receipt = service
        .apply_purchase(meter_number, amount_paid, payment_method)
        .await?;

    tracing::info!(
        meter = %meter_number,
        power_credited = receipt.power_credited,
        new_balance = receipt.new_balance,
        "purchase recorded"
    );

    Ok(())
}
