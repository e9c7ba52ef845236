use anyhow::{bail, Result};
use ledger_core::LedgerStore;
use std::{env, sync::Arc, time::Duration};
use telemetry_service::{
    config::AppConfig, observability, relay::RelayCommander, transport::MqttSession,
};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: relay_send <meter_number> <on|off>");
    }
    let meter_number = &args[1];
    let state = &args[2];

    let cfg = AppConfig::load()?;
    let store = Arc::new(
        LedgerStore::connect(&cfg.database.url, cfg.database.max_connections).await?,
    );
    store.migrate().await?;

    // Keep the inbound receiver alive for the session's lifetime even
    // though this tool never consumes telemetry.
    let (inbound_tx, _inbound_rx) = mpsc::channel(cfg.mqtt.channel_capacity);
    let (session, session_task) = MqttSession::start(&cfg.mqtt, inbound_tx);

    // Give the session a moment to reach the broker; a soft failure is
    // still reported properly if it never does.
    for _ in 0..50 {
        if session.is_connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let relay = RelayCommander::new(
        Arc::new(session.clone()),
        store,
        cfg.relay.mode,
        cfg.mqtt.relay_topic.clone(),
    );

    let dispatch = relay.send(meter_number, state).await?;
    if dispatch.queued {
        tracing::info!(meter = %meter_number, state = %state, "relay command queued");
        // Let the event loop hand the queued publish to the broker.
        tokio::time::sleep(Duration::from_millis(500)).await;
    } else {
        tracing::warn!(meter = %meter_number, "transport unavailable, command not queued");
    }

    session.shutdown();
    let _ = session_task.await;

    Ok(())
}
