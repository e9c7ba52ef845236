use anyhow::Result;
use ledger_core::LedgerStore;
use std::sync::Arc;
use telemetry_service::{
    config::AppConfig, ingest::TelemetryIngestor, metrics_server, observability,
    service::MeterService, transport::MqttSession,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let store = Arc::new(
        LedgerStore::connect(&cfg.database.url, cfg.database.max_connections).await?,
    );
    store.migrate().await?;

    // One shared transport session: it feeds the ingestor and carries all
    // outbound publishes, reconnecting on its own schedule.
    let (inbound_tx, inbound_rx) = mpsc::channel(cfg.mqtt.channel_capacity);
    let (session, session_task) = MqttSession::start(&cfg.mqtt, inbound_tx);

    let service = Arc::new(MeterService::new(store, cfg.ledger.conversion_rate));
    let ingestor = TelemetryIngestor::new(
        service,
        Arc::new(session.clone()),
        cfg.mqtt.telemetry_topic.clone(),
        cfg.mqtt.update_topic.clone(),
    );

    let ingest_task = tokio::spawn(ingestor.run(ReceiverStream::new(inbound_rx)));

    tracing::info!(
        broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port),
        telemetry_topic = %cfg.mqtt.telemetry_topic,
        "telemetry service running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");

    // Stopping the session closes the inbound channel, which lets the
    // ingestor finish whatever is buffered and exit.
    session.shutdown();
    let _ = session_task.await;
    let _ = ingest_task.await;

    Ok(())
}
