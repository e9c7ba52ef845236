use std::sync::Arc;

use futures::{Stream, StreamExt};

use crate::{
    service::{ConsumptionOutcome, MeterService, ServiceError},
    transport::{InboundMessage, Publisher},
};

/// Wire shape published by meters on the telemetry topic.
///
/// `meter_number` and `power_consumed` are required; a frame without them
/// is rejected outright rather than defaulted.
#[derive(serde::Deserialize)]
struct TelemetryFrame {
    meter_number: String,
    #[serde(default)]
    voltage: Option<f64>,
    #[serde(default)]
    current: Option<f64>,
    power_consumed: f64,
}

#[derive(serde::Serialize)]
struct BalanceUpdate<'a> {
    meter_number: &'a str,
    remaining_power: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum IngestError {
    #[error("malformed telemetry frame: {0}")]
    Malformed(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IngestOutcome {
    Applied { remaining_power: f64 },
    UnknownMeter,
}

/// Consumes inbound telemetry: decode, debit, persist, then best-effort
/// publish of the resulting balance.
///
/// Per message: Received -> Decoded -> AccountLookup -> BalanceApplied or
/// Skipped -> ReadingPersisted -> EventPublished. No single message may
/// stop the loop; bad frames and store failures are logged and counted.
pub struct TelemetryIngestor {
    service: Arc<MeterService>,
    publisher: Arc<dyn Publisher>,
    telemetry_topic: String,
    update_topic: String,
}

impl TelemetryIngestor {
    pub fn new(
        service: Arc<MeterService>,
        publisher: Arc<dyn Publisher>,
        telemetry_topic: String,
        update_topic: String,
    ) -> Self {
        Self {
            service,
            publisher,
            telemetry_topic,
            update_topic,
        }
    }

    pub async fn run<S>(self, mut input: S)
    where
        S: Stream<Item = InboundMessage> + Send + Unpin,
    {
        while let Some(msg) = input.next().await {
            // The session subscribes to the relay topic as well; command
            // echoes are not readings and must not be decoded as such.
            if msg.topic != self.telemetry_topic {
                tracing::debug!(topic = %msg.topic, "ignoring message on non-telemetry topic");
                continue;
            }

            metrics::counter!("telemetry_received_total").increment(1);

            match self.handle_frame(&msg.payload).await {
                Ok(IngestOutcome::Applied { remaining_power }) => {
                    metrics::counter!("telemetry_applied_total").increment(1);
                    if let Ok(dur) = std::time::SystemTime::now().duration_since(msg.received_at) {
                        metrics::histogram!("telemetry_ingest_latency_seconds")
                            .record(dur.as_secs_f64());
                    }
                    tracing::info!(remaining_power, "balance updated from telemetry");
                }
                Ok(IngestOutcome::UnknownMeter) => {
                    metrics::counter!("telemetry_unknown_meter_total").increment(1);
                }
                Err(IngestError::Malformed(reason)) => {
                    metrics::counter!("telemetry_rejected_total").increment(1);
                    tracing::warn!(reason = %reason, "dropping malformed telemetry frame");
                }
                Err(IngestError::Service(e)) => {
                    // Fatal to this message, not to the loop.
                    metrics::counter!("telemetry_store_failures_total").increment(1);
                    tracing::error!(error = %e, "failed to apply telemetry frame");
                }
            }
        }

        tracing::info!("telemetry stream ended, ingest loop exiting");
    }

    /// Apply a single raw frame. The balance/reading write commits before
    /// the balance-updated event goes out; a publish failure is logged and
    /// never rolls the write back.
    pub async fn handle_frame(&self, payload: &[u8]) -> Result<IngestOutcome, IngestError> {
        let frame: TelemetryFrame = serde_json::from_slice(payload)
            .map_err(|e| IngestError::Malformed(e.to_string()))?;

        if frame.meter_number.trim().is_empty() {
            return Err(IngestError::Malformed("empty meter_number".to_string()));
        }
        if !frame.power_consumed.is_finite() || frame.power_consumed < 0.0 {
            return Err(IngestError::Malformed(format!(
                "power_consumed must be a non-negative number, got {}",
                frame.power_consumed
            )));
        }

        let outcome = self
            .service
            .apply_consumption(
                &frame.meter_number,
                frame.voltage,
                frame.current,
                frame.power_consumed,
            )
            .await?;

        match outcome {
            ConsumptionOutcome::Applied { remaining_power } => {
                self.publish_balance_update(&frame.meter_number, remaining_power)
                    .await;
                Ok(IngestOutcome::Applied { remaining_power })
            }
            ConsumptionOutcome::UnknownMeter => Ok(IngestOutcome::UnknownMeter),
        }
    }

    async fn publish_balance_update(&self, meter_number: &str, remaining_power: f64) {
        let update = BalanceUpdate {
            meter_number,
            remaining_power,
        };
        let payload = match serde_json::to_vec(&update) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode balance update");
                return;
            }
        };

        if let Err(e) = self.publisher.publish(&self.update_topic, payload).await {
            metrics::counter!("balance_update_publish_failures_total").increment(1);
            tracing::warn!(
                error = %e,
                meter = %meter_number,
                "balance update not published, write already committed"
            );
        }
    }
}
