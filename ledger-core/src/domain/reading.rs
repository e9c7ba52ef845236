use time::OffsetDateTime;

/// A single telemetry sample from a meter.
///
/// Voltage and current are nullable: devices in the field omit them when a
/// sensor fault leaves only the interval consumption. Append-only.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ConsumptionReading {
    pub meter_number: String,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power_consumed: f64,
    pub recorded_at: OffsetDateTime,
}

impl ConsumptionReading {
    pub fn new(
        meter_number: impl Into<String>,
        voltage: Option<f64>,
        current: Option<f64>,
        power_consumed: f64,
    ) -> Self {
        Self {
            meter_number: meter_number.into(),
            voltage,
            current,
            power_consumed,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }
}
