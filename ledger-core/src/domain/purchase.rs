use time::OffsetDateTime;

/// An append-only record of a prepaid purchase: currency in, watts out.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct PurchaseRecord {
    pub meter_number: String,
    pub amount_paid: f64,
    pub power_credited: f64,
    pub payment_method: Option<String>,
    pub purchased_at: OffsetDateTime,
}

impl PurchaseRecord {
    pub fn new(
        meter_number: impl Into<String>,
        amount_paid: f64,
        power_credited: f64,
        payment_method: Option<String>,
    ) -> Self {
        Self {
            meter_number: meter_number.into(),
            amount_paid,
            power_credited,
            payment_method,
            purchased_at: OffsetDateTime::now_utc(),
        }
    }
}
