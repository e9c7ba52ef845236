/// A prepaid account keyed by the physical meter it belongs to.
///
/// `balance` is the remaining prepaid energy in watts, kept non-negative
/// and rounded to two decimals by the balance engine. The owner reference
/// is opaque to the core; registration lives outside it.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct Account {
    pub meter_number: String,
    pub owner: Option<String>,
    pub balance: f64,
}
