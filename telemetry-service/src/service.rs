use std::sync::Arc;

use ledger_core::{
    balance::{self, BalanceError},
    domain::{ConsumptionReading, PurchaseRecord},
    LedgerError, LedgerStore,
};

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("invalid purchase amount: {0}")]
    InvalidAmount(f64),
    #[error("invalid conversion rate: {0}")]
    InvalidRate(f64),
    #[error("no account for meter {0}")]
    AccountNotFound(String),
    #[error("ledger store failure: {0}")]
    Store(LedgerError),
}

impl From<LedgerError> for ServiceError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::AccountNotFound(meter) => Self::AccountNotFound(meter),
            other => Self::Store(other),
        }
    }
}

impl From<BalanceError> for ServiceError {
    fn from(e: BalanceError) -> Self {
        match e {
            BalanceError::InvalidAmount(amount) => Self::InvalidAmount(amount),
            BalanceError::InvalidRate(rate) => Self::InvalidRate(rate),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PurchaseReceipt {
    pub power_credited: f64,
    pub new_balance: f64,
}

/// Result of applying one consumption reading.
///
/// An unknown meter is a soft outcome, not an error: the reading is kept
/// (telemetry from unlinked devices still matters) and only the balance
/// mutation is skipped. Store failures are hard errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsumptionOutcome {
    Applied { remaining_power: f64 },
    UnknownMeter,
}

/// The two ledger-mutating core operations plus a balance probe, consumed
/// by the telemetry ingestor and by external (HTTP-style) adapters.
pub struct MeterService {
    store: Arc<LedgerStore>,
    conversion_rate: f64,
}

impl MeterService {
    pub fn new(store: Arc<LedgerStore>, conversion_rate: f64) -> Self {
        Self {
            store,
            conversion_rate,
        }
    }

    pub fn store(&self) -> &Arc<LedgerStore> {
        &self.store
    }

    /// Credit a prepaid purchase: `amount_paid / rate` watts, recorded and
    /// applied in one ledger transaction.
    pub async fn apply_purchase(
        &self,
        meter_number: &str,
        amount_paid: f64,
        payment_method: Option<&str>,
    ) -> Result<PurchaseReceipt, ServiceError> {
        let power_credited = balance::credit_amount(amount_paid, self.conversion_rate)?;

        let record = PurchaseRecord::new(
            meter_number,
            balance::round2(amount_paid),
            power_credited,
            payment_method.map(str::to_string),
        );
        let account = self.store.apply_purchase(&record).await?;

        metrics::counter!("purchases_applied_total").increment(1);
        tracing::info!(
            meter = %meter_number,
            power_credited,
            new_balance = account.balance,
            "purchase applied"
        );

        Ok(PurchaseReceipt {
            power_credited,
            new_balance: account.balance,
        })
    }

    /// Debit one reading against the account and append it to the log.
    ///
    /// For a known meter the debit and the reading commit in one ledger
    /// transaction, so a failed append rolls the debit back too. The
    /// reading is still appended when no account matches the meter. The
    /// debit clamps at zero; see `balance::debit_consumption`.
    pub async fn apply_consumption(
        &self,
        meter_number: &str,
        voltage: Option<f64>,
        current: Option<f64>,
        power_consumed: f64,
    ) -> Result<ConsumptionOutcome, ServiceError> {
        let reading = ConsumptionReading::new(meter_number, voltage, current, power_consumed);

        let applied = self
            .store
            .apply_consumption(&reading, |b| balance::debit_consumption(b, power_consumed))
            .await;

        match applied {
            Ok(account) => {
                metrics::counter!("consumption_applied_total").increment(1);
                Ok(ConsumptionOutcome::Applied {
                    remaining_power: account.balance,
                })
            }
            Err(LedgerError::AccountNotFound(_)) => {
                self.store.append_reading(&reading).await?;
                metrics::counter!("consumption_unknown_meter_total").increment(1);
                tracing::warn!(meter = %meter_number, "reading for unknown meter, balance untouched");
                Ok(ConsumptionOutcome::UnknownMeter)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn current_balance(&self, meter_number: &str) -> Result<f64, ServiceError> {
        let account = self.store.get_account(meter_number).await?;
        Ok(balance::round2(account.balance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_service() -> MeterService {
        let store = LedgerStore::connect("sqlite::memory:", 1).await.unwrap();
        store.migrate().await.unwrap();
        store.create_account("MTR-1", Some("alice")).await.unwrap();
        MeterService::new(Arc::new(store), balance::DEFAULT_CONVERSION_RATE)
    }

    #[tokio::test]
    async fn purchase_then_consumption_scenario() {
        let service = test_service().await;

        // 1000 at rate 500 credits exactly 2.00 W.
        let receipt = service
            .apply_purchase("MTR-1", 1000.0, Some("mtn"))
            .await
            .unwrap();
        assert_eq!(receipt.power_credited, 2.0);
        assert_eq!(receipt.new_balance, 2.0);
        assert_eq!(service.current_balance("MTR-1").await.unwrap(), 2.0);

        let outcome = service
            .apply_consumption("MTR-1", Some(229.8), Some(0.9), 0.5)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConsumptionOutcome::Applied {
                remaining_power: 1.5
            }
        );

        // Consuming more than the balance clamps at zero, never negative.
        let outcome = service
            .apply_consumption("MTR-1", Some(229.8), Some(0.9), 5.0)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConsumptionOutcome::Applied {
                remaining_power: 0.0
            }
        );
    }

    #[tokio::test]
    async fn purchase_rejects_non_positive_amounts() {
        let service = test_service().await;
        let err = service.apply_purchase("MTR-1", 0.0, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidAmount(_)));

        let err = service
            .apply_purchase("MTR-1", -10.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidAmount(_)));
    }

    #[tokio::test]
    async fn purchase_rejects_a_misconfigured_rate() {
        let store = LedgerStore::connect("sqlite::memory:", 1).await.unwrap();
        store.migrate().await.unwrap();
        store.create_account("MTR-1", None).await.unwrap();
        let service = MeterService::new(Arc::new(store), 0.0);

        let err = service
            .apply_purchase("MTR-1", 1000.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRate(_)));
        assert_eq!(service.current_balance("MTR-1").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn purchase_for_unknown_meter_is_rejected() {
        let service = test_service().await;
        let err = service
            .apply_purchase("MTR-404", 500.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AccountNotFound(m) if m == "MTR-404"));
    }

    #[tokio::test]
    async fn failed_reading_append_rolls_the_debit_back() {
        let service = test_service().await;
        service.apply_purchase("MTR-1", 1000.0, None).await.unwrap();

        // Force the reading insert to fail mid-transaction.
        sqlx::query("DROP TABLE sensor_readings")
            .execute(service.store().pool())
            .await
            .unwrap();

        let err = service
            .apply_consumption("MTR-1", None, None, 0.5)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Store(_)));

        // No partial state: the debit must not survive without its audit
        // reading.
        assert_eq!(service.current_balance("MTR-1").await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn unknown_meter_consumption_keeps_the_reading() {
        let service = test_service().await;

        let outcome = service
            .apply_consumption("MTR-404", None, None, 0.3)
            .await
            .unwrap();
        assert_eq!(outcome, ConsumptionOutcome::UnknownMeter);

        let latest = service
            .store()
            .latest_reading("MTR-404")
            .await
            .unwrap()
            .expect("reading persisted for unlinked device");
        assert_eq!(latest.power_consumed, 0.3);

        let err = service.current_balance("MTR-404").await.unwrap_err();
        assert!(matches!(err, ServiceError::AccountNotFound(_)));
    }
}
