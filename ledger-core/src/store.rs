use std::{collections::HashMap, sync::Arc};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;

use crate::{
    balance,
    domain::{Account, ConsumptionReading, PurchaseRecord},
    error::LedgerError,
};

/// Durable ledger: account balances plus append-only purchase and reading
/// logs.
///
/// Balance writes go through a per-meter async lock so that concurrent
/// credits and debits on the same account serialize, while different
/// accounts proceed independently. The balance transform itself stays pure
/// (see `balance`); the store only runs it inside a transaction.
pub struct LedgerStore {
    pool: SqlitePool,
    account_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema setup.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                meter_number TEXT PRIMARY KEY,
                owner        TEXT,
                balance      REAL NOT NULL DEFAULT 0.0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS purchases (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                meter_number   TEXT NOT NULL,
                amount_paid    REAL NOT NULL,
                power_credited REAL NOT NULL,
                payment_method TEXT,
                purchased_at   TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sensor_readings (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                meter_number   TEXT NOT NULL,
                voltage        REAL,
                current        REAL,
                power_consumed REAL NOT NULL,
                recorded_at    TEXT NOT NULL
            )
            "#,
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn lock_for(&self, meter_number: &str) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock().await;
        locks
            .entry(meter_number.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn get_account(&self, meter_number: &str) -> Result<Account, LedgerError> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT meter_number, owner, balance FROM accounts WHERE meter_number = ?",
        )
        .bind(meter_number)
        .fetch_optional(&self.pool)
        .await?;

        account.ok_or_else(|| LedgerError::AccountNotFound(meter_number.to_string()))
    }

    /// Registration is an external concern; the insert is exposed for
    /// operator tooling and tests.
    pub async fn create_account(
        &self,
        meter_number: &str,
        owner: Option<&str>,
    ) -> Result<(), LedgerError> {
        sqlx::query("INSERT INTO accounts (meter_number, owner, balance) VALUES (?, ?, 0.0)")
            .bind(meter_number)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply a pure balance transform under the per-meter lock.
    ///
    /// The read-modify-write runs inside one transaction; `f` must be a
    /// side-effect-free function of the old balance.
    pub async fn apply_delta<F>(&self, meter_number: &str, f: F) -> Result<Account, LedgerError>
    where
        F: FnOnce(f64) -> f64,
    {
        let lock = self.lock_for(meter_number).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        let account = sqlx::query_as::<_, Account>(
            "SELECT meter_number, owner, balance FROM accounts WHERE meter_number = ?",
        )
        .bind(meter_number)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut account) = account else {
            return Err(LedgerError::AccountNotFound(meter_number.to_string()));
        };

        account.balance = f(account.balance);

        sqlx::query("UPDATE accounts SET balance = ? WHERE meter_number = ?")
            .bind(account.balance)
            .bind(meter_number)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(account)
    }

    /// Credit a purchase and append its record in a single transaction,
    /// under the per-meter lock. Either both land or neither does.
    pub async fn apply_purchase(&self, record: &PurchaseRecord) -> Result<Account, LedgerError> {
        let lock = self.lock_for(&record.meter_number).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        let account = sqlx::query_as::<_, Account>(
            "SELECT meter_number, owner, balance FROM accounts WHERE meter_number = ?",
        )
        .bind(&record.meter_number)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut account) = account else {
            return Err(LedgerError::AccountNotFound(record.meter_number.clone()));
        };

        account.balance = balance::round2(account.balance + record.power_credited);

        sqlx::query("UPDATE accounts SET balance = ? WHERE meter_number = ?")
            .bind(account.balance)
            .bind(&record.meter_number)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO purchases
                (meter_number, amount_paid, power_credited, payment_method, purchased_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.meter_number)
        .bind(record.amount_paid)
        .bind(record.power_credited)
        .bind(&record.payment_method)
        .bind(record.purchased_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(account)
    }

    /// Debit a reading against the balance and append it to the log in a
    /// single transaction, under the per-meter lock. Either the debit and
    /// its audit reading both land or neither does. `f` is the pure debit
    /// transform of the old balance.
    ///
    /// Fails with `AccountNotFound` when the meter has no account; the
    /// caller decides whether to keep the reading via `append_reading`.
    pub async fn apply_consumption<F>(
        &self,
        reading: &ConsumptionReading,
        f: F,
    ) -> Result<Account, LedgerError>
    where
        F: FnOnce(f64) -> f64,
    {
        let lock = self.lock_for(&reading.meter_number).await;
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        let account = sqlx::query_as::<_, Account>(
            "SELECT meter_number, owner, balance FROM accounts WHERE meter_number = ?",
        )
        .bind(&reading.meter_number)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut account) = account else {
            return Err(LedgerError::AccountNotFound(reading.meter_number.clone()));
        };

        account.balance = f(account.balance);

        sqlx::query("UPDATE accounts SET balance = ? WHERE meter_number = ?")
            .bind(account.balance)
            .bind(&reading.meter_number)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO sensor_readings
                (meter_number, voltage, current, power_consumed, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reading.meter_number)
        .bind(reading.voltage)
        .bind(reading.current)
        .bind(reading.power_consumed)
        .bind(reading.recorded_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(account)
    }

    /// Durable append; a write error propagates, it is never swallowed.
    pub async fn append_purchase(&self, record: &PurchaseRecord) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO purchases
                (meter_number, amount_paid, power_credited, payment_method, purchased_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.meter_number)
        .bind(record.amount_paid)
        .bind(record.power_credited)
        .bind(&record.payment_method)
        .bind(record.purchased_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Durable append; readings are kept even for meters without an account.
    pub async fn append_reading(&self, reading: &ConsumptionReading) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO sensor_readings
                (meter_number, voltage, current, power_consumed, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reading.meter_number)
        .bind(reading.voltage)
        .bind(reading.current)
        .bind(reading.power_consumed)
        .bind(reading.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent telemetry sample for a meter, if any.
    pub async fn latest_reading(
        &self,
        meter_number: &str,
    ) -> Result<Option<ConsumptionReading>, LedgerError> {
        let reading = sqlx::query_as::<_, ConsumptionReading>(
            r#"
            SELECT meter_number, voltage, current, power_consumed, recorded_at
            FROM sensor_readings
            WHERE meter_number = ?
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(meter_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{debit_consumption, DEFAULT_CONVERSION_RATE};

    async fn memory_store() -> LedgerStore {
        let store = LedgerStore::connect("sqlite::memory:", 1)
            .await
            .expect("in-memory sqlite");
        store.migrate().await.expect("migrate");
        store
    }

    #[tokio::test]
    async fn get_account_reports_unknown_meters() {
        let store = memory_store().await;
        let err = store.get_account("MTR-404").await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(m) if m == "MTR-404"));
    }

    #[tokio::test]
    async fn apply_delta_serializes_and_persists_the_new_balance() {
        let store = memory_store().await;
        store.create_account("MTR-1", Some("alice")).await.unwrap();

        let account = store
            .apply_delta("MTR-1", |b| debit_consumption(b + 2.0, 0.5))
            .await
            .unwrap();
        assert_eq!(account.balance, 1.5);

        let reread = store.get_account("MTR-1").await.unwrap();
        assert_eq!(reread.balance, 1.5);
    }

    #[tokio::test]
    async fn apply_delta_on_unknown_meter_is_not_found() {
        let store = memory_store().await;
        let err = store.apply_delta("MTR-404", |b| b).await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn apply_purchase_credits_balance_and_appends_the_record_together() {
        let store = memory_store().await;
        store.create_account("MTR-1", None).await.unwrap();

        let record = PurchaseRecord::new("MTR-1", 1000.0, 2.0, Some("mtn".to_string()));
        let account = store.apply_purchase(&record).await.unwrap();
        assert_eq!(account.balance, 2.0);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM purchases WHERE meter_number = ?")
            .bind("MTR-1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn apply_purchase_on_unknown_meter_leaves_no_record() {
        let store = memory_store().await;

        let record = PurchaseRecord::new("MTR-404", 500.0, 1.0, None);
        let err = store.apply_purchase(&record).await.unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM purchases")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn apply_consumption_commits_debit_and_reading_together() {
        let store = memory_store().await;
        store.create_account("MTR-1", None).await.unwrap();
        store
            .apply_delta("MTR-1", |b| b + 2.0)
            .await
            .unwrap();

        let reading = ConsumptionReading::new("MTR-1", Some(230.0), Some(1.0), 0.5);
        let account = store
            .apply_consumption(&reading, |b| debit_consumption(b, 0.5))
            .await
            .unwrap();
        assert_eq!(account.balance, 1.5);

        let latest = store.latest_reading("MTR-1").await.unwrap().unwrap();
        assert_eq!(latest.power_consumed, 0.5);
    }

    #[tokio::test]
    async fn apply_consumption_on_unknown_meter_writes_nothing() {
        let store = memory_store().await;

        let reading = ConsumptionReading::new("MTR-404", None, None, 0.5);
        let err = store
            .apply_consumption(&reading, |b| debit_consumption(b, 0.5))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AccountNotFound(_)));
        assert!(store.latest_reading("MTR-404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_purchase_logs_without_touching_the_balance() {
        let store = memory_store().await;
        store.create_account("MTR-1", None).await.unwrap();

        // Imported/backfilled records go straight to the log.
        let record = PurchaseRecord::new("MTR-1", 750.0, 1.5, Some("visa".to_string()));
        store.append_purchase(&record).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM purchases WHERE meter_number = ?")
            .bind("MTR-1")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let account = store.get_account("MTR-1").await.unwrap();
        assert_eq!(account.balance, 0.0);
    }

    #[tokio::test]
    async fn concurrent_purchases_lose_no_updates() {
        let store = Arc::new(memory_store().await);
        store.create_account("MTR-1", None).await.unwrap();

        let amount = 250.0;
        let credited = amount / DEFAULT_CONVERSION_RATE; // 0.5 W each

        let mut joins = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            joins.push(tokio::spawn(async move {
                let record = PurchaseRecord::new("MTR-1", amount, credited, None);
                store.apply_purchase(&record).await
            }));
        }
        for j in joins {
            j.await.unwrap().unwrap();
        }

        let account = store.get_account("MTR-1").await.unwrap();
        assert_eq!(account.balance, 16.0 * credited);
    }

    #[tokio::test]
    async fn readings_append_even_without_an_account() {
        let store = memory_store().await;

        let reading = ConsumptionReading::new("MTR-404", Some(231.0), Some(1.2), 0.4);
        store.append_reading(&reading).await.unwrap();

        let latest = store.latest_reading("MTR-404").await.unwrap().unwrap();
        assert_eq!(latest.power_consumed, 0.4);
        assert_eq!(latest.voltage, Some(231.0));

        assert!(store.latest_reading("MTR-1").await.unwrap().is_none());
    }
}
