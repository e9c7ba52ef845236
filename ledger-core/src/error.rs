#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("no account for meter {0}")]
    AccountNotFound(String),
    #[error("ledger store failure: {0}")]
    Store(#[from] sqlx::Error),
}
