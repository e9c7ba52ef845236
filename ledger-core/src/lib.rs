pub mod balance;
pub mod domain;
pub mod error;
pub mod store;

pub use error::LedgerError;
pub use store::LedgerStore;
