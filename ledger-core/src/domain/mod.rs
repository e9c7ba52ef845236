pub mod account;
pub mod purchase;
pub mod reading;

pub use account::Account;
pub use purchase::PurchaseRecord;
pub use reading::ConsumptionReading;
