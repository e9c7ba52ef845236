pub mod config;
pub mod ingest;
pub mod metrics_server;
pub mod observability;
pub mod relay;
pub mod service;
pub mod transport;

pub use service::MeterService;
pub use transport::{InboundMessage, MqttSession, Publisher};
