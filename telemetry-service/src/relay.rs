use std::{fmt, sync::Arc};

use ledger_core::{LedgerError, LedgerStore};

use crate::transport::Publisher;

/// Desired position of a meter's power relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    On,
    Off,
}

impl RelayState {
    /// Case-insensitive parse of operator input; anything but on/off is
    /// rejected before a publish is even attempted.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => f.write_str("on"),
            Self::Off => f.write_str("off"),
        }
    }
}

/// Whether a command requires the target meter to have an account.
///
/// The source system shipped both behaviors in different copies; the mode
/// is configuration, not a silent merge. Lenient matches the newer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    #[default]
    Lenient,
    Strict,
}

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("invalid relay state {0:?}, expected \"on\" or \"off\"")]
    InvalidState(String),
    #[error("meter key must not be empty")]
    EmptyMeterKey,
    #[error("no account for meter {0}")]
    AccountNotFound(String),
    #[error("ledger store failure: {0}")]
    Store(LedgerError),
    #[error("failed to encode relay command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of an accepted command. `queued: false` is the soft transport
/// failure: the command was valid but could not be handed to the broker;
/// the reconnect loop heals the session independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayDispatch {
    pub queued: bool,
}

// Transient command intent; lives only for the publish attempt.
#[derive(serde::Serialize)]
struct RelayCommand<'a> {
    meter_number: &'a str,
    command: RelayState,
}

/// Fire-and-forget relay control. Never blocks on broker acknowledgment.
pub struct RelayCommander {
    publisher: Arc<dyn Publisher>,
    store: Arc<LedgerStore>,
    mode: RelayMode,
    topic: String,
}

impl RelayCommander {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        store: Arc<LedgerStore>,
        mode: RelayMode,
        topic: String,
    ) -> Self {
        Self {
            publisher,
            store,
            mode,
            topic,
        }
    }

    pub async fn send(&self, meter_number: &str, state: &str) -> Result<RelayDispatch, RelayError> {
        let meter_number = meter_number.trim();
        if meter_number.is_empty() {
            return Err(RelayError::EmptyMeterKey);
        }

        let Some(state) = RelayState::parse(state) else {
            metrics::counter!("relay_rejected_total").increment(1);
            return Err(RelayError::InvalidState(state.to_string()));
        };

        if self.mode == RelayMode::Strict {
            match self.store.get_account(meter_number).await {
                Ok(_) => {}
                Err(LedgerError::AccountNotFound(meter)) => {
                    return Err(RelayError::AccountNotFound(meter));
                }
                Err(e) => return Err(RelayError::Store(e)),
            }
        }

        let command = RelayCommand {
            meter_number,
            command: state,
        };
        let payload = serde_json::to_vec(&command)?;

        match self.publisher.publish(&self.topic, payload).await {
            Ok(()) => {
                metrics::counter!("relay_commands_queued_total").increment(1);
                tracing::info!(meter = %meter_number, state = %state, "relay command queued");
                Ok(RelayDispatch { queued: true })
            }
            Err(e) => {
                // Soft failure: the caller gets a distinct non-success
                // result but is never blocked on the transport.
                metrics::counter!("relay_transport_failures_total").increment(1);
                tracing::warn!(
                    error = %e,
                    meter = %meter_number,
                    state = %state,
                    "relay command not queued, transport unavailable"
                );
                Ok(RelayDispatch { queued: false })
            }
        }
    }
}
