/// Error taxonomy shared by the transport, aggregator and topology layers.
///
/// `NotConnected` and `Timeout` are recoverable: the aggregator keeps the
/// last-known snapshot and retries on the next cycle. `ProtocolMismatch`
/// discards one cycle's data. `Configuration` raised while building the
/// topology aborts start-up.
use thiserror::Error;

use crate::types::ControllerId;

pub type Result<T> = std::result::Result<T, ScadaError>;

#[derive(Debug, Error)]
pub enum ScadaError {
    /// Operation attempted on an endpoint that is not connected
    #[error("controller {0} is not connected")]
    NotConnected(ControllerId),

    /// No reply within the configured bound
    #[error("controller {controller} timed out during {operation}")]
    Timeout {
        controller: ControllerId,
        operation: &'static str,
    },

    /// Reply shape disagrees with the request or the declared range
    #[error("protocol mismatch from {controller}: {detail}")]
    ProtocolMismatch {
        controller: ControllerId,
        detail: String,
    },

    /// Controller answered with a Modbus exception code
    #[error("controller {controller} returned exception 0x{code:02X} for function 0x{function:02X}")]
    DeviceException {
        controller: ControllerId,
        function: u8,
        code: u8,
    },

    /// Index range outside declared bounds, unknown identity, or topology count mismatch
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScadaError {
    pub fn config(detail: impl Into<String>) -> Self {
        ScadaError::Configuration(detail.into())
    }

    /// Recoverable conditions are folded into the connection-health flag
    /// instead of being surfaced to callers.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ScadaError::NotConnected(_) | ScadaError::Timeout { .. } | ScadaError::Io(_)
        )
    }

    /// Short machine-readable tag used in the event journal.
    pub fn kind(&self) -> &'static str {
        match self {
            ScadaError::NotConnected(_) => "NOT_CONNECTED",
            ScadaError::Timeout { .. } => "TIMEOUT",
            ScadaError::ProtocolMismatch { .. } => "PROTOCOL_MISMATCH",
            ScadaError::DeviceException { .. } => "DEVICE_EXCEPTION",
            ScadaError::Configuration(_) => "CONFIGURATION",
            ScadaError::Io(_) => "IO",
        }
    }
}
