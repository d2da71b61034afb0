use crate::validation::ValidationError;

/// Failures surfaced to producers and to the binary. Protocol-level problems
/// (bad checksum, timeouts, exhausted retries) are not errors here; they are
/// logged or reported through a `CommandOutcome`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid command: {0}")]
    Validation(#[from] ValidationError),

    #[error("serial port error: {0}")]
    Serial(String),
}
