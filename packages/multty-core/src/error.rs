//! Error type shared across the mulTTY engine.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MulttyError>;

/// Errors surfaced by mulTTY operations.
///
/// Malformed *remote* input is deliberately not represented here: the
/// demultiplexer recovers from it locally (logging and discarding the
/// offending bytes) and never turns it into a hard error.
#[derive(Debug, Error)]
pub enum MulttyError {
    /// I/O error from the underlying descriptor, propagated verbatim.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Locally supplied text (stream name, program identity, description)
    /// failed validation. No state was mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A flush payload would exceed the channel's atomic-write limit.
    /// The buffered state is unchanged; the caller may split the
    /// application payload and retry.
    #[error("payload of {size} bytes exceeds atomic write limit of {limit}")]
    AtomicLimit { size: usize, limit: usize },
}
