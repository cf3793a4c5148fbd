//! # error
//!
//! why: one error taxonomy shared by the coordinator, participants and clients
//! relations: returned by message.rs validation and decoding, mapped to failure responses by tpc-node
//! what: KvError and the Result alias

use thiserror::Error;

/// Everything that can go wrong while serving a key-value request.
///
/// The `Display` text of each variant is what ends up in the `Message`
/// element of a failure response, so keep it short and human readable.
#[derive(Debug, Error)]
pub enum KvError {
    /// Key or value violates the size limits; rejected before any log write.
    #[error("{0}")]
    Validation(String),

    /// Key absent from the cache, the store, or both replicas.
    #[error("{0}")]
    NotFound(String),

    /// A peer sent something that could not be parsed or did not fit the protocol.
    #[error("Protocol Error: {0}")]
    Protocol(String),

    /// No reply within the phase deadline.
    #[error("Timeout Error: {0}")]
    Timeout(String),

    /// Connection-level failure.
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer than two participants are registered, so no replica pair exists.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Two-phase commit decided abort; reported to clients, never raised by the coordinator itself.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// The local storage engine failed while applying a mutation.
    #[error("Storage Error: {0}")]
    Storage(String),
}

impl KvError {
    /// True for errors that count as a negative vote rather than a caller error.
    pub fn is_transient(&self) -> bool {
        matches!(self, KvError::Timeout(_) | KvError::Io(_))
    }
}

pub type Result<T, E = KvError> = std::result::Result<T, E>;
