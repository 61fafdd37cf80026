//! Error taxonomy of the message exchange engine
//!
//! | Error | Recovery |
//! |-------|----------|
//! | `TransportError` | retried with backoff by the engine |
//! | `OcppError` (protocol) | logged, frame dropped |
//! | `EngineError::CorrelationMiss` | discarded |
//! | `StoreError` | fatal, surfaced to the host process |
//! | `EngineError::RetryExhausted` | delivered to the original caller |
//! | `EngineError::Dropped` | delivered to the original caller |

use serde_json::Value;
use thiserror::Error;

use crate::ocpp::{ErrorCode, OcppError};

/// Persistence failures. Delivery guarantees cannot be upheld once one of
/// these occurs, so callers treat them as fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("store is not open")]
    NotOpen,

    #[error("duplicate unique id in store: {0}")]
    DuplicateId(String),
}

/// Connection establishment and send failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network unreachable: {0}")]
    Unreachable(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("connection rejected by peer: {0}")]
    Rejected(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("invalid security profile {0} for this channel")]
    InvalidProfile(u8),

    #[error("invalid CSMS url: {0}")]
    InvalidUrl(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("security profile {0} requires a basic-auth password")]
    MissingPassword(u8),

    #[error("no client certificate installed")]
    CertificateMissing,
}

/// Result of `Transport::connect`
pub type ConnectError = TransportError;

/// What a caller of the engine can observe
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] OcppError),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("no outstanding request for message {0}")]
    CorrelationMiss(String),

    #[error("message {unique_id} not confirmed after {attempts} attempts")]
    RetryExhausted { unique_id: String, attempts: u32 },

    #[error("CSMS rejected message {unique_id}: {code} - {description}")]
    Remote {
        unique_id: String,
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("message {0} was cancelled before transmission")]
    Cancelled(String),

    #[error("message {0} is already on the wire and cannot be cancelled")]
    AlreadySent(String),

    #[error("message {0} dropped from a full queue")]
    Dropped(String),

    #[error("unknown transaction {0}")]
    UnknownTransaction(String),

    #[error("transaction {0} already started")]
    TransactionExists(String),

    #[error("engine stopped")]
    Stopped,
}

impl EngineError {
    /// Errors after which the engine cannot keep its delivery guarantees.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Persistence(_))
    }
}
