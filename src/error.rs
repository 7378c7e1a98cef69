use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::message::{AlertDescription, AlertLevel};

/// Errors produced by the connector and its state machines.
///
/// The error is `Clone` so that one failure can be reported to every
/// message callback that was waiting on the same handshake.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// More bytes are needed to parse the input.
    #[error("Parse incomplete")]
    ParseIncomplete,

    /// The input could not be parsed.
    #[error("Parse error: {0:?}")]
    ParseError(nom::error::ErrorKind),

    /// A record could not be authenticated or decrypted.
    ///
    /// Deliberately carries no detail about the cause.
    #[error("Decryption failed")]
    DecryptError,

    /// A record was a replay of an already processed one.
    #[error("Duplicate record")]
    Replay,

    /// Sequence numbers of the current epoch are exhausted.
    #[error("Sequence number exhausted for epoch {0}")]
    SequenceExhausted(u16),

    /// Epoch is not allowed to wrap.
    #[error("Epoch exhausted")]
    EpochExhausted,

    /// An unexpected handshake message or record arrived.
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Cryptographic primitive failed.
    #[error("Crypto error: {0}")]
    CryptoError(String),

    /// Handshake failed, with the alert to report to the peer.
    #[error("Handshake failed ({level:?} {description:?}): {message}")]
    HandshakeFailure {
        level: AlertLevel,
        description: AlertDescription,
        message: String,
    },

    /// Handshake gave up after the configured number of retransmissions.
    #[error("Handshake timeout")]
    Timeout,

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Outbound message buffer exhausted.
    #[error("Outbound message buffer full")]
    Overflow,

    /// Connection store has no room for another connection.
    #[error("Connection store exhausted")]
    StoreExhausted,

    /// The connection was evicted from the store.
    #[error("Connection evicted")]
    Evicted,

    /// The connection was closed.
    #[error("Connection closed")]
    Closed,

    /// A received fatal alert terminated the connection.
    #[error("Received alert {0:?}")]
    AlertReceived(AlertDescription),

    /// The destination is a multicast address.
    #[error("Multicast is not supported")]
    MulticastNotSupported,

    /// The message payload is larger than a record can carry.
    #[error("Message too large ({0} bytes)")]
    MessageTooLarge(usize),

    /// The message may not start a handshake and there is no session.
    #[error("No established session")]
    NoSession,

    /// The connector is configured as server only and has no connection to the peer.
    #[error("Server only, no connection to peer")]
    ServerOnly,

    /// The message's endpoint context does not match the connection.
    #[error("Endpoint context mismatch")]
    EndpointMismatch,

    /// The connector is not running.
    #[error("Connector not running")]
    NotRunning,

    /// A task was rejected because its executor is shut down.
    #[error("Execution rejected")]
    ExecutionRejected,

    /// A task of the connection panicked.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

impl Error {
    /// Alert to send to the peer when this error aborts a handshake.
    pub(crate) fn alert(&self) -> (AlertLevel, AlertDescription) {
        match self {
            Error::HandshakeFailure {
                level, description, ..
            } => (*level, *description),
            Error::DecryptError => (AlertLevel::Fatal, AlertDescription::BadRecordMac),
            Error::ParseIncomplete | Error::ParseError(_) => {
                (AlertLevel::Fatal, AlertDescription::DecodeError)
            }
            Error::UnexpectedMessage(_) => {
                (AlertLevel::Fatal, AlertDescription::UnexpectedMessage)
            }
            _ => (AlertLevel::Fatal, AlertDescription::InternalError),
        }
    }

    pub(crate) fn handshake(description: AlertDescription, message: impl Into<String>) -> Error {
        Error::HandshakeFailure {
            level: AlertLevel::Fatal,
            description,
            message: message.into(),
        }
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match value {
            nom::Err::Incomplete(_) => Error::ParseIncomplete,
            nom::Err::Error(x) | nom::Err::Failure(x) => Error::ParseError(x.code),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}
