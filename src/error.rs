//! # Error Types
//!
//! Error handling for the codec, router, correlator and connection orchestration.
//!
//! ## Error Categories
//! - **Decode Errors**: reading past the end of a frame, invalid UTF-8, invalid chars
//! - **Registration Errors**: duplicate handler ids, ids inside the reserved system range
//! - **Protocol Violations**: duplicate auth requests, messages before authentication,
//!   unregistered message ids, unknown status codes
//! - **Lifecycle Errors**: starting an active role, stopping an inactive one
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! Request outcomes (`Unregistered`, `Timeout`) are *not* errors; they are delivered
//! as [`StatusCode`](crate::protocol::message::StatusCode) values through the
//! request callback.
//!
//! ## Example Usage
//! ```rust
//! use tickwire::core::reader::Reader;
//! use tickwire::error::ProtocolError;
//!
//! let mut reader = Reader::new(&[0x01]);
//! match reader.get_u32() {
//!     Err(ProtocolError::UnexpectedEof { needed, available }) => {
//!         assert_eq!((needed, available), (4, 1));
//!     }
//!     other => panic!("unexpected: {other:?}"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Lock errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Lifecycle errors
    pub const ERR_SERVER_ACTIVE: &str = "Unable to start server (already active)";
    pub const ERR_SERVER_INACTIVE: &str = "Unable to stop server (inactive)";
    pub const ERR_CLIENT_ACTIVE: &str = "Unable to start client (already active)";
    pub const ERR_CLIENT_INACTIVE: &str = "Unable to stop client (inactive)";
    pub const ERR_ALREADY_AUTHENTICATED: &str = "Connection is already authenticated";

    /// Request errors
    pub const ERR_SUCCESS_WITHOUT_BODY: &str = "A success response needs a body";

    /// Transport errors
    pub const ERR_NOT_LISTENING: &str = "Server transport is not listening";
    pub const ERR_NOT_CONNECTED: &str = "Client transport is not connected";
    pub const ERR_PORT_IN_USE: &str = "Port is already in use";
}

/// ProtocolError is the primary error type for all operations in this crate
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Read past the end of the message ({available}/{needed} bytes available)")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("Invalid UTF-8 in string payload")]
    InvalidUtf8,

    #[error("Invalid char code: {0:#06x}")]
    InvalidChar(u16),

    #[error("Array too long to encode: {0} elements")]
    ArrayTooLong(usize),

    #[error("Unable to register a message ('{kind}->{id}' is already registered)")]
    DuplicateHandler { kind: &'static str, id: u16 },

    #[error("Message id {0} is reserved for system messages")]
    ReservedMessageId(u16),

    #[error("Received an unregistered message ('{kind}->{id}')")]
    UnregisteredMessage { kind: &'static str, id: u16 },

    #[error("Received an unregistered request ({0})")]
    UnregisteredRequest(u16),

    #[error("Request type mismatch for {id}: expected {expected}, got {actual}")]
    RequestTypeMismatch {
        id: u16,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Received multiple auth requests")]
    MultipleAuthRequests,

    #[error("Received an unauthorized message ({0})")]
    Unauthorized(u16),

    #[error("Unknown auth response type: {0}")]
    UnknownAuthResponse(u8),

    #[error("Unknown request status code: {0}")]
    UnknownStatusCode(u8),

    #[error("Unknown connection: {0}")]
    UnknownConnection(u32),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{}", constants::ERR_LOCK_POISONED)]
    LockPoisoned,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error is a peer misbehaving (as opposed to local misuse)
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::UnexpectedEof { .. }
                | ProtocolError::InvalidUtf8
                | ProtocolError::InvalidChar(_)
                | ProtocolError::UnregisteredMessage { .. }
                | ProtocolError::UnregisteredRequest(_)
                | ProtocolError::MultipleAuthRequests
                | ProtocolError::Unauthorized(_)
                | ProtocolError::UnknownAuthResponse(_)
                | ProtocolError::UnknownStatusCode(_)
                | ProtocolError::Serialization(_)
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
