//! # Wire Messages
//!
//! Every frame starts with a `u16` message id followed by an opaque payload.
//! The top of the id space is reserved for system messages; application code
//! can never register handlers there.
//!
//! ## Reserved Ids
//! ```text
//! 0xFFFF  AUTH_REQUEST    client -> server
//! 0xFFFE  AUTH_RESPONSE   server -> client   [u8 type][u32 connId if accepted][extra]
//! 0xFFFD  REQUEST         either direction   [u16 target][u32 requestId][body]
//! 0xFFFC  RESPONSE        either direction   [u32 requestId][u8 status][body]
//! 0xFFF0..=0xFFFB         reserved for future system messages
//! ```

use bytes::Bytes;

use crate::core::{Reader, Writer};
use crate::error::{ProtocolError, Result};

/// Identifier selecting a message handler
pub type MessageId = u16;

/// Server-assigned connection identifier; 0 means "not assigned"
pub type ConnectionId = u32;

/// Per-session request correlation identifier; 0 means "no request"
pub type RequestId = u32;

/// First id of the reserved system range
pub const RESERVED_ID_START: MessageId = 0xFFF0;

/// Auth request sent by the client after connecting
pub const AUTH_REQUEST: MessageId = 0xFFFF;

/// Auth decision sent by the server
pub const AUTH_RESPONSE: MessageId = 0xFFFE;

/// Request frame of the request/response system
pub const REQUEST: MessageId = 0xFFFD;

/// Response frame of the request/response system
pub const RESPONSE: MessageId = 0xFFFC;

/// Auth response type byte: accepted, followed by the assigned connection id
pub const ACCEPT_TYPE: u8 = 100;

/// Auth response type byte: rejected
pub const REJECT_TYPE: u8 = 0;

/// Whether `id` falls in the reserved system range
#[inline]
pub fn is_reserved(id: MessageId) -> bool {
    id >= RESERVED_ID_START
}

/// Outcome of a request, delivered to the requester's callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    /// The peer (or the local side) has no handler for the target id
    Unregistered = 1,
    /// No response arrived before the request timed out
    Timeout = 2,
    /// The peer handled the request; the response body follows
    Success = 100,
}

impl StatusCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// # Errors
    /// Returns `ProtocolError::UnknownStatusCode` for bytes outside the known set
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(StatusCode::Unregistered),
            2 => Ok(StatusCode::Timeout),
            100 => Ok(StatusCode::Success),
            other => Err(ProtocolError::UnknownStatusCode(other)),
        }
    }
}

/// An ephemeral `{id, payload}` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// A message without payload
    pub fn empty(id: MessageId) -> Self {
        Self {
            id,
            payload: Bytes::new(),
        }
    }

    /// Split a received frame into id and payload
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(frame);
        let id = reader.get_u16()?;
        Ok(Self {
            id,
            payload: Bytes::copy_from_slice(reader.get_remaining()),
        })
    }

    /// Write the frame into `writer`, replacing whatever it held
    pub fn write_to(&self, writer: &mut Writer) {
        writer.set_position(0);
        writer.put_u16(self.id);
        writer.put_raw(&self.payload);
    }

    pub fn to_frame(&self) -> Bytes {
        let mut frame = Vec::with_capacity(2 + self.payload.len());
        frame.extend_from_slice(&self.id.to_le_bytes());
        frame.extend_from_slice(&self.payload);
        Bytes::from(frame)
    }
}
