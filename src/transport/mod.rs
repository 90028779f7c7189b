//! # Transport Boundary
//!
//! The core never touches sockets. A [`Transport`] moves opaque frames between
//! peers and reports what happened through a non-blocking event source that the
//! owning role drains once per tick.
//!
//! ## Contract
//! - `poll_event` never blocks; `None` means the queue is empty for now
//! - `disconnect(conn_id)` must eventually surface a `Disconnected` event for that id
//! - ordering and reliability are the transport's business; `DeliveryMethod`
//!   only selects the guarantee
//!
//! [`local::LocalNetwork`] provides an in-process implementation.

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::message::ConnectionId;

pub mod local;

/// Transport-level delivery guarantee selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeliveryMethod {
    /// Delivered once, in order
    #[default]
    Reliable,
    /// May be dropped or reordered
    Unreliable,
}

/// Something the transport observed since the last poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer connected. On the client side `conn_id` is transport-local and not
    /// the id assigned by the server handshake.
    Connected {
        conn_id: ConnectionId,
        address: String,
    },
    /// A frame arrived. `conn_id` is `None` on the client side.
    Data {
        conn_id: Option<ConnectionId>,
        payload: Bytes,
    },
    /// Non-fatal transport failure
    Error(String),
    /// A peer went away. `conn_id` is `None` on the client side.
    Disconnected {
        conn_id: Option<ConnectionId>,
        info: String,
    },
}

/// External collaborator moving frames between server and clients
pub trait Transport: Send {
    fn start_server(&mut self, port: u16) -> Result<()>;

    fn start_client(&mut self, address: &str, port: u16) -> Result<()>;

    fn stop_server(&mut self);

    fn stop_client(&mut self);

    fn server_send(
        &mut self,
        conn_id: ConnectionId,
        frame: &[u8],
        delivery: DeliveryMethod,
    ) -> Result<()>;

    fn client_send(&mut self, frame: &[u8], delivery: DeliveryMethod) -> Result<()>;

    /// Drop a server-side connection
    fn disconnect(&mut self, conn_id: ConnectionId);

    /// Next pending event, without blocking
    fn poll_event(&mut self) -> Option<TransportEvent>;
}
