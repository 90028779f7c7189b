//! # Message Router
//!
//! Maps 16-bit message ids to handlers, per role. Four independent registries
//! (server plain, server with payload, client plain, client with payload) plus
//! the request-handler registry used by the request/response system.
//!
//! ## Dispatch order
//! 1. decode the message id
//! 2. auth check (server: stage gate; client: queue until accepted)
//! 3. request/response system messages
//! 4. with-payload handler if bytes remain after the id, plain handler otherwise
//! 5. anything else is an unregistered message
//!
//! Handlers are stored behind `Arc` and cloned out of the read lock before they
//! run, so a handler may register or unregister other handlers.
//!
//! ## Usage
//! ```rust
//! use tickwire::protocol::dispatcher::Dispatcher;
//! use tickwire::transport::DeliveryMethod;
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher
//!     .register_server_payload_handler(1, |ctx, conn_id, reader| {
//!         let text = reader.get_string()?;
//!         ctx.send(conn_id, 1, DeliveryMethod::Reliable, &text)
//!     })
//!     .unwrap();
//! assert!(dispatcher.register_server_payload_handler(1, |_, _, _| Ok(())).is_err());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::trace;

use crate::core::{NetDeserialize, NetSerialize, Reader, Writer};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::{self, AuthCheck, Authenticator};
use crate::protocol::message::{
    is_reserved, ConnectionId, MessageId, StatusCode, AUTH_RESPONSE, REQUEST, RESPONSE,
};
use crate::protocol::request::{self, Endpoint, Reply, RequestData, Responder};
use crate::service::client::{ClientContext, ClientHooks};
use crate::service::server::ServerContext;

/// Server handler for messages without payload
pub type ServerHandler = dyn Fn(&mut ServerContext, ConnectionId) -> Result<()> + Send + Sync;

/// Server handler for messages carrying a payload
pub type ServerPayloadHandler =
    dyn Fn(&mut ServerContext, ConnectionId, &mut Reader<'_>) -> Result<()> + Send + Sync;

/// Client handler for messages without payload
pub type ClientHandler = dyn Fn(&mut ClientContext) -> Result<()> + Send + Sync;

/// Client handler for messages carrying a payload
pub type ClientPayloadHandler =
    dyn Fn(&mut ClientContext, &mut Reader<'_>) -> Result<()> + Send + Sync;

/// What a type-erased request handler produced
enum Answer {
    /// Status and encoded body, sent before dispatch returns
    Now(StatusCode, Writer),
    /// A [`Responder`] owns the request and answers later
    Later,
}

/// Type-erased request handler: decodes the request and answers it
type RequestHandler = dyn Fn(RequestData, &mut Reader<'_>) -> Result<Answer> + Send + Sync;

struct Registry<H: ?Sized> {
    kind: &'static str,
    handlers: RwLock<HashMap<MessageId, Arc<H>>>,
}

impl<H: ?Sized> Registry<H> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, id: MessageId, handler: Arc<H>) -> Result<()> {
        if is_reserved(id) {
            return Err(ProtocolError::ReservedMessageId(id));
        }
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::LockPoisoned)?;
        if handlers.contains_key(&id) {
            return Err(ProtocolError::DuplicateHandler {
                kind: self.kind,
                id,
            });
        }
        handlers.insert(id, handler);
        Ok(())
    }

    fn remove(&self, id: MessageId) -> Result<bool> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::LockPoisoned)?;
        Ok(handlers.remove(&id).is_some())
    }

    fn get(&self, id: MessageId) -> Result<Option<Arc<H>>> {
        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::LockPoisoned)?;
        Ok(handlers.get(&id).cloned())
    }

    fn contains(&self, id: MessageId) -> bool {
        self.handlers
            .read()
            .map(|handlers| handlers.contains_key(&id))
            .unwrap_or(false)
    }
}

/// Handler tables shared by the server and client of one process
pub struct Dispatcher {
    server: Registry<ServerHandler>,
    server_payload: Registry<ServerPayloadHandler>,
    client: Registry<ClientHandler>,
    client_payload: Registry<ClientPayloadHandler>,
    requests: Registry<RequestHandler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            server: Registry::new("server"),
            server_payload: Registry::new("server-payload"),
            client: Registry::new("client"),
            client_payload: Registry::new("client-payload"),
            requests: Registry::new("request"),
        }
    }

    pub fn register_server_handler<F>(&self, id: MessageId, handler: F) -> Result<()>
    where
        F: Fn(&mut ServerContext, ConnectionId) -> Result<()> + Send + Sync + 'static,
    {
        self.server.insert(id, Arc::new(handler))
    }

    pub fn register_server_payload_handler<F>(&self, id: MessageId, handler: F) -> Result<()>
    where
        F: Fn(&mut ServerContext, ConnectionId, &mut Reader<'_>) -> Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.server_payload.insert(id, Arc::new(handler))
    }

    pub fn register_client_handler<F>(&self, id: MessageId, handler: F) -> Result<()>
    where
        F: Fn(&mut ClientContext) -> Result<()> + Send + Sync + 'static,
    {
        self.client.insert(id, Arc::new(handler))
    }

    pub fn register_client_payload_handler<F>(&self, id: MessageId, handler: F) -> Result<()>
    where
        F: Fn(&mut ClientContext, &mut Reader<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.client_payload.insert(id, Arc::new(handler))
    }

    /// Register the handler answering requests that target `target`.
    ///
    /// Works in both directions: the server answers client requests and the
    /// client answers server requests with the same table.
    pub fn register_request_handler<Req, Resp, F>(&self, target: MessageId, handler: F) -> Result<()>
    where
        Req: NetDeserialize + 'static,
        Resp: NetSerialize + 'static,
        F: Fn(RequestData, Req) -> Result<Resp> + Send + Sync + 'static,
    {
        self.register_request_handler_with_status::<Req, Resp, _>(target, move |data, request| {
            handler(data, request).map(Reply::Success)
        })
    }

    /// Like [`register_request_handler`](Self::register_request_handler), but
    /// the handler picks the response status
    pub fn register_request_handler_with_status<Req, Resp, F>(
        &self,
        target: MessageId,
        handler: F,
    ) -> Result<()>
    where
        Req: NetDeserialize + 'static,
        Resp: NetSerialize + 'static,
        F: Fn(RequestData, Req) -> Result<Reply<Resp>> + Send + Sync + 'static,
    {
        let erased: Arc<RequestHandler> =
            Arc::new(move |data: RequestData, reader: &mut Reader<'_>| -> Result<Answer> {
                let request = reader.get::<Req>()?;
                let (status, body) = handler(data, request)?.encode()?;
                Ok(Answer::Now(status, body))
            });
        self.requests.insert(target, erased)
    }

    /// Register a handler that answers later through a [`Responder`].
    ///
    /// Nothing is sent when the handler returns; the responder sends the
    /// RESPONSE frame whenever it is used, typically from a later tick.
    pub fn register_deferred_request_handler<Req, Resp, F>(
        &self,
        target: MessageId,
        handler: F,
    ) -> Result<()>
    where
        Req: NetDeserialize + 'static,
        Resp: NetSerialize + 'static,
        F: Fn(RequestData, Req, Responder<Resp>) -> Result<()> + Send + Sync + 'static,
    {
        let erased: Arc<RequestHandler> =
            Arc::new(move |data: RequestData, reader: &mut Reader<'_>| -> Result<Answer> {
                let request = reader.get::<Req>()?;
                handler(data, request, Responder::new(data))?;
                Ok(Answer::Later)
            });
        self.requests.insert(target, erased)
    }

    /// Remove `id` from all four message registries
    pub fn unregister(&self, id: MessageId) -> Result<()> {
        self.server.remove(id)?;
        self.server_payload.remove(id)?;
        self.client.remove(id)?;
        self.client_payload.remove(id)?;
        Ok(())
    }

    pub fn unregister_request_handler(&self, target: MessageId) -> Result<bool> {
        self.requests.remove(target)
    }

    /// Whether any message registry knows `id`
    pub fn is_registered(&self, id: MessageId) -> bool {
        self.server.contains(id)
            || self.server_payload.contains(id)
            || self.client.contains(id)
            || self.client_payload.contains(id)
    }

    pub fn has_request_handler(&self, target: MessageId) -> bool {
        self.requests.contains(target)
    }

    /// Route one frame received by the server from `conn_id`
    pub fn dispatch_server(
        &self,
        ctx: &mut ServerContext,
        authenticator: &dyn Authenticator,
        conn_id: ConnectionId,
        frame: &[u8],
    ) -> Result<()> {
        let mut reader = Reader::new(frame);
        let id = reader.get_u16()?;
        trace!(conn_id, message_id = id, len = frame.len(), "Server dispatch");

        if handshake::server_auth_check(ctx, authenticator, conn_id, id, &mut reader)?
            == AuthCheck::Consumed
        {
            return Ok(());
        }

        match id {
            REQUEST => return self.handle_request(ctx, conn_id, &mut reader),
            RESPONSE => return request::receive_response(ctx, conn_id, &mut reader),
            _ => {}
        }

        if reader.available() > 0 {
            if let Some(handler) = self.server_payload.get(id)? {
                return handler(ctx, conn_id, &mut reader);
            }
        } else if let Some(handler) = self.server.get(id)? {
            return handler(ctx, conn_id);
        }

        Err(ProtocolError::UnregisteredMessage { kind: "server", id })
    }

    /// Route one frame received by the client.
    ///
    /// Until the accept response is processed every frame other than the auth
    /// response is queued; the queue is replayed through this method right
    /// after the accepted callbacks ran.
    pub fn dispatch_client(
        &self,
        ctx: &mut ClientContext,
        hooks: &mut ClientHooks,
        frame: &[u8],
    ) -> Result<()> {
        let mut reader = Reader::new(frame);
        let id = reader.get_u16()?;
        trace!(message_id = id, len = frame.len(), "Client dispatch");

        if id == AUTH_RESPONSE {
            return handshake::client_handle_auth_response(self, ctx, hooks, &mut reader);
        }
        if !ctx.is_authenticated() {
            ctx.queue_until_authenticated(frame);
            return Ok(());
        }

        match id {
            REQUEST => return self.handle_request(ctx, 0, &mut reader),
            RESPONSE => return request::receive_response(ctx, 0, &mut reader),
            _ => {}
        }

        if reader.available() > 0 {
            if let Some(handler) = self.client_payload.get(id)? {
                return handler(ctx, &mut reader);
            }
        } else if let Some(handler) = self.client.get(id)? {
            return handler(ctx);
        }

        Err(ProtocolError::UnregisteredMessage { kind: "client", id })
    }

    /// Answer a REQUEST frame. Exactly one RESPONSE frame goes back unless the
    /// request itself is malformed or the handler deferred its answer.
    fn handle_request<E: Endpoint>(
        &self,
        endpoint: &mut E,
        sender: ConnectionId,
        reader: &mut Reader<'_>,
    ) -> Result<()> {
        let target = reader.get_u16()?;
        let request_id = reader.get_u32()?;

        let Some(handler) = self.requests.get(target)? else {
            request::send_response(endpoint, sender, request_id, StatusCode::Unregistered, &[])?;
            return Err(ProtocolError::UnregisteredRequest(target));
        };

        let data = RequestData {
            sender,
            request_id,
            target,
        };
        match handler(data, reader)? {
            Answer::Now(status, body) => {
                request::send_response(endpoint, sender, request_id, status, body.data())
            }
            Answer::Later => {
                trace!(sender, request_id, target, "Request answer deferred");
                Ok(())
            }
        }
    }
}

/// Reset `writer`, write the message id, then the body.
///
/// Every outbound frame goes through here.
pub fn set_message<F>(writer: &mut Writer, id: MessageId, body: F) -> Result<()>
where
    F: FnOnce(&mut Writer) -> Result<()>,
{
    writer.set_position(0);
    writer.put_u16(id);
    body(writer)
}
