//! # Client
//!
//! Tick-driven client orchestration. Until the server's accept arrives the
//! client does not dispatch anything: frames are queued in arrival order and
//! replayed right after the accepted callbacks ran.
//!
//! Protocol violations stop the client and reach the observers through
//! [`ClientObserver::on_error`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::config::ClientConfig;
use crate::core::{NetDeserialize, NetSerialize, Reader, Writer};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{set_message, Dispatcher};
use crate::protocol::handshake::Authenticator;
use crate::protocol::message::{ConnectionId, MessageId, RequestId, AUTH_REQUEST};
use crate::protocol::request::{self, Correlator, Endpoint, Response, TimeoutScheduler};
use crate::transport::{DeliveryMethod, Transport, TransportEvent};
use crate::utils::metrics::Metrics;

/// Client lifecycle hooks, fired synchronously in registration order
#[allow(unused_variables)]
pub trait ClientObserver: Send {
    fn on_started(&mut self, ctx: &mut ClientContext) {}

    fn on_stopped(&mut self, ctx: &mut ClientContext) {}

    /// The transport connected; the auth request has not been sent yet
    fn on_connected(&mut self, ctx: &mut ClientContext) {}

    /// Runs before any message queued during the handshake is dispatched
    fn on_authenticated(&mut self, ctx: &mut ClientContext, conn_id: ConnectionId) {}

    fn on_rejected(&mut self, ctx: &mut ClientContext) {}

    fn on_disconnected(&mut self, ctx: &mut ClientContext, info: &str) {}

    fn on_transport_error(&mut self, ctx: &mut ClientContext, error: &str) {}

    /// A frame failed; the client is stopping
    fn on_error(&mut self, ctx: &mut ClientContext, error: &ProtocolError) {}
}

/// Authenticator plus observers; the callbacks the handshake runs
pub struct ClientHooks {
    authenticator: Arc<dyn Authenticator>,
    observers: Vec<Box<dyn ClientObserver>>,
}

impl ClientHooks {
    pub(crate) fn accepted(&mut self, ctx: &mut ClientContext, extra: &mut Reader<'_>) -> Result<()> {
        ctx.metrics.auth_accepted();
        self.authenticator.client_on_accepted(ctx, extra)?;
        let conn_id = ctx.conn_id;
        for observer in self.observers.iter_mut() {
            observer.on_authenticated(ctx, conn_id);
        }
        Ok(())
    }

    pub(crate) fn rejected(&mut self, ctx: &mut ClientContext, extra: &mut Reader<'_>) -> Result<()> {
        ctx.metrics.auth_rejected();
        self.authenticator.client_on_rejected(ctx, extra)?;
        for observer in self.observers.iter_mut() {
            observer.on_rejected(ctx);
        }
        Ok(())
    }
}

/// Client state reachable from handlers
pub struct ClientContext {
    config: ClientConfig,
    transport: Box<dyn Transport>,
    writer: Writer,
    correlator: Correlator,
    metrics: Arc<Metrics>,
    conn_id: ConnectionId,
    auth_queue: VecDeque<Bytes>,
    stop_reason: Option<String>,
    connected: bool,
    active: bool,
}

impl ClientContext {
    fn new(config: ClientConfig, transport: Box<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            transport,
            writer: Writer::new(),
            correlator: Correlator::new(Arc::clone(&metrics)),
            metrics,
            conn_id: 0,
            auth_queue: VecDeque::new(),
            stop_reason: None,
            connected: false,
            active: false,
        }
    }

    fn reset_session(&mut self) {
        self.conn_id = 0;
        self.auth_queue.clear();
        self.stop_reason = None;
        self.connected = false;
        self.correlator.reset();
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Id assigned by the server; 0 until accepted
    pub fn conn_id(&self) -> ConnectionId {
        self.conn_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.conn_id != 0
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn send<T: NetSerialize + ?Sized>(
        &mut self,
        id: MessageId,
        delivery: DeliveryMethod,
        body: &T,
    ) -> Result<()> {
        self.send_frame(0, id, delivery, |writer| writer.put(body))
    }

    pub fn send_empty(&mut self, id: MessageId, delivery: DeliveryMethod) -> Result<()> {
        self.send_frame(0, id, delivery, |_| Ok(()))
    }

    /// Send the auth request frame with `body` as payload
    pub fn send_auth_request<T: NetSerialize + ?Sized>(&mut self, body: &T) -> Result<()> {
        self.metrics.auth_requested();
        self.send_frame(0, AUTH_REQUEST, DeliveryMethod::Reliable, |writer| {
            writer.put(body)
        })
    }

    /// Send a request to the server, with the configured request timeout
    pub fn send_request<Req, Resp, F>(
        &mut self,
        target: MessageId,
        request: &Req,
        callback: F,
    ) -> Result<RequestId>
    where
        Req: NetSerialize + 'static,
        Resp: NetDeserialize + 'static,
        F: FnOnce(Response<Resp>) + Send + 'static,
    {
        let timeout = self.config.request_timeout;
        request::send_request(self, 0, target, request, timeout, callback)
    }

    /// Send a request with an explicit timeout; `Duration::ZERO` disables it
    pub fn send_request_with_timeout<Req, Resp, F>(
        &mut self,
        target: MessageId,
        request: &Req,
        timeout: Duration,
        callback: F,
    ) -> Result<RequestId>
    where
        Req: NetSerialize + 'static,
        Resp: NetDeserialize + 'static,
        F: FnOnce(Response<Resp>) + Send + 'static,
    {
        request::send_request(self, 0, target, request, timeout, callback)
    }

    /// Stop the client at the end of the current event
    pub fn request_stop(&mut self, reason: impl Into<String>) {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason.into());
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_reason.is_some()
    }

    pub fn queued_len(&self) -> usize {
        self.auth_queue.len()
    }

    pub(crate) fn set_authenticated(&mut self, conn_id: ConnectionId) {
        self.conn_id = conn_id;
    }

    pub(crate) fn queue_until_authenticated(&mut self, frame: &[u8]) {
        debug!(len = frame.len(), queued = self.auth_queue.len() + 1, "Queueing frame until authenticated");
        self.auth_queue.push_back(Bytes::copy_from_slice(frame));
    }

    pub(crate) fn pop_queued(&mut self) -> Option<Bytes> {
        self.auth_queue.pop_front()
    }

    pub(crate) fn clear_queue(&mut self) {
        self.auth_queue.clear();
    }
}

impl Endpoint for ClientContext {
    fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    fn correlator_mut(&mut self) -> &mut Correlator {
        &mut self.correlator
    }

    fn send_frame<F>(
        &mut self,
        _peer: ConnectionId,
        id: MessageId,
        delivery: DeliveryMethod,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Writer) -> Result<()>,
    {
        set_message(&mut self.writer, id, body)?;
        self.transport.client_send(self.writer.data(), delivery)?;
        self.metrics.message_sent(self.writer.position() as u64);
        Ok(())
    }
}

/// Client role: handshake, dispatch, request timeouts
pub struct Client {
    context: ClientContext,
    dispatcher: Arc<Dispatcher>,
    hooks: ClientHooks,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        transport: Box<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            context: ClientContext::new(config, transport, Arc::new(Metrics::new())),
            dispatcher,
            hooks: ClientHooks {
                authenticator,
                observers: Vec::new(),
            },
        }
    }

    pub fn add_observer(&mut self, observer: impl ClientObserver + 'static) {
        self.hooks.observers.push(Box::new(observer));
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ClientContext {
        &mut self.context
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.context.metrics
    }

    pub fn is_active(&self) -> bool {
        self.context.active
    }

    pub fn is_authenticated(&self) -> bool {
        self.context.is_authenticated()
    }

    pub fn set_timeout_scheduler(&mut self, scheduler: TimeoutScheduler) {
        self.context.correlator.set_scheduler(scheduler);
    }

    /// Declare the types of requests this client sends to `target`
    pub fn register_response_handler<Req: 'static, Resp: 'static>(
        &mut self,
        target: MessageId,
    ) -> Result<()> {
        self.context
            .correlator
            .register_response_handler::<Req, Resp>(target)
    }

    /// Connect to the configured address
    pub fn start(&mut self) -> Result<()> {
        let address = self.context.config.address.clone();
        let port = self.context.config.port;
        self.connect(&address, port)
    }

    #[instrument(skip(self))]
    pub fn connect(&mut self, address: &str, port: u16) -> Result<()> {
        if self.context.active {
            return Err(ProtocolError::InvalidState(constants::ERR_CLIENT_ACTIVE));
        }

        self.context.reset_session();
        self.context.transport.start_client(address, port)?;
        self.context.active = true;
        info!("Client started");

        for observer in self.hooks.observers.iter_mut() {
            observer.on_started(&mut self.context);
        }
        Ok(())
    }

    /// Disconnect. Queued frames and pending requests are dropped without firing.
    pub fn stop(&mut self) -> Result<()> {
        if !self.context.active {
            return Err(ProtocolError::InvalidState(constants::ERR_CLIENT_INACTIVE));
        }
        self.shutdown("stopped");
        Ok(())
    }

    /// One iteration of the client loop
    pub fn tick(&mut self, elapsed: Duration) {
        if !self.context.active {
            return;
        }

        self.context.correlator.advance(elapsed);
        while let Some(event) = self.context.transport.poll_event() {
            self.handle_event(event);
            if self.context.stop_requested() {
                break;
            }
        }

        if let Some(reason) = self.context.stop_reason.take() {
            self.shutdown(&reason);
            return;
        }

        if let Err(err) = self.context.correlator.expire_due() {
            warn!(error = %err, "Request timeouts not processed");
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { address, .. } => {
                self.context.connected = true;
                info!(address = %address, "Connected; authenticating");
                for observer in self.hooks.observers.iter_mut() {
                    observer.on_connected(&mut self.context);
                }
                if let Err(err) = self.hooks.authenticator.client_on_auth(&mut self.context) {
                    self.fail(err);
                }
            }
            TransportEvent::Data { payload, .. } => {
                self.context.metrics.message_received(payload.len() as u64);
                let result =
                    self.dispatcher
                        .dispatch_client(&mut self.context, &mut self.hooks, &payload);
                if let Err(err) = result {
                    self.fail(err);
                }
            }
            TransportEvent::Error(message) => {
                self.context.metrics.transport_error();
                warn!(error = %message, "Client transport error");
                for observer in self.hooks.observers.iter_mut() {
                    observer.on_transport_error(&mut self.context, &message);
                }
            }
            TransportEvent::Disconnected { info, .. } => {
                info!(info = %info, "Disconnected from server");
                self.context.connected = false;
                for observer in self.hooks.observers.iter_mut() {
                    observer.on_disconnected(&mut self.context, &info);
                }
                self.context.request_stop(info);
            }
        }
    }

    fn fail(&mut self, err: ProtocolError) {
        self.context.metrics.protocol_violation();
        warn!(error = %err, "Client stopping after failed message");
        for observer in self.hooks.observers.iter_mut() {
            observer.on_error(&mut self.context, &err);
        }
        self.context.request_stop(err.to_string());
    }

    fn shutdown(&mut self, reason: &str) {
        self.context.transport.stop_client();
        self.context.reset_session();
        self.context.active = false;
        info!(reason, "Client stopped");

        for observer in self.hooks.observers.iter_mut() {
            observer.on_stopped(&mut self.context);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.context.active {
            self.context.transport.stop_client();
        }
    }
}
