//! # Server
//!
//! Tick-driven server orchestration. [`Server::tick`] advances the clocks of
//! the per-connection tasks, the server-level tasks and the request
//! correlator, drains the transport's event queue through the [`Dispatcher`],
//! and then runs whatever came due.
//!
//! Everything handlers may touch lives in [`ServerContext`]; the handler
//! tables, the authenticator and the observers stay outside it so handlers can
//! borrow the context mutably while they run.
//!
//! A failing handler never takes the server down: the error is logged, the
//! observers are told, and only the offending connection is disconnected.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::config::ServerConfig;
use crate::core::{NetDeserialize, NetSerialize, Writer};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::{set_message, Dispatcher};
use crate::protocol::handshake::{AuthStage, Authenticator};
use crate::protocol::message::{
    ConnectionId, MessageId, RequestId, ACCEPT_TYPE, AUTH_RESPONSE, REJECT_TYPE,
};
use crate::protocol::request::{self, Correlator, Endpoint, Response, TimeoutScheduler};
use crate::service::connection::{
    Connection, ConnectionPool, ConnectionTask, AUTH_TIMEOUT_TASK, DISCONNECT_TASK,
};
use crate::transport::{DeliveryMethod, Transport, TransportEvent};
use crate::utils::metrics::Metrics;
use crate::utils::tasks::TaskManager;

/// Delayed action owned by the server
pub type ServerTask = Box<dyn FnOnce(&mut ServerContext) + Send>;

/// Server lifecycle hooks, fired synchronously inside `start`, `stop` and `tick`
/// in registration order
#[allow(unused_variables)]
pub trait ServerObserver: Send {
    fn on_started(&mut self, ctx: &mut ServerContext) {}

    fn on_stopped(&mut self, ctx: &mut ServerContext) {}

    fn on_connected(&mut self, ctx: &mut ServerContext, conn_id: ConnectionId) {}

    fn on_disconnected(&mut self, ctx: &mut ServerContext, conn_id: ConnectionId, info: &str) {}

    fn on_transport_error(&mut self, ctx: &mut ServerContext, error: &str) {}

    /// A frame from `conn_id` failed; the connection is being disconnected
    fn on_protocol_violation(
        &mut self,
        ctx: &mut ServerContext,
        conn_id: ConnectionId,
        error: &ProtocolError,
    ) {
    }
}

/// Server state reachable from handlers
pub struct ServerContext {
    config: ServerConfig,
    transport: Box<dyn Transport>,
    writer: Writer,
    connections: ConnectionPool,
    tasks: TaskManager<ServerTask>,
    correlator: Correlator,
    metrics: Arc<Metrics>,
    active: bool,
}

impl ServerContext {
    fn new(config: ServerConfig, transport: Box<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        Self {
            connections: ConnectionPool::new(config.max_connections),
            config,
            transport,
            writer: Writer::new(),
            tasks: TaskManager::new(),
            correlator: Correlator::new(Arc::clone(&metrics)),
            metrics,
            active: false,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn connection(&self, conn_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(conn_id)
    }

    pub(crate) fn connection_mut(&mut self, conn_id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(conn_id)
    }

    pub fn connections(&self) -> &ConnectionPool {
        &self.connections
    }

    /// Send a message to one connection
    pub fn send<T: NetSerialize + ?Sized>(
        &mut self,
        conn_id: ConnectionId,
        id: MessageId,
        delivery: DeliveryMethod,
        body: &T,
    ) -> Result<()> {
        self.send_frame(conn_id, id, delivery, |writer| writer.put(body))
    }

    /// Send a message without payload
    pub fn send_empty(
        &mut self,
        conn_id: ConnectionId,
        id: MessageId,
        delivery: DeliveryMethod,
    ) -> Result<()> {
        self.send_frame(conn_id, id, delivery, |_| Ok(()))
    }

    /// Send a message to every authenticated connection; returns how many got it
    pub fn broadcast<T: NetSerialize + ?Sized>(
        &mut self,
        id: MessageId,
        delivery: DeliveryMethod,
        body: &T,
    ) -> Result<usize> {
        set_message(&mut self.writer, id, |writer| writer.put(body))?;

        let targets: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|connection| connection.is_authenticated() && !connection.is_closing())
            .map(Connection::id)
            .collect();

        let mut sent = 0;
        for conn_id in targets {
            match self
                .transport
                .server_send(conn_id, self.writer.data(), delivery)
            {
                Ok(()) => {
                    self.metrics.message_sent(self.writer.position() as u64);
                    sent += 1;
                }
                Err(err) => warn!(conn_id, message_id = id, error = %err, "Broadcast send failed"),
            }
        }
        Ok(sent)
    }

    /// Ask the transport to drop `conn_id`. Frames still queued from it are
    /// ignored; the slot is freed on the transport's disconnect event.
    pub fn disconnect(&mut self, conn_id: ConnectionId) {
        if let Some(connection) = self.connections.get_mut(conn_id) {
            if connection.is_closing() {
                return;
            }
            connection.mark_closing();
        }
        debug!(conn_id, "Disconnecting");
        self.transport.disconnect(conn_id);
    }

    /// Arm the auth timeout of `conn_id`
    pub fn start_auth_timeout(&mut self, conn_id: ConnectionId) {
        let timeout = self.config.auth_timeout;
        if let Some(connection) = self.connections.get_mut(conn_id) {
            connection
                .tasks_mut()
                .schedule(AUTH_TIMEOUT_TASK, timeout, ConnectionTask::AuthTimeout);
        }
    }

    pub fn accept(&mut self, conn_id: ConnectionId) -> Result<()> {
        self.accept_with(conn_id, &())
    }

    /// Authenticate `conn_id` and send `[ACCEPT][conn_id][extra]`
    pub fn accept_with<T: NetSerialize + ?Sized>(
        &mut self,
        conn_id: ConnectionId,
        extra: &T,
    ) -> Result<()> {
        let connection = self
            .connections
            .get_mut(conn_id)
            .ok_or(ProtocolError::UnknownConnection(conn_id))?;
        if connection.stage() == AuthStage::Authenticated {
            return Err(ProtocolError::InvalidState(
                constants::ERR_ALREADY_AUTHENTICATED,
            ));
        }
        connection.advance_stage(AuthStage::Authenticated);
        connection.tasks_mut().cancel(AUTH_TIMEOUT_TASK);

        self.metrics.auth_accepted();
        info!(conn_id, "Connection authenticated");
        self.send_frame(conn_id, AUTH_RESPONSE, DeliveryMethod::Reliable, |writer| {
            writer.put_u8(ACCEPT_TYPE);
            writer.put_u32(conn_id);
            writer.put(extra)
        })
    }

    pub fn reject(&mut self, conn_id: ConnectionId) -> Result<()> {
        self.reject_with(conn_id, &())
    }

    /// Send `[REJECT][extra]` and disconnect after the configured grace period
    pub fn reject_with<T: NetSerialize + ?Sized>(
        &mut self,
        conn_id: ConnectionId,
        extra: &T,
    ) -> Result<()> {
        let delay = self.config.reject_disconnect_delay;
        let connection = self
            .connections
            .get_mut(conn_id)
            .ok_or(ProtocolError::UnknownConnection(conn_id))?;
        if connection.stage() == AuthStage::Authenticated {
            return Err(ProtocolError::InvalidState(
                constants::ERR_ALREADY_AUTHENTICATED,
            ));
        }
        let tasks = connection.tasks_mut();
        tasks.cancel(AUTH_TIMEOUT_TASK);
        tasks.schedule(DISCONNECT_TASK, delay, ConnectionTask::Disconnect);

        self.metrics.auth_rejected();
        info!(conn_id, delay_ms = delay.as_millis() as u64, "Connection rejected");
        self.send_frame(conn_id, AUTH_RESPONSE, DeliveryMethod::Reliable, |writer| {
            writer.put_u8(REJECT_TYPE);
            writer.put(extra)
        })
    }

    /// Run `action` after `delay`, replacing a pending task of the same name
    pub fn schedule<F>(&mut self, name: impl Into<Cow<'static, str>>, delay: Duration, action: F)
    where
        F: FnOnce(&mut ServerContext) + Send + 'static,
    {
        self.tasks.schedule(name, delay, Box::new(action));
    }

    pub fn cancel_task(&mut self, name: &str) -> bool {
        self.tasks.cancel(name)
    }

    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.contains(name)
    }

    /// Send a request to a client, with the configured request timeout
    pub fn send_request<Req, Resp, F>(
        &mut self,
        conn_id: ConnectionId,
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
        request::send_request(self, conn_id, target, request, timeout, callback)
    }

    /// Send a request with an explicit timeout; `Duration::ZERO` disables it
    pub fn send_request_with_timeout<Req, Resp, F>(
        &mut self,
        conn_id: ConnectionId,
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
        request::send_request(self, conn_id, target, request, timeout, callback)
    }
}

impl Endpoint for ServerContext {
    fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    fn correlator_mut(&mut self) -> &mut Correlator {
        &mut self.correlator
    }

    fn send_frame<F>(
        &mut self,
        peer: ConnectionId,
        id: MessageId,
        delivery: DeliveryMethod,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Writer) -> Result<()>,
    {
        set_message(&mut self.writer, id, body)?;
        self.transport
            .server_send(peer, self.writer.data(), delivery)?;
        self.metrics.message_sent(self.writer.position() as u64);
        Ok(())
    }
}

/// Server role: connection admission, auth gate, dispatch, scheduled tasks
pub struct Server {
    context: ServerContext,
    dispatcher: Arc<Dispatcher>,
    authenticator: Arc<dyn Authenticator>,
    observers: Vec<Box<dyn ServerObserver>>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        transport: Box<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            context: ServerContext::new(config, transport, Arc::new(Metrics::new())),
            dispatcher,
            authenticator,
            observers: Vec::new(),
        }
    }

    pub fn add_observer(&mut self, observer: impl ServerObserver + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn context(&self) -> &ServerContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ServerContext {
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

    pub fn set_timeout_scheduler(&mut self, scheduler: TimeoutScheduler) {
        self.context.correlator.set_scheduler(scheduler);
    }

    /// Declare the types of requests this server sends to `target`
    pub fn register_response_handler<Req: 'static, Resp: 'static>(
        &mut self,
        target: MessageId,
    ) -> Result<()> {
        self.context
            .correlator
            .register_response_handler::<Req, Resp>(target)
    }

    #[instrument(skip(self), fields(port = self.context.config.port))]
    pub fn start(&mut self) -> Result<()> {
        if self.context.active {
            return Err(ProtocolError::InvalidState(constants::ERR_SERVER_ACTIVE));
        }

        self.context
            .transport
            .start_server(self.context.config.port)?;
        self.context.connections.clear();
        self.context.tasks.cancel_all();
        self.context.correlator.reset();
        self.context.active = true;
        info!(
            max_connections = self.context.config.max_connections,
            "Server started"
        );

        for observer in self.observers.iter_mut() {
            observer.on_started(&mut self.context);
        }
        Ok(())
    }

    /// Stop listening. Pending requests and scheduled tasks are dropped without
    /// firing.
    #[instrument(skip(self))]
    pub fn stop(&mut self) -> Result<()> {
        if !self.context.active {
            return Err(ProtocolError::InvalidState(constants::ERR_SERVER_INACTIVE));
        }

        self.context.transport.stop_server();
        for _ in 0..self.context.connections.len() {
            self.context.metrics.connection_closed();
        }
        self.context.connections.clear();
        self.context.tasks.cancel_all();
        self.context.correlator.reset();
        self.context.active = false;
        info!("Server stopped");

        for observer in self.observers.iter_mut() {
            observer.on_stopped(&mut self.context);
        }
        Ok(())
    }

    /// One iteration of the server loop.
    ///
    /// Clocks move forward before events are handled, and expiry runs after,
    /// so a timer started by this frame's events waits its full duration of
    /// later ticks.
    pub fn tick(&mut self, elapsed: Duration) {
        if !self.context.active {
            return;
        }

        self.context.connections.advance(elapsed);
        self.context.tasks.advance(elapsed);
        self.context.correlator.advance(elapsed);

        while let Some(event) = self.context.transport.poll_event() {
            self.handle_event(event);
        }

        for (conn_id, task) in self.context.connections.take_due() {
            self.run_connection_task(conn_id, task);
        }

        for action in self.context.tasks.take_due() {
            action(&mut self.context);
        }

        if let Err(err) = self.context.correlator.expire_due() {
            error!(error = %err, "Request timeouts not processed");
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { conn_id, address } => self.on_connected(conn_id, &address),
            TransportEvent::Data {
                conn_id: Some(conn_id),
                payload,
            } => self.on_data(conn_id, &payload),
            TransportEvent::Data { conn_id: None, .. } => {
                warn!("Server received data without a connection id");
            }
            TransportEvent::Error(message) => {
                self.context.metrics.transport_error();
                warn!(error = %message, "Server transport error");
                for observer in self.observers.iter_mut() {
                    observer.on_transport_error(&mut self.context, &message);
                }
            }
            TransportEvent::Disconnected {
                conn_id: Some(conn_id),
                info,
            } => self.on_disconnected(conn_id, &info),
            TransportEvent::Disconnected {
                conn_id: None,
                info,
            } => {
                warn!(info = %info, "Server received a disconnect without a connection id");
            }
        }
    }

    fn on_connected(&mut self, conn_id: ConnectionId, address: &str) {
        if self.context.connections.acquire(conn_id, address).is_none() {
            self.context.metrics.connection_refused();
            warn!(
                conn_id,
                address,
                capacity = self.context.connections.capacity(),
                "Connection pool full; refusing connection"
            );
            self.context.transport.disconnect(conn_id);
            return;
        }

        self.context.metrics.connection_established();
        info!(conn_id, address, "Client connected");

        for observer in self.observers.iter_mut() {
            observer.on_connected(&mut self.context, conn_id);
        }

        if let Err(err) = self.authenticator.server_on_auth(&mut self.context, conn_id) {
            warn!(conn_id, error = %err, "Auth setup failed");
            self.context.disconnect(conn_id);
        }
    }

    fn on_data(&mut self, conn_id: ConnectionId, payload: &[u8]) {
        match self.context.connections.get(conn_id) {
            None => {
                debug!(conn_id, "Dropping data from unknown connection");
                return;
            }
            Some(connection) if connection.is_closing() => {
                debug!(conn_id, "Dropping data from closing connection");
                return;
            }
            Some(_) => {}
        }
        self.context.metrics.message_received(payload.len() as u64);

        let result = self.dispatcher.dispatch_server(
            &mut self.context,
            self.authenticator.as_ref(),
            conn_id,
            payload,
        );
        if let Err(err) = result {
            self.on_violation(conn_id, err);
        }
    }

    fn on_violation(&mut self, conn_id: ConnectionId, err: ProtocolError) {
        self.context.metrics.protocol_violation();
        warn!(conn_id, error = %err, "Disconnecting connection after failed message");
        for observer in self.observers.iter_mut() {
            observer.on_protocol_violation(&mut self.context, conn_id, &err);
        }
        self.context.disconnect(conn_id);
    }

    fn on_disconnected(&mut self, conn_id: ConnectionId, info: &str) {
        if !self.context.connections.contains(conn_id) {
            debug!(conn_id, "Disconnect for unknown connection ignored");
            return;
        }

        for observer in self.observers.iter_mut() {
            observer.on_disconnected(&mut self.context, conn_id, info);
        }
        self.context.connections.release(conn_id);
        self.context.metrics.connection_closed();
        info!(conn_id, info, "Client disconnected");
    }

    fn run_connection_task(&mut self, conn_id: ConnectionId, task: ConnectionTask) {
        match task {
            ConnectionTask::AuthTimeout => {
                let authenticated = self
                    .context
                    .connections
                    .get(conn_id)
                    .is_some_and(Connection::is_authenticated);
                if !authenticated {
                    self.context.metrics.auth_timed_out();
                    warn!(conn_id, "Authentication timed out");
                    self.context.disconnect(conn_id);
                }
            }
            ConnectionTask::Disconnect => self.context.disconnect(conn_id),
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.context.active {
            self.context.transport.stop_server();
        }
    }
}
