//! Shared fixtures for the loopback integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tickwire::config::{ClientConfig, ServerConfig};
use tickwire::core::Reader;
use tickwire::error::Result;
use tickwire::protocol::dispatcher::Dispatcher;
use tickwire::protocol::handshake::Authenticator;
use tickwire::protocol::message::ConnectionId;
use tickwire::service::client::{Client, ClientContext, ClientObserver};
use tickwire::service::server::{Server, ServerContext};
use tickwire::transport::local::LocalNetwork;
use tickwire::transport::Transport;

pub const PORT: u16 = 7100;

/// One simulated frame
pub const STEP: Duration = Duration::from_millis(10);

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn server_config() -> ServerConfig {
    ServerConfig {
        port: PORT,
        max_connections: 4,
        auth_timeout: Duration::from_millis(500),
        reject_disconnect_delay: Duration::from_millis(100),
        request_timeout: Duration::from_secs(1),
    }
}

pub fn client_config() -> ClientConfig {
    ClientConfig {
        address: String::from("127.0.0.1"),
        port: PORT,
        request_timeout: Duration::from_secs(1),
    }
}

pub fn server(
    network: &LocalNetwork,
    dispatcher: Arc<Dispatcher>,
    authenticator: Arc<dyn Authenticator>,
) -> Server {
    server_with(network, server_config(), dispatcher, authenticator)
}

pub fn server_with(
    network: &LocalNetwork,
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    authenticator: Arc<dyn Authenticator>,
) -> Server {
    let mut server = Server::new(config, Box::new(network.endpoint()), dispatcher, authenticator);
    server.start().unwrap();
    server
}

pub fn client(
    network: &LocalNetwork,
    dispatcher: Arc<Dispatcher>,
    authenticator: Arc<dyn Authenticator>,
) -> Client {
    client_over(Box::new(network.endpoint()), dispatcher, authenticator)
}

pub fn client_over(
    transport: Box<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    authenticator: Arc<dyn Authenticator>,
) -> Client {
    let mut client = Client::new(client_config(), transport, dispatcher, authenticator);
    client.start().unwrap();
    client
}

/// Run `rounds` ticks: the server first, then every client
pub fn pump(server: &mut Server, clients: &mut [Client], rounds: usize) {
    for _ in 0..rounds {
        server.tick(STEP);
        for client in clients.iter_mut() {
            client.tick(STEP);
        }
    }
}

/// Leaves every auth request unanswered
pub struct SilentAuthenticator;

impl Authenticator for SilentAuthenticator {
    fn on_request(
        &self,
        _ctx: &mut ServerContext,
        _conn_id: ConnectionId,
        _request: &mut Reader<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Records client lifecycle callbacks
pub struct Recorder(pub Log);

impl ClientObserver for Recorder {
    fn on_authenticated(&mut self, _ctx: &mut ClientContext, conn_id: ConnectionId) {
        self.0.lock().unwrap().push(format!("accepted:{conn_id}"));
    }

    fn on_rejected(&mut self, _ctx: &mut ClientContext) {
        self.0.lock().unwrap().push(String::from("rejected"));
    }

    fn on_disconnected(&mut self, _ctx: &mut ClientContext, _info: &str) {
        self.0.lock().unwrap().push(String::from("disconnected"));
    }

    fn on_stopped(&mut self, _ctx: &mut ClientContext) {
        self.0.lock().unwrap().push(String::from("stopped"));
    }
}
