//! # Host Facade
//!
//! [`NetManager`] owns one server and one client that share a single handler
//! table, and drives both from one `tick`. Running both roles at once is a
//! "host": the local client connects to the local server over loopback.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tickwire::config::NetworkConfig;
//! use tickwire::protocol::handshake::AcceptAllAuthenticator;
//! use tickwire::service::manager::NetManager;
//! use tickwire::transport::local::LocalNetwork;
//!
//! let network = LocalNetwork::new();
//! let mut manager = NetManager::new(
//!     NetworkConfig::default(),
//!     Arc::new(AcceptAllAuthenticator),
//!     Box::new(network.endpoint()),
//!     Box::new(network.endpoint()),
//! )
//! .unwrap();
//!
//! manager.start_host().unwrap();
//! for _ in 0..4 {
//!     manager.tick(Duration::from_millis(16));
//! }
//! assert!(manager.client().is_authenticated());
//! manager.shutdown();
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::config::NetworkConfig;
use crate::error::Result;
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::Authenticator;
use crate::protocol::message::MessageId;
use crate::service::client::Client;
use crate::service::server::Server;
use crate::transport::Transport;

/// Address the host's own client connects to
pub const LOOPBACK_ADDRESS: &str = "127.0.0.1";

/// Server and client roles of one process
pub struct NetManager {
    config: NetworkConfig,
    dispatcher: Arc<Dispatcher>,
    server: Server,
    client: Client,
}

impl NetManager {
    /// Validate `config` and build both roles around one shared [`Dispatcher`]
    pub fn new(
        config: NetworkConfig,
        authenticator: Arc<dyn Authenticator>,
        server_transport: Box<dyn Transport>,
        client_transport: Box<dyn Transport>,
    ) -> Result<Self> {
        config.validate_strict()?;

        let dispatcher = Arc::new(Dispatcher::new());
        let server = Server::new(
            config.server.clone(),
            server_transport,
            Arc::clone(&dispatcher),
            Arc::clone(&authenticator),
        );
        let client = Client::new(
            config.client.clone(),
            client_transport,
            Arc::clone(&dispatcher),
            authenticator,
        );

        Ok(Self {
            config,
            dispatcher,
            server,
            client,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Handler table shared by both roles
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut Server {
        &mut self.server
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut Client {
        &mut self.client
    }

    /// Declare request/response types for `target` on both roles
    pub fn register_response_handler<Req: 'static, Resp: 'static>(
        &mut self,
        target: MessageId,
    ) -> Result<()> {
        self.server.register_response_handler::<Req, Resp>(target)?;
        self.client.register_response_handler::<Req, Resp>(target)
    }

    pub fn start_server(&mut self) -> Result<()> {
        self.server.start()
    }

    pub fn stop_server(&mut self) -> Result<()> {
        self.server.stop()
    }

    pub fn start_client(&mut self) -> Result<()> {
        self.client.start()
    }

    pub fn stop_client(&mut self) -> Result<()> {
        self.client.stop()
    }

    /// Start the server, then connect the local client to it.
    ///
    /// If the client cannot start the server is stopped again.
    #[instrument(skip(self), fields(port = self.config.server.port))]
    pub fn start_host(&mut self) -> Result<()> {
        self.server.start()?;

        let port = self.config.server.port;
        if let Err(err) = self.client.connect(LOOPBACK_ADDRESS, port) {
            warn!(error = %err, "Host client failed to start; stopping server");
            if let Err(stop_err) = self.server.stop() {
                warn!(error = %stop_err, "Server stop after failed host start");
            }
            return Err(err);
        }
        info!("Host started");
        Ok(())
    }

    /// Stop the local client, then the server
    pub fn stop_host(&mut self) -> Result<()> {
        let client = self.client.stop();
        let server = self.server.stop();
        client.and(server)
    }

    pub fn is_server_active(&self) -> bool {
        self.server.is_active()
    }

    pub fn is_client_active(&self) -> bool {
        self.client.is_active()
    }

    pub fn is_host(&self) -> bool {
        self.is_server_active() && self.is_client_active()
    }

    /// Drive both roles: the server first, then the client
    pub fn tick(&mut self, elapsed: Duration) {
        self.server.tick(elapsed);
        self.client.tick(elapsed);
    }

    /// Stop whichever roles are active
    pub fn shutdown(&mut self) {
        if self.client.is_active() {
            if let Err(err) = self.client.stop() {
                warn!(error = %err, "Client stop during shutdown");
            }
        }
        if self.server.is_active() {
            if let Err(err) = self.server.stop() {
                warn!(error = %err, "Server stop during shutdown");
            }
        }
        info!("Network manager shut down");
    }
}

impl Drop for NetManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
