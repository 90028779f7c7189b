//! # tickwire
//!
//! Tick-driven client/server middleware for real-time multiplayer
//! applications. The host application calls `tick` once per frame; everything
//! (transport events, handler dispatch, auth timeouts, request timeouts) runs
//! inside that call, on the caller's thread.
//!
//! ## Layers
//! - [`core`]: binary codec (`Writer`, `Reader`, `NetSerialize`)
//! - [`protocol`]: message routing, request/response correlation, auth handshake
//! - [`service`]: `Server`, `Client` and the `NetManager` host facade
//! - [`transport`]: the `Transport` boundary and an in-process loopback
//! - [`config`], [`error`], [`utils`]: configuration, errors, logging, metrics, tasks
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tickwire::config::NetworkConfig;
//! use tickwire::protocol::AcceptAllAuthenticator;
//! use tickwire::service::NetManager;
//! use tickwire::transport::local::LocalNetwork;
//! use tickwire::transport::DeliveryMethod;
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
//! manager
//!     .dispatcher()
//!     .register_server_payload_handler(1, |ctx, conn_id, reader| {
//!         let text = reader.get_string()?;
//!         ctx.send(conn_id, 1, DeliveryMethod::Reliable, &text)
//!     })
//!     .unwrap();
//!
//! manager.start_host().unwrap();
//! manager.tick(Duration::from_millis(16));
//! manager.tick(Duration::from_millis(16));
//! assert!(manager.client().is_authenticated());
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use error::{ProtocolError, Result};
pub use protocol::{Dispatcher, MessageId};
pub use service::{Client, NetManager, Server};
