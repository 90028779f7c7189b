//! # Service Layer
//!
//! Tick-driven server and client roles, the connection registry and the host
//! facade tying both roles together.

pub mod client;
pub mod connection;
pub mod manager;
pub mod server;

pub use client::{Client, ClientContext, ClientObserver};
pub use connection::{Connection, ConnectionPool};
pub use manager::NetManager;
pub use server::{Server, ServerContext, ServerObserver};
