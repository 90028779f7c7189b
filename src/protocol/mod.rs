//! # Protocol Layer
//!
//! Message ids, routing, request/response correlation and the auth handshake.
//!
//! ## Components
//! - **Message**: reserved ids, status codes and the `Message` frame view
//! - **Dispatcher**: per-role handler tables and the dispatch algorithms
//! - **Request**: request ids, pending-request tracking and timeouts
//! - **Handshake**: auth stages, the `Authenticator` trait and built-in policies

pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod request;

pub use dispatcher::Dispatcher;
pub use handshake::{AcceptAllAuthenticator, AuthStage, Authenticator, SharedKeyAuthenticator};
pub use message::{ConnectionId, Message, MessageId, RequestId, StatusCode};
pub use request::{Correlator, Reply, RequestData, Responder, Response, TimeoutScheduler};
