//! Authentication handshake
//!
//! Every connection starts `NotAuthenticated`. The client sends one auth
//! request; the server's [`Authenticator`] answers it with an accept (carrying
//! the assigned connection id) or a reject. Stages only move forward:
//!
//! ```text
//! NotAuthenticated --AUTH_REQUEST--> Requested --accept--> Authenticated
//!                                              \--reject--> delayed disconnect
//! ```
//!
//! A second auth request, or any other message before `Authenticated`, is a
//! protocol violation and costs the connection.
//!
//! On the client every frame that arrives before the accept is queued and
//! replayed after the accepted callbacks ran, so handlers never observe server
//! messages ahead of the accept even when the transport reorders them.

use tracing::{debug, info, instrument, warn};

use crate::core::Reader;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::message::{ConnectionId, MessageId, ACCEPT_TYPE, AUTH_REQUEST, REJECT_TYPE};
use crate::service::client::{ClientContext, ClientHooks};
use crate::service::server::ServerContext;

/// Longest shared key the server will read
pub const MAX_KEY_LENGTH: usize = 256;

/// Per-connection handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum AuthStage {
    #[default]
    NotAuthenticated,
    Requested,
    Authenticated,
}

/// Result of the server-side auth gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCheck {
    /// The frame was the auth request and has been handled
    Consumed,
    /// The connection is authenticated; keep dispatching
    Passed,
}

/// Application policy for the auth handshake
pub trait Authenticator: Send + Sync {
    /// A connection was admitted. The default arms the auth timeout.
    fn server_on_auth(&self, ctx: &mut ServerContext, conn_id: ConnectionId) -> Result<()> {
        ctx.start_auth_timeout(conn_id);
        Ok(())
    }

    /// The connection sent its auth request. Must end in
    /// [`ServerContext::accept`] or [`ServerContext::reject`], now or later.
    fn on_request(
        &self,
        ctx: &mut ServerContext,
        conn_id: ConnectionId,
        request: &mut Reader<'_>,
    ) -> Result<()>;

    /// The client transport connected. The default sends an empty auth request.
    fn client_on_auth(&self, ctx: &mut ClientContext) -> Result<()> {
        ctx.send_auth_request(&())
    }

    fn client_on_accepted(&self, _ctx: &mut ClientContext, _extra: &mut Reader<'_>) -> Result<()> {
        Ok(())
    }

    fn client_on_rejected(&self, _ctx: &mut ClientContext, _extra: &mut Reader<'_>) -> Result<()> {
        Ok(())
    }
}

/// Accepts every auth request
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllAuthenticator;

impl Authenticator for AcceptAllAuthenticator {
    fn on_request(
        &self,
        ctx: &mut ServerContext,
        conn_id: ConnectionId,
        _request: &mut Reader<'_>,
    ) -> Result<()> {
        ctx.accept(conn_id)
    }
}

/// Client proves knowledge of a shared key; the reject carries a reason string
#[derive(Debug, Clone)]
pub struct SharedKeyAuthenticator {
    key: String,
}

impl SharedKeyAuthenticator {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Authenticator for SharedKeyAuthenticator {
    fn on_request(
        &self,
        ctx: &mut ServerContext,
        conn_id: ConnectionId,
        request: &mut Reader<'_>,
    ) -> Result<()> {
        match request.get_string_max(MAX_KEY_LENGTH)? {
            Some(key) if key == self.key => ctx.accept(conn_id),
            _ => ctx.reject_with(conn_id, &Some(String::from("invalid key"))),
        }
    }

    fn client_on_auth(&self, ctx: &mut ClientContext) -> Result<()> {
        ctx.send_auth_request(&Some(self.key.clone()))
    }

    fn client_on_rejected(&self, _ctx: &mut ClientContext, extra: &mut Reader<'_>) -> Result<()> {
        let reason = if extra.available() > 0 {
            extra.get_string()?
        } else {
            None
        };
        warn!(reason = reason.as_deref().unwrap_or("none"), "Authentication rejected");
        Ok(())
    }
}

/// Server-side gate run before any other dispatch
#[instrument(level = "trace", skip(ctx, authenticator, reader))]
pub(crate) fn server_auth_check(
    ctx: &mut ServerContext,
    authenticator: &dyn Authenticator,
    conn_id: ConnectionId,
    id: MessageId,
    reader: &mut Reader<'_>,
) -> Result<AuthCheck> {
    let connection = ctx
        .connection_mut(conn_id)
        .ok_or(ProtocolError::UnknownConnection(conn_id))?;

    if id == AUTH_REQUEST {
        if connection.stage() != AuthStage::NotAuthenticated {
            return Err(ProtocolError::MultipleAuthRequests);
        }
        connection.advance_stage(AuthStage::Requested);
        ctx.metrics().auth_requested();
        debug!(conn_id, "Auth requested");

        authenticator.on_request(ctx, conn_id, reader)?;
        return Ok(AuthCheck::Consumed);
    }

    if connection.stage() != AuthStage::Authenticated {
        return Err(ProtocolError::Unauthorized(id));
    }
    Ok(AuthCheck::Passed)
}

/// Client-side handling of the AUTH_RESPONSE frame
pub(crate) fn client_handle_auth_response(
    dispatcher: &Dispatcher,
    ctx: &mut ClientContext,
    hooks: &mut ClientHooks,
    reader: &mut Reader<'_>,
) -> Result<()> {
    match reader.get_u8()? {
        ACCEPT_TYPE => {
            let conn_id = reader.get_u32()?;
            if ctx.is_authenticated() {
                return Err(ProtocolError::InvalidState(
                    constants::ERR_ALREADY_AUTHENTICATED,
                ));
            }
            if conn_id == 0 {
                return Err(ProtocolError::UnknownConnection(conn_id));
            }

            ctx.set_authenticated(conn_id);
            info!(conn_id, queued = ctx.queued_len(), "Authenticated");
            hooks.accepted(ctx, reader)?;

            while let Some(frame) = ctx.pop_queued() {
                if ctx.stop_requested() {
                    break;
                }
                dispatcher.dispatch_client(ctx, hooks, &frame)?;
            }
            Ok(())
        }
        REJECT_TYPE => {
            hooks.rejected(ctx, reader)?;
            ctx.clear_queue();
            ctx.request_stop("authentication rejected");
            Ok(())
        }
        other => Err(ProtocolError::UnknownAuthResponse(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert!(AuthStage::NotAuthenticated < AuthStage::Requested);
        assert!(AuthStage::Requested < AuthStage::Authenticated);
        assert_eq!(AuthStage::default(), AuthStage::NotAuthenticated);
    }
}
