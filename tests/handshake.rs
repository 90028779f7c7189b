//! Auth handshake over the loopback transport

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::VecDeque;
use std::slice;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use common::*;
use tickwire::core::{Reader, Writer};
use tickwire::error::{ProtocolError, Result};
use tickwire::protocol::dispatcher::Dispatcher;
use tickwire::protocol::handshake::{
    AcceptAllAuthenticator, AuthStage, Authenticator, SharedKeyAuthenticator,
};
use tickwire::protocol::message::{ConnectionId, AUTH_REQUEST, AUTH_RESPONSE, REJECT_TYPE};
use tickwire::service::server::{ServerContext, ServerObserver};
use tickwire::transport::local::{LocalNetwork, LocalTransport};
use tickwire::transport::{DeliveryMethod, Transport, TransportEvent};

fn frame(build: impl FnOnce(&mut Writer)) -> Vec<u8> {
    let mut writer = Writer::new();
    build(&mut writer);
    writer.to_vec()
}

fn raw_client(network: &LocalNetwork) -> LocalTransport {
    let mut transport = network.endpoint();
    transport.start_client("127.0.0.1", PORT).unwrap();
    transport
}

/// Sends `count` numbered messages ahead of the accept
struct EagerAuthenticator {
    count: i32,
}

impl Authenticator for EagerAuthenticator {
    fn on_request(
        &self,
        ctx: &mut ServerContext,
        conn_id: ConnectionId,
        _request: &mut Reader<'_>,
    ) -> Result<()> {
        for value in 0..self.count {
            ctx.send(conn_id, 42, DeliveryMethod::Reliable, &value)?;
        }
        ctx.accept(conn_id)
    }
}

struct ViolationLog(Log);

impl ServerObserver for ViolationLog {
    fn on_protocol_violation(
        &mut self,
        ctx: &mut ServerContext,
        conn_id: ConnectionId,
        error: &ProtocolError,
    ) {
        let stage = ctx.connection(conn_id).map(|connection| connection.stage());
        self.0
            .lock()
            .unwrap()
            .push(format!("{conn_id}:{stage:?}:{error}"));
    }
}

/// Shuffles every run of consecutive data events it polls from the inner transport
struct ShufflingTransport {
    inner: LocalTransport,
    rng: StdRng,
    ready: VecDeque<TransportEvent>,
}

impl Transport for ShufflingTransport {
    fn start_server(&mut self, port: u16) -> Result<()> {
        self.inner.start_server(port)
    }

    fn start_client(&mut self, address: &str, port: u16) -> Result<()> {
        self.inner.start_client(address, port)
    }

    fn stop_server(&mut self) {
        self.inner.stop_server();
    }

    fn stop_client(&mut self) {
        self.ready.clear();
        self.inner.stop_client();
    }

    fn server_send(
        &mut self,
        conn_id: ConnectionId,
        frame: &[u8],
        delivery: DeliveryMethod,
    ) -> Result<()> {
        self.inner.server_send(conn_id, frame, delivery)
    }

    fn client_send(&mut self, frame: &[u8], delivery: DeliveryMethod) -> Result<()> {
        self.inner.client_send(frame, delivery)
    }

    fn disconnect(&mut self, conn_id: ConnectionId) {
        self.inner.disconnect(conn_id);
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        if self.ready.is_empty() {
            let mut drained = Vec::new();
            while let Some(event) = self.inner.poll_event() {
                drained.push(event);
            }
            let mut start = 0;
            while start < drained.len() {
                let mut end = start;
                while end < drained.len() && matches!(drained[end], TransportEvent::Data { .. }) {
                    end += 1;
                }
                drained[start..end].shuffle(&mut self.rng);
                start = end + 1;
            }
            self.ready.extend(drained);
        }
        self.ready.pop_front()
    }
}

#[test]
fn test_accept_all_handshake() {
    let network = LocalNetwork::new();
    let dispatcher = Arc::new(Dispatcher::new());
    let mut server = server(&network, Arc::clone(&dispatcher), Arc::new(AcceptAllAuthenticator));
    let mut clients = vec![client(&network, dispatcher, Arc::new(AcceptAllAuthenticator))];

    pump(&mut server, &mut clients, 2);

    assert!(clients[0].is_authenticated());
    assert_eq!(clients[0].context().conn_id(), 1);
    let connection = server.context().connection(1).expect("connection");
    assert_eq!(connection.stage(), AuthStage::Authenticated);
    assert!(connection.tasks().is_empty());

    let snapshot = server.metrics().snapshot();
    assert_eq!(snapshot.connections_active, 1);
    assert_eq!(snapshot.auth_accepted, 1);
}

#[test]
fn test_second_auth_request_disconnects() {
    let network = LocalNetwork::new();
    let violations = log();
    let mut server = server(
        &network,
        Arc::new(Dispatcher::new()),
        Arc::new(SilentAuthenticator),
    );
    server.add_observer(ViolationLog(Arc::clone(&violations)));

    let mut raw = raw_client(&network);
    let auth = frame(|w| w.put_u16(AUTH_REQUEST));
    raw.client_send(&auth, DeliveryMethod::Reliable).unwrap();
    raw.client_send(&auth, DeliveryMethod::Reliable).unwrap();

    server.tick(STEP);

    let recorded = entries(&violations);
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].starts_with("1:Some(Requested)"), "{recorded:?}");
    assert!(server.context().connection(1).is_none());
    assert_eq!(server.metrics().snapshot().protocol_violations, 1);

    assert!(matches!(raw.poll_event(), Some(TransportEvent::Connected { .. })));
    assert!(matches!(
        raw.poll_event(),
        Some(TransportEvent::Disconnected { conn_id: None, .. })
    ));
}

#[test]
fn test_message_before_auth_disconnects() {
    let network = LocalNetwork::new();
    let violations = log();
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register_server_handler(5, |_, _| Ok(())).unwrap();
    let mut server = server(&network, dispatcher, Arc::new(AcceptAllAuthenticator));
    server.add_observer(ViolationLog(Arc::clone(&violations)));

    let mut raw = raw_client(&network);
    raw.client_send(&frame(|w| w.put_u16(5)), DeliveryMethod::Reliable)
        .unwrap();
    server.tick(STEP);

    let recorded = entries(&violations);
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].starts_with("1:Some(NotAuthenticated)"), "{recorded:?}");
    assert!(server.context().connections().is_empty());
}

#[test]
fn test_queued_message_dispatched_after_accept() {
    let network = LocalNetwork::new();
    let events = log();

    let server_dispatcher = Arc::new(Dispatcher::new());
    let mut server = server(
        &network,
        server_dispatcher,
        Arc::new(EagerAuthenticator { count: 1 }),
    );

    let client_dispatcher = Arc::new(Dispatcher::new());
    let sink = Arc::clone(&events);
    client_dispatcher
        .register_client_payload_handler(42, move |ctx, reader| {
            assert!(ctx.is_authenticated());
            let value = reader.get_i32()?;
            sink.lock().unwrap().push(format!("42:{value}"));
            Ok(())
        })
        .unwrap();
    let mut client = client(&network, client_dispatcher, Arc::new(AcceptAllAuthenticator));
    client.add_observer(Recorder(Arc::clone(&events)));

    pump(&mut server, slice::from_mut(&mut client), 2);

    assert_eq!(entries(&events), vec!["accepted:1", "42:0"]);
    assert_eq!(client.context().queued_len(), 0);
}

#[test]
fn test_shuffled_delivery_never_precedes_accept() {
    for seed in 0..16u64 {
        let network = LocalNetwork::new();
        let events = log();

        let mut server = server(
            &network,
            Arc::new(Dispatcher::new()),
            Arc::new(EagerAuthenticator { count: 8 }),
        );

        let client_dispatcher = Arc::new(Dispatcher::new());
        let sink = Arc::clone(&events);
        client_dispatcher
            .register_client_payload_handler(42, move |_, reader| {
                let value = reader.get_i32()?;
                sink.lock().unwrap().push(format!("42:{value}"));
                Ok(())
            })
            .unwrap();

        let transport = ShufflingTransport {
            inner: network.endpoint(),
            rng: StdRng::seed_from_u64(seed),
            ready: VecDeque::new(),
        };
        let mut client = client_over(
            Box::new(transport),
            client_dispatcher,
            Arc::new(AcceptAllAuthenticator),
        );
        client.add_observer(Recorder(Arc::clone(&events)));

        pump(&mut server, slice::from_mut(&mut client), 3);

        let recorded = entries(&events);
        assert_eq!(recorded.len(), 9, "seed {seed}: {recorded:?}");
        assert_eq!(recorded[0], "accepted:1", "seed {seed}: {recorded:?}");
        for value in 0..8 {
            assert!(recorded.contains(&format!("42:{value}")), "seed {seed}");
        }
    }
}

#[test]
fn test_pool_capacity_refuses_extra_connections() {
    let network = LocalNetwork::new();
    let dispatcher = Arc::new(Dispatcher::new());
    let config = tickwire::config::ServerConfig {
        max_connections: 2,
        ..server_config()
    };
    let mut server = server_with(
        &network,
        config,
        Arc::clone(&dispatcher),
        Arc::new(AcceptAllAuthenticator),
    );
    let mut clients: Vec<_> = (0..3)
        .map(|_| client(&network, Arc::clone(&dispatcher), Arc::new(AcceptAllAuthenticator)))
        .collect();

    pump(&mut server, &mut clients, 3);

    assert!(clients[0].is_authenticated());
    assert!(clients[1].is_authenticated());
    assert!(!clients[2].is_active());
    assert_eq!(server.context().connections().len(), 2);
    assert_eq!(server.metrics().snapshot().connections_refused, 1);
}

#[test]
fn test_released_slot_is_reused() {
    let network = LocalNetwork::new();
    let dispatcher = Arc::new(Dispatcher::new());
    let config = tickwire::config::ServerConfig {
        max_connections: 1,
        ..server_config()
    };
    let mut server = server_with(
        &network,
        config,
        Arc::clone(&dispatcher),
        Arc::new(AcceptAllAuthenticator),
    );
    let mut clients = vec![client(&network, Arc::clone(&dispatcher), Arc::new(AcceptAllAuthenticator))];
    pump(&mut server, &mut clients, 2);
    assert!(clients[0].is_authenticated());

    clients[0].stop().unwrap();
    pump(&mut server, &mut clients, 1);
    assert!(server.context().connections().is_empty());

    clients[0].start().unwrap();
    pump(&mut server, &mut clients, 2);
    assert!(clients[0].is_authenticated());
    assert_eq!(clients[0].context().conn_id(), 2);
    assert_eq!(server.context().connections().ids(), vec![2]);
}

#[test]
fn test_reject_disconnects_after_delay() {
    let network = LocalNetwork::new();
    let mut server = server(
        &network,
        Arc::new(Dispatcher::new()),
        Arc::new(SharedKeyAuthenticator::new("secret")),
    );

    let mut raw = raw_client(&network);
    let request = frame(|w| {
        w.put_u16(AUTH_REQUEST);
        w.put_string(Some("guess"));
    });
    raw.client_send(&request, DeliveryMethod::Reliable).unwrap();

    server.tick(STEP);
    assert!(matches!(raw.poll_event(), Some(TransportEvent::Connected { .. })));
    let Some(TransportEvent::Data { payload, .. }) = raw.poll_event() else {
        panic!("expected the reject frame");
    };
    let mut reader = Reader::new(&payload);
    assert_eq!(reader.get_u16().unwrap(), AUTH_RESPONSE);
    assert_eq!(reader.get_u8().unwrap(), REJECT_TYPE);
    assert_eq!(reader.get_string().unwrap().as_deref(), Some("invalid key"));

    // 100ms grace period counted from the tick after the reject
    for _ in 0..9 {
        server.tick(STEP);
    }
    let connection = server.context().connection(1).expect("still connected");
    assert_eq!(connection.stage(), AuthStage::Requested);

    server.tick(STEP);
    server.tick(STEP);
    assert!(server.context().connection(1).is_none());
    assert!(matches!(
        raw.poll_event(),
        Some(TransportEvent::Disconnected { .. })
    ));
    assert_eq!(server.metrics().snapshot().auth_rejected, 1);
}

#[test]
fn test_auth_timeout() {
    let network = LocalNetwork::new();
    let mut server = server(
        &network,
        Arc::new(Dispatcher::new()),
        Arc::new(AcceptAllAuthenticator),
    );
    let _raw = raw_client(&network);

    // the tick that admits the connection does not count toward the timeout
    server.tick(Duration::from_millis(250));
    assert!(server.context().connection(1).is_some());

    server.tick(Duration::from_millis(499));
    assert!(server.context().connection(1).is_some());

    server.tick(Duration::from_millis(1));
    assert!(server.context().connection(1).is_some_and(|c| c.is_closing()));

    server.tick(Duration::ZERO);
    assert!(server.context().connection(1).is_none());
    assert_eq!(server.metrics().snapshot().auth_timeouts, 1);
}

#[test]
fn test_shared_key_accepted() {
    let network = LocalNetwork::new();
    let dispatcher = Arc::new(Dispatcher::new());
    let authenticator = Arc::new(SharedKeyAuthenticator::new("secret"));
    let mut server = server(&network, Arc::clone(&dispatcher), authenticator.clone());
    let mut clients = vec![client(&network, dispatcher, authenticator)];

    pump(&mut server, &mut clients, 2);
    assert!(clients[0].is_authenticated());
}

#[test]
fn test_shared_key_rejected_stops_client() {
    let network = LocalNetwork::new();
    let events = log();
    let dispatcher = Arc::new(Dispatcher::new());
    let mut server = server(
        &network,
        Arc::clone(&dispatcher),
        Arc::new(SharedKeyAuthenticator::new("secret")),
    );
    let mut client = client(
        &network,
        dispatcher,
        Arc::new(SharedKeyAuthenticator::new("wrong")),
    );
    client.add_observer(Recorder(Arc::clone(&events)));

    pump(&mut server, slice::from_mut(&mut client), 2);

    assert!(!client.is_active());
    assert!(!client.is_authenticated());
    assert_eq!(entries(&events), vec!["rejected", "stopped"]);
    assert_eq!(server.metrics().snapshot().auth_rejected, 1);

    // the client hung up first; the server frees the slot on the next tick
    server.tick(STEP);
    assert!(server.context().connections().is_empty());
}

#[test]
fn test_server_stop_disconnects_clients() {
    let network = LocalNetwork::new();
    let events = log();
    let dispatcher = Arc::new(Dispatcher::new());
    let mut server = server(&network, Arc::clone(&dispatcher), Arc::new(AcceptAllAuthenticator));
    let mut client = client(&network, dispatcher, Arc::new(AcceptAllAuthenticator));
    client.add_observer(Recorder(Arc::clone(&events)));
    pump(&mut server, slice::from_mut(&mut client), 2);

    server.stop().unwrap();
    assert!(matches!(
        server.stop(),
        Err(ProtocolError::InvalidState(_))
    ));
    client.tick(STEP);

    assert!(!client.is_active());
    assert_eq!(entries(&events), vec!["accepted:1", "disconnected", "stopped"]);
}
