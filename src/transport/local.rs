//! # Loopback Transport
//!
//! In-process [`Transport`] for tests, demos and single-process hosts. A
//! [`LocalNetwork`] hub owns the shared state: listeners by port, one bounded
//! event queue per endpoint and the links between connected endpoints. Every
//! [`LocalTransport`] created from the hub is one endpoint.
//!
//! An endpoint serves one role at a time; a host uses one endpoint for its
//! server and another for its client.
//!
//! Frames are delivered reliably and in order. The queue bound applies to data
//! events only: a full queue fails reliable sends and silently drops unreliable
//! ones. Connect and disconnect notifications are always queued.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::ConnectionId;
use crate::transport::{DeliveryMethod, Transport, TransportEvent};

type EndpointId = u32;

#[derive(Debug, Clone, Copy)]
struct Link {
    server: EndpointId,
    client: EndpointId,
}

#[derive(Debug, Default)]
struct NetworkState {
    next_endpoint: EndpointId,
    next_conn: ConnectionId,
    listeners: HashMap<u16, EndpointId>,
    queues: HashMap<EndpointId, VecDeque<TransportEvent>>,
    links: HashMap<ConnectionId, Link>,
    // client endpoint -> its connection
    clients: HashMap<EndpointId, ConnectionId>,
}

impl NetworkState {
    fn listener_port(&self, endpoint: EndpointId) -> Option<u16> {
        self.listeners
            .iter()
            .find(|(_, &owner)| owner == endpoint)
            .map(|(&port, _)| port)
    }

    fn notify(&mut self, endpoint: EndpointId, event: TransportEvent) {
        self.queues.entry(endpoint).or_default().push_back(event);
    }

    fn deliver(
        &mut self,
        endpoint: EndpointId,
        event: TransportEvent,
        delivery: DeliveryMethod,
        capacity: usize,
    ) -> Result<()> {
        let queue = self.queues.entry(endpoint).or_default();
        if queue.len() >= capacity {
            return match delivery {
                DeliveryMethod::Reliable => Err(ProtocolError::TransportError(format!(
                    "event queue of endpoint {endpoint} is full"
                ))),
                DeliveryMethod::Unreliable => {
                    trace!(endpoint, "Unreliable frame dropped on full queue");
                    Ok(())
                }
            };
        }
        queue.push_back(event);
        Ok(())
    }
}

/// Shared hub of an in-process network
#[derive(Debug, Clone)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
    config: TransportConfig,
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState {
                next_endpoint: 1,
                next_conn: 1,
                ..NetworkState::default()
            })),
            config,
        }
    }

    /// Create a new endpoint attached to this network
    pub fn endpoint(&self) -> LocalTransport {
        let id = match self.state.lock() {
            Ok(mut state) => {
                let id = state.next_endpoint;
                state.next_endpoint = state.next_endpoint.wrapping_add(1).max(1);
                state.queues.insert(id, VecDeque::new());
                id
            }
            Err(_) => 0,
        };
        LocalTransport {
            id,
            state: Arc::clone(&self.state),
            config: self.config.clone(),
        }
    }

    /// Number of live links
    pub fn connection_count(&self) -> usize {
        self.state.lock().map(|state| state.links.len()).unwrap_or(0)
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.state
            .lock()
            .map(|state| state.listeners.contains_key(&port))
            .unwrap_or(false)
    }
}

/// One endpoint of a [`LocalNetwork`]
#[derive(Debug)]
pub struct LocalTransport {
    id: EndpointId,
    state: Arc<Mutex<NetworkState>>,
    config: TransportConfig,
}

impl LocalTransport {
    fn lock(&self) -> Result<MutexGuard<'_, NetworkState>> {
        self.state.lock().map_err(|_| ProtocolError::LockPoisoned)
    }

    fn check_size(&self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.config.max_message_size {
            return Err(ProtocolError::TransportError(format!(
                "frame of {} bytes exceeds the {} byte limit",
                frame.len(),
                self.config.max_message_size
            )));
        }
        Ok(())
    }

    /// Frames waiting to be polled on this endpoint
    pub fn pending_events(&self) -> usize {
        self.lock()
            .map(|state| state.queues.get(&self.id).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }
}

impl Transport for LocalTransport {
    fn start_server(&mut self, port: u16) -> Result<()> {
        let mut state = self.lock()?;
        if state.listener_port(self.id).is_some() {
            return Err(ProtocolError::TransportError(
                constants::ERR_SERVER_ACTIVE.to_string(),
            ));
        }
        if state.listeners.contains_key(&port) {
            return Err(ProtocolError::TransportError(
                constants::ERR_PORT_IN_USE.to_string(),
            ));
        }
        state.listeners.insert(port, self.id);
        debug!(endpoint = self.id, port, "Loopback listener bound");
        Ok(())
    }

    fn start_client(&mut self, address: &str, port: u16) -> Result<()> {
        let mut state = self.lock()?;
        if state.clients.contains_key(&self.id) {
            return Err(ProtocolError::TransportError(
                constants::ERR_CLIENT_ACTIVE.to_string(),
            ));
        }

        let Some(&server) = state.listeners.get(&port) else {
            debug!(endpoint = self.id, address, port, "No loopback listener");
            state.notify(
                self.id,
                TransportEvent::Disconnected {
                    conn_id: None,
                    info: String::from("connection refused"),
                },
            );
            return Ok(());
        };

        let conn_id = state.next_conn;
        state.next_conn = state.next_conn.wrapping_add(1).max(1);
        state.links.insert(
            conn_id,
            Link {
                server,
                client: self.id,
            },
        );
        state.clients.insert(self.id, conn_id);

        state.notify(
            server,
            TransportEvent::Connected {
                conn_id,
                address: format!("local:{}", self.id),
            },
        );
        state.notify(
            self.id,
            TransportEvent::Connected {
                conn_id,
                address: format!("{address}:{port}"),
            },
        );
        debug!(endpoint = self.id, conn_id, port, "Loopback link established");
        Ok(())
    }

    fn stop_server(&mut self) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        let Some(port) = state.listener_port(self.id) else {
            return;
        };
        state.listeners.remove(&port);

        let owned: Vec<(ConnectionId, Link)> = state
            .links
            .iter()
            .filter(|(_, link)| link.server == self.id)
            .map(|(&conn_id, &link)| (conn_id, link))
            .collect();
        for (conn_id, link) in owned {
            state.links.remove(&conn_id);
            state.clients.remove(&link.client);
            state.notify(
                link.client,
                TransportEvent::Disconnected {
                    conn_id: None,
                    info: String::from("server stopped"),
                },
            );
        }
        if let Some(queue) = state.queues.get_mut(&self.id) {
            queue.clear();
        }
        debug!(endpoint = self.id, port, "Loopback listener closed");
    }

    fn stop_client(&mut self) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if let Some(conn_id) = state.clients.remove(&self.id) {
            if let Some(link) = state.links.remove(&conn_id) {
                state.notify(
                    link.server,
                    TransportEvent::Disconnected {
                        conn_id: Some(conn_id),
                        info: String::from("client disconnected"),
                    },
                );
            }
        }
        if let Some(queue) = state.queues.get_mut(&self.id) {
            queue.clear();
        }
    }

    fn server_send(
        &mut self,
        conn_id: ConnectionId,
        frame: &[u8],
        delivery: DeliveryMethod,
    ) -> Result<()> {
        self.check_size(frame)?;
        let capacity = self.config.event_queue_capacity;
        let mut state = self.lock()?;
        if state.listener_port(self.id).is_none() {
            return Err(ProtocolError::TransportError(
                constants::ERR_NOT_LISTENING.to_string(),
            ));
        }
        let link = match state.links.get(&conn_id) {
            Some(link) if link.server == self.id => *link,
            _ => {
                return Err(ProtocolError::TransportError(format!(
                    "no connection {conn_id}"
                )))
            }
        };
        state.deliver(
            link.client,
            TransportEvent::Data {
                conn_id: None,
                payload: Bytes::copy_from_slice(frame),
            },
            delivery,
            capacity,
        )
    }

    fn client_send(&mut self, frame: &[u8], delivery: DeliveryMethod) -> Result<()> {
        self.check_size(frame)?;
        let capacity = self.config.event_queue_capacity;
        let mut state = self.lock()?;
        let Some(&conn_id) = state.clients.get(&self.id) else {
            return Err(ProtocolError::TransportError(
                constants::ERR_NOT_CONNECTED.to_string(),
            ));
        };
        let Some(link) = state.links.get(&conn_id).copied() else {
            return Err(ProtocolError::TransportError(
                constants::ERR_NOT_CONNECTED.to_string(),
            ));
        };
        state.deliver(
            link.server,
            TransportEvent::Data {
                conn_id: Some(conn_id),
                payload: Bytes::copy_from_slice(frame),
            },
            delivery,
            capacity,
        )
    }

    fn disconnect(&mut self, conn_id: ConnectionId) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        match state.links.get(&conn_id).copied() {
            Some(link) if link.server == self.id => {
                state.links.remove(&conn_id);
                state.clients.remove(&link.client);
                state.notify(
                    link.client,
                    TransportEvent::Disconnected {
                        conn_id: None,
                        info: String::from("disconnected by server"),
                    },
                );
            }
            Some(_) => {
                warn!(endpoint = self.id, conn_id, "Disconnect for a foreign connection ignored");
                return;
            }
            None => {}
        }
        state.notify(
            self.id,
            TransportEvent::Disconnected {
                conn_id: Some(conn_id),
                info: String::from("disconnected by server"),
            },
        );
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.state
            .lock()
            .ok()?
            .queues
            .get_mut(&self.id)?
            .pop_front()
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        self.stop_client();
        self.stop_server();
        if let Ok(mut state) = self.state.lock() {
            state.queues.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_pair(network: &LocalNetwork) -> (LocalTransport, LocalTransport) {
        let mut server = network.endpoint();
        let mut client = network.endpoint();
        server.start_server(7000).unwrap();
        client.start_client("127.0.0.1", 7000).unwrap();
        (server, client)
    }

    #[test]
    fn test_connect_notifies_both_sides() {
        let network = LocalNetwork::new();
        let (mut server, mut client) = connected_pair(&network);

        assert!(matches!(
            server.poll_event(),
            Some(TransportEvent::Connected { conn_id: 1, .. })
        ));
        assert!(matches!(
            client.poll_event(),
            Some(TransportEvent::Connected { conn_id: 1, .. })
        ));
        assert_eq!(network.connection_count(), 1);
        assert!(server.poll_event().is_none());
    }

    #[test]
    fn test_frames_cross_in_order() {
        let network = LocalNetwork::new();
        let (mut server, mut client) = connected_pair(&network);
        server.poll_event();
        client.poll_event();

        client.client_send(&[1], DeliveryMethod::Reliable).unwrap();
        client.client_send(&[2], DeliveryMethod::Reliable).unwrap();
        server.server_send(1, &[3], DeliveryMethod::Reliable).unwrap();

        assert_eq!(
            server.poll_event(),
            Some(TransportEvent::Data {
                conn_id: Some(1),
                payload: Bytes::from_static(&[1])
            })
        );
        assert_eq!(
            server.poll_event(),
            Some(TransportEvent::Data {
                conn_id: Some(1),
                payload: Bytes::from_static(&[2])
            })
        );
        assert_eq!(
            client.poll_event(),
            Some(TransportEvent::Data {
                conn_id: None,
                payload: Bytes::from_static(&[3])
            })
        );
    }

    #[test]
    fn test_port_in_use() {
        let network = LocalNetwork::new();
        let mut first = network.endpoint();
        let mut second = network.endpoint();
        first.start_server(7001).unwrap();
        assert!(matches!(
            second.start_server(7001),
            Err(ProtocolError::TransportError(_))
        ));
        first.stop_server();
        second.start_server(7001).unwrap();
    }

    #[test]
    fn test_connect_without_listener_disconnects() {
        let network = LocalNetwork::new();
        let mut client = network.endpoint();
        client.start_client("127.0.0.1", 9).unwrap();
        assert!(matches!(
            client.poll_event(),
            Some(TransportEvent::Disconnected { conn_id: None, .. })
        ));
        assert!(client.client_send(&[0], DeliveryMethod::Reliable).is_err());
    }

    #[test]
    fn test_disconnect_reaches_both_sides() {
        let network = LocalNetwork::new();
        let (mut server, mut client) = connected_pair(&network);
        server.poll_event();
        client.poll_event();

        server.disconnect(1);
        assert!(matches!(
            server.poll_event(),
            Some(TransportEvent::Disconnected { conn_id: Some(1), .. })
        ));
        assert!(matches!(
            client.poll_event(),
            Some(TransportEvent::Disconnected { conn_id: None, .. })
        ));
        assert_eq!(network.connection_count(), 0);
        assert!(server.server_send(1, &[0], DeliveryMethod::Reliable).is_err());
    }

    #[test]
    fn test_stop_client_notifies_server() {
        let network = LocalNetwork::new();
        let (mut server, mut client) = connected_pair(&network);
        server.poll_event();

        client.stop_client();
        assert_eq!(client.pending_events(), 0);
        assert!(matches!(
            server.poll_event(),
            Some(TransportEvent::Disconnected { conn_id: Some(1), .. })
        ));
    }

    #[test]
    fn test_stop_server_notifies_clients() {
        let network = LocalNetwork::new();
        let (mut server, mut client) = connected_pair(&network);
        client.poll_event();

        server.stop_server();
        assert!(!network.is_listening(7000));
        assert_eq!(server.pending_events(), 0);
        assert!(matches!(
            client.poll_event(),
            Some(TransportEvent::Disconnected { conn_id: None, .. })
        ));
    }

    #[test]
    fn test_full_queue() {
        let network = LocalNetwork::with_config(TransportConfig {
            event_queue_capacity: 2,
            ..TransportConfig::default()
        });
        let (mut server, mut client) = connected_pair(&network);
        // the Connected event occupies one slot
        client.client_send(&[1], DeliveryMethod::Reliable).unwrap();
        assert!(client.client_send(&[2], DeliveryMethod::Reliable).is_err());
        client.client_send(&[3], DeliveryMethod::Unreliable).unwrap();
        assert_eq!(server.pending_events(), 2);

        server.poll_event();
        server.poll_event();
        client.client_send(&[4], DeliveryMethod::Reliable).unwrap();
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let network = LocalNetwork::with_config(TransportConfig {
            max_message_size: 16,
            ..TransportConfig::default()
        });
        let (_server, mut client) = connected_pair(&network);
        assert!(client.client_send(&[0; 17], DeliveryMethod::Reliable).is_err());
        client.client_send(&[0; 16], DeliveryMethod::Reliable).unwrap();
    }

    #[test]
    fn test_drop_releases_listener() {
        let network = LocalNetwork::new();
        {
            let mut server = network.endpoint();
            server.start_server(7002).unwrap();
            assert!(network.is_listening(7002));
        }
        assert!(!network.is_listening(7002));
    }
}
