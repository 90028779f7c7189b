//! # Connection Registry
//!
//! Fixed-capacity arena of server-side connections. Slots are allocated up
//! front and recycled through a free list; a reused slot is reset (stage back
//! to `NotAuthenticated`, leftover tasks cancelled) instead of reallocated.

use std::collections::HashMap;
use std::time::Duration;

use tracing::trace;

use crate::protocol::handshake::AuthStage;
use crate::protocol::message::ConnectionId;
use crate::utils::tasks::TaskManager;

/// Name of the task dropping connections that never authenticate
pub const AUTH_TIMEOUT_TASK: &str = "auth_timeout";

/// Name of the task closing a rejected connection after its grace period
pub const DISCONNECT_TASK: &str = "disconnect";

/// Actions a connection can schedule for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTask {
    AuthTimeout,
    Disconnect,
}

/// One admitted peer
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    address: String,
    stage: AuthStage,
    closing: bool,
    tasks: TaskManager<ConnectionTask>,
}

impl Connection {
    fn vacant() -> Self {
        Self {
            id: 0,
            address: String::new(),
            stage: AuthStage::NotAuthenticated,
            closing: false,
            tasks: TaskManager::new(),
        }
    }

    fn reset(&mut self, id: ConnectionId, address: &str) {
        self.id = id;
        self.address.clear();
        self.address.push_str(address);
        self.stage = AuthStage::NotAuthenticated;
        self.closing = false;
        self.tasks.cancel_all();
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stage(&self) -> AuthStage {
        self.stage
    }

    pub fn is_authenticated(&self) -> bool {
        self.stage == AuthStage::Authenticated
    }

    /// Move the handshake forward; regressions are ignored
    pub(crate) fn advance_stage(&mut self, stage: AuthStage) {
        if stage > self.stage {
            self.stage = stage;
        }
    }

    /// A disconnect was requested; the slot is freed when the transport confirms
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn mark_closing(&mut self) {
        self.closing = true;
        self.tasks.cancel_all();
    }

    pub fn tasks(&self) -> &TaskManager<ConnectionTask> {
        &self.tasks
    }

    pub(crate) fn tasks_mut(&mut self) -> &mut TaskManager<ConnectionTask> {
        &mut self.tasks
    }
}

/// Fixed-capacity connection arena
#[derive(Debug)]
pub struct ConnectionPool {
    slots: Vec<Connection>,
    free: Vec<usize>,
    index: HashMap<ConnectionId, usize>,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Connection::vacant()).collect(),
            // pop() hands out slot 0 first
            free: (0..capacity).rev().collect(),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.index.contains_key(&id)
    }

    /// Assign a slot to `id`. Returns `None` when the pool is full.
    ///
    /// An id that is already present reuses its own slot.
    pub fn acquire(&mut self, id: ConnectionId, address: &str) -> Option<&mut Connection> {
        let slot = match self.index.get(&id) {
            Some(&slot) => slot,
            None => {
                let slot = self.free.pop()?;
                self.index.insert(id, slot);
                slot
            }
        };
        trace!(conn_id = id, slot, "Connection slot assigned");
        let connection = &mut self.slots[slot];
        connection.reset(id, address);
        Some(connection)
    }

    /// Return the slot of `id` to the free list
    pub fn release(&mut self, id: ConnectionId) -> bool {
        let Some(slot) = self.index.remove(&id) else {
            return false;
        };
        let connection = &mut self.slots[slot];
        connection.tasks.cancel_all();
        connection.closing = false;
        connection.stage = AuthStage::NotAuthenticated;
        self.free.push(slot);
        trace!(conn_id = id, slot, "Connection slot released");
        true
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.index.get(&id).map(|&slot| &self.slots[slot])
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        match self.index.get(&id) {
            Some(&slot) => Some(&mut self.slots[slot]),
            None => None,
        }
    }

    /// Ids of occupied slots, sorted
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self.index.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.index.values().map(move |&slot| &self.slots[slot])
    }

    /// Count `elapsed` against every connection's scheduled tasks
    pub fn advance(&mut self, elapsed: Duration) {
        for &slot in self.index.values() {
            self.slots[slot].tasks.advance(elapsed);
        }
    }

    /// Completed tasks by connection id, in id order
    pub fn take_due(&mut self) -> Vec<(ConnectionId, ConnectionTask)> {
        let mut due = Vec::new();
        for id in self.ids() {
            if let Some(connection) = self.get_mut(id) {
                due.extend(
                    connection
                        .tasks
                        .take_due()
                        .into_iter()
                        .map(|task| (id, task)),
                );
            }
        }
        due
    }

    /// Release every slot
    pub fn clear(&mut self) {
        for id in self.ids() {
            self.release(id);
        }
    }
}
