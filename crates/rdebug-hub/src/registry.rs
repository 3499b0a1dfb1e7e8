use crate::bus::{BusEvent, EventBus};
use crate::client::{Client, WeakClient};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Connect { client_id: String },
    Disconnect { client_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryEventKind {
    Connect,
    Disconnect,
}

impl BusEvent for RegistryEvent {
    type Kind = RegistryEventKind;

    fn kind(&self) -> RegistryEventKind {
        match self {
            Self::Connect { .. } => RegistryEventKind::Connect,
            Self::Disconnect { .. } => RegistryEventKind::Disconnect,
        }
    }
}

enum Slot {
    /// A relay client announced itself and awaits the hub ack.
    Pending,
    Connected(WeakClient),
}

/// Connected clients plus the id counters for clients and sessions.
///
/// One registry is shared by every client and hub of a runtime.
#[derive(Default)]
pub struct Registry {
    clients: Mutex<HashMap<String, Slot>>,
    events: EventBus<RegistryEvent>,
    client_counter: AtomicU64,
    session_counter: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_client_id(&self) -> String {
        let id = self.client_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("client-{id}")
    }

    pub fn next_session_id(&self, name: &str) -> String {
        let id = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("session-{id}-{name}")
    }

    pub fn events(&self) -> &EventBus<RegistryEvent> {
        &self.events
    }

    /// Claims `client_id` for an announcement in flight. False if taken.
    pub fn reserve(&self, client_id: &str) -> bool {
        let mut clients = self.lock();
        if clients.contains_key(client_id) {
            return false;
        }
        clients.insert(client_id.to_string(), Slot::Pending);
        true
    }

    pub fn insert(&self, client: &Client) {
        let client_id = client.id();
        debug!(event = "registry_insert", client_id = %client_id);
        self.lock()
            .insert(client_id, Slot::Connected(client.downgrade()));
    }

    pub fn remove(&self, client_id: &str) -> bool {
        self.lock().remove(client_id).is_some()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.lock().contains_key(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<Client> {
        match self.lock().get(client_id) {
            Some(Slot::Connected(client)) => client.upgrade(),
            _ => None,
        }
    }

    pub fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Connected(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn announce(&self, event: RegistryEvent) {
        self.events.emit(event);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
