//! Connection directories, one per handler type.

use std::any::{TypeId, type_name};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use socketry_core::ConnectionId;
use tracing::debug;

use crate::groups::GroupRegistry;
use crate::proxy::ClientProxy;

/// Live connections of one handler type, keyed by connection id.
///
/// Backed by a sharded concurrent map, so unrelated connections never
/// contend on a single lock.
pub struct ClientRegistry {
    name: String,
    clients: DashMap<ConnectionId, Arc<dyn ClientProxy>>,
}

impl ClientRegistry {
    /// Create an empty registry labelled `name` (used in logs).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clients: DashMap::new(),
        }
    }

    /// Registry label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a connection. Returns `false` if the id is already live.
    pub fn add(&self, id: ConnectionId, proxy: Arc<dyn ClientProxy>) -> bool {
        match self.clients.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                debug!(registry = %self.name, conn_id = %slot.key(), "client registered");
                let _ = slot.insert(proxy);
                true
            }
        }
    }

    /// Deregister a connection. Returns whether it was present.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let removed = self.clients.remove(id).is_some();
        if removed {
            debug!(registry = %self.name, conn_id = %id, "client removed");
        }
        removed
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<dyn ClientProxy>> {
        self.clients.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a connection is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.clients.contains_key(id)
    }

    /// Snapshot of every registered connection.
    ///
    /// Taken shard by shard; entries added or removed while iterating the
    /// returned list are not reflected, and no entry appears twice.
    pub fn all(&self) -> Vec<(ConnectionId, Arc<dyn ClientProxy>)> {
        self.clients
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Snapshot of registered connection ids.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// The connection and group registries shared by every connection of one
/// handler type.
#[derive(Clone)]
pub struct HandlerScope {
    clients: Arc<ClientRegistry>,
    groups: Arc<GroupRegistry>,
}

impl HandlerScope {
    /// Create a fresh scope with empty registries.
    pub fn new(name: impl Into<String>) -> Self {
        let clients = Arc::new(ClientRegistry::new(name));
        let groups = Arc::new(GroupRegistry::new(Arc::clone(&clients)));
        Self { clients, groups }
    }

    /// Connection registry.
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Group registry layered over [`Self::clients`].
    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }
}

/// Lazily created, process-scoped [`HandlerScope`]s keyed by handler type.
///
/// Two different handler types never see each other's connections. Construct
/// one per server (or per test) and pass it to the endpoints.
#[derive(Default)]
pub struct HandlerScopes {
    scopes: DashMap<TypeId, HandlerScope>,
}

impl HandlerScopes {
    /// Create an empty set of scopes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope for handler type `H`, created on first use.
    pub fn scope<H: 'static>(&self) -> HandlerScope {
        self.scopes
            .entry(TypeId::of::<H>())
            .or_insert_with(|| HandlerScope::new(short_type_name::<H>()))
            .clone()
    }

    /// Total live connections across all handler types.
    pub fn connection_count(&self) -> usize {
        self.scopes.iter().map(|scope| scope.clients.len()).sum()
    }
}

fn short_type_name<H>() -> &'static str {
    let full = type_name::<H>();
    full.rsplit("::").next().unwrap_or(full)
}
