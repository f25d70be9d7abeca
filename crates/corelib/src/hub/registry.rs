//! Ordered collection of registered connections.
//!
//! Writers (registration, eviction) take the write lock; aggregate readers
//! clone a snapshot under the read lock and fan out with no lock held, so a
//! connection added or evicted mid-call never disturbs an iteration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::peer::{ConnectionId, PeerAddress};

/// A registered connection together with its recorded address.
#[derive(Debug, Clone)]
pub(crate) struct Member {
    pub connection: Arc<Connection>,
    pub address: Option<PeerAddress>,
}

#[derive(Debug, Default)]
struct Entries {
    /// Registration order.
    connections: Vec<Arc<Connection>>,
    addresses: HashMap<ConnectionId, PeerAddress>,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    entries: RwLock<Entries>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append `connection`; fails if its name is already registered.
    pub(crate) fn register(&self, connection: Arc<Connection>) -> Result<()> {
        let mut entries = self.entries.write();
        if entries
            .connections
            .iter()
            .any(|existing| existing.name() == connection.name())
        {
            return Err(Error::DuplicateName(connection.name().to_string()));
        }
        if let Some(address) = connection.peer() {
            entries.addresses.insert(connection.id(), address.clone());
        }
        entries.connections.push(connection);
        Ok(())
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .connections
            .iter()
            .any(|connection| connection.name() == name)
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<Connection>> {
        self.entries
            .read()
            .connections
            .iter()
            .find(|connection| connection.name() == name)
            .cloned()
    }

    /// Consistent copy of every member, in registration order.
    pub(crate) fn snapshot(&self) -> Vec<Member> {
        let entries = self.entries.read();
        entries
            .connections
            .iter()
            .map(|connection| Member {
                connection: Arc::clone(connection),
                address: entries.addresses.get(&connection.id()).cloned(),
            })
            .collect()
    }

    pub(crate) fn remove_id(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut entries = self.entries.write();
        let index = entries.connections.iter().position(|c| c.id() == id)?;
        entries.addresses.remove(&id);
        Some(entries.connections.remove(index))
    }

    pub(crate) fn remove_name(&self, name: &str) -> Option<Arc<Connection>> {
        let mut entries = self.entries.write();
        let index = entries.connections.iter().position(|c| c.name() == name)?;
        let connection = entries.connections.remove(index);
        entries.addresses.remove(&connection.id());
        Some(connection)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionSettings;

    #[test]
    fn duplicate_names_are_refused_and_first_is_kept() {
        let registry = Registry::new();
        let first = Connection::new("peerA", ConnectionSettings::default());
        let second = Connection::new("peerA", ConnectionSettings::default());

        registry.register(Arc::clone(&first)).unwrap();
        let err = registry.register(second).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(name) if name == "peerA"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("peerA").unwrap().id(), first.id());
    }

    #[test]
    fn snapshot_preserves_registration_order() {
        let registry = Registry::new();
        for name in ["c", "a", "b"] {
            registry
                .register(Connection::new(name, ConnectionSettings::default()))
                .unwrap();
        }
        let names: Vec<_> = registry
            .snapshot()
            .iter()
            .map(|member| member.connection.name().to_string())
            .collect();
        assert_eq!(names, ["c", "a", "b"]);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_removal() {
        let registry = Registry::new();
        let conn = Connection::new("a", ConnectionSettings::default());
        registry.register(Arc::clone(&conn)).unwrap();

        let snapshot = registry.snapshot();
        assert!(registry.remove_id(conn.id()).is_some());
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 0);
        assert!(registry.remove_id(conn.id()).is_none());
    }

    #[test]
    fn removal_by_id_ignores_a_newer_namesake() {
        let registry = Registry::new();
        let old = Connection::new("a", ConnectionSettings::default());
        let new = Connection::new("a", ConnectionSettings::default());
        registry.register(Arc::clone(&old)).unwrap();
        registry.remove_name("a").unwrap();
        registry.register(Arc::clone(&new)).unwrap();

        assert!(registry.remove_id(old.id()).is_none());
        assert!(registry.contains("a"));
    }
}
