//! Validity registry: the process's set of live connections.
//!
//! Deferred tasks and user code hold [`ConnHandle`]s, not references. A
//! handle is a generational index into a slab; once the connection it
//! named is destroyed, the slot's generation moves on and the stale
//! handle resolves to `None` instead of a recycled neighbor.

use crate::conn::Conn;
use slab::Slab;
use std::sync::Arc;

/// An opaque, copyable reference to a connection.
///
/// Handles stay valid until the connection is destroyed; resolving a
/// stale handle is an O(1) miss, never a dangling access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle {
    index: u32,
    generation: u32,
}

impl ConnHandle {
    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }
}

struct Slot {
    generation: u32,
    conn: Arc<Conn>,
}

/// Slab of live connections with generation-checked lookup.
pub(crate) struct ConnRegistry {
    slots: Slab<Slot>,
    generation: u32,
}

impl ConnRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: Slab::new(),
            generation: 0,
        }
    }

    pub(crate) fn insert(&mut self, conn: Arc<Conn>) -> ConnHandle {
        self.generation = self.generation.wrapping_add(1);
        let generation = self.generation;
        let index = self.slots.insert(Slot { generation, conn }) as u32;
        ConnHandle { index, generation }
    }

    pub(crate) fn resolve(&self, handle: ConnHandle) -> Option<Arc<Conn>> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| slot.conn.clone())
    }

    pub(crate) fn remove(&mut self, handle: ConnHandle) -> Option<Arc<Conn>> {
        match self.slots.get(handle.index()) {
            Some(slot) if slot.generation == handle.generation => {
                Some(self.slots.remove(handle.index()).conn)
            }
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Snapshot of every live connection, for timeout review and the
    /// shutdown sweep.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Conn>> {
        self.slots.iter().map(|(_, s)| s.conn.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Conn;

    fn test_conn() -> Arc<Conn> {
        Conn::for_tests()
    }

    #[test]
    fn test_insert_resolve_remove() {
        let mut reg = ConnRegistry::new();
        let conn = test_conn();
        let handle = reg.insert(conn.clone());

        let resolved = reg.resolve(handle).expect("live handle must resolve");
        assert!(Arc::ptr_eq(&resolved, &conn));

        assert!(reg.remove(handle).is_some());
        assert!(reg.resolve(handle).is_none());
        assert!(reg.remove(handle).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_stale_handle_does_not_alias_reused_slot() {
        let mut reg = ConnRegistry::new();
        let stale = reg.insert(test_conn());
        reg.remove(stale);

        // The slab reuses index 0, but the generation differs.
        let fresh = reg.insert(test_conn());
        assert_eq!(stale.index(), fresh.index());
        assert!(reg.resolve(stale).is_none());
        assert!(reg.resolve(fresh).is_some());
    }

    #[test]
    fn test_snapshot_lists_live_conns() {
        let mut reg = ConnRegistry::new();
        let a = reg.insert(test_conn());
        let _b = reg.insert(test_conn());
        reg.remove(a);
        assert_eq!(reg.snapshot().len(), 1);
        assert_eq!(reg.len(), 1);
    }
}
