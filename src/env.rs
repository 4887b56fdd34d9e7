//! Per-connection (and process-wide) environment store.
//!
//! An env links opaque resources to a connection's lifetime: each entry is
//! keyed by `(type, name)` and carries a teardown callback that fires when
//! the entry is replaced, explicitly removed, or the connection dies.
//! Teardown runs in reverse insertion order, so resources unwind like a
//! stack. The process-wide env unwinds at exit.

use crate::protocol::UserData;
use bytes::Bytes;

/// An env entry name.
///
/// `Borrowed` documents that the bytes outlive the store (no copy is
/// taken); `Owned` carries its own storage. The two compare by content.
#[derive(Debug, Clone)]
pub enum Name {
    Borrowed(&'static [u8]),
    Owned(Bytes),
}

impl Name {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Name::Borrowed(b) => b,
            Name::Owned(b) => b,
        }
    }

    /// Copy arbitrary bytes into an owned name.
    pub fn copied(bytes: &[u8]) -> Self {
        Name::Owned(Bytes::copy_from_slice(bytes))
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Name {}

impl From<&'static str> for Name {
    fn from(s: &'static str) -> Self {
        Name::Borrowed(s.as_bytes())
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Name::Owned(Bytes::from(s))
    }
}

impl From<Bytes> for Name {
    fn from(b: Bytes) -> Self {
        Name::Owned(b)
    }
}

/// Teardown callback for an env entry.
pub type EnvCloseFn = Box<dyn FnOnce(UserData) + Send>;

pub(crate) struct EnvEntry {
    type_id: i64,
    name: Name,
    udata: UserData,
    on_close: Option<EnvCloseFn>,
}

impl EnvEntry {
    /// Run the teardown callback, consuming the entry. Dropping an entry
    /// without calling this discards the callback silently (the `unset`
    /// contract).
    pub(crate) fn fire(mut self) {
        if let Some(f) = self.on_close.take() {
            f(self.udata.take());
        }
    }
}

impl std::fmt::Debug for EnvEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvEntry")
            .field("type", &self.type_id)
            .field("name", &self.name)
            .finish()
    }
}

/// Insertion-ordered `(type, name)` map with stack-like teardown.
///
/// Entries are few per connection; a vector with linear lookup keeps the
/// order explicit and the common paths allocation-free.
pub(crate) struct EnvStore {
    entries: Vec<EnvEntry>,
}

impl EnvStore {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn position(&self, type_id: i64, name: &Name) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.type_id == type_id && &e.name == name)
    }

    /// Insert or replace. A replaced entry keeps its original position in
    /// the teardown order; the displaced entry is returned so the caller
    /// can fire its callback asynchronously.
    pub(crate) fn set(
        &mut self,
        type_id: i64,
        name: Name,
        udata: UserData,
        on_close: Option<EnvCloseFn>,
    ) -> Option<EnvEntry> {
        let entry = EnvEntry {
            type_id,
            name,
            udata,
            on_close,
        };
        match self.position(type_id, &entry.name) {
            Some(pos) => Some(std::mem::replace(&mut self.entries[pos], entry)),
            None => {
                self.entries.push(entry);
                None
            }
        }
    }

    /// Remove an entry. Whether its callback runs is the caller's call:
    /// dropping the returned entry skips it, `fire()` runs it.
    pub(crate) fn take(&mut self, type_id: i64, name: &Name) -> Option<EnvEntry> {
        self.position(type_id, name)
            .map(|pos| self.entries.remove(pos))
    }

    pub(crate) fn get(&self, type_id: i64, name: &Name) -> Option<UserData> {
        self.position(type_id, name)
            .map(|pos| self.entries[pos].udata.clone())
    }

    /// Pull every entry out in insertion order. Teardown reverses this.
    pub(crate) fn drain(&mut self) -> Vec<EnvEntry> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
