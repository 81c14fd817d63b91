//! Client registry: public identifier → remote handle of the connection that
//! last authenticated under it.

use std::collections::HashMap;

use uuid::Uuid;

use crate::session::remote::RemoteHandle;

/// Public identifiers are arbitrary bytes; the registry keys them by hex.
fn key_for(public_id: &[u8]) -> String {
    hex::encode(public_id)
}

/// Last-writer-wins map of authenticated clients.
pub struct ClientRegistry {
    by_public_id: HashMap<String, RemoteHandle>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            by_public_id: HashMap::new(),
        }
    }

    /// Store `remote` under `public_id`, returning the entry it replaced.
    pub fn store(&mut self, public_id: &[u8], remote: RemoteHandle) -> Option<RemoteHandle> {
        self.by_public_id.insert(key_for(public_id), remote)
    }

    pub fn load(&self, public_id: &[u8]) -> Option<RemoteHandle> {
        self.by_public_id.get(&key_for(public_id)).cloned()
    }

    /// Remove the entry for `public_id` if connection `conn_id` still owns it.
    ///
    /// A later connection that re-authenticated under the same identifier keeps
    /// its entry.
    pub fn evict(&mut self, public_id: &[u8], conn_id: Uuid) -> bool {
        let key = key_for(public_id);
        match self.by_public_id.get(&key) {
            Some(remote) if remote.connection_id() == conn_id => {
                self.by_public_id.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.by_public_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_public_id.is_empty()
    }

    /// Drop every entry (for shutdown).
    pub fn drain(&mut self) -> impl Iterator<Item = RemoteHandle> + '_ {
        self.by_public_id.drain().map(|(_, remote)| remote)
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
