//! In-memory storage for the name server registry.
//!
//! # Rust Learning Note
//!
//! ## One lock, not many
//!
//! The registry is a control-plane directory, so every operation goes through
//! a single `parking_lot::Mutex<HashMap<..>>`:
//!
//! ```rust,ignore
//! fn lookup(&self, name: &str) -> Result<String> {
//!     let entries = self.entries.lock();   // guard released at end of scope
//!     entries.get(name).map(|e| e.address.clone()).ok_or_else(...)
//! }
//! ```
//!
//! A sharded map would let `list()` see one shard before a write and another
//! shard after it. With one lock, a snapshot is taken at a single
//! serialization point and no reader can observe a half-written entry.
//!
//! `parking_lot` locks never poison, so there is no `unwrap()` on `lock()`.

use crate::types::Endpoint;
use hsu_common::{Error, Result, ServiceName};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Thread-safe name→endpoint map.
///
/// Shared as `Arc<RegistryStore>` between the network worker and any
/// in-process caller; both paths take the same lock.
#[derive(Debug, Default)]
pub struct RegistryStore {
    entries: Mutex<HashMap<ServiceName, Endpoint>>,
}

impl RegistryStore {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` at `address`, replacing any existing entry.
    ///
    /// Returns the previous address if the name was already registered.
    pub fn register(&self, name: impl Into<ServiceName>, address: impl Into<String>) -> Option<String> {
        let endpoint = Endpoint::new(name.into(), address);
        let name = endpoint.name.clone();
        let address = endpoint.address.clone();

        let previous = self.entries.lock().insert(name.clone(), endpoint);

        match &previous {
            Some(old) => info!(name = %name, old = %old.address, new = %address, "Re-registered endpoint"),
            None => info!(name = %name, address = %address, "Registered endpoint"),
        }

        previous.map(|old| old.address)
    }

    /// Removes `name` from the registry. Returns whether it existed.
    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.entries.lock().remove(name).is_some();
        if removed {
            info!(name = %name, "Unregistered endpoint");
        } else {
            debug!(name = %name, "Unregister of unknown name");
        }
        removed
    }

    /// Returns the address registered for `name`.
    pub fn lookup(&self, name: &str) -> Result<String> {
        self.entries
            .lock()
            .get(name)
            .map(|endpoint| endpoint.address.clone())
            .ok_or_else(|| Error::not_found(name))
    }

    /// Returns a copy of the full entry for `name`.
    pub fn get(&self, name: &str) -> Option<Endpoint> {
        self.entries.lock().get(name).cloned()
    }

    /// Returns a name→address snapshot of the whole registry.
    ///
    /// The result is a copy; later mutations are not visible through it.
    pub fn list(&self) -> BTreeMap<String, String> {
        self.entries
            .lock()
            .iter()
            .map(|(name, endpoint)| (name.to_string(), endpoint.address.clone()))
            .collect()
    }

    /// Returns the number of registered names.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every entry. Used when the server tears down.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        let count = entries.len();
        entries.clear();
        debug!(count, "Cleared all registry entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_register_and_lookup() {
        let store = RegistryStore::new();

        assert_eq!(store.register("svc-a", "tcp://10.0.0.1:9000"), None);
        assert_eq!(store.lookup("svc-a").unwrap(), "tcp://10.0.0.1:9000");

        let endpoint = store.get("svc-a").unwrap();
        assert_eq!(endpoint.name.as_str(), "svc-a");
    }

    #[test]
    fn test_last_write_wins() {
        let store = RegistryStore::new();

        store.register("svc-a", "tcp://10.0.0.1:9000");
        let previous = store.register("svc-a", "tcp://10.0.0.2:9000");

        assert_eq!(previous.as_deref(), Some("tcp://10.0.0.1:9000"));
        assert_eq!(store.lookup("svc-a").unwrap(), "tcp://10.0.0.2:9000");

        let snapshot = store.list();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["svc-a"], "tcp://10.0.0.2:9000");
    }

    #[test]
    fn test_unknown_name() {
        let store = RegistryStore::new();

        match store.lookup("nonexistent") {
            Err(Error::NotFound { resource }) => assert_eq!(resource, "nonexistent"),
            other => panic!("Expected NotFound, got {:?}", other),
        }
        assert!(!store.unregister("nonexistent"));
    }

    #[test]
    fn test_unregister() {
        let store = RegistryStore::new();
        store.register("svc-a", "tcp://10.0.0.1:9000");

        assert!(store.unregister("svc-a"));
        assert!(store.lookup("svc-a").is_err());
        assert!(!store.unregister("svc-a"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_list_is_snapshot() {
        let store = RegistryStore::new();
        store.register("svc-a", "tcp://10.0.0.1:9000");

        let snapshot = store.list();
        store.register("svc-b", "tcp://10.0.0.2:9000");
        store.unregister("svc-a");

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["svc-a"], "tcp://10.0.0.1:9000");
    }

    #[test]
    fn test_clear() {
        let store = RegistryStore::new();
        for i in 0..3 {
            store.register(format!("svc-{}", i), "tcp://127.0.0.1:1");
        }
        assert_eq!(store.len(), 3);

        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_registration() {
        let store = Arc::new(RegistryStore::new());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        store.register(format!("svc-{}-{}", i, j), format!("tcp://10.0.{}.{}:9000", i, j));
                        // readers interleave with writers
                        let _ = store.list();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 16 * 50);
        assert_eq!(store.list().len(), 16 * 50);
    }
}
