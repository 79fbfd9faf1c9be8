//! Key knowledge: which RPC keys this peer serves, and which keys each
//! remote peer is known to serve. Populated by discovery hellos or seeded
//! manually; queried locally, never over the network.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    local: HashSet<String>,
    known: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct KeyRegistry {
    inner: Mutex<Inner>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that this peer serves `key`.
    pub fn advertise(&self, key: &str) {
        self.inner.lock().unwrap().local.insert(key.to_string());
    }

    /// Keys this peer serves, for hello announcements.
    pub fn advertised(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().unwrap().local.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Record that `peer_id` serves the given keys.
    pub fn learn(&self, peer_id: &str, keys: &[String]) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.known.entry(peer_id.to_string()).or_default();
        for key in keys {
            entry.insert(key.clone());
        }
    }

    pub fn peer_supports(&self, peer_id: &str, key: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .known
            .get(peer_id)
            .is_some_and(|keys| keys.contains(key))
    }
}
