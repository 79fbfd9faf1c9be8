//! Peer liveness: last-seen instants, touched on every inbound envelope.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct PeerTracker {
    seen: Mutex<HashMap<String, Instant>>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self, peer_id: &str) {
        self.seen
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), Instant::now());
    }

    /// Peers seen within the recency window, with how long ago each was seen.
    pub fn alive(&self, within: Duration) -> HashMap<String, Duration> {
        let now = Instant::now();
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(id, at)| {
                let age = now.duration_since(*at);
                (age <= within).then(|| (id.clone(), age))
            })
            .collect()
    }

    /// Whether the peer has ever been seen, regardless of age.
    pub fn ever_seen(&self, peer_id: &str) -> bool {
        self.seen.lock().unwrap().contains_key(peer_id)
    }
}
