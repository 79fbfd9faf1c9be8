//! Transport abstraction: lifecycle, fire-and-forget send, one receive
//! callback, MTU. Backends handle the wire; frames are opaque bytes here.

use std::sync::{Arc, RwLock};

use peer_proto::{Destination, PeerError, DEFAULT_MTU};

/// Invoked once per inbound frame with the source descriptor (`peer:<id>`)
/// and the raw payload. Runs on the transport's single receive context, so
/// it must be fast or hand work off elsewhere.
pub type ReceiveCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Begin accepting inbound traffic. Idempotent if already started.
    async fn start(&self) -> Result<(), PeerError>;

    /// Tear down inbound processing and release connections. Safe to call
    /// more than once, and before `start()`.
    async fn stop(&self);

    /// Best-effort, fire-and-forget delivery. An unreachable destination is
    /// `Err(Dropped)`, never a panic; there is no ack, retry, or ordering
    /// guarantee across destinations.
    async fn send(&self, dest: &Destination, frame: &[u8]) -> Result<(), PeerError>;

    /// Register the single receive callback. Replacing it after frames have
    /// started arriving is undefined.
    fn on_receive(&self, cb: ReceiveCallback);

    /// Largest frame the caller's layer should produce.
    fn mtu(&self) -> usize {
        DEFAULT_MTU
    }
}

/// Shared holder for the receive callback, cloneable into background tasks.
#[derive(Clone, Default)]
pub(crate) struct CallbackCell(Arc<RwLock<Option<ReceiveCallback>>>);

impl CallbackCell {
    pub(crate) fn set(&self, cb: ReceiveCallback) {
        *self.0.write().unwrap() = Some(cb);
    }

    pub(crate) fn emit(&self, source: &str, frame: &[u8]) {
        let cb = self.0.read().unwrap().clone();
        if let Some(cb) = cb {
            cb(source, frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cell_is_silent_until_registered() {
        let cell = CallbackCell::default();
        cell.emit("peer:a", b"ignored");

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        cell.set(Arc::new(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        cell.emit("peer:a", b"counted");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_mtu_is_512k() {
        assert_eq!(DEFAULT_MTU, 512 * 1024);
    }
}
