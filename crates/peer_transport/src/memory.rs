//! In-process transport backed by channels: records nothing, touches no
//! sockets. Used to exercise the protocol layer in tests, and handy for
//! single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use peer_proto::{Destination, PeerError};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{CallbackCell, ReceiveCallback, Transport};

/// Routing table shared by every [`MemoryTransport`] attached to it.
#[derive(Default)]
pub struct MemoryHub {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<(String, Vec<u8>)>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new peer to the hub.
    pub fn transport(self: &Arc<Self>, peer_id: &str) -> MemoryTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), tx);
        MemoryTransport {
            hub: self.clone(),
            self_id: peer_id.to_string(),
            cb: CallbackCell::default(),
            inbound: Mutex::new(Some(rx)),
            dispatch: tokio::sync::Mutex::new(None),
        }
    }
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    self_id: String,
    cb: CallbackCell,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<(String, Vec<u8>)>>>,
    dispatch: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn start(&self) -> Result<(), PeerError> {
        let mut dispatch = self.dispatch.lock().await;
        if dispatch.is_some() {
            return Ok(());
        }
        let Some(mut rx) = self.inbound.lock().unwrap().take() else {
            return Ok(());
        };
        let cb = self.cb.clone();
        *dispatch = Some(tokio::spawn(async move {
            while let Some((source, frame)) = rx.recv().await {
                cb.emit(&source, &frame);
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        // Dropping our route closes the channel, which ends the dispatch task.
        self.hub.routes.lock().unwrap().remove(&self.self_id);
        if let Some(handle) = self.dispatch.lock().await.take() {
            handle.await.ok();
        }
    }

    async fn send(&self, dest: &Destination, frame: &[u8]) -> Result<(), PeerError> {
        let source = format!("peer:{}", self.self_id);
        match dest {
            Destination::Peer(id) => {
                let tx = self.hub.routes.lock().unwrap().get(id).cloned();
                match tx {
                    Some(tx) if tx.send((source, frame.to_vec())).is_ok() => Ok(()),
                    _ => {
                        debug!("memory send to unknown peer {id}, dropping");
                        Err(PeerError::Dropped)
                    }
                }
            }
            Destination::Broadcast => {
                let targets: Vec<_> = {
                    let routes = self.hub.routes.lock().unwrap();
                    routes
                        .iter()
                        .filter(|(id, _)| id.as_str() != self.self_id)
                        .map(|(_, tx)| tx.clone())
                        .collect()
                };
                for tx in targets {
                    tx.send((source.clone(), frame.to_vec())).ok();
                }
                Ok(())
            }
        }
    }

    fn on_receive(&self, cb: ReceiveCallback) {
        self.cb.set(cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc as tmpsc;

    async fn recv_one(rx: &mut tmpsc::UnboundedReceiver<(String, Vec<u8>)>) -> (String, Vec<u8>) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    fn forwarding_cb(tx: tmpsc::UnboundedSender<(String, Vec<u8>)>) -> ReceiveCallback {
        Arc::new(move |src, frame| {
            tx.send((src.to_string(), frame.to_vec())).ok();
        })
    }

    #[tokio::test]
    async fn unicast_carries_sender_identity() {
        let hub = MemoryHub::new();
        let a = hub.transport("a");
        let b = hub.transport("b");

        let (tx, mut rx) = tmpsc::unbounded_channel();
        b.on_receive(forwarding_cb(tx));
        b.start().await.unwrap();

        a.send(&Destination::peer("b"), b"hi").await.unwrap();
        let (src, frame) = recv_one(&mut rx).await;
        assert_eq!(src, "peer:a");
        assert_eq!(frame, b"hi");
    }

    #[tokio::test]
    async fn unknown_peer_is_dropped() {
        let hub = MemoryHub::new();
        let a = hub.transport("a");
        let err = a.send(&Destination::peer("ghost"), b"x").await.unwrap_err();
        assert!(err.is_dropped());
    }

    #[tokio::test]
    async fn broadcast_skips_self() {
        let hub = MemoryHub::new();
        let a = hub.transport("a");
        let b = hub.transport("b");
        let c = hub.transport("c");

        let hits = Arc::new(AtomicUsize::new(0));
        for t in [&b, &c] {
            let h = hits.clone();
            t.on_receive(Arc::new(move |_, _| {
                h.fetch_add(1, Ordering::SeqCst);
            }));
            t.start().await.unwrap();
        }
        let self_hits = Arc::new(AtomicUsize::new(0));
        let sh = self_hits.clone();
        a.on_receive(Arc::new(move |_, _| {
            sh.fetch_add(1, Ordering::SeqCst);
        }));
        a.start().await.unwrap();

        a.send(&Destination::Broadcast, b"fanout").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(self_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_twice_is_fine() {
        let hub = MemoryHub::new();
        let a = hub.transport("a");
        a.start().await.unwrap();
        a.stop().await;
        a.stop().await;
    }
}
