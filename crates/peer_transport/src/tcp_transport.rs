//! Direct-address TCP transport.
//!
//! One local listener for inbound traffic, an address book mapping peer ids
//! to `host:port` endpoints, and one lazily-dialed persistent connection per
//! destination peer. Every outbound message is a multipart frame tagged with
//! this peer's own id, so the remote side can recover the sender identity
//! without a handshake. Self-id uniqueness is a caller-enforced precondition.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use peer_proto::{Destination, PeerError};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::framing;
use crate::transport::{CallbackCell, ReceiveCallback, Transport};

const STOP_JOIN: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const INBOUND_QUEUE: usize = 1024;

/// Accept both bare `host:port` and the `tcp://host:port` dial strings the
/// address-book files tend to carry.
fn strip_scheme(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}

/// One slot per destination peer. Dialing and writing happen under the
/// slot's own lock, so sends to different peers never serialize on each
/// other, only the brief slot lookup is shared.
type ConnSlot = Arc<Mutex<Option<TcpStream>>>;

pub struct TcpTransport {
    self_id: String,
    book: RwLock<HashMap<String, String>>,
    conns: Mutex<HashMap<String, ConnSlot>>,
    cb: CallbackCell,
    listener: StdMutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("self_id", &self.self_id)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl TcpTransport {
    /// Bind the local rendezvous socket. A bind failure or malformed endpoint
    /// surfaces here; a transport that cannot listen must not exist silently.
    pub async fn bind(
        self_id: &str,
        bind: &str,
        address_book: HashMap<String, String>,
    ) -> Result<Self, PeerError> {
        let listener = TcpListener::bind(strip_scheme(bind))
            .await
            .with_context(|| format!("bind {bind}"))
            .map_err(PeerError::Construction)?;
        let local_addr = listener
            .local_addr()
            .context("local addr")
            .map_err(PeerError::Construction)?;
        debug!("tcp transport for {self_id} listening on {local_addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            self_id: self_id.to_string(),
            book: RwLock::new(address_book),
            conns: Mutex::new(HashMap::new()),
            cb: CallbackCell::default(),
            listener: StdMutex::new(Some(listener)),
            local_addr,
            shutdown_tx,
            shutdown_rx,
            accept_task: Mutex::new(None),
            dispatch_task: Mutex::new(None),
        })
    }

    /// Late address-book population, e.g. fed by discovery. Safe under
    /// concurrent sends; no restart needed.
    pub fn add_peer(&self, peer_id: &str, endpoint: &str) {
        self.book
            .write()
            .unwrap()
            .insert(peer_id.to_string(), endpoint.to_string());
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live cached outbound connections.
    pub async fn connection_count(&self) -> usize {
        let slots: Vec<ConnSlot> = self.conns.lock().await.values().cloned().collect();
        let mut live = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                live += 1;
            }
        }
        live
    }

    async fn send_to(&self, peer_id: &str, frame: &[u8]) -> Result<(), PeerError> {
        let endpoint = self.book.read().unwrap().get(peer_id).cloned();
        let Some(endpoint) = endpoint else {
            debug!("no address for peer {peer_id}, dropping frame");
            return Err(PeerError::Dropped);
        };

        let slot = {
            let mut conns = self.conns.lock().await;
            conns.entry(peer_id.to_string()).or_default().clone()
        };

        // Dial-or-reuse under the per-peer lock: concurrent sends to this
        // peer share one connection, and a slow dial here cannot stall sends
        // to any other peer.
        let mut conn = slot.lock().await;
        if conn.is_none() {
            let dial = TcpStream::connect(strip_scheme(&endpoint));
            let stream = match tokio::time::timeout(CONNECT_TIMEOUT, dial).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("connect to {peer_id} at {endpoint} failed: {e}");
                    return Err(PeerError::Dropped);
                }
                Err(_) => {
                    debug!("connect to {peer_id} at {endpoint} timed out");
                    return Err(PeerError::Dropped);
                }
            };
            stream.set_nodelay(true).ok();
            *conn = Some(stream);
        }
        let Some(stream) = conn.as_mut() else {
            return Err(PeerError::Dropped);
        };
        if let Err(e) = framing::write_parts(stream, &[self.self_id.as_bytes(), frame]).await {
            debug!("write to {peer_id} failed, discarding connection: {e}");
            *conn = None;
            return Err(PeerError::Dropped);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> Result<(), PeerError> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() {
            return Ok(());
        }
        let Some(listener) = self.listener.lock().unwrap().take() else {
            warn!("tcp transport start() after stop(), ignoring");
            return Ok(());
        };

        let (tx, mut rx) = mpsc::channel::<(String, Vec<u8>)>(INBOUND_QUEUE);

        // All callbacks fire on this one task; a slow handler stalls inbound
        // delivery for the whole transport.
        let cb = self.cb.clone();
        *self.dispatch_task.lock().await = Some(tokio::spawn(async move {
            while let Some((source, frame)) = rx.recv().await {
                cb.emit(&source, &frame);
            }
        }));

        let mut shutdown_rx = self.shutdown_rx.clone();
        *accept_task = Some(tokio::spawn(async move {
            let mut readers = JoinSet::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((mut stream, addr)) => {
                            debug!("inbound connection from {addr}");
                            let tx = tx.clone();
                            readers.spawn(async move {
                                loop {
                                    match framing::read_parts(&mut stream).await {
                                        Ok(parts) if parts.len() >= 2 => {
                                            let identity =
                                                String::from_utf8_lossy(&parts[0]).into_owned();
                                            let payload =
                                                parts.last().cloned().unwrap_or_default();
                                            if tx
                                                .send((format!("peer:{identity}"), payload))
                                                .await
                                                .is_err()
                                            {
                                                break;
                                            }
                                        }
                                        Ok(_) => {
                                            warn!("malformed frame from {addr}, closing");
                                            break;
                                        }
                                        Err(e) => {
                                            debug!("connection from {addr} closed: {e}");
                                            break;
                                        }
                                    }
                                }
                            });
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    },
                }
            }
            // Readers must be gone before the listener drops with this task.
            readers.shutdown().await;
        }));
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        // Join the receive side first; only then is it safe to tear sockets
        // down underneath it.
        if let Some(mut handle) = self.accept_task.lock().await.take() {
            if tokio::time::timeout(STOP_JOIN, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        if let Some(mut handle) = self.dispatch_task.lock().await.take() {
            if tokio::time::timeout(STOP_JOIN, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        self.conns.lock().await.clear();
        self.listener.lock().unwrap().take();
    }

    async fn send(&self, dest: &Destination, frame: &[u8]) -> Result<(), PeerError> {
        match dest {
            Destination::Peer(peer_id) => self.send_to(peer_id, frame).await,
            Destination::Broadcast => {
                let targets: Vec<String> = self.book.read().unwrap().keys().cloned().collect();
                for peer_id in targets {
                    if let Err(e) = self.send_to(&peer_id, frame).await {
                        debug!("broadcast to {peer_id} failed: {e}");
                    }
                }
                Ok(())
            }
        }
    }

    fn on_receive(&self, cb: ReceiveCallback) {
        self.cb.set(cb);
    }
}
