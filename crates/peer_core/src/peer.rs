//! The peer runtime: one transport, one protocol session, and optionally a
//! discovery announcer, composed into a live, addressable peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peer_proto::{normalize, Payload, PeerError};
use peer_transport::{AmqpTransport, TcpTransport, Transport};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::info;

use crate::discovery::Discovery;
use crate::session::{Delivery, RpcHandler, Session, TopicHandler};

/// Default request TTL.
pub const DEFAULT_TTL_MS: u64 = 8000;

const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_POLL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct PeerOptions {
    /// Keys to advertise from the first moment, each backed by a default
    /// empty responder until an application handler replaces it.
    pub keys: Vec<String>,
    pub discovery: bool,
    pub discovery_interval: Duration,
    pub hello_on_start: bool,
    /// Route publishes over the broadcast path instead of per-subscriber
    /// unicast. The AMQP constructor turns this on.
    pub fanout_publish: bool,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            discovery: false,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            hello_on_start: true,
            fanout_publish: false,
        }
    }
}

pub struct Peer {
    self_id: String,
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    discovery: Option<Discovery>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("self_id", &self.self_id)
            .finish_non_exhaustive()
    }
}

impl Peer {
    /// Compose a peer from an already-constructed transport: bind the
    /// session, register initial keys, start the transport, then discovery.
    pub async fn start(
        self_id: &str,
        transport: Arc<dyn Transport>,
        opts: PeerOptions,
    ) -> Result<Self, PeerError> {
        let session = Session::bind(transport.clone(), self_id, opts.fanout_publish);
        for key in &opts.keys {
            session.serve(key, Arc::new(|_payload, _ctx| Value::Null));
        }
        // Built-in introspection: any peer can be asked what it serves.
        let registry = session.keys().clone();
        session.serve(
            "keys",
            Arc::new(move |_payload, _ctx| json!({ "keys": registry.advertised() })),
        );
        transport.start().await?;

        let discovery = if opts.discovery {
            let disco = Discovery::new(session.clone(), opts.discovery_interval);
            if opts.hello_on_start {
                disco.announce_now().await;
            }
            disco.start().await;
            Some(disco)
        } else {
            None
        };

        info!("peer {self_id} up (discovery={})", opts.discovery);
        Ok(Self {
            self_id: self_id.to_string(),
            transport,
            session,
            discovery,
            stopped: AtomicBool::new(false),
        })
    }

    /// Direct-address peer: bind the local endpoint, seed the address book.
    pub async fn tcp(
        self_id: &str,
        bind: &str,
        address_book: HashMap<String, String>,
        opts: PeerOptions,
    ) -> Result<Self, PeerError> {
        let transport = Arc::new(TcpTransport::bind(self_id, bind, address_book).await?);
        Self::start(self_id, transport, opts).await
    }

    /// Brokered peer: everything routes through the AMQP broker, and
    /// publishes use the fanout exchange.
    pub async fn amqp(self_id: &str, url: &str, opts: PeerOptions) -> Result<Self, PeerError> {
        let transport = Arc::new(AmqpTransport::connect(self_id, url).await?);
        let opts = PeerOptions {
            fanout_publish: true,
            ..opts
        };
        Self::start(self_id, transport, opts).await
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Keyed request with an explicit TTL; times out as `PeerError::Timeout`.
    pub async fn request(
        &self,
        peer_id: &str,
        key: &str,
        payload: Value,
        ttl_ms: u64,
    ) -> Result<Payload, PeerError> {
        self.session
            .request_peer(peer_id, key, normalize(payload), Duration::from_millis(ttl_ms))
            .await
    }

    /// `request` with the default TTL.
    pub async fn rpc(&self, peer_id: &str, key: &str, payload: Value) -> Result<Payload, PeerError> {
        self.request(peer_id, key, payload, DEFAULT_TTL_MS).await
    }

    /// Register one responder for each key; last registration wins.
    pub fn serve_keys(&self, keys: &[&str], handler: RpcHandler) {
        for key in keys {
            self.session.serve(key, handler.clone());
        }
    }

    /// Local handler for every inbound publish on `topic`.
    pub fn listen(&self, topic: &str, handler: TopicHandler) {
        self.session.listen(topic, handler);
    }

    pub fn listen_many(&self, handlers: impl IntoIterator<Item = (String, TopicHandler)>) {
        for (topic, handler) in handlers {
            self.session.listen(&topic, handler);
        }
    }

    /// Announce topic interest to the network.
    pub async fn subscribe(&self, topics: &[&str]) {
        let add: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        self.session.subscribe_topics(&add, &[]).await;
    }

    pub async fn unsubscribe(&self, topics: &[&str]) {
        let remove: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        self.session.subscribe_topics(&[], &remove).await;
    }

    pub async fn publish(&self, topic: &str, payload: Value) -> Result<Delivery, PeerError> {
        self.session.publish(topic, normalize(payload)).await
    }

    pub async fn emit(&self, topic: &str, payload: Value) -> Result<Delivery, PeerError> {
        self.publish(topic, payload).await
    }

    /// Announce presence immediately. Failures are swallowed by design.
    pub async fn hello(&self) {
        self.session.announce_hello().await;
    }

    /// Peers seen within the window, with how long ago each was seen.
    pub fn peers_alive(&self, within: Duration) -> HashMap<String, Duration> {
        self.session.peers().alive(within)
    }

    /// Local knowledge only; no network call.
    pub fn knows_key(&self, peer_id: &str, key: &str) -> bool {
        self.session.keys().peer_supports(peer_id, key)
    }

    /// Poll `knows_key` until true or `timeout` elapses. Never errors; must
    /// not be called from a handler on the receive context.
    pub async fn wait_for_key(
        &self,
        peer_id: &str,
        key: &str,
        timeout: Duration,
        poll: Option<Duration>,
    ) -> bool {
        self.wait_until(timeout, poll, || self.knows_key(peer_id, key))
            .await
    }

    /// Poll until the peer has been seen at all, or `timeout` elapses.
    pub async fn wait_for_peer(
        &self,
        peer_id: &str,
        timeout: Duration,
        poll: Option<Duration>,
    ) -> bool {
        self.wait_until(timeout, poll, || self.session.peers().ever_seen(peer_id))
            .await
    }

    async fn wait_until(
        &self,
        timeout: Duration,
        poll: Option<Duration>,
        predicate: impl Fn() -> bool,
    ) -> bool {
        let poll = poll.unwrap_or(DEFAULT_POLL);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            tokio::time::sleep(poll).await;
        }
        predicate()
    }

    /// Seed key knowledge manually, for when discovery has not propagated yet.
    pub fn learn_peer_keys(&self, peer_id: &str, keys: &[&str]) {
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        self.session.learn_peer_keys(peer_id, &keys);
    }

    /// Idempotent shutdown: discovery timer first, then the transport. The
    /// steps are isolated; neither can keep the other from running.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(disco) = &self.discovery {
            disco.stop().await;
        }
        self.transport.stop().await;
        info!("peer {} stopped", self.self_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_transport::MemoryHub;
    use serde_json::json;

    async fn memory_peer(hub: &Arc<MemoryHub>, id: &str, opts: PeerOptions) -> Peer {
        let transport: Arc<dyn Transport> = Arc::new(hub.transport(id));
        Peer::start(id, transport, opts).await.unwrap()
    }

    #[tokio::test]
    async fn initial_keys_get_default_responders() {
        let hub = MemoryHub::new();
        let a = memory_peer(&hub, "a", PeerOptions::default()).await;
        let b = memory_peer(
            &hub,
            "b",
            PeerOptions {
                keys: vec!["status".into()],
                ..Default::default()
            },
        )
        .await;

        // The default responder answers with an empty payload.
        let resp = a.request("b", "status", json!({}), 2000).await.unwrap();
        assert!(resp.is_empty());

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn any_peer_reports_its_served_keys() {
        let hub = MemoryHub::new();
        let a = memory_peer(&hub, "a", PeerOptions::default()).await;
        let b = memory_peer(
            &hub,
            "b",
            PeerOptions {
                keys: vec!["status".into()],
                ..Default::default()
            },
        )
        .await;

        let resp = a.request("b", "keys", json!({}), 2000).await.unwrap();
        let keys = resp.get("keys").and_then(Value::as_array).unwrap().clone();
        assert!(keys.contains(&json!("status")));
        assert!(keys.contains(&json!("keys")));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn discovery_spreads_key_knowledge() {
        let hub = MemoryHub::new();
        let a = memory_peer(&hub, "a", PeerOptions::default()).await;
        let b = memory_peer(
            &hub,
            "b",
            PeerOptions {
                keys: vec!["echo".into()],
                discovery: true,
                discovery_interval: Duration::from_millis(40),
                ..Default::default()
            },
        )
        .await;

        assert!(
            a.wait_for_key("b", "echo", Duration::from_secs(2), None)
                .await
        );
        assert!(a.wait_for_peer("b", Duration::from_secs(1), None).await);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn wait_for_key_times_out_false() {
        let hub = MemoryHub::new();
        let a = memory_peer(&hub, "a", PeerOptions::default()).await;

        let started = std::time::Instant::now();
        let found = a
            .wait_for_key("ghost", "echo", Duration::from_millis(200), Some(Duration::from_millis(20)))
            .await;
        assert!(!found);
        // Bounded: returns within the timeout plus one poll interval.
        assert!(started.elapsed() < Duration::from_millis(400));

        a.stop().await;
    }

    #[tokio::test]
    async fn learn_peer_keys_seeds_without_network() {
        let hub = MemoryHub::new();
        let a = memory_peer(&hub, "a", PeerOptions::default()).await;

        assert!(!a.knows_key("b", "echo"));
        a.learn_peer_keys("b", &["echo"]);
        assert!(a.knows_key("b", "echo"));

        a.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_with_and_without_discovery() {
        let hub = MemoryHub::new();
        let a = memory_peer(
            &hub,
            "a",
            PeerOptions {
                discovery: true,
                discovery_interval: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .await;
        a.stop().await;
        a.stop().await;

        let b = memory_peer(&hub, "b", PeerOptions::default()).await;
        b.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn rpc_uses_default_ttl_and_normalizes_scalars() {
        let hub = MemoryHub::new();
        let a = memory_peer(&hub, "a", PeerOptions::default()).await;
        let b = memory_peer(&hub, "b", PeerOptions::default()).await;

        b.serve_keys(&["double"], Arc::new(|payload, _ctx| {
            let n = payload.get("data").and_then(Value::as_i64).unwrap_or(0);
            json!(n * 2)
        }));

        // Scalar payloads are wrapped as {"data": ...} on both legs.
        let resp = a.rpc("b", "double", json!(21)).await.unwrap();
        assert_eq!(resp.get("data"), Some(&json!(42)));

        a.stop().await;
        b.stop().await;
    }
}
