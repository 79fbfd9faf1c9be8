//! Protocol session bound to one transport: request/response correlation,
//! topic publish/subscribe, hello announcements, and peer/key bookkeeping.
//!
//! All inbound handling runs on the transport's single receive context.
//! Responders and topic handlers are invoked synchronously there; anything
//! slow belongs on a task of its own.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peer_proto::{normalize, Destination, Envelope, Kind, Payload, PeerError};
use peer_transport::Transport;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::debug;

use crate::keys::KeyRegistry;
use crate::peers::PeerTracker;

/// Responder for a served RPC key. May return any JSON value; it is
/// normalized into a payload before the response leaves the peer.
pub type RpcHandler = Arc<dyn Fn(&Payload, &RequestContext) -> Value + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub source: String,
    pub key: String,
    pub msg_id: String,
}

#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub source: String,
    pub topic: String,
    pub payload: Payload,
}

pub type TopicHandler = Arc<dyn Fn(&TopicMessage) + Send + Sync>;

/// Explicit registration record; the handler is bound to its topic here,
/// not through a captured loop variable.
struct TopicBinding {
    topic: String,
    handler: TopicHandler,
}

/// What a publish achieved, as far as the publisher can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Sent directly to this many peers believed to be subscribed.
    Counted(usize),
    /// Handed to the fanout path; per-peer counting is unavailable.
    Broadcast,
}

pub struct Session {
    self_id: String,
    transport: Arc<dyn Transport>,
    keys: Arc<KeyRegistry>,
    peers: Arc<PeerTracker>,
    responders: Mutex<HashMap<String, RpcHandler>>,
    bindings: Mutex<Vec<TopicBinding>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
    /// topic -> peers that announced interest.
    remote_subs: Mutex<HashMap<String, HashSet<String>>>,
    /// topics this peer announced interest in.
    local_subs: Mutex<HashSet<String>>,
    fanout_publish: bool,
}

impl Session {
    /// Create a session and register it as the transport's receive callback.
    /// With `fanout_publish` set, publishes ride the broadcast path instead
    /// of per-subscriber unicast (the brokered topology's natural mode).
    pub fn bind(transport: Arc<dyn Transport>, self_id: &str, fanout_publish: bool) -> Arc<Self> {
        let session = Arc::new(Self {
            self_id: self_id.to_string(),
            transport: transport.clone(),
            keys: Arc::new(KeyRegistry::new()),
            peers: Arc::new(PeerTracker::new()),
            responders: Mutex::new(HashMap::new()),
            bindings: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            remote_subs: Mutex::new(HashMap::new()),
            local_subs: Mutex::new(HashSet::new()),
            fanout_publish,
        });
        let bound = session.clone();
        transport.on_receive(Arc::new(move |source, frame| {
            bound.clone().handle_frame(source, frame);
        }));
        session
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn keys(&self) -> &Arc<KeyRegistry> {
        &self.keys
    }

    pub fn peers(&self) -> &Arc<PeerTracker> {
        &self.peers
    }

    /// Register a responder for `key`; the last registration wins.
    pub fn serve(&self, key: &str, handler: RpcHandler) {
        self.responders
            .lock()
            .unwrap()
            .insert(key.to_string(), handler);
        self.keys.advertise(key);
    }

    /// Register a local handler for every inbound publish on `topic`,
    /// independent of announced subscription state.
    pub fn listen(&self, topic: &str, handler: TopicHandler) {
        self.bindings.lock().unwrap().push(TopicBinding {
            topic: topic.to_string(),
            handler,
        });
    }

    /// Send a keyed request and await the correlated response.
    pub async fn request_peer(
        &self,
        peer_id: &str,
        key: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload, PeerError> {
        let env = Envelope::request(&self.self_id, key, payload);
        let frame = env.encode().map_err(PeerError::construction)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(env.id.clone(), tx);

        if let Err(e) = self
            .transport
            .send(&Destination::peer(peer_id), &frame)
            .await
        {
            self.pending.lock().unwrap().remove(&env.id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp.payload),
            Ok(Err(_)) => {
                // Completion side dropped without answering; treat as lost.
                Err(PeerError::Dropped)
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(&env.id);
                Err(PeerError::Timeout(timeout))
            }
        }
    }

    /// Publish `payload` on `topic`. Returns how delivery went; a topic with
    /// no believed subscribers is `Counted(0)`, not an error.
    pub async fn publish(&self, topic: &str, payload: Payload) -> Result<Delivery, PeerError> {
        let env = Envelope::event(&self.self_id, topic, payload);
        let frame = env.encode().map_err(PeerError::construction)?;

        if self.fanout_publish {
            self.transport.send(&Destination::Broadcast, &frame).await?;
            return Ok(Delivery::Broadcast);
        }

        let subscribers: Vec<String> = self
            .remote_subs
            .lock()
            .unwrap()
            .get(topic)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for peer_id in &subscribers {
            match self
                .transport
                .send(&Destination::peer(peer_id), &frame)
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => debug!("publish {topic} to {peer_id} dropped: {e}"),
            }
        }
        Ok(Delivery::Counted(delivered))
    }

    /// Announce topic-interest changes to the network. Affects what remote
    /// publishers believe; local `listen` registrations are untouched.
    pub async fn subscribe_topics(&self, add: &[String], remove: &[String]) {
        {
            let mut local = self.local_subs.lock().unwrap();
            for topic in add {
                local.insert(topic.clone());
            }
            for topic in remove {
                local.remove(topic);
            }
        }
        let env = Envelope::subscribe(
            &self.self_id,
            normalize(json!({"add": add, "remove": remove})),
        );
        self.broadcast_quietly(&env, "subscribe announcement").await;
    }

    /// Announce identity, served keys, and subscriptions to everyone.
    pub async fn announce_hello(&self) {
        let keys = self.keys.advertised();
        let topics: Vec<String> = {
            let local = self.local_subs.lock().unwrap();
            let mut topics: Vec<String> = local.iter().cloned().collect();
            topics.sort();
            topics
        };
        let env = Envelope::hello(&self.self_id, normalize(json!({"keys": keys, "topics": topics})));
        self.broadcast_quietly(&env, "hello").await;
    }

    /// Manually seed key knowledge ahead of discovery.
    pub fn learn_peer_keys(&self, peer_id: &str, keys: &[String]) {
        self.keys.learn(peer_id, keys);
    }

    async fn broadcast_quietly(&self, env: &Envelope, what: &str) {
        match env.encode() {
            Ok(frame) => {
                if let Err(e) = self.transport.send(&Destination::Broadcast, &frame).await {
                    debug!("{what} dropped: {e}");
                }
            }
            Err(e) => debug!("{what} not encodable: {e}"),
        }
    }

    fn handle_frame(self: Arc<Self>, source: &str, frame: &[u8]) {
        let env = match Envelope::decode(frame) {
            Ok(env) => env,
            Err(e) => {
                debug!("undecodable frame from {source}: {e}");
                return;
            }
        };
        self.peers.touch(&env.source);

        match env.kind {
            Kind::Request => self.handle_request(env),
            Kind::Response => {
                let corr = env.corr.clone().unwrap_or_default();
                if let Some(tx) = self.pending.lock().unwrap().remove(&corr) {
                    tx.send(env).ok();
                } else {
                    debug!("uncorrelated response {corr} from {source}");
                }
            }
            Kind::Event => self.handle_event(env),
            Kind::Hello => self.handle_hello(env),
            Kind::Subscribe => self.handle_subscribe(env),
        }
    }

    fn handle_request(self: Arc<Self>, env: Envelope) {
        let handler = self.responders.lock().unwrap().get(&env.key).cloned();
        let Some(handler) = handler else {
            debug!("no responder for key {}, dropping request from {}", env.key, env.source);
            return;
        };
        let ctx = RequestContext {
            source: env.source.clone(),
            key: env.key.clone(),
            msg_id: env.id.clone(),
        };
        let result = handler(&env.payload, &ctx);
        let resp = Envelope::response(&self.self_id, &env.key, &env.id, normalize(result));
        let dest = Destination::peer(env.source);
        let session = self.clone();
        tokio::spawn(async move {
            match resp.encode() {
                Ok(frame) => {
                    if let Err(e) = session.transport.send(&dest, &frame).await {
                        debug!("response to {dest} dropped: {e}");
                    }
                }
                Err(e) => debug!("response not encodable: {e}"),
            }
        });
    }

    fn handle_event(&self, env: Envelope) {
        let msg = TopicMessage {
            source: env.source,
            topic: env.key,
            payload: env.payload,
        };
        // Snapshot matching handlers so a handler can register new bindings
        // without re-entering the lock.
        let matching: Vec<TopicHandler> = self
            .bindings
            .lock()
            .unwrap()
            .iter()
            .filter(|b| b.topic == msg.topic)
            .map(|b| b.handler.clone())
            .collect();
        for handler in matching {
            handler(&msg);
        }
    }

    fn handle_hello(&self, env: Envelope) {
        if let Some(keys) = string_list(env.payload.get("keys")) {
            self.keys.learn(&env.source, &keys);
        }
        if let Some(topics) = string_list(env.payload.get("topics")) {
            let mut subs = self.remote_subs.lock().unwrap();
            for topic in topics {
                subs.entry(topic).or_default().insert(env.source.clone());
            }
        }
    }

    fn handle_subscribe(&self, env: Envelope) {
        let mut subs = self.remote_subs.lock().unwrap();
        if let Some(add) = string_list(env.payload.get("add")) {
            for topic in add {
                subs.entry(topic).or_default().insert(env.source.clone());
            }
        }
        if let Some(remove) = string_list(env.payload.get("remove")) {
            for topic in remove {
                if let Some(peers) = subs.get_mut(&topic) {
                    peers.remove(&env.source);
                }
            }
        }
    }
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    value.and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    })
}
