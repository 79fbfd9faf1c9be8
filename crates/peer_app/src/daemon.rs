//! A small harness that turns a [`PeerConfig`] plus a set of service and
//! topic functions into a running peer that serves until shutdown.
//!
//! Service functions return `anyhow::Result<Value>`; an `Err` is folded
//! into an `{"ok": false, "error": "..."}` response so the caller always
//! gets a reply instead of a timeout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use peer_core::{Peer, PeerOptions, TopicHandler, TopicMessage};
use peer_proto::Payload;
use serde_json::{json, Value};
use tracing::info;

use crate::config::PeerConfig;

pub type ServiceFn = Arc<dyn Fn(&Payload) -> Result<Value> + Send + Sync>;

pub struct Daemon {
    config: PeerConfig,
    services: Vec<(String, ServiceFn)>,
    topics: Vec<(String, TopicHandler)>,
}

impl Daemon {
    pub fn new(config: PeerConfig) -> Self {
        Self {
            config,
            services: Vec::new(),
            topics: Vec::new(),
        }
    }

    /// Registers an RPC service under `key`.
    pub fn service(
        mut self,
        key: &str,
        f: impl Fn(&Payload) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.services.push((key.to_string(), Arc::new(f)));
        self
    }

    /// Registers a handler for publishes on `topic`.
    pub fn topic(mut self, topic: &str, f: impl Fn(&TopicMessage) + Send + Sync + 'static) -> Self {
        self.topics.push((topic.to_string(), Arc::new(f)));
        self
    }

    /// Builds and starts the peer described by the config, with all
    /// registered services and topic handlers in place.
    pub async fn build_peer(&self) -> Result<Peer> {
        let opts = PeerOptions {
            keys: self.services.iter().map(|(k, _)| k.clone()).collect(),
            discovery: self.config.discovery,
            discovery_interval: Duration::from_secs_f64(self.config.discovery_interval_s),
            ..PeerOptions::default()
        };

        let peer = match self.config.transport.as_str() {
            "tcp" => {
                Peer::tcp(
                    &self.config.peer_id,
                    &self.config.bind,
                    self.config.address_book.clone(),
                    opts,
                )
                .await
                .context("start tcp peer")?
            }
            "amqp" => Peer::amqp(&self.config.peer_id, &self.config.amqp_url, opts)
                .await
                .context("start amqp peer")?,
            other => bail!("unknown transport {other:?} (expected \"tcp\" or \"amqp\")"),
        };

        for (key, f) in &self.services {
            peer.serve_keys(&[key.as_str()], adapt(f.clone()));
        }
        if !self.topics.is_empty() {
            let names: Vec<&str> = self.topics.iter().map(|(t, _)| t.as_str()).collect();
            for (topic, handler) in &self.topics {
                peer.listen(topic, handler.clone());
            }
            peer.subscribe(&names).await;
        }
        peer.hello().await;
        Ok(peer)
    }

    /// Runs the peer until interrupted, then stops it cleanly.
    pub async fn serve(self) -> Result<()> {
        let peer = self.build_peer().await?;
        info!(
            peer_id = %peer.self_id(),
            transport = %self.config.transport,
            services = self.services.len(),
            topics = self.topics.len(),
            "peer daemon up"
        );
        tokio::signal::ctrl_c()
            .await
            .context("wait for shutdown signal")?;
        info!("shutting down");
        peer.stop().await;
        Ok(())
    }
}

fn adapt(f: ServiceFn) -> peer_core::RpcHandler {
    Arc::new(move |payload, _ctx| match f(payload) {
        Ok(v) => v,
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(peer_id: &str, bind: &str, book: HashMap<String, String>) -> PeerConfig {
        PeerConfig {
            peer_id: peer_id.to_string(),
            bind: bind.to_string(),
            address_book: book,
            transport: "tcp".to_string(),
            amqp_url: String::new(),
            discovery: false,
            discovery_interval_s: 5.0,
            rpc_ttl_ms: 2000,
        }
    }

    #[test]
    fn service_errors_become_error_payloads() {
        let f: ServiceFn = Arc::new(|_p| anyhow::bail!("boom"));
        let handler = adapt(f);
        let ctx = peer_core::RequestContext {
            source: "tester".to_string(),
            key: "always_fails".to_string(),
            msg_id: "m1".to_string(),
        };
        let out = handler(&Payload::new(), &ctx);
        assert_eq!(out, json!({ "ok": false, "error": "boom" }));
    }

    #[test]
    fn service_success_passes_through() {
        let f: ServiceFn = Arc::new(|p| Ok(json!({ "seen": p.len() })));
        let handler = adapt(f);
        let ctx = peer_core::RequestContext {
            source: "tester".to_string(),
            key: "echo".to_string(),
            msg_id: "m2".to_string(),
        };
        let mut payload = Payload::new();
        payload.insert("a".to_string(), json!(1));
        assert_eq!(handler(&payload, &ctx), json!({ "seen": 1 }));
    }

    #[tokio::test]
    async fn unknown_transport_is_rejected() {
        let mut cfg = config("x", "127.0.0.1:0", HashMap::new());
        cfg.transport = "carrier-pigeon".to_string();
        let err = Daemon::new(cfg).build_peer().await.unwrap_err();
        assert!(err.to_string().contains("unknown transport"));
    }

    #[tokio::test]
    async fn daemon_peer_answers_requests() {
        let server_bind = format!("127.0.0.1:{}", free_port());
        let client_bind = format!("127.0.0.1:{}", free_port());

        // Replies route through the responder's own address book, so the
        // books must be symmetric.
        let mut server_book = HashMap::new();
        server_book.insert("cli".to_string(), client_bind.clone());
        let server = Daemon::new(config("svc", &server_bind, server_book))
            .service("sum", |p| {
                let a = p.get("a").and_then(Value::as_i64).unwrap_or(0);
                let b = p.get("b").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!({ "sum": a + b }))
            })
            .build_peer()
            .await
            .unwrap();

        let mut book = HashMap::new();
        book.insert("svc".to_string(), server_bind);
        let client = Peer::tcp("cli", &client_bind, book, PeerOptions::default())
            .await
            .unwrap();

        let reply = client
            .request("svc", "sum", json!({ "a": 2, "b": 3 }), 2000)
            .await
            .unwrap();
        assert_eq!(reply.get("sum"), Some(&json!(5)));

        let served = client.request("svc", "keys", json!({}), 2000).await.unwrap();
        let served = served.get("keys").and_then(Value::as_array).unwrap().clone();
        assert!(served.contains(&json!("sum")));

        client.stop().await;
        server.stop().await;
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }
}
