//! Broker transport over AMQP.
//!
//! No address book: routing is the broker's job. One direct exchange keyed
//! by destination peer id, one fanout exchange for broadcasts, and one
//! auto-delete queue per peer bound to both. Publishing and consuming run on
//! two separate connections; AMQP channels are not meant to be shared across
//! concurrently publishing callers and a consuming loop, so the split is
//! mandatory, not cosmetic.

use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use peer_proto::{Destination, PeerError};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::{CallbackCell, ReceiveCallback, Transport};

pub const EXCHANGE_DIRECT: &str = "peerlink.direct";
pub const EXCHANGE_FANOUT: &str = "peerlink.fanout";

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const STOP_JOIN: Duration = Duration::from_secs(2);

fn queue_name(peer_id: &str) -> String {
    format!("peerlink.peer.{peer_id}")
}

/// Declare exchanges, this peer's queue, and both bindings. Idempotent, so
/// it runs again on every reconnect.
async fn declare_topology(channel: &Channel, peer_id: &str) -> lapin::Result<()> {
    channel
        .exchange_declare(
            EXCHANGE_DIRECT,
            ExchangeKind::Direct,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .exchange_declare(
            EXCHANGE_FANOUT,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions::default(),
            FieldTable::default(),
        )
        .await?;

    let queue = queue_name(peer_id);
    channel
        .queue_declare(
            &queue,
            QueueDeclareOptions {
                durable: false,
                auto_delete: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &queue,
            EXCHANGE_DIRECT,
            peer_id,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &queue,
            EXCHANGE_FANOUT,
            "",
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

struct PublishSide {
    conn: Connection,
    channel: Channel,
}

pub struct AmqpTransport {
    self_id: String,
    url: String,
    publish: Mutex<PublishSide>,
    cb: CallbackCell,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    consume_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("self_id", &self.self_id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl AmqpTransport {
    /// Connect the publish side and declare the topology. An unreachable
    /// broker surfaces here; the consume side dials its own connection in
    /// `start()`.
    pub async fn connect(self_id: &str, url: &str) -> Result<Self, PeerError> {
        let conn = Connection::connect(url, ConnectionProperties::default())
            .await
            .with_context(|| format!("connect to broker {url}"))
            .map_err(PeerError::Construction)?;
        let channel = conn
            .create_channel()
            .await
            .context("open publish channel")
            .map_err(PeerError::Construction)?;
        declare_topology(&channel, self_id)
            .await
            .context("declare topology")
            .map_err(PeerError::Construction)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            self_id: self_id.to_string(),
            url: url.to_string(),
            publish: Mutex::new(PublishSide { conn, channel }),
            cb: CallbackCell::default(),
            shutdown_tx,
            shutdown_rx,
            consume_task: Mutex::new(None),
        })
    }
}

/// One consume session: connect, re-declare, drain deliveries until the
/// stream breaks or shutdown is signalled. `Ok(())` means clean shutdown.
async fn consume_once(
    url: &str,
    self_id: &str,
    cb: &CallbackCell,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let conn = Connection::connect(url, ConnectionProperties::default())
        .await
        .context("connect consume side")?;
    let channel = conn.create_channel().await.context("open consume channel")?;
    declare_topology(&channel, self_id)
        .await
        .context("declare topology")?;

    let queue = queue_name(self_id);
    let mut consumer = channel
        .basic_consume(
            &queue,
            &format!("{self_id}.consumer"),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("start consuming")?;
    debug!("consuming from {queue}");

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                conn.close(200, "shutdown").await.ok();
                return Ok(());
            }
            delivery = consumer.next() => {
                let delivery = match delivery {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => return Err(e).context("consume"),
                    None => anyhow::bail!("consumer stream ended"),
                };
                let source = delivery
                    .properties
                    .app_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                cb.emit(&format!("peer:{source}"), &delivery.data);
                // Ack no matter what the handler did: at-most-once, and no
                // poison-message redelivery loop.
                delivery.ack(BasicAckOptions::default()).await.context("ack")?;
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for AmqpTransport {
    async fn start(&self) -> Result<(), PeerError> {
        let mut task = self.consume_task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let url = self.url.clone();
        let self_id = self.self_id.clone();
        let cb = self.cb.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match consume_once(&url, &self_id, &cb, &mut shutdown_rx).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!("broker consume loop lost: {e:#}; retrying in {RECONNECT_BACKOFF:?}")
                    }
                }
                // Delivery pauses silently during the outage; fixed backoff
                // between attempts, interruptible by shutdown.
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(mut handle) = self.consume_task.lock().await.take() {
            if tokio::time::timeout(STOP_JOIN, &mut handle).await.is_err() {
                handle.abort();
            }
        }
        let publish = self.publish.lock().await;
        if let Err(e) = publish.channel.close(200, "shutdown").await {
            debug!("close publish channel: {e}");
        }
        if let Err(e) = publish.conn.close(200, "shutdown").await {
            debug!("close publish connection: {e}");
        }
    }

    async fn send(&self, dest: &Destination, frame: &[u8]) -> Result<(), PeerError> {
        let publish = self.publish.lock().await;
        if !publish.channel.status().connected() {
            debug!("publish channel not open, dropping frame");
            return Err(PeerError::Dropped);
        }
        // Sender identity rides in message metadata, not the routing key.
        let props = BasicProperties::default()
            .with_app_id(self.self_id.clone().into())
            .with_delivery_mode(1);
        let result = match dest {
            Destination::Peer(peer_id) => {
                publish
                    .channel
                    .basic_publish(
                        EXCHANGE_DIRECT,
                        peer_id,
                        BasicPublishOptions::default(),
                        frame,
                        props,
                    )
                    .await
            }
            Destination::Broadcast => {
                publish
                    .channel
                    .basic_publish(
                        EXCHANGE_FANOUT,
                        "",
                        BasicPublishOptions::default(),
                        frame,
                        props,
                    )
                    .await
            }
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("publish failed, dropping frame: {e}");
                Err(PeerError::Dropped)
            }
        }
    }

    fn on_receive(&self, cb: ReceiveCallback) {
        self.cb.set(cb);
    }
}
