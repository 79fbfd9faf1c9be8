//! `peerlink` command line: one-shot requests against a peer and a topic
//! tail for watching publishes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use peer_app::config;
use peer_core::{Peer, PeerOptions};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerlink", version, about = "Peer messaging over direct TCP or an AMQP broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct PeerArgs {
    /// Identity this process presents to other peers.
    #[arg(long, env = "PEERLINK_SELF_ID", default_value = "cli")]
    self_id: String,

    /// Local listen endpoint. Replies route through the remote peer's
    /// address book, so the remote must know this endpoint.
    #[arg(long, env = "PEERLINK_BIND", default_value = "127.0.0.1:56002")]
    bind: String,

    /// JSON or YAML file holding an address book (either a flat
    /// `peer: endpoint` map or a config with an `address_book` key).
    #[arg(long)]
    book: Option<PathBuf>,

    /// Extra address-book entry, `peer=host:port`. Repeatable.
    #[arg(long = "addr", value_name = "PEER=ENDPOINT")]
    addrs: Vec<String>,

    /// Route everything through the AMQP broker at this URL instead of
    /// direct TCP.
    #[arg(long, env = "PEERLINK_AMQP_URL")]
    amqp: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Send one request and print the response payload.
    Req {
        #[command(flatten)]
        peer_args: PeerArgs,

        /// Target peer id.
        #[arg(long)]
        peer: String,

        /// Service key to invoke.
        #[arg(long)]
        key: String,

        /// JSON request payload.
        #[arg(long, default_value = "{}")]
        data: String,

        /// How long to wait for the response, in milliseconds.
        #[arg(long, default_value_t = peer_core::DEFAULT_TTL_MS)]
        ttl_ms: u64,

        /// Same wait, in seconds; overrides --ttl-ms.
        #[arg(long, conflicts_with = "ttl_ms")]
        timeout: Option<f64>,
    },

    /// Ask a peer which RPC keys it serves and print them.
    Keys {
        #[command(flatten)]
        peer_args: PeerArgs,

        /// Target peer id.
        #[arg(long)]
        peer: String,

        /// How long to wait, in seconds.
        #[arg(long, default_value_t = 5.0)]
        timeout: f64,

        /// Print a JSON array instead of one key per line.
        #[arg(long)]
        json: bool,
    },

    /// Subscribe to topics and print each publish until interrupted.
    Sub {
        #[command(flatten)]
        peer_args: PeerArgs,

        #[arg(required = true)]
        topics: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Req {
            peer_args,
            peer,
            key,
            data,
            ttl_ms,
            timeout,
        } => {
            let payload: Value =
                serde_json::from_str(&data).context("--data must be valid JSON")?;
            let ttl_ms = match timeout {
                Some(secs) => (secs * 1000.0) as u64,
                None => ttl_ms,
            };
            let p = build_peer(&peer_args, PeerOptions::default()).await?;
            let result = p.request(&peer, &key, payload, ttl_ms).await;
            p.stop().await;
            let reply = result.with_context(|| format!("request {key} to {peer}"))?;
            println!("{}", serde_json::to_string_pretty(&Value::Object(reply))?);
            Ok(())
        }
        Command::Keys {
            peer_args,
            peer,
            timeout,
            json,
        } => {
            let p = build_peer(&peer_args, PeerOptions::default()).await?;
            let result = p
                .request(&peer, "keys", serde_json::json!({}), (timeout * 1000.0) as u64)
                .await;
            p.stop().await;
            let reply = result.with_context(|| format!("keys request to {peer}"))?;
            let keys: Vec<&str> = reply
                .get("keys")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if json {
                println!("{}", serde_json::to_string_pretty(&keys)?);
            } else {
                for key in keys {
                    println!("{key}");
                }
            }
            Ok(())
        }
        Command::Sub { peer_args, topics } => {
            let opts = PeerOptions {
                discovery: true,
                ..PeerOptions::default()
            };
            let p = build_peer(&peer_args, opts).await?;
            for topic in &topics {
                p.listen(
                    topic,
                    Arc::new(|msg| {
                        let line = serde_json::json!({
                            "source": msg.source,
                            "topic": msg.topic,
                            "payload": msg.payload,
                        });
                        println!("{line}");
                    }),
                );
            }
            let names: Vec<&str> = topics.iter().map(String::as_str).collect();
            p.subscribe(&names).await;
            tokio::signal::ctrl_c()
                .await
                .context("wait for interrupt")?;
            p.stop().await;
            Ok(())
        }
    }
}

async fn build_peer(args: &PeerArgs, opts: PeerOptions) -> Result<Peer> {
    if let Some(url) = &args.amqp {
        return Peer::amqp(&args.self_id, url, opts)
            .await
            .context("connect to broker");
    }

    let mut book = HashMap::new();
    if let Some(path) = &args.book {
        book.extend(load_book(path)?);
    }
    for entry in &args.addrs {
        let Some((peer, endpoint)) = entry.split_once('=') else {
            bail!("bad --addr {entry:?}, expected peer=host:port");
        };
        book.insert(peer.to_string(), endpoint.to_string());
    }
    Peer::tcp(&args.self_id, &args.bind, book, opts)
        .await
        .context("start tcp peer")
}

fn load_book(path: &Path) -> Result<HashMap<String, String>> {
    let mut map = config::load_config(path)?;
    let entries = match map.remove("address_book") {
        Some(Value::Object(inner)) => inner,
        Some(other) => bail!("address_book must be an object, got {other}"),
        None => map,
    };
    let mut book = HashMap::new();
    for (peer, endpoint) in entries {
        match endpoint {
            Value::String(s) => {
                book.insert(peer, s);
            }
            other => bail!("endpoint for {peer} must be a string, got {other}"),
        }
    }
    Ok(book)
}
