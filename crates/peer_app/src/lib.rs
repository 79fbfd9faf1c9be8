//! Configuration loading and a ready-made daemon harness on top of
//! [`peer_core`].

pub mod config;
pub mod daemon;

pub use config::{load, load_config, with_env_overrides, PeerConfig, ENV_PREFIX};
pub use daemon::Daemon;
