//! Typed error kinds, so callers can tell "message lost" from "system broken".

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Fire-and-forget send could not be delivered: unknown peer id, channel
    /// not ready, or connect failure. Never fatal.
    #[error("frame dropped: destination unreachable or channel not ready")]
    Dropped,

    /// No response arrived within the request TTL.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The broker connection is down; delivery pauses until reconnect.
    #[error("broker connection lost, reconnecting")]
    Reconnecting,

    /// The transport could not be built: bind failure, malformed endpoint,
    /// unreachable broker. Surfaced at construction, never silent.
    #[error("transport construction failed")]
    Construction(#[source] anyhow::Error),
}

impl PeerError {
    pub fn construction(err: impl Into<anyhow::Error>) -> Self {
        Self::Construction(err.into())
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
