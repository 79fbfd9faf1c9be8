//! Destination addressing: `peer:<id>` for unicast, `broadcast:*` for fanout.
//!
//! The string forms are the stable contract between any transport backend and
//! the protocol layer above it; `Display`/`FromStr` are the only place they
//! are spelled out.

use std::fmt;
use std::str::FromStr;

const PEER_PREFIX: &str = "peer:";
const BROADCAST: &str = "broadcast:*";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Peer(String),
    Broadcast,
}

impl Destination {
    pub fn peer(id: impl Into<String>) -> Self {
        Self::Peer(id.into())
    }

    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Self::Peer(id) => Some(id),
            Self::Broadcast => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peer(id) => write!(f, "{PEER_PREFIX}{id}"),
            Self::Broadcast => write!(f, "{BROADCAST}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid destination: {0:?}")]
pub struct InvalidDestination(pub String);

impl FromStr for Destination {
    type Err = InvalidDestination;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix(PEER_PREFIX) {
            if id.is_empty() {
                return Err(InvalidDestination(s.to_string()));
            }
            return Ok(Self::Peer(id.to_string()));
        }
        if s == BROADCAST || s.starts_with("broadcast:") {
            return Ok(Self::Broadcast);
        }
        Err(InvalidDestination(s.to_string()))
    }
}
