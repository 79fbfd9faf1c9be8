//! Protocol session, key/liveness bookkeeping, discovery announcer, and the
//! `Peer` runtime facade that ties one transport into a live, addressable
//! peer.

pub mod discovery;
pub mod keys;
pub mod peer;
pub mod peers;
pub mod session;

pub use discovery::Discovery;
pub use keys::KeyRegistry;
pub use peer::{Peer, PeerOptions, DEFAULT_TTL_MS};
pub use peers::PeerTracker;
pub use session::{
    Delivery, RequestContext, RpcHandler, Session, TopicHandler, TopicMessage,
};
