//! Wire vocabulary shared by every peerlink crate: envelopes, payloads,
//! destination addressing, and error kinds.

pub mod dest;
pub mod envelope;
pub mod error;
pub mod payload;

pub use dest::Destination;
pub use envelope::{Envelope, Kind};
pub use error::PeerError;
pub use payload::{normalize, Payload};

/// Largest frame the upper layer should produce, in bytes.
/// Exceeding it is a caller error, not enforced by the transports.
pub const DEFAULT_MTU: usize = 512 * 1024;
