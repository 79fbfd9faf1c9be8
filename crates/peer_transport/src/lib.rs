//! Pluggable delivery backends connecting peers.
//!
//! Every backend implements the same [`Transport`] contract and the same
//! addressing strings (`peer:<id>` / `broadcast:*`), so the protocol layer
//! above never knows which one it is riding on.

pub mod amqp_transport;
pub mod framing;
pub mod memory;
pub mod tcp_transport;
pub mod transport;

pub use amqp_transport::AmqpTransport;
pub use memory::{MemoryHub, MemoryTransport};
pub use tcp_transport::TcpTransport;
pub use transport::{ReceiveCallback, Transport};
