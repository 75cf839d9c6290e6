// Network Module
//
// INTENTION: Define the interface the device uses to reach its group, and
// provide the two implementations that ship with the crate: UDP multicast on
// the local segment and an in-process hub for tests and co-located devices.
//
// A transport is created on the device's scheduler thread, through a
// `TransportFactory`, because socket registration needs that thread's
// runtime.

use anyhow::Result;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::packet::Packet;

pub mod memory;
pub mod multicast;

pub use memory::{MemoryFactory, MemoryHub, MemoryTap, MemoryTransport};
pub use multicast::{key_to_multicast, MulticastOptions, MulticastTransport};

/// Bidirectional, encoding-aware channel to every device of a group
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Encode and send one packet to the group
    async fn send(&self, packet: &Packet) -> Result<()>;

    /// Wait for the next well-formed packet from the group.
    ///
    /// Datagrams that fail to decode are logged and skipped; an error means
    /// the transport itself failed.
    async fn receive(&self) -> Result<(Packet, SocketAddr)>;
}

/// Builds a bound transport on the scheduler thread
pub trait TransportFactory: Send + Sync + 'static {
    fn bind(&self) -> Result<Arc<dyn NetworkTransport>>;
}
