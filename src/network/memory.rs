// Memory-based Transport
//
// INTENTION: Provide an in-process stand-in for a multicast group. Every
// transport bound to the same group name on one hub sees every datagram sent
// to that group, its own included, exactly like multicast with loopback.
// Packets still go through the encoding so the wire format is exercised.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};

use super::{NetworkTransport, TransportFactory};
use crate::packet::{Encoding, Packet};
use crate::util::logging::{Component, Logger};

const GROUP_CAPACITY: usize = 1024;

type Datagram = (Arc<[u8]>, SocketAddr);

/// A set of named in-memory groups
#[derive(Clone)]
pub struct MemoryHub {
    groups: Arc<Mutex<HashMap<String, broadcast::Sender<Datagram>>>>,
    next_port: Arc<AtomicU16>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
            next_port: Arc::new(AtomicU16::new(1)),
        }
    }

    fn group(&self, group: &str) -> broadcast::Sender<Datagram> {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        groups
            .entry(group.to_string())
            .or_insert_with(|| broadcast::channel(GROUP_CAPACITY).0)
            .clone()
    }

    /// A factory that binds devices to `group` on this hub
    pub fn factory(&self, group: &str, encoding: Encoding) -> MemoryFactory {
        MemoryFactory {
            hub: self.clone(),
            group: group.to_string(),
            encoding,
        }
    }

    /// Observe every packet sent to `group` from now on
    pub fn tap(&self, group: &str, encoding: Encoding) -> MemoryTap {
        MemoryTap {
            rx: self.group(group).subscribe(),
            encoding,
        }
    }

    /// Bind a transport directly, outside of any device
    pub fn bind(&self, group: &str, encoding: Encoding) -> MemoryTransport {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let sender = self.group(group);
        MemoryTransport {
            rx: tokio::sync::Mutex::new(sender.subscribe()),
            tx: sender,
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            encoding,
            logger: Logger::new(Component::Network, group),
        }
    }
}

/// Binds `MemoryTransport`s for one group
#[derive(Clone)]
pub struct MemoryFactory {
    hub: MemoryHub,
    group: String,
    encoding: Encoding,
}

impl TransportFactory for MemoryFactory {
    fn bind(&self) -> Result<Arc<dyn NetworkTransport>> {
        Ok(Arc::new(self.hub.bind(&self.group, self.encoding)))
    }
}

/// One member of an in-memory group
pub struct MemoryTransport {
    tx: broadcast::Sender<Datagram>,
    // only the receive loop reads, the lock is never contended
    rx: tokio::sync::Mutex<broadcast::Receiver<Datagram>>,
    local_addr: SocketAddr,
    encoding: Encoding,
    logger: Logger,
}

impl MemoryTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl NetworkTransport for MemoryTransport {
    async fn send(&self, packet: &Packet) -> Result<()> {
        let bytes = self.encoding.encode(packet)?;
        // with no receivers the datagram is simply lost, as on a real network
        let _ = self.tx.send((Arc::from(bytes), self.local_addr));
        Ok(())
    }

    async fn receive(&self) -> Result<(Packet, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok((bytes, sender)) => match self.encoding.decode(&bytes) {
                    Ok(packet) => return Ok((packet, sender)),
                    Err(e) => self.logger.warn(format!("Dropping datagram from {}: {}", sender, e)),
                },
                Err(RecvError::Lagged(missed)) => {
                    self.logger.warn(format!("Receiver lagged, {} datagrams lost", missed));
                }
                Err(RecvError::Closed) => return Err(anyhow!("Memory group closed")),
            }
        }
    }
}

/// Test-side view of a group's traffic
pub struct MemoryTap {
    rx: broadcast::Receiver<Datagram>,
    encoding: Encoding,
}

impl MemoryTap {
    /// Next packet sent to the group
    pub async fn next(&mut self) -> Result<Packet> {
        loop {
            match self.rx.recv().await {
                Ok((bytes, _)) => return self.encoding.decode(&bytes),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(anyhow!("Memory group closed")),
            }
        }
    }
}
