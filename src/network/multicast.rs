// Multicast transport
//
// INTENTION: Carry packets between all devices of a group over IPv4 UDP
// multicast. The group name is hashed into an administratively scoped
// multicast address (239.0.0.0/8) and port, so devices that agree on a name
// find each other without any other configuration.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use super::{NetworkTransport, TransportFactory};
use crate::config::DeviceConfig;
use crate::packet::{Encoding, Packet};
use crate::util::logging::{Component, Logger};

/// Largest UDP payload over IPv4
const MAX_DATAGRAM_SIZE: usize = 65_507;

const PORT_BASE: u16 = 10_000;
const PORT_SPAN: u16 = 50_000;

/// Map a group name to a multicast address and port.
///
/// The mapping is a pure function of the name: the first three bytes of its
/// SHA-256 digest pick `239.a.b.c`, the next two pick a port in
/// `[10000, 60000)`.
pub fn key_to_multicast(group: &str) -> SocketAddrV4 {
    let digest = Sha256::digest(group.as_bytes());
    let ip = Ipv4Addr::new(239, digest[0], digest[1], digest[2]);
    let port = PORT_BASE + u16::from_be_bytes([digest[3], digest[4]]) % PORT_SPAN;
    SocketAddrV4::new(ip, port)
}

/// Socket options for a multicast transport
#[derive(Debug, Clone)]
pub struct MulticastOptions {
    pub group_addr: SocketAddrV4,
    pub encoding: Encoding,
    /// Hops a datagram may travel; 1 keeps traffic on the local segment
    pub ttl: u32,
    /// Interface used to join the group; unspecified lets the OS pick
    pub interface: Ipv4Addr,
    /// Deliver our own datagrams back to us
    pub loopback: bool,
    /// Name used in log lines
    pub device_name: String,
}

impl MulticastOptions {
    pub fn for_group(group: &str) -> Self {
        Self {
            group_addr: key_to_multicast(group),
            encoding: Encoding::Json,
            ttl: 1,
            interface: Ipv4Addr::UNSPECIFIED,
            loopback: true,
            device_name: group.to_string(),
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        let mut group_addr = key_to_multicast(&config.group);
        if let Some(port) = config.port {
            group_addr.set_port(port);
        }
        Self {
            group_addr,
            encoding: config.encoding,
            ttl: config.ttl,
            interface: config.interface.unwrap_or(Ipv4Addr::UNSPECIFIED),
            loopback: true,
            device_name: config.name.clone(),
        }
    }
}

impl TransportFactory for MulticastOptions {
    fn bind(&self) -> Result<Arc<dyn NetworkTransport>> {
        Ok(Arc::new(MulticastTransport::bind(self)?))
    }
}

/// UDP multicast transport joined to one group address
pub struct MulticastTransport {
    socket: UdpSocket,
    // reused by the single receive loop
    receive_buf: Mutex<Vec<u8>>,
    target: SocketAddr,
    encoding: Encoding,
    logger: Logger,
}

impl MulticastTransport {
    /// Create the socket and join the group. Must be called inside a tokio runtime.
    pub fn bind(options: &MulticastOptions) -> Result<Self> {
        let socket = create_multicast_socket(options)?;
        let logger = Logger::new(Component::Network, &options.device_name);
        logger.info(format!(
            "Joined multicast group {} (ttl {}, encoding {})",
            options.group_addr, options.ttl, options.encoding
        ));

        Ok(Self {
            socket,
            receive_buf: Mutex::new(vec![0u8; MAX_DATAGRAM_SIZE]),
            target: SocketAddr::V4(options.group_addr),
            encoding: options.encoding,
            logger,
        })
    }

    pub fn group_addr(&self) -> SocketAddr {
        self.target
    }
}

fn create_multicast_socket(options: &MulticastOptions) -> Result<UdpSocket> {
    let group_ip = *options.group_addr.ip();
    if !group_ip.is_multicast() {
        return Err(anyhow!("Not a valid multicast IPv4 address: {}", group_ip));
    }

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    // not available everywhere; address reuse is enough on those platforms
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    let _ = socket.set_reuse_port(true);
    socket.set_multicast_ttl_v4(options.ttl)?;
    socket.set_multicast_loop_v4(options.loopback)?;

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), options.group_addr.port());
    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("Failed to bind multicast socket on {}", bind_addr))?;
    socket
        .join_multicast_v4(&group_ip, &options.interface)
        .with_context(|| format!("Failed to join multicast group {}", group_ip))?;
    if !options.interface.is_unspecified() {
        socket.set_multicast_if_v4(&options.interface)?;
    }

    let std_socket: std::net::UdpSocket = socket.into();
    std_socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(std_socket)?)
}

#[async_trait]
impl NetworkTransport for MulticastTransport {
    async fn send(&self, packet: &Packet) -> Result<()> {
        let bytes = self.encoding.encode(packet)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(anyhow!(
                "Packet for {} is {} bytes, larger than one datagram",
                packet.event(),
                bytes.len()
            ));
        }
        self.socket.send_to(&bytes, self.target).await?;
        self.logger.trace(format!("Sent {} ({} bytes)", packet.event(), bytes.len()));
        Ok(())
    }

    async fn receive(&self) -> Result<(Packet, SocketAddr)> {
        let mut buf = self.receive_buf.lock().await;
        loop {
            let (len, sender) = self.socket.recv_from(&mut buf[..]).await?;
            match self.encoding.decode(&buf[..len]) {
                Ok(packet) => return Ok((packet, sender)),
                Err(e) => self.logger.warn(format!("Dropping datagram from {}: {}", sender, e)),
            }
        }
    }
}
