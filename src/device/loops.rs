// Device I/O loops
//
// The long-running loops of a started device: the send loop draining the
// outbound queue, the network receive loop, and one read loop per serial
// line. Each loop applies the configured FailurePolicy to transport errors.
// Received packets are not dispatched here; they are forwarded to the engine,
// which owns the registries.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;

use crate::config::FailurePolicy;
use crate::network::NetworkTransport;
use crate::packet::Packet;
use crate::serial::SerialEndpoint;
use crate::util::logging::Logger;

/// A packet handed from a receive path to the engine
#[derive(Debug)]
pub(crate) enum Inbound {
    Network {
        packet: Packet,
        sender: SocketAddr,
    },
    Serial {
        path: String,
        generation: u64,
        packet: Packet,
    },
}

/// Resolves once a halt has been requested, or once nobody can request one
pub(crate) async fn halt_requested(halt: &mut watch::Receiver<bool>) {
    while !*halt.borrow_and_update() {
        if halt.changed().await.is_err() {
            return;
        }
    }
}

/// The outbound queue, plus a packet whose send was cut short by a halt
pub(crate) struct Outbox {
    queue: UnboundedReceiver<Packet>,
    held: Option<Packet>,
}

impl Outbox {
    pub fn new(queue: UnboundedReceiver<Packet>) -> Self {
        Self { queue, held: None }
    }

    /// Next packet to send; a held packet goes first
    pub async fn next(&mut self) -> Option<Packet> {
        match self.held.take() {
            Some(packet) => Some(packet),
            None => self.queue.recv().await,
        }
    }
}

/// Drain the outbox in FIFO order, one send at a time.
///
/// A halt interrupts an in-flight send; that packet is held in the outbox
/// and goes out first on the next run.
pub(crate) async fn send_loop(
    transport: Arc<dyn NetworkTransport>,
    outbox: &mut Outbox,
    mut halt: watch::Receiver<bool>,
    policy: FailurePolicy,
    logger: Logger,
) {
    loop {
        let packet = tokio::select! {
            biased;
            _ = halt_requested(&mut halt) => return,
            next = outbox.next() => match next {
                Some(packet) => packet,
                None => return,
            },
        };

        let sent = tokio::select! {
            biased;
            _ = halt_requested(&mut halt) => None,
            sent = transport.send(&packet) => Some(sent),
        };

        match sent {
            None => {
                logger.debug(format!("Send of {} interrupted by halt, holding it", packet.event()));
                outbox.held = Some(packet);
                return;
            }
            Some(Ok(())) => logger.trace(format!("Sent {}", packet.event())),
            Some(Err(e)) => {
                logger.error(format!("Failed to send {}: {:#}", packet.event(), e));
                match policy {
                    FailurePolicy::Stop => {
                        logger.warn("Send loop stopped, publications stay queued until restart");
                        return;
                    }
                    FailurePolicy::Retry { backoff } => {
                        tokio::select! {
                            biased;
                            _ = halt_requested(&mut halt) => return,
                            _ = tokio::time::sleep(backoff.as_duration()) => {}
                        }
                    }
                }
            }
        }
    }
}

/// Forward every packet heard on the group to the engine
pub(crate) async fn receive_loop(
    transport: Arc<dyn NetworkTransport>,
    inbound: UnboundedSender<Inbound>,
    policy: FailurePolicy,
    logger: Logger,
) {
    loop {
        match transport.receive().await {
            Ok((packet, sender)) => {
                logger.trace(format!("Received {} from {}", packet.event(), sender));
                if inbound.send(Inbound::Network { packet, sender }).is_err() {
                    return;
                }
            }
            Err(e) => {
                logger.error(format!("Receive failed: {:#}", e));
                match policy {
                    FailurePolicy::Stop => {
                        logger.warn("Receive loop stopped");
                        return;
                    }
                    FailurePolicy::Retry { backoff } => {
                        tokio::time::sleep(backoff.as_duration()).await;
                    }
                }
            }
        }
    }
}

/// Hold one serial line open and forward its packets to the engine.
///
/// The session lives inside this future, so aborting the task closes the line.
pub(crate) async fn serial_read_loop(
    endpoint: SerialEndpoint,
    generation: u64,
    inbound: UnboundedSender<Inbound>,
    policy: FailurePolicy,
    logger: Logger,
) {
    loop {
        match read_session(&endpoint, generation, &inbound, &logger).await {
            Ok(()) => {
                logger.info(format!("Serial line {} reached end of stream", endpoint.path()));
                return;
            }
            Err(e) => {
                logger.error(format!("Serial line {} failed: {:#}", endpoint.path(), e));
                match policy {
                    FailurePolicy::Stop => return,
                    FailurePolicy::Retry { backoff } => {
                        tokio::time::sleep(backoff.as_duration()).await;
                    }
                }
            }
        }
    }
}

async fn read_session(
    endpoint: &SerialEndpoint,
    generation: u64,
    inbound: &UnboundedSender<Inbound>,
    logger: &Logger,
) -> anyhow::Result<()> {
    let mut session = endpoint.acquire(logger).await?;
    while let Some(packet) = session.read_packet().await? {
        logger.trace(format!("Read {} from {}", packet.event(), endpoint.path()));
        let forwarded = Inbound::Serial {
            path: endpoint.path().to_string(),
            generation,
            packet,
        };
        if inbound.send(forwarded).is_err() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::duration::Seconds;
    use crate::util::logging::Component;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records sends; the first `failures` sends fail
    struct FlakyTransport {
        sent: Mutex<Vec<String>>,
        attempts: AtomicUsize,
        failures: usize,
    }

    impl FlakyTransport {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                failures,
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NetworkTransport for FlakyTransport {
        async fn send(&self, packet: &Packet) -> Result<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(anyhow!("network unreachable"));
            }
            self.sent.lock().unwrap().push(packet.event().to_string());
            Ok(())
        }

        async fn receive(&self) -> Result<(Packet, SocketAddr)> {
            Err(anyhow!("socket closed"))
        }
    }

    fn logger() -> Logger {
        Logger::new(Component::Sender, "test")
    }

    fn queue(events: &[&str]) -> (mpsc::UnboundedSender<Packet>, Outbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(Packet::new(*event, json!(null))).unwrap();
        }
        (tx, Outbox::new(rx))
    }

    async fn next_event(outbox: &mut Outbox) -> Option<String> {
        outbox.next().await.map(|p| p.event().to_string())
    }

    #[tokio::test]
    async fn test_send_loop_preserves_publish_order() {
        let transport = FlakyTransport::new(0);
        let events: Vec<String> = (0..50).map(|i| format!("nav/seq{}", i)).collect();
        let refs: Vec<&str> = events.iter().map(String::as_str).collect();
        let (tx, mut rx) = queue(&refs);
        drop(tx);
        let (_halt_tx, halt_rx) = watch::channel(false);

        send_loop(transport.clone(), &mut rx, halt_rx, FailurePolicy::Stop, logger()).await;

        assert_eq!(transport.sent(), events);
    }

    #[tokio::test]
    async fn test_send_loop_stop_policy_keeps_remaining_queue() {
        let transport = FlakyTransport::new(1);
        let (_tx, mut rx) = queue(&["nav/a", "nav/b", "nav/c"]);
        let (_halt_tx, halt_rx) = watch::channel(false);

        send_loop(transport.clone(), &mut rx, halt_rx, FailurePolicy::Stop, logger()).await;

        assert!(transport.sent().is_empty());
        assert_eq!(next_event(&mut rx).await, Some("nav/b".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_loop_retry_policy_continues() {
        let transport = FlakyTransport::new(2);
        let (tx, mut rx) = queue(&["nav/a", "nav/b", "nav/c", "nav/d"]);
        drop(tx);
        let (_halt_tx, halt_rx) = watch::channel(false);
        let policy = FailurePolicy::Retry {
            backoff: Seconds::from(0.25),
        };

        send_loop(transport.clone(), &mut rx, halt_rx, policy, logger()).await;

        assert_eq!(transport.sent(), vec!["nav/c", "nav/d"]);
    }

    #[tokio::test]
    async fn test_send_loop_returns_on_halt() {
        let transport = FlakyTransport::new(0);
        let (tx, mut rx) = queue(&[]);
        let (halt_tx, halt_rx) = watch::channel(false);

        let halted = tokio::spawn(async move {
            send_loop(transport, &mut rx, halt_rx, FailurePolicy::Stop, logger()).await;
            rx
        });
        halt_tx.send_replace(true);
        let mut rx = tokio::time::timeout(Duration::from_secs(1), halted)
            .await
            .expect("send loop ignored halt")
            .unwrap();

        tx.send(Packet::new("nav/late", json!(1))).unwrap();
        assert_eq!(next_event(&mut rx).await, Some("nav/late".into()));
    }

    /// A link that accepts a send and never completes it
    struct StalledTransport;

    #[async_trait]
    impl NetworkTransport for StalledTransport {
        async fn send(&self, _packet: &Packet) -> Result<()> {
            std::future::pending().await
        }

        async fn receive(&self) -> Result<(Packet, SocketAddr)> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_halt_interrupts_stalled_send_and_holds_packet() {
        let (_tx, mut outbox) = queue(&["nav/a", "nav/b"]);
        let (halt_tx, halt_rx) = watch::channel(false);

        let halted = tokio::spawn(async move {
            send_loop(Arc::new(StalledTransport), &mut outbox, halt_rx, FailurePolicy::Stop, logger()).await;
            outbox
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        halt_tx.send_replace(true);
        let mut outbox = tokio::time::timeout(Duration::from_secs(1), halted)
            .await
            .expect("stalled send blocked the halt")
            .unwrap();

        assert_eq!(next_event(&mut outbox).await, Some("nav/a".into()));
        assert_eq!(next_event(&mut outbox).await, Some("nav/b".into()));
    }

    #[tokio::test]
    async fn test_receive_loop_stop_policy_ends_loop() {
        let transport = FlakyTransport::new(0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        receive_loop(transport, tx, FailurePolicy::Stop, logger()).await;
        assert!(rx.recv().await.is_none());
    }
}
