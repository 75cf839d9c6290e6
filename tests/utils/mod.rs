// Shared helpers for the integration tests
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use robocluster::serial::framing::encode_frame;
use robocluster::{
    configure_test_logging, Device, DeviceConfig, Encoding, LineOpener, MemoryHub, Packet,
    SerialLine, SerialTransport,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(300);

pub fn setup_test_logging() {
    configure_test_logging();
}

/// A device in `group` on an in-process hub
pub fn memory_device(hub: &MemoryHub, name: &str, group: &str) -> Device {
    memory_device_with(hub, DeviceConfig::new(name, group))
}

pub fn memory_device_with(hub: &MemoryHub, config: DeviceConfig) -> Device {
    let factory = hub.factory(&config.group, config.encoding);
    Device::with_transport(config, factory)
}

/// Events seen by a handler, as `(event, data)`
pub type Seen = (String, Value);

/// A synchronous handler that forwards everything it sees to a channel
pub fn recorder() -> (
    impl Fn(String, Value) -> Result<()> + Send + Sync + Clone + 'static,
    Receiver<Seen>,
) {
    let (tx, rx) = channel();
    let tx = Arc::new(Mutex::new(tx));
    let handler = move |event: String, data: Value| {
        let _ = tx.lock().unwrap().send((event, data));
        Ok(())
    };
    (handler, rx)
}

/// A sender usable from inside handlers and tasks
pub fn shared<T: Send + 'static>(tx: Sender<T>) -> Arc<Mutex<Sender<T>>> {
    Arc::new(Mutex::new(tx))
}

pub fn expect_event(rx: &Receiver<Seen>) -> Seen {
    rx.recv_timeout(WAIT).expect("expected an event")
}

pub fn expect_silence<T: std::fmt::Debug>(rx: &Receiver<T>) {
    match rx.recv_timeout(QUIET) {
        Err(RecvTimeoutError::Timeout) => {}
        other => panic!("expected no event, got {:?}", other),
    }
}

/// Serial opener backed by in-memory duplex streams
pub struct DuplexOpener {
    lines: Mutex<VecDeque<DuplexStream>>,
    opened: AtomicUsize,
}

impl DuplexOpener {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LineOpener for DuplexOpener {
    async fn open(&self, path: &str) -> Result<Box<dyn SerialLine>> {
        let line = self
            .lines
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("No line left for {}", path))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(line))
    }
}

/// A serial transport at `path` and the peer end of its line
pub fn duplex_serial(path: &str) -> (SerialTransport, DuplexStream, Arc<DuplexOpener>) {
    let (ours, theirs) = duplex(64 * 1024);
    let opener = Arc::new(DuplexOpener {
        lines: Mutex::new(VecDeque::from([ours])),
        opened: AtomicUsize::new(0),
    });
    let transport = SerialTransport::with_opener(path, Encoding::Json, opener.clone());
    (transport, theirs, opener)
}

/// A small runtime for driving the peer end of serial lines from plain tests
pub fn peer_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("peer runtime")
}

/// Write one framed packet from the peer side of a serial line
pub async fn write_serial(peer: &mut DuplexStream, event: &str, data: Value) -> Result<()> {
    let payload = Encoding::Json.encode(&Packet::new(event, data))?;
    peer.write_all(&encode_frame(&payload)).await?;
    peer.flush().await?;
    Ok(())
}
