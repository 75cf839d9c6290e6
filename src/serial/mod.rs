// Serial Module
//
// INTENTION: Attach point-to-point serial lines (microcontrollers, sensor
// boards) to a device. Every serial transport carries its own event registry,
// separate from the device's network-facing one. The line is only open while
// a `SerialSession` is alive, and dropping the session closes it, so a read
// loop that is cancelled still releases the port.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_serial::SerialPortBuilderExt;

use crate::handler::Handler;
use crate::packet::{Encoding, Packet};
use crate::routing::EventRegistry;
use crate::util::logging::{Component, Logger};

pub mod framing;

use framing::{decode_frame, encode_frame, FRAME_DELIMITER, MAX_FRAME_LEN};

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// A bidirectional byte stream to a serial peer
pub trait SerialLine: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SerialLine for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens the byte stream behind a serial path
#[async_trait]
pub trait LineOpener: Send + Sync + 'static {
    async fn open(&self, path: &str) -> Result<Box<dyn SerialLine>>;
}

/// Opens real tty devices
#[derive(Debug, Clone, Copy)]
pub struct TtyOpener {
    pub baud_rate: u32,
}

impl Default for TtyOpener {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

#[async_trait]
impl LineOpener for TtyOpener {
    async fn open(&self, path: &str) -> Result<Box<dyn SerialLine>> {
        let port = tokio_serial::new(path, self.baud_rate)
            .open_native_async()
            .map_err(|e| anyhow!("Failed to open serial port {}: {}", path, e))?;
        Ok(Box::new(port))
    }
}

/// What a read loop needs to open a serial path
#[derive(Clone)]
pub struct SerialEndpoint {
    path: String,
    encoding: Encoding,
    opener: Arc<dyn LineOpener>,
}

impl SerialEndpoint {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Open the line; it stays open for as long as the session lives
    pub async fn acquire(&self, logger: &Logger) -> Result<SerialSession> {
        let line = self.opener.open(&self.path).await?;
        logger.info(format!("Opened serial line {}", self.path));
        Ok(SerialSession {
            path: self.path.clone(),
            encoding: self.encoding,
            line: BufReader::new(line),
            frame: Vec::new(),
            logger: logger.clone(),
        })
    }
}

/// A serial transport: a path, its encoding, and its private event registry
pub struct SerialTransport {
    endpoint: SerialEndpoint,
    events: EventRegistry<Handler>,
}

impl SerialTransport {
    /// A transport for a tty at the default baud rate
    pub fn new(path: &str, encoding: Encoding) -> Self {
        Self::with_opener(path, encoding, Arc::new(TtyOpener::default()))
    }

    pub fn with_opener(path: &str, encoding: Encoding, opener: Arc<dyn LineOpener>) -> Self {
        Self {
            endpoint: SerialEndpoint {
                path: path.to_string(),
                encoding,
                opener,
            },
            events: EventRegistry::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.endpoint.path
    }

    pub fn encoding(&self) -> Encoding {
        self.endpoint.encoding
    }

    pub fn endpoint(&self) -> &SerialEndpoint {
        &self.endpoint
    }

    pub fn events(&self) -> &EventRegistry<Handler> {
        &self.events
    }

    /// Register an async handler on this line's registry
    pub fn on<F, Fut>(&mut self, pattern: &str, callback: F) -> &mut Self
    where
        F: Fn(String, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(pattern, Handler::from_async(callback))
    }

    /// Register a synchronous handler on this line's registry
    pub fn on_sync<F>(&mut self, pattern: &str, callback: F) -> &mut Self
    where
        F: Fn(String, Value) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(pattern, Handler::from_sync(callback))
    }

    pub fn subscribe(&mut self, pattern: &str, handler: Handler) -> &mut Self {
        self.events.subscribe(pattern, handler);
        self
    }

    /// Open the line now, outside of a device
    pub async fn acquire(&self) -> Result<SerialSession> {
        let logger = Logger::new(Component::Serial, &self.endpoint.path);
        self.endpoint.acquire(&logger).await
    }
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("path", &self.endpoint.path)
            .field("encoding", &self.endpoint.encoding)
            .field("patterns", &self.events.len())
            .finish()
    }
}

/// An open serial line. Dropping it closes the line.
pub struct SerialSession {
    path: String,
    encoding: Encoding,
    line: BufReader<Box<dyn SerialLine>>,
    frame: Vec<u8>,
    logger: Logger,
}

impl SerialSession {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next well-formed packet. `None` means the peer closed
    /// the line. Corrupt and oversized frames are logged and skipped.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if !self.next_frame().await? {
                return Ok(None);
            }
            if self.frame.len() == 1 {
                continue;
            }

            match decode_frame(&self.frame).and_then(|payload| self.encoding.decode(&payload)) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => self.logger.warn(format!("Skipping bad frame on {}: {}", self.path, e)),
            }
        }
    }

    /// Buffer the next delimited frame, at most `MAX_FRAME_LEN` bytes.
    /// Anything longer is dropped up to its delimiter. Returns false at end
    /// of stream.
    async fn next_frame(&mut self) -> Result<bool> {
        self.frame.clear();
        let mut dropped = 0usize;
        loop {
            let available = self.line.fill_buf().await?;
            if available.is_empty() {
                let pending = self.frame.len() + dropped;
                if pending > 0 {
                    self.logger.warn(format!(
                        "Discarding {} bytes of unterminated frame on {}",
                        pending, self.path
                    ));
                }
                return Ok(false);
            }

            let (chunk, complete) = match available.iter().position(|&b| b == FRAME_DELIMITER) {
                Some(end) => (&available[..=end], true),
                None => (available, false),
            };
            let taken = chunk.len();
            if dropped > 0 || self.frame.len() + taken > MAX_FRAME_LEN {
                dropped += self.frame.len() + taken;
                self.frame.clear();
            } else {
                self.frame.extend_from_slice(chunk);
            }
            self.line.consume(taken);

            if complete {
                if dropped == 0 {
                    return Ok(true);
                }
                self.logger.warn(format!(
                    "Discarding {} byte frame on {}, limit is {}",
                    dropped, self.path, MAX_FRAME_LEN
                ));
                dropped = 0;
            }
        }
    }

    /// Frame and write one packet
    pub async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        let payload = self.encoding.encode(packet)?;
        let line = self.line.get_mut();
        line.write_all(&encode_frame(&payload)).await?;
        line.flush().await?;
        Ok(())
    }

    /// Flush and shut the line down explicitly
    pub async fn close(mut self) -> Result<()> {
        self.line.get_mut().shutdown().await?;
        Ok(())
    }
}

impl Drop for SerialSession {
    fn drop(&mut self) {
        self.logger.info(format!("Closed serial line {}", self.path));
    }
}
