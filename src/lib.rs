// Root module for the robocluster crate
//
// INTENTION: Define the device runtime: brokerless publish/subscribe over a
// multicast group, background tasks on a per-device scheduler, and serial
// peripherals with their own event registries.

//! # Robocluster
//!
//! Robocluster lets the subsystems of a robot (navigation, cameras, arm
//! controllers) coordinate without a broker. Each subsystem runs a
//! [`Device`] that joins a named group; a device publishes events to the
//! group and reacts to events from it with handlers registered against
//! shell-style topic patterns.
//!
//! ## Topics and patterns
//!
//! A device named `nav` publishing topic `heading` emits the event
//! `nav/heading`. Handlers subscribe with glob patterns: `*` matches any run
//! of characters (including `/`), `?` one character, and `[a-z]` / `[!abc]`
//! a character class. Every matching handler runs, each in its own task.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use robocluster::{Device, DeviceError};
//!
//! fn main() -> Result<(), DeviceError> {
//!     let mut device = Device::new("nav", "rover");
//!
//!     device.on("cam/*", |event, data| async move {
//!         println!("{} -> {}", event, data);
//!         Ok(())
//!     })?;
//!
//!     let publisher = device.publisher();
//!     device.every(0.5, move || {
//!         let publisher = publisher.clone();
//!         async move { publisher.publish("heading", 42) }
//!     })?;
//!
//!     // blocks until Ctrl-C
//!     match device.run() {
//!         Err(DeviceError::Interrupted) => Ok(()),
//!         other => other,
//!     }
//! }
//! ```
//!
//! ## Core Components
//!
//! - **Device**: lifecycle, registration and publishing
//! - **EventRegistry / Pattern**: topic patterns and their handlers
//! - **NetworkTransport**: UDP multicast, or an in-process hub for tests
//! - **SerialTransport**: COBS-framed packets over a serial line

// Public modules
pub mod cli;
pub mod config;
pub mod device;
pub mod error;
pub mod handler;
pub mod network;
pub mod packet;
pub mod routing;
pub mod serial;
pub mod util;

// Re-export the main types
pub use config::{DeviceConfig, FailurePolicy, LogLevel, LoggingConfig};
pub use device::{Device, DeviceState, Publisher, ShutdownHandle};
pub use error::DeviceError;
pub use handler::{sleep, Handler};
pub use packet::{Encoding, Packet};
pub use routing::{EventRegistry, Pattern};

// Re-export transport types
pub use network::{
    key_to_multicast, MemoryHub, MemoryTransport, MulticastOptions, MulticastTransport,
    NetworkTransport, TransportFactory,
};
pub use serial::{LineOpener, SerialLine, SerialSession, SerialTransport, TtyOpener};

pub use util::duration::Seconds;
pub use util::logging::{configure_test_logging, init_logging};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
