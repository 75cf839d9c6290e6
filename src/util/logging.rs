// Logging utilities
//
// INTENTION: Give every part of a device a consistent `[device][Component]`
// prefix on top of the `log` facade, with one log target per component so
// `LoggingConfig` can filter them individually.

use log::{debug, error, info, trace, warn, Record};
use std::fmt;
use std::io::Write;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Device,
    Scheduler,
    Dispatch,
    Sender,
    Receiver,
    Serial,
    Network,
    Cli,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Device => "Device",
            Component::Scheduler => "Scheduler",
            Component::Dispatch => "Dispatch",
            Component::Sender => "Sender",
            Component::Receiver => "Receiver",
            Component::Serial => "Serial",
            Component::Network => "Network",
            Component::Cli => "Cli",
        }
    }

    /// Log target used for records emitted by this component
    pub fn target(&self) -> &'static str {
        match self {
            Component::Device => "robocluster::device",
            Component::Scheduler => "robocluster::scheduler",
            Component::Dispatch => "robocluster::dispatch",
            Component::Sender => "robocluster::network::send",
            Component::Receiver => "robocluster::network::receive",
            Component::Serial => "robocluster::serial",
            Component::Network => "robocluster::network",
            Component::Cli => "robocluster::cli",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component logger bound to one device name
#[derive(Clone)]
pub struct Logger {
    component: Component,
    device: Arc<str>,
}

impl Logger {
    pub fn new(component: Component, device: &str) -> Self {
        Self {
            component,
            device: Arc::from(device),
        }
    }

    /// Same device, different component
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            device: self.device.clone(),
        }
    }

    pub fn trace(&self, message: impl fmt::Display) {
        trace!(target: self.component.target(), "[{}][{}] {}", self.device, self.component, message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        debug!(target: self.component.target(), "[{}][{}] {}", self.device, self.component, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        info!(target: self.component.target(), "[{}][{}] {}", self.device, self.component, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        warn!(target: self.component.target(), "[{}][{}] {}", self.device, self.component, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        error!(target: self.component.target(), "[{}][{}] {}", self.device, self.component, message);
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("component", &self.component)
            .field("device", &self.device)
            .finish()
    }
}

pub(crate) fn format_record(
    buf: &mut env_logger::fmt::Formatter,
    record: &Record<'_>,
) -> std::io::Result<()> {
    let level_style = buf.default_level_style(record.level());
    writeln!(
        buf,
        "{} {level_style}{:<5}{level_style:#} [{}] {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

// ROBOCLUSTER_LOG wins over RUST_LOG; neither set means info
fn pick_filter(robocluster: Option<String>, rust: Option<String>) -> String {
    robocluster
        .or(rust)
        .unwrap_or_else(|| "info".to_string())
}

// Initialize logging from the environment, defaulting to info
pub fn init_logging() {
    let filter = pick_filter(
        std::env::var("ROBOCLUSTER_LOG").ok(),
        std::env::var("RUST_LOG").ok(),
    );

    let _ = env_logger::Builder::new()
        .parse_filters(&filter)
        .format(format_record)
        .try_init();
}

/// Filter for test logging, overridable with `ROBOCLUSTER_TEST_LOG`
pub fn get_test_filter() -> String {
    std::env::var("ROBOCLUSTER_TEST_LOG").unwrap_or_else(|_| "debug".to_string())
}

// Configure logging for tests; safe to call from every test
pub fn configure_test_logging() {
    let filter = get_test_filter();
    let env = env_logger::Env::default().filter_or("RUST_LOG", filter);

    let _ = env_logger::Builder::from_env(env)
        .format(format_record)
        .is_test(true)
        .try_init();
}
