// Device Configuration
//
// INTENTION: Hold everything needed to bring a device up in one value that
// can be built in code or loaded from a JSON file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::packet::Encoding;
use crate::util::duration::Seconds;

/// What a send or receive loop does when its transport fails
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log the failure and end that loop. The rest of the device keeps running.
    #[default]
    Stop,
    /// Log the failure, wait `backoff`, and try again
    Retry { backoff: Seconds },
}

/// Configuration for a Device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, prefixed onto every published topic
    pub name: String,
    /// Group name; devices with the same group hear each other
    pub group: String,
    /// Wire encoding of network packets
    #[serde(default)]
    pub encoding: Encoding,
    /// Override for the port derived from the group name
    #[serde(default)]
    pub port: Option<u16>,
    /// Multicast TTL
    #[serde(default = "default_ttl")]
    pub ttl: u32,
    /// Interface to join the multicast group on
    #[serde(default)]
    pub interface: Option<Ipv4Addr>,
    /// Reaction to transport failures in the send and receive loops
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

fn default_ttl() -> u32 {
    1
}

impl DeviceConfig {
    /// Create a new DeviceConfig with the required parameters
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            encoding: Encoding::default(),
            port: None,
            ttl: default_ttl(),
            interface: None,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid device config in {}", path.display()))
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = Some(interface);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}
