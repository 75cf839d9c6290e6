// Packet and wire encoding
//
// INTENTION: Define the unit of transmission shared by the network and serial
// paths, `{"event": "<publisher>/<topic>", "data": <value>}`, and the codec
// used to put it on the wire.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// One published event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    event: String,
    #[serde(default)]
    data: Value,
}

impl Packet {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Build the packet a device named `publisher` sends for `topic`
    pub fn from_topic(publisher: &str, topic: &str, data: Value) -> Self {
        Self::new(format!("{}/{}", publisher, topic), data)
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// The publisher prefix, if the event follows the `<publisher>/<topic>` convention
    pub fn publisher(&self) -> Option<&str> {
        self.event.split_once('/').map(|(publisher, _)| publisher)
    }

    pub fn into_parts(self) -> (String, Value) {
        (self.event, self.data)
    }
}

/// Wire encoding of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Encoding {
    /// UTF-8 JSON object
    #[default]
    Json,
}

impl Encoding {
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        match self {
            Encoding::Json => Ok(serde_json::to_vec(packet)?),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Packet> {
        match self {
            Encoding::Json => serde_json::from_slice(bytes)
                .map_err(|e| anyhow!("Malformed JSON packet ({} bytes): {}", bytes.len(), e)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Json => "json",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            other => Err(anyhow!("Unsupported encoding: {}", other)),
        }
    }
}
