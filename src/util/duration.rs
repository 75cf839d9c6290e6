// Duration normalization
//
// INTENTION: Accept periods and sleep lengths as plain seconds, as a
// `std::time::Duration`, or as short text such as "250ms" or "2 seconds",
// and reduce them all to one `Seconds` value.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A non-negative number of seconds
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(try_from = "SecondsRepr", into = "f64")]
pub struct Seconds(f64);

impl Seconds {
    pub fn new(seconds: f64) -> Self {
        if seconds.is_finite() && seconds > 0.0 {
            Seconds(seconds)
        } else {
            Seconds(0.0)
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0
    }

    /// Saturates at `Duration::MAX`
    pub fn as_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.0).unwrap_or(Duration::MAX)
    }
}

impl From<f64> for Seconds {
    fn from(seconds: f64) -> Self {
        Seconds::new(seconds)
    }
}

impl From<u64> for Seconds {
    fn from(seconds: u64) -> Self {
        Seconds::new(seconds as f64)
    }
}

impl From<u32> for Seconds {
    fn from(seconds: u32) -> Self {
        Seconds::new(f64::from(seconds))
    }
}

// bare integer literals default to i32; negative values clamp to zero
impl From<i32> for Seconds {
    fn from(seconds: i32) -> Self {
        Seconds::new(f64::from(seconds))
    }
}

impl From<Duration> for Seconds {
    fn from(duration: Duration) -> Self {
        Seconds::new(duration.as_secs_f64())
    }
}

impl From<Seconds> for Duration {
    fn from(seconds: Seconds) -> Self {
        seconds.as_duration()
    }
}

impl From<Seconds> for f64 {
    fn from(seconds: Seconds) -> Self {
        seconds.0
    }
}

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

impl FromStr for Seconds {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        let text = text.trim();
        let split = text
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(text.len());
        let (number, unit) = text.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| anyhow!("Invalid duration: {:?}", text))?;

        let seconds = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "s" | "sec" | "secs" | "second" | "seconds" => value,
            "ms" | "msec" | "millisecond" | "milliseconds" => value / 1e3,
            "us" | "usec" | "microsecond" | "microseconds" => value / 1e6,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hour" | "hours" => value * 3600.0,
            other => return Err(anyhow!("Unknown duration unit {:?} in {:?}", other, text)),
        };

        Ok(Seconds::new(seconds))
    }
}

impl TryFrom<&str> for Seconds {
    type Error = anyhow::Error;

    fn try_from(text: &str) -> Result<Self> {
        text.parse()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SecondsRepr {
    Number(f64),
    Text(String),
}

impl TryFrom<SecondsRepr> for Seconds {
    type Error = anyhow::Error;

    fn try_from(repr: SecondsRepr) -> Result<Self> {
        match repr {
            SecondsRepr::Number(seconds) => Ok(Seconds::new(seconds)),
            SecondsRepr::Text(text) => text.parse(),
        }
    }
}
