// Logging Configuration
//
// This module provides configuration options for logging in robocluster.

use crate::util::logging::{format_record, Component};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Logging configuration options
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// Default log level for all components
    pub default_level: LogLevel,
    /// Component-specific log levels
    pub component_levels: HashMap<Component, LogLevel>,
}

/// Log levels matching standard Rust log crate levels
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
    Off,
}

impl LogLevel {
    /// Convert to log::LevelFilter
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Off => log::LevelFilter::Off,
        }
    }

    /// Level for a `-v` count on the command line
    pub fn from_verbosity(verbosity: u8) -> Self {
        match verbosity {
            0 => LogLevel::Info,
            1 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingConfig {
    /// Create a new logging configuration with default settings
    pub fn new() -> Self {
        Self {
            default_level: LogLevel::Info,
            component_levels: HashMap::new(),
        }
    }

    /// Set the default log level
    pub fn with_default_level(mut self, level: LogLevel) -> Self {
        self.default_level = level;
        self
    }

    /// Set a log level for a specific component
    pub fn with_component_level(mut self, component: Component, level: LogLevel) -> Self {
        self.component_levels.insert(component, level);
        self
    }

    /// Apply this logging configuration
    ///
    /// `RUST_LOG` directives are parsed first so they can be overridden by the
    /// levels set here. If a global logger is already installed this returns
    /// silently, which keeps repeated calls from tests harmless.
    pub fn apply(&self) {
        let mut builder = env_logger::Builder::new();
        builder.parse_default_env();
        builder.filter_level(self.default_level.to_level_filter());

        for (component, level) in &self.component_levels {
            builder.filter(Some(component.target()), level.to_level_filter());
        }

        let _ = builder.format(format_record).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(7), LogLevel::Trace);
    }

    #[test]
    fn test_component_levels_override() {
        let config = LoggingConfig::new()
            .with_default_level(LogLevel::Warn)
            .with_component_level(Component::Serial, LogLevel::Trace);
        assert_eq!(config.default_level, LogLevel::Warn);
        assert_eq!(
            config.component_levels.get(&Component::Serial),
            Some(&LogLevel::Trace)
        );
        assert_eq!(config.component_levels.get(&Component::Device), None);
    }

    #[test]
    fn test_log_level_serde() {
        let level: LogLevel = serde_json::from_str("\"debug\"").unwrap();
        assert_eq!(level, LogLevel::Debug);
        assert_eq!(level.to_level_filter(), log::LevelFilter::Debug);
    }
}
