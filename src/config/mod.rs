// Configuration Module
//
// This module provides configuration options for devices and logging.

pub mod device_config;
pub mod logging_config;

// Re-export configuration types
pub use device_config::*;
pub use logging_config::*;
