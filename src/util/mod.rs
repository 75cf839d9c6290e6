// Utility Module
//
// Shared helpers: component loggers and textual durations.

pub mod duration;
pub mod logging;

pub use duration::Seconds;
pub use logging::{Component, Logger};
