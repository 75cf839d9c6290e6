// Routing Module
//
// INTENTION: Decide which handlers an inbound event reaches. Patterns are
// shell-style globs matched against the full event name; the registry keeps
// handlers grouped by pattern.

pub mod pattern;
pub mod registry;

pub use pattern::Pattern;
pub use registry::EventRegistry;
