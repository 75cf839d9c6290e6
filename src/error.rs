use thiserror::Error;

/// Errors reported by the device lifecycle and registration calls
#[derive(Debug, Error)]
pub enum DeviceError {
    /// `start` was called while the device is not stopped
    #[error("device already running")]
    AlreadyRunning,

    /// `stop` was called on a stopped device
    #[error("device not running")]
    NotRunning,

    /// The scheduler thread came up but could not bind its network transport
    #[error("device failed to start: {0:#}")]
    Startup(anyhow::Error),

    /// The scheduler thread could not be spawned
    #[error("failed to spawn the device thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The scheduler thread panicked; the device state it owned is gone
    #[error("device scheduler crashed")]
    Crashed,

    /// `run` was interrupted (Ctrl-C); the device has been stopped
    #[error("device interrupted")]
    Interrupted,

    /// The scheduler is gone and can no longer accept work
    #[error("device scheduler is closed")]
    Closed,
}
