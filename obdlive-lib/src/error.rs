use thiserror::Error;

/// The primary error type for the `obdlive` library.
#[derive(Error, Debug)]
pub enum ObdError {
    #[error("no usable bluetooth adapter: {0}")]
    AdapterUnavailable(String),

    #[error("bluetooth error: {0}")]
    Ble(#[from] btleplug::Error),

    #[error("peripheral '{0}' does not expose the expected diagnostic service")]
    ServiceNotFound(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection to '{device}' failed: {reason}")]
    ConnectFailed { device: String, reason: String },

    #[error("reconnection failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("command timed out: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("transport link closed")]
    LinkClosed,

    #[error("command channel already taken")]
    ChannelTaken,

    #[error("connection task is gone")]
    ManagerClosed,
}
