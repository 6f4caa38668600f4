pub mod channel;
pub mod codec;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod pid;
pub mod poller;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export the main surface for consumers.
pub use channel::{CommandChannel, DEFAULT_COMMAND_TIMEOUT};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, ReconnectPolicy};
pub use error::ObdError;
pub use metrics::{LiveMetricsAggregator, MetricView};
pub use pid::{Pid, PidDefinition, Severity};
pub use poller::{LiveSnapshot, PollingHandle, PollingScheduler};
pub use transport::{BleLink, BleTransport, CommandLink, DeviceIdentity, Transport};
