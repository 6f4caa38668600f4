//! Connection lifecycle: scan, connect, disconnect, auto-reconnect.
//!
//! All mutable state lives in a supervisor task; the public
//! `ConnectionManager` handle talks to it over a command channel with
//! oneshot replies. Reconnect backoff timers are owned by the supervisor's
//! `select!` loop, so an explicit disconnect or dropping the manager cancels
//! them structurally; no stray retry can fire into torn-down state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel::CommandChannel;
use crate::error::ObdError;
use crate::transport::{DeviceIdentity, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Reconnecting,
}

/// Value carried by the status watch channel. `error` holds only
/// user-visible failures: connect failures and reconnect exhaustion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub device: Option<DeviceIdentity>,
    pub error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            device: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            base_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before retrying after failed attempt `attempt` (1-based):
    /// `base * multiplier^(attempt - 1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exp as i32);
        Duration::from_millis(ms as u64)
    }
}

/// Attempt counter for one reconnect sequence. Resets on success and on any
/// manual disconnect; never exceeds `max_retries + 1`.
#[derive(Debug, Default)]
pub(crate) struct ReconnectTracker {
    attempt: u32,
}

impl ReconnectTracker {
    /// Advance to the next attempt, or `None` once the policy is exhausted.
    pub(crate) fn next_attempt(&mut self, policy: &ReconnectPolicy) -> Option<u32> {
        self.attempt += 1;
        if self.attempt > policy.max_retries {
            None
        } else {
            Some(self.attempt)
        }
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    #[cfg(test)]
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }
}

enum Command<L> {
    Scan {
        window: Duration,
        reply: oneshot::Sender<Result<Option<DeviceIdentity>, ObdError>>,
    },
    Connect {
        device: DeviceIdentity,
        reply: oneshot::Sender<Result<(), ObdError>>,
    },
    OpenChannel {
        reply: oneshot::Sender<Result<CommandChannel<L>, ObdError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the connection supervisor. Construct one per adapter session
/// and pass it to whoever needs it; there is no global instance.
pub struct ConnectionManager<T: Transport> {
    commands: mpsc::Sender<Command<T::Link>>,
    status: watch::Receiver<ConnectionStatus>,
    task: Option<JoinHandle<()>>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Spawn the supervisor. Must be called inside a tokio runtime.
    pub fn new(transport: T, policy: ReconnectPolicy) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let supervisor = Supervisor {
            transport,
            policy,
            status: status_tx,
            link: None,
            last_device: None,
            intentional: false,
            tracker: ReconnectTracker::default(),
        };
        let task = tokio::spawn(supervisor.run(cmd_rx));
        Self {
            commands: cmd_tx,
            status: status_rx,
            task: Some(task),
        }
    }

    /// Subscribe to state changes. Exactly one value per transition; drop
    /// the receiver to unsubscribe.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Scan for a compatible adapter. `Ok(None)` means the window closed
    /// empty or the scan was cancelled; discovery failures are recorded on
    /// the status channel and also come back as `None`.
    pub async fn scan(&self, window: Duration) -> Result<Option<DeviceIdentity>, ObdError> {
        self.request(|reply| Command::Scan { window, reply }).await?
    }

    pub async fn connect(&self, device: DeviceIdentity) -> Result<(), ObdError> {
        self.request(|reply| Command::Connect { device, reply })
            .await?
    }

    /// Take the command channel produced by the most recent successful
    /// connect or reconnect. The slot holds at most one channel; a second
    /// call before the next (re)connect fails with `ChannelTaken`.
    pub async fn open_channel(&self) -> Result<CommandChannel<T::Link>, ObdError> {
        self.request(|reply| Command::OpenChannel { reply }).await?
    }

    /// Tear down the connection and suppress auto-reconnect.
    pub async fn disconnect(&self) -> Result<(), ObdError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Stop the supervisor and wait for it to release the transport.
    pub async fn shutdown(mut self) {
        if let Ok(()) = self.request(|reply| Command::Shutdown { reply }).await {
            if let Some(task) = self.task.take() {
                let _ = task.await;
            }
        }
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command<T::Link>,
    ) -> Result<R, ObdError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ObdError::ManagerClosed)?;
        rx.await.map_err(|_| ObdError::ManagerClosed)
    }
}

struct Supervisor<T: Transport> {
    transport: T,
    policy: ReconnectPolicy,
    status: watch::Sender<ConnectionStatus>,
    /// Link produced by the latest (re)connect, waiting for `open_channel`.
    link: Option<T::Link>,
    last_device: Option<DeviceIdentity>,
    intentional: bool,
    tracker: ReconnectTracker,
}

impl<T: Transport> Supervisor<T> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command<T::Link>>) {
        let mut retry_at: Option<Instant> = None;
        loop {
            let connected = self.state() == ConnectionState::Connected;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    None => break,
                    Some(Command::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle(cmd, &mut retry_at).await,
                },
                lost = self.transport.link_lost(), if connected => {
                    self.on_link_lost(lost, &mut retry_at).await;
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)),
                    if retry_at.is_some() =>
                {
                    retry_at = None;
                    self.reconnect_step(&mut retry_at).await;
                }
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "transport release on teardown");
        }
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn publish(
        &self,
        state: ConnectionState,
        device: Option<DeviceIdentity>,
        error: Option<String>,
    ) {
        self.status.send_replace(ConnectionStatus {
            state,
            device,
            error,
        });
    }

    async fn handle(&mut self, cmd: Command<T::Link>, retry_at: &mut Option<Instant>) {
        match cmd {
            Command::Scan { window, reply } => {
                let _ = reply.send(self.do_scan(window).await);
            }
            Command::Connect { device, reply } => {
                let _ = reply.send(self.do_connect(device).await);
            }
            Command::OpenChannel { reply } => {
                let result = match self.link.take() {
                    Some(link) => Ok(CommandChannel::new(link)),
                    None if self.state() == ConnectionState::Connected => {
                        Err(ObdError::ChannelTaken)
                    }
                    None => Err(ObdError::NotConnected),
                };
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.do_disconnect(retry_at).await;
                let _ = reply.send(());
            }
            // Shutdown is intercepted by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn do_scan(&mut self, window: Duration) -> Result<Option<DeviceIdentity>, ObdError> {
        if self.state() != ConnectionState::Disconnected {
            warn!(state = %self.state(), "scan requested while busy");
            return Ok(None);
        }
        self.publish(ConnectionState::Scanning, None, None);
        match self.transport.scan(window).await {
            Ok(found) => {
                self.publish(ConnectionState::Disconnected, None, None);
                Ok(found)
            }
            Err(e) => {
                // Discovery failure: record the message, report "nothing
                // found". A cancelled scan never reaches this arm.
                warn!(error = %e, "scan failed");
                self.publish(ConnectionState::Disconnected, None, Some(e.to_string()));
                Ok(None)
            }
        }
    }

    async fn do_connect(&mut self, device: DeviceIdentity) -> Result<(), ObdError> {
        info!(name = %device.name, "connecting");
        self.publish(ConnectionState::Connecting, Some(device.clone()), None);
        match self.transport.connect(&device).await {
            Ok(link) => {
                self.link = Some(link);
                self.last_device = Some(device.clone());
                self.intentional = false;
                self.tracker.reset();
                self.publish(ConnectionState::Connected, Some(device), None);
                Ok(())
            }
            Err(e) => {
                warn!(name = %device.name, error = %e, "connect failed");
                self.publish(ConnectionState::Disconnected, None, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn do_disconnect(&mut self, retry_at: &mut Option<Instant>) {
        self.intentional = true;
        *retry_at = None;
        self.tracker.reset();
        self.link = None;
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "transport close");
        }
        self.last_device = None;
        self.publish(ConnectionState::Disconnected, None, None);
        info!("disconnected");
    }

    async fn on_link_lost(&mut self, device: DeviceIdentity, retry_at: &mut Option<Instant>) {
        self.link = None;
        let eligible = !self.intentional && self.policy.enabled && self.last_device.is_some();
        if !eligible {
            info!(name = %device.name, "link lost, not reconnecting");
            self.last_device = None;
            self.publish(ConnectionState::Disconnected, None, None);
            return;
        }
        warn!(name = %device.name, "link lost, starting reconnect");
        self.tracker.reset();
        self.publish(ConnectionState::Reconnecting, Some(device), None);
        self.reconnect_step(retry_at).await;
    }

    async fn reconnect_step(&mut self, retry_at: &mut Option<Instant>) {
        let Some(device) = self.last_device.clone() else {
            self.publish(ConnectionState::Disconnected, None, None);
            return;
        };
        match self.tracker.next_attempt(&self.policy) {
            None => {
                let attempts = self.policy.max_retries;
                error!(attempts, "reconnection exhausted");
                self.tracker.reset();
                self.publish(
                    ConnectionState::Disconnected,
                    None,
                    Some(ObdError::ReconnectExhausted { attempts }.to_string()),
                );
            }
            Some(attempt) => {
                info!(attempt, name = %device.name, "reconnect attempt");
                self.publish(ConnectionState::Reconnecting, Some(device.clone()), None);
                match self.transport.connect(&device).await {
                    Ok(link) => {
                        self.link = Some(link);
                        self.tracker.reset();
                        self.intentional = false;
                        info!(name = %device.name, "reconnected");
                        self.publish(ConnectionState::Connected, Some(device), None);
                    }
                    Err(e) => {
                        let delay = self.policy.delay_for(attempt);
                        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e,
                            "reconnect attempt failed");
                        *retry_at = Some(Instant::now() + delay);
                    }
                }
            }
        }
    }
}
