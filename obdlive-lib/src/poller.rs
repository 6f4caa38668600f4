//! Timed polling loop turning single-command round trips into snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::CommandChannel;
use crate::error::ObdError;
use crate::pid::Pid;
use crate::transport::CommandLink;

pub const MIN_POLL_INTERVAL_MS: u64 = 200;
pub const MAX_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Clamp a requested interval into the supported range.
pub fn clamp_interval(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS))
}

/// One complete set of decoded values as of a single poll cycle. Replaced
/// wholesale each cycle, never mutated field by field.
#[derive(Debug, Clone, Default)]
pub struct LiveSnapshot {
    /// `None` means no-data, a malformed reply, or a failed read.
    pub values: HashMap<Pid, Option<f64>>,
    pub taken_at: Option<DateTime<Utc>>,
    pub poll_count: u64,
}

impl LiveSnapshot {
    pub fn value(&self, pid: Pid) -> Option<f64> {
        self.values.get(&pid).copied().flatten()
    }
}

/// Clonable stop signal for a running poll worker. Stopping an already
/// finished worker is a no-op.
#[derive(Clone)]
pub struct PollingHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl PollingHandle {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

struct Worker<L: CommandLink> {
    handle: PollingHandle,
    task: JoinHandle<CommandChannel<L>>,
}

/// Drives the command channel across a parameter set on a timer.
///
/// Parameters are read strictly sequentially within a cycle, and a new
/// cycle never starts before the previous one has settled; the channel's
/// one-request-at-a-time invariant is upheld by construction.
pub struct PollingScheduler<L: CommandLink> {
    channel: Option<CommandChannel<L>>,
    pids: Vec<Pid>,
    interval: Duration,
    snapshot_tx: Arc<watch::Sender<LiveSnapshot>>,
    snapshot_rx: watch::Receiver<LiveSnapshot>,
    worker: Option<Worker<L>>,
}

impl<L: CommandLink> PollingScheduler<L> {
    pub fn new(channel: CommandChannel<L>, pids: Vec<Pid>) -> Self {
        let (snapshot_tx, snapshot_rx) = watch::channel(LiveSnapshot::default());
        Self {
            channel: Some(channel),
            pids,
            interval: clamp_interval(DEFAULT_POLL_INTERVAL_MS),
            snapshot_tx: Arc::new(snapshot_tx),
            snapshot_rx,
            worker: None,
        }
    }

    /// Subscribe to snapshot replacements.
    pub fn subscribe(&self) -> watch::Receiver<LiveSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.worker.is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Begin polling: one immediate cycle, then one per interval. Restarts
    /// if already running. Fails with `NotConnected` when no channel is
    /// available.
    pub async fn start(&mut self) -> Result<PollingHandle, ObdError> {
        if self.worker.is_some() {
            self.stop().await;
        }
        let mut channel = self.channel.take().ok_or(ObdError::NotConnected)?;
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = PollingHandle {
            stop: Arc::new(stop_tx),
        };
        let pids = self.pids.clone();
        let interval = self.interval;
        let snapshot_tx = Arc::clone(&self.snapshot_tx);
        // Counting continues across stop/start so consumers can tell a fresh
        // snapshot from a stale one.
        let mut poll_count = snapshot_tx.borrow().poll_count;

        debug!(?interval, pids = pids.len(), "polling started");
        let task = tokio::spawn(async move {
            loop {
                let mut values = HashMap::with_capacity(pids.len());
                for pid in &pids {
                    if *stop_rx.borrow() {
                        break;
                    }
                    let value = match channel.read_pid(*pid).await {
                        Ok(value) => value,
                        Err(e) => {
                            // One bad read never halts the cycle.
                            warn!(pid = %pid, error = %e, "read failed");
                            None
                        }
                    };
                    values.insert(*pid, value);
                }
                // A cycle gathered while stopping is discarded, not published.
                if *stop_rx.borrow() {
                    break;
                }
                poll_count += 1;
                snapshot_tx.send_replace(LiveSnapshot {
                    values,
                    taken_at: Some(Utc::now()),
                    poll_count,
                });
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => break,
                }
            }
            channel
        });
        self.worker = Some(Worker {
            handle: handle.clone(),
            task,
        });
        Ok(handle)
    }

    /// Stop polling. A command already in flight is allowed to settle; its
    /// cycle is discarded. The command channel is recovered for reuse.
    pub async fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.handle.stop();
            match worker.task.await {
                Ok(channel) => self.channel = Some(channel),
                Err(e) => warn!(error = %e, "poll worker failed"),
            }
            debug!("polling stopped");
        }
    }

    /// Clamp and apply a new interval; restarts the loop when running.
    pub async fn set_interval(&mut self, ms: u64) {
        self.interval = clamp_interval(ms);
        if self.worker.is_some() {
            self.stop().await;
            if let Err(e) = self.start().await {
                warn!(error = %e, "restart with new interval failed");
            }
        }
    }

    /// Clear the snapshot, e.g. after a disconnect.
    pub fn reset(&mut self) {
        self.snapshot_tx.send_replace(LiveSnapshot::default());
    }

    /// Stop and release the command channel, if one survives.
    pub async fn into_channel(mut self) -> Option<CommandChannel<L>> {
        self.stop().await;
        self.channel.take()
    }
}
