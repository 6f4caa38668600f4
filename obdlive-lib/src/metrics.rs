//! Per-metric read model over the live snapshot and connection status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::connection::{ConnectionState, ConnectionStatus};
use crate::pid::{Pid, Severity};
use crate::poller::{LiveSnapshot, PollingHandle};

/// Presentation-ready view of one parameter. Derived on demand from the
/// current snapshot and status; never stored.
#[derive(Debug, Clone, Serialize)]
pub struct MetricView {
    pub pid: Pid,
    pub name: String,
    pub value: Option<f64>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub formatted: String,
    pub severity: Severity,
    pub color: &'static str,
    pub percentage: Option<f64>,
}

/// Composes connection status, snapshots, and the parameter registry into
/// `MetricView`s. The overview and full live-data screens are the same
/// aggregator over different parameter sets.
pub struct LiveMetricsAggregator {
    pids: Vec<Pid>,
    snapshots: watch::Receiver<LiveSnapshot>,
    status: watch::Receiver<ConnectionStatus>,
    guard: Option<JoinHandle<()>>,
}

impl LiveMetricsAggregator {
    /// The 5-metric vehicle overview.
    pub fn overview(
        snapshots: watch::Receiver<LiveSnapshot>,
        status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        Self::new(Pid::OVERVIEW.to_vec(), snapshots, status)
    }

    /// The 6-metric full live-data view.
    pub fn full_view(
        snapshots: watch::Receiver<LiveSnapshot>,
        status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        Self::new(Pid::FULL.to_vec(), snapshots, status)
    }

    pub fn new(
        pids: Vec<Pid>,
        snapshots: watch::Receiver<LiveSnapshot>,
        status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        Self {
            pids,
            snapshots,
            status,
            guard: None,
        }
    }

    /// Halt the given poll worker whenever the connection leaves
    /// `Connected`. Re-arm after restarting the poller; the previous guard
    /// task is replaced.
    pub fn guard(&mut self, poller: PollingHandle) {
        if let Some(old) = self.guard.take() {
            old.abort();
        }
        let mut status = self.status.clone();
        self.guard = Some(tokio::spawn(async move {
            while status.changed().await.is_ok() {
                let state = status.borrow_and_update().state;
                if state != ConnectionState::Connected {
                    info!(%state, "connection dropped, halting polling");
                    poller.stop();
                }
            }
        }));
    }

    pub fn pids(&self) -> &[Pid] {
        &self.pids
    }

    /// Recompute all tracked views from the current snapshot and status.
    pub fn metrics(&self) -> Vec<MetricView> {
        let snapshot = self.snapshots.borrow().clone();
        let status = self.status.borrow().clone();
        self.pids
            .iter()
            .map(|pid| view_for(*pid, &snapshot, &status))
            .collect()
    }

    /// View for a single tracked parameter, or `None` if untracked.
    pub fn metric(&self, pid: Pid) -> Option<MetricView> {
        if !self.pids.contains(&pid) {
            return None;
        }
        let snapshot = self.snapshots.borrow().clone();
        let status = self.status.borrow().clone();
        Some(view_for(pid, &snapshot, &status))
    }
}

impl Drop for LiveMetricsAggregator {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.abort();
        }
    }
}

fn view_for(pid: Pid, snapshot: &LiveSnapshot, status: &ConnectionStatus) -> MetricView {
    let def = pid.definition();
    let value = snapshot.value(pid);
    let is_loading = status.state == ConnectionState::Connected && snapshot.poll_count == 0;
    let formatted = match value {
        Some(v) => def.format(v),
        None => "--".to_string(),
    };
    let severity = match value {
        Some(v) => pid.classify(v),
        None => Severity::Normal,
    };
    MetricView {
        pid,
        name: pid.to_string(),
        value,
        is_loading,
        error: status.error.clone(),
        last_updated: snapshot.taken_at,
        formatted,
        severity,
        color: severity.color(),
        percentage: value.map(|v| def.percentage(v)),
    }
}
