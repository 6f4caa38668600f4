use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::channel::CommandChannel;
use crate::codec;
use crate::connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, ReconnectPolicy, ReconnectTracker,
};
use crate::error::ObdError;
use crate::metrics::LiveMetricsAggregator;
use crate::pid::{Pid, Severity};
use crate::poller::{LiveSnapshot, PollingScheduler, clamp_interval};
use crate::transport::{CommandLink, DeviceIdentity, Transport};

// ---------------------------------------------------------------------------
// Codec and registry
// ---------------------------------------------------------------------------

#[test]
fn decode_rpm_1a_f8() {
    // (0x1A * 256 + 0xF8) / 4 = 1726
    assert_eq!(codec::decode("41 0C 1A F8\r\r>", Pid::EngineRpm), Some(1726.0));
    assert_eq!(codec::decode("410C1AF8\r>", Pid::EngineRpm), Some(1726.0));
}

#[test]
fn decode_speed_and_coolant() {
    assert_eq!(codec::decode("410D50>", Pid::VehicleSpeed), Some(80.0));
    assert_eq!(codec::decode("41 05 5A\r>", Pid::CoolantTemp), Some(50.0));
}

#[test]
fn decode_percent_pids() {
    assert_eq!(codec::decode("412FFF>", Pid::FuelLevel), Some(100.0));
    let throttle = codec::decode("41117F>", Pid::ThrottlePosition).unwrap();
    assert!((throttle - 127.0 * 100.0 / 255.0).abs() < 1e-9);
}

#[test]
fn decode_tolerates_command_echo() {
    // Echo enabled: the adapter repeats "010C" before the reply.
    assert_eq!(codec::decode("010C410C1AF8\r>", Pid::EngineRpm), Some(1726.0));
}

#[test]
fn no_data_yields_null_not_error() {
    assert_eq!(codec::decode("NO DATA\r\r>", Pid::EngineRpm), None);
    assert_eq!(codec::decode("CAN ERROR\r>", Pid::VehicleSpeed), None);
    assert_eq!(codec::decode("?\r>", Pid::CoolantTemp), None);
    assert!(codec::payload_bytes("NO DATA\r>", Pid::EngineRpm).is_empty());
}

#[test]
fn short_payload_yields_null() {
    // RPM expects two bytes.
    assert_eq!(codec::decode("410C1A>", Pid::EngineRpm), None);
}

#[test]
fn wrong_prefix_yields_empty_payload() {
    // A speed reply is no payload for an RPM query.
    assert!(codec::payload_bytes("41 0D 50\r>", Pid::EngineRpm).is_empty());
    assert_eq!(codec::decode("41 0D 50\r>", Pid::EngineRpm), None);
}

#[test]
fn searching_banner_is_stripped() {
    assert_eq!(
        codec::decode("SEARCHING...\r410C1AF8\r>", Pid::EngineRpm),
        Some(1726.0)
    );
}

#[test]
fn registry_commands_and_sizes() {
    assert_eq!(Pid::EngineRpm.command(), "010C");
    assert_eq!(Pid::FuelLevel.command(), "012F");
    assert_eq!(Pid::EngineRpm.response_prefix(), "410C");
    assert_eq!(Pid::EngineRpm.definition().expected_bytes, 2);
    for pid in Pid::FULL {
        assert!(pid.definition().expected_bytes >= 1);
        assert_eq!(pid.definition().pid, pid);
    }
}

#[test]
fn pid_from_str_aliases_and_codes() {
    assert_eq!("rpm".parse::<Pid>().unwrap(), Pid::EngineRpm);
    assert_eq!("coolant".parse::<Pid>().unwrap(), Pid::CoolantTemp);
    assert_eq!("0C".parse::<Pid>().unwrap(), Pid::EngineRpm);
    assert_eq!("2f".parse::<Pid>().unwrap(), Pid::FuelLevel);
    assert!("warp".parse::<Pid>().is_err());
}

#[test]
fn severity_thresholds() {
    assert_eq!(Pid::CoolantTemp.classify(115.0), Severity::Critical);
    assert_eq!(Pid::CoolantTemp.classify(105.0), Severity::Warning);
    assert_eq!(Pid::CoolantTemp.classify(30.0), Severity::Info);
    assert_eq!(Pid::CoolantTemp.classify(90.0), Severity::Normal);
    assert_eq!(Pid::EngineRpm.classify(7000.0), Severity::Critical);
    assert_eq!(Pid::EngineRpm.classify(6000.0), Severity::Warning);
    assert_eq!(Pid::EngineRpm.classify(3000.0), Severity::Normal);
    assert_eq!(Pid::FuelLevel.classify(3.0), Severity::Critical);
    assert_eq!(Pid::FuelLevel.classify(10.0), Severity::Warning);
    assert_eq!(Pid::VehicleSpeed.classify(250.0), Severity::Normal);
}

#[test]
fn severity_total_for_out_of_range_input() {
    // Decoded values may exceed the display range; classification must not
    // panic anywhere.
    for pid in Pid::FULL {
        for value in [-1e9, -40.0, 0.0, 1e9, f64::MAX] {
            let _ = pid.classify(value);
        }
    }
}

#[test]
fn percentage_clamps_to_display_range() {
    let rpm = Pid::EngineRpm.definition();
    assert_eq!(rpm.percentage(9000.0), 100.0);
    assert_eq!(rpm.percentage(-100.0), 0.0);
    assert_eq!(rpm.percentage(4000.0), 50.0);
    let coolant = Pid::CoolantTemp.definition();
    assert_eq!(coolant.percentage(50.0), 50.0);
}

#[test]
fn format_uses_unit_and_precision() {
    assert_eq!(Pid::EngineRpm.definition().format(1726.0), "1726 rpm");
    assert_eq!(Pid::CoolantTemp.definition().format(50.0), "50 °C");
    assert_eq!(Pid::FuelLevel.definition().format(42.5), "42.5 %");
}

// ---------------------------------------------------------------------------
// Intervals and backoff
// ---------------------------------------------------------------------------

#[test]
fn interval_clamps() {
    assert_eq!(clamp_interval(50), Duration::from_millis(200));
    assert_eq!(clamp_interval(999_999), Duration::from_millis(10_000));
    assert_eq!(clamp_interval(1000), Duration::from_millis(1000));
}

#[test]
fn backoff_sequence() {
    let policy = ReconnectPolicy::default();
    assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
    assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
    assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
}

#[test]
fn tracker_exhausts_after_max_retries() {
    let policy = ReconnectPolicy::default();
    let mut tracker = ReconnectTracker::default();
    assert_eq!(tracker.next_attempt(&policy), Some(1));
    assert_eq!(tracker.next_attempt(&policy), Some(2));
    assert_eq!(tracker.next_attempt(&policy), Some(3));
    assert_eq!(tracker.next_attempt(&policy), None);
    assert_eq!(tracker.attempt(), 4);
    tracker.reset();
    assert_eq!(tracker.attempt(), 0);
    assert_eq!(tracker.next_attempt(&policy), Some(1));
}

// ---------------------------------------------------------------------------
// Scripted transport doubles
// ---------------------------------------------------------------------------

enum Reply {
    Fragments(Vec<&'static str>),
    /// Never answer; the command times out.
    Silence,
}

struct MockLink {
    script: VecDeque<Reply>,
    pending: VecDeque<Bytes>,
    writes: Vec<String>,
}

impl MockLink {
    fn new(script: Vec<Reply>) -> Self {
        Self {
            script: script.into(),
            pending: VecDeque::new(),
            writes: Vec::new(),
        }
    }
}

impl CommandLink for MockLink {
    async fn write(&mut self, payload: &[u8]) -> Result<(), ObdError> {
        self.writes.push(String::from_utf8_lossy(payload).into_owned());
        self.pending.clear();
        match self.script.pop_front() {
            Some(Reply::Fragments(frags)) => {
                self.pending = frags
                    .into_iter()
                    .map(|f| Bytes::from_static(f.as_bytes()))
                    .collect();
            }
            Some(Reply::Silence) | None => {}
        }
        Ok(())
    }

    async fn next_fragment(&mut self) -> Result<Bytes, ObdError> {
        match self.pending.pop_front() {
            Some(frag) => Ok(frag),
            None => std::future::pending().await,
        }
    }
}

struct MockTransport {
    scan_result: Option<DeviceIdentity>,
    /// Per-call connect outcomes; exhausted entries succeed.
    connect_script: VecDeque<bool>,
    connects: Arc<AtomicU32>,
    lost_rx: mpsc::UnboundedReceiver<()>,
    connected: Option<DeviceIdentity>,
}

impl MockTransport {
    fn new(
        connect_script: Vec<bool>,
    ) -> (Self, mpsc::UnboundedSender<()>, Arc<AtomicU32>) {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let connects = Arc::new(AtomicU32::new(0));
        let transport = Self {
            scan_result: Some(test_device()),
            connect_script: connect_script.into(),
            connects: Arc::clone(&connects),
            lost_rx,
            connected: None,
        };
        (transport, lost_tx, connects)
    }
}

impl Transport for MockTransport {
    type Link = MockLink;

    async fn scan(&mut self, _window: Duration) -> Result<Option<DeviceIdentity>, ObdError> {
        Ok(self.scan_result.clone())
    }

    async fn connect(&mut self, device: &DeviceIdentity) -> Result<MockLink, ObdError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.connect_script.pop_front().unwrap_or(true) {
            self.connected = Some(device.clone());
            Ok(MockLink::new(vec![]))
        } else {
            Err(ObdError::ConnectFailed {
                device: device.name.clone(),
                reason: "refused".into(),
            })
        }
    }

    async fn disconnect(&mut self) -> Result<(), ObdError> {
        self.connected = None;
        Ok(())
    }

    async fn link_lost(&mut self) -> DeviceIdentity {
        loop {
            if self.connected.is_none() {
                std::future::pending::<()>().await;
            }
            match self.lost_rx.recv().await {
                Some(()) => {
                    if let Some(device) = self.connected.take() {
                        return device;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        }
    }
}

fn test_device() -> DeviceIdentity {
    DeviceIdentity {
        id: "11:22:33:44:55:66".into(),
        name: "OBDII".into(),
    }
}

fn connected_status() -> ConnectionStatus {
    ConnectionStatus {
        state: ConnectionState::Connected,
        device: Some(test_device()),
        error: None,
    }
}

// ---------------------------------------------------------------------------
// CommandChannel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn channel_reassembles_fragments() {
    let link = MockLink::new(vec![Reply::Fragments(vec!["41 0C ", "1A F8", "\r\r>"])]);
    let mut channel = CommandChannel::new(link);
    let response = channel.send_command("010C").await.unwrap();
    assert!(response.contains("1A F8"));
    assert_eq!(codec::decode(&response, Pid::EngineRpm), Some(1726.0));
    let link = channel.into_link();
    assert_eq!(link.writes, vec!["010C\r"]);
}

#[tokio::test(start_paused = true)]
async fn channel_timeout_clears_state_for_next_call() {
    let link = MockLink::new(vec![
        Reply::Silence,
        Reply::Fragments(vec!["410D50", ">"]),
    ]);
    let mut channel = CommandChannel::new(link);
    let err = channel.send_command("010D").await.unwrap_err();
    assert!(matches!(err, ObdError::Timeout(_)));
    // The buffer was cleared; the retry sees only the fresh reply.
    assert_eq!(channel.read_pid(Pid::VehicleSpeed).await.unwrap(), Some(80.0));
}

// ---------------------------------------------------------------------------
// PollingScheduler
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn poll_cycle_survives_one_bad_read() {
    // Speed times out; RPM before it and coolant after it still decode.
    let link = MockLink::new(vec![
        Reply::Fragments(vec!["410C1AF8>"]),
        Reply::Silence,
        Reply::Fragments(vec!["41055A>"]),
    ]);
    let pids = vec![Pid::EngineRpm, Pid::VehicleSpeed, Pid::CoolantTemp];
    let mut poller = PollingScheduler::new(CommandChannel::new(link), pids);
    let mut snapshots = poller.subscribe();

    poller.start().await.unwrap();
    snapshots.changed().await.unwrap();
    let snapshot = snapshots.borrow_and_update().clone();
    assert_eq!(snapshot.poll_count, 1);
    assert_eq!(snapshot.value(Pid::EngineRpm), Some(1726.0));
    assert_eq!(snapshot.value(Pid::VehicleSpeed), None);
    assert_eq!(snapshot.value(Pid::CoolantTemp), Some(50.0));
    assert!(snapshot.taken_at.is_some());
    poller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_discards_cycle_in_flight() {
    let link = MockLink::new(vec![Reply::Silence]);
    let mut poller = PollingScheduler::new(CommandChannel::new(link), vec![Pid::EngineRpm]);
    let snapshots = poller.subscribe();

    poller.start().await.unwrap();
    poller.stop().await;
    // The in-flight command settled (timeout), but its cycle was dropped.
    assert_eq!(snapshots.borrow().poll_count, 0);
    assert!(snapshots.borrow().values.is_empty());
    // The channel came back; polling can resume.
    assert!(!poller.is_polling());
    poller.start().await.unwrap();
    poller.stop().await;
}

#[tokio::test(start_paused = true)]
async fn set_interval_applies_while_running() {
    let mut poller = PollingScheduler::new(
        CommandChannel::new(MockLink::new(vec![])),
        vec![Pid::EngineRpm],
    );
    poller.set_interval(50).await;
    assert_eq!(poller.interval(), Duration::from_millis(200));
    poller.set_interval(999_999).await;
    assert_eq!(poller.interval(), Duration::from_millis(10_000));

    poller.start().await.unwrap();
    poller.set_interval(500).await;
    assert_eq!(poller.interval(), Duration::from_millis(500));
    assert!(poller.is_polling());
    poller.stop().await;
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scan_connect_and_manual_disconnect() {
    let (transport, _lost_tx, connects) = MockTransport::new(vec![]);
    let manager = ConnectionManager::new(transport, ReconnectPolicy::default());
    let mut status = manager.status();

    let device = manager
        .scan(Duration::from_millis(10))
        .await
        .unwrap()
        .expect("scripted scan result");
    assert_eq!(device, test_device());

    manager.connect(device.clone()).await.unwrap();
    assert_eq!(status.borrow_and_update().state, ConnectionState::Connected);
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    // The link slot holds exactly one channel per connect.
    let _channel = manager.open_channel().await.unwrap();
    assert!(matches!(
        manager.open_channel().await,
        Err(ObdError::ChannelTaken)
    ));

    manager.disconnect().await.unwrap();
    let after = status.borrow_and_update().clone();
    assert_eq!(after.state, ConnectionState::Disconnected);
    assert_eq!(after.error, None);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_backoff_then_exhaustion() {
    // Initial connect succeeds, every reconnect attempt fails.
    let (transport, lost_tx, connects) = MockTransport::new(vec![true, false, false, false]);
    let manager = ConnectionManager::new(transport, ReconnectPolicy::default());
    let mut status = manager.status();

    manager.connect(test_device()).await.unwrap();
    let start = tokio::time::Instant::now();
    lost_tx.send(()).unwrap();

    let terminal = status
        .wait_for(|s| s.state == ConnectionState::Disconnected && s.error.is_some())
        .await
        .unwrap()
        .clone();
    // Three failed attempts spaced 1000/2000/4000 ms, then terminal.
    assert_eq!(start.elapsed(), Duration::from_millis(7000));
    assert_eq!(connects.load(Ordering::SeqCst), 4);
    assert!(
        terminal.error.as_deref().unwrap().contains("after 3 attempts"),
        "unexpected error: {:?}",
        terminal.error
    );
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_reconnect() {
    // First reconnect attempt fails; any stray later attempt would succeed
    // and flip the state back to Connected, failing the assertions below.
    let (transport, lost_tx, connects) = MockTransport::new(vec![true, false]);
    let manager = ConnectionManager::new(transport, ReconnectPolicy::default());
    let mut status = manager.status();

    manager.connect(test_device()).await.unwrap();
    lost_tx.send(()).unwrap();
    status
        .wait_for(|s| s.state == ConnectionState::Reconnecting)
        .await
        .unwrap();

    manager.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(connects.load(Ordering::SeqCst), 2);
    let after = status.borrow_and_update().clone();
    assert_eq!(after.state, ConnectionState::Disconnected);
    assert_eq!(after.error, None);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_recovers_and_refills_channel_slot() {
    let (transport, lost_tx, connects) = MockTransport::new(vec![true, false, true]);
    let manager = ConnectionManager::new(transport, ReconnectPolicy::default());
    let mut status = manager.status();

    manager.connect(test_device()).await.unwrap();
    let _first = manager.open_channel().await.unwrap();
    lost_tx.send(()).unwrap();

    status
        .wait_for(|s| s.state == ConnectionState::Reconnecting)
        .await
        .unwrap();
    status
        .wait_for(|s| s.state == ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(connects.load(Ordering::SeqCst), 3);
    // The reconnect produced a fresh link.
    let _second = manager.open_channel().await.unwrap();
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn link_lost_with_policy_disabled_goes_straight_down() {
    let policy = ReconnectPolicy {
        enabled: false,
        ..ReconnectPolicy::default()
    };
    let (transport, lost_tx, connects) = MockTransport::new(vec![true]);
    let manager = ConnectionManager::new(transport, policy);
    let mut status = manager.status();

    manager.connect(test_device()).await.unwrap();
    lost_tx.send(()).unwrap();

    let after = status
        .wait_for(|s| s.state == ConnectionState::Disconnected)
        .await
        .unwrap()
        .clone();
    assert_eq!(after.error, None);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    manager.shutdown().await;
}

// ---------------------------------------------------------------------------
// LiveMetricsAggregator
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn guard_halts_polling_on_connection_loss() {
    let (status_tx, status_rx) = watch::channel(connected_status());
    let mut poller = PollingScheduler::new(
        CommandChannel::new(MockLink::new(vec![])),
        vec![Pid::EngineRpm],
    );
    let handle = poller.start().await.unwrap();
    let mut aggregator = LiveMetricsAggregator::overview(poller.subscribe(), status_rx);
    aggregator.guard(handle);
    let mut snapshots = poller.subscribe();
    snapshots.changed().await.unwrap();

    status_tx.send_replace(ConnectionStatus {
        state: ConnectionState::Disconnected,
        device: None,
        error: None,
    });
    // Let any in-flight cycle settle, then verify the counter is frozen.
    tokio::time::sleep(Duration::from_secs(10)).await;
    let frozen = snapshots.borrow().poll_count;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(snapshots.borrow().poll_count, frozen);
    poller.stop().await;
}

#[tokio::test]
async fn metric_views_reflect_snapshot_and_status() {
    let (snap_tx, snap_rx) = watch::channel(LiveSnapshot::default());
    let (status_tx, status_rx) = watch::channel(connected_status());
    let aggregator = LiveMetricsAggregator::full_view(snap_rx, status_rx);
    assert_eq!(aggregator.pids().len(), 6);

    // Connected but no cycle yet: everything is loading.
    assert!(aggregator.metrics().iter().all(|m| m.is_loading));

    let mut values = std::collections::HashMap::new();
    values.insert(Pid::EngineRpm, Some(1726.0));
    values.insert(Pid::CoolantTemp, Some(112.0));
    values.insert(Pid::VehicleSpeed, None);
    snap_tx.send_replace(LiveSnapshot {
        values,
        taken_at: Some(chrono::Utc::now()),
        poll_count: 1,
    });

    let rpm = aggregator.metric(Pid::EngineRpm).unwrap();
    assert_eq!(rpm.value, Some(1726.0));
    assert_eq!(rpm.formatted, "1726 rpm");
    assert_eq!(rpm.severity, Severity::Normal);
    assert!(!rpm.is_loading);
    assert!((rpm.percentage.unwrap() - 1726.0 / 80.0).abs() < 1e-9);

    let coolant = aggregator.metric(Pid::CoolantTemp).unwrap();
    assert_eq!(coolant.severity, Severity::Critical);
    assert_eq!(coolant.color, "red");

    let speed = aggregator.metric(Pid::VehicleSpeed).unwrap();
    assert_eq!(speed.value, None);
    assert_eq!(speed.formatted, "--");

    // Terminal errors surface on every view.
    status_tx.send_replace(ConnectionStatus {
        state: ConnectionState::Disconnected,
        device: None,
        error: Some("reconnection failed after 3 attempts".into()),
    });
    let rpm = aggregator.metric(Pid::EngineRpm).unwrap();
    assert_eq!(
        rpm.error.as_deref(),
        Some("reconnection failed after 3 attempts")
    );
    assert!(!rpm.is_loading);

    // Untracked parameters have no view.
    let (_snap_tx2, snap_rx2) = watch::channel(LiveSnapshot::default());
    let (_status_tx2, status_rx2) = watch::channel(connected_status());
    let overview = LiveMetricsAggregator::overview(snap_rx2, status_rx2);
    assert!(overview.metric(Pid::EngineLoad).is_none());
}
