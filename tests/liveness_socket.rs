//! End-to-end liveness path: client → socket server → channel → scheduler thread.

#![cfg(unix)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use app_watchdog::liveness::client::LivenessClient;
use app_watchdog::liveness::server::LivenessServer;
use app_watchdog::prelude::*;
use crossbeam_channel::Receiver;

fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

struct Running {
    platform: Arc<MockPlatform>,
    handle: SchedulerHandle,
    channel: Arc<LivenessChannel>,
    events: Receiver<WatchdogEvent>,
    socket: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn start(app: AppConfig) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("live.sock");
    let platform = Arc::new(MockPlatform::new());
    let logger = ActivityLoggerHandle::discard();
    let (channel, signals) = LivenessChannel::new(64, logger.clone());
    let channel = Arc::new(channel);
    let (sink, events) = EventSink::channel(1024);
    let ctx = SupervisionContext::new(platform.clone(), Arc::clone(&channel), logger.clone(), sink);

    let mut scheduler = WatchdogScheduler::new(ctx, signals);
    scheduler.add(app);
    let mut handle = SchedulerHandle::spawn(scheduler, Duration::from_millis(100)).unwrap();
    let server = LivenessServer::bind(&socket, Arc::clone(&channel), logger).unwrap();
    handle.attach_server(server);
    handle.resume().unwrap();

    Running {
        platform,
        handle,
        channel,
        events,
        socket,
        _dir: dir,
    }
}

fn worker() -> AppConfig {
    let mut app = AppConfig::new("worker", "/opt/bin/worker");
    app.startup_monitor_delay_secs = 0;
    app
}

#[test]
fn heartbeat_from_client_is_relayed_to_the_owning_application() {
    let mut running = start(worker());
    assert!(wait_for(|| running.platform.pids_named("worker").len() == 1));
    let pid = running.platform.pids_named("worker")[0];

    let mut client = LivenessClient::connect(&running.socket).unwrap();
    client.heartbeat(pid).unwrap();

    let relayed = wait_for(|| {
        running.events.try_iter().any(|event| {
            matches!(event, WatchdogEvent::LivenessReceived { pid: p, .. } if p == pid)
        })
    });
    assert!(relayed);
    assert!(running.channel.connected(pid));

    let snapshot = running.handle.snapshot().unwrap();
    assert_eq!(snapshot.state, SchedulerState::Running);
    assert!(snapshot.applications[0].processes[0].heartbeat_connected);

    assert!(running.handle.shutdown());
    assert!(!running.socket.exists());
}

#[test]
fn kill_request_over_socket_replaces_the_process() {
    let running = start(worker());
    assert!(wait_for(|| running.platform.pids_named("worker").len() == 1));
    let pid = running.platform.pids_named("worker")[0];

    let mut client = LivenessClient::connect(&running.socket).unwrap();
    client.request_kill(pid, None).unwrap();

    assert!(wait_for(|| running.platform.kills().contains(&pid)));
    assert!(wait_for(|| {
        let pids = running.platform.pids_named("worker");
        pids.len() == 1 && pids[0] != pid
    }));
    let reasons: Vec<KillReason> = running
        .events
        .try_iter()
        .filter_map(|event| match event {
            WatchdogEvent::ProcessKilled { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![KillReason::KillRequested]);
}

#[test]
fn kill_request_is_ignored_when_not_granted() {
    let mut app = worker();
    app.grant_kill_request = false;
    let running = start(app);
    assert!(wait_for(|| running.platform.pids_named("worker").len() == 1));
    let pid = running.platform.pids_named("worker")[0];

    let mut client = LivenessClient::connect(&running.socket).unwrap();
    client.request_kill(pid, None).unwrap();
    assert!(wait_for(|| running.channel.connected(pid)));
    thread::sleep(Duration::from_millis(400));

    assert!(running.platform.kills().is_empty());
}

#[test]
fn paused_scheduler_does_not_act_on_requests() {
    let running = start(worker());
    assert!(wait_for(|| running.platform.pids_named("worker").len() == 1));
    let pid = running.platform.pids_named("worker")[0];
    running.handle.pause().unwrap();
    assert!(wait_for(|| running.handle.state() == SchedulerState::Paused));

    let mut client = LivenessClient::connect(&running.socket).unwrap();
    client.request_kill(pid, None).unwrap();
    thread::sleep(Duration::from_millis(400));
    assert!(running.platform.kills().is_empty());

    running.handle.resume().unwrap();
    assert!(wait_for(|| running.platform.kills().contains(&pid)));
}
