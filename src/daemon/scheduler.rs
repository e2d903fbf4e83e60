//! Tick scheduler: owns every `ApplicationSupervisor` and reconciles them in
//! order on a fixed cadence.
//!
//! `WatchdogScheduler` is the synchronous core. `SchedulerHandle::spawn` moves
//! it onto the `appwd-scheduler` thread, which serves commands between ticks so
//! the supervisor collection needs no lock.

#![allow(missing_docs)]

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::Child;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::config::{AppConfig, AppId};
use crate::core::errors::{Result, WatchdogError};
use crate::liveness::channel::LivenessSignal;
#[cfg(unix)]
use crate::liveness::server::LivenessServer;
use crate::logger::activity::ActivityEvent;
use crate::supervisor::SupervisionContext;
use crate::supervisor::application::{ApplicationStatus, ApplicationSupervisor};
use crate::supervisor::events::WatchdogEvent;

/// How long `snapshot()` waits for the scheduler thread to answer.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

// ──────────────────── state ────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    NotStarted,
    Running,
    Paused,
    Stopped,
}

impl SchedulerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler state plus per-application status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub state: SchedulerState,
    pub applications: Vec<ApplicationStatus>,
}

// ──────────────────── synchronous core ────────────────────

pub struct WatchdogScheduler {
    ctx: SupervisionContext,
    signals: Receiver<LivenessSignal>,
    supervisors: Vec<ApplicationSupervisor>,
    /// Children of removed applications, reaped once they exit.
    orphans: Vec<Child>,
}

impl WatchdogScheduler {
    #[must_use]
    pub fn new(ctx: SupervisionContext, signals: Receiver<LivenessSignal>) -> Self {
        Self {
            ctx,
            signals,
            supervisors: Vec::new(),
            orphans: Vec::new(),
        }
    }

    #[must_use]
    pub const fn context(&self) -> &SupervisionContext {
        &self.ctx
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.supervisors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    /// Ids in reconciliation order.
    #[must_use]
    pub fn ids(&self) -> Vec<AppId> {
        self.supervisors.iter().map(ApplicationSupervisor::id).collect()
    }

    #[must_use]
    pub fn supervisor(&self, id: AppId) -> Option<&ApplicationSupervisor> {
        self.supervisors.iter().find(|supervisor| supervisor.id() == id)
    }

    /// Start supervising `config`. An id that is already present is ignored.
    pub fn add(&mut self, config: AppConfig) -> bool {
        if self.supervisor(config.id).is_some() {
            eprintln!(
                "[WD-SCHED] WARNING: application {} ({}) already supervised, ignoring add",
                config.application_name, config.id
            );
            self.ctx.logger.send(ActivityEvent::Error {
                code: "WD-1001".to_string(),
                message: format!(
                    "duplicate add ignored for application {} ({})",
                    config.application_name, config.id
                ),
            });
            return false;
        }
        self.ctx.logger.send(ActivityEvent::ApplicationAdded {
            app_id: config.id,
            app: config.application_name.clone(),
        });
        self.supervisors.push(ApplicationSupervisor::new(config));
        true
    }

    /// Replace policy for an existing application in place.
    pub fn update(&mut self, config: AppConfig) -> bool {
        let Some(supervisor) = self
            .supervisors
            .iter_mut()
            .find(|supervisor| supervisor.id() == config.id)
        else {
            eprintln!(
                "[WD-SCHED] WARNING: update for unknown application {} ({})",
                config.application_name, config.id
            );
            return false;
        };
        self.ctx.logger.send(ActivityEvent::ApplicationUpdated {
            app_id: config.id,
            app: config.application_name.clone(),
        });
        supervisor.apply_config(config);
        true
    }

    /// Stop supervising `id`. Its processes keep running, untracked.
    pub fn remove(&mut self, id: AppId) -> bool {
        let Some(index) = self.supervisors.iter().position(|supervisor| supervisor.id() == id)
        else {
            return false;
        };
        let supervisor = self.supervisors.remove(index);
        self.ctx.logger.send(ActivityEvent::ApplicationRemoved {
            app_id: id,
            app: supervisor.name().to_string(),
        });
        self.orphans.extend(supervisor.release());
        true
    }

    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    /// Relay pending heartbeats, then reconcile every supervisor in order.
    /// A failing or panicking supervisor never aborts the tick.
    pub fn tick_at(&mut self, now: Instant) {
        self.reap_orphans();
        self.relay_liveness();
        let ctx = &self.ctx;
        for supervisor in &mut self.supervisors {
            let outcome = catch_unwind(AssertUnwindSafe(|| supervisor.reconcile_at(ctx, now)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(panic) => format!("reconciliation panicked: {}", panic_message(panic.as_ref())),
            };
            report_check_failed(ctx, supervisor, message);
        }
    }

    /// Children of removed applications that are still running.
    #[must_use]
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Collect exit status of orphaned children so none lingers as a zombie.
    pub fn reap_orphans(&mut self) -> usize {
        let before = self.orphans.len();
        self.orphans
            .retain_mut(|child| matches!(child.try_wait(), Ok(None)));
        before - self.orphans.len()
    }

    /// Drain queued heartbeats. Returns how many reached a supervisor.
    pub fn relay_liveness(&mut self) -> usize {
        let mut relayed = 0;
        while let Ok(signal) = self.signals.try_recv() {
            if self
                .supervisors
                .iter()
                .any(|supervisor| supervisor.relay_liveness(signal.pid, &self.ctx))
            {
                relayed += 1;
            }
        }
        relayed
    }

    #[must_use]
    pub fn snapshot(&self, now: Instant) -> Vec<ApplicationStatus> {
        self.supervisors
            .iter()
            .map(|supervisor| supervisor.status(now, &self.ctx.liveness))
            .collect()
    }
}

fn report_check_failed(ctx: &SupervisionContext, supervisor: &ApplicationSupervisor, message: String) {
    ctx.logger.send(ActivityEvent::CheckFailed {
        app_id: supervisor.id(),
        app: supervisor.name().to_string(),
        message: message.clone(),
    });
    ctx.events.emit(WatchdogEvent::CheckFailed {
        app_id: supervisor.id(),
        app_name: supervisor.name().to_string(),
        message,
    });
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ──────────────────── background thread ────────────────────

enum Command {
    Add(Box<AppConfig>),
    Update(Box<AppConfig>),
    Remove(AppId),
    Pause,
    Resume,
    Snapshot(Sender<SchedulerSnapshot>),
    Shutdown,
}

/// Control surface for a scheduler running on its own thread.
pub struct SchedulerHandle {
    commands: Sender<Command>,
    state: Arc<Mutex<SchedulerState>>,
    thread: Option<JoinHandle<()>>,
    #[cfg(unix)]
    server: Option<LivenessServer>,
}

impl SchedulerHandle {
    /// Move `scheduler` onto the `appwd-scheduler` thread. It stays in
    /// `NotStarted` until `resume()` is called.
    pub fn spawn(scheduler: WatchdogScheduler, tick_interval: Duration) -> Result<Self> {
        let (tx, rx) = unbounded();
        let state = Arc::new(Mutex::new(SchedulerState::NotStarted));
        let thread_state = Arc::clone(&state);
        let thread = thread::Builder::new()
            .name("appwd-scheduler".to_string())
            .spawn(move || scheduler_thread_main(scheduler, &rx, &thread_state, tick_interval))
            .map_err(|e| WatchdogError::Runtime {
                details: format!("failed to spawn scheduler thread: {e}"),
            })?;
        Ok(Self {
            commands: tx,
            state,
            thread: Some(thread),
            #[cfg(unix)]
            server: None,
        })
    }

    /// Tie the liveness server's lifetime to this scheduler.
    #[cfg(unix)]
    pub fn attach_server(&mut self, server: LivenessServer) {
        self.server = Some(server);
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// Whether the scheduler thread is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    pub fn add(&self, config: AppConfig) -> Result<()> {
        self.send(Command::Add(Box::new(config)))
    }

    pub fn update(&self, config: AppConfig) -> Result<()> {
        self.send(Command::Update(Box::new(config)))
    }

    pub fn remove(&self, id: AppId) -> Result<()> {
        self.send(Command::Remove(id))
    }

    /// Stop ticking after the current tick, if any.
    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    /// Start ticking (also the first start from `NotStarted`).
    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    pub fn snapshot(&self) -> Result<SchedulerSnapshot> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(Command::Snapshot(reply_tx))?;
        reply_rx
            .recv_timeout(SNAPSHOT_TIMEOUT)
            .map_err(|_| WatchdogError::ChannelClosed {
                component: "scheduler snapshot",
            })
    }

    /// Stop the thread, then the attached liveness server. Idempotent.
    pub fn shutdown(&mut self) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        let _ = self.commands.send(Command::Shutdown);
        let clean = thread.join().is_ok();
        *self.state.lock() = SchedulerState::Stopped;
        #[cfg(unix)]
        {
            if let Some(mut server) = self.server.take() {
                server.stop();
            }
        }
        clean
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| WatchdogError::ChannelClosed {
                component: "scheduler",
            })
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn scheduler_thread_main(
    mut scheduler: WatchdogScheduler,
    rx: &Receiver<Command>,
    state: &Mutex<SchedulerState>,
    tick_interval: Duration,
) {
    let mut next_tick = Instant::now();
    loop {
        let current = *state.lock();
        let received = if current == SchedulerState::Running {
            rx.recv_deadline(next_tick)
        } else {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        };

        match received {
            Ok(Command::Add(config)) => {
                scheduler.add(*config);
            }
            Ok(Command::Update(config)) => {
                scheduler.update(*config);
            }
            Ok(Command::Remove(id)) => {
                scheduler.remove(id);
            }
            Ok(Command::Pause) => {
                if current == SchedulerState::Running {
                    *state.lock() = SchedulerState::Paused;
                }
            }
            Ok(Command::Resume) => {
                if current != SchedulerState::Running {
                    *state.lock() = SchedulerState::Running;
                    next_tick = Instant::now();
                }
            }
            Ok(Command::Snapshot(reply)) => {
                let _ = reply.send(SchedulerSnapshot {
                    state: current,
                    applications: scheduler.snapshot(Instant::now()),
                });
            }
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                let started = Instant::now();
                scheduler.tick_at(started);
                // Work time counts against the interval so the cadence holds.
                next_tick = started + tick_interval;
            }
        }
    }
    *state.lock() = SchedulerState::Stopped;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::channel::LivenessChannel;
    use crate::logger::activity::ActivityLoggerHandle;
    use crate::platform::pal::{LaunchSpec, LaunchedProcess, MockPlatform, Platform, ProcessInfo};
    use crate::supervisor::events::EventSink;
    use std::path::Path;

    fn build(platform: Arc<dyn Platform>) -> (WatchdogScheduler, Receiver<WatchdogEvent>) {
        let logger = ActivityLoggerHandle::discard();
        let (liveness, signals) = LivenessChannel::new(64, logger.clone());
        let (events, rx) = EventSink::channel(256);
        let ctx = SupervisionContext::new(platform, Arc::new(liveness), logger, events);
        (WatchdogScheduler::new(ctx, signals), rx)
    }

    fn app(name: &str) -> AppConfig {
        AppConfig::new(name, format!("/opt/bin/{name}"))
    }

    /// Panics on every enumeration of one name.
    struct PanickyPlatform {
        inner: MockPlatform,
        poisoned: String,
    }

    impl Platform for PanickyPlatform {
        fn processes_by_name(&self, name: &str) -> Result<Vec<ProcessInfo>> {
            assert_ne!(name, self.poisoned, "enumeration exploded");
            self.inner.processes_by_name(name)
        }
        fn process_info(&self, pid: u32) -> Result<Option<ProcessInfo>> {
            self.inner.process_info(pid)
        }
        fn kill(&self, pid: u32) -> Result<()> {
            self.inner.kill(pid)
        }
        fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess> {
            self.inner.launch(spec)
        }
        fn executable_exists(&self, path: &Path) -> bool {
            self.inner.executable_exists(path)
        }
    }

    #[test]
    fn add_ignores_duplicate_ids() {
        let (mut scheduler, _events) = build(Arc::new(MockPlatform::new()));
        let config = app("worker");
        assert!(scheduler.add(config.clone()));
        assert!(!scheduler.add(config));
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn remove_targets_exactly_one_id() {
        let platform = Arc::new(MockPlatform::new());
        let (mut scheduler, _events) = build(platform.clone());
        let first = app("alpha");
        let second = app("beta");
        let first_id = first.id;
        scheduler.add(first);
        scheduler.add(second.clone());
        scheduler.tick();

        assert!(scheduler.remove(first_id));
        assert!(!scheduler.remove(first_id));
        assert_eq!(scheduler.ids(), vec![second.id]);
        // Removed application's process is left alone.
        assert_eq!(platform.pids_named("alpha").len(), 1);
        assert!(platform.kills().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn removed_application_children_are_reaped_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("appwd-orphan");
        std::fs::copy("/bin/sleep", &exe).unwrap();
        let (mut scheduler, _events) = build(Arc::new(crate::platform::pal::LinuxPlatform::new()));
        let mut config = AppConfig::new("appwd-orphan", &exe);
        config.arguments = vec!["1".to_string()];
        let id = config.id;
        scheduler.add(config);
        scheduler.tick();
        assert_eq!(scheduler.supervisor(id).unwrap().tracked_pids().len(), 1);

        assert!(scheduler.remove(id));
        assert_eq!(scheduler.orphan_count(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.orphan_count() > 0 && Instant::now() < deadline {
            scheduler.tick();
            thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(scheduler.orphan_count(), 0);
    }

    #[test]
    fn update_replaces_policy_in_place() {
        let (mut scheduler, _events) = build(Arc::new(MockPlatform::new()));
        let mut config = app("worker");
        scheduler.add(config.clone());
        config.max_processes = 3;
        assert!(scheduler.update(config.clone()));
        assert_eq!(scheduler.supervisor(config.id).unwrap().config().max_processes, 3);
        assert!(!scheduler.update(app("stranger")));
    }

    #[test]
    fn tick_reconciles_every_supervisor() {
        let platform = Arc::new(MockPlatform::new());
        let (mut scheduler, events) = build(platform.clone());
        scheduler.add(app("alpha"));
        scheduler.add(app("beta"));
        scheduler.tick();

        assert_eq!(platform.launches().len(), 2);
        let started = events
            .try_iter()
            .filter(|event| matches!(event, WatchdogEvent::ProcessStarted { .. }))
            .count();
        assert_eq!(started, 2);
    }

    #[test]
    fn failing_supervisor_does_not_abort_tick() {
        let platform = Arc::new(MockPlatform::new());
        platform.set_enumeration_fails("alpha");
        let (mut scheduler, events) = build(platform.clone());
        scheduler.add(app("alpha"));
        scheduler.add(app("beta"));
        scheduler.tick();

        assert_eq!(platform.pids_named("beta").len(), 1);
        let collected: Vec<WatchdogEvent> = events.try_iter().collect();
        assert!(collected.iter().any(|event| matches!(
            event,
            WatchdogEvent::CheckFailed { app_name, .. } if app_name == "alpha"
        )));
    }

    #[test]
    fn panicking_supervisor_is_contained() {
        let platform = Arc::new(PanickyPlatform {
            inner: MockPlatform::new(),
            poisoned: "alpha".to_string(),
        });
        let (mut scheduler, events) = build(platform.clone());
        scheduler.add(app("alpha"));
        scheduler.add(app("beta"));
        scheduler.tick();

        assert_eq!(platform.inner.pids_named("beta").len(), 1);
        let message = events
            .try_iter()
            .find_map(|event| match event {
                WatchdogEvent::CheckFailed { message, .. } => Some(message),
                _ => None,
            })
            .unwrap();
        assert!(message.contains("panicked"), "{message}");
    }

    #[test]
    fn heartbeats_are_relayed_to_the_owning_supervisor() {
        let platform = Arc::new(MockPlatform::new());
        let (mut scheduler, events) = build(platform.clone());
        let config = app("worker");
        scheduler.add(config.clone());
        scheduler.tick();
        let pid = platform.pids_named("worker")[0];
        let _ = events.try_iter().count();

        let liveness = Arc::clone(&scheduler.context().liveness);
        liveness.handle_message("client-1", &format!("1,{pid}")).unwrap();
        liveness.handle_message("client-2", "1,999999").unwrap();
        assert_eq!(scheduler.relay_liveness(), 1);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![WatchdogEvent::LivenessReceived {
                app_id: config.id,
                app_name: "worker".to_string(),
                pid,
            }]
        );
    }

    #[test]
    fn handle_runs_pauses_and_stops() {
        let platform = Arc::new(MockPlatform::new());
        let (scheduler, _events) = build(platform.clone());
        let mut handle = SchedulerHandle::spawn(scheduler, Duration::from_millis(20)).unwrap();
        assert_eq!(handle.state(), SchedulerState::NotStarted);

        handle.add(app("worker")).unwrap();
        let snapshot = handle.snapshot().unwrap();
        assert_eq!(snapshot.state, SchedulerState::NotStarted);
        assert_eq!(snapshot.applications.len(), 1);
        assert!(platform.launches().is_empty());

        handle.resume().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while platform.launches().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(platform.launches().len(), 1);
        assert_eq!(handle.snapshot().unwrap().state, SchedulerState::Running);

        handle.pause().unwrap();
        assert_eq!(handle.snapshot().unwrap().state, SchedulerState::Paused);
        let pid = platform.pids_named("worker")[0];
        platform.remove_process(pid);
        thread::sleep(Duration::from_millis(100));
        assert!(platform.pids_named("worker").is_empty());

        assert!(handle.shutdown());
        assert!(handle.shutdown());
        assert_eq!(handle.state(), SchedulerState::Stopped);
        assert!(handle.add(app("late")).is_err());
    }
}
