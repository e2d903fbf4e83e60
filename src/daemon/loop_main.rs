//! Daemon main loop: wires the logger, liveness server and scheduler together,
//! then polls signals, counters and the state file until shutdown.
//!
//! Threads:
//! - **Main thread** (this loop): signals, config reload, state file, systemd heartbeat
//! - **Scheduler thread**: reconciles every supervised application once per tick
//! - **Liveness threads**: accept loop plus one thread per connected client
//! - **Logger thread**: writes the JSONL activity log

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;

use crate::core::config::{AppConfig, AppId, Config};
use crate::core::errors::{Result, WatchdogError};
use crate::daemon::scheduler::{SchedulerHandle, SchedulerState, WatchdogScheduler};
use crate::daemon::self_monitor::{SelfMonitor, StateInputs};
use crate::daemon::signals::{ShutdownCoordinator, SignalHandler, WatchdogHeartbeat, notify_ready};
use crate::liveness::channel::LivenessChannel;
#[cfg(unix)]
use crate::liveness::server::LivenessServer;
use crate::logger::activity::{
    ActivityEvent, ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use crate::logger::jsonl::JsonlConfig;
use crate::platform::pal::detect_platform;
use crate::supervisor::SupervisionContext;
use crate::supervisor::events::{EventSink, WatchdogEvent};

/// Main loop poll period.
const LOOP_POLL: Duration = Duration::from_millis(250);

/// Capacity of the watchdog event channel drained by the main loop.
const EVENT_CHANNEL_CAP: usize = 1024;

// ──────────────────── daemon configuration ────────────────────

/// Arguments for `appwd daemon`.
#[derive(Debug, Clone, Default)]
pub struct DaemonArgs {
    /// Optional PID file for non-systemd setups.
    pub pidfile: Option<PathBuf>,
    /// Systemd watchdog timeout in seconds (0 = disabled).
    pub watchdog_sec: u64,
}

// ──────────────────── config diff ────────────────────

/// One edit needed to move the scheduler from an old application list to a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppChange {
    Add(AppConfig),
    Update(AppConfig),
    Remove(AppId),
}

/// Diff two application lists by id. Order follows `new`, then removals.
#[must_use]
pub fn diff_applications(old: &[AppConfig], new: &[AppConfig]) -> Vec<AppChange> {
    let previous: HashMap<AppId, &AppConfig> = old.iter().map(|app| (app.id, app)).collect();
    let mut changes = Vec::new();
    for app in new {
        match previous.get(&app.id) {
            None => changes.push(AppChange::Add(app.clone())),
            Some(prev) if *prev != app => changes.push(AppChange::Update(app.clone())),
            Some(_) => {}
        }
    }
    for app in old {
        if !new.iter().any(|candidate| candidate.id == app.id) {
            changes.push(AppChange::Remove(app.id));
        }
    }
    changes
}

// ──────────────────── main daemon struct ────────────────────

pub struct WatchdogDaemon {
    config: Config,
    logger_handle: ActivityLoggerHandle,
    logger_join: Option<thread::JoinHandle<()>>,
    signal_handler: SignalHandler,
    watchdog: WatchdogHeartbeat,
    liveness: Arc<LivenessChannel>,
    events: EventSink,
    events_rx: Receiver<WatchdogEvent>,
    scheduler: SchedulerHandle,
    self_monitor: SelfMonitor,
    pidfile: Option<PathBuf>,
    start_time: Instant,
}

impl WatchdogDaemon {
    /// Build every component. Nothing is reconciled until `run()`.
    pub fn init(config: Config, args: &DaemonArgs) -> Result<Self> {
        Self::init_with(config, args, SignalHandler::new())
    }

    /// `init` with a caller-supplied signal handler (tests drive it directly).
    pub fn init_with(config: Config, args: &DaemonArgs, signal_handler: SignalHandler) -> Result<Self> {
        let platform = detect_platform()?;
        let start_time = Instant::now();

        // 1. Logger.
        let (logger_handle, logger_join) = spawn_logger(ActivityLoggerConfig {
            jsonl_config: JsonlConfig::at(&config.paths.jsonl_log),
            ..ActivityLoggerConfig::default()
        })?;

        // 2. Liveness channel and event sink.
        let (liveness, signals) =
            LivenessChannel::new(config.liveness.signal_capacity, logger_handle.clone());
        let liveness = Arc::new(liveness);
        let (events, events_rx) = EventSink::channel(EVENT_CHANNEL_CAP);

        // 3. Scheduler with the configured applications.
        let ctx = SupervisionContext::new(
            platform,
            Arc::clone(&liveness),
            logger_handle.clone(),
            events.clone(),
        );
        let mut scheduler = WatchdogScheduler::new(ctx, signals);
        for app in &config.applications {
            scheduler.add(app.clone());
        }
        #[allow(unused_mut)]
        let mut scheduler = SchedulerHandle::spawn(scheduler, config.tick_interval())?;

        // 4. Liveness server, owned by the scheduler handle for teardown.
        #[cfg(unix)]
        {
            if config.liveness.enabled {
                let server = LivenessServer::bind(
                    &config.liveness.socket_path,
                    Arc::clone(&liveness),
                    logger_handle.clone(),
                )?;
                eprintln!(
                    "[WD-DAEMON] liveness socket listening at {}",
                    server.socket_path().display()
                );
                scheduler.attach_server(server);
            }
        }

        // 5. Systemd watchdog.
        let watchdog = if args.watchdog_sec > 0 {
            WatchdogHeartbeat::new(args.watchdog_sec)
        } else {
            WatchdogHeartbeat::disabled()
        };

        // 6. PID file.
        if let Some(path) = &args.pidfile {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).map_err(|source| WatchdogError::io(parent, source))?;
            }
            fs::write(path, format!("{}\n", std::process::id()))
                .map_err(|source| WatchdogError::io(path, source))?;
        }

        let self_monitor = SelfMonitor::new(config.paths.state_file.clone());

        Ok(Self {
            config,
            logger_handle,
            logger_join: Some(logger_join),
            signal_handler,
            watchdog,
            liveness,
            events,
            events_rx,
            scheduler,
            self_monitor,
            pidfile: args.pidfile.clone(),
            start_time,
        })
    }

    /// Run until a shutdown signal arrives or the scheduler thread dies.
    pub fn run(&mut self) -> Result<()> {
        let config_hash = self.config.stable_hash().unwrap_or_default();
        self.logger_handle.send(ActivityEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
            applications: self.config.applications.len(),
        });
        eprintln!(
            "[WD-DAEMON] supervising {} application(s), tick {} ms",
            self.config.applications.len(),
            self.config.scheduler.tick_interval_ms
        );

        self.scheduler.resume()?;
        notify_ready();

        let mut reason = "clean shutdown";
        loop {
            if self.signal_handler.should_shutdown() {
                eprintln!("[WD-DAEMON] shutdown requested");
                break;
            }
            if !self.scheduler.is_alive() {
                eprintln!("[WD-DAEMON] scheduler thread exited unexpectedly, shutting down");
                self.logger_handle.send(ActivityEvent::Error {
                    code: "WD-3900".to_string(),
                    message: "scheduler thread exited unexpectedly".to_string(),
                });
                reason = "scheduler thread died";
                break;
            }
            if self.signal_handler.should_reload() {
                self.handle_config_reload();
            }
            if self.signal_handler.should_toggle_pause() {
                self.toggle_pause();
            }

            self.drain_events();
            if self.self_monitor.write_due() {
                let inputs = self.state_inputs();
                self.self_monitor.maybe_write_state(inputs);
            }
            let status = self
                .self_monitor
                .status_line(self.scheduler.state(), self.config.applications.len());
            self.watchdog.maybe_notify(&status);

            thread::sleep(LOOP_POLL);
        }

        self.shutdown(reason);
        Ok(())
    }

    // ──────────────────── helpers ────────────────────

    fn drain_events(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.self_monitor.record_event(&event);
        }
    }

    fn state_inputs(&self) -> StateInputs {
        let (scheduler, applications) = match self.scheduler.snapshot() {
            Ok(snapshot) => (snapshot.state, snapshot.applications),
            Err(_) => (self.scheduler.state(), Vec::new()),
        };
        StateInputs {
            scheduler,
            applications,
            liveness_clients: self.liveness.client_count(),
            liveness_messages: self.liveness.message_count(),
            dropped_log_events: self.logger_handle.dropped_events(),
            dropped_events: self.events.dropped(),
        }
    }

    fn toggle_pause(&self) {
        let result = if self.scheduler.state() == SchedulerState::Paused {
            eprintln!("[WD-DAEMON] resuming supervision (SIGUSR1)");
            self.scheduler.resume()
        } else {
            eprintln!("[WD-DAEMON] pausing supervision (SIGUSR1)");
            self.scheduler.pause()
        };
        if let Err(e) = result {
            self.logger_handle.error(&e);
        }
    }

    fn handle_config_reload(&mut self) {
        eprintln!("[WD-DAEMON] config reload requested (SIGHUP)");

        let new_config = match Config::load(Some(&self.config.paths.config_file)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("[WD-DAEMON] config reload failed: {e}");
                self.logger_handle.send(ActivityEvent::Error {
                    code: e.code().to_string(),
                    message: format!("config reload failed: {e}"),
                });
                return;
            }
        };

        let old_hash = self.config.stable_hash().unwrap_or_default();
        let new_hash = new_config.stable_hash().unwrap_or_default();
        if old_hash == new_hash {
            eprintln!("[WD-DAEMON] config unchanged, skipping reload");
            return;
        }

        if new_config.scheduler != self.config.scheduler || new_config.liveness != self.config.liveness {
            eprintln!("[WD-DAEMON] scheduler and liveness settings take effect on restart");
        }

        let changes = diff_applications(&self.config.applications, &new_config.applications);
        let count = changes.len();
        for change in changes {
            let result = match change {
                AppChange::Add(app) => self.scheduler.add(app),
                AppChange::Update(app) => self.scheduler.update(app),
                AppChange::Remove(id) => self.scheduler.remove(id),
            };
            if let Err(e) = result {
                self.logger_handle.error(&e);
            }
        }

        self.logger_handle.send(ActivityEvent::ConfigReloaded {
            details: format!("config hash: {old_hash} -> {new_hash}, {count} application change(s)"),
        });
        self.self_monitor.set_state_file(new_config.paths.state_file.clone());
        self.config = new_config;
        eprintln!("[WD-DAEMON] config reloaded ({count} application change(s))");
    }

    // ──────────────────── shutdown ────────────────────

    fn shutdown(&mut self, reason: &str) {
        let uptime_secs = self.start_time.elapsed().as_secs();
        let final_inputs = self.state_inputs();

        let scheduler = &mut self.scheduler;
        let mut stop_scheduler = || scheduler.shutdown();

        let self_monitor = &mut self.self_monitor;
        let events_rx = &self.events_rx;
        let mut final_state = || {
            while let Ok(event) = events_rx.try_recv() {
                self_monitor.record_event(&event);
            }
            let mut inputs = final_inputs.clone();
            inputs.scheduler = SchedulerState::Stopped;
            self_monitor.write_state(inputs)
        };

        let pidfile = self.pidfile.as_ref();
        let mut remove_pidfile = || pidfile.is_none_or(|path| fs::remove_file(path).is_ok());

        let logger_handle = &self.logger_handle;
        let logger_join = &mut self.logger_join;
        let mut stop_logger = || {
            logger_handle.send(ActivityEvent::DaemonStopped {
                reason: reason.to_string(),
                uptime_secs,
            });
            logger_handle.shutdown();
            logger_join.take().is_none_or(|join| join.join().is_ok())
        };

        let mut steps: Vec<(&str, &mut dyn FnMut() -> bool)> = vec![
            ("scheduler", &mut stop_scheduler),
            ("state file", &mut final_state),
            ("pidfile", &mut remove_pidfile),
            ("logger", &mut stop_logger),
        ];
        ShutdownCoordinator::new().execute(&mut steps);

        eprintln!("[WD-DAEMON] shutdown complete (uptime={uptime_secs}s)");
    }
}
