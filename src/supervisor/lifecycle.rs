//! One OS process: launch or adopt, observe health, kill, release.
//!
//! State machine: `Idle → Starting → Running → (Exited | Killed)`. The move from
//! `Starting` to `Running` is purely time-based (the startup grace period).

#![allow(missing_docs)]

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::config::AppConfig;
use crate::core::errors::{Result, WatchdogError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::platform::pal::{LaunchSpec, ProcessInfo};
use crate::supervisor::SupervisionContext;
use crate::supervisor::events::WatchdogEvent;

/// Sentinel exit code reported when a launch fails outright.
pub const LAUNCH_FAILED_EXIT_CODE: i32 = -1;

/// Poll cadence while reaping a killed child or waiting for exit.
const EXIT_POLL: Duration = Duration::from_millis(25);

/// Upper bound on reaping a killed child inside a reconciliation pass.
const REAP_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessPhase {
    Idle,
    Starting,
    Running,
    Exited,
    Killed,
}

#[derive(Debug)]
struct ProcessHandle {
    pid: u32,
    /// Present only for processes we spawned ourselves.
    child: Option<Child>,
}

/// Wrapper around exactly one OS process.
#[derive(Debug)]
pub struct ProcessLifecycle {
    app_name: String,
    executable: PathBuf,
    args: Vec<String>,
    /// Block inside launch/adopt until the process exits. Helper launches only.
    pub wait_for_exit: bool,
    /// Start the process in the executable's directory.
    pub run_in_dir: bool,
    non_responsive_interval: Duration,
    starting_interval: Duration,
    handle: Option<ProcessHandle>,
    name: String,
    started_at: Option<Instant>,
    unresponsive_since: Option<Instant>,
    exit_code: Option<i32>,
    killed: bool,
}

impl ProcessLifecycle {
    /// Lifecycle with helper-launch defaults: waits for exit, runs in the
    /// executable's directory, 2 s non-responsive threshold, 5 s startup grace.
    #[must_use]
    pub fn new(app_name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
        Self {
            app_name: app_name.into(),
            executable: executable.into(),
            args: Vec::new(),
            wait_for_exit: true,
            run_in_dir: true,
            non_responsive_interval: Duration::from_secs(2),
            starting_interval: Duration::from_secs(5),
            handle: None,
            name: String::new(),
            started_at: None,
            unresponsive_since: None,
            exit_code: None,
            killed: false,
        }
    }

    /// Lifecycle for a supervised, long-running instance of `app`.
    #[must_use]
    pub fn for_app(app: &AppConfig) -> Self {
        let mut lifecycle = Self::new(&app.application_name, &app.application_path);
        lifecycle.args.clone_from(&app.arguments);
        lifecycle.wait_for_exit = false;
        lifecycle.set_thresholds(app.non_responsive_interval(), app.startup_monitor_delay());
        lifecycle
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// New thresholds apply immediately; running timers are kept.
    pub fn set_thresholds(&mut self, non_responsive: Duration, starting: Duration) {
        self.non_responsive_interval = non_responsive;
        self.starting_interval = starting;
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|handle| handle.pid)
    }

    /// OS process name (empty until launched or adopted).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    #[must_use]
    pub const fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    // ──────────────────── launch / adopt ────────────────────

    pub fn launch(&mut self, ctx: &SupervisionContext) -> bool {
        self.launch_at(ctx, Instant::now())
    }

    /// Start the configured executable; the startup window opens at `now`.
    /// Returns `false` when no process was created.
    pub fn launch_at(&mut self, ctx: &SupervisionContext, now: Instant) -> bool {
        self.close();
        self.killed = false;
        self.exit_code = None;

        if !ctx.platform.executable_exists(&self.executable) {
            let err = WatchdogError::MissingExecutable {
                path: self.executable.clone(),
            };
            self.report_launch_failure(ctx, &err, true);
            return false;
        }

        let spec = LaunchSpec {
            executable: self.executable.clone(),
            args: self.args.clone(),
            working_dir: if self.run_in_dir {
                self.executable
                    .parent()
                    .filter(|dir| !dir.as_os_str().is_empty())
                    .map(Path::to_path_buf)
            } else {
                None
            },
        };

        match ctx.platform.launch(&spec) {
            Ok(mut launched) => {
                if let Some(child) = launched.child.as_mut() {
                    capture_output(child, &self.app_name, launched.pid, &ctx.logger);
                }
                self.name = launched.name;
                self.started_at = Some(now);
                self.handle = Some(ProcessHandle {
                    pid: launched.pid,
                    child: launched.child,
                });
                ctx.logger.send(ActivityEvent::ProcessStarted {
                    app: self.app_name.clone(),
                    pid: launched.pid,
                });
                ctx.events.emit(WatchdogEvent::ProcessStarted {
                    app_name: self.app_name.clone(),
                    pid: launched.pid,
                });
                if self.wait_for_exit {
                    self.wait_until_exit(ctx);
                }
                true
            }
            Err(err) => {
                self.report_launch_failure(ctx, &err, false);
                let still_running = ctx
                    .platform
                    .processes_by_name(&spec.process_name())
                    .is_ok_and(|found| !found.is_empty());
                if !still_running {
                    self.exit_code = Some(LAUNCH_FAILED_EXIT_CODE);
                    ctx.logger.send(ActivityEvent::ProcessExited {
                        app: self.app_name.clone(),
                        pid: None,
                        exit_code: self.exit_code,
                    });
                    ctx.events.emit(WatchdogEvent::ProcessExited {
                        app_name: self.app_name.clone(),
                        pid: None,
                        exit_code: self.exit_code,
                    });
                }
                false
            }
        }
    }

    /// Launch again with the stored executable and arguments.
    pub fn relaunch(&mut self, ctx: &SupervisionContext) -> bool {
        self.launch(ctx)
    }

    pub fn relaunch_at(&mut self, ctx: &SupervisionContext, now: Instant) -> bool {
        self.launch_at(ctx, now)
    }

    pub fn adopt(&mut self, process: &ProcessInfo, ctx: &SupervisionContext) -> bool {
        self.adopt_at(process, ctx, Instant::now())
    }

    /// Attach to an already-running process without spawning.
    pub fn adopt_at(&mut self, process: &ProcessInfo, ctx: &SupervisionContext, now: Instant) -> bool {
        self.close();
        self.killed = false;
        self.exit_code = None;

        if !matches!(ctx.platform.process_info(process.pid), Ok(Some(_))) {
            self.exit_code = Some(LAUNCH_FAILED_EXIT_CODE);
            ctx.events.emit(WatchdogEvent::ProcessExited {
                app_name: self.app_name.clone(),
                pid: Some(process.pid),
                exit_code: self.exit_code,
            });
            return false;
        }

        self.name.clone_from(&process.name);
        self.started_at = Some(now);
        self.handle = Some(ProcessHandle {
            pid: process.pid,
            child: None,
        });
        ctx.logger.send(ActivityEvent::ProcessAdopted {
            app: self.app_name.clone(),
            pid: process.pid,
        });
        if self.wait_for_exit {
            self.wait_until_exit(ctx);
        }
        true
    }

    // ──────────────────── health ────────────────────

    /// True once the process is gone, or when there is no process at all.
    pub fn has_exited(&mut self, ctx: &SupervisionContext) -> bool {
        let Some(handle) = self.handle.as_mut() else {
            return true;
        };
        if let Some(child) = handle.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.exit_code = status.code();
                    return true;
                }
                Ok(None) => return false,
                Err(_) => {}
            }
        }
        // Enumeration errors are transient: assume still alive.
        matches!(ctx.platform.process_info(handle.pid), Ok(None))
    }

    pub fn responding(&mut self, ctx: &SupervisionContext) -> bool {
        self.responding_at(ctx, Instant::now())
    }

    /// Fresh OS read on every call. A vanished process counts as responding.
    pub fn responding_at(&mut self, ctx: &SupervisionContext, now: Instant) -> bool {
        let Some(pid) = self.pid() else {
            return true;
        };
        let responding = match ctx.platform.process_info(pid) {
            Ok(Some(info)) => info.responding,
            _ => true,
        };
        if responding {
            self.unresponsive_since = None;
        } else if self.unresponsive_since.is_none() {
            self.unresponsive_since = Some(now);
        }
        responding
    }

    pub fn not_responding_after_interval_at(
        &mut self,
        ctx: &SupervisionContext,
        now: Instant,
    ) -> bool {
        !self.responding_at(ctx, now)
            && self.unresponsive_since.is_some_and(|since| {
                now.saturating_duration_since(since) > self.non_responsive_interval
            })
    }

    #[must_use]
    pub fn is_starting_at(&self, now: Instant) -> bool {
        self.started_at
            .is_some_and(|started| now.saturating_duration_since(started) < self.starting_interval)
    }

    #[must_use]
    pub fn phase(&self, now: Instant) -> ProcessPhase {
        if self.handle.is_some() {
            if self.is_starting_at(now) {
                ProcessPhase::Starting
            } else {
                ProcessPhase::Running
            }
        } else if self.killed {
            ProcessPhase::Killed
        } else if self.started_at.is_some() || self.exit_code.is_some() {
            ProcessPhase::Exited
        } else {
            ProcessPhase::Idle
        }
    }

    // ──────────────────── termination ────────────────────

    /// Best-effort kill; `false` when the OS refused or there is no process.
    pub fn kill(&mut self, ctx: &SupervisionContext) -> bool {
        self.try_kill(ctx).is_ok()
    }

    /// Kill with the failure cause. Never retries.
    pub fn try_kill(&mut self, ctx: &SupervisionContext) -> Result<()> {
        let Some(handle) = self.handle.as_mut() else {
            return Err(WatchdogError::Kill {
                pid: 0,
                details: "no process attached".to_string(),
            });
        };
        ctx.platform.kill(handle.pid)?;
        self.killed = true;
        if let Some(child) = handle.child.as_mut() {
            self.exit_code = reap(child, REAP_TIMEOUT).or(self.exit_code);
        }
        Ok(())
    }

    /// Release the OS handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut handle) = self.handle.take()
            && let Some(child) = handle.child.as_mut()
            && let Ok(Some(status)) = child.try_wait()
        {
            self.exit_code = status.code();
        }
        self.unresponsive_since = None;
    }

    /// Stop tracking without killing. A child we spawned is handed back so
    /// the caller can reap it once it exits.
    pub fn detach(&mut self) -> Option<Child> {
        self.unresponsive_since = None;
        self.handle.take().and_then(|mut handle| handle.child.take())
    }

    fn wait_until_exit(&mut self, ctx: &SupervisionContext) {
        loop {
            if self.has_exited(ctx) {
                break;
            }
            thread::sleep(EXIT_POLL);
        }
        self.close();
    }

    fn report_launch_failure(&self, ctx: &SupervisionContext, err: &WatchdogError, critical: bool) {
        ctx.logger.send(ActivityEvent::LaunchFailed {
            app: self.app_name.clone(),
            code: err.code().to_string(),
            message: err.to_string(),
            critical,
        });
        ctx.events.emit(WatchdogEvent::LaunchFailed {
            app_name: self.app_name.clone(),
            message: err.to_string(),
        });
    }
}

/// Wait briefly for a killed child so it does not linger as a zombie.
fn reap(child: &mut Child, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.code(),
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL),
            _ => return None,
        }
    }
}

fn capture_output(child: &mut Child, app: &str, pid: u32, logger: &ActivityLoggerHandle) {
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, "stdout", app, pid, logger);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, "stderr", app, pid, logger);
    }
}

/// Forward each non-empty line to the activity log until the pipe closes.
fn spawn_reader<R: Read + Send + 'static>(
    pipe: R,
    stream: &'static str,
    app: &str,
    pid: u32,
    logger: &ActivityLoggerHandle,
) {
    let app = app.to_string();
    let thread_logger = logger.clone();
    let spawned = thread::Builder::new()
        .name(format!("out-{pid}-{stream}"))
        .spawn(move || {
            let reader = BufReader::new(pipe);
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if line.is_empty() {
                    continue;
                }
                thread_logger.send(ActivityEvent::ProcessOutput {
                    app: app.clone(),
                    pid,
                    stream,
                    line,
                });
            }
        });
    if let Err(e) = spawned {
        logger.send(ActivityEvent::Error {
            code: "WD-3900".to_string(),
            message: format!("failed to spawn output reader for pid {pid}: {e}"),
        });
    }
}
