//! Per-application reconciliation: keep the right number of healthy instances running.
//!
//! Every tick runs five passes in a fixed order: duplicates, non-responsive,
//! exited, unmonitored, under-population.

#![allow(missing_docs)]

use std::hash::{Hash, Hasher};
use std::process::Child;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::config::{AppConfig, AppId};
use crate::core::errors::{Result, WatchdogError};
use crate::liveness::channel::LivenessChannel;
use crate::logger::activity::ActivityEvent;
use crate::platform::pal::ProcessInfo;
use crate::supervisor::SupervisionContext;
use crate::supervisor::events::{KillReason, WatchdogEvent};
use crate::supervisor::lifecycle::{ProcessLifecycle, ProcessPhase};

// ──────────────────── status ────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub pid: u32,
    pub phase: ProcessPhase,
    pub heartbeat_connected: bool,
}

/// Point-in-time view of one supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationStatus {
    pub id: AppId,
    pub name: String,
    pub active: bool,
    pub processes: Vec<ProcessStatus>,
}

// ──────────────────── supervisor ────────────────────

/// Owns the tracked lifecycles of one application.
#[derive(Debug)]
pub struct ApplicationSupervisor {
    config: AppConfig,
    processes: Vec<ProcessLifecycle>,
}

impl PartialEq for ApplicationSupervisor {
    fn eq(&self, other: &Self) -> bool {
        self.config.id == other.config.id
    }
}

impl Eq for ApplicationSupervisor {}

impl Hash for ApplicationSupervisor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.config.id.hash(state);
    }
}

impl ApplicationSupervisor {
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            processes: Vec::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> AppId {
        self.config.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.application_name
    }

    #[must_use]
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.config.active
    }

    /// Pids of the tracked lifecycles, in tracking order.
    #[must_use]
    pub fn tracked_pids(&self) -> Vec<u32> {
        self.processes.iter().filter_map(ProcessLifecycle::pid).collect()
    }

    #[must_use]
    pub fn has_process(&self, pid: u32) -> bool {
        self.processes.iter().any(|lifecycle| lifecycle.pid() == Some(pid))
    }

    /// Replace policy in place. Running lifecycles pick up the new thresholds
    /// and keep their timers.
    pub fn apply_config(&mut self, config: AppConfig) {
        for lifecycle in &mut self.processes {
            lifecycle.set_thresholds(config.non_responsive_interval(), config.startup_monitor_delay());
        }
        self.config = config;
    }

    #[must_use]
    pub fn status(&self, now: Instant, liveness: &LivenessChannel) -> ApplicationStatus {
        ApplicationStatus {
            id: self.config.id,
            name: self.config.application_name.clone(),
            active: self.config.active,
            processes: self
                .processes
                .iter()
                .filter_map(|lifecycle| {
                    lifecycle.pid().map(|pid| ProcessStatus {
                        pid,
                        phase: lifecycle.phase(now),
                        heartbeat_connected: liveness.connected(pid),
                    })
                })
                .collect(),
        }
    }

    /// Stop supervising without killing anything. Children this supervisor
    /// spawned are returned for the caller to reap.
    #[must_use]
    pub fn release(self) -> Vec<Child> {
        self.processes
            .into_iter()
            .filter_map(|mut lifecycle| lifecycle.detach())
            .collect()
    }

    /// Publish a heartbeat from `pid` if this supervisor tracks it.
    pub fn relay_liveness(&self, pid: u32, ctx: &SupervisionContext) -> bool {
        if !self.has_process(pid) {
            return false;
        }
        ctx.events.emit(WatchdogEvent::LivenessReceived {
            app_id: self.config.id,
            app_name: self.config.application_name.clone(),
            pid,
        });
        true
    }

    // ──────────────────── reconciliation ────────────────────

    pub fn reconcile(&mut self, ctx: &SupervisionContext) -> Result<()> {
        self.reconcile_at(ctx, Instant::now())
    }

    /// One full reconciliation. `now` drives every timer comparison.
    pub fn reconcile_at(&mut self, ctx: &SupervisionContext, now: Instant) -> Result<()> {
        if !self.config.active {
            return Ok(());
        }
        self.reconcile_duplicates(ctx)?;
        self.reconcile_non_responsive(ctx, now)?;
        self.reconcile_exited(ctx, now)?;
        self.reconcile_unmonitored(ctx, now);
        self.ensure_running(ctx, now)
    }

    fn running(&self, ctx: &SupervisionContext) -> Result<Vec<ProcessInfo>> {
        ctx.platform.processes_by_name(&self.config.application_name)
    }

    fn reconcile_duplicates(&mut self, ctx: &SupervisionContext) -> Result<()> {
        let running = self.running(ctx)?;
        let max = to_usize(self.config.max_processes);
        if running.len() <= max {
            return Ok(());
        }
        ctx.logger.send(ActivityEvent::DuplicatesDetected {
            app: self.config.application_name.clone(),
            running: running.len(),
            max_processes: self.config.max_processes,
        });

        let mut live = running.len();
        let mut remaining = Vec::new();
        for info in &running {
            if live <= max {
                break;
            }
            if info.responding {
                remaining.push(info.pid);
            } else if self.kill_duplicate(ctx, info.pid) {
                live -= 1;
            }
        }

        if live > max {
            for &pid in remaining.iter().skip(max) {
                if self.kill_duplicate(ctx, pid) {
                    live -= 1;
                }
            }
        }
        Ok(())
    }

    fn kill_duplicate(&mut self, ctx: &SupervisionContext, pid: u32) -> bool {
        let result = match self.position(pid) {
            Some(index) => {
                let result = self.processes[index].try_kill(ctx);
                if result.is_ok() {
                    let mut lifecycle = self.processes.remove(index);
                    lifecycle.close();
                }
                result
            }
            None => ctx.platform.kill(pid),
        };
        match result {
            Ok(()) => {
                self.report_kill(ctx, pid, KillReason::Duplicate);
                true
            }
            Err(err) => {
                self.report_kill_failed(ctx, pid, KillReason::Duplicate, &err);
                false
            }
        }
    }

    fn reconcile_non_responsive(&mut self, ctx: &SupervisionContext, now: Instant) -> Result<()> {
        let mut index = 0;
        while index < self.processes.len() {
            let lifecycle = &mut self.processes[index];
            let Some(pid) = lifecycle.pid() else {
                index += 1;
                continue;
            };
            if lifecycle.has_exited(ctx) || lifecycle.is_starting_at(now) {
                index += 1;
                continue;
            }
            let Some(reason) = kill_reason(&self.config, lifecycle, pid, ctx, now) else {
                index += 1;
                continue;
            };
            match lifecycle.try_kill(ctx) {
                Ok(()) => {
                    lifecycle.close();
                    self.report_kill(ctx, pid, reason);
                    if self.replace_or_drop(index, ctx, now)? {
                        index += 1;
                    }
                }
                Err(err) => {
                    self.report_kill_failed(ctx, pid, reason, &err);
                    index += 1;
                }
            }
        }
        Ok(())
    }

    fn reconcile_exited(&mut self, ctx: &SupervisionContext, now: Instant) -> Result<()> {
        let mut index = 0;
        while index < self.processes.len() {
            let lifecycle = &mut self.processes[index];
            if !lifecycle.has_exited(ctx) {
                index += 1;
                continue;
            }
            let pid = lifecycle.pid();
            lifecycle.close();
            let exit_code = lifecycle.exit_code();
            ctx.logger.send(ActivityEvent::ProcessExited {
                app: self.config.application_name.clone(),
                pid,
                exit_code,
            });
            ctx.events.emit(WatchdogEvent::ProcessExited {
                app_name: self.config.application_name.clone(),
                pid,
                exit_code,
            });
            if self.replace_or_drop(index, ctx, now)? {
                index += 1;
            }
        }
        Ok(())
    }

    fn reconcile_unmonitored(&mut self, ctx: &SupervisionContext, now: Instant) {
        let running = match self.running(ctx) {
            Ok(running) => running,
            Err(err) => {
                ctx.logger.error(&err);
                return;
            }
        };
        for info in running {
            if self.has_process(info.pid) {
                continue;
            }
            let mut lifecycle = ProcessLifecycle::for_app(&self.config);
            if lifecycle.adopt_at(&info, ctx, now) {
                self.processes.push(lifecycle);
            }
        }
    }

    fn ensure_running(&mut self, ctx: &SupervisionContext, now: Instant) -> Result<()> {
        if !self.running(ctx)?.is_empty() {
            return Ok(());
        }
        let mut lifecycle = ProcessLifecycle::for_app(&self.config);
        if lifecycle.launch_at(ctx, now) {
            self.processes.push(lifecycle);
        }
        Ok(())
    }

    /// Relaunch the closed lifecycle at `index` in place, or drop it.
    /// Returns `true` when the entry is still tracked.
    fn replace_or_drop(
        &mut self,
        index: usize,
        ctx: &SupervisionContext,
        now: Instant,
    ) -> Result<bool> {
        let running = match self.running(ctx) {
            Ok(running) => running.len(),
            Err(err) => {
                self.processes.remove(index);
                return Err(err);
            }
        };
        if self.needs_replacement(running) && self.processes[index].relaunch_at(ctx, now) {
            return Ok(true);
        }
        let mut lifecycle = self.processes.remove(index);
        lifecycle.close();
        Ok(false)
    }

    fn needs_replacement(&self, running: usize) -> bool {
        running < to_usize(self.config.min_processes)
            || (running < to_usize(self.config.max_processes)
                && self.config.keep_existing_no_processes)
    }

    fn position(&self, pid: u32) -> Option<usize> {
        self.processes
            .iter()
            .position(|lifecycle| lifecycle.pid() == Some(pid))
    }

    fn report_kill(&self, ctx: &SupervisionContext, pid: u32, reason: KillReason) {
        ctx.logger.send(ActivityEvent::ProcessKilled {
            app: self.config.application_name.clone(),
            pid,
            reason: reason.to_string(),
        });
        ctx.events.emit(WatchdogEvent::ProcessKilled {
            app_name: self.config.application_name.clone(),
            pid,
            reason,
        });
    }

    fn report_kill_failed(
        &self,
        ctx: &SupervisionContext,
        pid: u32,
        reason: KillReason,
        err: &WatchdogError,
    ) {
        ctx.logger.send(ActivityEvent::KillFailed {
            app: self.config.application_name.clone(),
            pid,
            reason: reason.to_string(),
            error: err.to_string(),
        });
    }
}

/// First applicable kill reason, in priority order. Also logs the heartbeat
/// soft limit, which never kills on its own.
fn kill_reason(
    config: &AppConfig,
    lifecycle: &mut ProcessLifecycle,
    pid: u32,
    ctx: &SupervisionContext,
    now: Instant,
) -> Option<KillReason> {
    let heartbeat = config.heartbeat_interval();
    if config.use_heartbeat && ctx.liveness.timed_out_at(pid, heartbeat / 2, now) {
        ctx.logger.send(ActivityEvent::HeartbeatSoftTimeout {
            app: config.application_name.clone(),
            pid,
        });
    }
    if lifecycle.not_responding_after_interval_at(ctx, now) {
        return Some(KillReason::NotResponding);
    }
    if config.use_heartbeat && ctx.liveness.timed_out_at(pid, heartbeat, now) {
        return Some(KillReason::HeartbeatTimeout);
    }
    // Checked last so a pending request is only consumed when it is honored.
    if config.grant_kill_request && ctx.liveness.kill_requested_at(pid, now) {
        return Some(KillReason::KillRequested);
    }
    None
}

fn to_usize(count: u32) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}
