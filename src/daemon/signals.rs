//! Signal handling: SIGTERM/SIGINT shutdown, SIGHUP config reload, SIGUSR1
//! pause/resume toggle, plus the systemd watchdog heartbeat.
//!
//! The daemon loop polls the flags every iteration; nothing blocks on a signal.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

// ──────────────────── signal handler ────────────────────

/// Signal flags shared between the OS handlers and the daemon loop.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    reload_flag: Arc<AtomicBool>,
    pause_toggle_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Register OS signal hooks. Registration failures are reported on stderr
    /// and are not fatal.
    pub fn new() -> Self {
        let handler = Self::unregistered();
        handler.register_signals();
        handler
    }

    /// Flags only, without touching process-wide signal dispositions.
    pub fn unregistered() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            reload_flag: Arc::new(AtomicBool::new(false)),
            pause_toggle_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check and clear.
    pub fn should_reload(&self) -> bool {
        self.reload_flag.swap(false, Ordering::Relaxed)
    }

    /// Check and clear.
    pub fn should_toggle_pause(&self) -> bool {
        self.pause_toggle_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_pause_toggle(&self) {
        self.pause_toggle_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[WD-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[WD-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::{SIGHUP, SIGUSR1};
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.reload_flag)) {
                eprintln!("[WD-SIGNAL] failed to register SIGHUP: {e}");
            }
            if let Err(e) =
                signal_hook::flag::register(SIGUSR1, Arc::clone(&self.pause_toggle_flag))
            {
                eprintln!("[WD-SIGNAL] failed to register SIGUSR1: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────── shutdown sequence ────────────────────

/// Runs named teardown steps in order, giving up once `timeout` has passed.
pub struct ShutdownCoordinator {
    pub timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }

    /// Returns `true` if every step succeeded within the timeout.
    pub fn execute(&self, steps: &mut [(&str, &mut dyn FnMut() -> bool)]) -> bool {
        let start = Instant::now();
        let mut all_ok = true;

        for (name, step) in steps.iter_mut() {
            if start.elapsed() > self.timeout {
                eprintln!("[WD-SHUTDOWN] timeout reached, abandoning remaining steps");
                return false;
            }
            if step() {
                eprintln!("[WD-SHUTDOWN] {name}: ok");
            } else {
                eprintln!("[WD-SHUTDOWN] {name}: failed");
                all_ok = false;
            }
        }

        all_ok
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────── systemd watchdog ────────────────────

/// Sends `WATCHDOG=1` at half the configured `WatchdogSec`.
pub struct WatchdogHeartbeat {
    interval: Duration,
    last_beat: Instant,
    enabled: bool,
}

impl WatchdogHeartbeat {
    pub fn new(watchdog_sec: u64) -> Self {
        Self {
            interval: Duration::from_secs(watchdog_sec / 2),
            last_beat: Instant::now(),
            enabled: watchdog_sec > 0,
        }
    }

    pub fn disabled() -> Self {
        Self {
            interval: Duration::from_secs(30),
            last_beat: Instant::now(),
            enabled: false,
        }
    }

    /// Returns `true` if a notification was sent.
    pub fn maybe_notify(&mut self, status: &str) -> bool {
        if !self.enabled || self.last_beat.elapsed() < self.interval {
            return false;
        }
        self.last_beat = Instant::now();
        sd_notify(&format!("WATCHDOG=1\nSTATUS={status}\n"));
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Tell systemd the service finished starting.
pub fn notify_ready() {
    sd_notify("READY=1\n");
}

/// No-op unless `NOTIFY_SOCKET` is set.
fn sd_notify(message: &str) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::net::UnixDatagram;

        let socket_path = match std::env::var("NOTIFY_SOCKET") {
            Ok(p) if !p.is_empty() => p,
            _ => return,
        };
        let Ok(sock) = UnixDatagram::unbound() else {
            return;
        };
        let _ = sock.send_to(message.as_bytes(), &socket_path);
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        let handler = SignalHandler::unregistered();
        assert!(!handler.should_shutdown());
        assert!(!handler.should_reload());
        assert!(!handler.should_toggle_pause());
    }

    #[test]
    fn shutdown_is_sticky() {
        let handler = SignalHandler::unregistered();
        handler.request_shutdown();
        assert!(handler.should_shutdown());
        assert!(handler.should_shutdown());
    }

    #[test]
    fn reload_and_toggle_clear_on_read() {
        let handler = SignalHandler::unregistered();
        handler.request_reload();
        handler.request_pause_toggle();
        assert!(handler.should_reload());
        assert!(!handler.should_reload());
        assert!(handler.should_toggle_pause());
        assert!(!handler.should_toggle_pause());
    }

    #[test]
    fn clones_share_flags() {
        let handler = SignalHandler::unregistered();
        let other = handler.clone();
        handler.request_shutdown();
        assert!(other.should_shutdown());
    }

    #[test]
    fn coordinator_reports_failed_step() {
        let coord = ShutdownCoordinator::new();
        let mut ran = Vec::new();
        let mut first = || {
            ran.push("scheduler");
            true
        };
        let mut second = || false;
        let mut steps: Vec<(&str, &mut dyn FnMut() -> bool)> =
            vec![("scheduler", &mut first), ("logger", &mut second)];
        assert!(!coord.execute(&mut steps));
        drop(steps);
        assert_eq!(ran, vec!["scheduler"]);
    }

    #[test]
    fn disabled_watchdog_never_notifies() {
        let mut wd = WatchdogHeartbeat::disabled();
        assert!(!wd.is_enabled());
        assert!(!wd.maybe_notify("idle"));
    }

    #[test]
    fn watchdog_fires_after_interval() {
        let mut wd = WatchdogHeartbeat {
            interval: Duration::from_millis(1),
            last_beat: Instant::now() - Duration::from_secs(1),
            enabled: true,
        };
        assert!(wd.maybe_notify("running"));
        assert!(!WatchdogHeartbeat::new(120).maybe_notify("running"));
    }
}
