//! PAL trait and platform-specific implementations.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, WatchdogError};

/// Kernel limit on `/proc/<pid>/stat` comm length (TASK_COMM_LEN - 1).
const COMM_MAX_LEN: usize = 15;

/// Snapshot of one OS process as seen by the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// False while the process is stopped, traced, or stuck in uninterruptible sleep.
    pub responding: bool,
}

/// What to start and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    #[must_use]
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Process name the OS reports for this executable.
    #[must_use]
    pub fn process_name(&self) -> String {
        process_name_for(&self.executable)
    }
}

/// A process started by [`Platform::launch`].
#[derive(Debug)]
pub struct LaunchedProcess {
    pub pid: u32,
    pub name: String,
    /// Owned child handle with piped stdout/stderr. `None` when the platform
    /// cannot hand one out (mock).
    pub child: Option<Child>,
}

/// OS abstraction used by the supervision engine.
pub trait Platform: Send + Sync {
    /// Live (non-zombie) processes whose OS name equals `name`, in pid order.
    fn processes_by_name(&self, name: &str) -> Result<Vec<ProcessInfo>>;

    /// Fresh state for one pid, `None` once it is gone.
    fn process_info(&self, pid: u32) -> Result<Option<ProcessInfo>>;

    /// Forcefully terminate `pid`.
    fn kill(&self, pid: u32) -> Result<()>;

    /// Start an executable with stdout/stderr captured and stdin closed.
    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess>;

    fn executable_exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Linux implementation on top of `/proc` and `kill(2)`.
#[derive(Debug, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn read_stat(pid: u32) -> Option<ProcStat> {
        let raw = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        parse_proc_stat(&raw)
    }

    /// Resolve a truncated comm against the full executable name.
    fn full_name_matches(pid: u32, name: &str) -> bool {
        if let Ok(target) = fs::read_link(format!("/proc/{pid}/exe"))
            && process_name_for(&target) == name
        {
            return true;
        }
        fs::read(format!("/proc/{pid}/cmdline")).is_ok_and(|raw| {
            raw.split(|byte| *byte == 0)
                .next()
                .map(|argv0| process_name_for(Path::new(&*String::from_utf8_lossy(argv0))))
                .is_some_and(|argv0| argv0 == name)
        })
    }
}

impl Platform for LinuxPlatform {
    fn processes_by_name(&self, name: &str) -> Result<Vec<ProcessInfo>> {
        let entries = fs::read_dir("/proc").map_err(|error| WatchdogError::ProcessEnumeration {
            name: name.to_string(),
            details: error.to_string(),
        })?;

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|raw| raw.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes routinely vanish between readdir and read.
            let Some(stat) = Self::read_stat(pid) else {
                continue;
            };
            if !stat.is_alive() {
                continue;
            }
            let matches = stat.comm == name
                || (name.len() > COMM_MAX_LEN
                    && name.is_char_boundary(COMM_MAX_LEN)
                    && stat.comm == name[..COMM_MAX_LEN]
                    && Self::full_name_matches(pid, name));
            if matches {
                found.push(ProcessInfo {
                    pid,
                    name: name.to_string(),
                    responding: stat.is_responding(),
                });
            }
        }
        found.sort_by_key(|info| info.pid);
        Ok(found)
    }

    fn process_info(&self, pid: u32) -> Result<Option<ProcessInfo>> {
        Ok(Self::read_stat(pid)
            .filter(ProcStat::is_alive)
            .map(|stat| ProcessInfo {
                pid,
                responding: stat.is_responding(),
                name: stat.comm,
            }))
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32) -> Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| WatchdogError::Kill {
            pid,
            details: "pid out of range".to_string(),
        })?;
        kill(Pid::from_raw(raw), Signal::SIGKILL).map_err(|errno| WatchdogError::Kill {
            pid,
            details: errno.to_string(),
        })
    }

    #[cfg(not(unix))]
    fn kill(&self, pid: u32) -> Result<()> {
        Err(WatchdogError::Kill {
            pid,
            details: "unsupported platform".to_string(),
        })
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess> {
        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        #[cfg(unix)]
        {
            // Own process group: terminal signals aimed at the daemon do not reach it.
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|error| WatchdogError::Launch {
            path: spec.executable.clone(),
            details: error.to_string(),
        })?;
        Ok(LaunchedProcess {
            pid: child.id(),
            name: spec.process_name(),
            child: Some(child),
        })
    }
}

/// Parsed subset of `/proc/<pid>/stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ProcStat {
    comm: String,
    state: char,
}

impl ProcStat {
    fn is_alive(&self) -> bool {
        !matches!(self.state, 'Z' | 'X' | 'x')
    }

    fn is_responding(&self) -> bool {
        !matches!(self.state, 'T' | 't' | 'D')
    }
}

/// comm may itself contain spaces and parentheses, so split on the last `)`.
fn parse_proc_stat(raw: &str) -> Option<ProcStat> {
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    if close <= open {
        return None;
    }
    let comm = raw[open + 1..close].to_string();
    let state = raw[close + 1..].trim_start().chars().next()?;
    Some(ProcStat { comm, state })
}

fn process_name_for(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug)]
struct MockState {
    processes: BTreeMap<u32, ProcessInfo>,
    next_pid: u32,
    unkillable: HashSet<u32>,
    missing_executables: HashSet<PathBuf>,
    failing_launches: HashSet<PathBuf>,
    enumeration_failures: HashSet<String>,
    launches: Vec<LaunchSpec>,
    kills: Vec<u32>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            processes: BTreeMap::new(),
            next_pid: 1_000,
            unkillable: HashSet::new(),
            missing_executables: HashSet::new(),
            failing_launches: HashSet::new(),
            enumeration_failures: HashSet::new(),
            launches: Vec::new(),
            kills: Vec::new(),
        }
    }
}

/// In-memory process table for deterministic tests.
///
/// Launches allocate pids from 1000 upward and register a responding process
/// named after the executable's file name.
#[derive(Debug, Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
}

impl MockPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an externally started process and return its pid.
    pub fn add_process(&self, name: &str) -> u32 {
        let mut state = self.state.lock();
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(
            pid,
            ProcessInfo {
                pid,
                name: name.to_string(),
                responding: true,
            },
        );
        pid
    }

    pub fn set_responding(&self, pid: u32, responding: bool) {
        if let Some(info) = self.state.lock().processes.get_mut(&pid) {
            info.responding = responding;
        }
    }

    /// Simulate the process exiting on its own.
    pub fn remove_process(&self, pid: u32) {
        self.state.lock().processes.remove(&pid);
    }

    pub fn set_unkillable(&self, pid: u32, unkillable: bool) {
        let mut state = self.state.lock();
        if unkillable {
            state.unkillable.insert(pid);
        } else {
            state.unkillable.remove(&pid);
        }
    }

    pub fn set_executable_missing(&self, path: impl Into<PathBuf>) {
        self.state.lock().missing_executables.insert(path.into());
    }

    pub fn set_launch_fails(&self, path: impl Into<PathBuf>) {
        self.state.lock().failing_launches.insert(path.into());
    }

    pub fn set_enumeration_fails(&self, name: &str) {
        self.state.lock().enumeration_failures.insert(name.to_string());
    }

    #[must_use]
    pub fn pids_named(&self, name: &str) -> Vec<u32> {
        self.state
            .lock()
            .processes
            .values()
            .filter(|info| info.name == name)
            .map(|info| info.pid)
            .collect()
    }

    #[must_use]
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state.lock().launches.clone()
    }

    /// Pids that received a successful kill, in order.
    #[must_use]
    pub fn kills(&self) -> Vec<u32> {
        self.state.lock().kills.clone()
    }
}

impl Platform for MockPlatform {
    fn processes_by_name(&self, name: &str) -> Result<Vec<ProcessInfo>> {
        let state = self.state.lock();
        if state.enumeration_failures.contains(name) {
            return Err(WatchdogError::ProcessEnumeration {
                name: name.to_string(),
                details: "mock enumeration failure".to_string(),
            });
        }
        Ok(state
            .processes
            .values()
            .filter(|info| info.name == name)
            .cloned()
            .collect())
    }

    fn process_info(&self, pid: u32) -> Result<Option<ProcessInfo>> {
        Ok(self.state.lock().processes.get(&pid).cloned())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        let mut state = self.state.lock();
        if state.unkillable.contains(&pid) {
            return Err(WatchdogError::Kill {
                pid,
                details: "operation not permitted".to_string(),
            });
        }
        if state.processes.remove(&pid).is_none() {
            return Err(WatchdogError::Kill {
                pid,
                details: "no such process".to_string(),
            });
        }
        state.kills.push(pid);
        Ok(())
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedProcess> {
        let mut state = self.state.lock();
        state.launches.push(spec.clone());
        if state.failing_launches.contains(&spec.executable) {
            return Err(WatchdogError::Launch {
                path: spec.executable.clone(),
                details: "mock launch failure".to_string(),
            });
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        let name = spec.process_name();
        state.processes.insert(
            pid,
            ProcessInfo {
                pid,
                name: name.clone(),
                responding: true,
            },
        );
        Ok(LaunchedProcess {
            pid,
            name,
            child: None,
        })
    }

    fn executable_exists(&self, path: &Path) -> bool {
        !self.state.lock().missing_executables.contains(path)
    }
}

/// Detect active platform implementation.
pub fn detect_platform() -> Result<Arc<dyn Platform>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxPlatform::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(WatchdogError::UnsupportedPlatform {
            details: "only Linux is currently implemented".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{LaunchSpec, MockPlatform, Platform, ProcStat, parse_proc_stat, process_name_for};
    use std::path::Path;

    #[test]
    fn parses_plain_stat_line() {
        let stat = parse_proc_stat("1234 (worker) S 1 1234 1234 0 -1 4194560").expect("parse");
        assert_eq!(
            stat,
            ProcStat {
                comm: "worker".to_string(),
                state: 'S'
            }
        );
        assert!(stat.is_alive());
        assert!(stat.is_responding());
    }

    #[test]
    fn parses_comm_with_parens_and_spaces() {
        let stat = parse_proc_stat("42 (my (odd) proc) T 1 42").expect("parse");
        assert_eq!(stat.comm, "my (odd) proc");
        assert_eq!(stat.state, 'T');
        assert!(!stat.is_responding());
    }

    #[test]
    fn zombie_is_not_alive() {
        let stat = parse_proc_stat("7 (gone) Z 1 7").expect("parse");
        assert!(!stat.is_alive());
    }

    #[test]
    fn uninterruptible_sleep_is_not_responding() {
        let stat = parse_proc_stat("7 (io) D 1 7").expect("parse");
        assert!(stat.is_alive());
        assert!(!stat.is_responding());
    }

    #[test]
    fn rejects_garbage_stat() {
        assert!(parse_proc_stat("").is_none());
        assert!(parse_proc_stat("12 no-parens R").is_none());
        assert!(parse_proc_stat("12 (trailing)").is_none());
    }

    #[test]
    fn process_name_is_file_name() {
        assert_eq!(process_name_for(Path::new("/opt/app/bin/worker")), "worker");
        assert_eq!(process_name_for(Path::new("/")), "");
    }

    #[test]
    fn mock_launch_registers_named_process() {
        let platform = MockPlatform::new();
        let launched = platform
            .launch(&LaunchSpec::new("/opt/bin/worker"))
            .expect("launch");
        assert_eq!(launched.name, "worker");
        assert!(launched.child.is_none());
        let found = platform.processes_by_name("worker").expect("enumerate");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pid, launched.pid);
    }

    #[test]
    fn mock_kill_respects_unkillable() {
        let platform = MockPlatform::new();
        let pid = platform.add_process("stubborn");
        platform.set_unkillable(pid, true);
        assert!(platform.kill(pid).is_err());
        assert!(platform.process_info(pid).expect("info").is_some());
        platform.set_unkillable(pid, false);
        assert!(platform.kill(pid).is_ok());
        assert!(platform.process_info(pid).expect("info").is_none());
        assert_eq!(platform.kills(), vec![pid]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_sees_current_process() {
        let platform = super::LinuxPlatform::new();
        let info = platform
            .process_info(std::process::id())
            .expect("read /proc")
            .expect("self must be alive");
        assert!(info.responding);
        let by_name = platform.processes_by_name(&info.name).expect("enumerate");
        assert!(by_name.iter().any(|p| p.pid == std::process::id()));
    }
}
