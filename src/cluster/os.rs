//! Thin abstraction over host process state.
//!
//! Supervision decisions (who to kill, when a reap means removal) are made
//! against [`ProcessControl`] so tests can fake pid lookups, signal delivery,
//! and reap races without spawning real children.

use crate::error::Result;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::path::Path;

/// Outcome of a non-blocking reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaped {
    /// A child changed state and was collected.
    Child(Pid, WaitStatus),
    /// Children exist but none was waitable.
    None,
    /// No such child (ECHILD): the pid is not ours to reap.
    NoChildren,
}

/// Host process operations the supervisor depends on.
pub trait ProcessControl: Send + Sync {
    /// This process's pid.
    fn pid(&self) -> Pid;

    /// Deliver a signal; errors (e.g. ESRCH racing an exit) are returned.
    fn kill(&self, pid: Pid, sig: Signal) -> Result<()>;

    /// Whether `pid` exists (signal 0 probe). True for processes we cannot
    /// signal ourselves but that are alive under another parent.
    fn alive(&self, pid: Pid) -> bool;

    /// Non-blocking reap of any child.
    fn try_reap_any(&self) -> Reaped;

    /// Non-blocking reap of a specific child.
    fn try_reap(&self, pid: Pid) -> Reaped;

    /// Change working directory.
    fn chdir(&self, dir: &Path) -> Result<()>;

    /// Set the process title, best effort.
    fn set_title(&self, title: &str);
}

/// The real host implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealProcess;

impl ProcessControl for RealProcess {
    fn pid(&self) -> Pid {
        nix::unistd::getpid()
    }

    fn kill(&self, pid: Pid, sig: Signal) -> Result<()> {
        signal::kill(pid, sig)?;
        Ok(())
    }

    fn alive(&self, pid: Pid) -> bool {
        // EPERM still means the process exists.
        match signal::kill(pid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn try_reap_any(&self) -> Reaped {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Reaped::None,
            Ok(status) => match status.pid() {
                Some(pid) => Reaped::Child(pid, status),
                None => Reaped::None,
            },
            Err(Errno::ECHILD) => Reaped::NoChildren,
            Err(_) => Reaped::None,
        }
    }

    fn try_reap(&self, pid: Pid) -> Reaped {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Reaped::None,
            Ok(status) => match status.pid() {
                Some(pid) => Reaped::Child(pid, status),
                None => Reaped::None,
            },
            Err(Errno::ECHILD) => Reaped::NoChildren,
            Err(_) => Reaped::None,
        }
    }

    fn chdir(&self, dir: &Path) -> Result<()> {
        nix::unistd::chdir(dir)?;
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn set_title(&self, title: &str) {
        // prctl truncates to 15 bytes; the leading "<name>: cluster" prefix
        // still distinguishes roles in ps output.
        if let Ok(name) = std::ffi::CString::new(title) {
            let _ = nix::sys::prctl::set_name(&name);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn set_title(&self, _title: &str) {}
}

#[cfg(test)]
pub(crate) mod fake {
    //! Recording fake for supervision-logic tests.

    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeProcess {
        pub self_pid: i32,
        /// Signals delivered, in order. `None` is the existence probe.
        pub sent: Mutex<Vec<(Pid, Option<Signal>)>>,
        /// Pids the existence probe reports alive.
        pub living: Mutex<HashSet<i32>>,
        /// Queue consumed by `try_reap_any`.
        pub reap_any: Mutex<VecDeque<Reaped>>,
        /// Per-pid answers for `try_reap`.
        pub reap_one: Mutex<HashMap<i32, Reaped>>,
    }

    impl FakeProcess {
        pub fn new() -> Self {
            Self {
                self_pid: 1000,
                ..Default::default()
            }
        }

        pub fn queue_reap(&self, pid: i32, status: WaitStatus) {
            self.reap_any
                .lock()
                .unwrap()
                .push_back(Reaped::Child(Pid::from_raw(pid), status));
        }

        pub fn signals_to(&self, pid: i32) -> Vec<Signal> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| p.as_raw() == pid)
                .filter_map(|(_, s)| *s)
                .collect()
        }
    }

    impl ProcessControl for FakeProcess {
        fn pid(&self) -> Pid {
            Pid::from_raw(self.self_pid)
        }

        fn kill(&self, pid: Pid, sig: Signal) -> Result<()> {
            self.sent.lock().unwrap().push((pid, Some(sig)));
            Ok(())
        }

        fn alive(&self, pid: Pid) -> bool {
            self.sent.lock().unwrap().push((pid, None));
            self.living.lock().unwrap().contains(&pid.as_raw())
        }

        fn try_reap_any(&self) -> Reaped {
            self.reap_any
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reaped::None)
        }

        fn try_reap(&self, pid: Pid) -> Reaped {
            self.reap_one
                .lock()
                .unwrap()
                .get(&pid.as_raw())
                .copied()
                .unwrap_or(Reaped::None)
        }

        fn chdir(&self, _dir: &Path) -> Result<()> {
            Ok(())
        }

        fn set_title(&self, _title: &str) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_process_pid() {
        let procs = RealProcess;
        assert_eq!(procs.pid().as_raw(), std::process::id() as i32);
    }

    #[test]
    fn test_alive_probe_on_self() {
        let procs = RealProcess;
        assert!(procs.alive(procs.pid()));
        // An implausible pid is not alive.
        assert!(!procs.alive(Pid::from_raw(i32::MAX - 1)));
    }

    #[test]
    fn test_reap_with_no_children() {
        // The test harness has no unwaited children of its own here; a
        // specific absent pid always reports ECHILD.
        let procs = RealProcess;
        assert_eq!(procs.try_reap(Pid::from_raw(i32::MAX - 1)), Reaped::NoChildren);
    }
}
