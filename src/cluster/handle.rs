//! Master-side record of one cluster member.

use crate::cluster::os::ProcessControl;
use crate::config::ClusterOptions;
use crate::error::Result;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::time::Instant;

/// Lifecycle stage of a cluster member. Transitions are monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Handle exists; the process may not even have a pid yet (mold spawn).
    Spawning,
    /// First BOOT message arrived.
    Booted,
    /// SIGTERM sent (or the worker reported one); kill timer armed.
    Termed,
    /// SIGKILL sent; only the reaper touches this handle now.
    Killed,
}

/// One live worker (or the mold) as the master sees it.
#[derive(Debug)]
pub struct WorkerHandle {
    index: usize,
    pid: Option<Pid>,
    phase: u64,
    stage: Stage,
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    last_checkin: Instant,
    last_checkin_utc: DateTime<Utc>,
    last_status: HashMap<String, u64>,
    term_sent_at: Option<Instant>,
}

impl WorkerHandle {
    /// New handle at spawn time. `pid` is `None` for mold-dispatched spawns
    /// until the FORK or BOOT message resolves it.
    pub fn new(index: usize, phase: u64, pid: Option<Pid>) -> Self {
        let now = Instant::now();
        let now_utc = Utc::now();
        Self {
            index,
            pid,
            phase,
            stage: Stage::Spawning,
            started_at: now,
            started_at_utc: now_utc,
            last_checkin: now,
            last_checkin_utc: now_utc,
            last_status: HashMap::new(),
            term_sent_at: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Resolve the pid reported by a FORK or BOOT message.
    pub fn set_pid(&mut self, pid: Pid) {
        self.pid = Some(pid);
    }

    pub fn phase(&self) -> u64 {
        self.phase
    }

    /// Stamp the handle into a newer code generation (refork victim).
    pub fn set_phase(&mut self, phase: u64) {
        self.phase = phase;
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn booted(&self) -> bool {
        self.stage >= Stage::Booted
    }

    pub fn termed(&self) -> bool {
        self.stage >= Stage::Termed
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn started_at_utc(&self) -> DateTime<Utc> {
        self.started_at_utc
    }

    pub fn last_checkin_utc(&self) -> DateTime<Utc> {
        self.last_checkin_utc
    }

    pub fn last_status(&self) -> &HashMap<String, u64> {
        &self.last_status
    }

    /// The worker's request counter from its latest ping.
    pub fn requests_count(&self) -> u64 {
        self.last_status
            .get("requests_count")
            .copied()
            .unwrap_or(0)
    }

    /// First BOOT message arrived: Spawning → Booted, check-in clock starts.
    pub fn boot(&mut self) {
        if self.stage == Stage::Spawning {
            self.stage = Stage::Booted;
        }
        self.touch_checkin();
    }

    /// Record a PING payload.
    pub fn ping(&mut self, payload: &str) -> Result<()> {
        self.last_status = serde_json::from_str(payload)?;
        self.touch_checkin();
        Ok(())
    }

    fn touch_checkin(&mut self) {
        self.last_checkin = Instant::now();
        self.last_checkin_utc = Utc::now();
    }

    /// Send SIGTERM unless already terming; arms the kill timer either way.
    pub fn term<P: ProcessControl + ?Sized>(&mut self, procs: &P) {
        if self.stage < Stage::Termed {
            if let Some(pid) = self.pid {
                // ESRCH here just means the worker beat us to the exit.
                let _ = procs.kill(pid, Signal::SIGTERM);
            }
            self.stage = Stage::Termed;
        }
        if self.term_sent_at.is_none() {
            self.term_sent_at = Some(Instant::now());
        }
    }

    /// Mark Termed without signalling (the worker reported its own SIGTERM).
    pub fn term_without_signal(&mut self) {
        if self.stage < Stage::Termed {
            self.stage = Stage::Termed;
        }
        if self.term_sent_at.is_none() {
            self.term_sent_at = Some(Instant::now());
        }
    }

    /// Send SIGKILL and mark Killed.
    pub fn kill<P: ProcessControl + ?Sized>(&mut self, procs: &P) {
        if let Some(pid) = self.pid {
            let _ = procs.kill(pid, Signal::SIGKILL);
        }
        self.stage = Stage::Killed;
    }

    /// Send SIGHUP (log-rotation fanout).
    pub fn hup<P: ProcessControl + ?Sized>(&self, procs: &P) {
        if let Some(pid) = self.pid {
            let _ = procs.kill(pid, Signal::SIGHUP);
        }
    }

    /// Promote to mold: deliver SIGURG.
    pub fn promote<P: ProcessControl + ?Sized>(&mut self, procs: &P) -> Result<()> {
        let Some(pid) = self.pid else {
            return Err(crate::error::StampedeError::Worker(format!(
                "worker {} has no pid to promote",
                self.index
            )));
        };
        procs.kill(pid, Signal::SIGURG)?;
        Ok(())
    }

    /// Deadline after which this member counts as unresponsive: boot window
    /// while Spawning, check-in window once Booted.
    pub fn ping_timeout(&self, options: &ClusterOptions) -> Instant {
        if self.booted() {
            self.last_checkin + options.worker_timeout
        } else {
            self.started_at + options.worker_boot_timeout
        }
    }

    /// Deadline after which a termed member is force-killed, if armed.
    pub fn kill_deadline(&self, options: &ClusterOptions) -> Option<Instant> {
        self.term_sent_at
            .map(|at| at + options.worker_shutdown_timeout)
    }
}

#[cfg(test)]
impl WorkerHandle {
    pub(crate) fn backdate_start(&mut self, by: std::time::Duration) {
        self.started_at = self.started_at.checked_sub(by).unwrap_or(self.started_at);
    }

    pub(crate) fn backdate_checkin(&mut self, by: std::time::Duration) {
        self.last_checkin = self.last_checkin.checked_sub(by).unwrap_or(self.last_checkin);
    }

    pub(crate) fn backdate_term(&mut self, by: std::time::Duration) {
        self.term_sent_at = self.term_sent_at.map(|t| t.checked_sub(by).unwrap_or(t));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::os::fake::FakeProcess;
    use std::time::Duration;

    fn handle(pid: i32) -> WorkerHandle {
        WorkerHandle::new(1, 0, Some(Pid::from_raw(pid)))
    }

    #[test]
    fn test_stage_transitions_are_monotone() {
        let procs = FakeProcess::new();
        let mut w = handle(50);
        assert_eq!(w.stage(), Stage::Spawning);

        w.boot();
        assert_eq!(w.stage(), Stage::Booted);

        // A late boot never downgrades.
        w.term(&procs);
        assert_eq!(w.stage(), Stage::Termed);
        w.boot();
        assert_eq!(w.stage(), Stage::Termed);

        w.kill(&procs);
        assert_eq!(w.stage(), Stage::Killed);
        assert_eq!(procs.signals_to(50), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[test]
    fn test_term_signals_once() {
        let procs = FakeProcess::new();
        let mut w = handle(51);
        w.term(&procs);
        w.term(&procs);
        assert_eq!(procs.signals_to(51), vec![Signal::SIGTERM]);
    }

    #[test]
    fn test_term_without_signal_is_silent() {
        let procs = FakeProcess::new();
        let mut w = handle(52);
        w.term_without_signal();
        assert!(w.termed());
        assert!(procs.signals_to(52).is_empty());
        // A later term() sees the stage and stays silent too.
        w.term(&procs);
        assert!(procs.signals_to(52).is_empty());
    }

    #[test]
    fn test_ping_updates_status_and_checkin() {
        let mut w = handle(53);
        let before = w.last_checkin;
        w.ping(r#"{"requests_count":7,"backlog":1}"#).unwrap();
        assert_eq!(w.requests_count(), 7);
        assert_eq!(w.last_status().get("backlog"), Some(&1));
        assert!(w.last_checkin >= before);

        assert!(w.ping("not json").is_err());
    }

    #[test]
    fn test_ping_timeout_uses_boot_window_until_booted() {
        let options = ClusterOptions {
            worker_timeout: Duration::from_secs(60),
            worker_boot_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let mut w = handle(54);
        let boot_deadline = w.ping_timeout(&options);
        assert!(boot_deadline <= w.started_at() + Duration::from_secs(10));

        w.boot();
        let checkin_deadline = w.ping_timeout(&options);
        assert!(checkin_deadline >= boot_deadline);
    }

    #[test]
    fn test_kill_deadline_armed_by_term() {
        let procs = FakeProcess::new();
        let options = ClusterOptions::default();
        let mut w = handle(55);
        assert!(w.kill_deadline(&options).is_none());
        w.term(&procs);
        assert!(w.kill_deadline(&options).is_some());
    }

    #[test]
    fn test_promote_requires_pid() {
        let procs = FakeProcess::new();
        let mut w = WorkerHandle::new(2, 0, None);
        assert!(w.promote(&procs).is_err());

        w.set_pid(Pid::from_raw(56));
        w.promote(&procs).unwrap();
        assert_eq!(procs.signals_to(56), vec![Signal::SIGURG]);
    }

    #[test]
    fn test_hup_fanout() {
        let procs = FakeProcess::new();
        let w = handle(57);
        w.hup(&procs);
        assert_eq!(procs.signals_to(57), vec![Signal::SIGHUP]);
    }
}
