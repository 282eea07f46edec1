//! The master process.
//!
//! Single-threaded and cooperative: one loop alternates between a health
//! sweep over the worker pool and a `poll` on the status and wakeup pipes.
//! Signal handlers never touch this state; they forward a code byte through
//! the wakeup pipe and the loop acts on it here.

use crate::cluster::handle::{Stage, WorkerHandle};
use crate::cluster::ipc::{self, MessageReader};
use crate::cluster::os::{ProcessControl, RealProcess, Reaped};
use crate::cluster::protocol::{ForkCommand, Message};
use crate::cluster::signals::{self, SignalEvent};
use crate::cluster::stats::{ClusterStats, WorkerStatus};
use crate::cluster::worker::{Worker, WorkerPipes};
use crate::config::{ClusterOptions, CullingStrategy};
use crate::engine::EngineFactory;
use crate::error::{Result, StampedeError};
use crate::hooks::{HookPoint, Hooks};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Pid, fork};
use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Master run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Run,
    /// Graceful stop: workers drain, then the master exits.
    Stop,
    /// Abandon waiting and force-kill whatever remains.
    Halt,
}

/// Which flavour of rolling restart is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    /// Replace every worker with a freshly forked one.
    Normal,
    /// Preserve one worker as the mold and refill the pool through it.
    Refork,
}

/// Locates a member across the two containers.
#[derive(Debug, Clone, Copy)]
enum Member {
    Worker(usize),
    Mold,
}

/// Master-held ends of the cluster pipes plus the set inherited by workers.
struct MasterPipes {
    reader: MessageReader,
    status_r: Arc<OwnedFd>,
    wake_r: Arc<OwnedFd>,
    wake_w: Arc<OwnedFd>,
    suicide_w: Arc<OwnedFd>,
    fork_w: Option<Arc<OwnedFd>>,
    worker: WorkerPipes,
}

impl MasterPipes {
    /// Close master-only descriptors in a freshly forked child.
    ///
    /// Closed by raw fd: the owning `OwnedFd`s are never dropped in the
    /// child (it leaves through `process::exit`), so no double-close occurs.
    /// Dropping the inherited `suicide_w` copy is what makes parent-death
    /// detection work at all; dropping `fork_w` keeps the mold's EOF sharp.
    fn close_master_ends(&self) {
        for fd in [&self.status_r, &self.wake_r, &self.wake_w, &self.suicide_w] {
            ipc::close_raw(fd.as_raw_fd());
        }
        if let Some(fd) = &self.fork_w {
            ipc::close_raw(fd.as_raw_fd());
        }
    }
}

/// The cluster master: spawns workers, supervises them, and orchestrates
/// restarts.
pub struct Supervisor<P: ProcessControl = RealProcess> {
    options: Arc<ClusterOptions>,
    hooks: Arc<Hooks>,
    factory: EngineFactory,
    procs: P,
    master_pid: Pid,
    phase: u64,
    status: RunStatus,
    worker_count: usize,
    workers: Vec<WorkerHandle>,
    mold: Option<WorkerHandle>,
    phased_restart: Option<RestartKind>,
    restart_in_progress: Option<RestartKind>,
    workers_not_booted: usize,
    booted_fired: bool,
    idle_workers: HashSet<Pid>,
    all_idle_since: Option<Instant>,
    next_check: Instant,
    started_at_utc: DateTime<Utc>,
    hook_data: HashMap<String, String>,
    pipes: Option<MasterPipes>,
}

impl Supervisor<RealProcess> {
    /// Build a supervisor over the real host process.
    pub fn new(options: ClusterOptions, factory: EngineFactory) -> Result<Self> {
        Self::with_process_control(options, factory, RealProcess)
    }
}

impl<P: ProcessControl> Supervisor<P> {
    /// Build with an explicit process-control backend (fakeable in tests).
    pub fn with_process_control(
        options: ClusterOptions,
        factory: EngineFactory,
        procs: P,
    ) -> Result<Self> {
        options.validate()?;
        let master_pid = procs.pid();
        let worker_count = options.workers;
        Ok(Self {
            options: Arc::new(options),
            hooks: Arc::new(Hooks::default()),
            factory,
            procs,
            master_pid,
            phase: 0,
            status: RunStatus::Run,
            worker_count,
            workers: Vec::new(),
            mold: None,
            phased_restart: None,
            restart_in_progress: None,
            workers_not_booted: 0,
            booted_fired: false,
            idle_workers: HashSet::new(),
            all_idle_since: None,
            next_check: Instant::now(),
            started_at_utc: Utc::now(),
            hook_data: HashMap::new(),
            pipes: None,
        })
    }

    /// Attach user hooks.
    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Request a phased restart from the embedding application.
    pub fn phased_restart(&mut self, kind: RestartKind) {
        self.phased_restart = Some(kind);
        self.wakeup();
    }

    /// Begin a graceful stop.
    pub fn stop(&mut self) {
        self.status = RunStatus::Stop;
        self.wakeup();
    }

    /// Abandon waiting for workers and force-kill.
    pub fn halt(&mut self) {
        self.status = RunStatus::Halt;
        self.wakeup();
    }

    /// SIGHUP every worker (log-rotation fanout).
    pub fn hup_workers(&mut self) {
        for w in self.workers.iter().chain(self.mold.iter()) {
            w.hup(&self.procs);
        }
    }

    /// Write a wakeup byte so a blocked master loop re-runs promptly.
    pub fn wakeup(&self) {
        if let Some(pipes) = &self.pipes {
            let _ = ipc::write_fd(&pipes.wake_w, &[Message::WAKEUP_BYTE]);
        }
    }

    /// Run the master loop to completion. Returns the process exit code.
    pub fn run(&mut self) -> Result<i32> {
        if self.worker_count == 1 && !self.options.silence_single_worker_warning {
            tracing::warn!(
                "cluster mode with a single worker; raise workers or set \
                 silence_single_worker_warning"
            );
        }
        signals::ignore_sigpipe();
        self.setup_pipes()?;

        let wake_fd = self
            .pipes
            .as_ref()
            .map(|p| p.wake_w.as_raw_fd())
            .ok_or_else(|| StampedeError::Worker("master pipes not initialized".to_string()))?;
        let mut master_signals = vec![
            Signal::SIGINT,
            Signal::SIGTERM,
            Signal::SIGCHLD,
            Signal::SIGTTIN,
            Signal::SIGTTOU,
            Signal::SIGUSR1,
        ];
        if self.options.fork_worker.enabled() {
            master_signals.push(Signal::SIGURG);
        }
        signals::install_forwarding(wake_fd, &master_signals)?;

        let mut title = format!("{}: cluster master: {}", self.options.name, self.master_pid);
        if !self.options.tag.is_empty() {
            title.push_str(&format!(" [{}]", self.options.tag));
        }
        self.procs.set_title(&title);

        tracing::info!(
            pid = %self.master_pid,
            workers = self.worker_count,
            "starting cluster"
        );
        if self.options.preload_app {
            self.hooks
                .fire(HookPoint::BeforeFork, 0, &mut self.hook_data);
        }
        self.workers_not_booted = self.worker_count;
        self.next_check = Instant::now();

        while self.status == RunStatus::Run {
            let now = Instant::now();
            if self.idle_shutdown_due(now) {
                tracing::info!("all workers idle past the timeout; stopping");
                self.status = RunStatus::Stop;
                break;
            }
            if let Some(kind) = self.phased_restart.take() {
                self.begin_phased_restart(kind);
            }
            self.check_workers();
            self.wait_and_dispatch()?;
            self.finish_restart_if_done();
        }

        self.stop_workers();
        self.hooks.fire_event(&self.hooks.on_stopped);
        tracing::info!("cluster stopped");
        Ok(0)
    }

    /// Aggregated cluster view. From a forked child the per-worker slice is
    /// empty; that bookkeeping lives only in the master.
    pub fn stats(&self) -> ClusterStats {
        let in_master = self.procs.pid() == self.master_pid;
        let worker_status = if in_master {
            self.workers.iter().map(WorkerStatus::from_handle).collect()
        } else {
            Vec::new()
        };
        ClusterStats {
            started_at: self.started_at_utc,
            workers: self.worker_count,
            phase: self.phase,
            booted_workers: self.workers.iter().filter(|w| w.booted()).count(),
            old_workers: self
                .workers
                .iter()
                .filter(|w| w.phase() != self.phase)
                .count(),
            worker_status,
        }
    }

    fn setup_pipes(&mut self) -> Result<()> {
        let (status_r, status_w) = ipc::pipe_nonblocking()?;
        let (check_r, suicide_w) = ipc::pipe()?;
        let (wake_r, wake_w) = ipc::pipe_nonblocking()?;
        let (fork_r, fork_w) = if self.options.fork_worker.enabled() {
            let (r, w) = ipc::pipe()?;
            (Some(Arc::new(r)), Some(Arc::new(w)))
        } else {
            (None, None)
        };
        let status_r = Arc::new(status_r);
        self.pipes = Some(MasterPipes {
            reader: MessageReader::new(status_r.clone()),
            status_r,
            wake_r: Arc::new(wake_r),
            wake_w: Arc::new(wake_w),
            suicide_w: Arc::new(suicide_w),
            fork_w,
            worker: WorkerPipes {
                status: Arc::new(status_w),
                check: Arc::new(check_r),
                fork: fork_r,
            },
        });
        Ok(())
    }

    /// Health sweep: timeouts, reaping, culling, promotion, spawning, and
    /// the phased-upgrade step, gated on the check interval.
    fn check_workers(&mut self) {
        let now = Instant::now();
        if now < self.next_check {
            return;
        }
        self.next_check = now + self.options.worker_check_interval;
        self.timeout_workers(now);
        self.wait_workers();
        self.cull_workers();
        if self.options.fork_worker.enabled() {
            self.promote_mold();
        }
        self.spawn_workers();
        self.phased_upgrade();
    }

    /// Kill members that missed their boot or check-in deadline, and
    /// escalate termed members that outstayed the shutdown window.
    fn timeout_workers(&mut self, now: Instant) {
        for w in self.workers.iter_mut().chain(self.mold.iter_mut()) {
            if w.stage() >= Stage::Termed {
                if w.stage() == Stage::Termed
                    && w.kill_deadline(&self.options).is_some_and(|d| d <= now)
                {
                    tracing::warn!(
                        index = w.index(),
                        pid = ?w.pid().map(Pid::as_raw),
                        "termed worker did not exit within {}s; sending SIGKILL",
                        self.options.worker_shutdown_timeout.as_secs()
                    );
                    w.kill(&self.procs);
                }
                continue;
            }
            if w.ping_timeout(&self.options) <= now {
                if w.booted() {
                    tracing::warn!(
                        index = w.index(),
                        pid = ?w.pid().map(Pid::as_raw),
                        "terminating timed out worker (worker {} failed to check in within {} \
                         seconds)",
                        w.index(),
                        self.options.worker_timeout.as_secs()
                    );
                } else {
                    tracing::warn!(
                        index = w.index(),
                        pid = ?w.pid().map(Pid::as_raw),
                        "terminating timed out worker (worker {} failed to boot within {} \
                         seconds)",
                        w.index(),
                        self.options.worker_boot_timeout.as_secs()
                    );
                }
                w.kill(&self.procs);
            }
        }
    }

    /// Non-blocking reap of all children; removes matching handles and logs
    /// strays (PID-1 adoption). Handles whose pid answers ECHILD but still
    /// exists under another parent are kept.
    fn wait_workers(&mut self) {
        let mut reaped: Vec<(Pid, nix::sys::wait::WaitStatus)> = Vec::new();
        loop {
            match self.procs.try_reap_any() {
                Reaped::Child(pid, status) => reaped.push((pid, status)),
                Reaped::None | Reaped::NoChildren => break,
            }
        }
        for (pid, status) in &reaped {
            if self.member_by_pid(*pid).is_none() {
                tracing::warn!(pid = %pid, status = ?status, "reaped unknown child process");
            }
        }
        let reaped_pids: HashSet<i32> = reaped.iter().map(|(p, _)| p.as_raw()).collect();

        let mut i = 0;
        while i < self.workers.len() {
            if self.gone(&self.workers[i], &reaped_pids) {
                let w = self.workers.remove(i);
                if let Some(pid) = w.pid() {
                    self.idle_workers.remove(&pid);
                }
                tracing::info!(
                    index = w.index(),
                    pid = ?w.pid().map(Pid::as_raw),
                    "worker exited"
                );
            } else {
                i += 1;
            }
        }
        let mold_gone = self
            .mold
            .as_ref()
            .is_some_and(|m| self.gone(m, &reaped_pids));
        if mold_gone && let Some(m) = self.mold.take() {
            if let Some(pid) = m.pid() {
                self.idle_workers.remove(&pid);
            }
            tracing::info!(index = m.index(), "mold exited");
        }
    }

    fn gone(&self, w: &WorkerHandle, reaped: &HashSet<i32>) -> bool {
        let Some(pid) = w.pid() else {
            return false; // spawn still in flight, the boot timeout covers it
        };
        if reaped.contains(&pid.as_raw()) {
            return true;
        }
        match self.procs.try_reap(pid) {
            Reaped::Child(_, _) => true,
            Reaped::None => false,
            // ECHILD: reparented or raced away. Keep the handle while the
            // process still exists; its Termed state stays honoured.
            Reaped::NoChildren => !self.procs.alive(pid),
        }
    }

    /// How many serving workers the pool should hold right now. A live mold
    /// occupies one of the configured slots.
    fn pool_target(&self) -> usize {
        let mold_live = self.mold.as_ref().is_some_and(|m| !m.termed());
        self.worker_count
            .saturating_sub(mold_live as usize)
            .max(1)
    }

    /// Terminate surplus workers per the culling strategy. Worker 0 is
    /// never culled in fork-worker mode.
    fn cull_workers(&mut self) {
        let excess = self.workers.len().saturating_sub(self.pool_target());
        if excess == 0 {
            return;
        }
        let protect_zero = self.options.fork_worker.enabled();
        let mut order: Vec<usize> = (0..self.workers.len())
            .filter(|&i| !(protect_zero && self.workers[i].index() == 0))
            .collect();
        order.sort_by_key(|&i| self.workers[i].started_at());
        let victims: Vec<usize> = match self.options.worker_culling_strategy {
            CullingStrategy::Oldest => order.iter().copied().take(excess).collect(),
            CullingStrategy::Youngest => order.iter().rev().copied().take(excess).collect(),
        };
        for i in victims {
            tracing::info!(
                index = self.workers[i].index(),
                pid = ?self.workers[i].pid().map(Pid::as_raw),
                "culling worker"
            );
            self.workers[i].term(&self.procs);
        }
    }

    /// Promote the busiest current-phase worker to mold when spawns are
    /// pending (or a refork is in flight) and no mold is alive. A termed
    /// mold stays in its slot until the reaper clears it; the kill timer
    /// escalates a stuck one.
    fn promote_mold(&mut self) {
        if self.mold.is_some() {
            return;
        }
        let reforking = self.restart_in_progress == Some(RestartKind::Refork);
        if !reforking && self.workers.len() >= self.pool_target() {
            return;
        }
        let phase = self.phase;
        let Some(pos) = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| {
                w.booted() && !w.termed() && w.phase() == phase && w.pid().is_some()
            })
            .max_by_key(|(_, w)| w.requests_count())
            .map(|(i, _)| i)
        else {
            return;
        };
        let mut w = self.workers.remove(pos);
        tracing::info!(
            index = w.index(),
            pid = ?w.pid().map(Pid::as_raw),
            "promoting worker to mold"
        );
        match w.promote(&self.procs) {
            Ok(()) => {
                self.send_fork_command(&ForkCommand::BeginRefork);
                self.mold = Some(w);
            }
            Err(e) => {
                tracing::warn!(error = %e, index = w.index(), "mold promotion failed");
                self.workers.insert(pos, w);
            }
        }
    }

    /// Fill missing slots: through the mold when one is healthy, by direct
    /// fork otherwise.
    fn spawn_workers(&mut self) {
        while self.workers.len() < self.pool_target() {
            let index = self.next_worker_index();
            let phase = self.phase;
            if self.mold_available() && self.send_fork_command(&ForkCommand::Spawn(index)) {
                tracing::debug!(index, "requested worker from mold");
                self.workers.push(WorkerHandle::new(index, phase, None));
                continue;
            }
            match self.spawn_direct(index) {
                Ok(pid) => {
                    self.workers.push(WorkerHandle::new(index, phase, Some(pid)));
                }
                Err(e) => {
                    tracing::error!(error = %e, index, "failed to spawn worker");
                    break;
                }
            }
        }
    }

    fn mold_available(&self) -> bool {
        self.mold
            .as_ref()
            .is_some_and(|m| !m.termed() && m.pid().is_some())
    }

    fn send_fork_command(&self, cmd: &ForkCommand) -> bool {
        let Some(fork_w) = self.pipes.as_ref().and_then(|p| p.fork_w.as_ref()) else {
            return false;
        };
        match ipc::write_fd(fork_w, cmd.encode().as_bytes()) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "fork pipe write failed");
                false
            }
        }
    }

    /// Lowest index unused by any live worker or the mold.
    fn next_worker_index(&self) -> usize {
        let used: HashSet<usize> = self
            .workers
            .iter()
            .map(WorkerHandle::index)
            .chain(self.mold.iter().map(WorkerHandle::index))
            .collect();
        let mut index = 0;
        while used.contains(&index) {
            index += 1;
        }
        index
    }

    fn spawn_direct(&mut self, index: usize) -> Result<Pid> {
        self.hooks
            .fire(HookPoint::BeforeWorkerFork, index, &mut self.hook_data);
        let pipes = self
            .pipes
            .as_ref()
            .ok_or_else(|| StampedeError::Worker("master pipes not initialized".to_string()))?;
        match unsafe { fork() }? {
            ForkResult::Child => {
                let worker_pipes = pipes.worker.clone();
                pipes.close_master_ends();
                let worker = Worker::new(
                    index,
                    self.master_pid,
                    worker_pipes,
                    self.options.clone(),
                    self.hooks.clone(),
                    self.factory.clone(),
                );
                std::process::exit(worker.run());
            }
            ForkResult::Parent { child } => {
                self.hooks
                    .fire(HookPoint::AfterWorkerFork, index, &mut self.hook_data);
                tracing::debug!(index, pid = %child, "spawned worker");
                Ok(child)
            }
        }
    }

    /// Once every worker is booted, retire one old-phase worker per sweep.
    fn phased_upgrade(&mut self) {
        if self.workers.is_empty() || !self.workers.iter().all(WorkerHandle::booted) {
            return;
        }
        let protect_zero = self.options.fork_worker.enabled();
        let phase = self.phase;
        if let Some(w) = self
            .workers
            .iter_mut()
            .find(|w| w.phase() != phase && !(protect_zero && w.index() == 0))
            && !w.termed()
        {
            tracing::info!(
                index = w.index(),
                pid = ?w.pid().map(Pid::as_raw),
                "stopping worker for phased upgrade"
            );
            w.term(&self.procs);
        }
    }

    /// Block on the status and wakeup pipes until the next deadline, then
    /// dispatch everything that arrived.
    fn wait_and_dispatch(&mut self) -> Result<()> {
        let now = Instant::now();
        let mut deadline = self.next_check;
        for w in self.workers.iter().chain(self.mold.iter()) {
            if !w.termed() {
                deadline = deadline.min(w.ping_timeout(&self.options));
            }
        }
        let timeout_ms = deadline
            .saturating_duration_since(now)
            .as_millis()
            .min(u128::from(u16::MAX)) as u16;

        let (codes, messages) = {
            let pipes = self
                .pipes
                .as_mut()
                .ok_or_else(|| StampedeError::Worker("master pipes not initialized".to_string()))?;
            let mut fds = [
                PollFd::new(pipes.status_r.as_fd(), PollFlags::POLLIN),
                PollFd::new(pipes.wake_r.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(timeout_ms)) {
                Ok(_) => {}
                Err(Errno::EINTR) => {} // the handler's wakeup byte is pending
                Err(e) => return Err(e.into()),
            }
            let codes = drain_bytes(&pipes.wake_r)?;
            let messages = pipes.reader.drain()?;
            (codes, messages)
        };

        for code in codes {
            if let Some(event) = signals::event_for(code) {
                self.handle_signal(event);
            }
        }
        for msg in messages {
            self.handle_message(msg);
        }
        Ok(())
    }

    fn handle_signal(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::Wake | SignalEvent::ChildExited => {
                self.next_check = Instant::now();
            }
            SignalEvent::Stop => {
                if self.status == RunStatus::Run {
                    tracing::info!("interrupt received; stopping gracefully");
                    self.status = RunStatus::Stop;
                } else {
                    tracing::warn!("interrupt received again; halting");
                    self.status = RunStatus::Halt;
                }
            }
            SignalEvent::Term => {
                if self.status == RunStatus::Run {
                    tracing::info!("SIGTERM received; stopping gracefully");
                    self.status = RunStatus::Stop;
                }
            }
            SignalEvent::WorkerAdd => {
                self.worker_count += 1;
                tracing::info!(workers = self.worker_count, "worker count raised");
                self.next_check = Instant::now();
            }
            SignalEvent::WorkerRemove => {
                if self.worker_count > 1 {
                    self.worker_count -= 1;
                    tracing::info!(workers = self.worker_count, "worker count lowered");
                }
                self.next_check = Instant::now();
            }
            SignalEvent::Refork => {
                tracing::info!("refork requested");
                self.trigger_refork();
            }
            SignalEvent::PhasedRestart => {
                if self.phased_restart.is_none() && self.restart_in_progress.is_none() {
                    tracing::info!("phased restart requested");
                    self.phased_restart = Some(RestartKind::Normal);
                }
                self.next_check = Instant::now();
            }
        }
    }

    fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::Wakeup => {
                self.next_check = Instant::now();
            }
            Message::Boot { pid, index } => self.handle_boot(pid, index),
            Message::Fork { pid, index } => {
                let Some(i) = self.workers.iter().position(|w| w.index() == index) else {
                    tracing::warn!(index, pid = %pid, "fork report for unknown worker index");
                    return;
                };
                if self.workers[i].pid().is_none() {
                    self.workers[i].set_pid(pid);
                }
                tracing::debug!(index, pid = %pid, "mold reported fork");
            }
            Message::Ping { pid, payload } => self.handle_ping(pid, &payload),
            Message::ExternalTerm { pid } => {
                if let Some(loc) = self.member_by_pid(pid) {
                    tracing::info!(pid = %pid, "worker received external SIGTERM");
                    match loc {
                        Member::Worker(i) => self.workers[i].term_without_signal(),
                        Member::Mold => {
                            if let Some(m) = &mut self.mold {
                                m.term_without_signal();
                            }
                        }
                    }
                }
            }
            Message::Term { pid } => {
                if let Some(loc) = self.member_by_pid(pid) {
                    match loc {
                        Member::Worker(i) => {
                            if !self.workers[i].termed() {
                                self.workers[i].term(&self.procs);
                            }
                        }
                        Member::Mold => {
                            if let Some(m) = &mut self.mold
                                && !m.termed()
                            {
                                m.term(&self.procs);
                            }
                        }
                    }
                    self.next_check = Instant::now();
                }
            }
            Message::Idle { pid } => {
                if !self.idle_workers.remove(&pid) {
                    self.idle_workers.insert(pid);
                }
            }
        }
    }

    fn handle_boot(&mut self, pid: Pid, index: usize) {
        let Some(i) = self.workers.iter().position(|w| w.index() == index) else {
            tracing::warn!(index, pid = %pid, "boot from unknown worker index");
            return;
        };
        let w = &mut self.workers[i];
        if w.pid().is_none() {
            w.set_pid(pid);
        }
        if w.pid() != Some(pid) {
            tracing::warn!(index, pid = %pid, "boot message pid mismatch; ignoring");
            return;
        }
        let elapsed = w.started_at().elapsed();
        w.boot();
        tracing::info!(
            index,
            pid = %pid,
            "worker booted in {:.2}s",
            elapsed.as_secs_f64()
        );
        self.workers_not_booted = self.workers_not_booted.saturating_sub(1);
        self.next_check = Instant::now();
    }

    fn handle_ping(&mut self, pid: Pid, payload: &str) {
        let threshold = self.options.fork_worker.threshold();
        let mut refork_due = false;
        match self.member_by_pid(pid) {
            Some(loc) => {
                let w = match loc {
                    Member::Worker(i) => &mut self.workers[i],
                    Member::Mold => match self.mold.as_mut() {
                        Some(m) => m,
                        None => return,
                    },
                };
                if let Err(e) = w.ping(payload) {
                    tracing::warn!(pid = %pid, error = %e, "unparseable ping payload");
                    return;
                }
                if let Some(threshold) = threshold
                    && w.index() == 0
                    && w.phase() == 0
                    && w.requests_count() >= threshold
                {
                    refork_due = true;
                }
            }
            None => {
                tracing::debug!(pid = %pid, "ping from unknown process");
                return;
            }
        }
        if refork_due && self.phased_restart.is_none() && self.restart_in_progress.is_none() {
            tracing::info!("worker 0 reached the refork threshold");
            self.trigger_refork();
        }
    }

    /// Schedule a refork: stamp the busiest worker into the next phase so
    /// promotion picks it, retire any current mold, and queue the restart.
    fn trigger_refork(&mut self) {
        if !self.options.fork_worker.enabled() {
            return;
        }
        if self.phased_restart.is_some() || self.restart_in_progress.is_some() {
            return;
        }
        let next_phase = self.phase + 1;
        let Some(w) = self
            .workers
            .iter_mut()
            .filter(|w| w.booted() && !w.termed())
            .max_by_key(|w| w.requests_count())
        else {
            return;
        };
        tracing::info!(index = w.index(), "scheduling refork");
        w.set_phase(next_phase);
        if let Some(m) = &mut self.mold {
            m.term(&self.procs);
        }
        self.phased_restart = Some(RestartKind::Refork);
        self.next_check = Instant::now();
    }

    fn begin_phased_restart(&mut self, kind: RestartKind) {
        self.phase += 1;
        if let Some(dir) = &self.options.restart_dir
            && let Err(e) = self.procs.chdir(dir)
        {
            tracing::warn!(error = %e, dir = %dir.display(), "could not enter restart directory");
        }
        self.workers_not_booted = self.worker_count;
        if kind == RestartKind::Refork {
            // Worker 0's slot persists as the mold.
            self.workers_not_booted = self.workers_not_booted.saturating_sub(1);
        }
        self.restart_in_progress = Some(kind);
        tracing::info!(phase = self.phase, kind = ?kind, "starting phased restart");
    }

    fn finish_restart_if_done(&mut self) {
        if self.workers_not_booted > 0 {
            return;
        }
        if let Some(kind) = self.restart_in_progress.take() {
            tracing::info!(phase = self.phase, "phased restart complete");
            if kind == RestartKind::Refork {
                self.send_fork_command(&ForkCommand::ReforkComplete);
            }
            self.hooks.fire_event(&self.hooks.on_booted);
        } else if !self.booted_fired {
            self.booted_fired = true;
            tracing::info!("all workers booted");
            self.hooks.fire_event(&self.hooks.on_booted);
        }
    }

    fn idle_shutdown_due(&mut self, now: Instant) -> bool {
        let Some(window) = self.options.idle_timeout else {
            return false;
        };
        let all_idle = !self.workers.is_empty()
            && self
                .workers
                .iter()
                .all(|w| w.pid().is_some_and(|p| self.idle_workers.contains(&p)));
        if !all_idle {
            self.all_idle_since = None;
            return false;
        }
        let since = *self.all_idle_since.get_or_insert(now);
        now.duration_since(since) >= window
    }

    /// Terminate everything and wait, escalating to SIGKILL on the shutdown
    /// window or on a further interrupt.
    fn stop_workers(&mut self) {
        if self.workers.is_empty() && self.mold.is_none() {
            return;
        }
        tracing::info!("terminating workers");
        for w in self.workers.iter_mut().chain(self.mold.iter_mut()) {
            w.term(&self.procs);
        }
        loop {
            self.wait_workers();
            if self.workers.is_empty() && self.mold.is_none() {
                break;
            }
            for code in self.drain_wake_codes() {
                if matches!(signals::event_for(code), Some(SignalEvent::Stop)) {
                    tracing::warn!("interrupted while stopping; force-killing remaining workers");
                    self.status = RunStatus::Halt;
                }
            }
            let now = Instant::now();
            let halt = self.status == RunStatus::Halt;
            for w in self.workers.iter_mut().chain(self.mold.iter_mut()) {
                if w.stage() == Stage::Killed {
                    continue;
                }
                let overdue = w.kill_deadline(&self.options).is_some_and(|d| d <= now);
                if halt || overdue {
                    if overdue {
                        tracing::warn!(
                            index = w.index(),
                            "worker shutdown timed out; sending SIGKILL"
                        );
                    }
                    w.kill(&self.procs);
                }
            }
            std::thread::sleep(Duration::from_millis(200));
        }
        tracing::info!("workers stopped");
    }

    fn drain_wake_codes(&mut self) -> Vec<u8> {
        match &self.pipes {
            Some(pipes) => drain_bytes(&pipes.wake_r).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn member_by_pid(&self, pid: Pid) -> Option<Member> {
        if let Some(i) = self.workers.iter().position(|w| w.pid() == Some(pid)) {
            return Some(Member::Worker(i));
        }
        if self.mold.as_ref().is_some_and(|m| m.pid() == Some(pid)) {
            return Some(Member::Mold);
        }
        None
    }
}

/// Drain a non-blocking fd to exhaustion.
fn drain_bytes(fd: &OwnedFd) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        match ipc::read_fd(fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(StampedeError::Io(e)),
        }
    }
    Ok(out)
}
