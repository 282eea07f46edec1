//! Child-side run loop.
//!
//! A worker hosts one serving engine, reports liveness to the master, and
//! obeys master-initiated stop/restart/promotion commands. A promoted worker
//! stops serving and becomes the mold: it sits on the fork pipe and forks
//! fresh workers on demand, preserving copy-on-write sharing of everything
//! loaded before promotion.

use crate::cluster::ipc::{self, CommandReader, MessageWriter};
use crate::cluster::os::{ProcessControl, RealProcess};
use crate::cluster::protocol::{ForkCommand, Message};
use crate::cluster::signals::{self, SignalEvent};
use crate::config::ClusterOptions;
use crate::engine::{Engine, EngineFactory};
use crate::hooks::{HookPoint, Hooks};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::Signal;
use nix::unistd::{ForkResult, Pid, fork, getpid};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Restart gate values: re-run the serving engine, or leave the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateSignal {
    Continue,
    Stop,
}

/// The restart gate: a tiny bounded queue the worker main thread blocks on
/// between serve cycles.
///
/// Primed with `[Continue, Stop]` so the engine runs exactly once by
/// default. `begin_restart` re-primes for one more cycle; `request_stop`
/// collapses everything pending into a single `Stop`.
pub(crate) struct Gate {
    queue: Mutex<VecDeque<GateSignal>>,
    ready: Condvar,
}

impl Gate {
    pub(crate) fn primed() -> Self {
        let mut queue = VecDeque::with_capacity(2);
        queue.push_back(GateSignal::Continue);
        queue.push_back(GateSignal::Stop);
        Self {
            queue: Mutex::new(queue),
            ready: Condvar::new(),
        }
    }

    /// Pop the next signal, blocking until one is available.
    pub(crate) fn wait(&self) -> GateSignal {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(signal) = queue.pop_front() {
                return signal;
            }
            queue = self.ready.wait(queue).unwrap();
        }
    }

    /// Schedule one more serve cycle after the current drain completes.
    pub(crate) fn begin_restart(&self) {
        let mut queue = self.queue.lock().unwrap();
        queue.clear();
        queue.push_back(GateSignal::Continue);
        queue.push_back(GateSignal::Stop);
        self.ready.notify_all();
    }

    /// Request a graceful exit from the serve loop.
    pub(crate) fn request_stop(&self) {
        let mut queue = self.queue.lock().unwrap();
        queue.clear();
        queue.push_back(GateSignal::Stop);
        self.ready.notify_all();
    }
}

/// Descriptors a cluster member inherits across fork.
///
/// Held as `Arc<OwnedFd>` so the watchdog/stat threads and any worker the
/// mold forks all keep usable handles without duplicating descriptors.
#[derive(Clone)]
pub struct WorkerPipes {
    /// Write end of the shared status pipe (non-blocking).
    pub status: Arc<OwnedFd>,
    /// Read end of the check pipe; EOF here means the master died.
    pub check: Arc<OwnedFd>,
    /// Read end of the fork pipe (fork-worker mode only).
    pub fork: Option<Arc<OwnedFd>>,
}

/// State shared between the worker main thread and its helper threads.
struct Shared {
    writer: MessageWriter,
    engine: Mutex<Option<Arc<dyn Engine>>>,
    gate: Gate,
    term_pending: AtomicBool,
    mold_pending: AtomicBool,
    /// Write end used to nudge the mold dispatcher out of its poll on TERM.
    mold_wake: Mutex<Option<OwnedFd>>,
}

/// One cluster member, child side.
#[derive(Clone)]
pub struct Worker {
    index: usize,
    master_pid: Pid,
    pipes: WorkerPipes,
    options: Arc<ClusterOptions>,
    hooks: Arc<Hooks>,
    factory: EngineFactory,
}

impl Worker {
    pub fn new(
        index: usize,
        master_pid: Pid,
        pipes: WorkerPipes,
        options: Arc<ClusterOptions>,
        hooks: Arc<Hooks>,
        factory: EngineFactory,
    ) -> Self {
        Self {
            index,
            master_pid,
            pipes,
            options,
            hooks,
            factory,
        }
    }

    /// Run to completion. Returns the process exit code.
    pub fn run(self) -> i32 {
        let pid = getpid();
        signals::ignore_sigpipe();
        RealProcess.set_title(&self.options.process_title(
            "worker",
            self.index,
            self.master_pid.as_raw(),
        ));

        // Child signal policy: the master's dispositions don't apply here.
        let _ = signals::ignore(Signal::SIGINT);
        for sig in [
            Signal::SIGCHLD,
            Signal::SIGTTIN,
            Signal::SIGTTOU,
            Signal::SIGUSR1,
            Signal::SIGURG,
        ] {
            let _ = signals::set_default(sig);
        }

        let (sig_r, sig_w) = match ipc::pipe() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "worker could not create its signal pipe");
                return 1;
            }
        };
        let mut forwarded = vec![Signal::SIGTERM];
        let mold_capable = self.options.mold_enabled() && self.pipes.fork.is_some();
        if mold_capable {
            forwarded.push(Signal::SIGURG);
        }
        if let Err(e) = signals::install_forwarding(sig_w.as_raw_fd(), &forwarded) {
            tracing::error!(error = %e, "worker could not install signal handlers");
            return 1;
        }

        let shared = Arc::new(Shared {
            writer: MessageWriter::new(self.pipes.status.clone()),
            engine: Mutex::new(None),
            gate: Gate::primed(),
            term_pending: AtomicBool::new(false),
            mold_pending: AtomicBool::new(false),
            mold_wake: Mutex::new(None),
        });

        spawn_watchdog(self.pipes.check.clone());
        self.spawn_signal_thread(sig_r, sig_w, shared.clone(), pid);

        let mut hook_data = HashMap::new();
        self.hooks
            .fire(HookPoint::BeforeWorkerBoot, self.index, &mut hook_data);

        let mut stat_thread: Option<JoinHandle<()>> = None;
        let mut first_boot = true;
        let mut exit_code = 0;

        while shared.gate.wait() == GateSignal::Continue {
            let engine = match (self.factory)(self.index) {
                Ok(engine) => engine,
                Err(e) => {
                    tracing::error!(error = %e, index = self.index, "failed to build server");
                    exit_code = 1;
                    break;
                }
            };
            let server_thread = match engine.run() {
                Ok(handle) => handle,
                Err(e) => {
                    tracing::error!(error = %e, index = self.index, "failed to start server");
                    exit_code = 1;
                    break;
                }
            };
            *shared.engine.lock().unwrap() = Some(engine.clone());

            // A signal that raced engine startup still takes effect.
            if shared.term_pending.load(Ordering::SeqCst) {
                engine.stop();
            } else if shared.mold_pending.load(Ordering::SeqCst) {
                engine.begin_restart(true);
            }

            if first_boot {
                first_boot = false;
                if shared
                    .writer
                    .send(&Message::Boot {
                        pid,
                        index: self.index,
                    })
                    .is_err()
                {
                    tracing::info!("master appears to have exited; shutting down");
                    engine.stop();
                    let _ = server_thread.join();
                    return 0;
                }
            }

            // Rejoin a finished stat thread and start a fresh one.
            if stat_thread.as_ref().is_none_or(|t| t.is_finished()) {
                if let Some(t) = stat_thread.take() {
                    let _ = t.join();
                }
                stat_thread = Some(spawn_stat_thread(
                    shared.clone(),
                    self.options.worker_check_interval,
                    pid,
                ));
            }

            let _ = server_thread.join();
            *shared.engine.lock().unwrap() = None;
        }

        let promote = exit_code == 0
            && shared.mold_pending.load(Ordering::SeqCst)
            && !shared.term_pending.load(Ordering::SeqCst);
        let code = if promote {
            self.run_mold(&shared)
        } else {
            exit_code
        };

        let _ = shared.writer.send(&Message::Term { pid });
        code
    }

    /// The signal thread: drains the self-pipe and acts on forwarded
    /// signals. All engine/gate interaction happens here, never in handler
    /// context.
    fn spawn_signal_thread(&self, sig_r: OwnedFd, sig_w: OwnedFd, shared: Arc<Shared>, pid: Pid) {
        let options = self.options.clone();
        let hooks = self.hooks.clone();
        let index = self.index;
        thread::Builder::new()
            .name("worker-signals".to_string())
            .spawn(move || {
                // The handler writes into sig_w for the life of the process.
                let _keep_alive = sig_w;
                let mut buf = [0u8; 1];
                loop {
                    match ipc::read_fd(&sig_r, &mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                    match signals::event_for(buf[0]) {
                        Some(SignalEvent::Term) => {
                            if shared.term_pending.swap(true, Ordering::SeqCst) {
                                continue;
                            }
                            let _ = shared.writer.send(&Message::ExternalTerm { pid });
                            let mut data = HashMap::new();
                            hooks.fire(HookPoint::BeforeWorkerShutdown, index, &mut data);

                            if let Some(wake) = shared.mold_wake.lock().unwrap().as_ref() {
                                let _ = ipc::write_fd(wake, b".");
                                continue;
                            }
                            if options.raise_exception_on_sigterm {
                                let _ = shared.writer.send(&Message::Term { pid });
                                let _ = signals::set_default(Signal::SIGTERM);
                                let _ = nix::sys::signal::kill(pid, Signal::SIGTERM);
                                return;
                            }
                            if let Some(engine) = shared.engine.lock().unwrap().clone() {
                                engine.stop();
                            }
                            shared.gate.request_stop();
                        }
                        Some(SignalEvent::Refork) => {
                            if shared.term_pending.load(Ordering::SeqCst)
                                || shared.mold_pending.swap(true, Ordering::SeqCst)
                            {
                                continue;
                            }
                            shared.gate.request_stop();
                            if let Some(engine) = shared.engine.lock().unwrap().clone() {
                                engine.begin_restart(true);
                            }
                        }
                        _ => {}
                    }
                }
            })
            .expect("failed to spawn worker signal thread");
    }

    /// Mold mode: stop serving, keep pinging, fork workers on demand.
    fn run_mold(&self, shared: &Arc<Shared>) -> i32 {
        let Some(fork_fd) = self.pipes.fork.clone() else {
            tracing::error!("promoted to mold without a fork pipe");
            return 1;
        };
        tracing::info!(index = self.index, "worker promoted to mold");
        RealProcess.set_title(&self.options.process_title(
            "mold",
            self.index,
            self.master_pid.as_raw(),
        ));

        let mut hook_data = HashMap::new();
        self.hooks
            .fire(HookPoint::OnMoldPromotion, self.index, &mut hook_data);

        let (wake_r, wake_w) = match ipc::pipe() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "mold could not create its wake pipe");
                return 1;
            }
        };
        *shared.mold_wake.lock().unwrap() = Some(wake_w);

        let mut reader = CommandReader::new(fork_fd.clone());
        // A TERM that landed during the drain is honoured before dispatch.
        while !shared.term_pending.load(Ordering::SeqCst) {
            let mut fds = [
                PollFd::new(fork_fd.as_fd(), PollFlags::POLLIN),
                PollFd::new(wake_r.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "mold poll failed");
                    break;
                }
            }
            let interest = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            if fds[1].revents().is_some_and(|r| r.intersects(interest)) {
                break; // term requested
            }
            if !fds[0].revents().is_some_and(|r| r.intersects(interest)) {
                continue;
            }
            match reader.read_command() {
                Ok(Some(ForkCommand::Spawn(index))) => self.spawn_from_mold(index, shared),
                Ok(Some(ForkCommand::BeginRefork)) => {
                    self.hooks
                        .fire(HookPoint::BeforeRefork, self.index, &mut hook_data);
                }
                Ok(Some(ForkCommand::ReforkComplete)) => {
                    self.hooks
                        .fire(HookPoint::AfterRefork, self.index, &mut hook_data);
                }
                Ok(Some(ForkCommand::LegacyRestart)) => {
                    tracing::warn!("ignoring legacy restart command on the fork pipe");
                }
                Ok(None) => {
                    tracing::info!("fork pipe closed; master has gone away");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "fork pipe read failed");
                    break;
                }
            }
        }

        self.hooks
            .fire(HookPoint::OnMoldShutdown, self.index, &mut hook_data);
        0
    }

    fn spawn_from_mold(&self, index: usize, shared: &Arc<Shared>) {
        let mut hook_data = HashMap::new();
        self.hooks
            .fire(HookPoint::BeforeWorkerFork, index, &mut hook_data);
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let worker = Worker::new(
                    index,
                    self.master_pid,
                    self.pipes.clone(),
                    self.options.clone(),
                    self.hooks.clone(),
                    self.factory.clone(),
                );
                std::process::exit(worker.run());
            }
            Ok(ForkResult::Parent { child }) => {
                self.hooks
                    .fire(HookPoint::AfterWorkerFork, index, &mut hook_data);
                tracing::debug!(index, pid = %child, "mold forked worker");
                let _ = shared.writer.send(&Message::Fork { pid: child, index });
            }
            Err(e) => tracing::error!(error = %e, index, "mold failed to fork worker"),
        }
    }
}

/// Parent-death watchdog: blocks on the check pipe and exits the process
/// the moment it sees EOF.
fn spawn_watchdog(check: Arc<OwnedFd>) {
    thread::Builder::new()
        .name("check-pipe".to_string())
        .spawn(move || {
            let mut buf = [0u8; 1];
            loop {
                match ipc::read_fd(&check, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {} // the master never writes; tolerate noise
                }
            }
            tracing::error!("master process has died; exiting");
            std::process::exit(1);
        })
        .expect("failed to spawn check-pipe watchdog");
}

/// The stat thread: one PING per check interval with the current engine
/// metrics, plus an IDLE toggle whenever the engine crosses between busy
/// and idle. Keeps running through mold promotion (with an empty payload)
/// so the master's check-in timeout never fires on a healthy mold.
fn spawn_stat_thread(shared: Arc<Shared>, interval: Duration, pid: Pid) -> JoinHandle<()> {
    thread::Builder::new()
        .name("stat-ping".to_string())
        .spawn(move || {
            let mut reported_idle = false;
            loop {
                thread::sleep(interval);
                let metrics = shared
                    .engine
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|engine| engine.metrics());
                let payload = metrics
                    .map(|m| m.to_json())
                    .unwrap_or_else(|| "{}".to_string());
                if shared.writer.send(&Message::Ping { pid, payload }).is_err() {
                    return; // master gone; the watchdog ends the worker
                }
                if let Some(m) = metrics {
                    let idle = m.busy_threads == 0 && m.backlog == 0;
                    if idle != reported_idle {
                        reported_idle = idle;
                        if shared.writer.send(&Message::Idle { pid }).is_err() {
                            return;
                        }
                    }
                }
            }
        })
        .expect("failed to spawn stat thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_runs_exactly_once_by_default() {
        let gate = Gate::primed();
        assert_eq!(gate.wait(), GateSignal::Continue);
        assert_eq!(gate.wait(), GateSignal::Stop);
    }

    #[test]
    fn test_gate_begin_restart_schedules_one_more_cycle() {
        let gate = Gate::primed();
        assert_eq!(gate.wait(), GateSignal::Continue);
        gate.begin_restart();
        assert_eq!(gate.wait(), GateSignal::Continue);
        assert_eq!(gate.wait(), GateSignal::Stop);
    }

    #[test]
    fn test_gate_request_stop_collapses_pending() {
        let gate = Gate::primed();
        gate.request_stop();
        assert_eq!(gate.wait(), GateSignal::Stop);
    }

    #[test]
    fn test_gate_wakes_blocked_waiter() {
        let gate = Arc::new(Gate::primed());
        assert_eq!(gate.wait(), GateSignal::Continue);
        assert_eq!(gate.wait(), GateSignal::Stop);

        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(50));
        gate.request_stop();
        assert_eq!(waiter.join().unwrap(), GateSignal::Stop);
    }
}
