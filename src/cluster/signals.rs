//! Signal plumbing for master and workers.
//!
//! Handlers never touch supervisor state. Every installed handler does one
//! thing: write the signal number as a single byte into a self-pipe. The
//! owning loop reads the bytes and consults the signal → event table here,
//! so all state mutation happens on a normal thread.

use crate::error::Result;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

/// What a delivered signal means to the consuming loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// Re-run the health sweep now (explicit `!` wakeup).
    Wake,
    /// SIGINT: begin a graceful stop (a second one escalates to halt).
    Stop,
    /// SIGTERM: stop; in a worker, drain and exit.
    Term,
    /// SIGCHLD: a child changed state; reap on the next sweep.
    ChildExited,
    /// SIGTTIN: grow the worker pool by one.
    WorkerAdd,
    /// SIGTTOU: shrink the worker pool by one (floor of 1).
    WorkerRemove,
    /// SIGURG: trigger a refork (master) or mold promotion (worker).
    Refork,
    /// SIGUSR1: begin a normal phased restart.
    PhasedRestart,
}

/// Map a code byte read from the self-pipe to its event.
///
/// Returns `None` for codes outside the handled set.
pub fn event_for(code: u8) -> Option<SignalEvent> {
    if code == crate::cluster::protocol::Message::WAKEUP_BYTE {
        return Some(SignalEvent::Wake);
    }
    let signal = Signal::try_from(code as i32).ok()?;
    Some(match signal {
        Signal::SIGINT => SignalEvent::Stop,
        Signal::SIGTERM => SignalEvent::Term,
        Signal::SIGCHLD => SignalEvent::ChildExited,
        Signal::SIGTTIN => SignalEvent::WorkerAdd,
        Signal::SIGTTOU => SignalEvent::WorkerRemove,
        Signal::SIGURG => SignalEvent::Refork,
        Signal::SIGUSR1 => SignalEvent::PhasedRestart,
        _ => return None,
    })
}

/// Destination fd for forwarded signals, process-global.
///
/// A forked child inherits the parent's value until it reinstalls its own
/// pipe; the one-byte window is harmless (the parent's pipe simply absorbs
/// the byte).
static FORWARD_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward(signum: nix::libc::c_int) {
    let fd = FORWARD_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let code = signum as u8;
        // Async-signal-safe: a single write(2). A full pipe means wakeups
        // are already pending, so the dropped byte loses nothing.
        unsafe {
            nix::libc::write(fd, (&raw const code).cast(), 1);
        }
    }
}

/// Install the forwarding handler for `signals`, targeting `fd`.
pub fn install_forwarding(fd: RawFd, signals: &[Signal]) -> Result<()> {
    FORWARD_FD.store(fd, Ordering::SeqCst);
    let action = SigAction::new(
        SigHandler::Handler(forward),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in signals {
        unsafe {
            signal::sigaction(*sig, &action)?;
        }
    }
    Ok(())
}

/// Restore the default disposition for `sig`.
pub fn set_default(sig: Signal) -> Result<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        signal::sigaction(sig, &action)?;
    }
    Ok(())
}

/// Ignore `sig`.
pub fn ignore(sig: Signal) -> Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe {
        signal::sigaction(sig, &action)?;
    }
    Ok(())
}

/// Ignore SIGPIPE process-wide; pipe errors surface as EPIPE instead.
pub fn ignore_sigpipe() {
    let _ = ignore(Signal::SIGPIPE);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wakeup_byte_maps_to_wake() {
        assert_eq!(event_for(b'!'), Some(SignalEvent::Wake));
    }

    #[test]
    fn test_signal_numbers_map_to_events() {
        assert_eq!(
            event_for(Signal::SIGINT as i32 as u8),
            Some(SignalEvent::Stop)
        );
        assert_eq!(
            event_for(Signal::SIGTERM as i32 as u8),
            Some(SignalEvent::Term)
        );
        assert_eq!(
            event_for(Signal::SIGCHLD as i32 as u8),
            Some(SignalEvent::ChildExited)
        );
        assert_eq!(
            event_for(Signal::SIGTTIN as i32 as u8),
            Some(SignalEvent::WorkerAdd)
        );
        assert_eq!(
            event_for(Signal::SIGTTOU as i32 as u8),
            Some(SignalEvent::WorkerRemove)
        );
        assert_eq!(
            event_for(Signal::SIGURG as i32 as u8),
            Some(SignalEvent::Refork)
        );
        assert_eq!(
            event_for(Signal::SIGUSR1 as i32 as u8),
            Some(SignalEvent::PhasedRestart)
        );
    }

    #[test]
    fn test_unhandled_codes_are_none() {
        assert_eq!(event_for(0), None);
        assert_eq!(event_for(Signal::SIGHUP as i32 as u8), None);
        assert_eq!(event_for(200), None);
    }

    #[test]
    fn test_forwarding_writes_signal_byte() {
        use crate::cluster::ipc;
        use std::os::unix::io::AsRawFd;

        let (r, w) = ipc::pipe_nonblocking().expect("pipe");
        install_forwarding(w.as_raw_fd(), &[]).unwrap();
        // Exercise the handler body directly rather than raising a signal,
        // which would race other tests in the same process.
        forward(Signal::SIGTERM as i32);

        let mut buf = [0u8; 4];
        let n = ipc::read_fd(&r, &mut buf).unwrap();
        assert_eq!(n, 1);
        assert_eq!(event_for(buf[0]), Some(SignalEvent::Term));

        FORWARD_FD.store(-1, Ordering::SeqCst);
    }
}
