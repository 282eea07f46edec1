//! Pipe primitives for master/worker communication.
//!
//! Provides EINTR-safe read/write helpers, the non-blocking framed
//! reader/writer used on the shared status pipe, and the blocking line
//! reader the mold uses on the fork pipe.
//!
//! Descriptors that cross a fork are held as `Arc<OwnedFd>` so both the
//! spawning code and the threads of a forked child keep usable handles.

use crate::cluster::protocol::{ForkCommand, Message};
use crate::error::{Result, StampedeError};
use nix::fcntl::OFlag;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

/// Read with EINTR retry.
pub fn read_fd(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match nix::unistd::read(fd.as_raw_fd(), buf) {
            Ok(n) => return Ok(n),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

/// Write with EINTR retry.
pub fn write_fd(fd: &OwnedFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        match nix::unistd::write(fd, buf) {
            Ok(n) => return Ok(n),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

/// Create a blocking pipe. Returns `(read, write)`.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe()?)
}

/// Create a pipe with both ends non-blocking. Returns `(read, write)`.
///
/// Used for the shared status pipe and the wakeup self-pipe: worker-side
/// writes must never block behind a stalled master, and the master drains
/// without blocking.
pub fn pipe_nonblocking() -> Result<(OwnedFd, OwnedFd)> {
    Ok(nix::unistd::pipe2(OFlag::O_NONBLOCK)?)
}

/// Close a descriptor by raw value, ignoring errors.
///
/// Used in freshly forked children to drop inherited master-side ends whose
/// owners live in structures the child never drops (it leaves via
/// `process::exit`), so no double-close can occur.
pub fn close_raw(fd: RawFd) {
    let _ = unsafe { nix::libc::close(fd) };
}

/// Non-blocking writer for the shared status pipe.
///
/// Frames are smaller than PIPE_BUF, so writes are atomic: a frame either
/// lands whole or not at all. A full pipe drops the frame silently (the next
/// ping supersedes it); a vanished peer reports [`StampedeError::PeerGone`].
#[derive(Clone)]
pub struct MessageWriter {
    fd: Arc<OwnedFd>,
}

impl MessageWriter {
    pub fn new(fd: Arc<OwnedFd>) -> Self {
        Self { fd }
    }

    /// Send one message frame.
    pub fn send(&self, msg: &Message) -> Result<()> {
        self.send_raw(&msg.encode())
    }

    /// Send pre-encoded bytes.
    pub fn send_raw(&self, bytes: &[u8]) -> Result<()> {
        match write_fd(&self.fd, bytes) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(StampedeError::PeerGone),
            Err(e) => Err(StampedeError::Io(e)),
        }
    }
}

/// Non-blocking framing reader for the master end of the status pipe.
///
/// Accumulates whatever is currently readable and yields complete frames:
/// newline-terminated message lines, plus bare `!` wakeup bytes which carry
/// no newline. Partial lines stay buffered until the rest arrives.
pub struct MessageReader {
    fd: Arc<OwnedFd>,
    buf: Vec<u8>,
}

impl MessageReader {
    pub fn new(fd: Arc<OwnedFd>) -> Self {
        Self {
            fd,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Drain all currently readable frames.
    pub fn drain(&mut self) -> Result<Vec<Message>> {
        let mut chunk = [0u8; 4096];
        loop {
            match read_fd(&self.fd, &mut chunk) {
                Ok(0) => break, // all write ends closed
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(StampedeError::Io(e)),
            }
        }

        let mut messages = Vec::new();
        let mut start = 0;
        while start < self.buf.len() {
            if self.buf[start] == Message::WAKEUP_BYTE {
                messages.push(Message::Wakeup);
                start += 1;
                continue;
            }
            let Some(rel) = self.buf[start..].iter().position(|&b| b == b'\n') else {
                break; // partial line, wait for more
            };
            match Message::decode(&self.buf[start..start + rel]) {
                Ok(msg) => messages.push(msg),
                Err(e) => tracing::warn!(error = %e, "discarding malformed status line"),
            }
            start += rel + 1;
        }
        self.buf.drain(..start);
        Ok(messages)
    }
}

/// Blocking line reader for the fork pipe (mold side).
///
/// Callers poll for readability first, so a read here returns promptly.
pub struct CommandReader {
    fd: Arc<OwnedFd>,
    buf: Vec<u8>,
}

impl CommandReader {
    pub fn new(fd: Arc<OwnedFd>) -> Self {
        Self {
            fd,
            buf: Vec::with_capacity(64),
        }
    }

    /// Read the next command line. `Ok(None)` means EOF (master gone).
    pub fn read_command(&mut self) -> Result<Option<ForkCommand>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let text = std::str::from_utf8(&line[..line.len() - 1])
                    .map_err(|_| StampedeError::Protocol("non-UTF8 fork command".to_string()))?;
                return Ok(Some(ForkCommand::decode(text)?));
            }
            let mut chunk = [0u8; 64];
            match read_fd(&self.fd, &mut chunk) {
                Ok(0) => return Ok(None),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(StampedeError::Io(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    fn arc_pair_nonblocking() -> (Arc<OwnedFd>, Arc<OwnedFd>) {
        let (r, w) = pipe_nonblocking().expect("pipe");
        (Arc::new(r), Arc::new(w))
    }

    #[test]
    fn test_reader_writer_roundtrip() {
        let (r, w) = arc_pair_nonblocking();
        let writer = MessageWriter::new(w);
        let mut reader = MessageReader::new(r);

        writer
            .send(&Message::Boot {
                pid: Pid::from_raw(42),
                index: 1,
            })
            .unwrap();
        writer.send(&Message::Wakeup).unwrap();
        writer
            .send(&Message::Term {
                pid: Pid::from_raw(42),
            })
            .unwrap();

        let messages = reader.drain().unwrap();
        assert_eq!(
            messages,
            vec![
                Message::Boot {
                    pid: Pid::from_raw(42),
                    index: 1
                },
                Message::Wakeup,
                Message::Term {
                    pid: Pid::from_raw(42)
                },
            ]
        );
    }

    #[test]
    fn test_reader_keeps_partial_lines() {
        let (r, w) = arc_pair_nonblocking();
        let writer = MessageWriter::new(w);
        let mut reader = MessageReader::new(r);

        writer.send_raw(b"b123").unwrap();
        assert!(reader.drain().unwrap().is_empty());

        writer.send_raw(b":0\n").unwrap();
        let messages = reader.drain().unwrap();
        assert_eq!(
            messages,
            vec![Message::Boot {
                pid: Pid::from_raw(123),
                index: 0
            }]
        );
    }

    #[test]
    fn test_reader_skips_malformed_lines() {
        let (r, w) = arc_pair_nonblocking();
        let writer = MessageWriter::new(w);
        let mut reader = MessageReader::new(r);

        writer.send_raw(b"zgarbage\n").unwrap();
        writer
            .send(&Message::Idle {
                pid: Pid::from_raw(9),
            })
            .unwrap();

        let messages = reader.drain().unwrap();
        assert_eq!(
            messages,
            vec![Message::Idle {
                pid: Pid::from_raw(9)
            }]
        );
    }

    #[test]
    fn test_writer_reports_peer_gone() {
        let (r, w) = arc_pair_nonblocking();
        let writer = MessageWriter::new(w);
        drop(r);

        // SIGPIPE must be ignored for the EPIPE to surface as an error.
        crate::cluster::signals::ignore_sigpipe();
        let err = writer.send(&Message::Wakeup).unwrap_err();
        assert!(matches!(err, StampedeError::PeerGone));
    }

    #[test]
    fn test_command_reader_eof() {
        let (r, w) = pipe().expect("pipe");
        let mut reader = CommandReader::new(Arc::new(r));
        write_fd(&w, b"3\n-1\n").unwrap();
        drop(w);

        assert_eq!(reader.read_command().unwrap(), Some(ForkCommand::Spawn(3)));
        assert_eq!(
            reader.read_command().unwrap(),
            Some(ForkCommand::BeginRefork)
        );
        assert_eq!(reader.read_command().unwrap(), None);
    }

    #[test]
    fn test_check_pipe_eof_on_parent_close() {
        // The watchdog contract: closing the write end wakes a blocked read
        // with EOF.
        let (r, w) = pipe().expect("pipe");
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            read_fd(&r, &mut buf)
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(w);
        let n = handle.join().unwrap().unwrap();
        assert_eq!(n, 0);
    }
}
