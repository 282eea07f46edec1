//! Wire protocol between master and cluster members.
//!
//! Two channels exist. The shared status pipe carries single-tag framed
//! messages from workers (and the mold) up to the master:
//!
//! ```text
//! b<pid>:<index>\n    worker booted
//! f<pid>:<index>\n    mold forked a new worker
//! p<pid>{json}\n      periodic metrics ping
//! e<pid>\n            worker received an external SIGTERM
//! t<pid>\n            worker is exiting
//! i<pid>\n            worker toggled its idle state
//! !                   wakeup byte (no newline)
//! ```
//!
//! The fork pipe carries ASCII-decimal commands from the master down to the
//! mold, one per line: a positive index requests a worker fork, `-1` opens a
//! refork cycle, `-2` closes it, and `0` is the retired restart sentinel.

use crate::error::{Result, StampedeError};
use nix::unistd::Pid;

/// A frame on the shared status pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Worker finished booting (`b`).
    Boot { pid: Pid, index: usize },
    /// Mold forked a new worker (`f`).
    Fork { pid: Pid, index: usize },
    /// Periodic metrics report (`p`); payload is a JSON object.
    Ping { pid: Pid, payload: String },
    /// Worker received SIGTERM from outside the cluster (`e`).
    ExternalTerm { pid: Pid },
    /// Worker is exiting (`t`).
    Term { pid: Pid },
    /// Worker toggled idle (`i`).
    Idle { pid: Pid },
    /// Self-pipe wakeup (`!`), written by signal handlers.
    Wakeup,
}

impl Message {
    /// The wakeup frame: a single byte, no newline. 0x21 is not a catchable
    /// signal number, so it cannot collide with forwarded signal codes.
    pub const WAKEUP_BYTE: u8 = b'!';

    /// The tag byte identifying this message on the wire.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Boot { .. } => b'b',
            Self::Fork { .. } => b'f',
            Self::Ping { .. } => b'p',
            Self::ExternalTerm { .. } => b'e',
            Self::Term { .. } => b't',
            Self::Idle { .. } => b'i',
            Self::Wakeup => Self::WAKEUP_BYTE,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Boot { pid, index } => format!("b{}:{}\n", pid, index).into_bytes(),
            Self::Fork { pid, index } => format!("f{}:{}\n", pid, index).into_bytes(),
            Self::Ping { pid, payload } => format!("p{}{}\n", pid, payload).into_bytes(),
            Self::ExternalTerm { pid } => format!("e{}\n", pid).into_bytes(),
            Self::Term { pid } => format!("t{}\n", pid).into_bytes(),
            Self::Idle { pid } => format!("i{}\n", pid).into_bytes(),
            Self::Wakeup => vec![Self::WAKEUP_BYTE],
        }
    }

    /// Decode one frame, without its trailing newline.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (&tag, rest) = frame
            .split_first()
            .ok_or_else(|| StampedeError::Protocol("empty frame".to_string()))?;
        if tag == Self::WAKEUP_BYTE && rest.is_empty() {
            return Ok(Self::Wakeup);
        }

        let rest = std::str::from_utf8(rest)
            .map_err(|_| StampedeError::Protocol("non-UTF8 frame".to_string()))?;
        match tag {
            b'b' => {
                let (pid, index) = split_pid_index(rest)?;
                Ok(Self::Boot { pid, index })
            }
            b'f' => {
                let (pid, index) = split_pid_index(rest)?;
                Ok(Self::Fork { pid, index })
            }
            b'p' => {
                let (pid, payload) = split_pid_payload(rest)?;
                Ok(Self::Ping { pid, payload })
            }
            b'e' => Ok(Self::ExternalTerm { pid: parse_pid(rest)? }),
            b't' => Ok(Self::Term { pid: parse_pid(rest)? }),
            b'i' => Ok(Self::Idle { pid: parse_pid(rest)? }),
            other => Err(StampedeError::Protocol(format!(
                "unknown tag {:?}",
                other as char
            ))),
        }
    }
}

fn parse_pid(s: &str) -> Result<Pid> {
    let raw: i32 = s
        .parse()
        .map_err(|_| StampedeError::Protocol(format!("bad pid {:?}", s)))?;
    if raw <= 0 {
        return Err(StampedeError::Protocol(format!("bad pid {}", raw)));
    }
    Ok(Pid::from_raw(raw))
}

fn split_pid_index(s: &str) -> Result<(Pid, usize)> {
    let (pid, index) = s
        .split_once(':')
        .ok_or_else(|| StampedeError::Protocol(format!("missing index in {:?}", s)))?;
    let index = index
        .parse()
        .map_err(|_| StampedeError::Protocol(format!("bad index {:?}", index)))?;
    Ok((parse_pid(pid)?, index))
}

fn split_pid_payload(s: &str) -> Result<(Pid, String)> {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return Err(StampedeError::Protocol(format!("missing pid in {:?}", s)));
    }
    let pid = parse_pid(&s[..digits])?;
    let payload = &s[digits..];
    // A pre-boot ping may carry no metrics yet.
    let payload = if payload.is_empty() { "{}" } else { payload };
    Ok((pid, payload.to_string()))
}

/// A command on the fork pipe, consumed by the mold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkCommand {
    /// Fork a new worker with this index.
    Spawn(usize),
    /// A refork cycle is opening; run the pre-refork hook.
    BeginRefork,
    /// The refork cycle is complete; run the post-refork hook.
    ReforkComplete,
    /// Retired restart sentinel, ignored by the mold path.
    LegacyRestart,
}

impl ForkCommand {
    /// Encode as one pipe line.
    pub fn encode(&self) -> String {
        match self {
            Self::Spawn(index) => format!("{}\n", index),
            Self::BeginRefork => "-1\n".to_string(),
            Self::ReforkComplete => "-2\n".to_string(),
            Self::LegacyRestart => "0\n".to_string(),
        }
    }

    /// Decode one line (without newline).
    pub fn decode(line: &str) -> Result<Self> {
        let value: i64 = line
            .trim()
            .parse()
            .map_err(|_| StampedeError::Protocol(format!("bad fork command {:?}", line)))?;
        match value {
            -1 => Ok(Self::BeginRefork),
            -2 => Ok(Self::ReforkComplete),
            0 => Ok(Self::LegacyRestart),
            n if n > 0 => Ok(Self::Spawn(n as usize)),
            n => Err(StampedeError::Protocol(format!("bad fork command {}", n))),
        }
    }
}
