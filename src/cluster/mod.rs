//! Master/worker cluster supervision.
//!
//! A master process forks a pool of worker processes, each hosting one
//! request-serving engine, and coordinates them over anonymous pipes.
//!
//! # Architecture
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │      Master      │
//!                  │   (Supervisor)   │
//!                  └───┬────┬─────┬───┘
//!         status pipe ▲│    │     │ fork pipe
//!                      │    │     ▼
//!                ┌─────┴──┐ │ ┌────────┐
//!                │ Worker │ │ │  Mold  │──fork──▶ new Workers
//!                │ 1..N   │ │ └────────┘
//!                └────────┘ │
//!                           ▼ check pipe (EOF = master died)
//! ```
//!
//! # Features
//!
//! - **Health checking**: every worker pings metrics on an interval; the
//!   master kills members that miss boot or check-in deadlines
//! - **Phased restarts**: workers of an old code generation are replaced
//!   one at a time without interrupting service
//! - **Fork-worker mode**: a busy worker is promoted to a mold that forks
//!   replacements, preserving copy-on-write sharing of loaded code
//! - **Crash recovery**: reaped workers are respawned automatically

pub mod handle;
pub mod ipc;
pub mod os;
pub mod protocol;
pub mod signals;
pub mod stats;
pub mod supervisor;
pub mod worker;

pub use handle::{Stage, WorkerHandle};
pub use os::{ProcessControl, RealProcess};
pub use stats::{ClusterStats, WorkerStatus};
pub use supervisor::{RestartKind, RunStatus, Supervisor};
pub use worker::{Worker, WorkerPipes};
