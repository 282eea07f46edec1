//! The request-serving engine interface.
//!
//! The supervisor is engine-agnostic: each worker hosts one [`Engine`]
//! obtained from an [`EngineFactory`] after the fork. The engine owns its
//! internal thread pool; the worker run loop only starts it, joins it, and
//! relays its metrics to the master.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A request-serving engine hosted inside a worker process.
///
/// `run` starts serving and returns a handle to the serving thread; the
/// handle joins when the engine stops (either via [`Engine::stop`] or after a
/// [`Engine::begin_restart`] drain completes).
pub trait Engine: Send + Sync {
    /// Start serving. Returns the handle of the serving thread.
    fn run(&self) -> Result<JoinHandle<()>>;

    /// Stop serving. The thread returned by `run` unblocks.
    fn stop(&self);

    /// Stop accepting work and wind down; with `drain` set, in-flight
    /// requests complete first.
    fn begin_restart(&self, drain: bool);

    /// Snapshot of the engine's load metrics.
    fn metrics(&self) -> EngineMetrics;
}

/// Point-in-time engine load metrics, published to the master in every PING.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub backlog: u64,
    pub running: u64,
    pub pool_capacity: u64,
    pub max_threads: u64,
    pub requests_count: u64,
    pub busy_threads: u64,
}

impl EngineMetrics {
    /// Serialize to the JSON object carried in a PING payload.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("metrics serialization cannot fail")
    }
}

/// Builds an engine for a given worker index.
///
/// Invoked inside the worker process, once per serve cycle (so a restart
/// gate re-run picks up freshly loaded application code). With `preload_app`
/// the closure captures state built in the master before the fork.
pub type EngineFactory = Arc<dyn Fn(usize) -> Result<Arc<dyn Engine>> + Send + Sync>;
