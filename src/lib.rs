//! stampede - cluster supervisor for multi-process application servers.
//!
//! The [`cluster::Supervisor`] forks and supervises a pool of worker
//! processes, each hosting a request-serving engine behind the
//! [`engine::Engine`] trait. It handles health checking, graceful and
//! phased restarts, and mold-based reforking for copy-on-write sharing.

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod version;

pub use cluster::Supervisor;
pub use config::ClusterOptions;
pub use engine::{Engine, EngineFactory, EngineMetrics};
pub use error::{Result, StampedeError};
pub use hooks::Hooks;
