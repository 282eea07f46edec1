//! Cluster configuration.
//!
//! All knobs the supervisor consumes live in [`ClusterOptions`]. The struct
//! is validated once, before any process is spawned; a bad configuration is
//! fatal and never reaches a fork.

use crate::error::{Result, StampedeError};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which end of the age ordering gets culled when the pool is over target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CullingStrategy {
    /// Terminate the longest-running workers first.
    #[default]
    Oldest,
    /// Terminate the most recently started workers first.
    Youngest,
}

impl FromStr for CullingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "oldest" => Ok(Self::Oldest),
            "youngest" => Ok(Self::Youngest),
            _ => Err(format!(
                "Unknown culling strategy: '{}'. Valid options: oldest, youngest",
                s
            )),
        }
    }
}

/// Fork-worker mode: disabled, or enabled with an auto-refork threshold.
///
/// A threshold of 0 means reforking only happens on demand (SIGURG to the
/// master); a positive threshold additionally triggers a refork once worker 0
/// has served that many requests in phase 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ForkWorker {
    #[default]
    Disabled,
    Enabled {
        refork_threshold: u64,
    },
}

impl ForkWorker {
    pub fn enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    /// The auto-refork threshold, if one is configured.
    pub fn threshold(&self) -> Option<u64> {
        match self {
            Self::Enabled { refork_threshold } if *refork_threshold > 0 => {
                Some(*refork_threshold)
            }
            _ => None,
        }
    }
}

/// Options consumed by the cluster supervisor.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Number of worker processes to keep alive.
    pub workers: usize,
    /// A booted worker is killed if it has not checked in for this long.
    pub worker_timeout: Duration,
    /// A spawned worker is killed if it has not booted within this window.
    pub worker_boot_timeout: Duration,
    /// A termed worker is SIGKILLed if it lingers past this window.
    pub worker_shutdown_timeout: Duration,
    /// Interval between worker status pings (and master health sweeps).
    pub worker_check_interval: Duration,
    /// Which workers to terminate when the pool is over target.
    pub worker_culling_strategy: CullingStrategy,
    /// Fork-worker mode (mold-based reforking).
    pub fork_worker: ForkWorker,
    /// Worker-side mold promotion (SIGURG). `None` follows `fork_worker`.
    pub mold_worker: Option<bool>,
    /// Whether the application is preloaded in the master before forking.
    pub preload_app: bool,
    /// Shut the cluster down once every worker has been idle this long.
    pub idle_timeout: Option<Duration>,
    /// Re-raise SIGTERM with default disposition instead of draining.
    pub raise_exception_on_sigterm: bool,
    /// Suppress the single-worker configuration warning.
    pub silence_single_worker_warning: bool,
    /// Free-form tag appended to process titles.
    pub tag: String,
    /// Base name used in process titles.
    pub name: String,
    /// Directory to chdir into when a phased restart begins.
    pub restart_dir: Option<PathBuf>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            worker_timeout: Duration::from_secs(60),
            worker_boot_timeout: Duration::from_secs(60),
            worker_shutdown_timeout: Duration::from_secs(30),
            worker_check_interval: Duration::from_secs(5),
            worker_culling_strategy: CullingStrategy::default(),
            fork_worker: ForkWorker::default(),
            mold_worker: None,
            preload_app: false,
            idle_timeout: None,
            raise_exception_on_sigterm: false,
            silence_single_worker_warning: false,
            tag: String::new(),
            name: "stampede".to_string(),
            restart_dir: None,
        }
    }
}

impl ClusterOptions {
    /// Whether workers install the SIGURG mold-promotion handler.
    pub fn mold_enabled(&self) -> bool {
        self.mold_worker.unwrap_or(self.fork_worker.enabled())
    }

    /// Validate option coherence. Called before any process is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.workers < 1 {
            return Err(StampedeError::Config(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.worker_check_interval >= self.worker_timeout {
            return Err(StampedeError::Config(format!(
                "worker_check_interval ({:?}) must be less than worker_timeout ({:?})",
                self.worker_check_interval, self.worker_timeout
            )));
        }
        if self.fork_worker.enabled() && self.workers < 2 {
            return Err(StampedeError::Config(
                "fork_worker needs at least 2 workers: one slot is held by the mold".to_string(),
            ));
        }
        if self.fork_worker.enabled() && self.preload_app {
            return Err(StampedeError::Config(
                "fork_worker is incompatible with preload_app: the mold replaces preloading \
                 as the copy-on-write source"
                    .to_string(),
            ));
        }
        if self.fork_worker.enabled() && self.mold_worker == Some(false) {
            return Err(StampedeError::Config(
                "fork_worker requires mold promotion; the legacy restart path is not supported"
                    .to_string(),
            ));
        }
        if self.mold_worker == Some(true) && !self.fork_worker.enabled() {
            return Err(StampedeError::Config(
                "mold_worker has no effect without fork_worker".to_string(),
            ));
        }
        Ok(())
    }

    /// Process title for a cluster member.
    ///
    /// `role` is `"worker"` or `"mold"`; `index` the worker slot; `master_pid`
    /// the supervising process.
    pub fn process_title(&self, role: &str, index: usize, master_pid: i32) -> String {
        let mut title = format!("{}: cluster {} {}: {}", self.name, role, index, master_pid);
        if !self.tag.is_empty() {
            title.push_str(&format!(" [{}]", self.tag));
        }
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let opts = ClusterOptions::default();
        assert!(opts.validate().is_ok());
        assert_eq!(opts.workers, 2);
        assert!(!opts.mold_enabled());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let opts = ClusterOptions {
            workers: 0,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_check_interval_must_undercut_timeout() {
        let opts = ClusterOptions {
            worker_check_interval: Duration::from_secs(60),
            worker_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_fork_worker_conflicts_with_preload() {
        let opts = ClusterOptions {
            fork_worker: ForkWorker::Enabled {
                refork_threshold: 0,
            },
            preload_app: true,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_fork_worker_needs_two_workers() {
        let opts = ClusterOptions {
            workers: 1,
            fork_worker: ForkWorker::Enabled {
                refork_threshold: 0,
            },
            silence_single_worker_warning: true,
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_legacy_restart_path_refused() {
        let opts = ClusterOptions {
            fork_worker: ForkWorker::Enabled {
                refork_threshold: 0,
            },
            mold_worker: Some(false),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_mold_worker_alone_refused() {
        let opts = ClusterOptions {
            mold_worker: Some(true),
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_mold_follows_fork_worker() {
        let opts = ClusterOptions {
            fork_worker: ForkWorker::Enabled {
                refork_threshold: 1000,
            },
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
        assert!(opts.mold_enabled());
        assert_eq!(opts.fork_worker.threshold(), Some(1000));
    }

    #[test]
    fn test_manual_threshold_is_none() {
        let fw = ForkWorker::Enabled {
            refork_threshold: 0,
        };
        assert!(fw.enabled());
        assert_eq!(fw.threshold(), None);
    }

    #[test]
    fn test_culling_strategy_from_str() {
        assert_eq!(
            "oldest".parse::<CullingStrategy>().unwrap(),
            CullingStrategy::Oldest
        );
        assert_eq!(
            "Youngest".parse::<CullingStrategy>().unwrap(),
            CullingStrategy::Youngest
        );
        assert!("random".parse::<CullingStrategy>().is_err());
    }

    #[test]
    fn test_process_title() {
        let opts = ClusterOptions {
            name: "app".to_string(),
            ..Default::default()
        };
        assert_eq!(opts.process_title("worker", 3, 100), "app: cluster worker 3: 100");

        let tagged = ClusterOptions {
            name: "app".to_string(),
            tag: "blue".to_string(),
            ..Default::default()
        };
        assert_eq!(
            tagged.process_title("mold", 0, 100),
            "app: cluster mold 0: 100 [blue]"
        );
    }
}
