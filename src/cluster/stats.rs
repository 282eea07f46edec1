//! Aggregated master view of the cluster.

use crate::cluster::handle::WorkerHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// Snapshot of one worker as the master sees it.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub started_at: DateTime<Utc>,
    pub pid: Option<i32>,
    pub index: usize,
    pub phase: u64,
    pub booted: bool,
    pub last_checkin: DateTime<Utc>,
    pub last_status: HashMap<String, u64>,
}

impl WorkerStatus {
    pub(crate) fn from_handle(handle: &WorkerHandle) -> Self {
        Self {
            started_at: handle.started_at_utc(),
            pid: handle.pid().map(|p| p.as_raw()),
            index: handle.index(),
            phase: handle.phase(),
            booted: handle.booted(),
            last_checkin: handle.last_checkin_utc(),
            last_status: handle.last_status().clone(),
        }
    }
}

/// Snapshot of the whole cluster.
///
/// Queried from a worker process, `worker_status` is empty: per-worker
/// bookkeeping lives only in the master.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub started_at: DateTime<Utc>,
    pub workers: usize,
    pub phase: u64,
    pub booted_workers: usize,
    pub old_workers: usize,
    pub worker_status: Vec<WorkerStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_worker_status_from_handle() {
        let mut handle = WorkerHandle::new(2, 1, Some(Pid::from_raw(77)));
        handle.boot();
        handle.ping(r#"{"requests_count":5}"#).unwrap();

        let status = WorkerStatus::from_handle(&handle);
        assert_eq!(status.index, 2);
        assert_eq!(status.phase, 1);
        assert_eq!(status.pid, Some(77));
        assert!(status.booted);
        assert_eq!(status.last_status.get("requests_count"), Some(&5));
    }

    #[test]
    fn test_stats_serialize_shape() {
        let handle = WorkerHandle::new(0, 0, Some(Pid::from_raw(10)));
        let stats = ClusterStats {
            started_at: Utc::now(),
            workers: 1,
            phase: 0,
            booted_workers: 0,
            old_workers: 0,
            worker_status: vec![WorkerStatus::from_handle(&handle)],
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["workers"], 1);
        assert_eq!(json["worker_status"][0]["index"], 0);
        assert_eq!(json["worker_status"][0]["booted"], false);
        assert!(json["started_at"].is_string());
    }
}
