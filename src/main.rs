//! stampede - cluster supervisor for multi-process application servers.

mod cli;

use clap::Parser;
use stampede::engine::{Engine, EngineFactory, EngineMetrics};
use stampede::error::StampedeError;
use stampede::Supervisor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

fn main() {
    let cli = cli::Cli::parse();
    stampede::logging::init(cli.log_config());

    let result = match &cli.command {
        cli::Commands::Serve(args) => cmd_serve(args),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {}", cause);
            }
            std::process::exit(1);
        }
    }
}

/// Run a cluster hosting the demo engine until stopped.
fn cmd_serve(args: &cli::ServeArgs) -> anyhow::Result<i32> {
    let options = args.to_options()?;
    let factory: EngineFactory =
        Arc::new(|_index| Ok(Arc::new(DemoEngine::new()) as Arc<dyn Engine>));
    let mut supervisor = Supervisor::new(options, factory)?;
    Ok(supervisor.run()?)
}

/// Minimal engine behind the `serve` command: ticks a synthetic request
/// counter so the whole master/worker/mold flow can be exercised without a
/// real server.
struct DemoEngine {
    requests: Arc<AtomicU64>,
    stop_gate: Arc<(Mutex<bool>, Condvar)>,
}

impl DemoEngine {
    fn new() -> Self {
        Self {
            requests: Arc::new(AtomicU64::new(0)),
            stop_gate: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }
}

impl Engine for DemoEngine {
    fn run(&self) -> stampede::Result<JoinHandle<()>> {
        *self.stop_gate.0.lock().unwrap() = false;
        let gate = self.stop_gate.clone();
        let requests = self.requests.clone();
        std::thread::Builder::new()
            .name("demo-server".to_string())
            .spawn(move || {
                let (lock, cvar) = &*gate;
                let mut stopped = lock.lock().unwrap();
                loop {
                    let (guard, timeout) = cvar
                        .wait_timeout(stopped, Duration::from_millis(100))
                        .unwrap();
                    stopped = guard;
                    if *stopped {
                        return;
                    }
                    if timeout.timed_out() {
                        requests.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
            .map_err(|e| StampedeError::Engine(e.to_string()))
    }

    fn stop(&self) {
        let (lock, cvar) = &*self.stop_gate;
        *lock.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn begin_restart(&self, _drain: bool) {
        // Nothing queues in the demo engine, so a drain is an ordinary stop.
        self.stop();
    }

    fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            backlog: 0,
            running: 1,
            pool_capacity: 1,
            max_threads: 1,
            requests_count: self.requests.load(Ordering::Relaxed),
            busy_threads: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_engine_stop_unblocks_run() {
        let engine = DemoEngine::new();
        let handle = engine.run().unwrap();
        std::thread::sleep(Duration::from_millis(250));
        engine.stop();
        handle.join().unwrap();
        assert!(engine.metrics().requests_count >= 1);
    }

    #[test]
    fn test_demo_engine_restartable() {
        let engine = DemoEngine::new();
        let first = engine.run().unwrap();
        engine.begin_restart(true);
        first.join().unwrap();

        let second = engine.run().unwrap();
        engine.stop();
        second.join().unwrap();
    }
}
