//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use stampede::config::{ClusterOptions, CullingStrategy, ForkWorker};
use stampede::error::StampedeError;
use stampede::logging::LogConfig;
use stampede::version;
use std::path::PathBuf;
use std::time::Duration;

/// stampede - cluster supervisor for multi-process application servers
#[derive(Parser, Debug)]
#[command(name = "stampede")]
#[command(author, version = version::clap_version(), about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, env = "STAMPEDE_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "STAMPEDE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Log to file (in addition to stderr).
    #[arg(long, env = "STAMPEDE_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Build the logging configuration from CLI flags plus env overrides.
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::default();
        if self.quiet {
            config.filter = Some("error".to_string());
        } else if self.verbose >= 2 {
            config.filter = Some("trace".to_string());
        } else if self.verbose == 1 {
            config.filter = Some("debug".to_string());
        } else if let Some(level) = &self.log_level {
            config.filter = Some(level.clone());
        }
        if let Some(format) = &self.log_format
            && let Ok(parsed) = format.parse()
        {
            config.format = parsed;
        }
        if let Some(path) = &self.log_file {
            config.file_path = Some(path.clone());
        }
        config.with_env_overrides()
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a worker cluster hosting the built-in demo engine.
    Serve(ServeArgs),
}

/// Arguments for the serve command.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Number of worker processes.
    #[arg(short, long, env = "STAMPEDE_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Seconds a booted worker may go without checking in.
    #[arg(long, default_value_t = 60)]
    pub worker_timeout: u64,

    /// Seconds a spawned worker may take to boot.
    #[arg(long, default_value_t = 60)]
    pub worker_boot_timeout: u64,

    /// Seconds a terminating worker may linger before SIGKILL.
    #[arg(long, default_value_t = 30)]
    pub worker_shutdown_timeout: u64,

    /// Seconds between worker status pings.
    #[arg(long, default_value_t = 5)]
    pub worker_check_interval: u64,

    /// Which workers to cull when over target: oldest, youngest.
    #[arg(long, default_value = "oldest")]
    pub worker_culling_strategy: String,

    /// Enable fork-worker mode. The optional value is the request count at
    /// which worker 0 triggers an automatic refork (0 = manual only).
    #[arg(long, num_args = 0..=1, default_missing_value = "0")]
    pub fork_worker: Option<u64>,

    /// Shut down once every worker has been idle this many seconds.
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Suppress the single-worker configuration warning.
    #[arg(long)]
    pub silence_single_worker_warning: bool,

    /// Tag appended to process titles.
    #[arg(long, default_value = "")]
    pub tag: String,
}

impl ServeArgs {
    /// Map CLI arguments onto validated cluster options.
    pub fn to_options(&self) -> stampede::Result<ClusterOptions> {
        let worker_culling_strategy: CullingStrategy = self
            .worker_culling_strategy
            .parse()
            .map_err(StampedeError::Config)?;
        let options = ClusterOptions {
            workers: self.workers,
            worker_timeout: Duration::from_secs(self.worker_timeout),
            worker_boot_timeout: Duration::from_secs(self.worker_boot_timeout),
            worker_shutdown_timeout: Duration::from_secs(self.worker_shutdown_timeout),
            worker_check_interval: Duration::from_secs(self.worker_check_interval),
            worker_culling_strategy,
            fork_worker: match self.fork_worker {
                Some(refork_threshold) => ForkWorker::Enabled { refork_threshold },
                None => ForkWorker::Disabled,
            },
            idle_timeout: self.idle_timeout.map(Duration::from_secs),
            silence_single_worker_warning: self.silence_single_worker_warning,
            tag: self.tag.clone(),
            ..Default::default()
        };
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_args_defaults_map_to_valid_options() {
        let cli = Cli::parse_from(["stampede", "serve"]);
        let Commands::Serve(args) = &cli.command;
        let options = args.to_options().unwrap();
        assert_eq!(options.workers, 2);
        assert!(!options.fork_worker.enabled());
    }

    #[test]
    fn test_fork_worker_flag_without_value_is_manual() {
        let cli = Cli::parse_from(["stampede", "serve", "--fork-worker"]);
        let Commands::Serve(args) = &cli.command;
        let options = args.to_options().unwrap();
        assert!(options.fork_worker.enabled());
        assert_eq!(options.fork_worker.threshold(), None);
    }

    #[test]
    fn test_fork_worker_flag_with_threshold() {
        let cli = Cli::parse_from(["stampede", "serve", "--fork-worker", "1000"]);
        let Commands::Serve(args) = &cli.command;
        let options = args.to_options().unwrap();
        assert_eq!(options.fork_worker.threshold(), Some(1000));
    }

    #[test]
    fn test_zero_workers_rejected_at_validation() {
        let cli = Cli::parse_from(["stampede", "serve", "--workers", "0"]);
        let Commands::Serve(args) = &cli.command;
        assert!(args.to_options().is_err());
    }

    #[test]
    fn test_bad_culling_strategy_rejected() {
        let cli = Cli::parse_from(["stampede", "serve", "--worker-culling-strategy", "random"]);
        let Commands::Serve(args) = &cli.command;
        assert!(args.to_options().is_err());
    }
}
