//! Parse from either cli or env var

use std::{net::SocketAddr, path::PathBuf, time::Duration};

pub use clap::Parser;
use clap::ValueEnum;

/// Default external api
pub static DEFAULT_EXTERNAL_API: &str = "[::]:3333";
/// tokio worker thread name
pub static DEFAULT_THREAD_NAME: &str = "zkcoord-worker";
/// the default path to config
pub static DEFAULT_CONFIG_PATH: &str = "/var/lib/zkcoord/config.yaml";
/// default log level. Can use this argument or ZKCOORD_LOG env var
pub const DEFAULT_ZKCOORD_LOG: &str = "info";
/// seconds between heartbeat entries written to every shared cache
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 5;
/// seconds between expiry sweeps while holding the lock
pub const DEFAULT_MAINTENANCE_INTERVAL: u64 = 30;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(author, name = "zkcoord", bin_name = "zkcoord", about, long_about = None)]
/// parses from cli & environment var
pub struct Config {
    /// path to zkcoord's config
    #[arg(short, long, env, value_parser, default_value = DEFAULT_CONFIG_PATH)]
    pub config_path: PathBuf,
    /// the address the health & diagnostics api listens on
    #[arg(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
    pub external_api: SocketAddr,
    /// overrides the `service_id` from the config file
    #[arg(long, env, value_parser)]
    pub service_id: Option<String>,
    /// number of tokio worker threads, defaults to the number of logical CPUs
    #[arg(long, env, value_parser)]
    pub threads: Option<usize>,
    /// Worker thread name
    #[arg(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
    pub thread_name: String,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[arg(long, env, value_parser, default_value = DEFAULT_ZKCOORD_LOG)]
    pub zkcoord_log: String,
    /// log as "standard" (unstructured), "json" or "pretty"
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Standard)]
    pub log_format: LogFormat,
    /// heartbeat interval in seconds
    #[arg(long, env, value_parser, default_value_t = DEFAULT_HEARTBEAT_INTERVAL)]
    pub heartbeat_interval: u64,
    /// maintenance interval in seconds
    #[arg(long, env, value_parser, default_value_t = DEFAULT_MAINTENANCE_INTERVAL)]
    pub maintenance_interval: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Standard,
    Json,
    Pretty,
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval.max(1))
    }
}
