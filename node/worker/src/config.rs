use clap::Parser;
use std::time::Duration;

use crate::agent::AgentConfig;
use crate::engine::EngineConfig;

#[derive(Parser, Debug, Clone)]
#[clap(name = "worker")]
#[clap(about = "Nectar worker - executes compute jobs assigned by the dispatcher")]
pub struct Args {
    /// Worker identity; a fresh id is generated when omitted
    #[clap(short, long, env = "WORKER_ADDRESS")]
    pub address: Option<String>,

    #[clap(short, long, env = "DISPATCHER_URL", default_value = "http://127.0.0.1:3001")]
    pub dispatcher: String,

    /// Comma-separated capability tags
    #[clap(short, long, env = "WORKER_CAPABILITIES", default_value = "cpu,general,docker")]
    pub capabilities: String,

    #[clap(long, env = "MAX_CONCURRENT_JOBS", default_value = "3")]
    pub max_concurrent_jobs: usize,

    #[clap(long, env = "HEARTBEAT_INTERVAL_SECS", default_value = "30")]
    pub heartbeat_interval_secs: u64,

    #[clap(long, env = "RECONNECT_DELAY_SECS", default_value = "5")]
    pub reconnect_delay_secs: u64,

    /// Multiplier on simulated phase durations (0 runs jobs instantly)
    #[clap(long, env = "TIME_SCALE", default_value = "1.0")]
    pub time_scale: f64,

    #[clap(long, env = "MAX_EXECUTION_SECS", default_value = "600")]
    pub max_execution_secs: u64,

    #[clap(long, env = "REQUEST_TIMEOUT_MS", default_value = "5000")]
    pub request_timeout_ms: u64,
}

impl Args {
    pub fn agent_config(&self) -> AgentConfig {
        let defaults = AgentConfig::default();
        AgentConfig {
            address: self
                .address
                .clone()
                .filter(|a| !a.trim().is_empty())
                .unwrap_or(defaults.address),
            capabilities: self
                .capabilities
                .split(',')
                .map(|c| c.trim().to_lowercase())
                .filter(|c| !c.is_empty())
                .collect(),
            max_concurrent_jobs: self.max_concurrent_jobs.max(1),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            time_scale: self.time_scale.max(0.0),
            max_execution: Duration::from_secs(self.max_execution_secs.max(1)),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
