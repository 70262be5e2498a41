use anyhow::{Context, Result};
use clap::Parser;
use ethers::types::Address;
use std::time::Duration;

use crate::coordinator::CoordinatorConfig;
use crate::reliability::validate_address;

#[derive(Parser, Debug, Clone)]
#[clap(name = "dispatcher")]
#[clap(about = "Nectar dispatcher - mirrors ledger jobs and coordinates compute workers")]
pub struct Args {
    #[clap(short, long, env = "PORT", default_value = "3001")]
    pub port: u16,

    #[clap(short, long, env = "RPC_URL", default_value = "http://127.0.0.1:8545")]
    pub rpc: String,

    #[clap(short, long, env = "JOB_MANAGER_ADDRESS")]
    pub job_manager: String,

    #[clap(long, env = "REPUTATION_ADDRESS")]
    pub reputation: String,

    /// Ledger poll interval
    #[clap(long, env = "POLL_INTERVAL_MS", default_value = "2000")]
    pub poll_interval_ms: u64,

    /// Replay ledger events from this block instead of starting at the head
    #[clap(long, env = "START_BLOCK")]
    pub start_block: Option<u64>,

    #[clap(long, env = "HEARTBEAT_TIMEOUT_SECS", default_value = "300")]
    pub heartbeat_timeout_secs: u64,

    #[clap(long, env = "SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,

    /// Per-worker limit unless the worker declares its own
    #[clap(long, env = "MAX_CONCURRENT_JOBS", default_value = "5")]
    pub max_concurrent_jobs: usize,

    /// How long finished jobs stay queryable
    #[clap(long, env = "COMPLETED_RETENTION_SECS", default_value = "300")]
    pub completed_retention_secs: u64,

    /// Only record new jobs; never match them to workers automatically
    #[clap(long)]
    pub no_auto_assign: bool,

    #[clap(long, env = "LEDGER_TIMEOUT_MS", default_value = "5000")]
    pub ledger_timeout_ms: u64,
}

impl Args {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            max_concurrent_jobs: self.max_concurrent_jobs.max(1),
            completed_retention: Duration::from_secs(self.completed_retention_secs),
            auto_assign: !self.no_auto_assign,
            ..CoordinatorConfig::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn job_manager_address(&self) -> Result<Address> {
        parse_address(&self.job_manager).context("invalid job manager address")
    }

    pub fn reputation_address(&self) -> Result<Address> {
        parse_address(&self.reputation).context("invalid reputation address")
    }
}

fn parse_address(addr: &str) -> Result<Address> {
    validate_address(addr)?;
    Ok(addr.parse::<Address>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JM: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
    const REP: &str = "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512";

    #[test]
    fn defaults_match_documented_values() {
        let args = Args::parse_from(["dispatcher", "--job-manager", JM, "--reputation", REP]);
        let config = args.coordinator_config();

        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_jobs, 5);
        assert_eq!(config.completed_retention, Duration::from_secs(300));
        assert!(config.auto_assign);
        assert_eq!(args.ledger_timeout(), Duration::from_millis(5000));
        assert_eq!(args.start_block, None);
        assert!(args.job_manager_address().is_ok());
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "dispatcher",
            "--job-manager",
            JM,
            "--reputation",
            REP,
            "--no-auto-assign",
            "--start-block",
            "120",
            "--max-concurrent-jobs",
            "2",
        ]);
        let config = args.coordinator_config();
        assert!(!config.auto_assign);
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(args.start_block, Some(120));
    }

    #[test]
    fn rejects_malformed_contract_address() {
        let args = Args::parse_from(["dispatcher", "--job-manager", "0x1234", "--reputation", REP]);
        assert!(args.job_manager_address().is_err());
    }
}
