use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Ledger-assigned job identifier (decimal form of the on-chain uint256)
pub type JobId = String;

/// Worker address as supplied at registration
pub type WorkerId = String;

/// Job status, mirroring the ledger's uint8 encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Posted,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
    Disputed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Posted,
        JobStatus::Assigned,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Cancelled,
        JobStatus::Disputed,
    ];

    pub fn code(self) -> u8 {
        match self {
            JobStatus::Posted => 0,
            JobStatus::Assigned => 1,
            JobStatus::InProgress => 2,
            JobStatus::Completed => 3,
            JobStatus::Cancelled => 4,
            JobStatus::Disputed => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Posted => "posted",
            JobStatus::Assigned => "assigned",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Disputed => "disputed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Disputed
        )
    }

    /// Legal forward moves of the job state machine
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Posted, Assigned) => true,
            (Assigned, InProgress) => true,
            (InProgress, Completed) => true,
            (Posted | Assigned | InProgress, Cancelled | Disputed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    /// Accepts either the snake_case name or the numeric ledger code
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(code) = s.parse::<u8>() {
            return Self::from_code(code).ok_or_else(|| format!("unknown status code {}", code));
        }
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown status {:?}", s))
    }
}

/// Job record as mirrored from the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub client: String,
    pub assigned_worker: Option<WorkerId>,
    pub title: String,
    pub description: String,
    pub requirements: String,
    /// Reward in ether units, as formatted from the ledger amount
    pub reward: String,
    pub deadline: DateTime<Utc>,
    pub status: JobStatus,
    pub result_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Fresh job as first seen in a posting event
    pub fn posted(
        id: impl Into<JobId>,
        client: impl Into<String>,
        title: impl Into<String>,
        reward: impl Into<String>,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            client: client.into(),
            assigned_worker: None,
            title: title.into(),
            description: String::new(),
            requirements: String::new(),
            reward: reward.into(),
            deadline,
            status: JobStatus::Posted,
            result_fingerprint: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_details(mut self, description: impl Into<String>, requirements: impl Into<String>) -> Self {
        self.description = description.into();
        self.requirements = requirements.into();
        self
    }

    /// Reward as a float, zero when unparseable
    pub fn reward_value(&self) -> f64 {
        self.reward.trim().parse().unwrap_or(0.0)
    }
}

/// Worker as tracked by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub address: WorkerId,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub capabilities: BTreeSet<String>,
    pub current_jobs: BTreeSet<JobId>,
    pub max_concurrent_jobs: usize,
    pub completed_jobs: u64,
    pub rating: f64,
    pub rating_count: u64,
    pub registered_at: DateTime<Utc>,
    pub metadata: String,
}

impl Worker {
    pub fn load(&self) -> usize {
        self.current_jobs.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.current_jobs.len() < self.max_concurrent_jobs
    }

    /// Online and under its concurrency limit
    pub fn is_available(&self) -> bool {
        self.online && self.has_capacity()
    }
}

/// Best-effort host metrics at the end of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub disk_gb: f64,
}

/// Outcome of one job execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: JobId,
    pub success: bool,
    pub output: serde_json::Value,
    pub fingerprint: String,
    pub elapsed_ms: u64,
    pub resource_usage: ResourceUsage,
    pub logs: Vec<String>,
    pub error: Option<String>,
}
