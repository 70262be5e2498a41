use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::{
    abi::RawLog,
    contract::{abigen, EthLogDecode},
    providers::{Http, Middleware, Provider},
    types::{Address, Filter, Log, U256},
    utils::format_ether,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::types::{Job, JobStatus};

// Generate contract bindings
abigen!(
    JobManager,
    r#"[
        event JobPosted(uint256 indexed jobId, address indexed client, string title, uint256 reward, uint256 deadline)
        event JobAssigned(uint256 indexed jobId, address indexed provider)
        event JobStarted(uint256 indexed jobId)
        event JobCompleted(uint256 indexed jobId, string resultHash)
        event JobCancelled(uint256 indexed jobId)
        function getJob(uint256 jobId) external view returns ((uint256, address, address, string, string, string, uint256, uint256, uint8, string, uint256, uint256))
    ]"#
);

/// `getJob` record: id, client, provider, title, description, requirements,
/// reward, deadline, status, resultHash, createdAt, completedAt
pub type JobRecord = (
    U256,
    Address,
    Address,
    String,
    String,
    String,
    U256,
    U256,
    u8,
    String,
    U256,
    U256,
);

abigen!(
    Reputation,
    r#"[
        event ProviderRegistered(address indexed provider, string metadata)
        event ProviderRated(uint256 indexed ratingId, uint256 indexed jobId, address indexed provider, address client, uint8 score, string comment)
    ]"#
);

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    #[error("job {0} not found on ledger")]
    NotFound(String),

    #[error("event decode error: {0}")]
    Decode(String),
}

impl LedgerError {
    /// The node could not be reached or answered with a transport error;
    /// the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Provider(_))
    }
}

/// Ledger event, decoded into domain terms
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerEvent {
    JobPosted {
        job_id: String,
        client: String,
        title: String,
        reward: String,
        deadline: DateTime<Utc>,
    },
    JobAssigned {
        job_id: String,
        worker: String,
    },
    JobStarted {
        job_id: String,
    },
    JobCompleted {
        job_id: String,
        result_fingerprint: String,
    },
    JobCancelled {
        job_id: String,
    },
    WorkerRegistered {
        worker: String,
        metadata: String,
    },
    WorkerRated {
        job_id: String,
        worker: String,
        score: u8,
    },
}

impl LedgerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LedgerEvent::JobPosted { .. } => "JobPosted",
            LedgerEvent::JobAssigned { .. } => "JobAssigned",
            LedgerEvent::JobStarted { .. } => "JobStarted",
            LedgerEvent::JobCompleted { .. } => "JobCompleted",
            LedgerEvent::JobCancelled { .. } => "JobCancelled",
            LedgerEvent::WorkerRegistered { .. } => "WorkerRegistered",
            LedgerEvent::WorkerRated { .. } => "WorkerRated",
        }
    }
}

/// Event plus its position in the chain
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub tx_hash: Option<String>,
    pub event: LedgerEvent,
}

/// Read side of the ledger the dispatcher depends on
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Current chain head
    async fn block_number(&self) -> Result<u64, LedgerError>;

    /// Decoded events in `[from_block, to_block]`, ordered by block and log index.
    /// Logs that fail to decode are dropped with a warning.
    async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<ObservedEvent>, LedgerError>;

    /// Full job record, used to backfill what a bare event omits
    async fn fetch_job(&self, job_id: &str) -> Result<Job, LedgerError>;
}

/// Ledger client over JSON-RPC
#[derive(Clone)]
pub struct EthLedger {
    provider: Arc<Provider<Http>>,
    job_manager: JobManager<Provider<Http>>,
    job_manager_addr: Address,
    reputation_addr: Address,
}

impl EthLedger {
    /// Build a client whose every RPC call is bounded by `request_timeout`
    pub fn new(
        rpc_url: &str,
        job_manager_addr: Address,
        reputation_addr: Address,
        request_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let url = reqwest::Url::parse(rpc_url)
            .map_err(|e| LedgerError::Provider(format!("invalid rpc url: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LedgerError::Provider(e.to_string()))?;

        let provider = Arc::new(Provider::new(Http::new_with_client(url, client)));
        let job_manager = JobManager::new(job_manager_addr, provider.clone());

        Ok(Self {
            provider,
            job_manager,
            job_manager_addr,
            reputation_addr,
        })
    }

    pub async fn chain_id(&self) -> Result<u64, LedgerError> {
        let id = self
            .provider
            .get_chainid()
            .await
            .map_err(|e| LedgerError::Provider(e.to_string()))?;
        Ok(id.low_u64())
    }

    fn decode(&self, log: &Log) -> Result<LedgerEvent, LedgerError> {
        let raw = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };

        if log.address == self.job_manager_addr {
            let event = JobManagerEvents::decode_log(&raw)
                .map_err(|e| LedgerError::Decode(e.to_string()))?;
            Ok(match event {
                JobManagerEvents::JobPostedFilter(e) => LedgerEvent::JobPosted {
                    job_id: e.job_id.to_string(),
                    client: format!("{:?}", e.client),
                    title: e.title,
                    reward: format_ether(e.reward),
                    deadline: timestamp(e.deadline),
                },
                JobManagerEvents::JobAssignedFilter(e) => LedgerEvent::JobAssigned {
                    job_id: e.job_id.to_string(),
                    worker: format!("{:?}", e.provider),
                },
                JobManagerEvents::JobStartedFilter(e) => LedgerEvent::JobStarted {
                    job_id: e.job_id.to_string(),
                },
                JobManagerEvents::JobCompletedFilter(e) => LedgerEvent::JobCompleted {
                    job_id: e.job_id.to_string(),
                    result_fingerprint: e.result_hash,
                },
                JobManagerEvents::JobCancelledFilter(e) => LedgerEvent::JobCancelled {
                    job_id: e.job_id.to_string(),
                },
            })
        } else if log.address == self.reputation_addr {
            let event = ReputationEvents::decode_log(&raw)
                .map_err(|e| LedgerError::Decode(e.to_string()))?;
            Ok(match event {
                ReputationEvents::ProviderRegisteredFilter(e) => LedgerEvent::WorkerRegistered {
                    worker: format!("{:?}", e.provider),
                    metadata: e.metadata,
                },
                ReputationEvents::ProviderRatedFilter(e) => LedgerEvent::WorkerRated {
                    job_id: e.job_id.to_string(),
                    worker: format!("{:?}", e.provider),
                    score: e.score,
                },
            })
        } else {
            Err(LedgerError::Decode(format!("log from unexpected contract {:?}", log.address)))
        }
    }
}

#[async_trait]
impl Ledger for EthLedger {
    async fn block_number(&self) -> Result<u64, LedgerError> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| LedgerError::Provider(e.to_string()))?;
        Ok(block.as_u64())
    }

    async fn events(&self, from_block: u64, to_block: u64) -> Result<Vec<ObservedEvent>, LedgerError> {
        let filter = Filter::new()
            .address(vec![self.job_manager_addr, self.reputation_addr])
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| LedgerError::Provider(e.to_string()))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(to_block);
            match self.decode(&log) {
                Ok(event) => events.push(ObservedEvent {
                    block_number,
                    log_index: log.log_index.map(|i| i.low_u64()).unwrap_or_default(),
                    tx_hash: log.transaction_hash.map(|h| format!("{:?}", h)),
                    event,
                }),
                Err(e) => warn!("Dropping log in block {}: {}", block_number, e),
            }
        }

        events.sort_by_key(|e| (e.block_number, e.log_index));
        Ok(events)
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Job, LedgerError> {
        let id = U256::from_dec_str(job_id)
            .map_err(|_| LedgerError::InvalidJobId(job_id.to_string()))?;

        let record = self
            .job_manager
            .get_job(id)
            .call()
            .await
            .map_err(|e| LedgerError::Provider(e.to_string()))?;

        job_from_record(job_id, record)
    }
}

fn job_from_record(job_id: &str, record: JobRecord) -> Result<Job, LedgerError> {
    let (
        id,
        client,
        provider,
        title,
        description,
        requirements,
        reward,
        deadline,
        status,
        result_hash,
        created_at,
        completed_at,
    ) = record;

    // unknown ids come back as a zeroed struct
    if id.is_zero() {
        return Err(LedgerError::NotFound(job_id.to_string()));
    }

    let status = JobStatus::from_code(status)
        .ok_or_else(|| LedgerError::Decode(format!("unknown job status {}", status)))?;

    Ok(Job {
        id: id.to_string(),
        client: format!("{:?}", client),
        assigned_worker: (!provider.is_zero()).then(|| format!("{:?}", provider)),
        title,
        description,
        requirements,
        reward: format_ether(reward),
        deadline: timestamp(deadline),
        status,
        result_fingerprint: (!result_hash.is_empty()).then_some(result_hash),
        created_at: timestamp(created_at),
        completed_at: (!completed_at.is_zero()).then(|| timestamp(completed_at)),
    })
}

/// Unix seconds from the ledger, clamped into chrono's range
fn timestamp(secs: U256) -> DateTime<Utc> {
    let secs = if secs > U256::from(i64::MAX as u64) {
        i64::MAX
    } else {
        secs.as_u64() as i64
    };
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}
