use nectar_common::{JobStatus, LedgerError};

/// Precondition failures surfaced by the registries and the coordinator.
///
/// A returned error always means nothing was mutated.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("worker {0} not found")]
    WorkerNotFound(String),

    #[error("no available worker matches the requirements")]
    NoMatch,

    #[error("job {job_id} cannot move from {from} to {to}")]
    IllegalTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {job_id} is not assigned to worker {worker}")]
    NotAssigned { job_id: String, worker: String },

    #[error("worker {0} is at capacity")]
    CapacityExceeded(String),

    #[error("job {job_id} is already assigned to worker {worker}")]
    AlreadyAssigned { job_id: String, worker: String },

    #[error("completion of job {0} has an empty result fingerprint")]
    EmptyFingerprint(String),

    #[error("worker {worker} still holds {jobs} active job(s)")]
    WorkerBusy { worker: String, jobs: usize },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl DispatchError {
    /// Machine-readable reason code
    pub fn reason(&self) -> &'static str {
        match self {
            DispatchError::JobNotFound(_) => "job_not_found",
            DispatchError::WorkerNotFound(_) => "worker_not_found",
            DispatchError::NoMatch => "no_match",
            DispatchError::IllegalTransition { .. } => "illegal_transition",
            DispatchError::NotAssigned { .. } => "not_assigned",
            DispatchError::CapacityExceeded(_) => "capacity_exceeded",
            DispatchError::AlreadyAssigned { .. } => "already_assigned",
            DispatchError::EmptyFingerprint(_) => "empty_fingerprint",
            DispatchError::WorkerBusy { .. } => "worker_busy",
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::Ledger(_) => "ledger",
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
