use serde::{Deserialize, Serialize};

use crate::types::{Job, JobId, WorkerId};

/// State-change message broadcast to every observer.
///
/// Serialized as `{"type": ..., "data": {...}}`. Messages meant for a single
/// worker carry a `target` field and observers filter on it themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Notification {
    NewJobAvailable {
        job: Job,
    },
    JobAssigned {
        job: Job,
        target: WorkerId,
    },
    JobAssignmentProcessed {
        job_id: JobId,
        worker: WorkerId,
    },
    JobStarted {
        job_id: JobId,
        worker: Option<WorkerId>,
    },
    JobCompletionProcessed {
        job_id: JobId,
        result_fingerprint: String,
    },
    JobFailed {
        job_id: JobId,
        worker: WorkerId,
        error: String,
    },
    JobCancelled {
        job_id: JobId,
    },
    WorkerRegistered {
        worker: WorkerId,
        capabilities: Vec<String>,
    },
    WorkerStatus {
        worker: WorkerId,
        online: bool,
    },
    WorkerRated {
        worker: WorkerId,
        job_id: JobId,
        score: u8,
    },
    SubscriptionConfirmed {
        topic: String,
    },
}

impl Notification {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::NewJobAvailable { .. } => "new_job_available",
            Notification::JobAssigned { .. } => "job_assigned",
            Notification::JobAssignmentProcessed { .. } => "job_assignment_processed",
            Notification::JobStarted { .. } => "job_started",
            Notification::JobCompletionProcessed { .. } => "job_completion_processed",
            Notification::JobFailed { .. } => "job_failed",
            Notification::JobCancelled { .. } => "job_cancelled",
            Notification::WorkerRegistered { .. } => "worker_registered",
            Notification::WorkerStatus { .. } => "worker_status",
            Notification::WorkerRated { .. } => "worker_rated",
            Notification::SubscriptionConfirmed { .. } => "subscription_confirmed",
        }
    }

    /// Worker this message is addressed to, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            Notification::JobAssigned { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// Frames observers may send over the subscription channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeJobUpdates {
        #[serde(default)]
        worker: Option<WorkerId>,
    },
}
