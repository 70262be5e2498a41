use nectar_common::{Job, JobStatus, Ledger, LedgerError, LedgerEvent, ObservedEvent};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::coordinator::Coordinator;
use crate::error::{DispatchError, Result};

/// Turns ledger events into coordinator calls, checking current state first so that
/// redelivered or out-of-order events converge on the same state.
pub struct Reconciler {
    coordinator: Arc<Coordinator>,
    ledger: Arc<dyn Ledger>,
}

impl Reconciler {
    pub fn new(coordinator: Arc<Coordinator>, ledger: Arc<dyn Ledger>) -> Self {
        Self { coordinator, ledger }
    }

    /// Apply one observed event.
    ///
    /// Precondition failures are logged and the event is dropped. Transient ledger
    /// failures are returned so the caller can retry the event later.
    pub async fn handle(&self, observed: &ObservedEvent) -> std::result::Result<(), LedgerError> {
        match self.apply(&observed.event).await {
            Err(DispatchError::Ledger(e)) if e.is_transient() => Err(e),
            Err(e) => {
                warn!(
                    "{} in block {} (log {}) not applied: {}",
                    observed.event.name(),
                    observed.block_number,
                    observed.log_index,
                    e
                );
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    pub async fn apply(&self, event: &LedgerEvent) -> Result<()> {
        match event {
            LedgerEvent::JobPosted {
                job_id,
                client,
                title,
                reward,
                deadline,
            } => {
                if self.coordinator.has_job(job_id).await || self.coordinator.is_retired(job_id).await {
                    debug!("JobPosted for known job {} ignored", job_id);
                    return Ok(());
                }

                let mut job = Job::posted(job_id.as_str(), client.as_str(), title.as_str(), reward.as_str(), *deadline);
                match self.ledger.fetch_job(job_id).await {
                    Ok(record) => {
                        job.description = record.description;
                        job.requirements = record.requirements;
                        job.created_at = record.created_at;
                    }
                    Err(e) if e.is_transient() => return Err(e.into()),
                    Err(e) => warn!("Could not fetch details for job {}: {}", job_id, e),
                }
                self.coordinator.submit_new_job(job).await?;
            }

            LedgerEvent::JobAssigned { job_id, worker } => {
                if !self.ensure_known(job_id).await? {
                    return Ok(());
                }
                self.coordinator.notify_assignment(job_id, worker).await?;
            }

            LedgerEvent::JobStarted { job_id } => {
                if !self.ensure_known(job_id).await? {
                    return Ok(());
                }
                self.fill_missed_assignment(job_id).await?;
                self.coordinator.confirm_started(job_id).await?;
            }

            LedgerEvent::JobCompleted {
                job_id,
                result_fingerprint,
            } => {
                if !self.ensure_known(job_id).await? {
                    return Ok(());
                }
                self.fill_missed_assignment(job_id).await?;
                self.coordinator.confirm_completed(job_id, result_fingerprint).await?;
            }

            LedgerEvent::JobCancelled { job_id } => {
                if !self.ensure_known(job_id).await? {
                    return Ok(());
                }
                self.coordinator.cancel_job(job_id).await?;
            }

            LedgerEvent::WorkerRegistered { worker, metadata } => {
                self.coordinator.register_worker(worker, metadata).await?;
            }

            LedgerEvent::WorkerRated {
                job_id,
                worker,
                score,
            } => {
                self.coordinator.rate_worker(job_id, worker, *score).await?;
            }
        }
        Ok(())
    }

    /// Make sure the job is tracked, backfilling it from the ledger as a fresh
    /// posting. Returns false for retired jobs, whose events are ignored.
    async fn ensure_known(&self, job_id: &str) -> Result<bool> {
        if self.coordinator.has_job(job_id).await {
            return Ok(true);
        }
        if self.coordinator.is_retired(job_id).await {
            debug!("Event for retired job {} ignored", job_id);
            return Ok(false);
        }

        let record = self.ledger.fetch_job(job_id).await?;
        let job = Job {
            status: JobStatus::Posted,
            assigned_worker: None,
            result_fingerprint: None,
            completed_at: None,
            ..record
        };
        self.coordinator.track_job(job).await;
        Ok(true)
    }

    /// A job still Posted locally when a later event arrives missed its assignment;
    /// recover the worker from the ledger record.
    async fn fill_missed_assignment(&self, job_id: &str) -> Result<()> {
        if self.coordinator.job(job_id).await?.status != JobStatus::Posted {
            return Ok(());
        }

        let record = self.ledger.fetch_job(job_id).await?;
        if let Some(worker) = record.assigned_worker {
            debug!("Recovering missed assignment of job {} to {}", job_id, worker);
            self.coordinator.notify_assignment(job_id, &worker).await?;
        }
        Ok(())
    }
}
