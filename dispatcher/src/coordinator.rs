use chrono::{DateTime, Utc};
use nectar_common::{Job, JobId, JobStatus, Notification, Worker, WorkerId};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, Result};
use crate::jobs::{JobFilter, JobRegistry, JobStats};
use crate::matcher::{self, Preference};
use crate::websocket::{Notifier, CHANNEL_CAPACITY};
use crate::workers::{WorkerFilter, WorkerRegistry, WorkerStats};

/// Tunables for the coordinator and its background sweep
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub completed_retention: Duration,
    pub auto_assign: bool,
    pub preference: Preference,
    pub channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            max_concurrent_jobs: 5,
            completed_retention: Duration::from_secs(300),
            auto_assign: true,
            preference: Preference::HighestRated,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Everything guarded by the coordinator lock
#[derive(Debug)]
struct Registries {
    jobs: JobRegistry,
    workers: WorkerRegistry,
    /// Local assignments the ledger has not confirmed yet
    unconfirmed: HashSet<JobId>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Stats {
    pub jobs: JobStats,
    pub workers: WorkerStats,
    pub observers: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub offline: Vec<WorkerId>,
    pub pruned: Vec<JobId>,
}

/// Owns both registries behind one lock and pairs every mutation with a broadcast.
///
/// Each operation checks all of its preconditions before touching state, so an
/// error return means nothing changed.
pub struct Coordinator {
    state: RwLock<Registries>,
    notifier: Notifier,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            state: RwLock::new(Registries {
                jobs: JobRegistry::new(),
                workers: WorkerRegistry::new(config.max_concurrent_jobs),
                unconfirmed: HashSet::new(),
            }),
            notifier: Notifier::new(config.channel_capacity),
            config,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ---- jobs ------------------------------------------------------------

    /// Record a newly posted job and try to place it.
    ///
    /// Returns the worker picked by auto-match, if any. A job that is already known
    /// (or was retired) is left alone.
    pub async fn submit_new_job(&self, job: Job) -> Result<Option<WorkerId>> {
        let mut state = self.state.write().await;
        let job_id = job.id.clone();
        let requirements = job.requirements.clone();

        if !state.jobs.insert(job.clone()) {
            debug!("Job {} already known, ignoring posting", job_id);
            return Ok(None);
        }
        info!("New job {}: {}", job_id, job.title);
        self.notifier.publish(Notification::NewJobAvailable { job });

        if !self.config.auto_assign {
            return Ok(None);
        }

        let picked = matcher::find_best(state.workers.available(), &requirements, self.config.preference)
            .map(|w| w.address.clone());
        let Some(worker) = picked else {
            info!("No available worker for job {}", job_id);
            return Ok(None);
        };

        let job = state.jobs.assign(&job_id, &worker)?.clone();
        state.workers.assign(&worker, &job_id);
        state.unconfirmed.insert(job_id.clone());
        info!("Job {} matched to worker {}", job_id, worker);

        self.notifier.publish(Notification::JobAssigned {
            job,
            target: worker.clone(),
        });
        Ok(Some(worker))
    }

    /// Record a job learned from the ledger without trying to place it.
    /// Returns false if it is already known or retired.
    pub async fn track_job(&self, job: Job) -> bool {
        let mut state = self.state.write().await;
        if !state.jobs.insert(job.clone()) {
            return false;
        }
        info!("Backfilled job {} from ledger", job.id);
        self.notifier.publish(Notification::NewJobAvailable { job });
        true
    }

    /// Apply a ledger-confirmed assignment. Returns false when nothing changed.
    ///
    /// The job always follows the ledger. The worker's slot is taken only when the
    /// worker is registered and has room; otherwise the gap is logged.
    pub async fn notify_assignment(&self, job_id: &str, worker: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let job = state.jobs.get(job_id)?.clone();

        match job.status {
            JobStatus::Posted => {
                let job = state.jobs.assign(job_id, worker)?.clone();
                take_slot(&mut state.workers, worker, job_id);
                info!("Job {} assigned to worker {}", job_id, worker);
                self.publish_assignment(job, worker);
                Ok(true)
            }
            JobStatus::Assigned if job.assigned_worker.as_deref() == Some(worker) => {
                // confirmation of a local assignment; plain redelivery otherwise
                if state.unconfirmed.remove(job_id) {
                    self.notifier.publish(Notification::JobAssignmentProcessed {
                        job_id: job_id.to_string(),
                        worker: worker.to_string(),
                    });
                    Ok(true)
                } else {
                    debug!("Assignment of job {} to {} already applied", job_id, worker);
                    Ok(false)
                }
            }
            JobStatus::Assigned => {
                let previous = job.assigned_worker.clone().unwrap_or_default();
                warn!(
                    "Ledger assigned job {} to {} instead of {}, moving assignment",
                    job_id, worker, previous
                );
                if state.workers.get(&previous).map_or(false, |w| w.current_jobs.contains(job_id)) {
                    state.workers.release(&previous, job_id);
                }
                take_slot(&mut state.workers, worker, job_id);
                let job = state.jobs.reassign(job_id, worker)?.clone();
                state.unconfirmed.remove(job_id);
                self.publish_assignment(job, worker);
                Ok(true)
            }
            status => {
                debug!("Ignoring assignment of job {} in status {}", job_id, status);
                Ok(false)
            }
        }
    }

    /// Admin override: place a Posted job on a specific registered worker
    pub async fn force_assign(&self, job_id: &str, worker: &str) -> Result<Job> {
        let mut state = self.state.write().await;
        state.jobs.ensure_transition(job_id, JobStatus::Assigned)?;
        state.workers.check_assign(worker, job_id)?;

        let job = state.jobs.assign(job_id, worker)?.clone();
        state.workers.assign(worker, job_id);
        state.unconfirmed.insert(job_id.to_string());
        info!("Job {} force-assigned to worker {}", job_id, worker);

        self.notifier.publish(Notification::JobAssigned {
            job: job.clone(),
            target: worker.to_string(),
        });
        Ok(job)
    }

    /// Worker start signal: Assigned -> InProgress
    pub async fn report_start(&self, job_id: &str, worker: &str) -> Result<Job> {
        let mut state = self.state.write().await;
        ensure_holder(state.jobs.get(job_id)?, worker)?;
        let job = state.jobs.start(job_id)?.clone();
        info!("Job {} started by worker {}", job_id, worker);

        self.notifier.publish(Notification::JobStarted {
            job_id: job_id.to_string(),
            worker: Some(worker.to_string()),
        });
        Ok(job)
    }

    /// Ledger start event. Returns false when the job is already past Assigned.
    pub async fn confirm_started(&self, job_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let job = state.jobs.get(job_id)?;
        if matches!(job.status, JobStatus::InProgress) || job.status.is_terminal() {
            debug!("Job {} already {}, start ignored", job_id, job.status);
            return Ok(false);
        }

        let job = state.jobs.start(job_id)?.clone();
        self.notifier.publish(Notification::JobStarted {
            job_id: job_id.to_string(),
            worker: job.assigned_worker,
        });
        Ok(true)
    }

    /// Worker completion report: InProgress -> Completed and the slot is freed
    pub async fn report_completion(&self, job_id: &str, worker: &str, fingerprint: &str) -> Result<Job> {
        let mut state = self.state.write().await;
        ensure_holder(state.jobs.get(job_id)?, worker)?;

        let job = state.jobs.complete(job_id, fingerprint, Utc::now())?.clone();
        state.workers.release(worker, job_id);
        count_completion(&mut state.workers, worker, job_id);
        state.unconfirmed.remove(job_id);
        info!("Job {} completed by worker {}", job_id, worker);

        self.notifier.publish(Notification::JobCompletionProcessed {
            job_id: job_id.to_string(),
            result_fingerprint: fingerprint.to_string(),
        });
        Ok(job)
    }

    /// Ledger completion event.
    ///
    /// A job still in Assigned (start event missed) passes through InProgress. A job
    /// that is already Completed keeps its status and adopts the ledger fingerprint.
    pub async fn confirm_completed(&self, job_id: &str, fingerprint: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let job = state.jobs.get(job_id)?.clone();

        if job.status == JobStatus::Completed {
            if job.result_fingerprint.as_deref() != Some(fingerprint) && !fingerprint.trim().is_empty() {
                warn!(
                    "Job {} completed with fingerprint {:?} but ledger reports {}, adopting ledger value",
                    job_id, job.result_fingerprint, fingerprint
                );
                state.jobs.set_fingerprint(job_id, fingerprint)?;
                return Ok(true);
            }
            return Ok(false);
        }

        if fingerprint.trim().is_empty() {
            return Err(DispatchError::EmptyFingerprint(job_id.to_string()));
        }
        if job.status == JobStatus::Assigned {
            state.jobs.start(job_id)?;
        } else {
            state.jobs.ensure_transition(job_id, JobStatus::Completed)?;
        }
        state.jobs.complete(job_id, fingerprint, Utc::now())?;

        if let Some(worker) = job.assigned_worker.as_deref() {
            if state.workers.get(worker).map_or(false, |w| w.current_jobs.contains(job_id)) {
                state.workers.release(worker, job_id);
            }
            count_completion(&mut state.workers, worker, job_id);
        }
        state.unconfirmed.remove(job_id);
        info!("Job {} completed on ledger", job_id);

        self.notifier.publish(Notification::JobCompletionProcessed {
            job_id: job_id.to_string(),
            result_fingerprint: fingerprint.to_string(),
        });
        Ok(true)
    }

    /// Worker failure report. The job is cancelled and the slot freed.
    pub async fn report_failure(&self, job_id: &str, worker: &str, error: &str) -> Result<Job> {
        let mut state = self.state.write().await;
        ensure_holder(state.jobs.get(job_id)?, worker)?;

        let job = state.jobs.cancel(job_id, Utc::now())?.clone();
        state.workers.release(worker, job_id);
        state.unconfirmed.remove(job_id);
        warn!("Job {} failed on worker {}: {}", job_id, worker, error);

        self.notifier.publish(Notification::JobFailed {
            job_id: job_id.to_string(),
            worker: worker.to_string(),
            error: error.to_string(),
        });
        self.notifier.publish(Notification::JobCancelled {
            job_id: job_id.to_string(),
        });
        Ok(job)
    }

    /// Cancel a job. Returns false when it was already cancelled.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let job = state.jobs.get(job_id)?.clone();
        if job.status == JobStatus::Cancelled {
            return Ok(false);
        }

        state.jobs.cancel(job_id, Utc::now())?;
        if let Some(worker) = job.assigned_worker.as_deref() {
            if state.workers.get(worker).map_or(false, |w| w.current_jobs.contains(job_id)) {
                state.workers.release(worker, job_id);
            }
        }
        state.unconfirmed.remove(job_id);
        info!("Job {} cancelled", job_id);

        self.notifier.publish(Notification::JobCancelled {
            job_id: job_id.to_string(),
        });
        Ok(true)
    }

    pub async fn has_job(&self, job_id: &str) -> bool {
        self.state.read().await.jobs.contains(job_id)
    }

    pub async fn is_retired(&self, job_id: &str) -> bool {
        self.state.read().await.jobs.is_retired(job_id)
    }

    pub async fn job(&self, job_id: &str) -> Result<Job> {
        self.state.read().await.jobs.get(job_id).cloned()
    }

    pub async fn query_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        self.state.read().await.jobs.list(filter)
    }

    // ---- workers ---------------------------------------------------------

    pub async fn register_worker(&self, address: &str, metadata: &str) -> Result<Worker> {
        let address = address.trim();
        if address.is_empty() {
            return Err(DispatchError::InvalidRequest("worker address is required".into()));
        }

        let mut state = self.state.write().await;
        state.workers.register(address, metadata, Utc::now());
        let worker = state.workers.get(address)?.clone();

        self.notifier.publish(Notification::WorkerRegistered {
            worker: worker.address.clone(),
            capabilities: worker.capabilities.iter().cloned().collect(),
        });
        Ok(worker)
    }

    pub async fn heartbeat(&self, worker: &str) -> Result<Worker> {
        let mut state = self.state.write().await;
        if state.workers.heartbeat(worker, Utc::now())? {
            self.notifier.publish(Notification::WorkerStatus {
                worker: worker.to_string(),
                online: true,
            });
        }
        Ok(state.workers.get(worker)?.clone())
    }

    pub async fn set_online(&self, worker: &str, online: bool) -> Result<Worker> {
        let mut state = self.state.write().await;
        if state.workers.set_online(worker, online, Utc::now())? != online {
            self.notifier.publish(Notification::WorkerStatus {
                worker: worker.to_string(),
                online,
            });
        }
        Ok(state.workers.get(worker)?.clone())
    }

    /// Replace a worker's capability tags; observers see it as a re-registration
    pub async fn update_capabilities(&self, worker: &str, tags: &[String]) -> Result<Worker> {
        let mut state = self.state.write().await;
        let capabilities = state
            .workers
            .update_capabilities(worker, tags.iter().map(String::as_str))?;
        info!("Worker {} capabilities now {:?}", worker, capabilities);

        self.notifier.publish(Notification::WorkerRegistered {
            worker: worker.to_string(),
            capabilities: capabilities.into_iter().collect(),
        });
        Ok(state.workers.get(worker)?.clone())
    }

    /// Fold a 0-5 score into the worker's running rating
    pub async fn rate_worker(&self, job_id: &str, worker: &str, score: u8) -> Result<f64> {
        if score > 5 {
            return Err(DispatchError::InvalidRequest(format!("score {} out of range 0-5", score)));
        }

        let mut state = self.state.write().await;
        let rating = state.workers.record_rating(worker, score)?;
        info!("Worker {} rated {} for job {} (now {:.2})", worker, score, job_id, rating);

        self.notifier.publish(Notification::WorkerRated {
            worker: worker.to_string(),
            job_id: job_id.to_string(),
            score,
        });
        Ok(rating)
    }

    pub async fn remove_worker(&self, worker: &str) -> Result<Worker> {
        let mut state = self.state.write().await;
        let removed = state.workers.remove(worker)?;
        info!("Removed worker {}", worker);

        self.notifier.publish(Notification::WorkerStatus {
            worker: worker.to_string(),
            online: false,
        });
        Ok(removed)
    }

    pub async fn worker(&self, worker: &str) -> Result<Worker> {
        self.state.read().await.workers.get(worker).cloned()
    }

    pub async fn query_workers(&self, filter: &WorkerFilter) -> Vec<Worker> {
        self.state.read().await.workers.list(filter)
    }

    pub async fn worker_jobs(&self, worker: &str) -> Result<Vec<JobId>> {
        self.state.read().await.workers.current_jobs(worker)
    }

    pub async fn find_best_worker(&self, requirements: &str, preference: Preference) -> Option<Worker> {
        let state = self.state.read().await;
        matcher::find_best(state.workers.available(), requirements, preference).cloned()
    }

    pub async fn top_workers(&self, limit: usize) -> Vec<Worker> {
        self.state.read().await.workers.top(limit)
    }

    pub async fn stats(&self) -> Stats {
        let state = self.state.read().await;
        Stats {
            jobs: state.jobs.stats(),
            workers: state.workers.stats(),
            observers: self.notifier.observers(),
        }
    }

    // ---- liveness --------------------------------------------------------

    /// Mark silent workers offline and prune old terminal jobs
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut state = self.state.write().await;
        let offline = state.workers.sweep(now, window(self.config.heartbeat_timeout));
        let pruned = state.jobs.prune(now, window(self.config.completed_retention));

        for worker in &offline {
            self.notifier.publish(Notification::WorkerStatus {
                worker: worker.clone(),
                online: false,
            });
        }
        if !pruned.is_empty() {
            debug!("Pruned {} finished job(s)", pruned.len());
        }
        SweepReport { offline, pruned }
    }

    /// Run the sweep on a fixed interval until the task is dropped
    pub async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = self.sweep(Utc::now()).await;
            if !report.offline.is_empty() {
                info!("Sweep marked {} worker(s) offline", report.offline.len());
            }
        }
    }

    fn publish_assignment(&self, job: Job, worker: &str) {
        let job_id = job.id.clone();
        self.notifier.publish(Notification::JobAssigned {
            job,
            target: worker.to_string(),
        });
        self.notifier.publish(Notification::JobAssignmentProcessed {
            job_id,
            worker: worker.to_string(),
        });
    }
}

fn ensure_holder(job: &Job, worker: &str) -> Result<()> {
    if job.assigned_worker.as_deref() != Some(worker) {
        return Err(DispatchError::NotAssigned {
            job_id: job.id.clone(),
            worker: worker.to_string(),
        });
    }
    Ok(())
}

/// Put a ledger-assigned job on the worker's books when it can take it
fn take_slot(workers: &mut WorkerRegistry, worker: &str, job_id: &str) {
    if !workers.assign(worker, job_id) {
        warn!(
            "Ledger assignment of job {} to {} recorded without a worker slot",
            job_id, worker
        );
    }
}

fn count_completion(workers: &mut WorkerRegistry, worker: &str, job_id: &str) {
    if let Err(e) = workers.record_completion(worker) {
        warn!("Completion of job {} not credited to {}: {}", job_id, worker, e);
    }
}

fn window(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Coordinator {
        Coordinator::new(CoordinatorConfig {
            auto_assign: false,
            ..CoordinatorConfig::default()
        })
    }

    fn posted(id: &str, requirements: &str) -> Job {
        Job::posted(id, "0xclient", "Job", "1", Utc::now()).with_details("", requirements)
    }

    #[tokio::test]
    async fn auto_assign_places_job_on_best_worker() {
        let c = Coordinator::new(CoordinatorConfig::default());
        c.register_worker("w1", "cpu").await.unwrap();
        c.register_worker("w2", "gpu,ml").await.unwrap();
        let mut rx = c.notifier().subscribe();

        let picked = c.submit_new_job(posted("1", "gpu")).await.unwrap();
        assert_eq!(picked.as_deref(), Some("w2"));

        assert!(matches!(rx.recv().await.unwrap(), Notification::NewJobAvailable { .. }));
        match rx.recv().await.unwrap() {
            Notification::JobAssigned { job, target } => {
                assert_eq!(target, "w2");
                assert_eq!(job.status, JobStatus::Assigned);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(c.worker_jobs("w2").await.unwrap(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn ledger_confirmation_of_local_assignment_is_reported_once() {
        let c = Coordinator::new(CoordinatorConfig::default());
        c.register_worker("w1", "cpu").await.unwrap();
        c.submit_new_job(posted("1", "cpu")).await.unwrap();

        assert!(c.notify_assignment("1", "w1").await.unwrap());
        assert!(!c.notify_assignment("1", "w1").await.unwrap());
        assert_eq!(c.worker("w1").await.unwrap().load(), 1);
    }

    #[tokio::test]
    async fn ledger_assignment_to_other_worker_wins() {
        let c = Coordinator::new(CoordinatorConfig::default());
        c.register_worker("w1", "cpu").await.unwrap();
        c.submit_new_job(posted("1", "cpu")).await.unwrap();
        c.register_worker("w2", "cpu").await.unwrap();

        assert!(c.notify_assignment("1", "w2").await.unwrap());
        assert_eq!(c.job("1").await.unwrap().assigned_worker.as_deref(), Some("w2"));
        assert!(c.worker_jobs("w1").await.unwrap().is_empty());
        assert_eq!(c.worker_jobs("w2").await.unwrap(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn completion_from_wrong_worker_is_rejected() {
        let c = coordinator();
        c.register_worker("w1", "cpu").await.unwrap();
        c.register_worker("w2", "cpu").await.unwrap();
        c.submit_new_job(posted("1", "")).await.unwrap();
        c.force_assign("1", "w1").await.unwrap();
        c.report_start("1", "w1").await.unwrap();

        let err = c.report_completion("1", "w2", "ff").await.unwrap_err();
        assert_eq!(err.reason(), "not_assigned");
        assert_eq!(c.job("1").await.unwrap().status, JobStatus::InProgress);
    }

    #[tokio::test]
    async fn failure_cancels_and_frees_slot() {
        let c = coordinator();
        c.register_worker("w1", "cpu").await.unwrap();
        c.submit_new_job(posted("1", "")).await.unwrap();
        c.force_assign("1", "w1").await.unwrap();
        let mut rx = c.notifier().subscribe();

        let job = c.report_failure("1", "w1", "workload panicked").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.assigned_worker.as_deref(), Some("w1"));
        assert_eq!(c.worker("w1").await.unwrap().load(), 0);

        assert!(matches!(rx.recv().await.unwrap(), Notification::JobFailed { .. }));
        assert!(matches!(rx.recv().await.unwrap(), Notification::JobCancelled { .. }));
    }

    #[tokio::test]
    async fn ledger_completion_fills_missed_start() {
        let c = coordinator();
        c.register_worker("w1", "cpu").await.unwrap();
        c.submit_new_job(posted("1", "")).await.unwrap();
        c.notify_assignment("1", "w1").await.unwrap();

        assert!(c.confirm_completed("1", "abc").await.unwrap());
        let job = c.job("1").await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_fingerprint.as_deref(), Some("abc"));

        let w1 = c.worker("w1").await.unwrap();
        assert_eq!(w1.load(), 0);
        assert_eq!(w1.completed_jobs, 1);

        assert!(!c.confirm_completed("1", "abc").await.unwrap());
        assert_eq!(c.worker("w1").await.unwrap().completed_jobs, 1);
    }

    #[tokio::test]
    async fn busy_worker_cannot_be_removed() {
        let c = coordinator();
        c.register_worker("w1", "cpu").await.unwrap();
        c.submit_new_job(posted("1", "")).await.unwrap();
        c.force_assign("1", "w1").await.unwrap();

        assert_eq!(c.remove_worker("w1").await.unwrap_err().reason(), "worker_busy");
        c.cancel_job("1").await.unwrap();
        assert!(c.remove_worker("w1").await.is_ok());
    }

    #[tokio::test]
    async fn rating_out_of_range_is_rejected() {
        let c = coordinator();
        c.register_worker("w1", "cpu").await.unwrap();
        assert_eq!(c.rate_worker("1", "w1", 9).await.unwrap_err().reason(), "invalid_request");
        assert!((c.rate_worker("1", "w1", 4).await.unwrap() - 4.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn blank_address_is_invalid() {
        let c = coordinator();
        assert_eq!(c.register_worker("  ", "cpu").await.unwrap_err().reason(), "invalid_request");
    }
}
