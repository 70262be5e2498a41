use chrono::{DateTime, Duration, Utc};
use nectar_common::{Job, JobId, JobStatus, WorkerId};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{DispatchError, Result};

/// Query over the job snapshot
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub worker: Option<WorkerId>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self
                .worker
                .as_ref()
                .map_or(true, |w| job.assigned_worker.as_deref() == Some(w.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobStats {
    pub total: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    pub total_reward: f64,
    pub average_reward: f64,
    pub active_assignments: usize,
}

/// In-memory mirror of ledger jobs, keyed by ledger id
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
    /// Ids of removed jobs, kept for the life of the process so that replayed ledger
    /// events cannot resurrect them. Only the id is retained; a restart clears the set.
    retired: HashSet<JobId>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    /// Pruned by retention; replays must not bring it back
    pub fn is_retired(&self, id: &str) -> bool {
        self.retired.contains(id)
    }

    pub fn get(&self, id: &str) -> Result<&Job> {
        self.jobs
            .get(id)
            .ok_or_else(|| DispatchError::JobNotFound(id.to_string()))
    }

    /// Insert a newly observed job. Returns false if it is already known or retired.
    pub fn insert(&mut self, job: Job) -> bool {
        if self.contains(&job.id) || self.is_retired(&job.id) {
            return false;
        }
        self.jobs.insert(job.id.clone(), job);
        true
    }

    /// Check that `id` exists and may move to `to`, without mutating
    pub fn ensure_transition(&self, id: &str, to: JobStatus) -> Result<&Job> {
        let job = self.get(id)?;
        if !job.status.can_transition_to(to) {
            return Err(DispatchError::IllegalTransition {
                job_id: id.to_string(),
                from: job.status,
                to,
            });
        }
        Ok(job)
    }

    /// Posted -> Assigned
    pub fn assign(&mut self, id: &str, worker: &str) -> Result<&Job> {
        self.ensure_transition(id, JobStatus::Assigned)?;
        let job = self.entry(id)?;
        job.status = JobStatus::Assigned;
        job.assigned_worker = Some(worker.to_string());
        Ok(job)
    }

    /// Point an Assigned job at a different worker
    pub fn reassign(&mut self, id: &str, worker: &str) -> Result<&Job> {
        let job = self.entry(id)?;
        if job.status != JobStatus::Assigned {
            return Err(DispatchError::IllegalTransition {
                job_id: id.to_string(),
                from: job.status,
                to: JobStatus::Assigned,
            });
        }
        job.assigned_worker = Some(worker.to_string());
        Ok(job)
    }

    /// Assigned -> InProgress
    pub fn start(&mut self, id: &str) -> Result<&Job> {
        self.ensure_transition(id, JobStatus::InProgress)?;
        let job = self.entry(id)?;
        job.status = JobStatus::InProgress;
        Ok(job)
    }

    /// InProgress -> Completed, recording the result fingerprint
    pub fn complete(&mut self, id: &str, fingerprint: &str, now: DateTime<Utc>) -> Result<&Job> {
        if fingerprint.trim().is_empty() {
            return Err(DispatchError::EmptyFingerprint(id.to_string()));
        }
        self.ensure_transition(id, JobStatus::Completed)?;
        let job = self.entry(id)?;
        job.status = JobStatus::Completed;
        job.result_fingerprint = Some(fingerprint.to_string());
        job.completed_at = Some(now);
        Ok(job)
    }

    /// Any non-terminal state -> Cancelled. The assigned worker stays as history.
    pub fn cancel(&mut self, id: &str, now: DateTime<Utc>) -> Result<&Job> {
        self.ensure_transition(id, JobStatus::Cancelled)?;
        let job = self.entry(id)?;
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        Ok(job)
    }

    /// Replace the fingerprint of an already completed job
    pub fn set_fingerprint(&mut self, id: &str, fingerprint: &str) -> Result<()> {
        let job = self.entry(id)?;
        job.result_fingerprint = Some(fingerprint.to_string());
        Ok(())
    }

    /// Snapshot of jobs matching `filter`, newest first
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Drop terminal jobs that closed more than `retention` ago
    pub fn prune(&mut self, now: DateTime<Utc>, retention: Duration) -> Vec<JobId> {
        let expired: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.status.is_terminal())
            .filter(|job| now - job.completed_at.unwrap_or(job.created_at) > retention)
            .map(|job| job.id.clone())
            .collect();

        for id in &expired {
            self.jobs.remove(id);
            self.retired.insert(id.clone());
        }
        expired
    }

    pub fn stats(&self) -> JobStats {
        let mut by_status: BTreeMap<&'static str, usize> =
            JobStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        let mut total_reward = 0.0;
        let mut active_assignments = 0;

        for job in self.jobs.values() {
            *by_status.entry(job.status.as_str()).or_default() += 1;
            total_reward += job.reward_value();
            if matches!(job.status, JobStatus::Assigned | JobStatus::InProgress) {
                active_assignments += 1;
            }
        }

        let total = self.jobs.len();
        JobStats {
            total,
            by_status,
            total_reward,
            average_reward: if total == 0 { 0.0 } else { total_reward / total as f64 },
            active_assignments,
        }
    }

    fn entry(&mut self, id: &str) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| DispatchError::JobNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(id: &str) -> JobRegistry {
        let mut jobs = JobRegistry::new();
        assert!(jobs.insert(Job::posted(id, "0xclient", "Train model", "1.5", Utc::now())));
        jobs
    }

    #[test]
    fn full_lifecycle() {
        let mut jobs = registry_with("1");
        jobs.assign("1", "w1").unwrap();
        jobs.start("1").unwrap();
        let job = jobs.complete("1", "abc", Utc::now()).unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.assigned_worker.as_deref(), Some("w1"));
        assert_eq!(job.result_fingerprint.as_deref(), Some("abc"));
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn illegal_transitions_leave_job_untouched() {
        let mut jobs = registry_with("1");
        let err = jobs.start("1").unwrap_err();
        assert_eq!(err.reason(), "illegal_transition");
        assert_eq!(jobs.get("1").unwrap().status, JobStatus::Posted);

        jobs.assign("1", "w1").unwrap();
        let err = jobs.assign("1", "w2").unwrap_err();
        assert_eq!(err.reason(), "illegal_transition");
        assert_eq!(jobs.get("1").unwrap().assigned_worker.as_deref(), Some("w1"));
    }

    #[test]
    fn completion_requires_fingerprint() {
        let mut jobs = registry_with("1");
        jobs.assign("1", "w1").unwrap();
        jobs.start("1").unwrap();

        let err = jobs.complete("1", "  ", Utc::now()).unwrap_err();
        assert_eq!(err.reason(), "empty_fingerprint");
        assert_eq!(jobs.get("1").unwrap().status, JobStatus::InProgress);
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let mut jobs = registry_with("1");
        let mut other = Job::posted("1", "0xother", "Other", "9", Utc::now());
        other.status = JobStatus::Completed;
        assert!(!jobs.insert(other));
        assert_eq!(jobs.get("1").unwrap().title, "Train model");
    }

    #[test]
    fn filters_by_status_and_worker() {
        let mut jobs = registry_with("1");
        jobs.insert(Job::posted("2", "0xclient", "Render", "2", Utc::now()));
        jobs.assign("2", "w1").unwrap();

        let assigned = jobs.list(&JobFilter { status: Some(JobStatus::Assigned), worker: None });
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].id, "2");

        let by_worker = jobs.list(&JobFilter { status: None, worker: Some("w1".into()) });
        assert_eq!(by_worker.len(), 1);
        assert!(jobs.list(&JobFilter { status: None, worker: Some("w2".into()) }).is_empty());
        assert_eq!(jobs.list(&JobFilter::default()).len(), 2);
    }

    #[test]
    fn prune_retires_old_terminal_jobs() {
        let mut jobs = registry_with("1");
        jobs.insert(Job::posted("2", "0xclient", "Render", "2", Utc::now()));
        let closed = Utc::now() - Duration::minutes(10);
        jobs.cancel("1", closed).unwrap();

        let pruned = jobs.prune(Utc::now(), Duration::minutes(5));
        assert_eq!(pruned, vec!["1".to_string()]);
        assert!(!jobs.contains("1"));
        assert!(jobs.is_retired("1"));
        assert!(jobs.contains("2"));

        // replayed posting must not resurrect a retired job
        assert!(!jobs.insert(Job::posted("1", "0xclient", "Train model", "1.5", Utc::now())));
    }

    #[test]
    fn stats_count_statuses_and_rewards() {
        let mut jobs = registry_with("1");
        jobs.insert(Job::posted("2", "0xclient", "Render", "0.5", Utc::now()));
        jobs.assign("2", "w1").unwrap();

        let stats = jobs.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status["posted"], 1);
        assert_eq!(stats.by_status["assigned"], 1);
        assert_eq!(stats.by_status["completed"], 0);
        assert_eq!(stats.active_assignments, 1);
        assert!((stats.total_reward - 2.0).abs() < 1e-9);
        assert!((stats.average_reward - 1.0).abs() < 1e-9);
    }
}
