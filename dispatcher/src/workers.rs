use chrono::{DateTime, Duration, Utc};
use nectar_common::{JobId, Worker, WorkerId};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::error::{DispatchError, Result};

/// Capabilities assumed when metadata declares none
pub const DEFAULT_CAPABILITIES: [&str; 2] = ["cpu", "general"];

/// What a worker declares about itself in its registration metadata
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerProfile {
    pub capabilities: BTreeSet<String>,
    pub max_concurrent_jobs: Option<usize>,
}

impl WorkerProfile {
    /// Accepts a JSON object with a `capabilities` array, a bare JSON array, or a
    /// comma-delimited string. Anything else yields the default capabilities.
    pub fn parse(metadata: &str) -> Self {
        let mut max_concurrent_jobs = None;

        let capabilities = match serde_json::from_str::<serde_json::Value>(metadata) {
            Ok(serde_json::Value::Object(map)) => {
                max_concurrent_jobs = map
                    .get("max_concurrent_jobs")
                    .or_else(|| map.get("maxConcurrentJobs"))
                    .and_then(|v| v.as_u64())
                    .filter(|n| *n > 0)
                    .map(|n| n as usize);
                map.get("capabilities")
                    .and_then(|v| v.as_array())
                    .map(|items| normalize(items.iter().filter_map(|v| v.as_str())))
                    .unwrap_or_default()
            }
            Ok(serde_json::Value::Array(items)) => {
                normalize(items.iter().filter_map(|v| v.as_str()))
            }
            Ok(_) => BTreeSet::new(),
            Err(_) => normalize(metadata.split(',')),
        };

        Self {
            capabilities: if capabilities.is_empty() {
                default_capabilities()
            } else {
                capabilities
            },
            max_concurrent_jobs,
        }
    }
}

pub fn default_capabilities() -> BTreeSet<String> {
    DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect()
}

/// Lowercase, trimmed, non-empty tags
pub fn normalize<'a>(tags: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    tags.into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Query over the worker snapshot
#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub online_only: bool,
    pub available_only: bool,
    pub capability: Option<String>,
}

impl WorkerFilter {
    pub fn matches(&self, worker: &Worker) -> bool {
        (!self.online_only || worker.online)
            && (!self.available_only || worker.is_available())
            && self
                .capability
                .as_ref()
                .map_or(true, |c| worker.capabilities.contains(&c.to_lowercase()))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerStats {
    pub total: usize,
    pub online: usize,
    pub available: usize,
    pub jobs_in_progress: usize,
    pub jobs_completed: u64,
    pub average_rating: f64,
}

/// Liveness and capacity bookkeeping for registered workers
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Worker>,
    default_max_concurrent: usize,
}

impl WorkerRegistry {
    pub fn new(default_max_concurrent: usize) -> Self {
        Self {
            workers: HashMap::new(),
            default_max_concurrent: default_max_concurrent.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workers.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Result<&Worker> {
        self.workers
            .get(id)
            .ok_or_else(|| DispatchError::WorkerNotFound(id.to_string()))
    }

    /// Idempotent upsert. Re-registration refreshes metadata, capabilities and
    /// last-seen and marks the worker online; jobs, counters and rating survive.
    /// Returns true when the worker was not known before.
    pub fn register(&mut self, id: &str, metadata: &str, now: DateTime<Utc>) -> bool {
        let profile = WorkerProfile::parse(metadata);
        let max_concurrent_jobs = profile
            .max_concurrent_jobs
            .unwrap_or(self.default_max_concurrent);

        match self.workers.get_mut(id) {
            Some(worker) => {
                worker.metadata = metadata.to_string();
                worker.capabilities = profile.capabilities;
                worker.max_concurrent_jobs = max_concurrent_jobs;
                worker.last_seen = now;
                worker.online = true;
                debug!("Refreshed worker {}", id);
                false
            }
            None => {
                self.workers.insert(
                    id.to_string(),
                    Worker {
                        address: id.to_string(),
                        online: true,
                        last_seen: now,
                        capabilities: profile.capabilities,
                        current_jobs: BTreeSet::new(),
                        max_concurrent_jobs,
                        completed_jobs: 0,
                        rating: 0.0,
                        rating_count: 0,
                        registered_at: now,
                        metadata: metadata.to_string(),
                    },
                );
                info!("Registered worker {}", id);
                true
            }
        }
    }

    /// Returns the previous online flag
    pub fn set_online(&mut self, id: &str, online: bool, now: DateTime<Utc>) -> Result<bool> {
        let worker = self.entry(id)?;
        let was_online = worker.online;
        worker.online = online;
        if online {
            worker.last_seen = now;
        }
        if was_online != online {
            info!("Worker {} is now {}", id, if online { "online" } else { "offline" });
        }
        Ok(was_online)
    }

    /// Refresh last-seen. Returns true if the worker was offline and came back.
    pub fn heartbeat(&mut self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let worker = self.entry(id)?;
        worker.last_seen = now;
        if worker.online {
            return Ok(false);
        }
        worker.online = true;
        info!("Worker {} is back online", id);
        Ok(true)
    }

    /// Why `assign` would refuse, without mutating
    pub fn check_assign(&self, id: &str, job_id: &str) -> Result<()> {
        let worker = self.get(id)?;
        if worker.current_jobs.contains(job_id) {
            return Err(DispatchError::AlreadyAssigned {
                job_id: job_id.to_string(),
                worker: id.to_string(),
            });
        }
        if !worker.has_capacity() {
            return Err(DispatchError::CapacityExceeded(id.to_string()));
        }
        Ok(())
    }

    pub fn assign(&mut self, id: &str, job_id: &str) -> bool {
        if let Err(e) = self.check_assign(id, job_id) {
            warn!("Cannot assign job {} to worker {}: {}", job_id, id, e);
            return false;
        }
        match self.workers.get_mut(id) {
            Some(worker) => worker.current_jobs.insert(job_id.to_string()),
            None => false,
        }
    }

    pub fn release(&mut self, id: &str, job_id: &str) -> bool {
        match self.workers.get_mut(id) {
            Some(worker) => {
                if worker.current_jobs.remove(job_id) {
                    return true;
                }
                warn!("Worker {} does not hold job {}", id, job_id);
                false
            }
            None => {
                warn!("Cannot release job {} from unknown worker {}", job_id, id);
                false
            }
        }
    }

    pub fn record_completion(&mut self, id: &str) -> Result<u64> {
        let worker = self.entry(id)?;
        worker.completed_jobs += 1;
        Ok(worker.completed_jobs)
    }

    /// Fold a score into the running average. Returns the new rating.
    pub fn record_rating(&mut self, id: &str, score: u8) -> Result<f64> {
        let worker = self.entry(id)?;
        let total = worker.rating * worker.rating_count as f64 + score as f64;
        worker.rating_count += 1;
        worker.rating = total / worker.rating_count as f64;
        Ok(worker.rating)
    }

    pub fn update_capabilities<'a>(
        &mut self,
        id: &str,
        tags: impl IntoIterator<Item = &'a str>,
    ) -> Result<BTreeSet<String>> {
        let capabilities = normalize(tags);
        if capabilities.is_empty() {
            return Err(DispatchError::InvalidRequest(
                "at least one capability is required".into(),
            ));
        }
        let worker = self.entry(id)?;
        worker.capabilities = capabilities;
        Ok(worker.capabilities.clone())
    }

    /// Remove a worker that holds no jobs
    pub fn remove(&mut self, id: &str) -> Result<Worker> {
        let worker = self.get(id)?;
        if !worker.current_jobs.is_empty() {
            return Err(DispatchError::WorkerBusy {
                worker: id.to_string(),
                jobs: worker.current_jobs.len(),
            });
        }
        self.workers
            .remove(id)
            .ok_or_else(|| DispatchError::WorkerNotFound(id.to_string()))
    }

    /// Mark online workers silent for longer than `timeout` as offline
    pub fn sweep(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<WorkerId> {
        let mut stale: Vec<WorkerId> = Vec::new();
        for worker in self.workers.values_mut() {
            if worker.online && now - worker.last_seen > timeout {
                worker.online = false;
                stale.push(worker.address.clone());
            }
        }
        stale.sort();
        for id in &stale {
            info!("Worker {} marked offline after heartbeat timeout", id);
        }
        stale
    }

    pub fn list(&self, filter: &WorkerFilter) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self
            .workers
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.address.cmp(&b.address));
        workers
    }

    /// Iterator over workers that are online and under their limit
    pub fn available(&self) -> impl Iterator<Item = &Worker> {
        self.workers.values().filter(|w| w.is_available())
    }

    pub fn current_jobs(&self, id: &str) -> Result<Vec<JobId>> {
        Ok(self.get(id)?.current_jobs.iter().cloned().collect())
    }

    /// Highest rated first; ties broken by completed count then address
    pub fn top(&self, limit: usize) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.workers.values().cloned().collect();
        workers.sort_by(|a, b| {
            b.rating
                .total_cmp(&a.rating)
                .then_with(|| b.completed_jobs.cmp(&a.completed_jobs))
                .then_with(|| a.address.cmp(&b.address))
        });
        workers.truncate(limit);
        workers
    }

    pub fn stats(&self) -> WorkerStats {
        let total = self.workers.len();
        let rated: Vec<f64> = self
            .workers
            .values()
            .filter(|w| w.rating_count > 0)
            .map(|w| w.rating)
            .collect();

        WorkerStats {
            total,
            online: self.workers.values().filter(|w| w.online).count(),
            available: self.available().count(),
            jobs_in_progress: self.workers.values().map(|w| w.load()).sum(),
            jobs_completed: self.workers.values().map(|w| w.completed_jobs).sum(),
            average_rating: if rated.is_empty() {
                0.0
            } else {
                rated.iter().sum::<f64>() / rated.len() as f64
            },
        }
    }

    fn entry(&mut self, id: &str) -> Result<&mut Worker> {
        self.workers
            .get_mut(id)
            .ok_or_else(|| DispatchError::WorkerNotFound(id.to_string()))
    }
}
