use anyhow::{Context, Result};
use nectar_common::{should_log_failure, Job, JobId, Notification, Worker};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, DispatcherClient};
use crate::engine::ExecutionEngine;
use crate::subscription;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub address: String,
    pub capabilities: Vec<String>,
    pub max_concurrent_jobs: usize,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: format!("worker-{}", uuid::Uuid::new_v4()),
            capabilities: vec!["cpu".into(), "general".into(), "docker".into()],
            max_concurrent_jobs: 3,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Registering,
    Connected,
    Idle,
    Executing,
    Disconnected,
}

/// Registers with the dispatcher, keeps itself alive and runs the jobs assigned to it
pub struct WorkerAgent {
    config: AgentConfig,
    client: DispatcherClient,
    engine: Arc<ExecutionEngine>,
    state: Mutex<AgentState>,
    running: Mutex<BTreeSet<JobId>>,
}

impl WorkerAgent {
    pub fn new(config: AgentConfig, client: DispatcherClient, engine: ExecutionEngine) -> Self {
        Self {
            config,
            client,
            engine: Arc::new(engine),
            state: Mutex::new(AgentState::Registering),
            running: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    pub fn state(&self) -> AgentState {
        *lock(&self.state)
    }

    pub fn running_jobs(&self) -> Vec<JobId> {
        lock(&self.running).iter().cloned().collect()
    }

    /// Registration metadata: declared capabilities and concurrency limit
    pub fn metadata(&self) -> Value {
        json!({
            "capabilities": self.config.capabilities,
            "max_concurrent_jobs": self.config.max_concurrent_jobs,
        })
    }

    /// Register and go online. Failure here is fatal to the agent.
    pub async fn start(&self) -> Result<Worker> {
        self.set_state(AgentState::Registering);
        let worker = self
            .client
            .register(self.address(), &self.metadata())
            .await
            .with_context(|| format!("failed to register with {}", self.client.base_url()))?;
        self.client
            .set_status(self.address(), true)
            .await
            .context("failed to mark worker online")?;

        info!(
            "Registered as {} with capabilities {:?}",
            worker.address, worker.capabilities
        );
        self.set_state(AgentState::Connected);
        Ok(worker)
    }

    /// Heartbeat, listen for assignments and execute them until `shutdown` resolves.
    /// Expects [`start`](Self::start) to have succeeded.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        let (tx, mut notifications) = mpsc::channel(64);
        let subscription = tokio::spawn(subscription::run(
            self.client.ws_url(),
            self.address().to_string(),
            tx,
            self.config.reconnect_delay,
        ));

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat_failures = 0u64;
        self.refresh_state();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = heartbeat.tick() => {
                    match self.heartbeat().await {
                        Ok(()) => heartbeat_failures = 0,
                        Err(e) => {
                            heartbeat_failures += 1;
                            if should_log_failure(heartbeat_failures) {
                                warn!("Heartbeat failed ({} in a row): {:#}", heartbeat_failures, e);
                            }
                        }
                    }
                }
                Some(notification) = notifications.recv() => {
                    self.handle_notification(notification);
                }
            }
        }

        subscription.abort();
        self.shutdown().await;
    }

    /// Go offline. In-flight executions are left to finish on their own.
    pub async fn shutdown(&self) {
        info!("Shutting down worker {}", self.address());
        if let Err(e) = self.client.set_status(self.address(), false).await {
            warn!("Failed to mark worker offline: {}", e);
        }
        self.set_state(AgentState::Disconnected);
    }

    async fn heartbeat(&self) -> Result<(), ClientError> {
        match self.client.heartbeat(self.address()).await {
            Err(e) if e.reason() == Some("worker_not_found") => {
                // dispatcher restarted and lost us
                info!("Dispatcher no longer knows {}, re-registering", self.address());
                self.client.register(self.address(), &self.metadata()).await?;
                Ok(())
            }
            other => other,
        }
    }

    fn handle_notification(self: &Arc<Self>, notification: Notification) {
        match notification {
            Notification::JobAssigned { job, target } if target == self.config.address => {
                if self.try_accept(&job.id) {
                    tokio::spawn(self.clone().process_job(job));
                }
            }
            Notification::JobCancelled { job_id } if lock(&self.running).contains(&job_id) => {
                info!("Job {} was cancelled while running; its result will be refused", job_id);
            }
            Notification::SubscriptionConfirmed { topic } => {
                debug!("Subscribed to {}", topic);
            }
            _ => {}
        }
    }

    /// Reserve an execution slot for a job. False when at capacity or already running it.
    pub fn try_accept(&self, job_id: &str) -> bool {
        let mut running = lock(&self.running);
        if running.contains(job_id) {
            debug!("Job {} is already running", job_id);
            return false;
        }
        if running.len() >= self.config.max_concurrent_jobs {
            warn!(
                "Declining job {}: {} of {} slots busy",
                job_id,
                running.len(),
                self.config.max_concurrent_jobs
            );
            return false;
        }
        running.insert(job_id.to_string());
        drop(running);
        self.set_state(AgentState::Executing);
        true
    }

    /// Start, execute and report one accepted job, then free its slot
    pub async fn process_job(self: Arc<Self>, job: Job) {
        let address = self.address().to_string();
        info!("Processing job {}: {}", job.id, job.title);

        match self.client.start(&job.id, &address).await {
            Ok(_) => {}
            Err(e) if e.is_rejection() => {
                warn!("Dispatcher refused start of job {}, abandoning: {}", job.id, e);
                self.release(&job.id);
                return;
            }
            Err(e) => warn!("Could not report start of job {}, executing anyway: {}", job.id, e),
        }

        let result = self.engine.execute(&job).await;

        let report = if result.success {
            info!("Job {} finished in {}ms", job.id, result.elapsed_ms);
            self.client.complete(&job.id, &address, &result.fingerprint).await
        } else {
            let reason = result.error.as_deref().unwrap_or("execution failed");
            warn!("Job {} failed: {}", job.id, reason);
            self.client.fail(&job.id, &address, reason).await
        };
        if let Err(e) = report {
            error!("Failed to report outcome of job {}: {}", job.id, e);
        }

        self.release(&job.id);
    }

    fn release(&self, job_id: &str) {
        lock(&self.running).remove(job_id);
        self.refresh_state();
    }

    fn refresh_state(&self) {
        let mut state = lock(&self.state);
        if *state == AgentState::Disconnected {
            return;
        }
        *state = if lock(&self.running).is_empty() {
            AgentState::Idle
        } else {
            AgentState::Executing
        };
    }

    fn set_state(&self, next: AgentState) {
        *lock(&self.state) = next;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;

    fn agent(max: usize) -> WorkerAgent {
        let client = DispatcherClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let config = AgentConfig {
            address: "W1".into(),
            max_concurrent_jobs: max,
            ..AgentConfig::default()
        };
        WorkerAgent::new(config, client, ExecutionEngine::new(EngineConfig::default()))
    }

    #[test]
    fn accepts_up_to_capacity() {
        let agent = agent(2);
        assert!(agent.try_accept("1"));
        assert!(agent.try_accept("2"));
        assert!(!agent.try_accept("3"));
        assert_eq!(agent.state(), AgentState::Executing);

        agent.release("1");
        assert!(agent.try_accept("3"));
        assert_eq!(agent.running_jobs(), vec!["2".to_string(), "3".to_string()]);
    }

    #[test]
    fn refuses_duplicate_assignment() {
        let agent = agent(3);
        assert!(agent.try_accept("1"));
        assert!(!agent.try_accept("1"));
        assert_eq!(agent.running_jobs().len(), 1);
    }

    #[test]
    fn goes_idle_when_last_job_finishes() {
        let agent = agent(1);
        assert!(agent.try_accept("1"));
        agent.release("1");
        assert_eq!(agent.state(), AgentState::Idle);
    }

    #[test]
    fn metadata_declares_capacity() {
        let agent = agent(4);
        let metadata = agent.metadata();
        assert_eq!(metadata["max_concurrent_jobs"], 4);
        assert_eq!(metadata["capabilities"], json!(["cpu", "general", "docker"]));
    }

    #[tokio::test]
    async fn registration_failure_is_fatal() {
        let agent = agent(1);
        assert!(agent.start().await.is_err());
        assert_eq!(agent.state(), AgentState::Registering);
    }
}
