use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use nectar_common::{crypto::fingerprint, ExecutionResult, Job};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::metrics;

/// Workload family, picked from the job text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobClass {
    MachineLearning,
    DataProcessing,
    Scientific,
    Rendering,
    Docker,
    Generic,
}

impl JobClass {
    pub fn as_str(self) -> &'static str {
        match self {
            JobClass::MachineLearning => "machine_learning",
            JobClass::DataProcessing => "data_processing",
            JobClass::Scientific => "scientific_computation",
            JobClass::Rendering => "rendering",
            JobClass::Docker => "docker_container",
            JobClass::Generic => "generic",
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// first match wins
const KEYWORDS: [(JobClass, &[&str]); 5] = [
    (JobClass::MachineLearning, &["machine learning", "ml", "neural", "tensorflow", "pytorch"]),
    (JobClass::DataProcessing, &["data processing", "etl", "csv", "json", "database"]),
    (JobClass::Scientific, &["scientific", "simulation", "calculation", "numerical"]),
    (JobClass::Rendering, &["render", "3d", "graphics", "video"]),
    (JobClass::Docker, &["docker", "container", "image"]),
];

/// Classify on lowercase `description + requirements`
pub fn classify(job: &Job) -> JobClass {
    let text = format!("{} {}", job.description, job.requirements).to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| text.contains(w)))
        .map(|(class, _)| *class)
        .unwrap_or(JobClass::Generic)
}

/// Timestamped log lines shared between the engine and a running workload
#[derive(Debug, Clone, Default)]
pub struct JobLog(Arc<Mutex<Vec<String>>>);

impl JobLog {
    pub fn push(&self, line: impl fmt::Display) {
        let mut lines = self.0.lock().unwrap_or_else(|e| e.into_inner());
        lines.push(format!("[{}] {}", Utc::now().to_rfc3339(), line));
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Deterministic number stream derived from the job id
#[derive(Debug, Clone)]
pub struct Seed {
    key: String,
    counter: u64,
}

impl Seed {
    pub fn new(job_id: &str) -> Self {
        Self {
            key: job_id.to_string(),
            counter: 0,
        }
    }

    /// Next value in [0, 1)
    pub fn next_unit(&mut self) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(self.key.as_bytes());
        hasher.update(self.counter.to_be_bytes());
        self.counter += 1;

        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(word) >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Next value in [low, low + span)
    pub fn range(&mut self, low: f64, span: f64) -> f64 {
        low + self.next_unit() * span
    }

    /// Next integer in [low, low + span)
    pub fn int(&mut self, low: u64, span: u64) -> u64 {
        low + (self.next_unit() * span as f64) as u64
    }
}

/// Per-run handle given to a workload
pub struct RunContext {
    pub log: JobLog,
    pub seed: Seed,
    time_scale: f64,
}

impl RunContext {
    pub fn new(job: &Job, log: JobLog, time_scale: f64) -> Self {
        Self {
            log,
            seed: Seed::new(&job.id),
            time_scale,
        }
    }

    /// Log a phase and spend its (scaled) duration
    pub async fn phase(&self, message: &str, millis: u64) {
        self.log.push(message);
        let scaled = millis as f64 * self.time_scale;
        if scaled >= 1.0 {
            tokio::time::sleep(Duration::from_millis(scaled as u64)).await;
        }
    }
}

/// A pluggable computation producing a class-shaped JSON payload
#[async_trait]
pub trait Workload: Send + Sync {
    fn class(&self) -> JobClass;

    async fn run(&self, job: &Job, ctx: &mut RunContext) -> Result<Value>;
}

pub struct MachineLearning;

#[async_trait]
impl Workload for MachineLearning {
    fn class(&self) -> JobClass {
        JobClass::MachineLearning
    }

    async fn run(&self, job: &Job, ctx: &mut RunContext) -> Result<Value> {
        ctx.phase("Initializing ML environment...", 1000).await;
        ctx.phase("Loading dataset...", 2000).await;
        ctx.phase("Training model...", 5000).await;
        ctx.log.push("Model training completed");

        let s = &mut ctx.seed;
        Ok(json!({
            "type": self.class().as_str(),
            "model": {
                "name": "neural_network_classifier",
                "accuracy": s.range(0.92, 0.07),
                "epochs": 100,
                "loss": s.range(0.0, 0.1),
            },
            "metrics": {
                "precision": s.range(0.90, 0.09),
                "recall": s.range(0.88, 0.10),
                "f1_score": s.range(0.89, 0.09),
            },
            "model_artifact": format!("model_{}.h5", job.id),
        }))
    }
}

pub struct DataProcessing;

#[async_trait]
impl Workload for DataProcessing {
    fn class(&self) -> JobClass {
        JobClass::DataProcessing
    }

    async fn run(&self, job: &Job, ctx: &mut RunContext) -> Result<Value> {
        ctx.phase("Reading input data...", 1000).await;
        ctx.phase("Processing data...", 3000).await;
        ctx.phase("Applying transformations...", 2000).await;
        ctx.phase("Writing output data...", 1000).await;

        let input_records = ctx.seed.int(10_000, 100_000);
        let output_records = ctx.seed.int(input_records * 95 / 100, input_records / 20 + 1);
        Ok(json!({
            "type": self.class().as_str(),
            "input_records": input_records,
            "output_records": output_records,
            "transformations_applied": ["data_cleaning", "normalization", "aggregation", "filtering"],
            "output_files": [
                format!("processed_data_{}.csv", job.id),
                format!("summary_{}.json", job.id),
            ],
        }))
    }
}

pub struct Scientific;

#[async_trait]
impl Workload for Scientific {
    fn class(&self) -> JobClass {
        JobClass::Scientific
    }

    async fn run(&self, _job: &Job, ctx: &mut RunContext) -> Result<Value> {
        ctx.phase("Initializing scientific computation...", 500).await;
        ctx.log.push("Running simulation iterations...");

        let iterations = ctx.seed.int(500, 1000);
        for step in 1..=5 {
            ctx.phase(&format!("Iteration {}/{}", step * (iterations / 5), iterations), 1000)
                .await;
        }
        ctx.log.push("Computation completed");

        let s = &mut ctx.seed;
        let results: Vec<f64> = (0..10).map(|_| s.next_unit()).collect();
        Ok(json!({
            "type": self.class().as_str(),
            "iterations": iterations,
            "convergence": true,
            "final_value": s.range(0.0, 1000.0),
            "error": s.range(0.0, 0.001),
            "output_data": {
                "results": results,
                "parameters": {
                    "tolerance": 1e-6,
                    "max_iterations": iterations,
                },
            },
        }))
    }
}

pub struct Rendering;

#[async_trait]
impl Workload for Rendering {
    fn class(&self) -> JobClass {
        JobClass::Rendering
    }

    async fn run(&self, job: &Job, ctx: &mut RunContext) -> Result<Value> {
        ctx.phase("Loading 3D scene...", 1000).await;
        ctx.phase("Setting up materials and lighting...", 1500).await;
        ctx.log.push("Rendering frames...");

        let frames = ctx.seed.int(50, 100);
        for step in 1..=5 {
            ctx.phase(&format!("Frame {}/{}", step * (frames / 5), frames), 800).await;
        }
        ctx.log.push("Rendering completed");

        Ok(json!({
            "type": self.class().as_str(),
            "total_frames": frames,
            "resolution": "1920x1080",
            "render_time": ctx.seed.int(600, 3000),
            "output_files": [
                format!("render_{}.mp4", job.id),
                format!("thumbnail_{}.jpg", job.id),
            ],
            "render_settings": {
                "samples": 128,
                "bounces": 12,
                "quality": "high",
            },
        }))
    }
}

pub struct Docker;

#[async_trait]
impl Workload for Docker {
    fn class(&self) -> JobClass {
        JobClass::Docker
    }

    async fn run(&self, job: &Job, ctx: &mut RunContext) -> Result<Value> {
        ctx.phase("Pulling Docker image...", 2000).await;
        ctx.phase("Starting container...", 1000).await;
        ctx.phase("Executing container workload...", 3000).await;
        ctx.phase("Container execution completed", 500).await;
        ctx.phase("Cleaning up container...", 500).await;

        Ok(json!({
            "type": self.class().as_str(),
            "image": "custom/job-processor:latest",
            "exit_code": 0,
            "runtime": ctx.seed.int(30, 180),
            "output_logs": [
                "Container started successfully",
                "Processing input data...",
                "Computation completed",
                "Results written to output volume",
            ],
            "volume_output": format!("output_{}.tar.gz", job.id),
        }))
    }
}

pub struct Generic;

#[async_trait]
impl Workload for Generic {
    fn class(&self) -> JobClass {
        JobClass::Generic
    }

    async fn run(&self, job: &Job, ctx: &mut RunContext) -> Result<Value> {
        ctx.phase("Starting generic computation...", 1000).await;
        ctx.phase("Processing request...", 2000).await;
        ctx.log.push("Computation completed");

        Ok(json!({
            "type": self.class().as_str(),
            "status": "completed",
            "output": format!("Result for job {}", job.id),
            "metadata": {
                "processing_time": ctx.seed.int(1000, 5000),
                "resources_used": ["cpu", "memory"],
            },
        }))
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Multiplier on phase durations; 0 skips all waiting
    pub time_scale: f64,
    pub max_execution: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            max_execution: Duration::from_secs(600),
        }
    }
}

/// Runs jobs through the workload registered for their class
pub struct ExecutionEngine {
    workloads: HashMap<JobClass, Arc<dyn Workload>>,
    config: EngineConfig,
}

impl ExecutionEngine {
    /// Engine with the built-in simulated workloads
    pub fn new(config: EngineConfig) -> Self {
        let builtin: [Arc<dyn Workload>; 6] = [
            Arc::new(MachineLearning),
            Arc::new(DataProcessing),
            Arc::new(Scientific),
            Arc::new(Rendering),
            Arc::new(Docker),
            Arc::new(Generic),
        ];
        Self {
            workloads: builtin.into_iter().map(|w| (w.class(), w)).collect(),
            config,
        }
    }

    /// Replace the workload for its class
    pub fn with_workload(mut self, workload: Arc<dyn Workload>) -> Self {
        self.workloads.insert(workload.class(), workload);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a job. Never fails: workload errors, panics and timeouts come back
    /// as an unsuccessful result.
    pub async fn execute(&self, job: &Job) -> ExecutionResult {
        let started = Instant::now();
        let log = JobLog::default();
        log.push(format!("Starting job execution: {}", job.id));
        log.push(format!("Job: {}", job.title));
        log.push(format!("Requirements: {}", job.requirements));

        let class = classify(job);
        log.push(format!("Detected job type: {}", class));
        info!("Executing job {} as {}", job.id, class);

        let outcome = match self.workloads.get(&class).cloned() {
            Some(workload) => self.run_guarded(workload, job, log.clone()).await,
            None => Err(format!("no workload registered for {}", class)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                let fingerprint = fingerprint(&output, &job.id);
                log.push(format!("Job completed successfully in {}ms", elapsed_ms));
                log.push(format!("Result fingerprint: {}", fingerprint));
                ExecutionResult {
                    job_id: job.id.clone(),
                    success: true,
                    output,
                    fingerprint,
                    elapsed_ms,
                    resource_usage: metrics::sample(),
                    logs: log.lines(),
                    error: None,
                }
            }
            Err(error) => {
                warn!("Job {} failed: {}", job.id, error);
                log.push(format!("Job failed: {}", error));
                ExecutionResult {
                    job_id: job.id.clone(),
                    success: false,
                    output: Value::Null,
                    fingerprint: String::new(),
                    elapsed_ms,
                    resource_usage: metrics::sample(),
                    logs: log.lines(),
                    error: Some(error),
                }
            }
        }
    }

    /// Run on its own task so a panic or overrun cannot take the caller down
    async fn run_guarded(
        &self,
        workload: Arc<dyn Workload>,
        job: &Job,
        log: JobLog,
    ) -> std::result::Result<Value, String> {
        let job = job.clone();
        let time_scale = self.config.time_scale;
        let mut handle = tokio::spawn(async move {
            let mut ctx = RunContext::new(&job, log, time_scale);
            workload.run(&job, &mut ctx).await
        });

        match tokio::time::timeout(self.config.max_execution, &mut handle).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
            Ok(Err(e)) if e.is_panic() => Err("workload panicked".to_string()),
            Ok(Err(e)) => Err(format!("workload aborted: {}", e)),
            Err(_) => {
                handle.abort();
                Err(format!(
                    "execution exceeded {}s limit",
                    self.config.max_execution.as_secs_f64()
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: &str, description: &str, requirements: &str) -> Job {
        Job::posted(id, "0xclient", "Test job", "1", Utc::now()).with_details(description, requirements)
    }

    fn instant() -> ExecutionEngine {
        ExecutionEngine::new(EngineConfig {
            time_scale: 0.0,
            max_execution: Duration::from_secs(5),
        })
    }

    #[test]
    fn classification_follows_keyword_order() {
        let cases = [
            ("Train a neural net", "", JobClass::MachineLearning),
            ("ETL over a database", "", JobClass::DataProcessing),
            ("", "numerical simulation", JobClass::Scientific),
            ("Render a 3D scene", "", JobClass::Rendering),
            ("", "docker", JobClass::Docker),
            ("Do something", "cpu", JobClass::Generic),
            // ml keyword beats data keyword
            ("pytorch over csv files", "", JobClass::MachineLearning),
            // "image" is a docker keyword, but rendering comes first
            ("render image", "", JobClass::Rendering),
        ];
        for (description, requirements, expected) in cases {
            assert_eq!(classify(&job("1", description, requirements)), expected, "{:?}", description);
        }
    }

    #[test]
    fn seed_is_deterministic_per_job() {
        let mut a = Seed::new("42");
        let mut b = Seed::new("42");
        let mut c = Seed::new("43");
        let xs: Vec<f64> = (0..4).map(|_| a.next_unit()).collect();
        let ys: Vec<f64> = (0..4).map(|_| b.next_unit()).collect();
        assert_eq!(xs, ys);
        assert_ne!(xs[0], c.next_unit());
        assert!(xs.iter().all(|x| (0.0..1.0).contains(x)));
    }

    #[tokio::test]
    async fn every_class_produces_a_fingerprinted_payload() {
        let engine = instant();
        for (description, class) in [
            ("machine learning", JobClass::MachineLearning),
            ("csv cleanup", JobClass::DataProcessing),
            ("scientific", JobClass::Scientific),
            ("video", JobClass::Rendering),
            ("container", JobClass::Docker),
            ("anything", JobClass::Generic),
        ] {
            let result = engine.execute(&job("9", description, "")).await;
            assert!(result.success, "{} failed: {:?}", class, result.error);
            assert_eq!(result.output["type"], class.as_str());
            assert_eq!(result.fingerprint.len(), 64);
            assert!(result.logs.iter().any(|l| l.contains("Detected job type")));
        }
    }

    #[tokio::test]
    async fn fingerprint_is_reproducible_and_bound_to_job_id() {
        let engine = instant();
        let a = engine.execute(&job("1", "train a model with pytorch", "")).await;
        let again = engine.execute(&job("1", "train a model with pytorch", "")).await;
        let b = engine.execute(&job("2", "train a model with pytorch", "")).await;

        assert_eq!(a.output, again.output);
        assert_eq!(a.fingerprint, again.fingerprint);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    struct Failing;

    #[async_trait]
    impl Workload for Failing {
        fn class(&self) -> JobClass {
            JobClass::Generic
        }

        async fn run(&self, _job: &Job, ctx: &mut RunContext) -> Result<Value> {
            ctx.log.push("about to fail");
            anyhow::bail!("out of memory")
        }
    }

    struct Panicking;

    #[async_trait]
    impl Workload for Panicking {
        fn class(&self) -> JobClass {
            JobClass::Generic
        }

        async fn run(&self, _job: &Job, _ctx: &mut RunContext) -> Result<Value> {
            panic!("boom")
        }
    }

    struct Stuck;

    #[async_trait]
    impl Workload for Stuck {
        fn class(&self) -> JobClass {
            JobClass::Generic
        }

        async fn run(&self, _job: &Job, _ctx: &mut RunContext) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn workload_error_becomes_failed_result() {
        let engine = instant().with_workload(Arc::new(Failing));
        let result = engine.execute(&job("1", "", "")).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("out of memory"));
        assert!(result.fingerprint.is_empty());
        assert!(result.logs.iter().any(|l| l.contains("about to fail")));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let engine = instant().with_workload(Arc::new(Panicking));
        let result = engine.execute(&job("1", "", "")).await;

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("workload panicked"));
    }

    #[tokio::test]
    async fn overrun_is_cut_off() {
        let engine = ExecutionEngine::new(EngineConfig {
            time_scale: 0.0,
            max_execution: Duration::from_millis(50),
        })
        .with_workload(Arc::new(Stuck));
        let result = engine.execute(&job("1", "", "")).await;

        assert!(!result.success);
        assert!(result.error.unwrap_or_default().contains("exceeded"));
    }
}
