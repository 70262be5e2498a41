pub mod agent;
pub mod client;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod subscription;

pub use agent::{AgentConfig, AgentState, WorkerAgent};
pub use client::{ClientError, DispatcherClient};
pub use engine::{EngineConfig, ExecutionEngine, JobClass, Workload};
