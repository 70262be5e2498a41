//! Dispatch and coordination service: mirrors ledger jobs, tracks worker liveness,
//! matches jobs to workers and fans state changes out to observers.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod jobs;
pub mod listener;
pub mod matcher;
pub mod reconciler;
pub mod reliability;
pub mod websocket;
pub mod workers;

pub use coordinator::{Coordinator, CoordinatorConfig, Stats, SweepReport};
pub use error::DispatchError;
pub use matcher::Preference;
