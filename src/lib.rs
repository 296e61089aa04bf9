//! trainyard: submit training jobs to external platforms and keep one
//! canonical lifecycle for them.
//!
//! A [`JobService`](service::JobService) accepts job descriptions, the
//! [`SubmissionCoordinator`](coordinator::SubmissionCoordinator) validates,
//! stages and submits them, and the [`Reconciler`](reconciler::Reconciler)
//! polls each platform until every job reaches a terminal status.

pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod reconciler;
pub mod service;
pub mod staging;
pub mod state_machine;
pub mod store;
pub mod trainer;
pub mod ui;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::Engine;
pub use error::{FailureKind, TrainError, TrainResult};
pub use service::{CancelAck, JobService};
