//! Cloud orchestrator (component F)
//!
//! The orchestration core: translates idempotent, high-level disk intents
//! into sequences of calls against the narrow [`provider::Ec2DiskApi`]
//! trait, using the batcher (component D), device manager (component C),
//! and retry manager (component E) to do it correctly under concurrency,
//! partial failure, and provider throttling.

pub mod classify;
pub mod ec2_provider;
pub mod orchestrator;
pub mod provider;
pub mod token;
pub mod types;

pub use ec2_provider::Ec2Provider;
pub use orchestrator::CloudOrchestrator;
pub use provider::{Ec2DiskApi, ProviderError};
pub use types::*;
