//! disk-orchestrator-core
//!
//! Cloud orchestration core for a network block-storage (EBS-style) CSI
//! driver: request batching, device-name allocation, idempotent retries
//! with exponential backoff, and expiring caches, wired together behind a
//! single [`cloud::CloudOrchestrator`].
//!
//! ## Architecture
//!
//! The crate is organized around the components named in the design: a
//! generic coalescing [`batcher`], a [`device`] manager that allocates and
//! recycles Linux device-letter suffixes per node, a [`cache`] with sliding
//! TTL expiry shared by several of the orchestrator's internal lookups, a
//! [`retry`] manager with a per-API [`retry::AdaptiveRetryer`], cooperative
//! [`cancel`] tokens threaded through every long-running poll, and the
//! [`cloud`] module tying all of it to a narrow [`cloud::Ec2DiskApi`]
//! provider trait so the orchestrator itself never depends on an AWS SDK
//! type directly.
//!
//! ## Key Modules
//!
//! - **Orchestration**: [`cloud`] — [`cloud::CloudOrchestrator`], the
//!   provider trait, error classification, and client-token derivation.
//! - **Error Handling**: [`error`] — [`error::DiskError`], the closed
//!   taxonomy every call site matches on, and [`error::IsRetryable`].
//! - **Retry Logic**: [`retry`] and [`backoff`] — per-API adaptive retry and
//!   the reusable exponential-backoff polling primitive.
//! - **Request Batching**: [`batcher`] — coalesces concurrent lookups for
//!   the same key into a single provider call.
//! - **Device Allocation**: [`device`] — claims and releases device paths
//!   per node, with taint tracking for devices the provider rejected.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use disk_orchestrator_core::cloud::{CloudOrchestrator, Ec2DiskApi};
//! use disk_orchestrator_core::config::DriverConfig;
//!
//! # async fn example(provider: Arc<dyn Ec2DiskApi>) -> disk_orchestrator_core::Result<()> {
//! let orchestrator = CloudOrchestrator::new(
//!     provider,
//!     DriverConfig::default(),
//!     "us-west-2".to_string(),
//!     "123456789012".to_string(),
//! );
//!
//! let disk = orchestrator.get_disk_by_id("vol-0123456789abcdef0").await?;
//! # let _ = disk;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod batcher;
pub mod cache;
pub mod cancel;
pub mod cloud;
pub mod config;
pub mod device;
pub mod error;
pub mod retry;
pub mod tags;
pub mod validation;

// Re-export commonly used types for convenience.
pub use cloud::{CloudOrchestrator, Ec2DiskApi, ProviderError};
pub use config::DriverConfig;
pub use error::{ConfigError, DiskError, IsRetryable, Result};
