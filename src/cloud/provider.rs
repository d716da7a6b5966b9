//! Narrow provider abstraction (spec §6 downstream, §9).
//!
//! The orchestrator talks to exactly one narrow trait, [`Ec2DiskApi`], never
//! to `aws_sdk_ec2::Client` directly. The trait only names the handful of
//! EC2 operations the orchestrator needs, each stripped to the fields that
//! matter here, so a test double can implement it without dragging in the
//! SDK's request builders (spec §9: "do not leak SDK types into the core").
//! A production implementation adapts `aws_sdk_ec2::Client` and constructs
//! [`ProviderError`] from whatever the SDK gives it; [`crate::cloud::classify`]
//! is where that gets turned into the closed [`crate::error::DiskError`]
//! taxonomy.

use crate::cloud::types::{Disk, DiskOptions, ModifyDiskOptions, ModifyTagsOptions, Snapshot};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// A single block device mapping entry as reported by `DescribeInstances`:
/// device path -> attached volume id.
pub type BlockDeviceMap = HashMap<String, String>;

/// The EC2 operations the orchestrator core depends on (spec §4.F). Kept
/// intentionally narrow: no request builder types, no pagination tokens, no
/// SDK-specific output structs cross this boundary.
#[async_trait]
pub trait Ec2DiskApi: Send + Sync {
    async fn create_volume(&self, options: &DiskOptions) -> Result<Disk>;

    async fn create_volume_from_source(
        &self,
        source_volume_id: &str,
        options: &DiskOptions,
    ) -> Result<Disk>;

    async fn delete_volume(&self, volume_id: &str) -> Result<()>;

    async fn describe_volume(&self, volume_id: &str) -> Result<Disk>;

    async fn describe_volumes_by_tag(&self, tag_key: &str, tag_value: &str) -> Result<Vec<Disk>>;

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;

    async fn attach_cluster_node_volume(
        &self,
        volume_id: &str,
        node_id: &str,
        device: &str,
    ) -> Result<()>;

    async fn detach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;

    async fn detach_cluster_node_volume(
        &self,
        volume_id: &str,
        node_id: &str,
        device: &str,
    ) -> Result<()>;

    async fn modify_volume(&self, volume_id: &str, options: &ModifyDiskOptions) -> Result<()>;

    async fn describe_volume_modification(&self, volume_id: &str)
        -> Result<VolumeModificationState>;

    async fn modify_tags(&self, resource_id: &str, options: &ModifyTagsOptions) -> Result<()>;

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
        client_token: &str,
        tags: &HashMap<String, String>,
    ) -> Result<Snapshot>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;

    async fn describe_snapshots_by_tag(
        &self,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<Snapshot>>;

    async fn list_snapshots(
        &self,
        max_results: i32,
        next_token: Option<&str>,
    ) -> Result<(Vec<Snapshot>, Option<String>)>;

    async fn enable_fast_snapshot_restores(
        &self,
        snapshot_id: &str,
        availability_zones: &[String],
    ) -> Result<()>;

    async fn describe_volume_status(&self, volume_id: &str) -> Result<VolumeStatusDetail>;

    async fn describe_instance_block_devices(&self, instance_id: &str) -> Result<BlockDeviceMap>;

    async fn describe_instance_type(&self, instance_id: &str) -> Result<String>;

    async fn availability_zones(&self, region: &str) -> Result<Vec<String>>;

    /// Dry-run create parsed for the account's max-IOPS limit for `type` in
    /// `zone` (spec §4.F.1 step 4). Adapters issue the dry-run and apply
    /// [`crate::cloud::classify::parse_iops_limit_from_dry_run`]
    /// themselves, since the message shape is provider-specific.
    async fn probe_max_iops(
        &self,
        volume_type: crate::cloud::types::VolumeType,
        zone: &str,
    ) -> Result<i64>;

    /// Dry-run describe used solely to probe liveness (spec §4.E): must
    /// return `Ok(())` iff the provider responded with the distinguished
    /// `DryRunOperation` pseudo-error.
    async fn dry_run_probe(&self) -> Result<()>;
}

/// `describe_volume_modification` state (spec §3: volume-modification state
/// machine `modifying -> optimizing -> completed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeModificationState {
    Modifying,
    Optimizing,
    Completed,
    Failed,
    /// `describe-volumes-modifications` returned no record for this volume.
    /// Not a provider error: the taxonomy's `not-being-modified` kind is
    /// handled internally as "done", never surfaced to callers (spec §7).
    NotBeingModified,
}

/// `DescribeVolumeStatus` detail relevant to `IsVolumeInitialized` (spec
/// §4.F.6): the `{Name=initialization-state, Status=initializing}` entry
/// and, if present, the provider's ETA.
#[derive(Debug, Clone, Copy)]
pub struct VolumeStatusDetail {
    pub initializing: bool,
    pub estimated_seconds_remaining: Option<u64>,
}

/// A provider-side error carrying the raw AWS EC2 error code and message,
/// before classification. Adapters construct this from whatever the SDK
/// gives them; [`crate::cloud::classify::classify`] is the only thing
/// allowed to read it.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Pseudo-error EC2 returns for a successful dry-run liveness probe (spec
/// §4.E / §6): the API call would have succeeded had `dry_run` not been
/// set. The orchestrator treats this as success, not failure.
pub const DRY_RUN_OPERATION: &str = "DryRunOperation";
