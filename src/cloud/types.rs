//! Core data model: the public request/response types the orchestrator
//! (component F) operates on, independent of any provider SDK.

use std::collections::HashMap;
use std::time::SystemTime;

/// EBS volume type (spec §2 GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeType {
    Gp2,
    Gp3,
    Io1,
    Io2,
    St1,
    Sc1,
}

impl VolumeType {
    /// Whether this type supports multi-attach (spec §3: io2 only).
    pub fn supports_multi_attach(self) -> bool {
        matches!(self, VolumeType::Io2)
    }

    /// Whether this type accepts an explicit IOPS value at all.
    pub fn supports_provisioned_iops(self) -> bool {
        matches!(self, VolumeType::Gp3 | VolumeType::Io1 | VolumeType::Io2)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VolumeType::Gp2 => "gp2",
            VolumeType::Gp3 => "gp3",
            VolumeType::Io1 => "io1",
            VolumeType::Io2 => "io2",
            VolumeType::St1 => "st1",
            VolumeType::Sc1 => "sc1",
        }
    }
}

impl std::str::FromStr for VolumeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gp2" => Ok(VolumeType::Gp2),
            "gp3" => Ok(VolumeType::Gp3),
            "io1" => Ok(VolumeType::Io1),
            "io2" => Ok(VolumeType::Io2),
            "st1" => Ok(VolumeType::St1),
            "sc1" => Ok(VolumeType::Sc1),
            other => Err(format!("unknown volume type: {other}")),
        }
    }
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IOPS configuration: either an absolute value or a per-GiB ratio, never
/// both (spec §3 invariant on `DiskOptions`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IopsLimits {
    Absolute(i64),
    PerGib(f64),
}

/// Parameters for creating a new volume.
#[derive(Debug, Clone)]
pub struct DiskOptions {
    pub capacity_gib: i64,
    pub volume_type: VolumeType,
    pub availability_zone: Option<String>,
    pub availability_zone_id: Option<String>,
    pub outpost_arn: Option<String>,
    pub iops: Option<IopsLimits>,
    pub throughput_mibps: Option<i64>,
    pub kms_key_id: Option<String>,
    pub encrypted: bool,
    /// Restore source: a snapshot id, mutually exclusive with
    /// `source_volume_id` in practice (spec §3).
    pub snapshot_id: Option<String>,
    /// Clone source: another volume id, cloned via the provider's clone API
    /// instead of the create API (spec §4.F.1 step 6).
    pub source_volume_id: Option<String>,
    pub tags: HashMap<String, String>,
    /// Client token used for idempotent create/restore (spec §3: SHA-256 hex
    /// digest of the request, truncated to 64 chars).
    pub client_token: String,
    pub multi_attach_enabled: bool,
    /// Initialization-rate hint passed through to the provider (spec §3).
    pub initialization_rate_mibps: Option<i64>,
    /// Allow the resolved IOPS to be raised to the account's minimum even
    /// when the requested IOPS-per-GB value would otherwise fall below it
    /// (spec §4.F.1 step 5).
    pub allow_iops_per_gb_increase: bool,
}

/// Parameters for `ResizeOrModifyDisk` (spec §3).
#[derive(Debug, Clone, Default)]
pub struct ModifyDiskOptions {
    pub new_capacity_gib: Option<i64>,
    pub new_volume_type: Option<VolumeType>,
    pub new_iops: Option<IopsLimits>,
    pub new_throughput_mibps: Option<i64>,
    pub allow_iops_increase_on_resize: bool,
}

/// Parameters for a tag-only modification (spec §B supplemented feature).
#[derive(Debug, Clone)]
pub struct ModifyTagsOptions {
    pub tags_to_set: HashMap<String, String>,
    pub tags_to_delete: Vec<String>,
}

/// A volume as the orchestrator's callers see it.
#[derive(Debug, Clone)]
pub struct Disk {
    pub volume_id: String,
    pub capacity_gib: i64,
    pub volume_type: VolumeType,
    pub availability_zone: String,
    pub snapshot_id: Option<String>,
    pub source_volume_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub multi_attach_enabled: bool,
    pub state: VolumeLifecycleState,
    pub tags: HashMap<String, String>,
    pub iops: Option<i64>,
    pub throughput_mibps: Option<i64>,
}

/// Volume creation/lifecycle state (spec §4.F "Concurrency state machines":
/// `creating -> available`; any other terminal state is an error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeLifecycleState {
    Creating,
    Available,
    Deleting,
    Deleted,
    Error,
}

/// Volume attachment state machine (spec §4.F's concurrency state
/// machines): `detached -> attaching -> attached -> detaching -> detached`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
}

/// A single attachment record on a [`Disk`].
#[derive(Debug, Clone)]
pub struct Attachment {
    pub instance_id: String,
    pub device: String,
    pub state: AttachmentState,
    /// Present for managed-cluster-node attachments: the `AssociatedResource`
    /// ARN, whose last two hyphen-separated segments encode the instance id
    /// (spec §6). Normal EC2-instance attachments leave this `None` and are
    /// matched on `instance_id` directly.
    pub associated_resource: Option<String>,
}

/// A point-in-time snapshot of a volume.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub size_gib: i64,
    pub creation_time: SystemTime,
    pub ready_to_use: bool,
}

/// A claimed attach target on a node, returned to callers of
/// `AttachDisk`/`GetDevice` (mirrors [`crate::device::Device`] but without
/// the back-reference, since it crosses the orchestrator/caller boundary).
#[derive(Debug, Clone)]
pub struct Device {
    pub node_id: String,
    pub volume_id: String,
    pub path: String,
    pub is_already_assigned: bool,
}

/// Result of `IsVolumeInitialized` (spec §3: fast-snapshot-restore /
/// volume-initialization SLA check).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeInitialization {
    Initialized,
    NotInitialized,
    /// The provider doesn't report initialization state for this volume
    /// configuration (e.g. it wasn't created from a snapshot).
    NotApplicable,
}
