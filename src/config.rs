//! Driver configuration and hard-coded provider tables
//!
//! [`DriverConfig`] is the handful of values the orchestrator needs at
//! construction and cannot discover from the provider: the driver's tag
//! namespace, and the two tables spec §9 calls out as "external data the
//! implementation must supply" (default IOPS limits, multi-card instance
//! types).

use serde::{Deserialize, Serialize};

use crate::cloud::types::VolumeType;

/// Values the orchestrator is constructed with. Unlike the teacher's
/// `AwsConfig`, nothing here is loaded from a file on the node: region and
/// instance metadata are discovered upstream (out of scope, spec §1) and
/// passed in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Tag key namespace, e.g. `ebs.csi.aws.com` — prefixed onto
    /// `<driver>/cluster`, `<driver>/IOPSPerGb`, etc. (spec §6).
    pub tag_prefix: String,
    /// Cluster identifier written into `<driver>/cluster`.
    pub cluster_id: String,
    /// Prefix identifying a managed-cluster node id, e.g. `hyperpod-` (spec
    /// §4.F.2).
    pub managed_cluster_node_prefix: String,
    /// `12h` sliding TTL for the IOPS-limits-per-(type,zone) cache.
    pub iops_limits_cache_ttl_secs: u64,
    /// `1h` sliding TTL for the client-token-counter and likely-bad-device
    /// caches (spec §4.F.7).
    pub token_counter_cache_ttl_secs: u64,
    /// How often the dry-run liveness probe is re-armed (spec §4.E: 3h).
    pub dry_run_interval_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tag_prefix: "ebs.csi.aws.com".to_string(),
            cluster_id: String::new(),
            managed_cluster_node_prefix: "hyperpod-".to_string(),
            iops_limits_cache_ttl_secs: 12 * 3600,
            token_counter_cache_ttl_secs: 3600,
            dry_run_interval_secs: 3 * 3600,
        }
    }
}

impl DriverConfig {
    pub fn csi_volume_name_tag(&self) -> &'static str {
        "CSIVolumeName"
    }

    pub fn csi_volume_snapshot_name_tag(&self) -> &'static str {
        "CSIVolumeSnapshotName"
    }

    pub fn cluster_tag(&self) -> String {
        format!("{}/cluster", self.tag_prefix)
    }

    pub fn iops_per_gb_tag(&self) -> String {
        format!("{}/IOPSPerGb", self.tag_prefix)
    }

    pub fn allow_auto_iops_increase_tag(&self) -> String {
        format!("{}/AllowAutoIOPSIncreaseOnModify", self.tag_prefix)
    }

    pub fn is_managed_cluster_node(&self, node_id: &str) -> bool {
        node_id.starts_with(&self.managed_cluster_node_prefix)
    }
}

/// Hard-coded default IOPS limits, used as a fallback when the per-(type,
/// zone) dry-run probe (spec §4.F.1 step 4) can't be parsed. Values mirror
/// the published EBS defaults as of this driver's design.
#[derive(Debug, Clone, Copy)]
pub struct IopsLimitsTable {
    pub min_iops: i64,
    pub max_iops: i64,
    pub max_iops_per_gb: f64,
}

pub fn default_iops_limits(volume_type: VolumeType) -> IopsLimitsTable {
    match volume_type {
        VolumeType::Gp2 => IopsLimitsTable {
            min_iops: 100,
            max_iops: 16_000,
            max_iops_per_gb: 3.0,
        },
        VolumeType::Gp3 => IopsLimitsTable {
            min_iops: 3_000,
            max_iops: 16_000,
            max_iops_per_gb: 500.0,
        },
        VolumeType::Io1 => IopsLimitsTable {
            min_iops: 100,
            max_iops: 64_000,
            max_iops_per_gb: 50.0,
        },
        VolumeType::Io2 => IopsLimitsTable {
            min_iops: 100,
            max_iops: 256_000,
            max_iops_per_gb: 500.0,
        },
        VolumeType::St1 | VolumeType::Sc1 => IopsLimitsTable {
            min_iops: 0,
            max_iops: 0,
            max_iops_per_gb: 0.0,
        },
    }
}

/// Instance-type -> network-card-count table referenced by the device
/// manager (spec §4.C, §9). Kept here rather than in `device::mod` so the
/// orchestrator's construction code has one place to override it.
pub fn default_card_count_for_instance_type(instance_type: &str) -> usize {
    crate::device::default_card_count_for_instance_type(instance_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_cluster_node_prefix_check() {
        let config = DriverConfig::default();
        assert!(config.is_managed_cluster_node("hyperpod-cluster1-i-0abc"));
        assert!(!config.is_managed_cluster_node("i-0abc123"));
    }

    #[test]
    fn tag_keys_use_configured_prefix() {
        let config = DriverConfig {
            tag_prefix: "example.csi.io".to_string(),
            ..DriverConfig::default()
        };
        assert_eq!(config.cluster_tag(), "example.csi.io/cluster");
        assert_eq!(config.iops_per_gb_tag(), "example.csi.io/IOPSPerGb");
    }

    #[test]
    fn gp3_defaults_match_published_limits() {
        let limits = default_iops_limits(VolumeType::Gp3);
        assert_eq!(limits.min_iops, 3_000);
        assert_eq!(limits.max_iops, 16_000);
    }
}
