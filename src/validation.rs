//! Input validation
//!
//! Guards the orchestrator's public entry points against malformed
//! arguments before any provider call is made (spec §7: `invalid-request`
//! is "the core rejected the inputs", distinct from `invalid-argument`
//! which is the provider's rejection).

use crate::cloud::types::{DiskOptions, IopsLimits};
use crate::error::{DiskError, Result};

/// EBS volume id: `vol-` followed by 8 or 17 hex characters.
pub fn validate_volume_id(volume_id: &str) -> Result<()> {
    if !volume_id.starts_with("vol-") {
        return Err(DiskError::InvalidRequest(format!(
            "volume id must start with 'vol-', got: {volume_id}"
        )));
    }
    let hex_part = &volume_id[4..];
    if !matches!(hex_part.len(), 8 | 17) || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DiskError::InvalidRequest(format!(
            "volume id must be 'vol-' followed by 8 or 17 hex characters, got: {volume_id}"
        )));
    }
    Ok(())
}

/// EBS snapshot id: `snap-` followed by 8 or 17 hex characters.
pub fn validate_snapshot_id(snapshot_id: &str) -> Result<()> {
    if !snapshot_id.starts_with("snap-") {
        return Err(DiskError::InvalidRequest(format!(
            "snapshot id must start with 'snap-', got: {snapshot_id}"
        )));
    }
    let hex_part = &snapshot_id[5..];
    if !matches!(hex_part.len(), 8 | 17) || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DiskError::InvalidRequest(format!(
            "snapshot id must be 'snap-' followed by 8 or 17 hex characters, got: {snapshot_id}"
        )));
    }
    Ok(())
}

/// EC2 instance id: `i-` followed by 8 or 17 hex characters.
pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    if !instance_id.starts_with("i-") {
        return Err(DiskError::InvalidRequest(format!(
            "instance id must start with 'i-', got: {instance_id}"
        )));
    }
    let hex_part = &instance_id[2..];
    if !matches!(hex_part.len(), 8 | 17) || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DiskError::InvalidRequest(format!(
            "instance id must be 'i-' followed by 8 or 17 hex characters, got: {instance_id}"
        )));
    }
    Ok(())
}

/// `ListSnapshots`' paging bound (spec §4.F.5, §8): 0 means "provider
/// default", 1-4 is rejected outright (provider constraint), >=5 is
/// accepted.
pub fn validate_max_results(max_results: i32) -> Result<()> {
    if (1..5).contains(&max_results) {
        return Err(DiskError::InvalidMaxResults(max_results));
    }
    if max_results < 0 {
        return Err(DiskError::InvalidMaxResults(max_results));
    }
    Ok(())
}

/// `DiskOptions` invariants that the core itself enforces before ever
/// reaching the provider (spec §4.F.1 step 1, §3 invariants).
pub fn validate_disk_options(options: &DiskOptions) -> Result<()> {
    if options.capacity_gib <= 0 {
        return Err(DiskError::InvalidRequest(
            "capacity must be greater than zero".to_string(),
        ));
    }
    if options.multi_attach_enabled && !options.volume_type.supports_multi_attach() {
        return Err(DiskError::InvalidRequest(format!(
            "multi-attach is only supported on io2 volumes, got {}",
            options.volume_type
        )));
    }
    if let Some(IopsLimits::Absolute(_)) = options.iops {
        if !options.volume_type.supports_provisioned_iops() {
            return Err(DiskError::InvalidRequest(format!(
                "{} volumes do not accept an explicit IOPS value",
                options.volume_type
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn validates_volume_id_shapes() {
        assert!(validate_volume_id("vol-0123abcd").is_ok());
        assert!(validate_volume_id("vol-0123abcd1234567a").is_ok());
        assert!(validate_volume_id("vol-123").is_err());
        assert!(validate_volume_id("i-0123abcd").is_err());
    }

    #[test]
    fn validates_max_results_boundaries() {
        assert!(validate_max_results(0).is_ok());
        assert!(validate_max_results(5).is_ok());
        assert!(validate_max_results(1).is_err());
        assert!(validate_max_results(4).is_err());
        assert!(validate_max_results(-1).is_err());
    }

    fn base_options() -> DiskOptions {
        DiskOptions {
            capacity_gib: 10,
            volume_type: crate::cloud::types::VolumeType::Gp3,
            availability_zone: None,
            availability_zone_id: None,
            outpost_arn: None,
            iops: None,
            throughput_mibps: None,
            kms_key_id: None,
            encrypted: false,
            snapshot_id: None,
            source_volume_id: None,
            tags: HashMap::new(),
            client_token: "token".to_string(),
            multi_attach_enabled: false,
            initialization_rate_mibps: None,
            allow_iops_per_gb_increase: false,
        }
    }

    #[test]
    fn rejects_multi_attach_on_non_io2() {
        let mut options = base_options();
        options.multi_attach_enabled = true;
        assert!(validate_disk_options(&options).is_err());
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut options = base_options();
        options.capacity_gib = 0;
        assert!(validate_disk_options(&options).is_err());
    }

    #[test]
    fn accepts_valid_options() {
        assert!(validate_disk_options(&base_options()).is_ok());
    }
}
