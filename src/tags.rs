//! Reserved tag keys and helpers (spec §6)
//!
//! The driver recognizes and writes a closed set of reserved tag keys.
//! Everything here is pure string/map manipulation; no provider calls.

use crate::config::DriverConfig;
use std::collections::HashMap;

/// Parse the boolean sentinel stored in `<driver>/AllowAutoIOPSIncreaseOnModify`,
/// matching case-insensitively (spec §6).
pub fn parse_bool_sentinel(value: Option<&String>) -> bool {
    match value {
        Some(v) => v.eq_ignore_ascii_case("true"),
        None => false,
    }
}

/// Read the `<driver>/IOPSPerGb` tag, if present and numeric.
pub fn read_iops_per_gb_tag(tags: &HashMap<String, String>, config: &DriverConfig) -> Option<f64> {
    tags.get(&config.iops_per_gb_tag())
        .and_then(|v| v.parse::<f64>().ok())
}

/// Read the `<driver>/AllowAutoIOPSIncreaseOnModify` tag.
pub fn read_allow_auto_increase_tag(
    tags: &HashMap<String, String>,
    config: &DriverConfig,
) -> bool {
    parse_bool_sentinel(tags.get(&config.allow_auto_iops_increase_tag()))
}

/// Build the tag set for a `CreateVolume` call: caller tags plus
/// `CSIVolumeName`, `<driver>/cluster`, and (if present) the IOPS-per-GB
/// sentinel so a future resize can honor it.
pub fn build_create_volume_tags(
    volume_name: &str,
    iops_per_gb: Option<f64>,
    caller_tags: &HashMap<String, String>,
    config: &DriverConfig,
) -> HashMap<String, String> {
    let mut tags = caller_tags.clone();
    tags.insert(
        config.csi_volume_name_tag().to_string(),
        volume_name.to_string(),
    );
    if !config.cluster_id.is_empty() {
        tags.insert(config.cluster_tag(), config.cluster_id.clone());
    }
    if let Some(ratio) = iops_per_gb {
        tags.insert(config.iops_per_gb_tag(), ratio.to_string());
    }
    tags
}

/// Build the tag set for a `CreateSnapshot` call.
pub fn build_create_snapshot_tags(
    snapshot_name: &str,
    caller_tags: &HashMap<String, String>,
    config: &DriverConfig,
) -> HashMap<String, String> {
    let mut tags = caller_tags.clone();
    tags.insert(
        config.csi_volume_snapshot_name_tag().to_string(),
        snapshot_name.to_string(),
    );
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bool_sentinel_case_insensitively() {
        assert!(parse_bool_sentinel(Some(&"True".to_string())));
        assert!(parse_bool_sentinel(Some(&"TRUE".to_string())));
        assert!(!parse_bool_sentinel(Some(&"false".to_string())));
        assert!(!parse_bool_sentinel(None));
    }

    #[test]
    fn create_volume_tags_include_reserved_keys() {
        let config = DriverConfig {
            cluster_id: "cluster-1".to_string(),
            ..DriverConfig::default()
        };
        let tags = build_create_volume_tags("my-vol", Some(12.5), &HashMap::new(), &config);
        assert_eq!(tags.get("CSIVolumeName").unwrap(), "my-vol");
        assert_eq!(tags.get(&config.cluster_tag()).unwrap(), "cluster-1");
        assert_eq!(tags.get(&config.iops_per_gb_tag()).unwrap(), "12.5");
    }
}
