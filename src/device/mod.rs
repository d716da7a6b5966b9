//! Device manager (component C)
//!
//! Maintains the process-wide in-flight device-name table per node and
//! hands out [`Device`] handles to callers attaching a volume. A `Device`
//! carries a lightweight back-reference into the manager rather than owning
//! it outright, so `Device` and `DeviceManager` don't form an ownership
//! cycle (spec §9 design note): the manager is `Arc`-shared, and a device
//! only remembers which `(node, volume)` key to release.

pub mod allocator;

use crate::error::{DiskError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A device name claimed (or already assigned) for a `(node, volume)` pair.
#[derive(Clone)]
pub struct Device {
    manager: Arc<DeviceManagerInner>,
    pub node_id: String,
    pub volume_id: String,
    pub path: String,
    pub is_already_assigned: bool,
    pub card_index: Option<usize>,
    tainted: Arc<AtomicBool>,
}

impl Device {
    /// Release the in-flight claim. A no-op if the device has been
    /// [`Device::taint`]ed and `force` is false — tainting is how the
    /// attach path keeps a name "claimed" after a poll timeout, so it isn't
    /// immediately handed back out.
    ///
    /// Fails with [`DiskError::Internal`] if the recorded volume id for this
    /// path no longer matches `self.volume_id`: that means another caller
    /// already reallocated the freed name out from under this release, and
    /// deleting it would corrupt that caller's claim.
    pub async fn release(&self, force: bool) -> Result<()> {
        if self.tainted.load(Ordering::Acquire) && !force {
            return Ok(());
        }
        self.manager.release(&self.node_id, &self.path, &self.volume_id).await
    }

    /// Mark the device so a non-forced `release` becomes a no-op. Used when
    /// an attach poll times out: the name stays claimed so it isn't
    /// immediately reused for a different volume while the provider might
    /// still be mid-attach.
    pub fn taint(&self) {
        self.tainted.store(true, Ordering::Release);
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::Acquire)
    }
}

struct InFlightEntry {
    volume_id: String,
    device_name: String,
    card_index: Option<usize>,
}

struct DeviceManagerInner {
    // node_id -> volume_id -> entry
    inflight: Mutex<HashMap<String, HashMap<String, InFlightEntry>>>,
    card_count_for_instance_type: fn(&str) -> usize,
}

impl DeviceManagerInner {
    async fn release(&self, node_id: &str, path: &str, volume_id: &str) -> Result<()> {
        let mut inflight = self.inflight.lock().await;
        let Some(node_table) = inflight.get_mut(node_id) else {
            return Ok(());
        };
        let Some(recorded_volume) = node_table
            .iter()
            .find(|(_, entry)| entry.device_name == path)
            .map(|(v, _)| v.clone())
        else {
            return Ok(());
        };
        if recorded_volume != volume_id {
            return Err(DiskError::Internal(format!(
                "device {path} on node {node_id} now belongs to volume {recorded_volume}, not {volume_id}; refusing to release"
            )));
        }
        node_table.remove(&recorded_volume);
        Ok(())
    }
}

/// Instance-type -> network-card-count table (spec §9: "the spec leaves the
/// table as an external datum the implementation must supply"). Instance
/// families known to expose more than one network card for EBS attachment
/// get their volumes balanced across cards; everything else is single-card.
pub fn default_card_count_for_instance_type(instance_type: &str) -> usize {
    match instance_type {
        "p4d.24xlarge" | "p4de.24xlarge" => 4,
        "p5.48xlarge" | "p5e.48xlarge" => 8,
        "trn1n.32xlarge" => 2,
        _ => 1,
    }
}

/// Owns the process-wide in-flight attachment table (spec §4.C).
pub struct DeviceManager {
    inner: Arc<DeviceManagerInner>,
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::with_card_table(default_card_count_for_instance_type)
    }

    pub fn with_card_table(card_count_for_instance_type: fn(&str) -> usize) -> Self {
        Self {
            inner: Arc::new(DeviceManagerInner {
                inflight: Mutex::new(HashMap::new()),
                card_count_for_instance_type,
            }),
        }
    }

    /// Claim a device for `volume_id` on `node_id`.
    ///
    /// `provider_reported` is the set of device paths the instance's
    /// provider-reported block device mapping already shows in use;
    /// `likely_bad` is the node's likely-bad-device-names set (spec §4.A /
    /// §4.C). If `volume_id` is already present in the combined
    /// (provider-reported ∪ in-flight) map, that existing path is returned
    /// with `is_already_assigned = true` rather than allocating a new one.
    pub async fn new_device(
        &self,
        node_id: &str,
        instance_type: &str,
        volume_id: &str,
        provider_reported: &HashMap<String, String>,
        likely_bad: &HashSet<String>,
    ) -> Result<Device> {
        let mut inflight = self.inner.inflight.lock().await;
        let node_table = inflight.entry(node_id.to_string()).or_default();

        let mut existing_paths: HashSet<String> =
            provider_reported.keys().cloned().collect();
        for entry in node_table.values() {
            existing_paths.insert(entry.device_name.clone());
        }

        // Already assigned: either the provider reports this volume at some
        // path, or we have an in-flight claim for it already.
        if let Some(path) = provider_reported
            .iter()
            .find(|(_, v)| *v == volume_id)
            .map(|(p, _)| p.clone())
            .or_else(|| {
                node_table
                    .get(volume_id)
                    .map(|entry| entry.device_name.clone())
            })
        {
            let card_index = node_table.get(volume_id).and_then(|e| e.card_index);
            return Ok(Device {
                manager: self.inner.clone(),
                node_id: node_id.to_string(),
                volume_id: volume_id.to_string(),
                path,
                is_already_assigned: true,
                card_index,
                tainted: Arc::new(AtomicBool::new(false)),
            });
        }

        let path = allocator::next_device_name(&existing_paths, likely_bad)
            .map_err(|e| DiskError::Internal(e.to_string()))?;

        let card_count = (self.inner.card_count_for_instance_type)(instance_type);
        let card_index = if card_count > 1 {
            Some(self.pick_least_loaded_card(node_table, card_count))
        } else {
            None
        };

        node_table.insert(
            volume_id.to_string(),
            InFlightEntry {
                volume_id: volume_id.to_string(),
                device_name: path.clone(),
                card_index,
            },
        );

        Ok(Device {
            manager: self.inner.clone(),
            node_id: node_id.to_string(),
            volume_id: volume_id.to_string(),
            path,
            is_already_assigned: false,
            card_index,
            tainted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Release the in-flight claim for `(node_id, volume_id)` at `path`
    /// without holding a [`Device`] handle (used by the detach path, which
    /// only has a path string from a read-only [`DeviceManager::get_device`]
    /// lookup). Subject to the same mismatch check as [`Device::release`].
    pub async fn release(&self, node_id: &str, volume_id: &str, path: &str) -> Result<()> {
        self.inner.release(node_id, path, volume_id).await
    }

    /// Read-only lookup combining provider-reported state with the in-flight
    /// table; does not allocate.
    pub async fn get_device(
        &self,
        node_id: &str,
        volume_id: &str,
        provider_reported: &HashMap<String, String>,
    ) -> Option<String> {
        if let Some(path) = provider_reported
            .iter()
            .find(|(_, v)| *v == volume_id)
            .map(|(p, _)| p.clone())
        {
            return Some(path);
        }
        let inflight = self.inner.inflight.lock().await;
        inflight
            .get(node_id)
            .and_then(|table| table.get(volume_id))
            .map(|entry| entry.device_name.clone())
    }

    fn pick_least_loaded_card(
        &self,
        node_table: &HashMap<String, InFlightEntry>,
        card_count: usize,
    ) -> usize {
        let mut load = vec![0usize; card_count];
        for entry in node_table.values() {
            if let Some(idx) = entry.card_index {
                if idx < card_count {
                    load[idx] += 1;
                }
            }
        }
        load.iter()
            .enumerate()
            .min_by_key(|(idx, count)| (**count, *idx))
            .map(|(idx, _)| idx)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_device_assigns_first_free_name() {
        let mgr = DeviceManager::new();
        let device = mgr
            .new_device("node-1", "t3.medium", "vol-1", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(device.path, "/dev/xvdba");
        assert!(!device.is_already_assigned);
        assert!(device.card_index.is_none());
    }

    #[tokio::test]
    async fn repeat_call_for_same_volume_is_already_assigned() {
        let mgr = DeviceManager::new();
        let first = mgr
            .new_device("node-1", "t3.medium", "vol-1", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        let second = mgr
            .new_device("node-1", "t3.medium", "vol-1", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(first.path, second.path);
        assert!(second.is_already_assigned);
    }

    #[tokio::test]
    async fn two_volumes_on_same_node_get_distinct_paths() {
        let mgr = DeviceManager::new();
        let a = mgr
            .new_device("node-1", "t3.medium", "vol-a", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        let b = mgr
            .new_device("node-1", "t3.medium", "vol-b", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        assert_ne!(a.path, b.path);
    }

    #[tokio::test]
    async fn provider_reported_mapping_is_respected() {
        let mgr = DeviceManager::new();
        let mut reported = HashMap::new();
        reported.insert("/dev/xvdba".to_string(), "vol-existing".to_string());
        let device = mgr
            .new_device("node-1", "t3.medium", "vol-new", &reported, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(device.path, "/dev/xvdbb");
    }

    #[tokio::test]
    async fn release_then_reallocate_reuses_name() {
        let mgr = DeviceManager::new();
        let device = mgr
            .new_device("node-1", "t3.medium", "vol-a", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        device.release(false).await.unwrap();
        let device2 = mgr
            .new_device("node-1", "t3.medium", "vol-b", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(device.path, device2.path);
    }

    #[tokio::test]
    async fn tainted_release_is_a_no_op_unless_forced() {
        let mgr = DeviceManager::new();
        let device = mgr
            .new_device("node-1", "t3.medium", "vol-a", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        device.taint();
        device.release(false).await.unwrap();
        // Still claimed: a fresh allocation for a different volume must
        // skip this path.
        let device2 = mgr
            .new_device("node-1", "t3.medium", "vol-b", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        assert_ne!(device.path, device2.path);

        device.release(true).await.unwrap();
        let device3 = mgr
            .new_device("node-1", "t3.medium", "vol-c", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(device.path, device3.path);
    }

    #[tokio::test]
    async fn multi_card_instance_balances_across_cards() {
        let mgr = DeviceManager::with_card_table(|_| 2);
        let a = mgr
            .new_device("node-1", "p4d.24xlarge", "vol-a", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        let b = mgr
            .new_device("node-1", "p4d.24xlarge", "vol-b", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        assert_eq!(a.card_index, Some(0));
        assert_eq!(b.card_index, Some(1));
    }

    #[tokio::test]
    async fn release_with_mismatched_volume_fails() {
        let mgr = DeviceManager::new();
        let device = mgr
            .new_device("node-1", "t3.medium", "vol-a", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        device.taint();
        device.release(true).await.unwrap();
        let _reallocated = mgr
            .new_device("node-1", "t3.medium", "vol-b", &HashMap::new(), &HashSet::new())
            .await
            .unwrap();
        // The original (stale) Device handle now points at a path owned by
        // vol-b; releasing it again must fail rather than delete vol-b's claim.
        let result = device.release(true).await;
        assert!(result.is_err());
    }
}
