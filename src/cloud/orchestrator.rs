//! Cloud Orchestrator (component F)
//!
//! Translates idempotent, high-level disk intents into sequences of calls
//! against the narrow [`Ec2DiskApi`] trait, using the batcher (component D),
//! device manager (component C), and retry manager (component E) so the
//! sequencing survives concurrency, partial failure, and provider
//! throttling. This is the only place in the crate that knows what a
//! `CreateDisk` or `AttachDisk` actually means; everything below it is
//! domain-agnostic infrastructure.

use crate::backoff::{poll_with_backoff, Backoff, PollOutcome};
use crate::cache::ExpiringCache;
use crate::cancel::CancelToken;
use crate::cloud::provider::{Ec2DiskApi, VolumeModificationState, VolumeStatusDetail};
use crate::cloud::token::{self, TokenCounterCache};
use crate::cloud::types::{
    Attachment, AttachmentState, Device, Disk, DiskOptions, IopsLimits, ModifyDiskOptions,
    ModifyTagsOptions, Snapshot, VolumeInitialization, VolumeLifecycleState, VolumeType,
};
use crate::config::{default_iops_limits, DriverConfig, IopsLimitsTable};
use crate::batcher::Batcher;
use crate::device::DeviceManager;
use crate::error::{DiskError, Result};
use crate::retry::RetryManager;
use crate::tags;
use crate::validation;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::warn;

type VolumeByIdBatcher = Batcher<String, Disk>;
type VolumeByTagBatcher = Batcher<String, Vec<Disk>>;
type SnapshotByIdBatcher = Batcher<String, Snapshot>;
type SnapshotByTagBatcher = Batcher<String, Vec<Snapshot>>;
type InstanceBlockDevicesBatcher = Batcher<String, HashMap<String, String>>;
type ModificationByIdBatcher = Batcher<String, VolumeModificationState>;
type StatusBatcher = Batcher<String, VolumeStatusDetail>;

const VOLUME_BATCH_MAX_ENTRIES: usize = 100;
const VOLUME_BATCH_MAX_DELAY: Duration = Duration::from_millis(50);
const STATUS_FAST_MAX_DELAY: Duration = Duration::from_millis(500);
const STATUS_SLOW_MAX_DELAY: Duration = Duration::from_secs(120);
const CSI_VOLUME_NAME_TAG: &str = "CSIVolumeName";
const CSI_VOLUME_SNAPSHOT_NAME_TAG: &str = "CSIVolumeSnapshotName";

/// Cache key for the per-(type, zone) IOPS limits lookup (spec §4.F.1 step
/// 4: keyed on type, zone, zone-id, and outpost together).
#[derive(Clone, PartialEq, Eq, Hash)]
struct IopsLimitsKey {
    volume_type: VolumeType,
    zone: String,
    zone_id: Option<String>,
    outpost_arn: Option<String>,
}

/// Cached `IsVolumeInitialized` state (spec §4.F.6).
#[derive(Clone)]
struct VolumeInitState {
    initialized: bool,
    earliest_next_poll_at: Option<Instant>,
}

/// Fan a batcher's deduplicated key list out into individual provider calls
/// and collect the results (spec §9: the batcher is generic; the
/// per-(API, key-shape) fan-out is the orchestrator's business, not the
/// batcher's). A per-key `NotFound` is dropped from the map — the batcher
/// contract already treats a missing key as "not found" — any other error
/// fails the whole batch, matching "fire invoked once, one error shared by
/// all waiters if it fails".
async fn fetch_individually<K, V, F, Fut>(keys: Vec<K>, call: F) -> Result<HashMap<K, V>>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
    F: Fn(K) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<V>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for key in keys {
        let call = call.clone();
        let key_for_task = key.clone();
        set.spawn(async move {
            let result = call(key).await;
            (key_for_task, result)
        });
    }

    let mut out = HashMap::new();
    while let Some(joined) = set.join_next().await {
        let (key, result) = joined.map_err(|e| DiskError::Internal(format!("join error: {e}")))?;
        match result {
            Ok(value) => {
                out.insert(key, value);
            }
            Err(DiskError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(out)
}

/// Resolve the effective provisioned IOPS for a create or modify request
/// (spec §4.F.1 step 5, §8 invariant): `0` means "no explicit IOPS", raised
/// to `minIops` only when `allow_increase` is set, lowered to `maxIops`,
/// then lowered again to `maxIopsPerGb * capacityGiB` when that product is
/// at least `minIops`.
fn cap_iops(
    volume_type: VolumeType,
    capacity_gib: i64,
    requested: Option<IopsLimits>,
    limits: IopsLimitsTable,
    allow_increase: bool,
) -> i64 {
    if !volume_type.supports_provisioned_iops() {
        return 0;
    }
    let mut req = match requested {
        None => 0,
        Some(IopsLimits::Absolute(v)) => v,
        Some(IopsLimits::PerGib(per_gib)) => (per_gib * capacity_gib as f64).round() as i64,
    };
    if req <= 0 {
        return 0;
    }
    if req < limits.min_iops && allow_increase {
        req = limits.min_iops;
    }
    if req > limits.max_iops {
        req = limits.max_iops;
    }
    let per_gb_cap = (limits.max_iops_per_gb * capacity_gib as f64) as i64;
    if per_gb_cap >= limits.min_iops && req > per_gb_cap {
        req = per_gb_cap;
    }
    req
}

/// Pull the last two hyphen-separated segments out of a managed-cluster
/// node's `AssociatedResource` ARN, reconstructing the EC2 instance id they
/// encode (spec §6).
fn instance_id_from_arn(arn: &str) -> Option<String> {
    let segments: Vec<&str> = arn.split('-').collect();
    if segments.len() < 2 {
        return None;
    }
    Some(format!(
        "{}-{}",
        segments[segments.len() - 2],
        segments[segments.len() - 1]
    ))
}

fn to_public_device(device: &crate::device::Device) -> Device {
    Device {
        node_id: device.node_id.clone(),
        volume_id: device.volume_id.clone(),
        path: device.path.clone(),
        is_already_assigned: device.is_already_assigned,
    }
}

/// The orchestration core (spec §4.F). Constructed once per process and
/// shared (`Arc`) across RPC handlers.
pub struct CloudOrchestrator {
    provider: Arc<dyn Ec2DiskApi>,
    config: DriverConfig,
    region: String,
    #[allow(dead_code)]
    account_id: String,
    retry_manager: Arc<RetryManager>,
    device_manager: Arc<DeviceManager>,
    dry_run_gate: crate::retry::DryRunGate,

    iops_limits_cache: ExpiringCache<IopsLimitsKey, IopsLimitsTable>,
    token_counter_cache: TokenCounterCache,
    likely_bad_device_names: ExpiringCache<String, Mutex<HashSet<String>>>,
    volume_init_cache: ExpiringCache<String, VolumeInitState>,

    volume_by_id: VolumeByIdBatcher,
    volume_by_tag: VolumeByTagBatcher,
    snapshot_by_id: SnapshotByIdBatcher,
    snapshot_by_tag: SnapshotByTagBatcher,
    instance_block_devices: InstanceBlockDevicesBatcher,
    modification_state: ModificationByIdBatcher,
    volume_status_fast: StatusBatcher,
    volume_status_slow: StatusBatcher,
}

impl CloudOrchestrator {
    pub fn new(
        provider: Arc<dyn Ec2DiskApi>,
        config: DriverConfig,
        region: String,
        account_id: String,
    ) -> Self {
        let dry_run_gate = crate::retry::DryRunGate::start(Duration::from_secs(
            config.dry_run_interval_secs,
        ));
        let retry_manager = Arc::new(RetryManager::new());
        let device_manager = Arc::new(DeviceManager::new());

        let iops_limits_cache =
            ExpiringCache::new(Duration::from_secs(config.iops_limits_cache_ttl_secs));
        let token_counter_cache: TokenCounterCache =
            ExpiringCache::new(Duration::from_secs(config.token_counter_cache_ttl_secs));
        let likely_bad_device_names =
            ExpiringCache::new(Duration::from_secs(config.token_counter_cache_ttl_secs));
        let volume_init_cache =
            ExpiringCache::new(Duration::from_secs(config.token_counter_cache_ttl_secs));

        let p = provider.clone();
        let volume_by_id: VolumeByIdBatcher =
            Batcher::new(VOLUME_BATCH_MAX_ENTRIES, VOLUME_BATCH_MAX_DELAY, move |keys| {
                let p = p.clone();
                async move {
                    fetch_individually(keys, move |id: String| {
                        let p = p.clone();
                        async move { p.describe_volume(&id).await }
                    })
                    .await
                }
            });

        let p = provider.clone();
        let volume_by_tag: VolumeByTagBatcher =
            Batcher::new(VOLUME_BATCH_MAX_ENTRIES, VOLUME_BATCH_MAX_DELAY, move |keys| {
                let p = p.clone();
                async move {
                    fetch_individually(keys, move |tag_value: String| {
                        let p = p.clone();
                        async move {
                            p.describe_volumes_by_tag(CSI_VOLUME_NAME_TAG, &tag_value).await
                        }
                    })
                    .await
                }
            });

        let p = provider.clone();
        let snapshot_by_id: SnapshotByIdBatcher =
            Batcher::new(VOLUME_BATCH_MAX_ENTRIES, VOLUME_BATCH_MAX_DELAY, move |keys| {
                let p = p.clone();
                async move {
                    fetch_individually(keys, move |id: String| {
                        let p = p.clone();
                        async move { p.describe_snapshot(&id).await }
                    })
                    .await
                }
            });

        let p = provider.clone();
        let snapshot_by_tag: SnapshotByTagBatcher =
            Batcher::new(VOLUME_BATCH_MAX_ENTRIES, VOLUME_BATCH_MAX_DELAY, move |keys| {
                let p = p.clone();
                async move {
                    fetch_individually(keys, move |tag_value: String| {
                        let p = p.clone();
                        async move {
                            p.describe_snapshots_by_tag(CSI_VOLUME_SNAPSHOT_NAME_TAG, &tag_value)
                                .await
                        }
                    })
                    .await
                }
            });

        let p = provider.clone();
        let instance_block_devices: InstanceBlockDevicesBatcher =
            Batcher::new(VOLUME_BATCH_MAX_ENTRIES, VOLUME_BATCH_MAX_DELAY, move |keys| {
                let p = p.clone();
                async move {
                    fetch_individually(keys, move |id: String| {
                        let p = p.clone();
                        async move { p.describe_instance_block_devices(&id).await }
                    })
                    .await
                }
            });

        let p = provider.clone();
        let modification_state: ModificationByIdBatcher =
            Batcher::new(VOLUME_BATCH_MAX_ENTRIES, VOLUME_BATCH_MAX_DELAY, move |keys| {
                let p = p.clone();
                async move {
                    fetch_individually(keys, move |id: String| {
                        let p = p.clone();
                        async move { p.describe_volume_modification(&id).await }
                    })
                    .await
                }
            });

        let p = provider.clone();
        let volume_status_fast: StatusBatcher =
            Batcher::new(VOLUME_BATCH_MAX_ENTRIES, STATUS_FAST_MAX_DELAY, move |keys| {
                let p = p.clone();
                async move {
                    fetch_individually(keys, move |id: String| {
                        let p = p.clone();
                        async move { p.describe_volume_status(&id).await }
                    })
                    .await
                }
            });

        let p = provider.clone();
        let volume_status_slow: StatusBatcher =
            Batcher::new(VOLUME_BATCH_MAX_ENTRIES, STATUS_SLOW_MAX_DELAY, move |keys| {
                let p = p.clone();
                async move {
                    fetch_individually(keys, move |id: String| {
                        let p = p.clone();
                        async move { p.describe_volume_status(&id).await }
                    })
                    .await
                }
            });

        Self {
            provider,
            config,
            region,
            account_id,
            retry_manager,
            device_manager,
            dry_run_gate,
            iops_limits_cache,
            token_counter_cache,
            likely_bad_device_names,
            volume_init_cache,
            volume_by_id,
            volume_by_tag,
            snapshot_by_id,
            snapshot_by_tag,
            instance_block_devices,
            modification_state,
            volume_status_fast,
            volume_status_slow,
        }
    }

    /// Choose a placement zone (spec §4.F.1 step 2): the caller's zone or
    /// zone-id if either is set, otherwise the provider's first reported
    /// zone. Preserves the "return first zone, not random" behavior
    /// (spec §9 open question).
    async fn resolve_zone(&self, options: &DiskOptions) -> Result<String> {
        if let Some(zone) = options.availability_zone.as_deref() {
            if !zone.is_empty() {
                return Ok(zone.to_string());
            }
        }
        if let Some(zone_id) = options.availability_zone_id.as_deref() {
            if !zone_id.is_empty() {
                return Ok(zone_id.to_string());
            }
        }
        let zones = self.provider.availability_zones(&self.region).await?;
        zones.into_iter().next().ok_or_else(|| {
            DiskError::Internal(format!(
                "provider returned no availability zones for region {}",
                self.region
            ))
        })
    }

    async fn iops_limits_for(
        &self,
        volume_type: VolumeType,
        zone: &str,
        zone_id: Option<&str>,
        outpost_arn: Option<&str>,
    ) -> IopsLimitsTable {
        let key = IopsLimitsKey {
            volume_type,
            zone: zone.to_string(),
            zone_id: zone_id.map(str::to_string),
            outpost_arn: outpost_arn.map(str::to_string),
        };
        if let Some(limits) = self.iops_limits_cache.get(&key).await {
            return *limits;
        }

        let defaults = default_iops_limits(volume_type);
        let max_iops = match self.provider.probe_max_iops(volume_type, zone).await {
            Ok(value) if value > 0 => value,
            Ok(_) => defaults.max_iops,
            Err(err) => {
                warn!("dry-run IOPS probe unparseable, using defaults: {err}");
                defaults.max_iops
            }
        };
        let limits = IopsLimitsTable {
            min_iops: defaults.min_iops,
            max_iops,
            max_iops_per_gb: defaults.max_iops_per_gb,
        };
        self.iops_limits_cache.set(key, limits).await;
        limits
    }

    async fn likely_bad_names_for(&self, node_id: &str) -> Arc<Mutex<HashSet<String>>> {
        if let Some(existing) = self.likely_bad_device_names.get(&node_id.to_string()).await {
            return existing;
        }
        self.likely_bad_device_names
            .set(node_id.to_string(), Mutex::new(HashSet::new()))
            .await;
        self.likely_bad_device_names
            .get(&node_id.to_string())
            .await
            .expect("just inserted")
    }

    // ---- CreateDisk (spec §4.F.1) ----------------------------------------

    pub async fn create_disk(
        &self,
        volume_name: &str,
        mut options: DiskOptions,
        cancel: &CancelToken,
    ) -> Result<Disk> {
        validation::validate_disk_options(&options)?;

        let zone_label = self.resolve_zone(&options).await?;
        if options.availability_zone.as_deref().unwrap_or("").is_empty()
            && options.availability_zone_id.as_deref().unwrap_or("").is_empty()
        {
            options.availability_zone = Some(zone_label.clone());
        }

        let client_token = token::next_client_token(&self.token_counter_cache, volume_name).await;

        let limits = self
            .iops_limits_for(
                options.volume_type,
                &zone_label,
                options.availability_zone_id.as_deref(),
                options.outpost_arn.as_deref(),
            )
            .await;
        let resolved_iops = cap_iops(
            options.volume_type,
            options.capacity_gib,
            options.iops,
            limits,
            options.allow_iops_per_gb_increase,
        );
        let iops_per_gb_tag_value = match options.iops {
            Some(IopsLimits::PerGib(v)) => Some(v),
            _ => None,
        };

        let mut create_options = options.clone();
        create_options.client_token = client_token;
        create_options.iops = if resolved_iops > 0 {
            Some(IopsLimits::Absolute(resolved_iops))
        } else {
            None
        };
        create_options.tags = tags::build_create_volume_tags(
            volume_name,
            iops_per_gb_tag_value,
            &options.tags,
            &self.config,
        );

        let retryer = self.retry_manager.retryer("create_volume").await;
        let provider = self.provider.clone();
        let create_options = Arc::new(create_options);
        let create_result = retryer
            .execute_with_retry(|| {
                let provider = provider.clone();
                let create_options = create_options.clone();
                async move {
                    match &create_options.source_volume_id {
                        Some(src) => {
                            provider.create_volume_from_source(src, &create_options).await
                        }
                        None => provider.create_volume(&create_options).await,
                    }
                }
            })
            .await;

        let disk = match create_result {
            Ok(disk) => disk,
            Err(DiskError::IdempotentParameterMismatch { volume_name }) => {
                token::record_idempotent_mismatch(&self.token_counter_cache, &volume_name).await;
                return Err(DiskError::IdempotentParameterMismatch { volume_name });
            }
            Err(DiskError::VolumeLimitExceeded) => {
                let matches = self
                    .provider
                    .describe_volumes_by_tag(CSI_VOLUME_NAME_TAG, volume_name)
                    .await?;
                match matches.len() {
                    1 => matches.into_iter().next().expect("len checked"),
                    _ => {
                        return Err(DiskError::LimitExceeded(format!(
                            "volume limit exceeded creating {volume_name}"
                        )))
                    }
                }
            }
            Err(err) => return Err(err),
        };

        self.wait_for_creation(&disk.volume_id, cancel).await?;
        self.get_disk_by_id(&disk.volume_id).await
    }

    async fn wait_for_creation(&self, volume_id: &str, cancel: &CancelToken) -> Result<()> {
        let backoff = Backoff::creation();
        let provider = self.provider.clone();
        let id = volume_id.to_string();
        poll_with_backoff(
            &backoff,
            Some(Duration::from_millis(1250)),
            cancel,
            "wait_for_creation",
            volume_id,
            move |_step| {
                let provider = provider.clone();
                let id = id.clone();
                async move {
                    let disk = provider.describe_volume(&id).await?;
                    match disk.state {
                        VolumeLifecycleState::Available => Ok(PollOutcome::Done(())),
                        VolumeLifecycleState::Creating => Ok(PollOutcome::Retry),
                        other => Err(DiskError::Internal(format!(
                            "volume {id} entered unexpected state {other:?} while creating"
                        ))),
                    }
                }
            },
        )
        .await
    }

    pub async fn delete_disk(&self, volume_id: &str) -> Result<bool> {
        validation::validate_volume_id(volume_id)?;
        match self.get_disk_by_id(volume_id).await {
            Ok(disk) if !disk.attachments.is_empty() => {
                return Err(DiskError::InvalidArgument(format!(
                    "volume {volume_id} is still attached to {} instance(s)",
                    disk.attachments.len()
                )));
            }
            Ok(_) => {}
            Err(DiskError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        }
        let retryer = self.retry_manager.retryer("delete_volume").await;
        let provider = self.provider.clone();
        let id = volume_id.to_string();
        match retryer
            .execute_with_retry(|| {
                let provider = provider.clone();
                let id = id.clone();
                async move { provider.delete_volume(&id).await }
            })
            .await
        {
            Ok(()) => Ok(true),
            Err(DiskError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk> {
        validation::validate_volume_id(volume_id)?;
        let found = self
            .volume_by_id
            .get(volume_id.to_string())
            .await
            .map_err(|e| (*e).clone())?;
        found.ok_or_else(|| DiskError::NotFound(format!("volume {volume_id}")))
    }

    pub async fn get_disk_by_name(
        &self,
        volume_name: &str,
        expected_capacity_gib: Option<i64>,
    ) -> Result<Disk> {
        let matches = self
            .volume_by_tag
            .get(volume_name.to_string())
            .await
            .map_err(|e| (*e).clone())?
            .unwrap_or_default();
        match matches.len() {
            0 => Err(DiskError::NotFound(format!("volume named {volume_name}"))),
            1 => {
                let disk = matches.into_iter().next().expect("len checked");
                if let Some(expected) = expected_capacity_gib {
                    if disk.capacity_gib != expected {
                        return Err(DiskError::DiskExistsDiffSize {
                            name: volume_name.to_string(),
                            existing_gib: disk.capacity_gib,
                            requested_gib: expected,
                        });
                    }
                }
                Ok(disk)
            }
            _ => Err(DiskError::MultiDisks {
                tag_value: volume_name.to_string(),
            }),
        }
    }

    // ---- AttachDisk / DetachDisk (spec §4.F.2-4) --------------------------

    pub async fn attach_disk(
        &self,
        node_id: &str,
        volume_id: &str,
        cancel: &CancelToken,
    ) -> Result<Device> {
        validation::validate_volume_id(volume_id)?;

        if self.config.is_managed_cluster_node(node_id) {
            return self.attach_disk_managed_cluster(node_id, volume_id, cancel).await;
        }

        validation::validate_instance_id(node_id)?;
        let instance_type = self
            .provider
            .describe_instance_type(node_id)
            .await
            .unwrap_or_default();

        let provider_reported = self
            .instance_block_devices
            .get(node_id.to_string())
            .await
            .map_err(|e| (*e).clone())?
            .unwrap_or_default();

        let bad_names = self.likely_bad_names_for(node_id).await;
        let likely_bad = bad_names.lock().await.clone();

        let device = self
            .device_manager
            .new_device(node_id, &instance_type, volume_id, &provider_reported, &likely_bad)
            .await?;

        if device.is_already_assigned {
            self.wait_for_attachment_state(
                volume_id,
                node_id,
                node_id,
                AttachmentState::Attached,
                Some(&device.path),
                true,
                false,
                cancel,
            )
            .await?;
            return Ok(to_public_device(&device));
        }

        match self.provider.attach_volume(volume_id, node_id, &device.path).await {
            Ok(()) => {
                bad_names.lock().await.remove(&device.path);
            }
            Err(DiskError::DeviceInUse(msg)) => {
                bad_names.lock().await.insert(device.path.clone());
                return Err(DiskError::DeviceInUse(msg));
            }
            Err(err) => return Err(err),
        }

        if let Err(err) = self
            .wait_for_attachment_state(
                volume_id,
                node_id,
                node_id,
                AttachmentState::Attached,
                Some(&device.path),
                false,
                false,
                cancel,
            )
            .await
        {
            device.taint();
            return Err(err);
        }

        Ok(to_public_device(&device))
    }

    async fn attach_disk_managed_cluster(
        &self,
        node_id: &str,
        volume_id: &str,
        cancel: &CancelToken,
    ) -> Result<Device> {
        let bad_names = self.likely_bad_names_for(node_id).await;
        let likely_bad = bad_names.lock().await.clone();

        let device = self
            .device_manager
            .new_device(node_id, "", volume_id, &HashMap::new(), &likely_bad)
            .await?;

        if device.is_already_assigned {
            self.wait_for_attachment_state(
                volume_id,
                node_id,
                node_id,
                AttachmentState::Attached,
                Some(&device.path),
                true,
                true,
                cancel,
            )
            .await?;
            return Ok(to_public_device(&device));
        }

        match self
            .provider
            .attach_cluster_node_volume(volume_id, node_id, &device.path)
            .await
        {
            Ok(()) => {
                bad_names.lock().await.remove(&device.path);
            }
            Err(DiskError::DeviceInUse(msg)) => {
                bad_names.lock().await.insert(device.path.clone());
                return Err(DiskError::DeviceInUse(msg));
            }
            Err(err) => return Err(err),
        }

        if let Err(err) = self
            .wait_for_attachment_state(
                volume_id,
                node_id,
                node_id,
                AttachmentState::Attached,
                Some(&device.path),
                false,
                true,
                cancel,
            )
            .await
        {
            device.taint();
            return Err(err);
        }

        Ok(to_public_device(&device))
    }

    /// Poll `describe_volume` until the relevant attachment reaches
    /// `expected` (spec §4.F.3).
    #[allow(clippy::too_many_arguments)]
    async fn wait_for_attachment_state(
        &self,
        volume_id: &str,
        node_id: &str,
        match_instance_id: &str,
        expected: AttachmentState,
        requested_device: Option<&str>,
        was_already_assigned: bool,
        managed: bool,
        cancel: &CancelToken,
    ) -> Result<Option<Attachment>> {
        let backoff = Backoff::attachment();
        let provider = self.provider.clone();
        let volume_id_owned = volume_id.to_string();
        let node_id_owned = node_id.to_string();
        let match_instance_id_owned = match_instance_id.to_string();
        let requested_device_owned = requested_device.map(str::to_string);

        poll_with_backoff(
            &backoff,
            None,
            cancel,
            "wait_for_attachment_state",
            volume_id,
            move |_step| {
                let provider = provider.clone();
                let volume_id = volume_id_owned.clone();
                let node_id = node_id_owned.clone();
                let match_instance_id = match_instance_id_owned.clone();
                let requested_device = requested_device_owned.clone();
                async move {
                    let disk = match provider.describe_volume(&volume_id).await {
                        Ok(disk) => disk,
                        Err(DiskError::NotFound(_)) if expected == AttachmentState::Detached => {
                            return Ok(PollOutcome::Done(None));
                        }
                        Err(DiskError::NotFound(msg)) => return Err(DiskError::NotFound(msg)),
                        Err(err) => return Err(err),
                    };

                    if !disk.multi_attach_enabled && disk.attachments.len() > 1 {
                        return Err(DiskError::Internal(format!(
                            "volume {volume_id} has multiple attachments but multi-attach is disabled"
                        )));
                    }

                    let attachment = disk.attachments.iter().find(|a| match &a.associated_resource {
                        Some(arn) => {
                            instance_id_from_arn(arn).as_deref() == Some(match_instance_id.as_str())
                        }
                        None => a.instance_id == match_instance_id,
                    });

                    match (expected, attachment) {
                        (AttachmentState::Detached, None) => Ok(PollOutcome::Done(None)),
                        (AttachmentState::Detached, Some(a))
                            if a.state == AttachmentState::Detached =>
                        {
                            Ok(PollOutcome::Done(None))
                        }
                        (AttachmentState::Detached, Some(_)) => Ok(PollOutcome::Retry),
                        (AttachmentState::Attached, None) => {
                            if was_already_assigned {
                                let device = requested_device.clone().unwrap_or_default();
                                if managed {
                                    let _ = provider
                                        .attach_cluster_node_volume(&volume_id, &node_id, &device)
                                        .await;
                                } else {
                                    let _ = provider
                                        .attach_volume(&volume_id, &node_id, &device)
                                        .await;
                                }
                                return Err(DiskError::Retryable {
                                    attempt: 0,
                                    max_attempts: 0,
                                    reason: format!(
                                        "volume {volume_id} reported detached though device was already assigned; reattach issued"
                                    ),
                                    source: None,
                                });
                            }
                            Ok(PollOutcome::Retry)
                        }
                        (AttachmentState::Attached, Some(a)) => {
                            if let Some(device) = &requested_device {
                                if &a.device != device {
                                    return Ok(PollOutcome::Retry);
                                }
                            }
                            match a.state {
                                AttachmentState::Attached => Ok(PollOutcome::Done(Some(a.clone()))),
                                _ => Ok(PollOutcome::Retry),
                            }
                        }
                        (_, _) => Ok(PollOutcome::Retry),
                    }
                }
            },
        )
        .await
    }

    pub async fn detach_disk(
        &self,
        node_id: &str,
        volume_id: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        validation::validate_volume_id(volume_id)?;
        let managed = self.config.is_managed_cluster_node(node_id);

        let provider_reported = if managed {
            HashMap::new()
        } else {
            self.instance_block_devices
                .get(node_id.to_string())
                .await
                .map_err(|e| (*e).clone())?
                .unwrap_or_default()
        };

        let Some(path) = self.device_manager.get_device(node_id, volume_id, &provider_reported).await
        else {
            return Err(DiskError::NotFound(format!(
                "no attachment for volume {volume_id} on node {node_id}"
            )));
        };

        let retryer = self.retry_manager.retryer("detach_volume").await;
        let provider = self.provider.clone();
        let vol = volume_id.to_string();
        let node = node_id.to_string();
        let path_owned = path.clone();
        let detach_result = retryer
            .execute_with_retry(|| {
                let provider = provider.clone();
                let vol = vol.clone();
                let node = node.clone();
                let path = path_owned.clone();
                async move {
                    if managed {
                        provider.detach_cluster_node_volume(&vol, &node, &path).await
                    } else {
                        provider.detach_volume(&vol, &node, &path).await
                    }
                }
            })
            .await;

        match detach_result {
            Ok(()) => {}
            Err(DiskError::StillModifying { .. }) => {
                return Err(DiskError::NotFound(format!(
                    "volume {volume_id} not attached to {node_id}"
                )))
            }
            Err(err) => return Err(err),
        }

        self.wait_for_attachment_state(
            volume_id,
            node_id,
            node_id,
            AttachmentState::Detached,
            None,
            false,
            managed,
            cancel,
        )
        .await?;

        if let Err(err) = self.device_manager.release(node_id, volume_id, &path).await {
            warn!("device release after detach failed (non-fatal): {err}");
        }
        Ok(())
    }

    // ---- ResizeOrModifyDisk (spec §4.F.4) ---------------------------------

    pub async fn resize_or_modify_disk(
        &self,
        volume_id: &str,
        options: ModifyDiskOptions,
        cancel: &CancelToken,
    ) -> Result<Disk> {
        validation::validate_volume_id(volume_id)?;

        let current = self.get_disk_by_id(volume_id).await?;

        let in_progress = self
            .modification_state
            .get(volume_id.to_string())
            .await
            .map_err(|e| (*e).clone())?;
        match in_progress {
            Some(VolumeModificationState::Modifying) => {
                self.wait_for_modification(volume_id, cancel).await?;
                return self.get_disk_by_id(volume_id).await;
            }
            Some(VolumeModificationState::Optimizing) => {
                return Err(DiskError::StillModifying {
                    volume_id: volume_id.to_string(),
                });
            }
            _ => {}
        }

        let new_capacity = options.new_capacity_gib.unwrap_or(current.capacity_gib);
        let new_type = options.new_volume_type.unwrap_or(current.volume_type);
        let allow_increase = options.allow_iops_increase_on_resize
            || tags::read_allow_auto_increase_tag(&current.tags, &self.config);

        let requested_iops = match options.new_iops {
            Some(iops) => Some(iops),
            None => tags::read_iops_per_gb_tag(&current.tags, &self.config).map(IopsLimits::PerGib),
        };

        let limits = self
            .iops_limits_for(new_type, &current.availability_zone, None, None)
            .await;
        let resolved_iops = cap_iops(new_type, new_capacity, requested_iops, limits, allow_increase);
        let new_throughput = options.new_throughput_mibps.or(current.throughput_mibps);

        let iops_matches = match resolved_iops {
            0 => current.iops.unwrap_or(0) == 0,
            r => current.iops == Some(r),
        };

        if new_capacity == current.capacity_gib
            && new_type == current.volume_type
            && iops_matches
            && new_throughput == current.throughput_mibps
        {
            // A matching request would only start a no-op provider
            // modification that blocks subsequent calls; wait out anything
            // already in flight and return as-is.
            let _ = self.wait_for_modification(volume_id, cancel).await;
            return Ok(current);
        }

        let modify_options = ModifyDiskOptions {
            new_capacity_gib: Some(new_capacity),
            new_volume_type: Some(new_type),
            new_iops: if resolved_iops > 0 {
                Some(IopsLimits::Absolute(resolved_iops))
            } else {
                None
            },
            new_throughput_mibps: new_throughput,
            allow_iops_increase_on_resize: allow_increase,
        };

        let retryer = self.retry_manager.retryer("modify_volume").await;
        let provider = self.provider.clone();
        let vol = volume_id.to_string();
        let modify_options = Arc::new(modify_options);
        retryer
            .execute_with_retry(|| {
                let provider = provider.clone();
                let vol = vol.clone();
                let modify_options = modify_options.clone();
                async move { provider.modify_volume(&vol, &modify_options).await }
            })
            .await?;

        self.wait_for_modification(volume_id, cancel).await?;

        let updated = self.get_disk_by_id(volume_id).await?;
        let attributes_match = updated.capacity_gib == new_capacity
            && updated.volume_type == new_type
            && updated.throughput_mibps == new_throughput
            && (resolved_iops == 0 || updated.iops == Some(resolved_iops));

        if !attributes_match {
            return Err(DiskError::StillModifying {
                volume_id: volume_id.to_string(),
            });
        }
        Ok(updated)
    }

    async fn wait_for_modification(&self, volume_id: &str, cancel: &CancelToken) -> Result<()> {
        let backoff = Backoff::modification();
        let batcher = self.modification_state.clone();
        let id = volume_id.to_string();
        poll_with_backoff(
            &backoff,
            None,
            cancel,
            "wait_for_modification",
            volume_id,
            move |_step| {
                let batcher = batcher.clone();
                let id = id.clone();
                async move {
                    let state = batcher.get(id.clone()).await.map_err(|e| (*e).clone())?;
                    match state {
                        None
                        | Some(VolumeModificationState::NotBeingModified)
                        | Some(VolumeModificationState::Completed)
                        | Some(VolumeModificationState::Optimizing) => Ok(PollOutcome::Done(())),
                        Some(VolumeModificationState::Modifying) => Ok(PollOutcome::Retry),
                        Some(VolumeModificationState::Failed) => Err(DiskError::Internal(format!(
                            "volume {id} modification failed"
                        ))),
                    }
                }
            },
        )
        .await
    }

    pub async fn modify_tags(&self, resource_id: &str, options: ModifyTagsOptions) -> Result<()> {
        let reserved = [
            self.config.csi_volume_name_tag().to_string(),
            self.config.csi_volume_snapshot_name_tag().to_string(),
            self.config.cluster_tag(),
            self.config.iops_per_gb_tag(),
            self.config.allow_auto_iops_increase_tag(),
        ];
        if let Some(key) = options.tags_to_set.keys().find(|k| reserved.contains(k)) {
            return Err(DiskError::InvalidArgument(format!(
                "tag key {key} is reserved and cannot be set via ModifyTags"
            )));
        }
        if let Some(key) = options.tags_to_delete.iter().find(|k| reserved.contains(k)) {
            return Err(DiskError::InvalidArgument(format!(
                "tag key {key} is reserved and cannot be deleted via ModifyTags"
            )));
        }
        self.provider.modify_tags(resource_id, &options).await
    }

    // ---- Snapshot lifecycle (spec §4.F.5) ---------------------------------

    pub async fn create_snapshot(
        &self,
        volume_id: &str,
        snapshot_name: &str,
        caller_tags: HashMap<String, String>,
    ) -> Result<Snapshot> {
        validation::validate_volume_id(volume_id)?;
        let client_token = token::hash_token(&format!("{volume_id}:{snapshot_name}"));
        let description = format!("Created by {} for volume {volume_id}", self.config.tag_prefix);
        let tags = tags::build_create_snapshot_tags(snapshot_name, &caller_tags, &self.config);

        let retryer = self.retry_manager.retryer("create_snapshot").await;
        let provider = self.provider.clone();
        let vol = volume_id.to_string();
        let desc = Arc::new(description);
        let token = Arc::new(client_token);
        let tags = Arc::new(tags);
        retryer
            .execute_with_retry(|| {
                let provider = provider.clone();
                let vol = vol.clone();
                let desc = desc.clone();
                let token = token.clone();
                let tags = tags.clone();
                async move { provider.create_snapshot(&vol, &desc, &token, &tags).await }
            })
            .await
    }

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        validation::validate_snapshot_id(snapshot_id)?;
        let retryer = self.retry_manager.retryer("delete_snapshot").await;
        let provider = self.provider.clone();
        let id = snapshot_id.to_string();
        retryer
            .execute_with_retry(|| {
                let provider = provider.clone();
                let id = id.clone();
                async move { provider.delete_snapshot(&id).await }
            })
            .await
    }

    pub async fn get_snapshot_by_id(&self, snapshot_id: &str) -> Result<Snapshot> {
        validation::validate_snapshot_id(snapshot_id)?;
        let found = self
            .snapshot_by_id
            .get(snapshot_id.to_string())
            .await
            .map_err(|e| (*e).clone())?;
        found.ok_or_else(|| DiskError::NotFound(format!("snapshot {snapshot_id}")))
    }

    pub async fn get_snapshot_by_name(&self, snapshot_name: &str) -> Result<Snapshot> {
        let matches = self
            .snapshot_by_tag
            .get(snapshot_name.to_string())
            .await
            .map_err(|e| (*e).clone())?
            .unwrap_or_default();
        match matches.len() {
            0 => Err(DiskError::NotFound(format!("snapshot named {snapshot_name}"))),
            1 => Ok(matches.into_iter().next().expect("len checked")),
            _ => Err(DiskError::MultiSnapshots {
                tag_value: snapshot_name.to_string(),
            }),
        }
    }

    pub async fn list_snapshots(
        &self,
        max_results: i32,
        next_token: Option<&str>,
    ) -> Result<(Vec<Snapshot>, Option<String>)> {
        validation::validate_max_results(max_results)?;
        self.provider.list_snapshots(max_results, next_token).await
    }

    pub async fn enable_fast_snapshot_restores(
        &self,
        snapshot_id: &str,
        zones: &[String],
    ) -> Result<()> {
        validation::validate_snapshot_id(snapshot_id)?;
        let retryer = self.retry_manager.retryer("enable_fast_snapshot_restore").await;
        let provider = self.provider.clone();
        let id = snapshot_id.to_string();
        let zones = Arc::new(zones.to_vec());
        retryer
            .execute_with_retry(|| {
                let provider = provider.clone();
                let id = id.clone();
                let zones = zones.clone();
                async move { provider.enable_fast_snapshot_restores(&id, &zones).await }
            })
            .await
    }

    // ---- IsVolumeInitialized (spec §4.F.6) --------------------------------

    pub async fn is_volume_initialized(
        &self,
        volume_id: &str,
        cancel: &CancelToken,
    ) -> Result<VolumeInitialization> {
        validation::validate_volume_id(volume_id)?;
        let cached = self.volume_init_cache.get(&volume_id.to_string()).await;

        let detail = match cached.as_deref() {
            None => self.describe_status(volume_id, true).await?,
            Some(state) if state.initialized => return Ok(VolumeInitialization::Initialized),
            Some(state) => match state.earliest_next_poll_at {
                Some(eta) => {
                    let now = Instant::now();
                    if eta > now {
                        tokio::select! {
                            _ = tokio::time::sleep(eta - now) => {}
                            _ = cancel.cancelled() => return Err(DiskError::Cancelled),
                        }
                    }
                    self.describe_status(volume_id, true).await?
                }
                None => self.describe_status(volume_id, false).await?,
            },
        };

        let (initialized, eta_instant) = if !detail.initializing {
            (true, None)
        } else {
            match detail.estimated_seconds_remaining {
                Some(secs) => (false, Some(Instant::now() + Duration::from_secs(secs.max(60)))),
                None => (false, None),
            }
        };

        self.volume_init_cache
            .set(
                volume_id.to_string(),
                VolumeInitState {
                    initialized,
                    earliest_next_poll_at: eta_instant,
                },
            )
            .await;

        Ok(if initialized {
            VolumeInitialization::Initialized
        } else {
            VolumeInitialization::NotInitialized
        })
    }

    async fn describe_status(&self, volume_id: &str, fast: bool) -> Result<VolumeStatusDetail> {
        let batcher = if fast { &self.volume_status_fast } else { &self.volume_status_slow };
        batcher
            .get(volume_id.to_string())
            .await
            .map_err(|e| (*e).clone())?
            .ok_or_else(|| DiskError::NotFound(format!("volume {volume_id}")))
    }

    // ---- Misc upstream surface ---------------------------------------------

    pub async fn availability_zones(&self) -> Result<Vec<String>> {
        self.provider.availability_zones(&self.region).await
    }

    /// `DryRun()` (spec §4.E): issues a liveness probe only if the periodic
    /// ticker armed the flag, and clears it only on confirmed liveness.
    pub async fn dry_run(&self) -> Result<()> {
        if !self.dry_run_gate.should_probe() {
            return Ok(());
        }
        self.provider.dry_run_probe().await?;
        self.dry_run_gate.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::provider::{BlockDeviceMap, ProviderError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::SystemTime;

    fn test_disk(volume_id: &str) -> Disk {
        Disk {
            volume_id: volume_id.to_string(),
            capacity_gib: 1,
            volume_type: VolumeType::Gp3,
            availability_zone: "us-west-2a".to_string(),
            snapshot_id: None,
            source_volume_id: None,
            attachments: Vec::new(),
            multi_attach_enabled: false,
            state: VolumeLifecycleState::Available,
            tags: HashMap::new(),
            iops: None,
            throughput_mibps: None,
        }
    }

    fn test_options() -> DiskOptions {
        DiskOptions {
            capacity_gib: 1,
            volume_type: VolumeType::Gp3,
            availability_zone: Some("us-west-2a".to_string()),
            availability_zone_id: None,
            outpost_arn: None,
            iops: None,
            throughput_mibps: None,
            kms_key_id: None,
            encrypted: false,
            snapshot_id: None,
            source_volume_id: None,
            tags: HashMap::new(),
            client_token: String::new(),
            multi_attach_enabled: false,
            initialization_rate_mibps: None,
            allow_iops_per_gb_increase: false,
        }
    }

    /// A hand-written provider stub (not mockall) so each test can script
    /// exact sequences of responses and assert on exactly what was sent,
    /// without expectation-DSL overhead.
    #[derive(Default)]
    struct StubProvider {
        volumes: StdMutex<HashMap<String, Disk>>,
        create_calls: StdMutex<Vec<DiskOptions>>,
        create_script: StdMutex<Vec<Result<Disk>>>,
        create_from_source_calls: StdMutex<Vec<(String, DiskOptions)>>,
    }

    #[async_trait]
    impl Ec2DiskApi for StubProvider {
        async fn create_volume(&self, options: &DiskOptions) -> Result<Disk> {
            self.create_calls.lock().unwrap().push(options.clone());
            let mut script = self.create_script.lock().unwrap();
            if !script.is_empty() {
                return script.remove(0);
            }
            let disk = test_disk("vol-deadbeef");
            self.volumes.lock().unwrap().insert(disk.volume_id.clone(), disk.clone());
            Ok(disk)
        }

        async fn create_volume_from_source(&self, source_volume_id: &str, options: &DiskOptions) -> Result<Disk> {
            self.create_from_source_calls
                .lock()
                .unwrap()
                .push((source_volume_id.to_string(), options.clone()));
            self.create_volume(options).await
        }

        async fn delete_volume(&self, volume_id: &str) -> Result<()> {
            if self.volumes.lock().unwrap().remove(volume_id).is_none() {
                return Err(DiskError::NotFound(volume_id.to_string()));
            }
            Ok(())
        }

        async fn describe_volume(&self, volume_id: &str) -> Result<Disk> {
            self.volumes
                .lock()
                .unwrap()
                .get(volume_id)
                .cloned()
                .ok_or_else(|| DiskError::NotFound(volume_id.to_string()))
        }

        async fn describe_volumes_by_tag(&self, _k: &str, tag_value: &str) -> Result<Vec<Disk>> {
            Ok(self
                .volumes
                .lock()
                .unwrap()
                .values()
                .filter(|d| d.tags.get(CSI_VOLUME_NAME_TAG).map(String::as_str) == Some(tag_value))
                .cloned()
                .collect())
        }

        async fn attach_volume(&self, _v: &str, _i: &str, _d: &str) -> Result<()> {
            Ok(())
        }

        async fn attach_cluster_node_volume(&self, _v: &str, _n: &str, _d: &str) -> Result<()> {
            Ok(())
        }

        async fn detach_volume(&self, _v: &str, _i: &str, _d: &str) -> Result<()> {
            Ok(())
        }

        async fn detach_cluster_node_volume(&self, _v: &str, _n: &str, _d: &str) -> Result<()> {
            Ok(())
        }

        async fn modify_volume(&self, _v: &str, _o: &ModifyDiskOptions) -> Result<()> {
            Ok(())
        }

        async fn describe_volume_modification(
            &self,
            _volume_id: &str,
        ) -> Result<VolumeModificationState> {
            Ok(VolumeModificationState::NotBeingModified)
        }

        async fn modify_tags(&self, _r: &str, _o: &ModifyTagsOptions) -> Result<()> {
            Ok(())
        }

        async fn create_snapshot(
            &self,
            volume_id: &str,
            _d: &str,
            _t: &str,
            _tags: &HashMap<String, String>,
        ) -> Result<Snapshot> {
            Ok(Snapshot {
                snapshot_id: "snap-00000001".to_string(),
                source_volume_id: volume_id.to_string(),
                size_gib: 1,
                creation_time: SystemTime::now(),
                ready_to_use: true,
            })
        }

        async fn delete_snapshot(&self, _s: &str) -> Result<()> {
            Ok(())
        }

        async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
            Ok(Snapshot {
                snapshot_id: snapshot_id.to_string(),
                source_volume_id: "vol-deadbeef".to_string(),
                size_gib: 1,
                creation_time: SystemTime::now(),
                ready_to_use: true,
            })
        }

        async fn describe_snapshots_by_tag(&self, _k: &str, _v: &str) -> Result<Vec<Snapshot>> {
            Ok(Vec::new())
        }

        async fn list_snapshots(
            &self,
            _m: i32,
            _n: Option<&str>,
        ) -> Result<(Vec<Snapshot>, Option<String>)> {
            Ok((Vec::new(), None))
        }

        async fn enable_fast_snapshot_restores(&self, _s: &str, _z: &[String]) -> Result<()> {
            Ok(())
        }

        async fn describe_volume_status(&self, _volume_id: &str) -> Result<VolumeStatusDetail> {
            Ok(VolumeStatusDetail {
                initializing: false,
                estimated_seconds_remaining: None,
            })
        }

        async fn describe_instance_block_devices(&self, _instance_id: &str) -> Result<BlockDeviceMap> {
            Ok(HashMap::new())
        }

        async fn describe_instance_type(&self, _instance_id: &str) -> Result<String> {
            Ok("t3.medium".to_string())
        }

        async fn availability_zones(&self, _region: &str) -> Result<Vec<String>> {
            Ok(vec!["us-west-2a".to_string(), "us-west-2b".to_string()])
        }

        async fn probe_max_iops(&self, _t: VolumeType, _z: &str) -> Result<i64> {
            Err(DiskError::Internal("dry-run probe not scripted".to_string()))
        }

        async fn dry_run_probe(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_orchestrator(provider: StubProvider) -> CloudOrchestrator {
        CloudOrchestrator::new(
            Arc::new(provider),
            DriverConfig::default(),
            "us-west-2".to_string(),
            "123456789012".to_string(),
        )
    }

    #[tokio::test]
    async fn create_disk_returns_available_volume() {
        let orch = test_orchestrator(StubProvider::default());
        let disk = orch
            .create_disk("my-vol", test_options(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(disk.volume_id, "vol-deadbeef");
        assert_eq!(disk.capacity_gib, 1);
    }

    #[tokio::test]
    async fn create_disk_from_source_clones_via_provider() {
        let provider = Arc::new(StubProvider::default());
        let orch = CloudOrchestrator::new(
            provider.clone(),
            DriverConfig::default(),
            "us-west-2".to_string(),
            "123456789012".to_string(),
        );

        let mut options = test_options();
        options.volume_type = VolumeType::Io2;
        options.capacity_gib = 100;
        options.iops = Some(IopsLimits::Absolute(20_000));
        options.source_volume_id = Some("vol-src".to_string());

        orch.create_disk("cloned-vol", options, &CancelToken::new())
            .await
            .unwrap();

        let calls = provider.create_from_source_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "vol-src");
        assert_eq!(calls[0].1.iops, Some(IopsLimits::Absolute(20_000)));

        let plain_calls = provider.create_calls.lock().unwrap();
        assert!(plain_calls.is_empty());
    }

    #[tokio::test]
    async fn delete_missing_disk_returns_false_not_error() {
        let orch = test_orchestrator(StubProvider::default());
        let deleted = orch.delete_disk("vol-0123abcd").await.unwrap();
        assert!(!deleted);
    }

    #[tokio::test]
    async fn delete_attached_disk_is_refused() {
        let provider = StubProvider::default();
        let mut attached = test_disk("vol-deadbeef");
        attached.attachments.push(Attachment {
            instance_id: "i-0123abcd".to_string(),
            device: "/dev/xvdba".to_string(),
            state: AttachmentState::Attached,
            associated_resource: None,
        });
        provider.volumes.lock().unwrap().insert(attached.volume_id.clone(), attached);

        let orch = test_orchestrator(provider);
        let result = orch.delete_disk("vol-deadbeef").await;
        assert!(matches!(result, Err(DiskError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn modify_tags_rejects_reserved_keys_on_set() {
        let orch = test_orchestrator(StubProvider::default());
        let mut tags_to_set = HashMap::new();
        tags_to_set.insert("CSIVolumeName".to_string(), "sneaky".to_string());
        let result = orch
            .modify_tags(
                "vol-deadbeef",
                ModifyTagsOptions {
                    tags_to_set,
                    tags_to_delete: Vec::new(),
                },
            )
            .await;
        assert!(matches!(result, Err(DiskError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn modify_tags_rejects_reserved_keys_on_delete() {
        let orch = test_orchestrator(StubProvider::default());
        let result = orch
            .modify_tags(
                "vol-deadbeef",
                ModifyTagsOptions {
                    tags_to_set: HashMap::new(),
                    tags_to_delete: vec![orch.config.iops_per_gb_tag()],
                },
            )
            .await;
        assert!(matches!(result, Err(DiskError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn modify_tags_allows_unreserved_keys() {
        let orch = test_orchestrator(StubProvider::default());
        let mut tags_to_set = HashMap::new();
        tags_to_set.insert("team".to_string(), "platform".to_string());
        let result = orch
            .modify_tags(
                "vol-deadbeef",
                ModifyTagsOptions {
                    tags_to_set,
                    tags_to_delete: vec!["stale-label".to_string()],
                },
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn volume_limit_exceeded_adopts_the_single_matching_volume() {
        let provider = StubProvider::default();
        *provider.create_script.lock().unwrap() =
            vec![Err(DiskError::VolumeLimitExceeded)];
        let mut existing = test_disk("vol-facefeed");
        existing.tags.insert(CSI_VOLUME_NAME_TAG.to_string(), "limited-vol".to_string());
        provider.volumes.lock().unwrap().insert(existing.volume_id.clone(), existing);

        let orch = test_orchestrator(provider);
        let disk = orch
            .create_disk("limited-vol", test_options(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(disk.volume_id, "vol-facefeed");
    }

    #[tokio::test]
    async fn volume_limit_exceeded_with_no_match_surfaces_limit_exceeded() {
        let provider = StubProvider::default();
        *provider.create_script.lock().unwrap() = vec![Err(DiskError::VolumeLimitExceeded)];
        let orch = test_orchestrator(provider);
        let result = orch
            .create_disk("unmatched-vol", test_options(), &CancelToken::new())
            .await;
        assert!(matches!(result, Err(DiskError::LimitExceeded(_))));
    }

    #[tokio::test]
    async fn resize_with_matching_attributes_skips_modify_call() {
        let provider = StubProvider::default();
        let mut disk = test_disk("vol-deadbeef");
        disk.capacity_gib = 1;
        disk.volume_type = VolumeType::Gp3;
        disk.iops = Some(3000);
        provider.volumes.lock().unwrap().insert(disk.volume_id.clone(), disk);

        let orch = test_orchestrator(provider);
        let result = orch
            .resize_or_modify_disk(
                "vol-deadbeef",
                ModifyDiskOptions {
                    new_capacity_gib: Some(1),
                    new_volume_type: Some(VolumeType::Gp3),
                    new_iops: Some(IopsLimits::Absolute(3000)),
                    new_throughput_mibps: None,
                    allow_iops_increase_on_resize: false,
                },
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.capacity_gib, 1);
        assert_eq!(result.iops, Some(3000));
    }

    #[tokio::test]
    async fn get_disk_by_name_reports_multi_match() {
        let provider = StubProvider::default();
        for id in ["vol-aaaaaaaa", "vol-bbbbbbbb"] {
            let mut disk = test_disk(id);
            disk.tags.insert(CSI_VOLUME_NAME_TAG.to_string(), "dup-name".to_string());
            provider.volumes.lock().unwrap().insert(id.to_string(), disk);
        }
        let orch = test_orchestrator(provider);
        let result = orch.get_disk_by_name("dup-name", None).await;
        assert!(matches!(result, Err(DiskError::MultiDisks { .. })));
    }

    #[tokio::test]
    async fn get_disk_by_name_reports_diff_size() {
        let provider = StubProvider::default();
        let mut disk = test_disk("vol-cccccccc");
        disk.capacity_gib = 5;
        disk.tags.insert(CSI_VOLUME_NAME_TAG.to_string(), "sized-vol".to_string());
        provider.volumes.lock().unwrap().insert(disk.volume_id.clone(), disk);

        let orch = test_orchestrator(provider);
        let result = orch.get_disk_by_name("sized-vol", Some(10)).await;
        assert!(matches!(result, Err(DiskError::DiskExistsDiffSize { .. })));
    }

    #[test]
    fn cap_iops_zero_iff_requested_zero() {
        let limits = IopsLimitsTable {
            min_iops: 3000,
            max_iops: 16_000,
            max_iops_per_gb: 500.0,
        };
        assert_eq!(cap_iops(VolumeType::Gp3, 10, None, limits, false), 0);
        assert!(cap_iops(VolumeType::Gp3, 10, Some(IopsLimits::Absolute(5000)), limits, false) > 0);
    }

    #[test]
    fn cap_iops_respects_max_and_per_gb_ceiling() {
        let limits = IopsLimitsTable {
            min_iops: 100,
            max_iops: 64_000,
            max_iops_per_gb: 50.0,
        };
        let result = cap_iops(VolumeType::Io1, 10, Some(IopsLimits::Absolute(100_000)), limits, false);
        assert_eq!(result, 500); // capped by maxIopsPerGb * capacityGiB = 50*10
    }

    #[test]
    fn cap_iops_raises_to_min_only_when_allowed() {
        let limits = IopsLimitsTable {
            min_iops: 3000,
            max_iops: 16_000,
            max_iops_per_gb: 500.0,
        };
        let not_raised = cap_iops(VolumeType::Gp3, 100, Some(IopsLimits::Absolute(100)), limits, false);
        assert_eq!(not_raised, 100);
        let raised = cap_iops(VolumeType::Gp3, 100, Some(IopsLimits::Absolute(100)), limits, true);
        assert_eq!(raised, 3000);
    }

    #[test]
    fn instance_id_from_arn_reconstructs_trailing_segments() {
        let arn = "arn:aws:sagemaker:us-west-2:123456789012:cluster/clu-i-0abc123456789def0";
        assert_eq!(instance_id_from_arn(arn).as_deref(), Some("i-0abc123456789def0"));
    }

    fn provider_error(code: &str, message: &str) -> ProviderError {
        ProviderError {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn device_in_use_is_classified_distinctly_from_invalid_argument() {
        use crate::cloud::classify::classify;
        let in_use = classify(
            &provider_error("InvalidParameterValue", "Invalid value '/dev/xvdba': already in use"),
            None,
        );
        assert!(matches!(in_use, DiskError::DeviceInUse(_)));

        let other = classify(&provider_error("InvalidParameterValue", "bad value"), None);
        assert!(matches!(other, DiskError::InvalidArgument(_)));
    }
}
