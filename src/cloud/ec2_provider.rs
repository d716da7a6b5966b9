//! Production [`Ec2DiskApi`] adapter over `aws_sdk_ec2::Client`.
//!
//! This is the only module in the crate allowed to name an `aws_sdk_ec2`
//! type. Every method here does exactly three things: build the SDK
//! request, send it, and translate the SDK's output or error into this
//! crate's own [`Disk`]/[`Snapshot`]/[`ProviderError`] shapes. None of the
//! orchestration logic (retries, polling, batching) lives here; that's all
//! upstream of this trait boundary.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{
    Filter, ResourceType, Tag, TagSpecification, VolumeAttachmentState,
    VolumeModificationState as SdkVolumeModificationState, VolumeState,
};
use aws_sdk_ec2::Client;
use async_trait::async_trait;

use crate::cloud::provider::{
    BlockDeviceMap, Ec2DiskApi, VolumeModificationState, VolumeStatusDetail,
};
use crate::cloud::types::{
    Attachment, AttachmentState, Disk, DiskOptions, IopsLimits, ModifyDiskOptions,
    ModifyTagsOptions, Snapshot, VolumeLifecycleState, VolumeType,
};
use crate::error::{DiskError, Result};

/// Adapts `aws_sdk_ec2::Client` to [`Ec2DiskApi`].
pub struct Ec2Provider {
    client: Client,
}

impl Ec2Provider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a provider from the node's ambient AWS credentials (IMDS role,
    /// env vars, or profile), the way `runctl`'s `docker::push_to_ecr` loads
    /// an `SdkConfig` before constructing its ECR client.
    pub async fn from_env(region: &str) -> Self {
        let sdk_config = aws_config::from_env()
            .region(aws_sdk_ec2::config::Region::new(region.to_string()))
            .load()
            .await;
        Self::new(Client::new(&sdk_config))
    }

    /// Poll `describe_snapshot` until the clone source snapshot reaches
    /// `completed`, since `CreateVolume` needs a ready snapshot id, not a
    /// pending one. Uses the same backoff shape as the orchestrator's
    /// creation poll; a fresh, never-cancelled token since this call has no
    /// caller-supplied cancellation point of its own.
    async fn await_snapshot_ready(&self, snapshot_id: &str) -> Result<Snapshot> {
        let cancel = crate::cancel::CancelToken::new();
        crate::backoff::poll_with_backoff(
            &crate::backoff::Backoff::creation(),
            None,
            &cancel,
            "snapshot ready for clone",
            snapshot_id,
            |_step| async move {
                let snapshot = self.describe_snapshot(snapshot_id).await?;
                if snapshot.ready_to_use {
                    Ok(crate::backoff::PollOutcome::Done(snapshot))
                } else {
                    Ok(crate::backoff::PollOutcome::Retry)
                }
            },
        )
        .await
    }

    /// Turn any SDK error into this crate's [`crate::cloud::provider::ProviderError`]
    /// and classify it immediately, since every call site needs a
    /// [`DiskError`] and classification is pure.
    fn classify_err<E>(err: aws_sdk_ec2::error::SdkError<E>, context: Option<&str>) -> DiskError
    where
        E: ProvideErrorMetadata,
    {
        let (code, message) = match &err {
            aws_sdk_ec2::error::SdkError::ServiceError(service_err) => {
                let e = service_err.err();
                (
                    e.code().unwrap_or("Unknown").to_string(),
                    e.message().unwrap_or_default().to_string(),
                )
            }
            other => ("Unknown".to_string(), other.to_string()),
        };
        let provider_err = crate::cloud::provider::ProviderError { code, message };
        crate::cloud::classify::classify(&provider_err, context)
    }

    fn tag_specifications(resource_type: ResourceType, tags: &HashMap<String, String>) -> Vec<TagSpecification> {
        if tags.is_empty() {
            return Vec::new();
        }
        let tag_list: Vec<Tag> = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect();
        vec![TagSpecification::builder()
            .resource_type(resource_type)
            .set_tags(Some(tag_list))
            .build()]
    }

    fn to_disk(v: &aws_sdk_ec2::types::Volume) -> Result<Disk> {
        let volume_id = v
            .volume_id()
            .ok_or_else(|| DiskError::Internal("volume missing id".to_string()))?
            .to_string();
        let volume_type = v
            .volume_type()
            .and_then(|t| t.as_str().parse::<VolumeType>().ok())
            .unwrap_or(VolumeType::Gp3);
        let state = match v.state() {
            Some(VolumeState::Available) => VolumeLifecycleState::Available,
            Some(VolumeState::Creating) => VolumeLifecycleState::Creating,
            Some(VolumeState::Deleting) => VolumeLifecycleState::Deleting,
            Some(VolumeState::Deleted) => VolumeLifecycleState::Deleted,
            _ => VolumeLifecycleState::Error,
        };
        let attachments = v
            .attachments()
            .iter()
            .map(|a| Attachment {
                instance_id: a.instance_id().unwrap_or_default().to_string(),
                device: a.device().unwrap_or_default().to_string(),
                state: match a.state() {
                    Some(VolumeAttachmentState::Attaching) => AttachmentState::Attaching,
                    Some(VolumeAttachmentState::Attached) => AttachmentState::Attached,
                    Some(VolumeAttachmentState::Detaching) => AttachmentState::Detaching,
                    _ => AttachmentState::Detached,
                },
                associated_resource: a.associated_resource().map(str::to_string),
            })
            .collect();
        let tags = v
            .tags()
            .iter()
            .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
            .collect();
        Ok(Disk {
            volume_id,
            capacity_gib: v.size().unwrap_or_default() as i64,
            volume_type,
            availability_zone: v.availability_zone().unwrap_or_default().to_string(),
            snapshot_id: v.snapshot_id().filter(|s| !s.is_empty()).map(str::to_string),
            source_volume_id: None,
            attachments,
            multi_attach_enabled: v.multi_attach_enabled().unwrap_or_default(),
            state,
            tags,
            iops: v.iops().map(|i| i as i64),
            throughput_mibps: v.throughput().map(|t| t as i64),
        })
    }

    fn to_snapshot(s: &aws_sdk_ec2::types::Snapshot) -> Result<Snapshot> {
        let snapshot_id = s
            .snapshot_id()
            .ok_or_else(|| DiskError::Internal("snapshot missing id".to_string()))?
            .to_string();
        let creation_time = s
            .start_time()
            .and_then(|t| u64::try_from(t.secs()).ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap_or_else(SystemTime::now);
        Ok(Snapshot {
            snapshot_id,
            source_volume_id: s.volume_id().unwrap_or_default().to_string(),
            size_gib: s.volume_size().unwrap_or_default() as i64,
            creation_time,
            ready_to_use: matches!(
                s.state(),
                Some(aws_sdk_ec2::types::SnapshotState::Completed)
            ),
        })
    }
}

#[async_trait]
impl Ec2DiskApi for Ec2Provider {
    async fn create_volume(&self, options: &DiskOptions) -> Result<Disk> {
        let mut req = self
            .client
            .create_volume()
            .size(options.capacity_gib as i32)
            .volume_type(options.volume_type.as_str().into())
            .encrypted(options.encrypted)
            .client_token(&options.client_token)
            .multi_attach_enabled(options.multi_attach_enabled)
            .set_tag_specifications(Some(Self::tag_specifications(
                ResourceType::Volume,
                &options.tags,
            )));
        if let Some(zone) = &options.availability_zone {
            req = req.availability_zone(zone);
        }
        if let Some(zone_id) = &options.availability_zone_id {
            req = req.availability_zone_id(zone_id);
        }
        if let Some(arn) = &options.outpost_arn {
            req = req.outpost_arn(arn);
        }
        if let Some(kms) = &options.kms_key_id {
            req = req.kms_key_id(kms);
        }
        if let Some(snapshot_id) = &options.snapshot_id {
            req = req.snapshot_id(snapshot_id);
        }
        if let Some(throughput) = options.throughput_mibps {
            req = req.throughput(throughput as i32);
        }
        match options.iops {
            Some(IopsLimits::Absolute(iops)) => req = req.iops(iops as i32),
            _ => {}
        }
        let out = req
            .send()
            .await
            .map_err(|e| Self::classify_err(e, None))?;
        let volume_id = out
            .volume_id()
            .ok_or_else(|| DiskError::Internal("create_volume response missing volume id".to_string()))?;
        self.describe_volume(volume_id).await
    }

    async fn create_volume_from_source(
        &self,
        source_volume_id: &str,
        options: &DiskOptions,
    ) -> Result<Disk> {
        // EC2 has no dedicated "clone volume" API: clone via
        // snapshot-then-restore. Snapshot the source, wait for it to reach
        // `completed`, then create the new volume from that snapshot.
        let description = format!("Clone source for {source_volume_id}");
        let snapshot = self
            .create_snapshot(source_volume_id, &description, &options.client_token, &HashMap::new())
            .await?;
        let snapshot = self.await_snapshot_ready(&snapshot.snapshot_id).await?;

        let mut clone_options = options.clone();
        clone_options.snapshot_id = Some(snapshot.snapshot_id);
        self.create_volume(&clone_options).await
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        self.client
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Self::classify_err(e, Some(volume_id)))
    }

    async fn describe_volume(&self, volume_id: &str) -> Result<Disk> {
        let out = self
            .client
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(|e| Self::classify_err(e, Some(volume_id)))?;
        let volume = out
            .volumes()
            .first()
            .ok_or_else(|| DiskError::NotFound(volume_id.to_string()))?;
        Self::to_disk(volume)
    }

    async fn describe_volumes_by_tag(&self, tag_key: &str, tag_value: &str) -> Result<Vec<Disk>> {
        let out = self
            .client
            .describe_volumes()
            .filters(
                Filter::builder()
                    .name(format!("tag:{tag_key}"))
                    .values(tag_value)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Self::classify_err(e, None))?;
        out.volumes().iter().map(Self::to_disk).collect()
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        self.client
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Self::classify_err(e, Some(volume_id)))
    }

    async fn attach_cluster_node_volume(
        &self,
        volume_id: &str,
        node_id: &str,
        device: &str,
    ) -> Result<()> {
        // Managed-cluster-node attachment goes through the same API with
        // the node's ARN in place of an instance id.
        self.attach_volume(volume_id, node_id, device).await
    }

    async fn detach_volume(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        self.client
            .detach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Self::classify_err(e, Some(volume_id)))
    }

    async fn detach_cluster_node_volume(
        &self,
        volume_id: &str,
        node_id: &str,
        device: &str,
    ) -> Result<()> {
        self.detach_volume(volume_id, node_id, device).await
    }

    async fn modify_volume(&self, volume_id: &str, options: &ModifyDiskOptions) -> Result<()> {
        let mut req = self.client.modify_volume().volume_id(volume_id);
        if let Some(size) = options.new_capacity_gib {
            req = req.size(size as i32);
        }
        if let Some(vt) = options.new_volume_type {
            req = req.volume_type(vt.as_str().into());
        }
        if let Some(throughput) = options.new_throughput_mibps {
            req = req.throughput(throughput as i32);
        }
        match options.new_iops {
            Some(IopsLimits::Absolute(iops)) => req = req.iops(iops as i32),
            _ => {}
        }
        req.send()
            .await
            .map(|_| ())
            .map_err(|e| Self::classify_err(e, Some(volume_id)))
    }

    async fn describe_volume_modification(
        &self,
        volume_id: &str,
    ) -> Result<VolumeModificationState> {
        let out = self
            .client
            .describe_volumes_modifications()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(|e| Self::classify_err(e, Some(volume_id)))?;
        let Some(modification) = out.volumes_modifications().first() else {
            return Ok(VolumeModificationState::NotBeingModified);
        };
        Ok(match modification.modification_state() {
            Some(SdkVolumeModificationState::Modifying) => VolumeModificationState::Modifying,
            Some(SdkVolumeModificationState::Optimizing) => VolumeModificationState::Optimizing,
            Some(SdkVolumeModificationState::Completed) => VolumeModificationState::Completed,
            Some(SdkVolumeModificationState::Failed) => VolumeModificationState::Failed,
            _ => VolumeModificationState::NotBeingModified,
        })
    }

    async fn modify_tags(&self, resource_id: &str, options: &ModifyTagsOptions) -> Result<()> {
        if !options.tags_to_set.is_empty() {
            let tag_list: Vec<Tag> = options
                .tags_to_set
                .iter()
                .map(|(k, v)| Tag::builder().key(k).value(v).build())
                .collect();
            self.client
                .create_tags()
                .resources(resource_id)
                .set_tags(Some(tag_list))
                .send()
                .await
                .map_err(|e| Self::classify_err(e, Some(resource_id)))?;
        }
        if !options.tags_to_delete.is_empty() {
            let tag_list: Vec<Tag> = options
                .tags_to_delete
                .iter()
                .map(|k| Tag::builder().key(k).build())
                .collect();
            self.client
                .delete_tags()
                .resources(resource_id)
                .set_tags(Some(tag_list))
                .send()
                .await
                .map_err(|e| Self::classify_err(e, Some(resource_id)))?;
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        volume_id: &str,
        description: &str,
        client_token: &str,
        tags: &HashMap<String, String>,
    ) -> Result<Snapshot> {
        let out = self
            .client
            .create_snapshot()
            .volume_id(volume_id)
            .description(description)
            .set_tag_specifications(Some(Self::tag_specifications(
                ResourceType::Snapshot,
                tags,
            )))
            .send()
            .await
            .map_err(|e| Self::classify_err(e, Some(volume_id)))?;
        let _ = client_token; // EC2's CreateSnapshot has no client-token parameter; idempotency is enforced by the orchestrator's tag-based lookup on mismatch.
        let snapshot_id = out
            .snapshot_id()
            .ok_or_else(|| DiskError::Internal("snapshot missing id".to_string()))?;
        self.describe_snapshot(snapshot_id).await
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        self.client
            .delete_snapshot()
            .snapshot_id(snapshot_id)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Self::classify_err(e, Some(snapshot_id)))
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let out = self
            .client
            .describe_snapshots()
            .snapshot_ids(snapshot_id)
            .send()
            .await
            .map_err(|e| Self::classify_err(e, Some(snapshot_id)))?;
        let snapshot = out
            .snapshots()
            .first()
            .ok_or_else(|| DiskError::NotFound(snapshot_id.to_string()))?;
        Self::to_snapshot(snapshot)
    }

    async fn describe_snapshots_by_tag(
        &self,
        tag_key: &str,
        tag_value: &str,
    ) -> Result<Vec<Snapshot>> {
        let out = self
            .client
            .describe_snapshots()
            .filters(
                Filter::builder()
                    .name(format!("tag:{tag_key}"))
                    .values(tag_value)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Self::classify_err(e, None))?;
        out.snapshots().iter().map(Self::to_snapshot).collect()
    }

    async fn list_snapshots(
        &self,
        max_results: i32,
        next_token: Option<&str>,
    ) -> Result<(Vec<Snapshot>, Option<String>)> {
        let mut req = self.client.describe_snapshots().owner_ids("self");
        if max_results > 0 {
            req = req.max_results(max_results);
        }
        if let Some(token) = next_token {
            req = req.next_token(token);
        }
        let out = req.send().await.map_err(|e| Self::classify_err(e, None))?;
        let snapshots = out
            .snapshots()
            .iter()
            .map(Self::to_snapshot)
            .collect::<Result<Vec<_>>>()?;
        Ok((snapshots, out.next_token().map(str::to_string)))
    }

    async fn enable_fast_snapshot_restores(
        &self,
        snapshot_id: &str,
        availability_zones: &[String],
    ) -> Result<()> {
        self.client
            .enable_fast_snapshot_restores()
            .source_snapshot_ids(snapshot_id)
            .set_availability_zones(Some(availability_zones.to_vec()))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| Self::classify_err(e, Some(snapshot_id)))
    }

    async fn describe_volume_status(&self, volume_id: &str) -> Result<VolumeStatusDetail> {
        let out = self
            .client
            .describe_volume_status()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(|e| Self::classify_err(e, Some(volume_id)))?;
        let Some(status) = out.volume_statuses().first() else {
            return Ok(VolumeStatusDetail {
                initializing: false,
                estimated_seconds_remaining: None,
            });
        };
        let initializing = status
            .events()
            .iter()
            .any(|e| e.event_type().unwrap_or_default().contains("InitializationState"));
        Ok(VolumeStatusDetail {
            initializing,
            estimated_seconds_remaining: None,
        })
    }

    async fn describe_instance_block_devices(&self, instance_id: &str) -> Result<BlockDeviceMap> {
        let out = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| Self::classify_err(e, None))?;
        let mut map = HashMap::new();
        for reservation in out.reservations() {
            for instance in reservation.instances() {
                for mapping in instance.block_device_mappings() {
                    if let (Some(device), Some(ebs)) = (mapping.device_name(), mapping.ebs()) {
                        if let Some(volume_id) = ebs.volume_id() {
                            map.insert(device.to_string(), volume_id.to_string());
                        }
                    }
                }
            }
        }
        Ok(map)
    }

    async fn describe_instance_type(&self, instance_id: &str) -> Result<String> {
        let out = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(|e| Self::classify_err(e, None))?;
        let instance_type = out
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
            .and_then(|i| i.instance_type())
            .map(|t| t.as_str().to_string())
            .unwrap_or_default();
        Ok(instance_type)
    }

    async fn availability_zones(&self, region: &str) -> Result<Vec<String>> {
        let out = self
            .client
            .describe_availability_zones()
            .filters(Filter::builder().name("region-name").values(region).build())
            .send()
            .await
            .map_err(|e| Self::classify_err(e, None))?;
        Ok(out
            .availability_zones()
            .iter()
            .filter_map(|z| z.zone_name().map(str::to_string))
            .collect())
    }

    async fn probe_max_iops(
        &self,
        volume_type: VolumeType,
        zone: &str,
    ) -> Result<i64> {
        let result = self
            .client
            .create_volume()
            .dry_run(true)
            .size(1)
            .volume_type(volume_type.as_str().into())
            .availability_zone(zone)
            .iops(i32::MAX)
            .send()
            .await;
        match result {
            Ok(_) => Ok(0),
            Err(e) => match Self::classify_err(e, None) {
                DiskError::LimitExceeded(msg) => {
                    Ok(crate::cloud::classify::parse_iops_limit_from_dry_run(&msg).unwrap_or(0))
                }
                other => Err(other),
            },
        }
    }

    async fn dry_run_probe(&self) -> Result<()> {
        let result = self
            .client
            .describe_volumes()
            .dry_run(true)
            .send()
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if let aws_sdk_ec2::error::SdkError::ServiceError(service_err) = &e {
                    if service_err.err().code() == Some(crate::cloud::provider::DRY_RUN_OPERATION) {
                        return Ok(());
                    }
                }
                Err(Self::classify_err(e, None))
            }
        }
    }
}
