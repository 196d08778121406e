//! [`S3Driver`]: the CSI Identity, Controller and Node services over an
//! S3-compatible object store.
//!
//! Every request is checked for required fields first.  Only then is the
//! per-volume lock taken, so malformed requests never contend with real
//! ones and never reach the store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::config::{DriverOptions, StoreConfig};
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::lock::{VolumeLockGuard, VolumeLocks};
use crate::mount::{HostMounts, MountOrchestrator, bind_flags};
use crate::node::CsiNode;
use crate::store::{StoreClient, StoreConnector};
use crate::types::*;

/// StorageClass parameter naming a shared bucket; volumes become prefixes.
pub const PARAM_BUCKET: &str = "bucket";
pub const PARAM_MOUNTER: &str = "mounter";
pub const PARAM_OPTIONS: &str = "options";

pub struct S3Driver {
    options: DriverOptions,
    locks: Arc<VolumeLocks>,
    store: Arc<dyn StoreConnector>,
    mounts: MountOrchestrator,
}

impl S3Driver {
    pub fn new(
        options: DriverOptions,
        store: Arc<dyn StoreConnector>,
        mounts: Arc<dyn HostMounts>,
    ) -> Self {
        let orchestrator = MountOrchestrator::new(mounts, options.default_mounter.clone())
            .with_mount_permissions(options.mount_permissions);
        Self {
            options,
            locks: Arc::new(VolumeLocks::new()),
            store,
            mounts: orchestrator,
        }
    }

    /// Share a lock registry with other holders.
    pub fn with_locks(mut self, locks: Arc<VolumeLocks>) -> Self {
        self.locks = locks;
        self
    }

    fn lock(&self, volume_id: &str) -> Result<VolumeLockGuard, CsiError> {
        self.locks.try_lock(volume_id).ok_or_else(|| {
            CsiError::Aborted(format!(
                "an operation for volume {volume_id} is already in progress"
            ))
        })
    }

    fn connect(&self, config: &StoreConfig) -> Result<StoreClient, CsiError> {
        self.store.connect(config)
    }
}

fn require(present: bool, what: &str) -> Result<(), CsiError> {
    if present {
        Ok(())
    } else {
        Err(CsiError::InvalidArgument(format!("{what} missing in request")))
    }
}

/// Volume context handed back by `CreateVolume` and replayed on the node.
fn volume_context(
    parameters: &HashMap<String, String>,
    capacity_bytes: u64,
) -> HashMap<String, String> {
    let mut context = HashMap::new();
    for (param, key) in [(PARAM_MOUNTER, CONTEXT_MOUNTER), (PARAM_OPTIONS, CONTEXT_OPTIONS)] {
        if let Some(value) = parameters.get(param).filter(|v| !v.is_empty()) {
            context.insert(key.to_owned(), value.clone());
        }
    }
    context.insert(CONTEXT_CAPACITY.to_owned(), capacity_bytes.to_string());
    context
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for S3Driver {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: self.options.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for S3Driver {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        require(!req.name.is_empty(), "volume name")?;
        require(!req.volume_capabilities.is_empty(), "volume capabilities")?;

        let (bucket, prefix) = match req.parameters.get(PARAM_BUCKET).filter(|b| !b.is_empty()) {
            Some(shared) => (shared.clone(), req.name.clone()),
            None => (req.name.clone(), String::new()),
        };
        let volume_id = VolumeId::encode(&bucket, &prefix);
        let config = StoreConfig::from_secrets(&req.secrets)?;

        let _guard = self.lock(volume_id.as_str())?;
        let client = self.connect(&config)?;

        if client.bucket_exists(&bucket).await? {
            debug!(%bucket, "bucket already exists");
        } else {
            client.create_bucket(&bucket).await?;
        }
        if !prefix.is_empty() {
            client.create_prefix(&bucket, &prefix).await?;
        }

        info!(%volume_id, capacity_bytes = req.capacity_bytes, "volume created");
        Ok(Volume {
            volume_context: volume_context(&req.parameters, req.capacity_bytes),
            volume_id,
            capacity_bytes: req.capacity_bytes,
        })
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError> {
        require(!req.volume_id.is_empty(), "volume id")?;
        let config = StoreConfig::from_secrets(&req.secrets)?;

        let _guard = self.lock(req.volume_id.as_str())?;
        let client = self.connect(&config)?;
        let (bucket, prefix) = req.volume_id.decode();

        if !client.bucket_exists(bucket).await? {
            info!(%bucket, "bucket does not exist, volume already deleted");
            return Ok(());
        }
        if prefix.is_empty() {
            client.delete_bucket(bucket).await?;
        } else {
            client.delete_prefix(bucket, prefix).await?;
        }

        info!("volume deleted");
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<CapabilityValidation, CsiError> {
        require(!req.volume_id.is_empty(), "volume id")?;
        require(!req.volume_capabilities.is_empty(), "volume capabilities")?;
        let config = StoreConfig::from_secrets(&req.secrets)?;

        let _guard = self.lock(req.volume_id.as_str())?;
        let (bucket, _) = req.volume_id.decode();
        if !self.connect(&config)?.bucket_exists(bucket).await? {
            return Err(CsiError::NotFound(format!("volume {}", req.volume_id)));
        }

        let single_writer = req
            .volume_capabilities
            .iter()
            .all(|cap| cap.access_mode == AccessMode::ReadWriteOnce);
        if single_writer {
            Ok(CapabilityValidation::Confirmed(req.volume_capabilities))
        } else {
            Ok(CapabilityValidation::Rejected(
                "only single node writer is supported".into(),
            ))
        }
    }

    async fn get_controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![ControllerCapability::CreateDeleteVolume])
    }
}

// ---------------------------------------------------------------------------
// CsiNode
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiNode for S3Driver {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require(!req.volume_id.is_empty(), "volume id")?;
        require(!req.staging_target_path.is_empty(), "staging target path")?;
        require(req.volume_capability.is_some(), "volume capability")?;
        let config = StoreConfig::from_secrets(&req.secrets)?;

        let _guard = self.lock(req.volume_id.as_str())?;
        let meta = VolumeMetadata::from_context(&req.volume_id, &req.volume_context);
        self.mounts
            .stage(
                &req.volume_id,
                Path::new(&req.staging_target_path),
                &meta,
                &config,
            )
            .await
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require(!volume_id.is_empty(), "volume id")?;
        require(!staging_target_path.is_empty(), "staging target path")?;

        let _guard = self.lock(volume_id.as_str())?;
        self.mounts
            .unstage(volume_id, Path::new(staging_target_path))
            .await
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require(!req.volume_id.is_empty(), "volume id")?;
        require(!req.staging_target_path.is_empty(), "staging target path")?;
        require(!req.target_path.is_empty(), "target path")?;
        let Some(capability) = &req.volume_capability else {
            return Err(CsiError::InvalidArgument(
                "volume capability missing in request".into(),
            ));
        };
        let flags = bind_flags(req.read_only, &capability.mount_flags)?;

        let _guard = self.lock(req.volume_id.as_str())?;
        let meta = VolumeMetadata::from_context(&req.volume_id, &req.volume_context);
        self.mounts
            .publish(
                &req.volume_id,
                Path::new(&req.staging_target_path),
                Path::new(&req.target_path),
                flags,
                &meta,
                &req.secrets,
            )
            .await
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require(!volume_id.is_empty(), "volume id")?;
        require(!target_path.is_empty(), "target path")?;

        let _guard = self.lock(volume_id.as_str())?;
        self.mounts.unpublish(volume_id, Path::new(target_path)).await
    }

    async fn get_node_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![NodeCapability::StageUnstageVolume])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        Ok(NodeInfo {
            node_id: self.options.node_id.clone(),
            max_volumes: 0,
        })
    }
}
