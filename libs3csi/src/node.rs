//! CSI Node service trait.
//!
//! The Node service runs on each worker node and makes a volume available
//! to workload containers:
//!
//! 1. **Stage** - FUSE-mount the bucket (or prefix) at a global path.
//! 2. **Publish** - bind-mount the global path into the workload.
//! 3. **Unpublish** - remove the bind mount.
//! 4. **Unstage** - unmount the FUSE mount.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
};

/// Node service - local mount / unmount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at its global staging path.
    ///
    /// Idempotent: an already-staged, healthy volume is left as it is.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unmount the staging path.  Idempotent.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Bind-mount the staged volume into the workload's target path,
    /// re-staging first if the staging mount has died.  Idempotent.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Remove the bind mount from the target path.  Idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Node RPCs this plugin implements.
    async fn get_node_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    async fn get_volume_stats(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
    ) -> Result<u64, CsiError> {
        Err(CsiError::unsupported("NodeGetVolumeStats"))
    }

    async fn expand_volume(
        &self,
        _volume_id: &VolumeId,
        _volume_path: &str,
        _capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        Err(CsiError::unsupported("NodeExpandVolume"))
    }
}
