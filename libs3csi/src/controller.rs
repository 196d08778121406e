//! CSI Controller service trait.
//!
//! The Controller service owns the central volume lifecycle: a volume is a
//! bucket, or a prefix inside a shared bucket, on the object store named by
//! the request secrets.
//!
//! Snapshot, listing, capacity, expansion and attach RPCs are part of the
//! trait so the transport can route them, but the default implementations
//! answer [`CsiError::Unsupported`].

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    CapabilityValidation, ControllerCapability, CreateVolumeRequest, DeleteVolumeRequest, Volume,
    ValidateVolumeCapabilitiesRequest, VolumeId,
};

/// Controller service - centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a volume.
    ///
    /// The returned [`Volume`] carries the `volume_id` and the
    /// `volume_context` that must be forwarded to later Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Remove a volume and everything stored under it.  Deleting a volume
    /// whose bucket no longer exists succeeds.
    async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), CsiError>;

    /// Confirm the requested capabilities, or explain why they are rejected.
    async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<CapabilityValidation, CsiError>;

    /// Controller RPCs this plugin implements.
    async fn get_controller_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        Err(CsiError::unsupported("ListVolumes"))
    }

    async fn get_capacity(&self) -> Result<u64, CsiError> {
        Err(CsiError::unsupported("GetCapacity"))
    }

    async fn controller_publish_volume(
        &self,
        _volume_id: &VolumeId,
        _node_id: &str,
    ) -> Result<(), CsiError> {
        Err(CsiError::unsupported("ControllerPublishVolume"))
    }

    async fn controller_expand_volume(
        &self,
        _volume_id: &VolumeId,
        _capacity_bytes: u64,
    ) -> Result<u64, CsiError> {
        Err(CsiError::unsupported("ControllerExpandVolume"))
    }

    async fn create_snapshot(
        &self,
        _source_volume_id: &VolumeId,
        _name: &str,
    ) -> Result<String, CsiError> {
        Err(CsiError::unsupported("CreateSnapshot"))
    }

    async fn delete_snapshot(&self, _snapshot_id: &str) -> Result<(), CsiError> {
        Err(CsiError::unsupported("DeleteSnapshot"))
    }

    async fn list_snapshots(&self) -> Result<Vec<String>, CsiError> {
        Err(CsiError::unsupported("ListSnapshots"))
    }
}
