//! CSI protocol messages transmitted over QUIC.
//!
//! [`CsiMessage`] is the envelope for every request and response exchanged
//! between a CSI client (the orchestrator side) and the driver via QUIC
//! bi-directional streams.

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope for CSI over QUIC.
///
/// Each QUIC bi-stream carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests: Identity ----------------------------------------------
    Probe,
    GetPluginInfo,
    GetPluginCapabilities,

    // ----- Requests: Controller --------------------------------------------
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(DeleteVolumeRequest),
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    ControllerGetCapabilities,
    ListVolumes,
    GetCapacity,
    ControllerPublishVolume {
        volume_id: VolumeId,
        node_id: String,
    },
    ControllerExpandVolume {
        volume_id: VolumeId,
        capacity_bytes: u64,
    },
    CreateSnapshot {
        source_volume_id: VolumeId,
        name: String,
    },
    DeleteSnapshot {
        snapshot_id: String,
    },
    ListSnapshots,

    // ----- Requests: Node --------------------------------------------------
    StageVolume(NodeStageVolumeRequest),
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    PublishVolume(NodePublishVolumeRequest),
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    NodeGetCapabilities,
    GetNodeInfo,
    NodeGetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    NodeExpandVolume {
        volume_id: VolumeId,
        volume_path: String,
        capacity_bytes: u64,
    },

    // ----- Responses -------------------------------------------------------
    VolumeCreated(Volume),
    VolumeList(Vec<Volume>),
    Capacity(u64),
    CapabilityValidation(CapabilityValidation),
    ControllerCapabilities(Vec<ControllerCapability>),
    NodeCapabilities(Vec<NodeCapability>),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    NodeInfoResponse(NodeInfo),
    SnapshotCreated(String),
    SnapshotList(Vec<String>),
    /// New size in bytes after an expansion.
    VolumeExpanded(u64),
    /// Bytes used by a volume.
    VolumeStats(u64),

    /// Generic success acknowledgement (no payload).
    Ok,
    ProbeResult(bool),
    Error(CsiError),
}

impl CsiMessage {
    /// Whether this variant is a request a server should dispatch.
    pub fn is_request(&self) -> bool {
        !matches!(
            self,
            Self::VolumeCreated(_)
                | Self::VolumeList(_)
                | Self::Capacity(_)
                | Self::CapabilityValidation(_)
                | Self::ControllerCapabilities(_)
                | Self::NodeCapabilities(_)
                | Self::PluginInfoResponse(_)
                | Self::PluginCapabilitiesResponse(_)
                | Self::NodeInfoResponse(_)
                | Self::SnapshotCreated(_)
                | Self::SnapshotList(_)
                | Self::VolumeExpanded(_)
                | Self::VolumeStats(_)
                | Self::Ok
                | Self::ProbeResult(_)
                | Self::Error(_)
        )
    }
}

// Secrets never appear in the rendered form; requests show their target only.
impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(req) => write!(f, "DeleteVolume({})", req.volume_id),
            Self::ValidateVolumeCapabilities(req) => {
                write!(f, "ValidateVolumeCapabilities({})", req.volume_id)
            }
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::ListVolumes => f.write_str("ListVolumes"),
            Self::GetCapacity => f.write_str("GetCapacity"),
            Self::ControllerPublishVolume { volume_id, node_id } => {
                write!(f, "ControllerPublishVolume({volume_id}, node={node_id})")
            }
            Self::ControllerExpandVolume { volume_id, .. } => {
                write!(f, "ControllerExpandVolume({volume_id})")
            }
            Self::CreateSnapshot { name, .. } => write!(f, "CreateSnapshot(name={name})"),
            Self::DeleteSnapshot { snapshot_id } => write!(f, "DeleteSnapshot({snapshot_id})"),
            Self::ListSnapshots => f.write_str("ListSnapshots"),
            Self::StageVolume(req) => write!(f, "StageVolume({})", req.volume_id),
            Self::UnstageVolume { volume_id, .. } => write!(f, "UnstageVolume({volume_id})"),
            Self::PublishVolume(req) => write!(f, "PublishVolume({})", req.volume_id),
            Self::UnpublishVolume { volume_id, .. } => write!(f, "UnpublishVolume({volume_id})"),
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::GetNodeInfo => f.write_str("GetNodeInfo"),
            Self::NodeGetVolumeStats { volume_id, .. } => {
                write!(f, "NodeGetVolumeStats({volume_id})")
            }
            Self::NodeExpandVolume { volume_id, .. } => write!(f, "NodeExpandVolume({volume_id})"),
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::VolumeList(vs) => write!(f, "VolumeList(count={})", vs.len()),
            Self::Capacity(c) => write!(f, "Capacity({c})"),
            Self::CapabilityValidation(CapabilityValidation::Confirmed(caps)) => {
                write!(f, "CapabilityValidation(confirmed={})", caps.len())
            }
            Self::CapabilityValidation(CapabilityValidation::Rejected(reason)) => {
                write!(f, "CapabilityValidation(rejected: {reason})")
            }
            Self::ControllerCapabilities(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::NodeCapabilities(caps) => write!(f, "NodeCapabilities(count={})", caps.len()),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::SnapshotCreated(id) => write!(f, "SnapshotCreated({id})"),
            Self::SnapshotList(ids) => write!(f, "SnapshotList(count={})", ids.len()),
            Self::VolumeExpanded(size) => write!(f, "VolumeExpanded({size})"),
            Self::VolumeStats(used) => write!(f, "VolumeStats(used={used})"),
            Self::Ok => f.write_str("Ok"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}
