//! Core CSI types: volume identifiers, capabilities, requests, and metadata.
//!
//! These types form the data model shared by the CSI traits, transport layer,
//! and the S3 driver.  They are all [`Serialize`]/[`Deserialize`] so they can
//! be transmitted over QUIC as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Request-scoped credentials and endpoint settings, keyed as the
/// orchestrator passes them (`accessKeyID`, `secretAccessKey`, ...).
pub type Secrets = HashMap<String, String>;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Separator between bucket and prefix inside a [`VolumeId`].
pub const VOLUME_ID_SEPARATOR: char = '/';

/// Volume identifier handed to the orchestrator.
///
/// The identifier encodes where the volume lives in the object store: the
/// text before the first `/` is the bucket, everything after it is the
/// prefix.  It is recomputed from the string on every call and never stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Build the identifier for `prefix` inside `bucket`.
    pub fn encode(bucket: &str, prefix: &str) -> Self {
        if prefix.is_empty() {
            Self(bucket.to_owned())
        } else {
            Self(format!("{bucket}{VOLUME_ID_SEPARATOR}{prefix}"))
        }
    }

    /// Split the identifier into `(bucket, prefix)`.  The prefix is empty
    /// when the identifier has no separator.
    pub fn decode(&self) -> (&str, &str) {
        self.0
            .split_once(VOLUME_ID_SEPARATOR)
            .unwrap_or((self.0.as_str(), ""))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type reported to the orchestrator.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
}

fn default_fs_type() -> String {
    "fuse.s3fs".to_owned()
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteOnce,
            mount_flags: Vec::new(),
            fs_type: default_fs_type(),
        }
    }
}

/// Outcome of `ValidateVolumeCapabilities`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CapabilityValidation {
    /// The listed capabilities are supported.
    Confirmed(Vec<VolumeCapability>),
    /// At least one capability is unsupported; the string explains why.
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Volumes
// ---------------------------------------------------------------------------

/// A provisioned volume as returned by `CreateVolume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Identifier encoding bucket and prefix.
    pub volume_id: VolumeId,
    /// Capacity requested at creation; not enforced by the store.
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Volume context key selecting the mounter.
pub const CONTEXT_MOUNTER: &str = "mounter";
/// Volume context key carrying extra mount options.
pub const CONTEXT_OPTIONS: &str = "options";
/// Volume context key carrying the capacity in bytes.
pub const CONTEXT_CAPACITY: &str = "capacity";

/// Per-request description of where a volume lives and how to mount it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    pub bucket: String,
    pub prefix: String,
    /// Mounter named by the volume context, if any.
    pub mounter: Option<String>,
    pub mount_options: Vec<String>,
    pub capacity_bytes: u64,
}

impl VolumeMetadata {
    /// Build metadata for `volume_id` from the orchestrator-supplied volume
    /// context.  Missing or unparsable keys fall back to empty values.
    pub fn from_context(volume_id: &VolumeId, context: &HashMap<String, String>) -> Self {
        let (bucket, prefix) = volume_id.decode();
        Self {
            bucket: bucket.to_owned(),
            prefix: prefix.to_owned(),
            mounter: context
                .get(CONTEXT_MOUNTER)
                .filter(|m| !m.is_empty())
                .cloned(),
            mount_options: context
                .get(CONTEXT_OPTIONS)
                .map(|opts| split_mount_options(opts))
                .unwrap_or_default(),
            capacity_bytes: context
                .get(CONTEXT_CAPACITY)
                .and_then(|c| c.parse().ok())
                .unwrap_or(0),
        }
    }
}

/// Split a mount option string on whitespace.  Double quotes group words
/// and are removed; inside quotes a backslash escapes the next character.
pub fn split_mount_options(input: &str) -> Vec<String> {
    let mut options = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    options.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        options.push(current);
    }
    options
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Orchestrator-chosen volume name.
    pub name: String,
    /// Desired capacity in bytes.
    pub capacity_bytes: u64,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage class parameters (`bucket`, `mounter`, `options`).
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request to delete a volume and its backing storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request to check capabilities against an existing volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub secrets: Secrets,
}

/// Request to stage (FUSE-mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    /// Requested capability; required.
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Secrets,
}

impl Default for NodeStageVolumeRequest {
    fn default() -> Self {
        Self {
            volume_id: VolumeId::default(),
            staging_target_path: String::new(),
            volume_capability: Some(VolumeCapability::default()),
            volume_context: HashMap::new(),
            secrets: Secrets::new(),
        }
    }
}

/// Request to publish (bind-mount) a staged volume into a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Per-workload target path.
    pub target_path: String,
    /// Requested capability; required.
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Opaque context carried from `CreateVolume`, used to re-stage.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Credentials used if the staging mount has to be revived.
    #[serde(default)]
    pub secrets: Secrets,
}

impl Default for NodePublishVolumeRequest {
    fn default() -> Self {
        Self {
            volume_id: VolumeId::default(),
            staging_target_path: String::new(),
            target_path: String::new(),
            volume_capability: Some(VolumeCapability::default()),
            read_only: false,
            volume_context: HashMap::new(),
            secrets: Secrets::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"s3.csi.rk8s.io"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

/// Controller RPCs this plugin implements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
}

/// Node RPCs this plugin implements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique node identifier.
    pub node_id: String,
    /// Maximum number of volumes the node can host; `0` means no limit.
    pub max_volumes: u64,
}
