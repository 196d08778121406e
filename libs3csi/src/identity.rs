//! CSI Identity service trait.
//!
//! The Identity service lets callers discover plugin metadata and check
//! plugin health.  Every CSI plugin must implement it.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

/// Identity service - plugin discovery and health probing.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Return the plugin name and version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Liveness probe.  Returns `true` when the plugin is ready.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Advertise the services this plugin provides.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
