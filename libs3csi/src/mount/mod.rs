//! Node-side mount orchestration.
//!
//! Per local path the orchestrator drives:
//!
//! ```text
//! Unmounted --stage--> Staged --publish--> Published
//!     ^                  |  ^                  |
//!     +-----unstage------+  +----unpublish-----+
//! ```
//!
//! Mount state is never remembered between calls; every decision is taken
//! from a fresh [`HostMounts::mount_state`] probe.  A staging mount whose
//! FUSE process died is re-staged on the next stage or publish instead of
//! being reported to the caller.

pub mod mounter;
pub mod system;

#[cfg(test)]
pub(crate) mod fake;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::error::CsiError;
use crate::types::{Secrets, VolumeId, VolumeMetadata};

pub use mounter::{Mounter, MounterKind, S3fsMounter};
pub use system::SystemMounts;

/// How long a freshly started FUSE mount may take to show up.
pub const DEFAULT_MOUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// Observed state of a path in the mount table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountState {
    Unmounted,
    MountedHealthy,
    /// Listed in the mount table, but the process serving it is gone.
    MountedStale,
}

/// Host primitives the orchestrator relies on.
#[async_trait]
pub trait HostMounts: Send + Sync {
    /// Probe `path` in the mount table.
    async fn mount_state(&self, path: &Path) -> Result<MountState, CsiError>;

    /// Bind-mount `source` onto `target`, then apply `flags` to the new
    /// mount.
    async fn bind_mount(&self, source: &Path, target: &Path, flags: MsFlags)
    -> Result<(), CsiError>;

    /// Unmount `path`; `lazy` detaches it even if the backing process is gone.
    async fn unmount(&self, path: &Path, lazy: bool) -> Result<(), CsiError>;

    /// Run an external mount program for `target` and wait for it to exit.
    async fn run_mount_command(
        &self,
        program: &str,
        args: &[String],
        target: &Path,
    ) -> Result<(), CsiError>;

    /// Change the permission bits of `path` to `mode` if they differ.
    async fn ensure_mode(&self, path: &Path, mode: u32) -> Result<(), CsiError>;
}

/// Brings stage/publish paths into the state the orchestrator asks for.
pub struct MountOrchestrator {
    mounts: Arc<dyn HostMounts>,
    default_mounter: String,
    mount_permissions: Option<u32>,
    mount_timeout: Duration,
}

impl MountOrchestrator {
    pub fn new(mounts: Arc<dyn HostMounts>, default_mounter: impl Into<String>) -> Self {
        Self {
            mounts,
            default_mounter: default_mounter.into(),
            mount_permissions: None,
            mount_timeout: DEFAULT_MOUNT_TIMEOUT,
        }
    }

    /// Mode applied to every published target.
    pub fn with_mount_permissions(mut self, mode: Option<u32>) -> Self {
        self.mount_permissions = mode;
        self
    }

    pub fn with_mount_timeout(mut self, timeout: Duration) -> Self {
        self.mount_timeout = timeout;
        self
    }

    /// Make sure the volume is mounted at `staging`.  A healthy mount is
    /// left alone; a stale one is detached and mounted again.
    #[instrument(skip(self, staging, meta, config), fields(staging = %staging.display()))]
    pub async fn stage(
        &self,
        volume_id: &VolumeId,
        staging: &Path,
        meta: &VolumeMetadata,
        config: &StoreConfig,
    ) -> Result<(), CsiError> {
        let state = self.mounts.mount_state(staging).await?;
        if state == MountState::MountedHealthy {
            debug!(%volume_id, "staging path already mounted");
            return Ok(());
        }

        // Resolved before the path is touched.
        let mounter = Mounter::new(meta, config, &self.default_mounter)?;

        if state == MountState::MountedStale {
            warn!(%volume_id, "staging mount is stale, mounting it again");
            self.mounts.unmount(staging, true).await?;
        }
        create_dir(staging).await?;
        mounter
            .mount(self.mounts.as_ref(), staging, volume_id, self.mount_timeout)
            .await?;

        info!(%volume_id, mounter = %mounter.kind(), "volume staged");
        Ok(())
    }

    /// Bind-mount the staged volume onto `target`.
    ///
    /// The staging mount is re-checked first because it can die between
    /// stage and publish.  An already-mounted target is a success.  `secrets`
    /// are only parsed when the staging mount has to be revived.
    #[instrument(skip(self, staging, target, meta, secrets), fields(target = %target.display()))]
    pub async fn publish(
        &self,
        volume_id: &VolumeId,
        staging: &Path,
        target: &Path,
        flags: MsFlags,
        meta: &VolumeMetadata,
        secrets: &Secrets,
    ) -> Result<(), CsiError> {
        if self.mounts.mount_state(staging).await? != MountState::MountedHealthy {
            let config = StoreConfig::from_secrets(secrets)?;
            self.stage(volume_id, staging, meta, &config).await?;
        }

        match self.mounts.mount_state(target).await? {
            MountState::MountedHealthy => {
                debug!(%volume_id, "target already mounted");
                return Ok(());
            }
            MountState::MountedStale => {
                warn!(%volume_id, "target mount is stale, binding it again");
                self.mounts.unmount(target, true).await?;
            }
            MountState::Unmounted => {}
        }

        create_dir(target).await?;
        self.mounts.bind_mount(staging, target, flags).await?;

        if let Some(mode) = self.mount_permissions {
            self.mounts.ensure_mode(target, mode).await?;
        }

        info!(%volume_id, ?flags, "volume published (bind-mount)");
        Ok(())
    }

    /// Remove the bind mount at `target`.  Already unmounted is a success.
    #[instrument(skip(self, target), fields(target = %target.display()))]
    pub async fn unpublish(&self, volume_id: &VolumeId, target: &Path) -> Result<(), CsiError> {
        self.teardown(target).await?;
        info!(%volume_id, "volume unpublished");
        Ok(())
    }

    /// Unmount the staging path.  Already unmounted is a success.
    #[instrument(skip(self, staging), fields(staging = %staging.display()))]
    pub async fn unstage(&self, volume_id: &VolumeId, staging: &Path) -> Result<(), CsiError> {
        self.teardown(staging).await?;
        info!(%volume_id, "volume unstaged");
        Ok(())
    }

    async fn teardown(&self, path: &Path) -> Result<(), CsiError> {
        match self.mounts.mount_state(path).await? {
            MountState::Unmounted => debug!("path not mounted, nothing to unmount"),
            MountState::MountedHealthy => self.mounts.unmount(path, false).await?,
            MountState::MountedStale => self.mounts.unmount(path, true).await?,
        }

        if self.mounts.mount_state(path).await? != MountState::Unmounted {
            return Err(CsiError::UnmountFailed {
                path: path.display().to_string(),
                reason: "path is still mounted".into(),
            });
        }

        match tokio::fs::remove_dir(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove mount directory"),
        }
        Ok(())
    }
}

/// Translate CSI mount flags into flags for the bind mount.  `read_only`
/// and `ro` both give `MS_RDONLY`; `rw` and `defaults` add nothing.
pub fn bind_flags(read_only: bool, mount_flags: &[String]) -> Result<MsFlags, CsiError> {
    let mut flags = if read_only {
        MsFlags::MS_RDONLY
    } else {
        MsFlags::empty()
    };
    for flag in mount_flags {
        flags |= match flag.as_str() {
            "ro" => MsFlags::MS_RDONLY,
            "rw" | "defaults" => MsFlags::empty(),
            "noatime" => MsFlags::MS_NOATIME,
            "nodiratime" => MsFlags::MS_NODIRATIME,
            "relatime" => MsFlags::MS_RELATIME,
            "strictatime" => MsFlags::MS_STRICTATIME,
            "nosuid" => MsFlags::MS_NOSUID,
            "nodev" => MsFlags::MS_NODEV,
            "noexec" => MsFlags::MS_NOEXEC,
            "sync" => MsFlags::MS_SYNCHRONOUS,
            other => {
                return Err(CsiError::InvalidArgument(format!(
                    "unsupported mount flag {other:?}"
                )));
            }
        };
    }
    Ok(flags)
}

async fn create_dir(path: &Path) -> Result<(), CsiError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| CsiError::MountExecutionFailed {
            path: path.display().to_string(),
            reason: format!("create directory: {e}"),
        })
}
