//! FUSE mounters that expose a bucket (or a prefix of one) as a directory.
//!
//! The set of mounters is closed: [`MounterKind`] names what is available
//! and an unknown name is rejected with
//! [`CsiError::InvalidArgument`](crate::CsiError::InvalidArgument).

use std::fmt;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::time::{Instant, sleep};
use tracing::{debug, instrument};

use super::{HostMounts, MountState};
use crate::config::StoreConfig;
use crate::error::CsiError;
use crate::types::{VolumeId, VolumeMetadata};

pub const S3FS_PROGRAM: &str = "s3fs";

/// Interval between mount table probes while waiting for a mount.
const MOUNT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MounterKind {
    S3fs,
}

impl MounterKind {
    /// Pick the mounter for a volume: the volume context wins over the
    /// secrets, which win over the driver default.
    pub fn select(
        meta: &VolumeMetadata,
        config: &StoreConfig,
        default: &str,
    ) -> Result<Self, CsiError> {
        meta.mounter
            .as_deref()
            .or(config.mounter.as_deref())
            .unwrap_or(default)
            .parse()
    }
}

impl FromStr for MounterKind {
    type Err = CsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s3fs" => Ok(Self::S3fs),
            other => Err(CsiError::InvalidArgument(format!(
                "mounter {other:?} is not supported"
            ))),
        }
    }
}

impl fmt::Display for MounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S3fs => f.write_str("s3fs"),
        }
    }
}

/// A mounter configured for one volume.
#[derive(Debug, Clone)]
pub enum Mounter {
    S3fs(S3fsMounter),
}

impl Mounter {
    pub fn new(
        meta: &VolumeMetadata,
        config: &StoreConfig,
        default: &str,
    ) -> Result<Self, CsiError> {
        match MounterKind::select(meta, config, default)? {
            MounterKind::S3fs => Ok(Self::S3fs(S3fsMounter::new(meta, config))),
        }
    }

    pub fn kind(&self) -> MounterKind {
        match self {
            Self::S3fs(_) => MounterKind::S3fs,
        }
    }

    /// Mount the volume at `target` and wait until the mount is live.
    pub async fn mount(
        &self,
        mounts: &dyn HostMounts,
        target: &Path,
        volume_id: &VolumeId,
        timeout: Duration,
    ) -> Result<(), CsiError> {
        match self {
            Self::S3fs(m) => m.mount(mounts, target, volume_id, timeout).await,
        }
    }
}

/// Mounts through the `s3fs` FUSE binary.
#[derive(Clone)]
pub struct S3fsMounter {
    bucket: String,
    prefix: String,
    url: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    options: Vec<String>,
}

impl fmt::Debug for S3fsMounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3fsMounter")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("url", &self.url)
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("options", &self.options)
            .finish()
    }
}

impl S3fsMounter {
    pub fn new(meta: &VolumeMetadata, config: &StoreConfig) -> Self {
        Self {
            bucket: meta.bucket.clone(),
            prefix: meta.prefix.clone(),
            url: config.endpoint_url(),
            region: config.region.clone(),
            access_key_id: config.access_key_id.clone(),
            secret_access_key: config.secret_access_key.clone(),
            options: meta.mount_options.clone(),
        }
    }

    /// `bucket` or `bucket:/prefix`.
    fn source(&self) -> String {
        if self.prefix.is_empty() {
            self.bucket.clone()
        } else {
            format!("{}:/{}", self.bucket, self.prefix.trim_start_matches('/'))
        }
    }

    /// Command line for mounting at `target`, reading credentials from
    /// `passwd_file` when one is given.
    pub fn args(&self, target: &Path, passwd_file: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            self.source(),
            target.display().to_string(),
            "-o".into(),
            "use_path_request_style".into(),
            "-o".into(),
            format!("url={}", self.url),
            "-o".into(),
            "allow_other".into(),
            "-o".into(),
            "mp_umask=000".into(),
        ];
        if !self.region.is_empty() {
            args.push("-o".into());
            args.push(format!("endpoint={}", self.region));
        }
        if let Some(file) = passwd_file {
            args.push("-o".into());
            args.push(format!("passwd_file={}", file.display()));
        }
        for opt in &self.options {
            args.push("-o".into());
            args.push(opt.clone());
        }
        args
    }

    /// Write `ACCESS_KEY:SECRET` to a private temporary file.  The file is
    /// removed when the returned handle is dropped.
    fn passwd_file(&self) -> Result<Option<NamedTempFile>, CsiError> {
        if self.access_key_id.is_empty() && self.secret_access_key.is_empty() {
            return Ok(None);
        }
        let mut file = tempfile::Builder::new()
            .prefix(".passwd-s3fs-")
            .tempfile()
            .map_err(|e| CsiError::internal(format!("create s3fs passwd file: {e}")))?;
        writeln!(file, "{}:{}", self.access_key_id, self.secret_access_key)
            .and_then(|()| file.flush())
            .map_err(|e| CsiError::internal(format!("write s3fs passwd file: {e}")))?;
        Ok(Some(file))
    }

    #[instrument(skip(self, mounts), fields(bucket = %self.bucket, prefix = %self.prefix))]
    async fn mount(
        &self,
        mounts: &dyn HostMounts,
        target: &Path,
        volume_id: &VolumeId,
        timeout: Duration,
    ) -> Result<(), CsiError> {
        let passwd = self.passwd_file()?;
        let args = self.args(target, passwd.as_ref().map(NamedTempFile::path));
        debug!(%volume_id, target = %target.display(), "starting s3fs");

        mounts.run_mount_command(S3FS_PROGRAM, &args, target).await?;
        let result = wait_for_mount(mounts, target, timeout).await;

        // s3fs has read its credentials by the time the mount is visible.
        drop(passwd);
        result
    }
}

/// Poll the mount table until `target` is a live mount.
pub async fn wait_for_mount(
    mounts: &dyn HostMounts,
    target: &Path,
    timeout: Duration,
) -> Result<(), CsiError> {
    let deadline = Instant::now() + timeout;
    loop {
        if mounts.mount_state(target).await? == MountState::MountedHealthy {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(CsiError::MountTimeout {
                path: target.display().to_string(),
                seconds: timeout.as_secs(),
            });
        }
        sleep(MOUNT_POLL_INTERVAL).await;
    }
}
