//! [`HostMounts`] on a real Linux host.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use tracing::{debug, warn};

use super::{HostMounts, MountState};
use crate::error::CsiError;

const PROC_MOUNTS: &str = "/proc/self/mounts";

/// Upper bound on how long a mount program may run before it is killed.
pub const MOUNT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Mount table, syscalls and child processes of the running host.
#[derive(Debug, Clone)]
pub struct SystemMounts {
    command_timeout: Duration,
}

impl Default for SystemMounts {
    fn default() -> Self {
        Self {
            command_timeout: MOUNT_COMMAND_TIMEOUT,
        }
    }
}

impl SystemMounts {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Undo the octal escapes (`\040` for space and so on) that the kernel
/// writes into mount table fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(b) = u8::try_from(value) {
                    out.push(b);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `path` appears as a mount point in `table`.
fn is_listed(table: &str, path: &Path) -> bool {
    let wanted = path.to_string_lossy();
    let wanted = match wanted.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };
    // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mp| unescape_mount_field(mp) == wanted)
}

/// Errors a `stat` gives on a mount whose FUSE process has exited.
fn is_dead_mount_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error().map(Errno::from_raw),
        Some(Errno::ENOTCONN | Errno::EIO | Errno::ESTALE)
    )
}

#[async_trait]
impl HostMounts for SystemMounts {
    async fn mount_state(&self, path: &Path) -> Result<MountState, CsiError> {
        let table = tokio::fs::read_to_string(PROC_MOUNTS)
            .await
            .map_err(|e| CsiError::internal(format!("read {PROC_MOUNTS}: {e}")))?;
        if !is_listed(&table, path) {
            return Ok(MountState::Unmounted);
        }

        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(MountState::MountedHealthy),
            Err(e) if is_dead_mount_error(&e) => {
                debug!(path = %path.display(), error = %e, "mount point is not answering");
                Ok(MountState::MountedStale)
            }
            Err(e) => Err(CsiError::internal(format!(
                "stat {}: {e}",
                path.display()
            ))),
        }
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        flags: MsFlags,
    ) -> Result<(), CsiError> {
        let mount_failed = |reason: String| CsiError::MountExecutionFailed {
            path: target.display().to_string(),
            reason,
        };

        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| mount_failed(format!("bind mount: {e}")))?;

        // Per-mount flags are ignored on the initial bind; they take a remount.
        if !flags.is_empty() {
            nix::mount::mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | flags,
                None::<&str>,
            )
            .map_err(|e| mount_failed(format!("remount with {flags:?}: {e}")))?;
        }
        Ok(())
    }

    async fn unmount(&self, path: &Path, lazy: bool) -> Result<(), CsiError> {
        let flags = if lazy {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        match nix::mount::umount2(path, flags) {
            Ok(()) => Ok(()),
            // Not a mount point (any more), or already gone.
            Err(Errno::EINVAL | Errno::ENOENT) => {
                debug!(path = %path.display(), "nothing mounted to unmount");
                Ok(())
            }
            Err(e) => Err(CsiError::UnmountFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn run_mount_command(
        &self,
        program: &str,
        args: &[String],
        target: &Path,
    ) -> Result<(), CsiError> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // Dropping the future on timeout kills the child.
        let output = tokio::time::timeout(self.command_timeout, child)
            .await
            .map_err(|_| CsiError::MountTimeout {
                path: target.display().to_string(),
                seconds: self.command_timeout.as_secs(),
            })?
            .map_err(|e| CsiError::MountExecutionFailed {
                path: target.display().to_string(),
                reason: format!("spawn {program}: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            warn!(
                program,
                code = ?output.status.code(),
                stderr = %stderr.trim(),
                "mount program failed"
            );
            return Err(CsiError::MountExecutionFailed {
                path: target.display().to_string(),
                reason: format!(
                    "{program} exited with {}: {} {}",
                    output.status,
                    stderr.trim(),
                    stdout.trim()
                )
                .trim_end()
                .to_owned(),
            });
        }
        Ok(())
    }

    async fn ensure_mode(&self, path: &Path, mode: u32) -> Result<(), CsiError> {
        let chmod_failed = |e: io::Error| CsiError::MountExecutionFailed {
            path: path.display().to_string(),
            reason: format!("chmod {mode:o}: {e}"),
        };
        let current = tokio::fs::metadata(path)
            .await
            .map_err(chmod_failed)?
            .permissions()
            .mode()
            & 0o7777;
        if current != mode {
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(chmod_failed)?;
        }
        Ok(())
    }
}
