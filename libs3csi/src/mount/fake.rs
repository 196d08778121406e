//! Recording [`HostMounts`] for tests.  Nothing touches the real mount
//! table; a successful mount command marks its target as mounted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use nix::mount::MsFlags;

use super::{HostMounts, MountState};
use crate::error::CsiError;

#[derive(Debug, Clone)]
pub(crate) struct RecordedCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Whether the `passwd_file=` argument named an existing file while the
    /// command ran.
    pub passwd_file_existed: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FakeMounts {
    states: Mutex<HashMap<PathBuf, MountState>>,
    commands: Mutex<Vec<RecordedCommand>>,
    binds: Mutex<Vec<(PathBuf, PathBuf, MsFlags)>>,
    unmounts: Mutex<Vec<(PathBuf, bool)>>,
    modes: Mutex<Vec<(PathBuf, u32)>>,
    mount_never_appears: AtomicBool,
    command_fails: AtomicBool,
    unmount_is_noop: AtomicBool,
}

impl FakeMounts {
    pub fn set_state(&self, path: &Path, state: MountState) {
        self.states.lock().unwrap().insert(path.to_path_buf(), state);
    }

    pub fn state(&self, path: &Path) -> MountState {
        self.states
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(MountState::Unmounted)
    }

    pub fn set_mount_never_appears(&self, value: bool) {
        self.mount_never_appears.store(value, Ordering::SeqCst);
    }

    pub fn set_command_fails(&self, value: bool) {
        self.command_fails.store(value, Ordering::SeqCst);
    }

    pub fn set_unmount_is_noop(&self, value: bool) {
        self.unmount_is_noop.store(value, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn binds(&self) -> Vec<(PathBuf, PathBuf, MsFlags)> {
        self.binds.lock().unwrap().clone()
    }

    pub fn unmounts(&self) -> Vec<(PathBuf, bool)> {
        self.unmounts.lock().unwrap().clone()
    }

    pub fn modes(&self) -> Vec<(PathBuf, u32)> {
        self.modes.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostMounts for FakeMounts {
    async fn mount_state(&self, path: &Path) -> Result<MountState, CsiError> {
        Ok(self.state(path))
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        flags: MsFlags,
    ) -> Result<(), CsiError> {
        self.binds
            .lock()
            .unwrap()
            .push((source.to_path_buf(), target.to_path_buf(), flags));
        self.set_state(target, MountState::MountedHealthy);
        Ok(())
    }

    async fn unmount(&self, path: &Path, lazy: bool) -> Result<(), CsiError> {
        self.unmounts
            .lock()
            .unwrap()
            .push((path.to_path_buf(), lazy));
        if !self.unmount_is_noop.load(Ordering::SeqCst) {
            self.states.lock().unwrap().remove(path);
        }
        Ok(())
    }

    async fn run_mount_command(
        &self,
        program: &str,
        args: &[String],
        target: &Path,
    ) -> Result<(), CsiError> {
        let passwd_file_existed = args
            .iter()
            .find_map(|a| a.strip_prefix("passwd_file="))
            .is_some_and(|p| Path::new(p).exists());
        self.commands.lock().unwrap().push(RecordedCommand {
            program: program.to_owned(),
            args: args.to_vec(),
            passwd_file_existed,
        });

        if self.command_fails.load(Ordering::SeqCst) {
            return Err(CsiError::MountExecutionFailed {
                path: target.display().to_string(),
                reason: format!("{program} exited with exit status: 1"),
            });
        }
        if !self.mount_never_appears.load(Ordering::SeqCst) {
            self.set_state(target, MountState::MountedHealthy);
        }
        Ok(())
    }

    async fn ensure_mode(&self, path: &Path, mode: u32) -> Result<(), CsiError> {
        self.modes.lock().unwrap().push((path.to_path_buf(), mode));
        Ok(())
    }
}
