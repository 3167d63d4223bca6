use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::constants::{RUN_DIR_PREFIX, WORKSPACE_PREFIX};

/// Scratch directory owned by exactly one judging call. Removed by
/// [`Workspace::remove`], or on drop whichever way the call ends.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    path: PathBuf,
    removed: bool,
}

impl Workspace {
    pub async fn create(scratch_root: &Path) -> std::io::Result<Self> {
        let id = Uuid::new_v4();
        let path = scratch_root.join(format!("{WORKSPACE_PREFIX}{id}"));
        fs::create_dir_all(&path).await?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).await?;
        Ok(Self {
            id,
            path,
            removed: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        log_removal(&self.path, fs::remove_dir_all(&self.path).await);
        self.removed = true;
    }

    /// Private working directory for one test case.
    pub async fn create_run_dir(&self, index: usize) -> std::io::Result<PathBuf> {
        let dir = run_dir(&self.path, index);
        fs::create_dir(&dir).await?;
        Ok(dir)
    }
}

pub fn run_dir(workspace: &Path, index: usize) -> PathBuf {
    workspace.join(format!("{RUN_DIR_PREFIX}{index}"))
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let path = std::mem::take(&mut self.path);
        let remove = move || log_removal(&path, std::fs::remove_dir_all(&path));
        // Keeps the recursive delete off the async worker threads.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(remove);
            }
            Err(_) => remove(),
        }
    }
}

fn log_removal(path: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "Workspace removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "Failed to remove workspace: {}", e),
    }
}
