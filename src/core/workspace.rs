use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

/// Disposable directory. Every compile and every execution gets its own,
/// and the directory is removed when the value is dropped.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    pub async fn create(root: &Path, prefix: &str) -> std::io::Result<Self> {
        let path = root.join(format!("{}_{}", prefix, Uuid::new_v4()));
        fs::create_dir_all(&path).await?;
        Ok(Workspace { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        // Tree removal blocks; run it on the blocking pool.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove(&path));
            }
            Err(_) => remove(&path),
        }
    }
}

fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove workspace {}: {}", path.display(), e);
        }
    }
}
