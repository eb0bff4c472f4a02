//! Materializes secret plaintext, already decrypted by the manager and sent
//! only over mTLS, into files under a RAM-backed mount that gets bind-mounted
//! into the container. Mounting the tmpfs itself is an environment
//! precondition; this just writes the files into it.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::WorkerError;

pub struct SecretMount {
    root: PathBuf,
}

impl SecretMount {
    pub fn new(ram_backed_root: impl Into<PathBuf>) -> Self {
        SecretMount { root: ram_backed_root.into() }
    }

    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.root.join(container_id)
    }

    pub async fn materialize(
        &self,
        container_id: &str,
        secrets: &BTreeMap<String, Vec<u8>>,
    ) -> Result<PathBuf, WorkerError> {
        let dir = self.container_dir(container_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700)).await?;

        for (name, plaintext) in secrets {
            let path = dir.join(name);
            tokio::fs::write(&path, plaintext).await?;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(dir)
    }

    pub async fn cleanup(&self, container_id: &str) -> Result<(), WorkerError> {
        let dir = self.container_dir(container_id);
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}

pub fn is_ram_backed(path: &Path) -> bool {
    // Best-effort check; a real deployment mounts tmpfs at this path ahead of
    // time and this just confirms it landed where expected.
    path.starts_with("/run") || path.starts_with("/dev/shm")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn materializes_and_cleans_up_secret_files() {
        let dir = tempfile::tempdir().unwrap();
        let mount = SecretMount::new(dir.path());
        let mut secrets = BTreeMap::new();
        secrets.insert("db-password".to_string(), b"hunter2".to_vec());

        let written = mount.materialize("c1", &secrets).await.unwrap();
        let contents = tokio::fs::read(written.join("db-password")).await.unwrap();
        assert_eq!(contents, b"hunter2");

        mount.cleanup("c1").await.unwrap();
        assert!(!written.exists());
    }
}
