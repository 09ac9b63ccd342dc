//! Crash-safe file writes.
//!
//! Every durable file in CalVault is replaced with the same sequence:
//! write a uniquely named temp file next to the target, fsync it, rename it
//! over the target, then fsync the directory. A crash at any point leaves
//! either the previous file or the new one, plus at most an orphaned temp
//! file that is never read back.

use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::{Error, Result};

/// Suffix of in-flight temp files.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Permissions for files holding key material or ciphertexts.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Permissions for directories holding private files.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// Check whether a path names an in-flight temp file.
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

fn temp_path_for(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidInput(format!("Invalid target path: {}", target.display())))?;
    let temp_name = format!(".{}.{}{}", name, Uuid::new_v4().simple(), TEMP_SUFFIX);
    Ok(target.with_file_name(temp_name))
}

/// Write `data` to a fresh temp file beside `target` and fsync it.
///
/// The target itself is untouched until [`commit`] is called.
pub async fn write_temp(target: &Path, data: &[u8]) -> Result<PathBuf> {
    let temp = temp_path_for(target)?;

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(PRIVATE_FILE_MODE);

    let result = async {
        let mut file = options.open(&temp).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<_, std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&temp).await;
        return Err(Error::Storage(format!(
            "Failed to write {}: {}",
            target.display(),
            e
        )));
    }

    Ok(temp)
}

/// Atomically move a temp file produced by [`write_temp`] over `target`.
pub async fn commit(temp: &Path, target: &Path) -> Result<()> {
    if let Err(e) = fs::rename(temp, target).await {
        let _ = fs::remove_file(temp).await;
        return Err(Error::Storage(format!(
            "Failed to replace {}: {}",
            target.display(),
            e
        )));
    }

    if let Some(parent) = target.parent() {
        sync_dir(parent).await?;
    }
    Ok(())
}

/// Replace `target` with `data` atomically.
pub async fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    let temp = write_temp(target, data).await?;
    commit(&temp, target).await
}

/// Flush directory entries so a completed rename survives power loss.
pub async fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle = fs::File::open(dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to open {}: {}", dir.display(), e)))?;
        handle
            .sync_all()
            .await
            .map_err(|e| Error::Storage(format!("Failed to sync {}: {}", dir.display(), e)))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Create `dir` (and parents) restricted to the owner.
pub async fn ensure_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create {}: {}", dir.display(), e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, std::fs::Permissions::from_mode(PRIVATE_DIR_MODE))
            .await
            .map_err(|e| {
                Error::Storage(format!("Failed to restrict {}: {}", dir.display(), e))
            })?;
    }
    Ok(())
}

/// Delete temp files left behind by a crash between write and rename.
///
/// Returns the number of files removed.
pub async fn remove_orphaned_temps(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_temp_file(&path) {
            debug!("Removing orphaned temp file {}", path.display());
            fs::remove_file(&path).await?;
            removed += 1;
        }
    }

    Ok(removed)
}
