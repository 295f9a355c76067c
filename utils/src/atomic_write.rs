//! Atomic file writes: temp file in the target directory, then rename.
//!
//! A crash mid-write never leaves a torn file visible under the real name.
//! Windows cannot rename over an existing file, so overwrite falls back to a
//! backup-and-restore sequence there.

use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct AtomicWriteOptions {
    /// Call `sync_all()` on the temp file before the rename.
    pub sync_all: bool,
    /// Best-effort `sync_all()` on the parent directory after the rename,
    /// narrowing the window where power loss drops the directory entry.
    /// Errors are logged, never returned.
    pub dir_sync: bool,
    /// Unix only: mode applied to the temp file and the final file
    /// (snapshots use `0o600`).
    pub unix_mode: Option<u32>,
}

impl Default for AtomicWriteOptions {
    fn default() -> Self {
        Self {
            sync_all: true,
            dir_sync: false,
            unix_mode: None,
        }
    }
}

pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> std::io::Result<()> {
    atomic_write_with_options(path, bytes, AtomicWriteOptions::default())
}

pub fn atomic_write_with_options(
    path: impl AsRef<Path>,
    bytes: &[u8],
    options: AtomicWriteOptions,
) -> std::io::Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(parent)?;
    #[cfg(unix)]
    if let Some(mode) = options.unix_mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(mode))?;
    }

    tmp.write_all(bytes)?;
    if options.sync_all {
        tmp.as_file().sync_all()?;
    }

    if let Err(err) = tmp.persist(path) {
        if path.exists() {
            // Windows: rename-over-existing fails. Move the old file aside,
            // persist, then drop the backup.
            let backup = path.with_extension("bak");
            let _ = std::fs::remove_file(&backup);
            std::fs::rename(path, &backup)?;

            if let Err(retry) = err.file.persist(path) {
                let _ = std::fs::rename(&backup, path);
                return Err(retry.error);
            }
            if let Err(e) = std::fs::remove_file(&backup) {
                warn!(path = %backup.display(), "failed to remove .bak after atomic write: {e}");
            }
        } else {
            return Err(err.error);
        }
    }

    #[cfg(unix)]
    if let Some(mode) = options.unix_mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }

    if options.dir_sync {
        sync_parent_dir(parent);
    }

    Ok(())
}

fn sync_parent_dir(parent: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = std::fs::File::open(parent).and_then(|d| d.sync_all()) {
            debug!(path = %parent.display(), "parent directory sync failed (best-effort): {e}");
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;

        // From winbase.h; required to open a directory handle.
        const FILE_FLAG_BACKUP_SEMANTICS: u32 = 0x0200_0000;

        let mut opts = std::fs::OpenOptions::new();
        opts.read(true)
            .write(true)
            .custom_flags(FILE_FLAG_BACKUP_SEMANTICS);

        if let Err(e) = opts.open(parent).and_then(|d| d.sync_all()) {
            debug!(path = %parent.display(), "parent directory sync failed (best-effort): {e}");
        }
    }
}
