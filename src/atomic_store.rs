//! Write-to-temporary, flush, rename persistence helper

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

/// Path of the staging file for `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Write `path` atomically: the content goes to `path.tmp`, is flushed and
/// synced, and only then renamed over `path`. On any failure the temporary
/// is left in place for diagnostics and the final name is untouched.
pub fn scoped_write<F>(path: &Path, writer_fn: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let tmp = temp_path(path);
    let mut file = File::create(&tmp)?;

    if let Err(e) = writer_fn(&mut file) {
        error!("Staged write to {tmp:?} failed: {e}");
        return Err(e);
    }

    file.flush()?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    debug!("Committed {path:?}");
    Ok(())
}

/// Recover from a crash that happened between a completed staged write and
/// its rename: if `path` is missing but `path.tmp` exists, adopt the
/// temporary. Called by every store before reading.
pub fn restore_if_needed(path: &Path) {
    if path.exists() {
        return;
    }
    let tmp = temp_path(path);
    if !tmp.exists() {
        return;
    }
    match fs::rename(&tmp, path) {
        Ok(()) => warn!("Restored {path:?} from leftover temporary"),
        Err(e) => error!("Failed to restore {path:?} from {tmp:?}: {e}"),
    }
}

/// Remove `path` and any staging leftover, verifying both are gone.
pub fn remove_verified(path: &Path) -> bool {
    let tmp = temp_path(path);
    for p in [path, tmp.as_path()] {
        if p.exists() {
            if let Err(e) = fs::remove_file(p) {
                error!("Failed to remove {p:?}: {e}");
            }
        }
    }
    let gone = !path.exists() && !tmp.exists();
    if gone {
        debug!("Removed {path:?}");
    } else {
        error!("{path:?} still present after removal");
    }
    gone
}
