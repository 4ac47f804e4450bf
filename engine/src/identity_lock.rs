//! Identity Lock (spec §4.6, P10): one OS process may hold a given identity's
//! data directory loaded at a time.
//!
//! No crate in the teacher repo does advisory file locking (it only ever runs
//! as a single desktop-app instance, guarded instead by
//! `tauri_plugin_single_instance`). This is therefore hand-rolled on top of
//! `std::fs`'s atomic `create_new`, following the flat-file convention
//! [`crate::keystore`] already established for on-disk identity state — see
//! DESIGN.md.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

/// Held for as long as an identity is loaded in this process. Dropping it
/// removes the lock file, letting another process (or a later `load_identity`
/// in this one) acquire it.
pub struct IdentityLock {
    path: PathBuf,
}

impl IdentityLock {
    /// Acquire the lock at `path`, stealing it first if the PID recorded
    /// inside is no longer running (a crashed process leaves its lock file
    /// behind).
    pub fn acquire(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Internal(format!("create_dir_all {}: {e}", parent.display())))?;
        }

        match try_create(path) {
            Ok(()) => return Ok(Self { path: path.to_path_buf() }),
            Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => {
                return Err(EngineError::Internal(format!("identity lock {}: {e}", path.display())));
            }
            Err(_) => {}
        }

        if holder_is_alive(path) {
            return Err(EngineError::IdentityLocked);
        }

        // Stale lock from a crashed process — steal it.
        let _ = std::fs::remove_file(path);
        try_create(path).map_err(|e| EngineError::Internal(format!("identity lock {}: {e}", path.display())))?;
        Ok(Self { path: path.to_path_buf() })
    }
}

impl Drop for IdentityLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn try_create(path: &Path) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().write(true).create_new(true).open(path)?;
    write!(file, "{}", std::process::id())
}

/// Best-effort liveness check on the PID recorded in the lock file. Any
/// parse failure or unreadable file is treated as "alive" — erring towards
/// `IDENTITY_LOCKED` rather than silently stealing a live process's lock.
fn holder_is_alive(path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(path) else { return true };
    let Ok(pid) = contents.trim().parse::<u32>() else { return true };
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        true
    }
}
