// =============================================================================
// Canonical Market Lock — at most one live instance per (root, market)
// =============================================================================
//
// Advisory file lock under `<project_root>/locks/<CANONICAL>.lock`. Holding
// the OS lock is what matters; the pid/run-id written into the file is for
// operator diagnostics only.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{info, warn};

use crate::types::EventKind;

/// An acquired canonical-market lock. Released on drop or via [`release`].
///
/// [`release`]: CanonicalMarketLock::release
pub struct CanonicalMarketLock {
    file: Option<File>,
    path: PathBuf,
    canonical: String,
}

impl CanonicalMarketLock {
    /// Try to acquire the lock for `canonical` under `project_root`.
    ///
    /// Returns `Ok(None)` when another live instance already holds it; any
    /// other failure is an I/O error.
    pub fn try_acquire(
        project_root: impl AsRef<Path>,
        canonical: &str,
        run_id: &str,
    ) -> Result<Option<Self>> {
        let dir = project_root.as_ref().join("locks");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create lock dir {}", dir.display()))?;
        let path = dir.join(format!("{canonical}.lock"));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                warn!(
                    canonical = canonical,
                    path = %path.display(),
                    "canonical-market lock held by another instance"
                );
                return Ok(None);
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to lock {}", path.display()))
            }
        }

        // Truncate and stamp with our identity now that we own it.
        file.set_len(0)?;
        let mut f = &file;
        writeln!(f, "pid={} run_id={run_id}", std::process::id())?;
        f.flush()?;

        info!(
            event = %EventKind::MarketLockAcquired,
            canonical = canonical,
            path = %path.display(),
            run_id = run_id,
            "canonical-market lock acquired"
        );

        Ok(Some(Self {
            file: Some(file),
            path,
            canonical: canonical.to_string(),
        }))
    }

    /// Explicitly release the lock. Idempotent.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "failed to unlock market lock");
            }
            info!(
                event = %EventKind::MarketLockReleased,
                canonical = %self.canonical,
                path = %self.path.display(),
                "canonical-market lock released"
            );
        }
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl Drop for CanonicalMarketLock {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CanonicalMarketLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanonicalMarketLock")
            .field("canonical", &self.canonical)
            .field("path", &self.path)
            .field("held", &self.file.is_some())
            .finish()
    }
}
