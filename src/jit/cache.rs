//! Shared on-disk build cache
//!
//! One directory per kernel variant under a common root. Two marker files
//! govern cross-process coordination: `started` records a claimed build
//! along with the owning process, `done` records a finished one. Claims are
//! taken with `create_new` so exactly one process wins each variant.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Overrides the default cache root when set.
pub const CACHE_ENV_VAR: &str = "STEPR_KERNEL_CACHE";

const STARTED_MARKER: &str = "started";
const DONE_MARKER: &str = "done";

/// Cache root: the env override when present, otherwise a fixed directory
/// under the system temp dir so unrelated processes land on the same cache.
pub fn default_cache_root() -> PathBuf {
    match env::var_os(CACHE_ENV_VAR) {
        Some(dir) => PathBuf::from(dir),
        None => env::temp_dir().join("stepr-kernels"),
    }
}

/// Paths inside one kernel variant's build directory.
#[derive(Debug, Clone)]
pub struct VariantCache {
    dir: PathBuf,
}

impl VariantCache {
    pub fn new(root: &Path, variant: &str) -> Self {
        Self {
            dir: root.join(variant),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn started_marker(&self) -> PathBuf {
        self.dir.join(STARTED_MARKER)
    }

    pub fn done_marker(&self) -> PathBuf {
        self.dir.join(DONE_MARKER)
    }

    /// Artifact path with the platform shared-library prefix and suffix.
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}{}",
            env::consts::DLL_PREFIX,
            name,
            env::consts::DLL_SUFFIX
        ))
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::Build {
            reason: format!(
                "failed to create build cache dir {}: {e}",
                self.dir.display()
            ),
        })
    }

    /// Publish completion. Must only run after the artifact is fully written.
    pub fn mark_done(&self) -> Result<()> {
        fs::write(self.done_marker(), b"ok").map_err(|e| Error::Build {
            reason: format!(
                "failed to write done marker in {}: {e}",
                self.dir.display()
            ),
        })
    }
}

/// Contents of the `started` marker: which process claimed the build, when.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub pid: u32,
    /// Seconds since the unix epoch at claim time.
    pub claimed_at: u64,
}

impl ClaimRecord {
    pub fn current() -> Self {
        let claimed_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            pid: std::process::id(),
            claimed_at,
        }
    }

    /// Write this record to `path` without clobbering an existing claim.
    /// Returns whether the claim was won.
    pub fn write_new(&self, path: &Path) -> Result<bool> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let body = serde_json::to_string(self).map_err(|e| Error::Build {
                    reason: format!("failed to encode claim record: {e}"),
                })?;
                file.write_all(body.as_bytes()).map_err(|e| Error::Build {
                    reason: format!("failed to write claim record {}: {e}", path.display()),
                })?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Build {
                reason: format!("failed to claim build {}: {e}", path.display()),
            }),
        }
    }

    /// Read a claim record, if the marker exists and parses.
    pub fn read(path: &Path) -> Option<Self> {
        let body = fs::read_to_string(path).ok()?;
        serde_json::from_str(&body).ok()
    }
}

/// Age of a marker file from its mtime. `None` when the file is gone or the
/// filesystem clock is unusable.
pub fn marker_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}
