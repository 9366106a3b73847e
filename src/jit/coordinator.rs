//! Cross-process build coordination
//!
//! Any number of processes may ask for the same kernel variant at once;
//! the coordinator guarantees at most one of them runs the compiler. The
//! winner is whoever creates the `started` marker, everyone else polls for
//! the `done` marker under a bounded wait policy.

use crate::error::{Error, Result};
use crate::jit::cache::{ClaimRecord, default_cache_root, marker_age, VariantCache};
use crate::jit::compiler::{KernelCompiler, KernelSpec, SystemCompiler};
use crate::kernel::{ArtifactLoader, DylibLoader, KernelHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How long and how often a non-building process waits for a peer's build.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    /// Delay between marker polls.
    pub poll_interval: Duration,
    /// Total time to wait for the done marker before giving up.
    pub timeout: Duration,
    /// A started marker older than this with no done marker is treated as
    /// abandoned by a dead process.
    pub stale_after: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(300),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Builds kernel variants at most once across cooperating processes.
///
/// All coordination state lives in the shared cache directory, so the
/// processes involved need no channel beyond the filesystem.
pub struct BuildCoordinator {
    cache_root: PathBuf,
    policy: WaitPolicy,
    compiler: Arc<dyn KernelCompiler>,
    loader: Arc<dyn ArtifactLoader>,
}

impl BuildCoordinator {
    pub fn new() -> Self {
        Self {
            cache_root: default_cache_root(),
            policy: WaitPolicy::default(),
            compiler: Arc::new(SystemCompiler),
            loader: Arc::new(DylibLoader),
        }
    }

    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }

    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn KernelCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn ArtifactLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Produce a loaded handle for `spec`, compiling at most once.
    ///
    /// An existing done marker short-circuits to loading the artifact.
    /// Otherwise the caller races for the started marker: the winner
    /// compiles and publishes done, losers wait for it. A failed
    /// compilation leaves the started marker in place, so later callers
    /// fail by staleness until the variant directory is cleared.
    pub fn acquire(&self, spec: &KernelSpec) -> Result<KernelHandle> {
        let cache = VariantCache::new(&self.cache_root, &spec.name);
        cache.ensure_dir()?;
        let artifact = cache.artifact_path(&spec.name);

        if cache.done_marker().exists() {
            return self.loader.load(&artifact);
        }

        if ClaimRecord::current().write_new(&cache.started_marker())? {
            self.compiler.compile(spec, &artifact)?;
            cache.mark_done()?;
            return self.loader.load(&artifact);
        }

        self.wait_for_done(&cache)?;
        self.loader.load(&artifact)
    }

    fn wait_for_done(&self, cache: &VariantCache) -> Result<()> {
        let started = cache.started_marker();
        let done = cache.done_marker();
        let deadline = Instant::now() + self.policy.timeout;

        loop {
            if done.exists() {
                return Ok(());
            }
            match marker_age(&started) {
                None => {
                    return Err(Error::Build {
                        reason: format!(
                            "build claim for {} disappeared without a done marker",
                            cache.dir().display()
                        ),
                    });
                }
                Some(age) if age > self.policy.stale_after => {
                    let owner = ClaimRecord::read(&started)
                        .map(|claim| format!("pid {}", claim.pid))
                        .unwrap_or_else(|| "an unknown process".to_string());
                    return Err(Error::Build {
                        reason: format!(
                            "build claim for {} held by {owner} looks abandoned \
                             ({}s old); remove {} to retry",
                            cache.dir().display(),
                            age.as_secs(),
                            started.display()
                        ),
                    });
                }
                Some(_) => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::Build {
                    reason: format!(
                        "timed out after {:?} waiting for another process to finish \
                         building {}",
                        self.policy.timeout,
                        cache.dir().display()
                    ),
                });
            }
            thread::sleep(self.policy.poll_interval);
        }
    }
}

impl Default for BuildCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
