//! Process-wide kernel registry
//!
//! Memoizes loaded kernel handles by variant name and issues optimizer
//! instance ids. Optimizers take a registry explicitly, so tests can run
//! against private registries while production code shares one per process.

use crate::error::{Error, Result};
use crate::jit::BuildCoordinator;
use crate::kernel::{KernelHandle, KernelVariant, NativeAdamKernel};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifies one optimizer instance to its kernel.
///
/// Issued by [`KernelRegistry::issue_id`]; the kernel keys its per-instance
/// state on it. Ids from different registries may collide, so an optimizer
/// must pair its id with a handle from the same registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel handle cache plus instance id counter.
pub struct KernelRegistry {
    handles: Mutex<HashMap<String, KernelHandle>>,
    next_id: AtomicU64,
    coordinator: BuildCoordinator,
}

impl KernelRegistry {
    /// Registry with an explicit build coordinator.
    pub fn new(coordinator: BuildCoordinator) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            coordinator,
        }
    }

    /// Registry with default build settings: the shared on-disk cache and
    /// the system compiler.
    pub fn with_defaults() -> Self {
        Self::new(BuildCoordinator::new())
    }

    /// Issue a fresh optimizer instance id, unique within this registry.
    pub fn issue_id(&self) -> InstanceId {
        InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Resolve a variant to a loaded handle, memoized by variant name.
    ///
    /// The handle table lock is held across a jit build, so concurrent
    /// callers of the same registry queue up instead of racing the
    /// cross-process coordinator from within one process.
    pub fn get_or_build(&self, variant: &KernelVariant) -> Result<KernelHandle> {
        let mut handles = self.lock_handles()?;
        if let Some(handle) = handles.get(variant.name()) {
            return Ok(Arc::clone(handle));
        }
        let handle: KernelHandle = match variant {
            KernelVariant::Builtin => Arc::new(NativeAdamKernel::new()),
            KernelVariant::Jit(spec) => self.coordinator.acquire(spec)?,
            KernelVariant::Custom(name) => {
                return Err(Error::Build {
                    reason: format!("no kernel registered under '{name}'"),
                })
            }
        };
        handles.insert(variant.name().to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Register an in-process handle under a name, for
    /// [`KernelVariant::Custom`] resolution.
    pub fn register(&self, name: impl Into<String>, handle: KernelHandle) -> Result<()> {
        let name = name.into();
        let mut handles = self.lock_handles()?;
        if handles.contains_key(&name) {
            return Err(Error::Kernel {
                reason: format!("kernel '{name}' is already registered"),
            });
        }
        handles.insert(name, handle);
        Ok(())
    }

    fn lock_handles(&self) -> Result<MutexGuard<'_, HashMap<String, KernelHandle>>> {
        self.handles.lock().map_err(|e| Error::Kernel {
            reason: format!("kernel registry mutex poisoned: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_ids_are_sequential() {
        let registry = KernelRegistry::with_defaults();
        assert_eq!(registry.issue_id().as_u64(), 0);
        assert_eq!(registry.issue_id().as_u64(), 1);
        assert_eq!(registry.issue_id().as_u64(), 2);
    }

    #[test]
    fn test_builtin_handle_is_memoized() {
        let registry = KernelRegistry::with_defaults();
        let first = registry.get_or_build(&KernelVariant::Builtin).unwrap();
        let second = registry.get_or_build(&KernelVariant::Builtin).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_custom_requires_registration() {
        let registry = KernelRegistry::with_defaults();
        let err = registry
            .get_or_build(&KernelVariant::Custom("avx-adam".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Build { .. }), "got {err:?}");
    }

    #[test]
    fn test_registered_handle_resolves() {
        let registry = KernelRegistry::with_defaults();
        let handle: KernelHandle = Arc::new(NativeAdamKernel::new());
        registry.register("avx-adam", Arc::clone(&handle)).unwrap();

        let resolved = registry
            .get_or_build(&KernelVariant::Custom("avx-adam".to_string()))
            .unwrap();
        assert!(Arc::ptr_eq(&handle, &resolved));
    }

    #[test]
    fn test_register_rejects_duplicate_name() {
        let registry = KernelRegistry::with_defaults();
        registry
            .register("avx-adam", Arc::new(NativeAdamKernel::new()) as KernelHandle)
            .unwrap();
        let err = registry
            .register("avx-adam", Arc::new(NativeAdamKernel::new()) as KernelHandle)
            .unwrap_err();
        assert!(matches!(err, Error::Kernel { .. }), "got {err:?}");
    }
}
