//! Dynamically loaded Adam kernels
//!
//! Wraps a compiled shared library behind [`AdamKernel`]. The library owns
//! all per-id optimizer state; this side validates tensor layout and
//! forwards raw f32 buffers across the C ABI. Nonzero status codes from the
//! library surface as kernel errors.

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::kernel::{AdamKernel, KernelHandle, validate_shape};
use crate::optimizer::AdamConfig;
use crate::registry::InstanceId;
use crate::tensor::Tensor;
use libloading::{Library, Symbol};
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `adam_create(id, lr, beta1, beta2, eps, weight_decay) -> status`
type AdamCreateFn = unsafe extern "C" fn(u64, f64, f64, f64, f64, f64) -> i32;

/// `adam_update(id, params, grads, exp_avg, exp_avg_sq, numel) -> status`
type AdamUpdateFn =
    unsafe extern "C" fn(u64, *mut f32, *const f32, *mut f32, *mut f32, usize) -> i32;

/// `adam_update_copy(id, params, grads, exp_avg, exp_avg_sq, numel, shadow) -> status`
type AdamUpdateCopyFn =
    unsafe extern "C" fn(u64, *mut f32, *const f32, *mut f32, *mut f32, usize, *mut u16) -> i32;

const SYM_CREATE: &[u8] = b"adam_create";
const SYM_UPDATE: &[u8] = b"adam_update";
const SYM_UPDATE_COPY: &[u8] = b"adam_update_copy";

/// Turns a compiled artifact on disk into a usable kernel handle.
///
/// The build coordinator calls this after a compilation finishes or after an
/// already-built artifact is found in the cache.
pub trait ArtifactLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<KernelHandle>;
}

/// Default loader backed by `libloading`.
pub struct DylibLoader;

impl ArtifactLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<KernelHandle> {
        Ok(Arc::new(DylibAdamKernel::open(path)?))
    }
}

/// An Adam kernel loaded from a shared library.
#[derive(Debug)]
pub struct DylibAdamKernel {
    library: Library,
    path: PathBuf,
}

impl DylibAdamKernel {
    /// Load a kernel library and verify it exports the full entry-point set.
    pub fn open(path: &Path) -> Result<Self> {
        let res = panic::catch_unwind(|| unsafe { Library::new(path) });
        let library = match res {
            Ok(lib) => lib.map_err(|e| Error::Build {
                reason: format!("failed to load kernel artifact {}: {e}", path.display()),
            })?,
            Err(_) => {
                return Err(Error::Build {
                    reason: format!("loader panicked while opening {}", path.display()),
                })
            }
        };
        let kernel = Self {
            library,
            path: path.to_path_buf(),
        };
        kernel.symbol::<AdamCreateFn>(SYM_CREATE)?;
        kernel.symbol::<AdamUpdateFn>(SYM_UPDATE)?;
        kernel.symbol::<AdamUpdateCopyFn>(SYM_UPDATE_COPY)?;
        Ok(kernel)
    }

    /// Path the library was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn symbol<T>(&self, name: &[u8]) -> Result<Symbol<'_, T>> {
        unsafe {
            self.library.get::<T>(name).map_err(|e| Error::Build {
                reason: format!(
                    "kernel artifact {} does not export {}: {e}",
                    self.path.display(),
                    String::from_utf8_lossy(name)
                ),
            })
        }
    }

    fn check_status(&self, what: &str, status: i32) -> Result<()> {
        if status != 0 {
            return Err(Error::Kernel {
                reason: format!(
                    "{what} returned status {status} from {}",
                    self.path.display()
                ),
            });
        }
        Ok(())
    }

    fn require_f32(&self, param: &Tensor) -> Result<()> {
        if param.dtype() != DType::F32 {
            return Err(Error::Shape {
                reason: format!(
                    "dynamically loaded kernels take f32 parameters, got {}",
                    param.dtype()
                ),
            });
        }
        Ok(())
    }
}

impl AdamKernel for DylibAdamKernel {
    fn create(&self, id: InstanceId, config: &AdamConfig) -> Result<()> {
        if config.amsgrad {
            return Err(Error::Config {
                name: "amsgrad",
                reason: "not carried across the native kernel boundary".to_string(),
            });
        }
        let create = self.symbol::<AdamCreateFn>(SYM_CREATE)?;
        let status = unsafe {
            create(
                id.as_u64(),
                config.lr,
                config.beta1,
                config.beta2,
                config.eps,
                config.weight_decay,
            )
        };
        self.check_status("adam_create", status)
    }

    fn update(
        &self,
        id: InstanceId,
        param: &mut Tensor,
        grad: &Tensor,
        exp_avg: &mut Tensor,
        exp_avg_sq: &mut Tensor,
    ) -> Result<()> {
        validate_shape(param, grad, "grad")?;
        validate_shape(param, exp_avg, "exp_avg")?;
        validate_shape(param, exp_avg_sq, "exp_avg_sq")?;
        self.require_f32(param)?;

        let numel = param.numel();
        let update = self.symbol::<AdamUpdateFn>(SYM_UPDATE)?;
        let status = unsafe {
            update(
                id.as_u64(),
                param.as_f32_mut()?.as_mut_ptr(),
                grad.as_f32()?.as_ptr(),
                exp_avg.as_f32_mut()?.as_mut_ptr(),
                exp_avg_sq.as_f32_mut()?.as_mut_ptr(),
                numel,
            )
        };
        self.check_status("adam_update", status)
    }

    fn update_with_copy(
        &self,
        id: InstanceId,
        param: &mut Tensor,
        grad: &Tensor,
        exp_avg: &mut Tensor,
        exp_avg_sq: &mut Tensor,
        shadow_out: &mut Tensor,
    ) -> Result<()> {
        validate_shape(param, grad, "grad")?;
        validate_shape(param, exp_avg, "exp_avg")?;
        validate_shape(param, exp_avg_sq, "exp_avg_sq")?;
        validate_shape(param, shadow_out, "shadow_out")?;
        self.require_f32(param)?;
        if shadow_out.dtype() != DType::F16 {
            return Err(Error::Shape {
                reason: format!(
                    "f32 parameters take f16 shadows, got {}",
                    shadow_out.dtype()
                ),
            });
        }

        let numel = param.numel();
        let update_copy = self.symbol::<AdamUpdateCopyFn>(SYM_UPDATE_COPY)?;
        // half::f16 is repr(transparent) over u16.
        let shadow_ptr = shadow_out.as_f16_mut()?.as_mut_ptr() as *mut u16;
        let status = unsafe {
            update_copy(
                id.as_u64(),
                param.as_f32_mut()?.as_mut_ptr(),
                grad.as_f32()?.as_ptr(),
                exp_avg.as_f32_mut()?.as_mut_ptr(),
                exp_avg_sq.as_f32_mut()?.as_mut_ptr(),
                numel,
                shadow_ptr,
            )
        };
        self.check_status("adam_update_copy", status)
    }
}
