//! Kernel boundary
//!
//! The trait every Adam kernel implements, plus the variant descriptor the
//! registry resolves into a loaded handle. Drivers see nothing below this
//! boundary: the arithmetic, its precision tricks, and its parallelism all
//! belong to the implementation.

pub mod dylib;
pub mod native;

pub use dylib::{ArtifactLoader, DylibAdamKernel, DylibLoader};
pub use native::NativeAdamKernel;

use crate::error::{Error, Result};
use crate::jit::KernelSpec;
use crate::optimizer::AdamConfig;
use crate::registry::InstanceId;
use crate::tensor::Tensor;
use std::fmt;
use std::sync::Arc;

/// Process-wide shared handle to a kernel implementation.
pub type KernelHandle = Arc<dyn AdamKernel>;

/// Adam update kernel, the external numeric boundary.
///
/// A kernel keys its own per-id state: hyperparameters registered through
/// [`create`](AdamKernel::create) and whatever internal bookkeeping its
/// recurrence needs. Drivers register each optimizer instance exactly once
/// and then issue one update call per gradient-bearing parameter per step.
///
/// All buffers are caller-owned host tensors; `param`, `exp_avg`, and
/// `exp_avg_sq` are updated in place.
pub trait AdamKernel: Send + Sync {
    /// Register per-id state for an optimizer instance.
    ///
    /// Must be called exactly once per id, strictly before any update call
    /// referencing that id.
    fn create(&self, id: InstanceId, config: &AdamConfig) -> Result<()>;

    /// One bias-corrected Adam step, in place.
    ///
    /// Algorithm (per element):
    /// ```text
    /// g = grad + weight_decay * param      (if weight_decay > 0)
    /// exp_avg    = beta1 * exp_avg    + (1 - beta1) * g
    /// exp_avg_sq = beta2 * exp_avg_sq + (1 - beta2) * g^2
    /// m_hat = exp_avg    / (1 - beta1^t)
    /// v_hat = exp_avg_sq / (1 - beta2^t)
    /// param = param - lr * m_hat / (sqrt(v_hat) + eps)
    /// ```
    ///
    /// All four buffers must share the parameter's shape and dtype.
    fn update(
        &self,
        id: InstanceId,
        param: &mut Tensor,
        grad: &Tensor,
        exp_avg: &mut Tensor,
        exp_avg_sq: &mut Tensor,
    ) -> Result<()>;

    /// Identical to [`update`](AdamKernel::update), plus writes a
    /// reduced-precision mirror of the updated parameter into `shadow_out`.
    ///
    /// `shadow_out` must share the parameter's shape; its dtype is the
    /// narrow companion of the parameter's (f16 for f32 parameters, f32
    /// for f64 parameters).
    fn update_with_copy(
        &self,
        id: InstanceId,
        param: &mut Tensor,
        grad: &Tensor,
        exp_avg: &mut Tensor,
        exp_avg_sq: &mut Tensor,
        shadow_out: &mut Tensor,
    ) -> Result<()>;
}

impl fmt::Debug for dyn AdamKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn AdamKernel>")
    }
}

/// Selects which kernel implementation backs an optimizer instance.
#[derive(Debug, Clone)]
pub enum KernelVariant {
    /// The bundled, build-time-linked CPU kernel.
    Builtin,
    /// A kernel compiled on demand from the given sources and loaded from
    /// the shared build cache.
    Jit(KernelSpec),
    /// A handle registered in-process under this name via
    /// [`KernelRegistry::register`](crate::registry::KernelRegistry::register).
    Custom(String),
}

impl KernelVariant {
    /// Cache key for the registry and the build-cache directory name.
    pub fn name(&self) -> &str {
        match self {
            KernelVariant::Builtin => "cpu-adam-builtin",
            KernelVariant::Jit(spec) => &spec.name,
            KernelVariant::Custom(name) => name,
        }
    }
}

/// Reject update buffers whose shape differs from the parameter's.
pub(crate) fn validate_shape(param: &Tensor, other: &Tensor, what: &str) -> Result<()> {
    if param.shape() != other.shape() {
        return Err(Error::Shape {
            reason: format!(
                "{} shape {:?} does not match parameter shape {:?}",
                what,
                other.shape(),
                param.shape()
            ),
        });
    }
    Ok(())
}
