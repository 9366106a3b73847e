//! # stepr
//!
//! **Lazy native-kernel loading and a CPU Adam optimizer driver.**
//!
//! stepr keeps optimizer arithmetic behind a narrow kernel boundary. The
//! driver owns parameters, gradients, and per-parameter state; the kernel
//! owns the update math. Kernels are either linked into the binary or
//! compiled on first use and shared through an on-disk cache that
//! serializes the build across processes.
//!
//! ## Layering
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  CpuAdam            (groups, lazy state)      │
//! ├───────────────────────────────────────────────┤
//! │  KernelRegistry     (memoized handles, ids)   │
//! ├───────────────────────────────────────────────┤
//! │  BuildCoordinator   (markers, at-most-once)   │
//! ├───────────────────────────────────────────────┤
//! │  AdamKernel         (builtin | dylib)         │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Kernel trait boundary**: builtin and dynamically loaded kernels are
//!   interchangeable behind [`AdamKernel`](kernel::AdamKernel)
//! - **Explicit registry**: handles and instance ids come from a
//!   [`KernelRegistry`] the caller owns, not from process-global statics
//! - **Filesystem coordination**: `started`/`done` markers in a shared
//!   cache give at-most-once compilation across unrelated processes
//! - **Lazy state**: moment buffers appear the first time a parameter
//!   carries a gradient

pub mod dtype;
pub mod error;
pub mod grad_mode;
pub mod jit;
pub mod kernel;
pub mod optimizer;
pub mod param;
pub mod registry;
pub mod tensor;

// Re-export the types most callers need
pub use dtype::DType;
pub use error::{Error, Result};
pub use grad_mode::{enable_grad, is_grad_enabled, no_grad};
pub use jit::{BuildCoordinator, CompileFlags, KernelSpec, WaitPolicy};
pub use kernel::{AdamKernel, KernelHandle, KernelVariant};
pub use optimizer::{AdamConfig, CpuAdam, ParamGroup, ParamState};
pub use param::{ParamId, Parameter};
pub use registry::{InstanceId, KernelRegistry};
pub use tensor::{Tensor, TensorData};
