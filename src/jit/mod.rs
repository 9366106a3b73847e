//! On-demand kernel builds
//!
//! Compiles kernel variants lazily, the first time a process asks for one,
//! and shares the result through an on-disk cache that also serializes the
//! build across processes. Split into the cache layout ([`cache`]), the
//! compiler invocation ([`compiler`]), and the cross-process coordination
//! protocol ([`coordinator`]).

pub mod cache;
pub mod compiler;
pub mod coordinator;

pub use cache::{CACHE_ENV_VAR, ClaimRecord, default_cache_root, marker_age, VariantCache};
pub use compiler::{CompileFlags, KernelCompiler, KernelSpec, SystemCompiler};
pub use coordinator::{BuildCoordinator, WaitPolicy};
