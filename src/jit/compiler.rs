//! Kernel build descriptions and the system compiler
//!
//! A [`KernelSpec`] names a variant and lists its sources and flags; the
//! [`KernelCompiler`] trait turns one into a shared library. The default
//! implementation shells out to the system C compiler.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Flags forwarded to the compiler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileFlags {
    /// Optimization level, as in `-O3`.
    pub opt_level: u8,
    /// Values for `-march=`.
    pub target_archs: Vec<String>,
    /// Enables `-ffast-math`.
    pub fast_math: bool,
    /// Extra `-D` defines, each as `NAME` or `NAME=VALUE`.
    pub defines: Vec<String>,
}

impl Default for CompileFlags {
    fn default() -> Self {
        Self {
            opt_level: 3,
            target_archs: vec!["native".to_string()],
            fast_math: true,
            defines: Vec::new(),
        }
    }
}

impl CompileFlags {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![format!("-O{}", self.opt_level)];
        for arch in &self.target_archs {
            args.push(format!("-march={arch}"));
        }
        if self.fast_math {
            args.push("-ffast-math".to_string());
        }
        for define in &self.defines {
            args.push(format!("-D{define}"));
        }
        args
    }
}

/// Everything needed to build one kernel variant from source.
///
/// The name doubles as the cache key: variants with the same name share a
/// build directory and artifact across processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelSpec {
    pub name: String,
    /// Source files handed to the compiler.
    pub sources: Vec<PathBuf>,
    /// Extra include directories.
    pub include_dirs: Vec<PathBuf>,
    pub flags: CompileFlags,
}

impl KernelSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            include_dirs: Vec::new(),
            flags: CompileFlags::default(),
        }
    }

    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.sources.push(path.into());
        self
    }

    pub fn with_include_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.include_dirs.push(path.into());
        self
    }

    pub fn with_flags(mut self, flags: CompileFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Compiles a kernel spec into a shared library at `out`.
pub trait KernelCompiler: Send + Sync {
    fn compile(&self, spec: &KernelSpec, out: &Path) -> Result<()>;
}

/// Shells out to the system C compiler: `$CC` when set, `cc` otherwise.
pub struct SystemCompiler;

impl SystemCompiler {
    fn command_name() -> String {
        env::var("CC").unwrap_or_else(|_| "cc".to_string())
    }
}

impl KernelCompiler for SystemCompiler {
    fn compile(&self, spec: &KernelSpec, out: &Path) -> Result<()> {
        if spec.sources.is_empty() {
            return Err(Error::Build {
                reason: format!("kernel '{}' lists no sources", spec.name),
            });
        }

        let compiler = Self::command_name();
        let mut cmd = Command::new(&compiler);
        cmd.arg("-shared").arg("-fPIC");
        cmd.args(spec.flags.to_args());
        for dir in &spec.include_dirs {
            cmd.arg("-I").arg(dir);
        }
        cmd.arg("-o").arg(out);
        cmd.args(&spec.sources);

        let output = cmd.output().map_err(|e| Error::Build {
            reason: format!("failed to launch {compiler}: {e}"),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Build {
                reason: format!(
                    "{compiler} failed for kernel '{}': {}",
                    spec.name,
                    stderr.trim()
                ),
            });
        }
        Ok(())
    }
}
