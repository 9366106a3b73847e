//! stepr error types

/// stepr result type
pub type Result<T> = std::result::Result<T, Error>;

/// stepr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Kernel compilation failed, a built artifact could not be loaded, or
    /// the cross-process build protocol cannot make progress
    #[error("build error: {reason}")]
    Build {
        /// Description of what went wrong
        reason: String,
    },

    /// Parameter and a companion buffer disagree in shape or precision
    #[error("shape mismatch: {reason}")]
    Shape {
        /// Description of the mismatch
        reason: String,
    },

    /// Invalid hyperparameter value
    #[error("invalid hyperparameter '{name}': {reason}")]
    Config {
        /// Hyperparameter name
        name: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Contract violation at the kernel boundary
    #[error("kernel error: {reason}")]
    Kernel {
        /// Description of what went wrong
        reason: String,
    },
}
