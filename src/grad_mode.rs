//! Thread-local gradient-tracking mode
//!
//! Callers that compute gradients consult [`is_grad_enabled`] to decide
//! whether to record backward information. The mode defaults to enabled and
//! is scoped per thread; [`no_grad`] and [`enable_grad`] flip it for the
//! duration of a closure and restore the previous value afterwards, even if
//! the closure panics.

use std::cell::Cell;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether gradient tracking is enabled on the current thread.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

/// Run `f` with gradient tracking disabled.
pub fn no_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ModeGuard::set(false);
    f()
}

/// Run `f` with gradient tracking forced on, regardless of the surrounding
/// mode. Used by the optimizer to evaluate loss closures.
pub fn enable_grad<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ModeGuard::set(true);
    f()
}

struct ModeGuard {
    prev: bool,
}

impl ModeGuard {
    fn set(enabled: bool) -> Self {
        let prev = GRAD_ENABLED.with(|g| g.replace(enabled));
        ModeGuard { prev }
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        GRAD_ENABLED.with(|g| g.set(prev));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_enabled() {
        assert!(is_grad_enabled());
    }

    #[test]
    fn test_no_grad_scopes_and_restores() {
        assert!(is_grad_enabled());
        no_grad(|| {
            assert!(!is_grad_enabled());
        });
        assert!(is_grad_enabled());
    }

    #[test]
    fn test_enable_grad_overrides_no_grad() {
        no_grad(|| {
            assert!(!is_grad_enabled());
            enable_grad(|| {
                assert!(is_grad_enabled());
            });
            assert!(!is_grad_enabled());
        });
    }

    #[test]
    fn test_nesting_restores_each_level() {
        no_grad(|| {
            no_grad(|| {
                assert!(!is_grad_enabled());
            });
            assert!(!is_grad_enabled());
        });
        assert!(is_grad_enabled());
    }

    #[test]
    fn test_mode_restored_after_panic() {
        let result = std::panic::catch_unwind(|| {
            no_grad(|| {
                panic!("boom");
            })
        });
        assert!(result.is_err());
        assert!(is_grad_enabled());
    }
}
