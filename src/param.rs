//! Trainable parameters
//!
//! A parameter couples a stable identity (used to key per-parameter
//! optimizer state) with a value buffer and an optional gradient buffer.
//! The gradient is attached by whatever computes it and consumed in place
//! by the optimizer; it is never cleared implicitly.

use crate::dtype::DType;
use crate::tensor::Tensor;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Stable parameter identity for state-map keying.
///
/// Issued from a process-wide counter; never reused within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);

impl ParamId {
    fn fresh() -> Self {
        ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// A trainable parameter: identity, value buffer, optional gradient.
///
/// Not `Clone`: a copy would share the identity that keys optimizer state.
#[derive(Debug)]
pub struct Parameter {
    id: ParamId,
    value: Tensor,
    grad: Option<Tensor>,
}

impl Parameter {
    /// Wrap a value tensor as a parameter with a fresh identity.
    pub fn new(value: Tensor) -> Self {
        Self {
            id: ParamId::fresh(),
            value,
            grad: None,
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    pub fn shape(&self) -> &[usize] {
        self.value.shape()
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    /// Attach a gradient buffer. Congruence with the value is checked by
    /// the optimizer at step time, not here.
    pub fn set_grad(&mut self, grad: Tensor) {
        self.grad = Some(grad);
    }

    pub fn clear_grad(&mut self) {
        self.grad = None;
    }

    /// Split borrow used by the update walk: mutable value alongside the
    /// read-only gradient.
    pub fn value_and_grad(&mut self) -> (&mut Tensor, Option<&Tensor>) {
        (&mut self.value, self.grad.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_ids_are_unique() {
        let a = Parameter::new(Tensor::from_f32(&[1.0], &[1]));
        let b = Parameter::new(Tensor::from_f32(&[1.0], &[1]));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_grad_set_and_clear() {
        let mut p = Parameter::new(Tensor::from_f32(&[1.0, 2.0], &[2]));
        assert!(p.grad().is_none());

        p.set_grad(Tensor::from_f32(&[0.1, 0.2], &[2]));
        assert!(p.grad().is_some());

        p.clear_grad();
        assert!(p.grad().is_none());
    }

    #[test]
    fn test_value_and_grad_split_borrow() {
        let mut p = Parameter::new(Tensor::from_f32(&[1.0], &[1]));
        p.set_grad(Tensor::from_f32(&[0.5], &[1]));

        let (value, grad) = p.value_and_grad();
        value.as_f32_mut().unwrap()[0] = 2.0;
        assert_eq!(grad.unwrap().as_f32().unwrap()[0], 0.5);
    }
}
