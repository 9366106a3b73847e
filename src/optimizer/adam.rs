//! CPU Adam driver
//!
//! Owns parameter groups and per-parameter state, and drives a kernel
//! handle resolved through the registry. The arithmetic itself lives
//! behind [`AdamKernel`](crate::kernel::AdamKernel); this side decides
//! which parameters update, tracks their step counts, and keeps moment
//! buffers congruent with their parameters.

use crate::error::{Error, Result};
use crate::grad_mode::enable_grad;
use crate::kernel::{KernelHandle, KernelVariant};
use crate::param::{ParamId, Parameter};
use crate::registry::{InstanceId, KernelRegistry};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Adam hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
    pub amsgrad: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            amsgrad: false,
        }
    }
}

impl AdamConfig {
    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_amsgrad(mut self, amsgrad: bool) -> Self {
        self.amsgrad = amsgrad;
        self
    }

    /// Reject out-of-range hyperparameters. NaN fails every check.
    pub fn validate(&self) -> Result<()> {
        if !(self.lr >= 0.0) {
            return Err(Error::Config {
                name: "lr",
                reason: format!("must be non-negative, got {}", self.lr),
            });
        }
        if !(0.0..1.0).contains(&self.beta1) {
            return Err(Error::Config {
                name: "beta1",
                reason: format!("must lie in [0, 1), got {}", self.beta1),
            });
        }
        if !(0.0..1.0).contains(&self.beta2) {
            return Err(Error::Config {
                name: "beta2",
                reason: format!("must lie in [0, 1), got {}", self.beta2),
            });
        }
        if !(self.eps >= 0.0) {
            return Err(Error::Config {
                name: "eps",
                reason: format!("must be non-negative, got {}", self.eps),
            });
        }
        if !(self.weight_decay >= 0.0) {
            return Err(Error::Config {
                name: "weight_decay",
                reason: format!("must be non-negative, got {}", self.weight_decay),
            });
        }
        Ok(())
    }
}

/// A set of parameters updated together.
///
/// A group may carry its own config; it is validated and kept for
/// inspection, while updates apply the instance config registered with the
/// kernel at create time. Groups built without a config take the instance
/// config when the optimizer is constructed.
#[derive(Debug)]
pub struct ParamGroup {
    params: Vec<Parameter>,
    config: Option<AdamConfig>,
}

impl ParamGroup {
    pub fn new(params: Vec<Parameter>) -> Self {
        Self {
            params,
            config: None,
        }
    }

    pub fn with_config(params: Vec<Parameter>, config: AdamConfig) -> Self {
        Self {
            params,
            config: Some(config),
        }
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    pub fn config(&self) -> Option<&AdamConfig> {
        self.config.as_ref()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Per-parameter optimizer state
///
/// Created lazily the first time a parameter shows up with a gradient, so
/// parameters that never receive one cost nothing.
#[derive(Debug, Clone)]
pub struct ParamState {
    step: u64,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

impl ParamState {
    fn zeros_like(param: &Tensor) -> Self {
        Self {
            step: 0,
            exp_avg: Tensor::zeros_like(param),
            exp_avg_sq: Tensor::zeros_like(param),
        }
    }

    /// Number of updates this parameter has received.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn exp_avg(&self) -> &Tensor {
        &self.exp_avg
    }

    pub fn exp_avg_sq(&self) -> &Tensor {
        &self.exp_avg_sq
    }
}

/// CPU Adam optimizer instance.
///
/// Holds an id issued by the registry and the kernel handle that id was
/// registered with. Parameters without gradients are skipped, and a step is
/// not atomic: if an update fails partway through, earlier parameters in
/// declaration order keep their new values.
#[derive(Debug)]
pub struct CpuAdam {
    id: InstanceId,
    kernel: KernelHandle,
    config: AdamConfig,
    groups: Vec<ParamGroup>,
    state: HashMap<ParamId, ParamState>,
}

impl CpuAdam {
    /// Single-group optimizer backed by the builtin kernel.
    pub fn new(
        registry: &KernelRegistry,
        params: Vec<Parameter>,
        config: AdamConfig,
    ) -> Result<Self> {
        Self::with_groups(
            registry,
            KernelVariant::Builtin,
            vec![ParamGroup::new(params)],
            config,
        )
    }

    /// Optimizer over explicit parameter groups and an explicit kernel
    /// variant.
    ///
    /// Validates the instance config and every group config, fills
    /// config-less groups with the instance config, resolves the kernel
    /// through the registry, and registers a fresh instance id with it
    /// before any update can run.
    pub fn with_groups(
        registry: &KernelRegistry,
        variant: KernelVariant,
        mut groups: Vec<ParamGroup>,
        config: AdamConfig,
    ) -> Result<Self> {
        config.validate()?;
        for group in &mut groups {
            match group.config() {
                Some(group_config) => group_config.validate()?,
                None => group.config = Some(config.clone()),
            }
        }

        let kernel = registry.get_or_build(&variant)?;
        let id = registry.issue_id();
        kernel.create(id, &config)?;

        Ok(Self {
            id,
            kernel,
            config,
            groups,
            state: HashMap::new(),
        })
    }

    /// One optimizer step over every gradient-bearing parameter.
    ///
    /// Always answers `None`: there is no loss without a closure.
    pub fn step(&mut self) -> Result<Option<f64>> {
        self.update_params(None)?;
        Ok(None)
    }

    /// Re-evaluate the loss under gradient mode, then step.
    ///
    /// The closure sees the parameter groups and is expected to refresh
    /// their gradients; it runs with gradient tracking forced on even
    /// inside a `no_grad` region. Answers the recomputed loss.
    pub fn step_with<F>(&mut self, closure: F) -> Result<Option<f64>>
    where
        F: FnOnce(&mut [ParamGroup]) -> Result<f64>,
    {
        let loss = enable_grad(|| closure(&mut self.groups))?;
        self.update_params(None)?;
        Ok(Some(loss))
    }

    /// Step and refresh reduced-precision shadow parameters in one pass.
    ///
    /// `shadows` mirrors the group layout: one shadow tensor per parameter,
    /// in declaration order. Updated parameters write their shadow through
    /// the kernel's copy entry point; parameters skipped for missing
    /// gradients leave theirs untouched.
    pub fn step_with_shadow(&mut self, shadows: &mut [Vec<Tensor>]) -> Result<Option<f64>> {
        if shadows.len() != self.groups.len() {
            return Err(Error::Shape {
                reason: format!(
                    "shadow group count {} does not match parameter group count {}",
                    shadows.len(),
                    self.groups.len()
                ),
            });
        }
        for (index, (group, shadow_group)) in
            self.groups.iter().zip(shadows.iter()).enumerate()
        {
            if shadow_group.len() != group.len() {
                return Err(Error::Shape {
                    reason: format!(
                        "group {index} has {} shadow tensors for {} parameters",
                        shadow_group.len(),
                        group.len()
                    ),
                });
            }
        }
        self.update_params(Some(shadows))?;
        Ok(None)
    }

    fn update_params(&mut self, mut shadows: Option<&mut [Vec<Tensor>]>) -> Result<()> {
        for (group_index, group) in self.groups.iter_mut().enumerate() {
            for (param_index, param) in group.params_mut().iter_mut().enumerate() {
                let id = param.id();
                let (value, grad) = param.value_and_grad();
                let Some(grad) = grad else { continue };

                let state = self
                    .state
                    .entry(id)
                    .or_insert_with(|| ParamState::zeros_like(value));
                validate_update(value, grad, state)?;

                match shadows.as_deref_mut() {
                    Some(shadow_groups) => {
                        let shadow = &mut shadow_groups[group_index][param_index];
                        self.kernel.update_with_copy(
                            self.id,
                            value,
                            grad,
                            &mut state.exp_avg,
                            &mut state.exp_avg_sq,
                            shadow,
                        )?;
                    }
                    None => {
                        self.kernel.update(
                            self.id,
                            value,
                            grad,
                            &mut state.exp_avg,
                            &mut state.exp_avg_sq,
                        )?;
                    }
                }
                state.step += 1;
            }
        }
        Ok(())
    }

    /// Id this instance registered with its kernel.
    pub fn instance_id(&self) -> InstanceId {
        self.id
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    /// State for one parameter, if it has been updated at least once.
    pub fn state(&self, id: ParamId) -> Option<&ParamState> {
        self.state.get(&id)
    }
}

fn validate_update(param: &Tensor, grad: &Tensor, state: &ParamState) -> Result<()> {
    if grad.shape() != param.shape() || grad.dtype() != param.dtype() {
        return Err(Error::Shape {
            reason: format!(
                "gradient of shape {:?} ({}) does not fit a parameter of shape {:?} ({})",
                grad.shape(),
                grad.dtype(),
                param.shape(),
                param.dtype()
            ),
        });
    }
    if state.exp_avg.shape() != param.shape() || state.exp_avg.dtype() != param.dtype() {
        return Err(Error::Shape {
            reason: format!(
                "optimizer state of shape {:?} ({}) cannot serve a parameter of \
                 shape {:?} ({})",
                state.exp_avg.shape(),
                state.exp_avg.dtype(),
                param.shape(),
                param.dtype()
            ),
        });
    }
    Ok(())
}
