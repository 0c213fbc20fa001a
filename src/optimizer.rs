use std::collections::HashMap;

use log::{debug, trace};

use crate::{
    config::{HyperParams, NAdamWConfig},
    dispatch::{self, RuntimeCapabilities},
    error::{OptimErr, Result},
    kernel::UpdateSlot,
    state::{GroupRecord, ParamId, ParamState, ParamStateRecord, StateDict, StateStore},
    tensor::{Device, Grad, Tensor},
};

/// A trainable tensor and the gradient computed for it.
///
/// Cloning yields a new parameter with its own id, the clone starts without optimizer state.
#[derive(Debug)]
pub struct Parameter {
    id: ParamId,
    value: Tensor,
    grad: Option<Grad>,
}

impl Parameter {
    /// Creates a new `Parameter` without a gradient.
    ///
    /// # Arguments
    /// * `value` - The initial value of the parameter.
    ///
    /// # Returns
    /// A new `Parameter` with a fresh id.
    pub fn new(value: Tensor) -> Self {
        Self {
            id: ParamId::next(),
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

    pub fn grad(&self) -> Option<&Grad> {
        self.grad.as_ref()
    }

    pub fn set_grad(&mut self, grad: impl Into<Grad>) {
        self.grad = Some(grad.into());
    }

    /// Drops the gradient, the parameter is skipped by the next step.
    pub fn zero_grad(&mut self) {
        self.grad = None;
    }
}

impl Clone for Parameter {
    fn clone(&self) -> Self {
        Self {
            id: ParamId::next(),
            value: self.value.clone(),
            grad: self.grad.clone(),
        }
    }
}

/// A list of parameters sharing one set of hyperparameters.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    params: Vec<Parameter>,
    hyper: HyperParams,
}

impl ParamGroup {
    pub fn new(params: Vec<Parameter>, hyper: HyperParams) -> Self {
        Self { params, hyper }
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [Parameter] {
        &mut self.params
    }

    pub fn hyper(&self) -> &HyperParams {
        &self.hyper
    }

    pub fn hyper_mut(&mut self) -> &mut HyperParams {
        &mut self.hyper
    }
}

/// The NAdamW optimizer.
///
/// Holds the default hyperparameters, the runtime capabilities used to pick a kernel and
/// the state of every parameter it has updated. Parameters themselves stay with the caller
/// and are handed in, grouped, on every step.
#[derive(Debug)]
pub struct NAdamW {
    defaults: HyperParams,
    caps: RuntimeCapabilities,
    state: StateStore,
}

impl NAdamW {
    /// Creates a new `NAdamW` optimizer for the native runtime.
    ///
    /// # Arguments
    /// * `config` - The default hyperparameters.
    ///
    /// # Returns
    /// The optimizer or `InvalidConfig` if a hyperparameter is out of its domain.
    pub fn new(config: NAdamWConfig) -> Result<Self> {
        Self::with_capabilities(config, RuntimeCapabilities::native())
    }

    /// Creates a new `NAdamW` optimizer for a runtime with the given capabilities.
    pub fn with_capabilities(config: NAdamWConfig, caps: RuntimeCapabilities) -> Result<Self> {
        Ok(Self {
            defaults: HyperParams::try_from(config)?,
            caps,
            state: StateStore::new(),
        })
    }

    /// Groups `params` under the default hyperparameters.
    pub fn group(&self, params: Vec<Parameter>) -> ParamGroup {
        ParamGroup::new(params, self.defaults)
    }

    pub fn defaults(&self) -> &HyperParams {
        &self.defaults
    }

    pub fn capabilities(&self) -> RuntimeCapabilities {
        self.caps
    }

    /// The state of parameter `id`, if it has been updated at least once.
    pub fn state(&self, id: ParamId) -> Option<&ParamState> {
        self.state.get(id)
    }

    /// Drops the state of parameter `id`.
    pub fn forget(&mut self, id: ParamId) -> Option<ParamState> {
        self.state.remove(id)
    }

    /// Performs a single optimization step over every group.
    ///
    /// # Arguments
    /// * `groups` - The parameter groups, parameters without a gradient are skipped.
    ///
    /// # Returns
    /// An error if a group can't be updated, groups before it keep their update.
    pub fn step(&mut self, groups: &mut [ParamGroup]) -> Result<()> {
        for (index, group) in groups.iter_mut().enumerate() {
            trace!(group = index, params = group.params.len(); "stepping group");
            self.step_group(group)?;
        }

        Ok(())
    }

    /// Re-evaluates the loss through `closure` and then performs a step.
    ///
    /// # Returns
    /// The loss returned by the closure.
    pub fn step_with<F>(&mut self, groups: &mut [ParamGroup], closure: F) -> Result<f32>
    where
        F: FnOnce(&mut [ParamGroup]) -> f32,
    {
        let loss = closure(groups);
        self.step(groups)?;
        Ok(loss)
    }

    fn step_group(&mut self, group: &mut ParamGroup) -> Result<()> {
        let hyper = group.hyper;
        precheck(&group.params)?;

        let step_device = |param: &Tensor| {
            if hyper.capturable() {
                param.device()
            } else {
                Device::Cpu
            }
        };

        // The flag marks states created for this call, they are dropped if the update fails.
        let mut taken: Vec<(ParamId, ParamState, bool)> = Vec::new();
        let mut targets: Vec<(&mut Tensor, &Grad)> = Vec::new();

        for Parameter { id, value, grad } in group.params.iter_mut() {
            let Some(grad) = grad.as_ref() else {
                continue;
            };

            let (state, fresh) = match self.state.take(*id) {
                Some(state) => (state, false),
                None => (ParamState::zeros_like(value, step_device(value)), true),
            };

            taken.push((*id, state, fresh));
            targets.push((value, grad));
        }

        let mut slots: Vec<UpdateSlot<'_>> = targets
            .into_iter()
            .zip(taken.iter_mut())
            .map(|((param, grad), (_, state, _))| UpdateSlot {
                param,
                grad,
                exp_avg: &mut state.exp_avg,
                exp_avg_sq: &mut state.exp_avg_sq,
                step: &mut state.step,
            })
            .collect();

        let opts = hyper.update_options(self.defaults.lr());
        let res = dispatch::nadamw(&mut slots, hyper.foreach(), self.caps, &opts);
        drop(slots);

        for (id, state, fresh) in taken {
            if res.is_ok() || !fresh {
                self.state.insert(id, state);
            }
        }

        res
    }

    /// Captures the optimizer state and the hyperparameters of `groups`.
    ///
    /// Parameters are numbered by their position across `groups`.
    pub fn state_dict(&self, groups: &[ParamGroup]) -> StateDict {
        let mut dict = StateDict::default();
        let mut position = 0;

        for group in groups {
            let mut params = Vec::with_capacity(group.params.len());
            for param in &group.params {
                if let Some(state) = self.state.get(param.id) {
                    dict.state
                        .insert(position, ParamStateRecord::capture(state));
                }

                params.push(position);
                position += 1;
            }

            dict.param_groups.push(GroupRecord {
                config: group.hyper.to_config(),
                params,
            });
        }

        dict
    }

    /// Restores a checkpoint taken with `state_dict`.
    ///
    /// The groups must have the same layout as when the checkpoint was taken. Everything is
    /// validated before anything is replaced, on error neither the groups nor the state change.
    pub fn load_state_dict(&mut self, groups: &mut [ParamGroup], dict: StateDict) -> Result<()> {
        let StateDict {
            mut state,
            param_groups,
        } = dict;

        if groups.len() != param_groups.len() {
            return Err(OptimErr::ShapeMismatch {
                what: "param_groups",
                got: vec![param_groups.len()],
                expected: vec![groups.len()],
            });
        }

        let mut hypers = Vec::with_capacity(groups.len());
        let mut restored: HashMap<ParamId, ParamState> = HashMap::new();

        for (group, record) in groups.iter().zip(param_groups) {
            if group.params.len() != record.params.len() {
                return Err(OptimErr::ShapeMismatch {
                    what: "group params",
                    got: vec![record.params.len()],
                    expected: vec![group.params.len()],
                });
            }

            let hyper = HyperParams::try_from(record.config)?;

            for (param, position) in group.params.iter().zip(record.params) {
                let Some(record) = state.remove(&position) else {
                    continue;
                };

                let legacy_device = if hyper.capturable() {
                    param.value.device()
                } else {
                    Device::Cpu
                };

                let param_state = record.restore(legacy_device)?;
                check_restored(&param.value, &param_state)?;
                restored.insert(param.id, param_state);
            }

            hypers.push(hyper);
        }

        if let Some(position) = state.keys().next() {
            return Err(OptimErr::Serde(format!(
                "state for unknown parameter position {position}"
            )));
        }

        debug!(groups = groups.len(), states = restored.len(); "loading state dict");

        for (group, hyper) in groups.iter_mut().zip(hypers) {
            group.hyper = hyper;
            for param in &group.params {
                self.state.remove(param.id);
            }
        }

        for (id, param_state) in restored {
            self.state.insert(id, param_state);
        }

        Ok(())
    }
}

/// Rejects sparse gradients and gradients that don't match their parameter before any
/// state is touched.
fn precheck(params: &[Parameter]) -> Result<()> {
    let with_grad = params
        .iter()
        .filter_map(|p| p.grad.as_ref().map(|g| (&p.value, g)));

    for (index, (value, grad)) in with_grad.enumerate() {
        let Some(grad) = grad.dense() else {
            return Err(OptimErr::UnsupportedGradient { index });
        };

        if grad.is_complex() != value.is_complex() || grad.shape() != value.shape() {
            return Err(OptimErr::ShapeMismatch {
                what: "grad",
                got: grad.real_shape(),
                expected: value.real_shape(),
            });
        }
    }

    Ok(())
}

fn check_restored(param: &Tensor, state: &ParamState) -> Result<()> {
    for (what, moment) in [("exp_avg", &state.exp_avg), ("exp_avg_sq", &state.exp_avg_sq)] {
        if moment.is_complex() != param.is_complex() || moment.shape() != param.shape() {
            return Err(OptimErr::ShapeMismatch {
                what,
                got: moment.real_shape(),
                expected: param.real_shape(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(lr: f32) -> NAdamWConfig {
        NAdamWConfig {
            lr,
            weight_decay: 0.,
            ..NAdamWConfig::default()
        }
    }

    fn param(data: &[f32]) -> Parameter {
        Parameter::new(Tensor::from_vec(&[data.len()], data.to_vec()).unwrap())
    }

    fn grad(data: &[f32]) -> Tensor {
        Tensor::from_vec(&[data.len()], data.to_vec()).unwrap()
    }

    #[test]
    fn test_invalid_defaults_are_rejected() {
        assert!(matches!(
            NAdamW::new(config(-1.)),
            Err(OptimErr::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_state_is_created_lazily() {
        let mut optim = NAdamW::new(config(0.1)).unwrap();

        let mut with_grad = param(&[1.]);
        with_grad.set_grad(grad(&[1.]));
        let without_grad = param(&[1.]);
        let (a, b) = (with_grad.id(), without_grad.id());

        let mut groups = [optim.group(vec![with_grad, without_grad])];
        optim.step(&mut groups).unwrap();

        let state = optim.state(a).unwrap();
        assert_eq!(state.step.item(), Some(1.));
        assert_eq!(state.step.device(), Device::Cpu);
        assert!(optim.state(b).is_none());
        assert_eq!(groups[0].params()[1].value(), &grad(&[1.]));
    }

    #[test]
    fn test_capturable_step_lives_with_param() {
        let mut optim = NAdamW::new(NAdamWConfig {
            capturable: true,
            ..config(0.1)
        })
        .unwrap();

        let device = Device::Accelerator(0);
        let mut p = Parameter::new(grad(&[1.]).to_device(device));
        p.set_grad(grad(&[1.]));
        let id = p.id();

        let mut groups = [optim.group(vec![p])];
        optim.step(&mut groups).unwrap();

        assert_eq!(optim.state(id).unwrap().step.device(), device);
    }

    #[test]
    fn test_capturable_on_host_is_rejected_by_batched_kernel() {
        let mut optim = NAdamW::new(NAdamWConfig {
            capturable: true,
            foreach: Some(true),
            ..config(0.1)
        })
        .unwrap();

        let mut p = param(&[1.]);
        p.set_grad(grad(&[1.]));

        let id = p.id();

        let mut groups = [optim.group(vec![p])];
        let res = optim.step(&mut groups);
        assert!(matches!(res, Err(OptimErr::DevicePrecondition { index: 0 })));
        assert!(optim.state(id).is_none());
        assert!(optim.state_dict(&groups).state.is_empty());
    }

    #[test]
    fn test_rejected_group_keeps_existing_state() {
        let mut optim = NAdamW::new(NAdamWConfig {
            capturable: true,
            foreach: Some(true),
            ..config(0.1)
        })
        .unwrap();

        let mut stepped = Parameter::new(grad(&[1.]).to_device(Device::Accelerator(0)));
        stepped.set_grad(grad(&[1.]));
        let on_host = param(&[1.]);
        let (stepped_id, host_id) = (stepped.id(), on_host.id());

        let mut groups = [optim.group(vec![stepped, on_host])];
        optim.step(&mut groups).unwrap();

        groups[0].params_mut()[1].set_grad(grad(&[1.]));
        let res = optim.step(&mut groups);

        assert!(matches!(res, Err(OptimErr::DevicePrecondition { index: 1 })));
        assert!(optim.state(host_id).is_none());
        assert_eq!(optim.state(stepped_id).unwrap().step.item(), Some(1.));
    }

    #[test]
    fn test_clone_gets_its_own_state() {
        let mut optim = NAdamW::new(NAdamWConfig {
            foreach: Some(false),
            ..config(0.1)
        })
        .unwrap();

        let mut a = param(&[1.]);
        a.set_grad(grad(&[1.]));
        let b = a.clone();
        assert_ne!(a.id(), b.id());
        let (a_id, b_id) = (a.id(), b.id());

        let mut groups = [optim.group(vec![a, b])];
        for _ in 0..3 {
            optim.step(&mut groups).unwrap();
        }

        let params = groups[0].params();
        assert_eq!(params[0].value(), params[1].value());
        assert_eq!(optim.state(a_id).unwrap().step.item(), Some(3.));
        assert_eq!(optim.state(b_id).unwrap().step.item(), Some(3.));
    }

    #[test]
    fn test_sparse_gradient_leaves_everything_untouched() {
        let mut optim = NAdamW::new(config(0.1)).unwrap();

        let mut dense = param(&[1.]);
        dense.set_grad(grad(&[1.]));
        let mut sparse = param(&[1.]);
        sparse.set_grad(crate::tensor::SparseTensor::new(vec![1], vec![vec![0]], vec![1.]).unwrap());
        let dense_id = dense.id();

        let mut groups = [optim.group(vec![dense, sparse])];
        let res = optim.step(&mut groups);

        assert!(matches!(res, Err(OptimErr::UnsupportedGradient { index: 1 })));
        assert!(optim.state(dense_id).is_none());
        assert_eq!(groups[0].params()[0].value(), &grad(&[1.]));
    }

    #[test]
    fn test_step_with_runs_closure_first() {
        let mut optim = NAdamW::new(config(0.1)).unwrap();
        let mut groups = [optim.group(vec![param(&[1.])])];

        let loss = optim
            .step_with(&mut groups, |groups| {
                let p = &mut groups[0].params_mut()[0];
                p.set_grad(grad(&[1.]));
                0.5
            })
            .unwrap();

        assert_eq!(loss, 0.5);
        let id = groups[0].params()[0].id();
        assert_eq!(optim.state(id).unwrap().step.item(), Some(1.));
    }

    #[test]
    fn test_forget_resets_state() {
        let mut optim = NAdamW::new(config(0.1)).unwrap();
        let mut p = param(&[1.]);
        p.set_grad(grad(&[1.]));
        let id = p.id();

        let mut groups = [optim.group(vec![p])];
        optim.step(&mut groups).unwrap();
        optim.step(&mut groups).unwrap();
        assert_eq!(optim.state(id).unwrap().step.item(), Some(2.));

        assert!(optim.forget(id).is_some());
        optim.step(&mut groups).unwrap();
        assert_eq!(optim.state(id).unwrap().step.item(), Some(1.));
    }

    #[test]
    fn test_load_rejects_mismatched_layout() {
        let mut optim = NAdamW::new(config(0.1)).unwrap();
        let mut groups = [optim.group(vec![param(&[1.]), param(&[2.])])];

        let dict = StateDict {
            state: Default::default(),
            param_groups: vec![GroupRecord {
                config: config(0.1),
                params: vec![0],
            }],
        };

        assert!(matches!(
            optim.load_state_dict(&mut groups, dict),
            Err(OptimErr::ShapeMismatch { what: "group params", .. })
        ));
    }
}
