use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicU64, Ordering},
};

use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::{
    config::NAdamWConfig,
    error::{OptimErr, Result},
    tensor::{Device, Storage, Tensor},
};

/// A process unique identifier of a parameter, stable for the parameter's whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);

impl ParamId {
    /// Allocates a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The per parameter optimizer state.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamState {
    /// Number of updates applied so far, a zero-dimensional real tensor.
    pub step: Tensor,
    /// First moment, same shape and kind as the parameter.
    pub exp_avg: Tensor,
    /// Second moment, same shape and kind as the parameter.
    pub exp_avg_sq: Tensor,
}

impl ParamState {
    /// Creates the zeroed state of `param`.
    ///
    /// # Arguments
    /// * `param` - The parameter the moments mirror, they're placed on its device.
    /// * `step_device` - Where the step counter lives.
    pub fn zeros_like(param: &Tensor, step_device: Device) -> Self {
        Self {
            step: Tensor::scalar(0.).to_device(step_device),
            exp_avg: param.zeros_like(),
            exp_avg_sq: param.zeros_like(),
        }
    }
}

/// Every parameter's state, keyed by parameter.
#[derive(Debug, Default)]
pub struct StateStore {
    states: HashMap<ParamId, ParamState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ParamId) -> Option<&ParamState> {
        self.states.get(&id)
    }

    pub fn contains(&self, id: ParamId) -> bool {
        self.states.contains_key(&id)
    }

    /// Removes the state of `id` so it can be mutated alongside its parameter.
    pub fn take(&mut self, id: ParamId) -> Option<ParamState> {
        self.states.remove(&id)
    }

    pub fn insert(&mut self, id: ParamId, state: ParamState) {
        self.states.insert(id, state);
    }

    pub fn remove(&mut self, id: ParamId) -> Option<ParamState> {
        self.states.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// The serialized form of a `Tensor`.
///
/// Complex tensors store their elements as interleaved `[re, im]` pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    #[serde(default)]
    pub complex: bool,
    #[serde(default)]
    pub device: Device,
    pub data: Vec<f32>,
}

impl TensorRecord {
    pub fn capture(tensor: &Tensor) -> Self {
        let data = match tensor.storage() {
            Storage::Real(a) => a.iter().copied().collect(),
            Storage::Complex(a) => a.iter().flat_map(|c| [c.re, c.im]).collect(),
        };

        Self {
            shape: tensor.shape().to_vec(),
            complex: tensor.is_complex(),
            device: tensor.device(),
            data,
        }
    }

    pub fn into_tensor(self) -> Result<Tensor> {
        let tensor = if self.complex {
            if self.data.len() % 2 != 0 {
                return Err(OptimErr::Layout(format!(
                    "odd number of values ({}) for a complex tensor",
                    self.data.len()
                )));
            }

            let data = self
                .data
                .chunks_exact(2)
                .map(|pair| Complex32::new(pair[0], pair[1]))
                .collect();

            Tensor::from_complex_vec(&self.shape, data)?
        } else {
            Tensor::from_vec(&self.shape, self.data)?
        };

        Ok(tensor.to_device(self.device))
    }
}

/// A persisted step counter.
///
/// Older checkpoints stored the step as a plain number, those are still accepted and
/// upgraded to a scalar cell when restored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepRecord {
    Cell(TensorRecord),
    Legacy(f64),
}

impl StepRecord {
    /// Restores the step counter as a zero-dimensional real tensor on `device`.
    ///
    /// A legacy number keeps its value, a record with any other shape is an error.
    pub fn into_cell(self, device: Device) -> Result<Tensor> {
        match self {
            StepRecord::Legacy(step) => Ok(Tensor::scalar(step as f32).to_device(device)),
            StepRecord::Cell(record) => {
                let step = record.into_tensor()?;
                if step.is_scalar_cell() {
                    Ok(step)
                } else {
                    Err(OptimErr::ShapeMismatch {
                        what: "step",
                        got: step.real_shape(),
                        expected: vec![],
                    })
                }
            }
        }
    }
}

/// The persisted state of one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamStateRecord {
    pub step: StepRecord,
    pub exp_avg: TensorRecord,
    pub exp_avg_sq: TensorRecord,
}

impl ParamStateRecord {
    pub fn capture(state: &ParamState) -> Self {
        Self {
            step: StepRecord::Cell(TensorRecord::capture(&state.step)),
            exp_avg: TensorRecord::capture(&state.exp_avg),
            exp_avg_sq: TensorRecord::capture(&state.exp_avg_sq),
        }
    }

    /// Rebuilds the live state, upgrading a legacy step to a cell on `legacy_step_device`.
    pub fn restore(self, legacy_step_device: Device) -> Result<ParamState> {
        Ok(ParamState {
            step: self.step.into_cell(legacy_step_device)?,
            exp_avg: self.exp_avg.into_tensor()?,
            exp_avg_sq: self.exp_avg_sq.into_tensor()?,
        })
    }
}

/// The persisted hyperparameters of one group and the positions of its parameters.
///
/// Fields missing from older checkpoints, `caution` and `corrected_weight_decay` among
/// them, take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    #[serde(flatten)]
    pub config: NAdamWConfig,
    pub params: Vec<usize>,
}

/// A complete optimizer checkpoint.
///
/// Parameters are identified by their position across all groups, in group order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    pub state: BTreeMap<usize, ParamStateRecord>,
    pub param_groups: Vec<GroupRecord>,
}

impl StateDict {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
