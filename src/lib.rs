//! NAdamW: Adam with a Nesterov lookahead moment and decoupled weight decay.
//!
//! On top of the plain update the optimizer supports cautious masking (only step where the
//! lookahead moment agrees in sign with the gradient), corrected weight decay scaled by
//! `lr² / max_lr`, maximization and a capturable mode whose update never reads a device
//! value back on the host.
//!
//! Updates run through either a per tensor kernel or a batched kernel built on list-wide
//! primitives, both compute the same values. `NAdamW` drives them over groups of
//! parameters, `dispatch::nadamw` is the functional entry point.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod foreach;
pub mod kernel;
pub mod optimizer;
pub mod state;
pub mod tensor;

pub use config::{HyperParams, NAdamWConfig};
pub use dispatch::RuntimeCapabilities;
pub use error::{OptimErr, Result};
pub use kernel::{CAUTION_MIN_SCALE, UpdateOptions, UpdateSlot};
pub use optimizer::{NAdamW, ParamGroup, Parameter};
pub use state::{ParamId, ParamState, StateDict};
pub use tensor::{Device, Grad, SparseTensor, Tensor};
