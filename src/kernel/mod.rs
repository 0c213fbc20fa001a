mod multi;
mod single;

use ndarray::{ArrayD, ArrayViewD, Zip};

use crate::tensor::{Grad, Tensor};

pub(crate) use multi::multi_tensor_nadamw;
pub(crate) use single::single_tensor_nadamw;

/// Lower bound of the caution mask scale, keeps a rarely agreeing mask from blowing up the update.
pub const CAUTION_MIN_SCALE: f32 = 1e-3;

/// Everything one parameter contributes to an update: the parameter, its gradient and its state.
///
/// The slot only borrows, the caller keeps ownership of every tensor.
#[derive(Debug)]
pub struct UpdateSlot<'a> {
    pub param: &'a mut Tensor,
    pub grad: &'a Grad,
    pub exp_avg: &'a mut Tensor,
    pub exp_avg_sq: &'a mut Tensor,
    pub step: &'a mut Tensor,
}

/// The resolved hyperparameters of a single update call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateOptions {
    pub beta1: f32,
    pub beta2: f32,
    pub lr: f32,
    pub weight_decay: f32,
    pub eps: f32,
    pub caution: bool,
    pub maximize: bool,
    pub capturable: bool,
    /// Peak learning rate, only set when corrected weight decay is enabled.
    pub max_lr: Option<f32>,
}

impl UpdateOptions {
    /// The learning rate the weight decay is scaled by, `lr` or `lr² / max_lr`.
    pub fn wd_scale(&self) -> f32 {
        match self.max_lr {
            Some(max_lr) => self.lr.powi(2) / max_lr,
            None => self.lr,
        }
    }

    /// The factor parameters are multiplied by before the moment update.
    pub fn decay_factor(&self) -> f32 {
        1. - self.wd_scale() * self.weight_decay
    }
}

/// Builds the normalized caution mask of a single tensor.
///
/// `1.0` where the lookahead moment and the gradient agree in sign, divided by the clamped
/// fraction of agreeing elements.
fn caution_mask(lookahead: &ArrayD<f32>, grad: &ArrayViewD<'_, f32>) -> ArrayD<f32> {
    let mut mask =
        Zip::from(lookahead)
            .and(grad)
            .map_collect(|&m, &g| if m * g > 0. { 1f32 } else { 0. });

    let scale = mask.mean().unwrap_or(0.).max(CAUTION_MIN_SCALE);
    mask /= scale;
    mask
}
