use log::debug;

use crate::{
    error::{OptimErr, Result},
    kernel::{UpdateOptions, UpdateSlot, multi_tensor_nadamw, single_tensor_nadamw},
    tensor::Tensor,
};

/// What the runtime executing the update is able to do.
///
/// Passed in explicitly instead of being discovered from global state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeCapabilities {
    /// Whether the runtime has a list-wide `maximum` with a scalar operand, needed by the
    /// batched kernel's caution mask.
    pub foreach_maximum_scalar: bool,
}

impl RuntimeCapabilities {
    /// The capabilities of this crate's own host runtime.
    pub fn native() -> Self {
        Self {
            foreach_maximum_scalar: true,
        }
    }

    /// Builds the capabilities from a probe.
    ///
    /// # Arguments
    /// * `probe` - Checks whether the list-wide scalar maximum is available.
    ///
    /// # Returns
    /// The capabilities, a failing probe counts as the primitive being unavailable.
    pub fn probe<E>(probe: impl FnOnce() -> std::result::Result<bool, E>) -> Self {
        Self {
            foreach_maximum_scalar: probe().unwrap_or(false),
        }
    }
}

impl Default for RuntimeCapabilities {
    fn default() -> Self {
        Self::native()
    }
}

/// Decides whether the batched kernel runs.
///
/// An explicit choice is honoured as is. Otherwise the batched kernel is used unless caution
/// is requested and the runtime can't clamp the mask scales list-wide.
pub fn resolve_foreach(foreach: Option<bool>, caution: bool, caps: RuntimeCapabilities) -> bool {
    foreach.unwrap_or(!caution || caps.foreach_maximum_scalar)
}

/// Runs one NAdamW update over `slots`.
///
/// # Arguments
/// * `slots` - The parameters to update together with their gradients and state.
/// * `foreach` - Forces the batched (`true`) or per tensor (`false`) kernel, `None` picks one.
/// * `caps` - The capabilities of the executing runtime.
/// * `opts` - The hyperparameters of this update.
///
/// # Returns
/// An error if a step counter isn't a scalar cell, if a tensor's shape disagrees with its
/// parameter or if the selected kernel rejects the batch.
pub fn nadamw(
    slots: &mut [UpdateSlot<'_>],
    foreach: Option<bool>,
    caps: RuntimeCapabilities,
    opts: &UpdateOptions,
) -> Result<()> {
    validate(slots)?;

    if slots.is_empty() {
        return Ok(());
    }

    let foreach = resolve_foreach(foreach, opts.caution, caps);
    debug!(
        params = slots.len(),
        foreach = foreach,
        capturable = opts.capturable;
        "nadamw update"
    );

    if foreach {
        multi_tensor_nadamw(slots, opts)
    } else {
        single_tensor_nadamw(slots, opts)
    }
}

fn validate(slots: &[UpdateSlot<'_>]) -> Result<()> {
    for (index, slot) in slots.iter().enumerate() {
        if !slot.step.is_scalar_cell() {
            return Err(OptimErr::StepNotScalarCell { index });
        }

        let param: &Tensor = &*slot.param;
        if let Some(grad) = slot.grad.dense() {
            check_like(param, grad, "grad")?;
        }

        check_like(param, &*slot.exp_avg, "exp_avg")?;
        check_like(param, &*slot.exp_avg_sq, "exp_avg_sq")?;
    }

    Ok(())
}

fn check_like(param: &Tensor, other: &Tensor, what: &'static str) -> Result<()> {
    if param.is_complex() != other.is_complex() || param.shape() != other.shape() {
        return Err(OptimErr::ShapeMismatch {
            what,
            got: other.real_shape(),
            expected: param.real_shape(),
        });
    }

    Ok(())
}
