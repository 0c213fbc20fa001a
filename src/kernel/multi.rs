use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD};

use super::{CAUTION_MIN_SCALE, UpdateOptions, UpdateSlot};
use crate::{
    error::{OptimErr, Result},
    foreach,
    tensor::Tensor,
};

/// Updates every slot at once through list-wide primitives.
///
/// Mathematically the same update as the single tensor kernel, restructured so each step of
/// the algorithm is a single primitive call over the whole list. All preconditions are
/// checked before anything is mutated.
///
/// # Errors
/// * `UnsupportedGradient` - a slot holds a sparse gradient.
/// * `DevicePrecondition` - `capturable` is set and a parameter and its step don't share an accelerator.
pub(crate) fn multi_tensor_nadamw<'a>(
    slots: &mut [UpdateSlot<'a>],
    opts: &UpdateOptions,
) -> Result<()> {
    if slots.is_empty() {
        return Ok(());
    }

    let mut grad_tensors: Vec<&'a Tensor> = Vec::with_capacity(slots.len());
    for (index, slot) in slots.iter().enumerate() {
        let grad: &'a _ = slot.grad;
        let grad = grad
            .dense()
            .ok_or(OptimErr::UnsupportedGradient { index })?;

        if opts.capturable && !shares_accelerator(&*slot.param, &*slot.step) {
            return Err(OptimErr::DevicePrecondition { index });
        }

        grad_tensors.push(grad);
    }

    let grads = grad_tensors
        .iter()
        .map(|g| g.real_view())
        .collect::<Result<Vec<_>>>()?;

    let negated;
    let grads: Vec<ArrayViewD<'_, f32>> = if opts.maximize {
        negated = foreach::neg(&grads);
        negated.iter().map(|g| g.view()).collect()
    } else {
        grads
    };

    let n = slots.len();
    let mut params = Vec::with_capacity(n);
    let mut exp_avgs = Vec::with_capacity(n);
    let mut exp_avg_sqs = Vec::with_capacity(n);
    let mut steps = Vec::with_capacity(n);

    for slot in slots.iter_mut() {
        params.push(slot.param.real_view_mut()?);
        exp_avgs.push(slot.exp_avg.real_view_mut()?);
        exp_avg_sqs.push(slot.exp_avg_sq.real_view_mut()?);
        steps.push(slot.step.real_view_mut()?);
    }

    let UpdateOptions { beta1, beta2, .. } = *opts;

    foreach::add_scalar_(&mut steps, 1.);

    foreach::mul_scalar_(&mut params, opts.decay_factor());

    foreach::mul_scalar_(&mut exp_avgs, beta1);
    foreach::add_scaled_(&mut exp_avgs, &grads, 1. - beta1);

    foreach::mul_scalar_(&mut exp_avg_sqs, beta2);
    foreach::addcmul_(&mut exp_avg_sqs, &grads, &grads, 1. - beta2);

    if opts.capturable {
        capturable_update(&mut params, &grads, &exp_avgs, &exp_avg_sqs, &steps, opts);
    } else {
        let steps: Vec<f32> = steps
            .iter()
            .map(|s| s.first().copied().unwrap_or_default())
            .collect();

        host_update(&mut params, &grads, &exp_avgs, &exp_avg_sqs, &steps, opts);
    }

    Ok(())
}

fn shares_accelerator(param: &Tensor, step: &Tensor) -> bool {
    param.device().is_accelerator() && param.device() == step.device()
}

/// Finishes the update with host side bias corrections, one per tensor.
fn host_update(
    params: &mut [ArrayViewMutD<'_, f32>],
    grads: &[ArrayViewD<'_, f32>],
    exp_avgs: &[ArrayViewMutD<'_, f32>],
    exp_avg_sqs: &[ArrayViewMutD<'_, f32>],
    steps: &[f32],
    opts: &UpdateOptions,
) {
    let beta1 = f64::from(opts.beta1);
    let beta2 = f64::from(opts.beta2);

    let bias_correction1: Vec<f64> = steps
        .iter()
        .map(|&s| 1. - beta1.powf(f64::from(s)))
        .collect();

    let bias_correction2: Vec<f64> = steps
        .iter()
        .map(|&s| 1. - beta2.powf(f64::from(s)))
        .collect();

    let step_size: Vec<f64> = bias_correction1
        .iter()
        .map(|bc| (f64::from(opts.lr) / bc) * -1.)
        .collect();

    let bias_correction2_sqrt: Vec<f64> = bias_correction2.iter().map(|bc| bc.sqrt()).collect();

    // Nesterov lookahead, a fresh list so the stored moments keep this step's value.
    let mut lookahead = foreach::mul_scalar(exp_avgs, opts.beta1);
    foreach::add_scaled_(&mut lookahead, grads, 1. - opts.beta1);

    let mut exp_avg_sq_sqrt = foreach::sqrt(exp_avg_sqs);
    foreach::div_scalars_(&mut exp_avg_sq_sqrt, &bias_correction2_sqrt);
    let denom = foreach::add_scalar(&exp_avg_sq_sqrt, opts.eps);

    if opts.caution {
        apply_caution(&mut lookahead, grads);
    }

    foreach::addcdiv_scalars_(params, &lookahead, &denom, &step_size);
}

/// Finishes the update keeping the bias corrections and step sizes as zero-dimensional tensors.
fn capturable_update(
    params: &mut [ArrayViewMutD<'_, f32>],
    grads: &[ArrayViewD<'_, f32>],
    exp_avgs: &[ArrayViewMutD<'_, f32>],
    exp_avg_sqs: &[ArrayViewMutD<'_, f32>],
    steps: &[ArrayViewMutD<'_, f32>],
    opts: &UpdateOptions,
) {
    let mut bias_correction1 = foreach::pow_base(opts.beta1, steps);
    let mut bias_correction2 = foreach::pow_base(opts.beta2, steps);

    // 1 - beta^step as -(beta^step - 1), subtraction only takes the scalar on the right
    foreach::sub_scalar_(&mut bias_correction1, 1.);
    foreach::sub_scalar_(&mut bias_correction2, 1.);
    foreach::neg_(&mut bias_correction1);
    foreach::neg_(&mut bias_correction2);

    // -lr / bias_correction1
    let mut step_size = foreach::div_scalar(&bias_correction1, opts.lr);
    foreach::reciprocal_(&mut step_size);
    foreach::neg_(&mut step_size);

    let bias_correction2_sqrt = foreach::sqrt(&bias_correction2);

    let mut lookahead = foreach::mul_scalar(exp_avgs, opts.beta1);
    foreach::add_scaled_(&mut lookahead, grads, 1. - opts.beta1);

    let mut exp_avg_sq_sqrt = foreach::sqrt(exp_avg_sqs);
    foreach::div_(
        &mut exp_avg_sq_sqrt,
        &foreach::mul(&bias_correction2_sqrt, &step_size),
    );

    let mut eps_over_step_size = foreach::div_scalar(&step_size, opts.eps);
    foreach::reciprocal_(&mut eps_over_step_size);
    let denom = foreach::add(&exp_avg_sq_sqrt, &eps_over_step_size);

    if opts.caution {
        apply_caution(&mut lookahead, grads);
    }

    foreach::addcdiv_(params, &lookahead, &denom, 1.);
}

fn apply_caution(lookahead: &mut [ArrayD<f32>], grads: &[ArrayViewD<'_, f32>]) {
    let mut masks = foreach::gt_zero(&foreach::mul(&*lookahead, grads));
    let mut mask_scale = foreach::mean(&masks);
    foreach::maximum_scalar_(&mut mask_scale, CAUTION_MIN_SCALE);
    foreach::div_(&mut masks, &mask_scale);
    foreach::mul_(lookahead, &masks);
}
