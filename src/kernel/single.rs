use ndarray::{ArrayViewD, ArrayViewMutD, Zip};

use super::{UpdateOptions, UpdateSlot, caution_mask};
use crate::error::{OptimErr, Result};

/// Updates every slot one tensor at a time.
///
/// This is the reference form of the algorithm: for each slot the step counter is bumped,
/// weight decay is applied, the moments are updated and the parameter takes a Nesterov
/// lookahead step. Complex tensors are updated through their real view.
///
/// # Errors
/// `UnsupportedGradient` when a slot holds a sparse gradient, slots before it keep their update.
pub(crate) fn single_tensor_nadamw(slots: &mut [UpdateSlot<'_>], opts: &UpdateOptions) -> Result<()> {
    let UpdateOptions {
        beta1,
        beta2,
        capturable,
        maximize,
        ..
    } = *opts;

    for (index, slot) in slots.iter_mut().enumerate() {
        let grad = slot
            .grad
            .dense()
            .ok_or(OptimErr::UnsupportedGradient { index })?;

        let grad = grad.real_view()?;
        let negated;
        let grad = if maximize {
            negated = grad.mapv(|g| -g);
            negated.view()
        } else {
            grad
        };

        let mut param = slot.param.real_view_mut()?;
        let mut exp_avg = slot.exp_avg.real_view_mut()?;
        let mut exp_avg_sq = slot.exp_avg_sq.real_view_mut()?;
        let mut step = slot.step.real_view_mut()?;

        step += 1.;

        param *= opts.decay_factor();

        exp_avg *= beta1;
        exp_avg.scaled_add(1. - beta1, &grad);

        exp_avg_sq *= beta2;
        Zip::from(&mut exp_avg_sq)
            .and(&grad)
            .and(&grad)
            .for_each(|v, &a, &b| *v += (1. - beta2) * a * b);

        if capturable {
            capturable_update(
                param,
                grad,
                exp_avg.view(),
                exp_avg_sq.view(),
                step.view(),
                opts,
            );
        } else {
            host_update(
                param,
                grad,
                exp_avg.view(),
                exp_avg_sq.view(),
                step.view(),
                opts,
            );
        }
    }

    Ok(())
}

/// Finishes the update reading the step counter back as a host number.
fn host_update(
    mut param: ArrayViewMutD<'_, f32>,
    grad: ArrayViewD<'_, f32>,
    exp_avg: ArrayViewD<'_, f32>,
    exp_avg_sq: ArrayViewD<'_, f32>,
    step: ArrayViewD<'_, f32>,
    opts: &UpdateOptions,
) {
    let step = f64::from(step.first().copied().unwrap_or_default());
    let bias_correction1 = 1. - f64::from(opts.beta1).powf(step);
    let bias_correction2 = 1. - f64::from(opts.beta2).powf(step);
    let step_size = f64::from(opts.lr) / bias_correction1;
    let bias_correction2_sqrt = bias_correction2.sqrt();

    // Nesterov: the update uses the moment one step ahead, the stored one is left untouched.
    let mut lookahead = &exp_avg * opts.beta1;
    lookahead.scaled_add(1. - opts.beta1, &grad);

    let denom = exp_avg_sq.mapv(f32::sqrt) / bias_correction2_sqrt as f32 + opts.eps;

    if opts.caution {
        let mask = caution_mask(&lookahead, &grad);
        lookahead *= &mask;
    }

    let value = -step_size as f32;
    Zip::from(&mut param)
        .and(&lookahead)
        .and(&denom)
        .for_each(|p, &m, &d| *p += value * (m / d));
}

/// Finishes the update keeping every step dependent quantity as a tensor.
///
/// The sign of the step size and `eps` are folded into the denominator so the whole update
/// is a single `param += lookahead / denom` with no host side branch or read.
fn capturable_update(
    mut param: ArrayViewMutD<'_, f32>,
    grad: ArrayViewD<'_, f32>,
    exp_avg: ArrayViewD<'_, f32>,
    exp_avg_sq: ArrayViewD<'_, f32>,
    step: ArrayViewD<'_, f32>,
    opts: &UpdateOptions,
) {
    let bias_correction1 = step.mapv(|s| 1. - opts.beta1.powf(s));
    let bias_correction2 = step.mapv(|s| 1. - opts.beta2.powf(s));

    let step_size = bias_correction1.mapv(|bc| opts.lr / bc);
    let step_size_neg = step_size.mapv(|s| -s);

    let bias_correction2_sqrt = bias_correction2.mapv(f32::sqrt);

    let mut lookahead = &exp_avg * opts.beta1;
    lookahead.scaled_add(1. - opts.beta1, &grad);

    let eps_over_step_size = step_size_neg.mapv(|s| opts.eps / s);
    let denom = exp_avg_sq.mapv(f32::sqrt) / &(&bias_correction2_sqrt * &step_size_neg)
        + &eps_over_step_size;

    if opts.caution {
        let mask = caution_mask(&lookahead, &grad);
        lookahead *= &mask;
    }

    Zip::from(&mut param)
        .and(&lookahead)
        .and(&denom)
        .for_each(|p, &m, &d| *p += m / d);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{Grad, SparseTensor, Tensor};

    fn options(capturable: bool) -> UpdateOptions {
        UpdateOptions {
            beta1: 0.9,
            beta2: 0.999,
            lr: 0.1,
            weight_decay: 0.,
            eps: 1e-8,
            caution: false,
            maximize: false,
            capturable,
            max_lr: None,
        }
    }

    struct Owned {
        param: Tensor,
        grad: Grad,
        exp_avg: Tensor,
        exp_avg_sq: Tensor,
        step: Tensor,
    }

    impl Owned {
        fn new(param: &[f32], grad: Grad) -> Self {
            let param = Tensor::from_vec(&[param.len()], param.to_vec()).unwrap();
            Self {
                exp_avg: param.zeros_like(),
                exp_avg_sq: param.zeros_like(),
                step: Tensor::scalar(0.),
                param,
                grad,
            }
        }

        fn slot(&mut self) -> UpdateSlot<'_> {
            UpdateSlot {
                param: &mut self.param,
                grad: &self.grad,
                exp_avg: &mut self.exp_avg,
                exp_avg_sq: &mut self.exp_avg_sq,
                step: &mut self.step,
            }
        }
    }

    #[test]
    fn test_first_step_matches_hand_computation() {
        for capturable in [false, true] {
            let grad = Tensor::from_vec(&[1], vec![1.]).unwrap();
            let mut owned = Owned::new(&[1.], grad.into());

            single_tensor_nadamw(&mut [owned.slot()], &options(capturable)).unwrap();

            // lookahead = 0.9 * 0.1 + 0.1 = 0.19, bias corrected step of lr / 0.1 = 1
            let p = owned.param.as_real().unwrap()[[0]];
            assert!((p - 0.81).abs() < 1e-6, "capturable={capturable}: {p}");
            assert!((owned.exp_avg.as_real().unwrap()[[0]] - 0.1).abs() < 1e-7);
            assert_eq!(owned.step.item(), Some(1.));
        }
    }

    #[test]
    fn test_stored_moment_is_not_the_lookahead() {
        let grad = Tensor::from_vec(&[1], vec![2.]).unwrap();
        let mut owned = Owned::new(&[0.], grad.into());

        single_tensor_nadamw(&mut [owned.slot()], &options(false)).unwrap();
        single_tensor_nadamw(&mut [owned.slot()], &options(false)).unwrap();

        // 0.9 * 0.2 + 0.1 * 2
        let m = owned.exp_avg.as_real().unwrap()[[0]];
        assert!((m - 0.38).abs() < 1e-6);
    }

    #[test]
    fn test_sparse_gradient_aborts_remaining_slots() {
        let dense = Tensor::from_vec(&[1], vec![1.]).unwrap();
        let sparse = SparseTensor::new(vec![1], vec![vec![0]], vec![1.]).unwrap();

        let mut first = Owned::new(&[1.], dense.into());
        let mut second = Owned::new(&[1.], sparse.into());
        let mut third = Owned::new(&[1.], Tensor::from_vec(&[1], vec![1.]).unwrap().into());

        let res = single_tensor_nadamw(
            &mut [first.slot(), second.slot(), third.slot()],
            &options(false),
        );

        assert!(matches!(res, Err(OptimErr::UnsupportedGradient { index: 1 })));
        assert_eq!(first.step.item(), Some(1.));
        assert_eq!(second.step.item(), Some(0.));
        assert_eq!(third.step.item(), Some(0.));
    }
}
