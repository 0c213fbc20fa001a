//! List-wide tensor primitives.
//!
//! Every function applies one elementwise operation to a whole list of tensors in a single
//! call. Trailing underscores mark the in-place variants, the rest return freshly allocated
//! tensors. Binary operations between lists broadcast the right hand side, which is how
//! per-tensor zero-dimensional scalars (bias corrections, step sizes, mask scales) are
//! applied to their full size counterparts.

use ndarray::{ArrayBase, ArrayD, Data, DataMut, IxDyn, Zip};

pub fn add_scalar_<S>(xs: &mut [ArrayBase<S, IxDyn>], scalar: f32)
where
    S: DataMut<Elem = f32>,
{
    xs.iter_mut().for_each(|x| *x += scalar);
}

pub fn add_scalar<S>(xs: &[ArrayBase<S, IxDyn>], scalar: f32) -> Vec<ArrayD<f32>>
where
    S: Data<Elem = f32>,
{
    xs.iter().map(|x| x + scalar).collect()
}

pub fn sub_scalar_<S>(xs: &mut [ArrayBase<S, IxDyn>], scalar: f32)
where
    S: DataMut<Elem = f32>,
{
    xs.iter_mut().for_each(|x| *x -= scalar);
}

pub fn mul_scalar_<S>(xs: &mut [ArrayBase<S, IxDyn>], scalar: f32)
where
    S: DataMut<Elem = f32>,
{
    xs.iter_mut().for_each(|x| *x *= scalar);
}

pub fn mul_scalar<S>(xs: &[ArrayBase<S, IxDyn>], scalar: f32) -> Vec<ArrayD<f32>>
where
    S: Data<Elem = f32>,
{
    xs.iter().map(|x| x * scalar).collect()
}

pub fn div_scalar<S>(xs: &[ArrayBase<S, IxDyn>], scalar: f32) -> Vec<ArrayD<f32>>
where
    S: Data<Elem = f32>,
{
    xs.iter().map(|x| x / scalar).collect()
}

/// Divides every tensor by its own host side scalar.
pub fn div_scalars_<S>(xs: &mut [ArrayBase<S, IxDyn>], scalars: &[f64])
where
    S: DataMut<Elem = f32>,
{
    debug_assert_eq!(xs.len(), scalars.len());
    xs.iter_mut()
        .zip(scalars)
        .for_each(|(x, &s)| *x /= s as f32);
}

/// `xs[i] += alpha * ys[i]`
pub fn add_scaled_<S, S2>(xs: &mut [ArrayBase<S, IxDyn>], ys: &[ArrayBase<S2, IxDyn>], alpha: f32)
where
    S: DataMut<Elem = f32>,
    S2: Data<Elem = f32>,
{
    debug_assert_eq!(xs.len(), ys.len());
    xs.iter_mut()
        .zip(ys)
        .for_each(|(x, y)| x.scaled_add(alpha, y));
}

/// `xs[i] += value * a[i] * b[i]`
pub fn addcmul_<S, S2, S3>(
    xs: &mut [ArrayBase<S, IxDyn>],
    a: &[ArrayBase<S2, IxDyn>],
    b: &[ArrayBase<S3, IxDyn>],
    value: f32,
) where
    S: DataMut<Elem = f32>,
    S2: Data<Elem = f32>,
    S3: Data<Elem = f32>,
{
    debug_assert!(xs.len() == a.len() && a.len() == b.len());
    xs.iter_mut().zip(a).zip(b).for_each(|((x, a), b)| {
        Zip::from(x)
            .and(a)
            .and(b)
            .for_each(|x, &a, &b| *x += value * a * b);
    });
}

/// `xs[i] += value * a[i] / b[i]`
pub fn addcdiv_<S, S2, S3>(
    xs: &mut [ArrayBase<S, IxDyn>],
    a: &[ArrayBase<S2, IxDyn>],
    b: &[ArrayBase<S3, IxDyn>],
    value: f32,
) where
    S: DataMut<Elem = f32>,
    S2: Data<Elem = f32>,
    S3: Data<Elem = f32>,
{
    debug_assert!(xs.len() == a.len() && a.len() == b.len());
    xs.iter_mut().zip(a).zip(b).for_each(|((x, a), b)| {
        Zip::from(x)
            .and(a)
            .and(b)
            .for_each(|x, &a, &b| *x += value * (a / b));
    });
}

/// `xs[i] += values[i] * a[i] / b[i]`, one host side scalar per tensor.
pub fn addcdiv_scalars_<S, S2, S3>(
    xs: &mut [ArrayBase<S, IxDyn>],
    a: &[ArrayBase<S2, IxDyn>],
    b: &[ArrayBase<S3, IxDyn>],
    values: &[f64],
) where
    S: DataMut<Elem = f32>,
    S2: Data<Elem = f32>,
    S3: Data<Elem = f32>,
{
    debug_assert!(xs.len() == a.len() && a.len() == b.len() && b.len() == values.len());
    xs.iter_mut()
        .zip(a)
        .zip(b)
        .zip(values)
        .for_each(|(((x, a), b), &value)| {
            let value = value as f32;
            Zip::from(x)
                .and(a)
                .and(b)
                .for_each(|x, &a, &b| *x += value * (a / b));
        });
}

pub fn neg<S>(xs: &[ArrayBase<S, IxDyn>]) -> Vec<ArrayD<f32>>
where
    S: Data<Elem = f32>,
{
    xs.iter().map(|x| x.mapv(|v| -v)).collect()
}

pub fn neg_<S>(xs: &mut [ArrayBase<S, IxDyn>])
where
    S: DataMut<Elem = f32>,
{
    xs.iter_mut().for_each(|x| x.mapv_inplace(|v| -v));
}

pub fn reciprocal_<S>(xs: &mut [ArrayBase<S, IxDyn>])
where
    S: DataMut<Elem = f32>,
{
    xs.iter_mut().for_each(|x| x.mapv_inplace(f32::recip));
}

pub fn sqrt<S>(xs: &[ArrayBase<S, IxDyn>]) -> Vec<ArrayD<f32>>
where
    S: Data<Elem = f32>,
{
    xs.iter().map(|x| x.mapv(f32::sqrt)).collect()
}

/// `base ** exponents[i]`, elementwise.
pub fn pow_base<S>(base: f32, exponents: &[ArrayBase<S, IxDyn>]) -> Vec<ArrayD<f32>>
where
    S: Data<Elem = f32>,
{
    exponents.iter().map(|e| e.mapv(|e| base.powf(e))).collect()
}

pub fn mul<S, S2>(xs: &[ArrayBase<S, IxDyn>], ys: &[ArrayBase<S2, IxDyn>]) -> Vec<ArrayD<f32>>
where
    S: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    debug_assert_eq!(xs.len(), ys.len());
    xs.iter().zip(ys).map(|(x, y)| x * y).collect()
}

pub fn mul_<S, S2>(xs: &mut [ArrayBase<S, IxDyn>], ys: &[ArrayBase<S2, IxDyn>])
where
    S: DataMut<Elem = f32>,
    S2: Data<Elem = f32>,
{
    debug_assert_eq!(xs.len(), ys.len());
    xs.iter_mut().zip(ys).for_each(|(x, y)| *x *= y);
}

pub fn div_<S, S2>(xs: &mut [ArrayBase<S, IxDyn>], ys: &[ArrayBase<S2, IxDyn>])
where
    S: DataMut<Elem = f32>,
    S2: Data<Elem = f32>,
{
    debug_assert_eq!(xs.len(), ys.len());
    xs.iter_mut().zip(ys).for_each(|(x, y)| *x /= y);
}

pub fn add<S, S2>(xs: &[ArrayBase<S, IxDyn>], ys: &[ArrayBase<S2, IxDyn>]) -> Vec<ArrayD<f32>>
where
    S: Data<Elem = f32>,
    S2: Data<Elem = f32>,
{
    debug_assert_eq!(xs.len(), ys.len());
    xs.iter().zip(ys).map(|(x, y)| x + y).collect()
}

/// `1.0` where the element is strictly positive, `0.0` elsewhere.
pub fn gt_zero<S>(xs: &[ArrayBase<S, IxDyn>]) -> Vec<ArrayD<f32>>
where
    S: Data<Elem = f32>,
{
    xs.iter()
        .map(|x| x.mapv(|v| if v > 0. { 1. } else { 0. }))
        .collect()
}

/// One zero-dimensional mean per tensor, empty tensors average to `0.0`.
pub fn mean<S>(xs: &[ArrayBase<S, IxDyn>]) -> Vec<ArrayD<f32>>
where
    S: Data<Elem = f32>,
{
    xs.iter()
        .map(|x| ArrayD::from_elem(IxDyn(&[]), x.mean().unwrap_or(0.)))
        .collect()
}

pub fn maximum_scalar_<S>(xs: &mut [ArrayBase<S, IxDyn>], scalar: f32)
where
    S: DataMut<Elem = f32>,
{
    xs.iter_mut().for_each(|x| x.mapv_inplace(|v| v.max(scalar)));
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn, arr0};

    use super::*;

    fn vec1(data: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[data.len()]), data.to_vec()).unwrap()
    }

    fn cell(value: f32) -> ArrayD<f32> {
        arr0(value).into_dyn()
    }

    #[test]
    fn test_scalar_ops_touch_every_tensor() {
        let mut xs = vec![vec1(&[1., 2.]), vec1(&[3.])];

        mul_scalar_(&mut xs, 2.);
        add_scalar_(&mut xs, 1.);
        sub_scalar_(&mut xs, 0.5);

        assert_eq!(xs, vec![vec1(&[2.5, 4.5]), vec1(&[6.5])]);
    }

    #[test]
    fn test_div_broadcasts_zero_dim_rhs() {
        let mut xs = vec![vec1(&[2., 4.]), vec1(&[9.])];
        let scales = vec![cell(2.), cell(3.)];

        div_(&mut xs, &scales);
        assert_eq!(xs, vec![vec1(&[1., 2.]), vec1(&[3.])]);
    }

    #[test]
    fn test_add_co_broadcasts() {
        let xs = vec![vec1(&[1., 2.])];
        let ys = vec![cell(10.)];

        assert_eq!(add(&xs, &ys), vec![vec1(&[11., 12.])]);
    }

    #[test]
    fn test_addcmul_and_addcdiv() {
        let mut xs = vec![vec1(&[1., 1.])];
        let a = vec![vec1(&[2., 3.])];
        let b = vec![vec1(&[4., 8.])];

        addcmul_(&mut xs, &a, &b, 0.5);
        assert_eq!(xs, vec![vec1(&[5., 13.])]);

        addcdiv_(&mut xs, &a, &b, -2.);
        assert_eq!(xs, vec![vec1(&[4., 12.25])]);

        addcdiv_scalars_(&mut xs, &a, &b, &[2.]);
        assert_eq!(xs, vec![vec1(&[5., 13.])]);
    }

    #[test]
    fn test_mask_mean_and_clamp() {
        let masks = gt_zero(&[vec1(&[-1., 0., 2., 3.]), vec1(&[-1.])]);
        assert_eq!(masks, vec![vec1(&[0., 0., 1., 1.]), vec1(&[0.])]);

        let mut scale = mean(&masks);
        maximum_scalar_(&mut scale, 1e-3);
        assert_eq!(scale, vec![cell(0.5), cell(1e-3)]);
    }

    #[test]
    fn test_mean_of_empty_tensor_is_zero() {
        let scale = mean(&[ArrayD::<f32>::zeros(IxDyn(&[0]))]);
        assert_eq!(scale, vec![cell(0.)]);
    }

    #[test]
    fn test_pow_reciprocal_neg() {
        let steps = vec![cell(2.), cell(3.)];
        let mut out = pow_base(0.5, &steps);
        reciprocal_(&mut out);
        neg_(&mut out);

        assert_eq!(out, vec![cell(-4.), cell(-8.)]);
        assert_eq!(neg(&out), vec![cell(4.), cell(8.)]);
        assert_eq!(sqrt(&neg(&out)), vec![cell(2.), cell(8f32.sqrt())]);
    }
}
