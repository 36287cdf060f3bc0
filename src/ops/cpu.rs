//! Parallel CPU bodies of the reference kernels.
//!
//! # CPU Backend
//!
//! These are plain slice-in, vector-out routines; the kernel wrappers in
//! [`super`] adapt them to kernel contexts.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon)
//! - NumPy-style broadcasting for binary element-wise ops
//!
//! ## Implemented Ops
//!
//! - `add`: broadcasting element-wise sum, wrapping on integer overflow
//! - `scale`: `x * scale + bias`, or `(x + bias) * scale`
//!
//! ## Design Goals
//!
//! - Deterministic results (every element is computed independently)
//! - No knowledge of tensors, places or kernel keys

use std::ops::{Add, Mul};

use num_complex::Complex;
use rayon::prelude::*;

/// Element addition that never panics.
///
/// Integers wrap on overflow; floating and complex types add normally.
pub trait ElementAdd: Copy + Send + Sync {
    /// `self + rhs`.
    #[must_use]
    fn element_add(self, rhs: Self) -> Self;
}

macro_rules! wrapping_add {
    ($($t:ty),*) => {$(
        impl ElementAdd for $t {
            fn element_add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
        }
    )*};
}

macro_rules! plain_add {
    ($($t:ty),*) => {$(
        impl ElementAdd for $t {
            fn element_add(self, rhs: Self) -> Self {
                self + rhs
            }
        }
    )*};
}

wrapping_add!(i32, i64);
plain_add!(f32, f64, Complex<f32>, Complex<f64>);

/// Broadcasts two shapes, right-aligned.
///
/// Returns `None` when a pair of dimensions is neither equal nor 1.
///
/// # Example
/// ```rust
/// use briny_dispatch::ops::cpu::broadcast_shape;
///
/// assert_eq!(broadcast_shape(&[2, 1, 3], &[4, 1]), Some(vec![2, 4, 3]));
/// assert_eq!(broadcast_shape(&[2, 3], &[4]), None);
/// ```
#[must_use]
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |s: &[usize], i: usize| {
        let pad = rank - s.len();
        if i < pad { 1 } else { s[i - pad] }
    };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

/// Element strides of `shape` inside the broadcast shape `out`; broadcast
/// dimensions get stride 0.
fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let pad = out.len() - shape.len();
    let mut strides = vec![0; out.len()];
    let mut acc = 1;
    for (i, &d) in shape.iter().enumerate().rev() {
        strides[pad + i] = if d == 1 { 0 } else { acc };
        acc *= d;
    }
    strides
}

/// Element-wise `a + b` with broadcasting.
///
/// # Returns
/// - The broadcast shape and the row-major result, or `None` if the shapes
///   do not broadcast
///
/// # Optimizations
/// - Equal shapes skip index arithmetic entirely
/// - Uses `rayon` over output elements
///
/// # Example
/// ```rust
/// use briny_dispatch::ops::cpu::add;
///
/// let (shape, data) = add(&[1.0, 2.0, 3.0, 4.0], &[2, 2], &[10.0, 20.0], &[2]).unwrap();
/// assert_eq!(shape, vec![2, 2]);
/// assert_eq!(data, vec![11.0, 22.0, 13.0, 24.0]);
/// ```
#[must_use]
pub fn add<T>(a: &[T], a_shape: &[usize], b: &[T], b_shape: &[usize]) -> Option<(Vec<usize>, Vec<T>)>
where
    T: ElementAdd,
{
    if a_shape == b_shape {
        let data = a.par_iter().zip(b.par_iter()).map(|(&x, &y)| x.element_add(y)).collect();
        return Some((a_shape.to_vec(), data));
    }

    let shape = broadcast_shape(a_shape, b_shape)?;
    let sa = broadcast_strides(a_shape, &shape);
    let sb = broadcast_strides(b_shape, &shape);
    let n: usize = shape.iter().product();

    let data = (0..n)
        .into_par_iter()
        .map(|flat| {
            let (mut ia, mut ib, mut rem) = (0, 0, flat);
            for d in (0..shape.len()).rev() {
                let idx = rem % shape[d];
                rem /= shape[d];
                ia += idx * sa[d];
                ib += idx * sb[d];
            }
            a[ia].element_add(b[ib])
        })
        .collect();
    Some((shape, data))
}

/// Affine scaling of every element.
///
/// # Formula
/// - `bias_after_scale`: $$ y = x \cdot s + b $$
/// - otherwise: $$ y = (x + b) \cdot s $$
#[must_use]
pub fn scale<T>(x: &[T], scale: T, bias: T, bias_after_scale: bool) -> Vec<T>
where
    T: Copy + Send + Sync + Add<Output = T> + Mul<Output = T>,
{
    if bias_after_scale {
        x.par_iter().map(|&v| v * scale + bias).collect()
    } else {
        x.par_iter().map(|&v| (v + bias) * scale).collect()
    }
}
