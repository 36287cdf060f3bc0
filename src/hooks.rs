//! Post-execution hooks.
//!
//! Run after a kernel returns, in this order:
//!
//! 1. [`check_nan_inf`] when `check_numerics` is on;
//! 2. [`synchronize`] when `benchmark` is on;
//! 3. [`repair_complex_grads`] when the kernel computed in a complex dtype.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::backend::{DataType, Place};
use crate::device::DeviceContext;
use crate::error::{DispatchError, DispatchResult};
use crate::tensor::Storage;
use crate::variable::{VarMapView, VarMapViewMut};

/// Counts NaN and infinite elements of floating and complex storage.
///
/// A complex element counts as NaN (or Inf) if either part is.
#[must_use]
pub fn count_nan_inf(storage: &Storage) -> (usize, usize) {
    fn classify(nan: bool, inf: bool) -> (usize, usize) {
        (usize::from(nan), usize::from(inf))
    }
    fn add(a: (usize, usize), b: (usize, usize)) -> (usize, usize) {
        (a.0 + b.0, a.1 + b.1)
    }
    match storage {
        Storage::Float32(v) => v
            .par_iter()
            .map(|x| classify(x.is_nan(), x.is_infinite()))
            .reduce(|| (0, 0), add),
        Storage::Float64(v) => v
            .par_iter()
            .map(|x| classify(x.is_nan(), x.is_infinite()))
            .reduce(|| (0, 0), add),
        Storage::Complex64(v) => v
            .par_iter()
            .map(|c| classify(c.re.is_nan() || c.im.is_nan(), c.re.is_infinite() || c.im.is_infinite()))
            .reduce(|| (0, 0), add),
        Storage::Complex128(v) => v
            .par_iter()
            .map(|c| classify(c.re.is_nan() || c.im.is_nan(), c.re.is_infinite() || c.im.is_infinite()))
            .reduce(|| (0, 0), add),
        Storage::Bool(_) | Storage::Int32(_) | Storage::Int64(_) => (0, 0),
    }
}

/// Fails on the first output holding a NaN or Inf.
///
/// # Errors
///
/// Returns [`DispatchError::NumericFailure`] naming the variable.
pub fn check_nan_inf(op_type: &str, outs: &dyn VarMapView, place: Place) -> DispatchResult<()> {
    for name in outs.names() {
        for idx in 0..outs.len_of(name).unwrap_or(0) {
            let Some(var) = outs.var(name, idx) else { continue };
            let Some(storage) = var.tensor().and_then(|t| t.storage()) else {
                continue;
            };
            let (nan, inf) = count_nan_inf(storage);
            if nan > 0 || inf > 0 {
                return Err(DispatchError::NumericFailure {
                    op_type: op_type.to_string(),
                    var: var.name().to_string(),
                    nan,
                    inf,
                    place,
                });
            }
        }
    }
    trace!(op = op_type, "numeric check passed");
    Ok(())
}

/// Waits for the device and surfaces asynchronous failures.
///
/// # Errors
///
/// Returns [`DispatchError::DeviceFailure`].
pub fn synchronize(op_type: &str, dev_ctx: &dyn DeviceContext) -> DispatchResult<()> {
    dev_ctx.wait().map_err(|source| DispatchError::DeviceFailure {
        op_type: op_type.to_string(),
        source,
    })
}

/// Converts complex gradients back to the real dtype of their forward
/// variable.
///
/// Only variables that record a real forward dtype and hold an initialized
/// complex tensor are touched; the real part is kept. Returns how many
/// variables were converted.
pub fn repair_complex_grads(op_type: &str, outs: &mut dyn VarMapViewMut, compute_dtype: DataType) -> usize {
    if !compute_dtype.is_complex() {
        return 0;
    }
    let names: Vec<String> = outs.names().into_iter().map(str::to_string).collect();
    let mut repaired = 0;
    for name in &names {
        for idx in 0..outs.len_of(name).unwrap_or(0) {
            let Some(var) = outs.var_mut(name, idx) else { continue };
            if !var.tracks_forward_dtype() {
                continue;
            }
            let Some(forward) = var.forward_dtype() else {
                trace!(op = op_type, var = var.name(), "forward dtype not set");
                continue;
            };
            if forward.is_complex() {
                continue;
            }
            let Some(real) = var
                .tensor()
                .filter(|t| t.is_initialized() && t.dtype().is_complex())
                .and_then(|t| t.cast(forward))
            else {
                continue;
            };
            debug!(op = op_type, var = var.name(), to = %forward, "complex gradient repaired");
            var.set_tensor(real);
            repaired += 1;
        }
    }
    repaired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DenseTensor, Tensor};
    use crate::variable::{EagerVariable, NameVarMap, Variable, VariableLike};
    use num_complex::Complex;

    fn complex_grad() -> Tensor<Complex<f32>> {
        Tensor::new(vec![2], vec![Complex::new(1.5, 2.0), Complex::new(-3.0, 0.5)])
    }

    #[test]
    fn counts_nan_and_inf() {
        let s = Storage::Float64(vec![1.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY]);
        assert_eq!(count_nan_inf(&s), (1, 2));
        let c = Storage::Complex64(vec![Complex::new(0.0, f32::NAN)]);
        assert_eq!(count_nan_inf(&c), (1, 0));
        assert_eq!(count_nan_inf(&Storage::Int32(vec![1, 2])), (0, 0));
    }

    #[test]
    fn numeric_check_names_offending_variable() {
        let mut outs: NameVarMap<Variable> = NameVarMap::new();
        outs.insert(
            "Out".into(),
            vec![
                Variable::new("fine").with_tensor(Tensor::new(vec![1], vec![1.0f32])),
                Variable::new("bad").with_tensor(Tensor::new(vec![1], vec![f32::NAN])),
            ],
        );
        match check_nan_inf("div", &outs, Place::Cpu) {
            Err(DispatchError::NumericFailure { var, nan, .. }) => {
                assert_eq!(var, "bad");
                assert_eq!(nan, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn repairs_only_annotated_variables() {
        let mut outs: NameVarMap<Variable> = NameVarMap::new();
        outs.insert(
            "X@GRAD".into(),
            vec![
                Variable::new("real").with_tensor(complex_grad()).with_forward_dtype(DataType::Float32),
                Variable::new("unset").with_tensor(complex_grad()),
                Variable::new("cplx").with_tensor(complex_grad()).with_forward_dtype(DataType::Complex64),
            ],
        );
        assert_eq!(repair_complex_grads("matmul_grad", &mut outs, DataType::Complex64), 1);
        let grads = &outs["X@GRAD"];
        assert_eq!(grads[0].tensor().and_then(DenseTensor::data::<f32>), Some(&[1.5, -3.0][..]));
        assert_eq!(grads[1].tensor().map(DenseTensor::dtype), Some(DataType::Complex64));
        assert_eq!(grads[2].tensor().map(DenseTensor::dtype), Some(DataType::Complex64));
    }

    #[test]
    fn eager_variables_are_never_repaired() {
        let mut outs: NameVarMap<EagerVariable> = NameVarMap::new();
        outs.insert("G".into(), vec![EagerVariable::new("g").with_tensor(complex_grad())]);
        assert_eq!(repair_complex_grads("op", &mut outs, DataType::Complex64), 0);
        assert_eq!(repair_complex_grads("op", &mut outs, DataType::Float32), 0);
    }
}
