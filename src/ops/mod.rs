//! # Reference Operators
//!
//! A small operator set that exercises every kernel flavour the dispatcher
//! supports. Useful for smoke tests and as a template for registering real
//! operators.
//!
//! | Operator | Kernel flavour           | Backends | Notes                         |
//! |----------|--------------------------|----------|-------------------------------|
//! | `add`    | unified function kernel  | CPU      | broadcasting, default signature |
//! | `scale`  | legacy kernel            | CPU      | `scale`, `bias`, `bias_after_scale` |
//! | `cast`   | unified structured kernel| CPU      | `out_dtype` attribute         |
//!
//! ## Submodules
//!
//! - [`cpu`]: the parallel CPU bodies
//!
//! ## Example
//!
//! ```rust
//! use briny_dispatch::{ops, Dispatcher, RegistryBuilder};
//!
//! let mut builder = RegistryBuilder::new();
//! ops::register_reference_ops(&mut builder).unwrap();
//! let dispatcher = Dispatcher::new(builder.build());
//! assert!(dispatcher.registry().operator("add").is_some());
//! ```

pub mod cpu;

use std::ops::{Add, Mul};

use num_complex::Complex;

use crate::attribute::Attribute;
use crate::backend::DataType;
use crate::context::{ExecutionContext, InferShapeContext, KernelContext};
use crate::error::{DispatchResult, KernelError, ShapeError};
use crate::kernel_key::KernelKey;
use crate::registry::{ArgDef, KernelEntry, LegacyKernelType, OperatorInfo, RegistryBuilder};
use crate::signature::KernelSignature;
use crate::tensor::{DenseTensor, Element};

/// Every dtype a reference kernel may be registered for.
const NUMERIC: [DataType; 6] = [
    DataType::Int32,
    DataType::Int64,
    DataType::Float32,
    DataType::Float64,
    DataType::Complex64,
    DataType::Complex128,
];

/// Registers `add`, `scale` and `cast`.
///
/// # Errors
///
/// Fails if any of them is already registered.
pub fn register_reference_ops(builder: &mut RegistryBuilder) -> DispatchResult<()> {
    builder.operator(OperatorInfo::new("add").with_infer_shape(infer_broadcast))?;
    builder.default_signature("add", KernelSignature::new("add", &["X", "Y"], &["axis"], &["Out"]))?;
    for dtype in NUMERIC {
        let key = KernelKey::cpu(dtype);
        let entry = match dtype {
            DataType::Int32 => KernelEntry::function(add_kernel::<i32>),
            DataType::Int64 => KernelEntry::function(add_kernel::<i64>),
            DataType::Float32 => KernelEntry::function(add_kernel::<f32>),
            DataType::Float64 => KernelEntry::function(add_kernel::<f64>),
            DataType::Complex64 => KernelEntry::function(add_kernel::<Complex<f32>>),
            _ => KernelEntry::function(add_kernel::<Complex<f64>>),
        };
        builder.kernel("add", key, entry.with_inputs(vec![ArgDef::from_key(key); 2]))?;
    }

    builder.operator(
        OperatorInfo::new("scale")
            .with_infer_shape(infer_same_as_x)
            .with_legacy_kernel(LegacyKernelType::cpu(DataType::Float32), scale_kernel::<f32>)
            .with_legacy_kernel(LegacyKernelType::cpu(DataType::Float64), scale_kernel::<f64>),
    )?;

    builder.operator(OperatorInfo::new("cast").with_infer_shape(infer_cast))?;
    for dtype in NUMERIC {
        builder.kernel("cast", KernelKey::cpu(dtype), KernelEntry::structured(cast_kernel))?;
    }
    Ok(())
}

fn infer_broadcast(ctx: &mut InferShapeContext<'_>) -> Result<(), ShapeError> {
    let x = ctx.input_shape("X", 0)?.to_vec();
    let y = ctx.input_shape("Y", 0)?;
    let shape = cpu::broadcast_shape(&x, y)
        .ok_or_else(|| ShapeError(format!("shapes {x:?} and {y:?} do not broadcast")))?;
    let dtype = ctx.input_dtype("X", 0)?;
    ctx.set_output_meta("Out", 0, shape, dtype)
}

fn infer_same_as_x(ctx: &mut InferShapeContext<'_>) -> Result<(), ShapeError> {
    let shape = ctx.input_shape("X", 0)?.to_vec();
    let dtype = ctx.input_dtype("X", 0)?;
    ctx.set_output_meta("Out", 0, shape, dtype)
}

fn parse_dtype(attr: Option<&Attribute>) -> Option<DataType> {
    attr.and_then(Attribute::as_str)?.parse().ok()
}

fn infer_cast(ctx: &mut InferShapeContext<'_>) -> Result<(), ShapeError> {
    let shape = ctx.input_shape("X", 0)?.to_vec();
    let dtype = parse_dtype(ctx.attr("out_dtype"))
        .ok_or_else(|| ShapeError("`out_dtype` must name a data type".to_string()))?;
    ctx.set_output_meta("Out", 0, shape, dtype)
}

fn typed<'t, T: Element>(t: &'t DenseTensor, what: &str) -> Result<&'t [T], KernelError> {
    t.data::<T>()
        .ok_or_else(|| KernelError(format!("{what} must be an initialized {} tensor", T::DTYPE)))
}

fn add_kernel<T>(ctx: &mut KernelContext<'_>) -> Result<(), KernelError>
where
    T: Element + cpu::ElementAdd,
{
    let x = ctx.required_input(0)?;
    let y = ctx.required_input(1)?;
    let (shape, data) = cpu::add(typed::<T>(x, "X")?, x.shape(), typed::<T>(y, "Y")?, y.shape())
        .ok_or_else(|| KernelError(format!("shapes {:?} and {:?} do not broadcast", x.shape(), y.shape())))?;
    let place = ctx.device_context().place();
    *ctx.required_output(0)? = DenseTensor::from_storage(shape, T::into_storage(data)).with_place(place);
    Ok(())
}

/// Real element types with a conversion from `f64` attributes.
trait Real: Element + Add<Output = Self> + Mul<Output = Self> {
    fn from_f64(v: f64) -> Self;
}

impl Real for f32 {
    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Real for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }
}

fn scale_kernel<T: Real>(ctx: &mut ExecutionContext<'_>) -> Result<(), KernelError> {
    let x = ctx.required_input("X")?;
    let factor = ctx.attr("scale").and_then(Attribute::as_f64).unwrap_or(1.0);
    let bias = ctx.attr("bias").and_then(Attribute::as_f64).unwrap_or(0.0);
    let after = ctx
        .attr("bias_after_scale")
        .and_then(Attribute::as_bool)
        .unwrap_or(true);
    let data = cpu::scale(typed::<T>(x, "X")?, T::from_f64(factor), T::from_f64(bias), after);
    let place = ctx.place();
    *ctx.output("Out")? = DenseTensor::from_storage(x.shape(), T::into_storage(data)).with_place(place);
    Ok(())
}

fn cast_kernel(ctx: &mut ExecutionContext<'_>) -> Result<(), KernelError> {
    let x = ctx.required_input("X")?;
    let target = parse_dtype(ctx.attr("out_dtype"))
        .ok_or_else(|| KernelError("`out_dtype` must name a data type".to_string()))?;
    let out = x
        .cast(target)
        .ok_or_else(|| KernelError(format!("cannot cast {} to {target}", x.dtype())))?;
    *ctx.output("Out")? = out;
    Ok(())
}
