//! Views handed to policies, shape inference and kernels.
//!
//! None of these own tensors. They borrow the caller's variable maps through
//! the object-safe [`VarMapView`] projections, so building one costs a few
//! pointers no matter how large the inputs are.
//!
//! - [`InvocationContext`]: read-only view used by kernel-type policies,
//!   eligibility predicates and argument mapping.
//! - [`InferShapeContext`]: what shape inference sees; may set output
//!   metadata.
//! - [`KernelContext`]: arguments of a unified function kernel, addressed by
//!   signature position.
//! - [`ExecutionContext`]: arguments of structured and legacy kernels,
//!   addressed by parameter name.

use std::collections::BTreeMap;

use crate::attribute::{Attribute, Attributes};
use crate::backend::{DataType, Place};
use crate::device::DeviceContext;
use crate::error::{KernelError, ShapeError};
use crate::kernel_key::KernelKey;
use crate::signature::{ArgumentMappingContext, KernelSignature};
use crate::tensor::DenseTensor;
use crate::variable::{VarMapView, VarMapViewMut};

/// Inputs rewritten by data transformation, by (parameter, variable index).
pub type TransformedInputs = BTreeMap<(String, usize), DenseTensor>;

/// Read-only view of an invocation.
#[derive(Clone, Copy)]
pub struct InvocationContext<'a> {
    op_type: &'a str,
    ins: &'a dyn VarMapView,
    outs: &'a dyn VarMapView,
    attrs: Attributes<'a>,
    place: Place,
}

impl<'a> InvocationContext<'a> {
    /// Builds the view.
    pub fn new(
        op_type: &'a str,
        ins: &'a dyn VarMapView,
        outs: &'a dyn VarMapView,
        attrs: Attributes<'a>,
        place: Place,
    ) -> Self {
        Self { op_type, ins, outs, attrs, place }
    }

    /// Operator type.
    #[must_use]
    pub const fn op_type(&self) -> &'a str {
        self.op_type
    }

    /// Target place.
    #[must_use]
    pub const fn place(&self) -> Place {
        self.place
    }

    /// Inputs.
    #[must_use]
    pub fn ins(&self) -> &'a dyn VarMapView {
        self.ins
    }

    /// Outputs.
    #[must_use]
    pub fn outs(&self) -> &'a dyn VarMapView {
        self.outs
    }

    /// Merged attributes.
    #[must_use]
    pub const fn attrs(&self) -> Attributes<'a> {
        self.attrs
    }

    /// First tensor of input `name`.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&'a DenseTensor> {
        self.ins.tensor(name, 0)
    }
}

impl ArgumentMappingContext for InvocationContext<'_> {
    fn has_input(&self, name: &str) -> bool {
        self.ins.has(name)
    }

    fn has_output(&self, name: &str) -> bool {
        self.outs.has(name)
    }

    fn has_attr(&self, name: &str) -> bool {
        self.attrs.contains(name)
    }

    fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }

    fn input_count(&self, name: &str) -> usize {
        self.ins.len_of(name).unwrap_or(0)
    }

    fn output_count(&self, name: &str) -> usize {
        self.outs.len_of(name).unwrap_or(0)
    }
}

/// View handed to shape-inference procedures.
pub struct InferShapeContext<'a> {
    op_type: &'a str,
    ins: &'a dyn VarMapView,
    outs: &'a mut dyn VarMapViewMut,
    attrs: Attributes<'a>,
    kernel_key: KernelKey,
    signature: Option<&'a KernelSignature>,
}

impl<'a> InferShapeContext<'a> {
    /// Builds the view.
    pub fn new(
        op_type: &'a str,
        ins: &'a dyn VarMapView,
        outs: &'a mut dyn VarMapViewMut,
        attrs: Attributes<'a>,
        kernel_key: KernelKey,
        signature: Option<&'a KernelSignature>,
    ) -> Self {
        Self { op_type, ins, outs, attrs, kernel_key, signature }
    }

    /// Operator type.
    #[must_use]
    pub const fn op_type(&self) -> &str {
        self.op_type
    }

    /// Key of the kernel about to run.
    #[must_use]
    pub const fn kernel_key(&self) -> KernelKey {
        self.kernel_key
    }

    /// Signature of the kernel about to run, if it has one.
    #[must_use]
    pub const fn signature(&self) -> Option<&KernelSignature> {
        self.signature
    }

    /// Whether input `name` is present.
    #[must_use]
    pub fn has_input(&self, name: &str) -> bool {
        self.ins.has(name)
    }

    /// Whether output `name` is present.
    #[must_use]
    pub fn has_output(&self, name: &str) -> bool {
        self.outs.has(name)
    }

    /// Attribute value.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }

    /// Shape of input `name[idx]`.
    ///
    /// # Errors
    ///
    /// Fails if the input is missing.
    pub fn input_shape(&self, name: &str, idx: usize) -> Result<&[usize], ShapeError> {
        self.ins
            .tensor(name, idx)
            .map(DenseTensor::shape)
            .ok_or_else(|| ShapeError(format!("input `{name}`[{idx}] is missing")))
    }

    /// Dtype of input `name[idx]`.
    ///
    /// # Errors
    ///
    /// Fails if the input is missing.
    pub fn input_dtype(&self, name: &str, idx: usize) -> Result<DataType, ShapeError> {
        self.ins
            .tensor(name, idx)
            .map(DenseTensor::dtype)
            .ok_or_else(|| ShapeError(format!("input `{name}`[{idx}] is missing")))
    }

    /// Sets shape and dtype of output `name[idx]`.
    ///
    /// # Errors
    ///
    /// Fails if the output slot does not exist.
    pub fn set_output_meta(
        &mut self,
        name: &str,
        idx: usize,
        shape: impl Into<Vec<usize>>,
        dtype: DataType,
    ) -> Result<(), ShapeError> {
        let var = self
            .outs
            .var_mut(name, idx)
            .ok_or_else(|| ShapeError(format!("output `{name}`[{idx}] is missing")))?;
        var.tensor_mut().set_meta(shape, dtype);
        Ok(())
    }
}

/// Arguments of a unified function kernel.
///
/// Inputs, attributes and outputs are addressed by their position in the
/// kernel signature. Inputs rewritten by data transformation shadow the
/// caller's tensors.
pub struct KernelContext<'a> {
    dev_ctx: &'a dyn DeviceContext,
    signature: &'a KernelSignature,
    ins: &'a dyn VarMapView,
    transformed: &'a TransformedInputs,
    outs: &'a mut dyn VarMapViewMut,
    attrs: Attributes<'a>,
}

impl<'a> KernelContext<'a> {
    /// Builds the context.
    pub fn new(
        dev_ctx: &'a dyn DeviceContext,
        signature: &'a KernelSignature,
        ins: &'a dyn VarMapView,
        transformed: &'a TransformedInputs,
        outs: &'a mut dyn VarMapViewMut,
        attrs: Attributes<'a>,
    ) -> Self {
        Self { dev_ctx, signature, ins, transformed, outs, attrs }
    }

    /// Device context the kernel runs on.
    #[must_use]
    pub fn device_context(&self) -> &dyn DeviceContext {
        self.dev_ctx
    }

    /// The kernel signature.
    #[must_use]
    pub const fn signature(&self) -> &KernelSignature {
        self.signature
    }

    /// Number of signature inputs.
    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.signature.inputs.len()
    }

    /// Number of signature outputs.
    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.signature.outputs.len()
    }

    fn tensor_at(&self, name: &str, var_idx: usize) -> Option<&'a DenseTensor> {
        self.transformed
            .get(&(name.to_string(), var_idx))
            .or_else(|| self.ins.tensor(name, var_idx))
    }

    /// First tensor bound to signature input `idx`; `None` for an absent
    /// optional input.
    #[must_use]
    pub fn input(&self, idx: usize) -> Option<&'a DenseTensor> {
        let name = self.signature.inputs.get(idx)?;
        self.tensor_at(name, 0)
    }

    /// First tensor bound to signature input `idx`.
    ///
    /// # Errors
    ///
    /// Fails if the input is absent.
    pub fn required_input(&self, idx: usize) -> Result<&'a DenseTensor, KernelError> {
        self.input(idx).ok_or_else(|| {
            let name = self.signature.inputs.get(idx).map_or("?", String::as_str);
            KernelError(format!("missing input #{idx} `{name}`"))
        })
    }

    /// Every tensor bound to signature input `idx`.
    #[must_use]
    pub fn inputs(&self, idx: usize) -> Vec<&'a DenseTensor> {
        let Some(name) = self.signature.inputs.get(idx) else {
            return Vec::new();
        };
        (0..self.ins.len_of(name).unwrap_or(0))
            .filter_map(|i| self.tensor_at(name, i))
            .collect()
    }

    /// Attribute at signature position `idx`.
    #[must_use]
    pub fn attr(&self, idx: usize) -> Option<&'a Attribute> {
        self.signature
            .attributes
            .get(idx)
            .and_then(|name| self.attrs.get(name))
    }

    /// First output tensor at signature position `idx`.
    pub fn output(&mut self, idx: usize) -> Option<&mut DenseTensor> {
        self.output_at(idx, 0)
    }

    /// Number of variables bound to signature output `idx`.
    #[must_use]
    pub fn outputs_len(&self, idx: usize) -> usize {
        self.signature
            .outputs
            .get(idx)
            .and_then(|name| self.outs.len_of(name))
            .unwrap_or(0)
    }

    /// The `var_idx`-th tensor bound to signature output `idx`.
    pub fn output_at(&mut self, idx: usize, var_idx: usize) -> Option<&mut DenseTensor> {
        let name = self.signature.outputs.get(idx)?;
        self.outs.var_mut(name, var_idx).map(|v| v.tensor_mut())
    }

    /// Output tensor at signature position `idx`.
    ///
    /// # Errors
    ///
    /// Fails if the output slot does not exist.
    pub fn required_output(&mut self, idx: usize) -> Result<&mut DenseTensor, KernelError> {
        let name = self
            .signature
            .outputs
            .get(idx)
            .ok_or_else(|| KernelError(format!("signature has no output #{idx}")))?;
        self.outs
            .var_mut(name, 0)
            .map(|v| v.tensor_mut())
            .ok_or_else(|| KernelError(format!("missing output `{name}`")))
    }
}

/// Parameter names of the running operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeContext {
    /// Input parameter names.
    pub inputs: Vec<String>,
    /// Output parameter names.
    pub outputs: Vec<String>,
}

impl RuntimeContext {
    /// Collects names from the two maps.
    #[must_use]
    pub fn from_maps(ins: &dyn VarMapView, outs: &dyn VarMapView) -> Self {
        let own = |names: Vec<&str>| -> Vec<String> { names.into_iter().map(str::to_string).collect() };
        Self {
            inputs: own(ins.names()),
            outputs: own(outs.names()),
        }
    }
}

/// Arguments of structured and legacy kernels.
pub struct ExecutionContext<'a> {
    op_type: &'a str,
    dev_ctx: &'a dyn DeviceContext,
    runtime: &'a RuntimeContext,
    ins: &'a dyn VarMapView,
    transformed: &'a TransformedInputs,
    outs: &'a mut dyn VarMapViewMut,
    attrs: Attributes<'a>,
}

impl<'a> ExecutionContext<'a> {
    /// Builds the context.
    pub fn new(
        op_type: &'a str,
        dev_ctx: &'a dyn DeviceContext,
        runtime: &'a RuntimeContext,
        ins: &'a dyn VarMapView,
        transformed: &'a TransformedInputs,
        outs: &'a mut dyn VarMapViewMut,
        attrs: Attributes<'a>,
    ) -> Self {
        Self { op_type, dev_ctx, runtime, ins, transformed, outs, attrs }
    }

    /// Operator type.
    #[must_use]
    pub const fn op_type(&self) -> &str {
        self.op_type
    }

    /// Device context.
    #[must_use]
    pub fn device_context(&self) -> &dyn DeviceContext {
        self.dev_ctx
    }

    /// Place of the device context.
    #[must_use]
    pub fn place(&self) -> Place {
        self.dev_ctx.place()
    }

    /// Runtime context.
    #[must_use]
    pub const fn runtime_context(&self) -> &RuntimeContext {
        self.runtime
    }

    /// Raw inputs.
    #[must_use]
    pub fn ins(&self) -> &dyn VarMapView {
        self.ins
    }

    /// Raw outputs.
    pub fn outs_mut(&mut self) -> &mut dyn VarMapViewMut {
        &mut *self.outs
    }

    /// Whether input `name` is present.
    #[must_use]
    pub fn has_input(&self, name: &str) -> bool {
        self.ins.has(name)
    }

    /// First tensor of input `name`.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&'a DenseTensor> {
        self.transformed
            .get(&(name.to_string(), 0))
            .or_else(|| self.ins.tensor(name, 0))
    }

    /// First tensor of input `name`.
    ///
    /// # Errors
    ///
    /// Fails if the input is absent.
    pub fn required_input(&self, name: &str) -> Result<&'a DenseTensor, KernelError> {
        self.input(name)
            .ok_or_else(|| KernelError(format!("missing input `{name}`")))
    }

    /// Every tensor of input `name`.
    #[must_use]
    pub fn multi_input(&self, name: &str) -> Vec<&'a DenseTensor> {
        (0..self.ins.len_of(name).unwrap_or(0))
            .filter_map(|i| {
                self.transformed
                    .get(&(name.to_string(), i))
                    .or_else(|| self.ins.tensor(name, i))
            })
            .collect()
    }

    /// First tensor of output `name`.
    ///
    /// # Errors
    ///
    /// Fails if the output slot does not exist.
    pub fn output(&mut self, name: &str) -> Result<&mut DenseTensor, KernelError> {
        self.outs
            .var_mut(name, 0)
            .map(|v| v.tensor_mut())
            .ok_or_else(|| KernelError(format!("missing output `{name}`")))
    }

    /// Attribute value.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&'a Attribute> {
        self.attrs.get(name)
    }
}
