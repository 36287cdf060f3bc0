//! Input data transformation.
//!
//! Before a unified kernel runs, each initialized input is compared with
//! the [`ArgDef`] the kernel declared for it. An input that disagrees on
//! device family, layout or dtype is rewritten by a [`DataTransform`] into
//! a fresh tensor; the caller's variable is left alone.

use tracing::trace;

use crate::backend::{Backend, DataLayout, DataType, Place, backends_are_same_class};
use crate::error::{DispatchError, DispatchResult};
use crate::registry::ArgDef;
use crate::tensor::DenseTensor;

/// Whether `tensor` must be transformed to satisfy `def`.
#[must_use]
pub fn needs_transform(tensor: &DenseTensor, def: &ArgDef) -> bool {
    if !tensor.is_initialized() {
        return false;
    }
    let backend_ok = def.backend == Backend::All
        || backends_are_same_class(def.backend, Backend::from_place(tensor.place()));
    let layout_ok = def.layout == DataLayout::Any || def.layout == tensor.layout();
    let dtype_ok = def.dtype == DataType::Undefined || def.dtype == tensor.dtype();
    !(backend_ok && layout_ok && dtype_ok)
}

/// Rewrites a tensor to match a kernel argument.
pub trait DataTransform: Send + Sync + std::fmt::Debug {
    /// Produces a tensor satisfying `def`.
    ///
    /// `device_place` is the place of the device context the kernel runs
    /// on; it supplies the device ordinal when the backend changes family.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::TransformFailure`] if the conversion is not
    /// possible.
    fn transform(
        &self,
        var: &str,
        tensor: &DenseTensor,
        def: &ArgDef,
        device_place: Place,
    ) -> DispatchResult<DenseTensor>;
}

/// Host-memory transform: casts dtypes, relabels layout and place.
///
/// Tensor storage always lives in host memory in this crate, so moving
/// between devices only changes the place tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDataTransform;

impl DataTransform for HostDataTransform {
    fn transform(
        &self,
        var: &str,
        tensor: &DenseTensor,
        def: &ArgDef,
        device_place: Place,
    ) -> DispatchResult<DenseTensor> {
        let mut out = if def.dtype == DataType::Undefined || def.dtype == tensor.dtype() {
            tensor.clone()
        } else {
            tensor.cast(def.dtype).ok_or_else(|| DispatchError::TransformFailure {
                var: var.to_string(),
                from: tensor.dtype(),
                to: def.dtype,
                message: "unsupported cast".to_string(),
            })?
        };
        if def.layout != DataLayout::Any && def.layout != out.layout() {
            out = out.with_layout(def.layout);
        }
        if def.backend != Backend::All
            && !backends_are_same_class(def.backend, Backend::from_place(out.place()))
        {
            out = out.with_place(def.backend.to_place(device_place.device_id()));
        }
        trace!(
            var,
            from_dtype = %tensor.dtype(),
            to_dtype = %out.dtype(),
            from_place = %tensor.place(),
            to_place = %out.place(),
            "transformed input"
        );
        Ok(out)
    }
}
