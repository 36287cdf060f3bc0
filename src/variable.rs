//! Variables: named slots that hold tensors.
//!
//! The dispatcher works over any variable representation implementing
//! [`VariableLike`]. Two are provided:
//!
//! - [`Variable`]: the graph variable, which can record the dtype its
//!   forward counterpart had (used to repair complex gradients);
//! - [`EagerVariable`]: a lighter representation that has no notion of a
//!   forward dtype.
//!
//! Kernels and contexts never see the concrete type; they go through the
//! object-safe [`VarMapView`] / [`VarMapViewMut`] projections.

use std::collections::BTreeMap;

use crate::backend::DataType;
use crate::tensor::DenseTensor;

/// Common interface of variable representations.
pub trait VariableLike {
    /// Variable name.
    fn name(&self) -> &str;

    /// Held tensor, if any.
    fn tensor(&self) -> Option<&DenseTensor>;

    /// Held tensor, creating an empty one if missing.
    fn tensor_mut(&mut self) -> &mut DenseTensor;

    /// Rebinds the variable to `tensor`.
    fn set_tensor(&mut self, tensor: DenseTensor);

    /// Whether this representation can carry a forward dtype at all.
    fn tracks_forward_dtype(&self) -> bool {
        false
    }

    /// Dtype of the forward variable this one is the gradient of.
    fn forward_dtype(&self) -> Option<DataType> {
        None
    }
}

/// Graph variable with an optional forward dtype annotation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variable {
    name: String,
    tensor: Option<DenseTensor>,
    forward_dtype: Option<DataType>,
}

impl Variable {
    /// Empty variable.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Builder: binds a tensor.
    #[must_use]
    pub fn with_tensor(mut self, tensor: impl Into<DenseTensor>) -> Self {
        self.tensor = Some(tensor.into());
        self
    }

    /// Builder: records the forward dtype.
    #[must_use]
    pub const fn with_forward_dtype(mut self, dtype: DataType) -> Self {
        self.forward_dtype = Some(dtype);
        self
    }
}

impl VariableLike for Variable {
    fn name(&self) -> &str {
        &self.name
    }

    fn tensor(&self) -> Option<&DenseTensor> {
        self.tensor.as_ref()
    }

    fn tensor_mut(&mut self) -> &mut DenseTensor {
        self.tensor.get_or_insert_with(DenseTensor::default)
    }

    fn set_tensor(&mut self, tensor: DenseTensor) {
        self.tensor = Some(tensor);
    }

    fn tracks_forward_dtype(&self) -> bool {
        true
    }

    fn forward_dtype(&self) -> Option<DataType> {
        self.forward_dtype
    }
}

/// Variable without a forward dtype concept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EagerVariable {
    name: String,
    tensor: Option<DenseTensor>,
}

impl EagerVariable {
    /// Empty variable.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tensor: None,
        }
    }

    /// Builder: binds a tensor.
    #[must_use]
    pub fn with_tensor(mut self, tensor: impl Into<DenseTensor>) -> Self {
        self.tensor = Some(tensor.into());
        self
    }
}

impl VariableLike for EagerVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn tensor(&self) -> Option<&DenseTensor> {
        self.tensor.as_ref()
    }

    fn tensor_mut(&mut self) -> &mut DenseTensor {
        self.tensor.get_or_insert_with(DenseTensor::default)
    }

    fn set_tensor(&mut self, tensor: DenseTensor) {
        self.tensor = Some(tensor);
    }
}

/// Parameter name to variable list.
pub type NameVarMap<V> = BTreeMap<String, Vec<V>>;

/// Read-only, type-erased view of a [`NameVarMap`].
pub trait VarMapView {
    /// Parameter names, in order.
    fn names(&self) -> Vec<&str>;

    /// Number of variables under `name`, `None` if the parameter is absent.
    fn len_of(&self, name: &str) -> Option<usize>;

    /// The `idx`-th variable under `name`.
    fn var(&self, name: &str, idx: usize) -> Option<&dyn VariableLike>;

    /// Whether `name` is present with at least one variable.
    fn has(&self, name: &str) -> bool {
        self.len_of(name).is_some_and(|n| n > 0)
    }

    /// Tensor of the `idx`-th variable under `name`.
    fn tensor(&self, name: &str, idx: usize) -> Option<&DenseTensor> {
        self.var(name, idx)?.tensor()
    }
}

/// Mutable, type-erased view of a [`NameVarMap`].
pub trait VarMapViewMut: VarMapView {
    /// The `idx`-th variable under `name`, mutably.
    fn var_mut(&mut self, name: &str, idx: usize) -> Option<&mut dyn VariableLike>;
}

impl<V: VariableLike> VarMapView for NameVarMap<V> {
    fn names(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }

    fn len_of(&self, name: &str) -> Option<usize> {
        self.get(name).map(Vec::len)
    }

    fn var(&self, name: &str, idx: usize) -> Option<&dyn VariableLike> {
        self.get(name)?
            .get(idx)
            .map(|v| v as &dyn VariableLike)
    }
}

impl<V: VariableLike> VarMapViewMut for NameVarMap<V> {
    fn var_mut(&mut self, name: &str, idx: usize) -> Option<&mut dyn VariableLike> {
        self.get_mut(name)?
            .get_mut(idx)
            .map(|v| v as &mut dyn VariableLike)
    }
}
