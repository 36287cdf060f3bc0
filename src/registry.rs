//! Operator and kernel registries.
//!
//! A [`Registry`] is built once through a [`RegistryBuilder`] and is
//! immutable afterwards; every resolution reads from it. It holds:
//!
//! - the operator table ([`OperatorInfo`]): shape inference, kernel-type
//!   policy, library eligibility and the legacy kernel table of each op;
//! - the unified [`KernelFactory`], keyed by kernel name then [`KernelKey`];
//! - argument-mapping functions and default signatures;
//! - the library-override table and the accelerator policies.

#![allow(clippy::type_complexity)]

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use briny::prelude::*;

use crate::backend::{Backend, BackendClass, DataLayout, DataType, LibraryType, Place};
use crate::context::{ExecutionContext, InferShapeContext, InvocationContext, KernelContext};
use crate::error::{DispatchError, DispatchResult, KernelError, ShapeError};
use crate::fallback::AcceleratorPolicy;
use crate::kernel_key::{self, KernelKey, Library, LibraryOverride};
use crate::signature::{ArgumentMappingFn, KernelSignature};

/// Unified kernel taking a per-signature argument context.
pub type KernelFn = Arc<dyn Fn(&mut KernelContext<'_>) -> Result<(), KernelError> + Send + Sync>;

/// Structured unified kernel, invoked like a legacy kernel.
pub type StructuredKernelFn =
    Arc<dyn Fn(&mut ExecutionContext<'_>) -> Result<(), KernelError> + Send + Sync>;

/// Legacy kernel.
pub type LegacyKernelFn =
    Arc<dyn Fn(&mut ExecutionContext<'_>) -> Result<(), KernelError> + Send + Sync>;

/// Shape-inference procedure.
pub type InferShapeFn =
    Arc<dyn Fn(&mut InferShapeContext<'_>) -> Result<(), ShapeError> + Send + Sync>;

/// Kernel-type policy of an operator.
pub type KernelTypeFn =
    Arc<dyn Fn(&InvocationContext<'_>) -> DispatchResult<KernelKey> + Send + Sync>;

/// Per-operator library eligibility predicate.
pub type EligibilityFn = Arc<dyn Fn(&InvocationContext<'_>, DataType) -> bool + Send + Sync>;

/// What a kernel argument expects from the tensor bound to it.
///
/// `Backend::All`, `DataLayout::Any` and `DataType::Undefined` accept
/// anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ArgDef {
    /// Required backend.
    pub backend: Backend,
    /// Required layout.
    pub layout: DataLayout,
    /// Required dtype.
    pub dtype: DataType,
}

impl ArgDef {
    /// Accepts any tensor.
    #[must_use]
    pub const fn any() -> Self {
        Self {
            backend: Backend::All,
            layout: DataLayout::Any,
            dtype: DataType::Undefined,
        }
    }

    /// Requires the backend, layout and dtype of `key`.
    #[must_use]
    pub const fn from_key(key: KernelKey) -> Self {
        Self {
            backend: key.backend,
            layout: key.layout,
            dtype: key.dtype,
        }
    }
}

/// Body of a unified kernel.
#[derive(Clone)]
pub enum KernelKind {
    /// Plain function over a [`KernelContext`].
    Function(KernelFn),
    /// Structured kernel over an [`ExecutionContext`].
    Structured(StructuredKernelFn),
}

impl fmt::Debug for KernelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Function(_) => "Function",
            Self::Structured(_) => "Structured",
        })
    }
}

/// A registered unified kernel.
#[derive(Debug, Clone)]
pub struct KernelEntry {
    /// Kernel body.
    pub kind: KernelKind,
    /// Per-input requirements, by signature position.
    pub inputs: Vec<ArgDef>,
    /// Per-output requirements, by signature position.
    pub outputs: Vec<ArgDef>,
}

impl KernelEntry {
    /// Function kernel without argument requirements.
    pub fn function(
        f: impl Fn(&mut KernelContext<'_>) -> Result<(), KernelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: KernelKind::Function(Arc::new(f)),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Structured kernel.
    pub fn structured(
        f: impl Fn(&mut ExecutionContext<'_>) -> Result<(), KernelError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind: KernelKind::Structured(Arc::new(f)),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Sets input requirements.
    #[must_use]
    pub fn with_inputs(mut self, defs: impl Into<Vec<ArgDef>>) -> Self {
        self.inputs = defs.into();
        self
    }

    /// Sets output requirements.
    #[must_use]
    pub fn with_outputs(mut self, defs: impl Into<Vec<ArgDef>>) -> Self {
        self.outputs = defs.into();
        self
    }

    /// Requirement of input `idx`; unlisted inputs accept anything.
    #[must_use]
    pub fn input_def(&self, idx: usize) -> ArgDef {
        self.inputs.get(idx).copied().unwrap_or_else(ArgDef::any)
    }

    /// Whether this is a structured kernel.
    #[must_use]
    pub const fn is_structured(&self) -> bool {
        matches!(self.kind, KernelKind::Structured(_))
    }
}

/// Unified kernels by name and key.
#[derive(Debug, Default, Clone)]
pub struct KernelFactory {
    kernels: HashMap<String, HashMap<KernelKey, KernelEntry>>,
}

impl KernelFactory {
    fn insert(&mut self, name: &str, key: KernelKey, entry: KernelEntry) -> Option<KernelEntry> {
        self.kernels
            .entry(name.to_string())
            .or_default()
            .insert(key, entry)
    }

    /// Finds the kernel for `key`.
    ///
    /// An exact match wins; otherwise a kernel registered for the plain
    /// layout on the same backend and dtype serves any layout.
    #[must_use]
    pub fn select_kernel(&self, name: &str, key: &KernelKey) -> Option<&KernelEntry> {
        let by_key = self.kernels.get(name)?;
        by_key.get(key).or_else(|| {
            (key.layout != DataLayout::Any)
                .then(|| KernelKey::new(key.backend, DataLayout::Any, key.dtype))
                .and_then(|plain| by_key.get(&plain))
        })
    }

    /// Whether a kernel exists for `key`.
    #[must_use]
    pub fn has_kernel(&self, name: &str, key: &KernelKey) -> bool {
        self.select_kernel(name, key).is_some()
    }

    /// Whether any structured kernel is registered under `name`.
    #[must_use]
    pub fn has_structured_kernel(&self, name: &str) -> bool {
        self.kernels
            .get(name)
            .is_some_and(|by_key| by_key.values().any(KernelEntry::is_structured))
    }

    /// Keys registered under `name`, sorted.
    #[must_use]
    pub fn keys(&self, name: &str) -> Vec<KernelKey> {
        let mut keys: Vec<_> = self
            .kernels
            .get(name)
            .map(|by_key| by_key.keys().copied().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

/// Descriptor of a legacy kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LegacyKernelType {
    /// Target place.
    pub place: Place,
    /// Layout.
    pub layout: DataLayout,
    /// Element type.
    pub dtype: DataType,
    /// Accelerator library tag.
    pub library: LibraryType,
}

impl LegacyKernelType {
    /// Builds a descriptor.
    #[must_use]
    pub const fn new(place: Place, layout: DataLayout, dtype: DataType, library: LibraryType) -> Self {
        Self { place, layout, dtype, library }
    }

    /// Plain host descriptor for `dtype`.
    #[must_use]
    pub const fn cpu(dtype: DataType) -> Self {
        Self::new(Place::Cpu, DataLayout::Any, dtype, LibraryType::Plain)
    }

    /// Translates a unified key, placing it on device `device_id`.
    #[must_use]
    pub const fn from_key(key: KernelKey, device_id: u32) -> Self {
        Self::new(
            key.backend.to_place(device_id),
            key.layout,
            key.dtype,
            key.backend.library(),
        )
    }

    /// Same descriptor on the host.
    #[must_use]
    pub const fn on_cpu(self) -> Self {
        Self { place: Place::Cpu, library: LibraryType::Plain, ..self }
    }

    /// Table key: device ordinals do not take part in lookups.
    const fn lookup_key(self) -> Self {
        Self { place: self.place.family(), ..self }
    }
}

impl fmt::Display for LegacyKernelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{data_type[{}]; data_layout[{}]; place[{}]; library_type[{}]}}",
            self.dtype, self.layout, self.place, self.library
        )
    }
}

/// Static description of an operator.
#[derive(Clone)]
pub struct OperatorInfo {
    op_type: String,
    infer_shape: Option<InferShapeFn>,
    kernel_type: Option<KernelTypeFn>,
    eligibility: HashMap<Library, EligibilityFn>,
    dnn_fallback: bool,
    legacy_kernels: HashMap<LegacyKernelType, LegacyKernelFn>,
}

impl fmt::Debug for OperatorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut legacy: Vec<_> = self.legacy_kernels.keys().collect();
        legacy.sort();
        f.debug_struct("OperatorInfo")
            .field("op_type", &self.op_type)
            .field("has_infer_shape", &self.infer_shape.is_some())
            .field("has_kernel_type", &self.kernel_type.is_some())
            .field("dnn_fallback", &self.dnn_fallback)
            .field("legacy_kernels", &legacy)
            .finish_non_exhaustive()
    }
}

impl OperatorInfo {
    /// Operator with default kernel-type policy and no shape inference.
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            infer_shape: None,
            kernel_type: None,
            eligibility: HashMap::new(),
            dnn_fallback: false,
            legacy_kernels: HashMap::new(),
        }
    }

    /// Sets the shape-inference procedure.
    #[must_use]
    pub fn with_infer_shape(
        mut self,
        f: impl Fn(&mut InferShapeContext<'_>) -> Result<(), ShapeError> + Send + Sync + 'static,
    ) -> Self {
        self.infer_shape = Some(Arc::new(f));
        self
    }

    /// Sets the kernel-type policy.
    #[must_use]
    pub fn with_kernel_type(
        mut self,
        f: impl Fn(&InvocationContext<'_>) -> DispatchResult<KernelKey> + Send + Sync + 'static,
    ) -> Self {
        self.kernel_type = Some(Arc::new(f));
        self
    }

    /// Sets the eligibility predicate for `library`.
    #[must_use]
    pub fn with_eligibility(
        mut self,
        library: Library,
        f: impl Fn(&InvocationContext<'_>, DataType) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.eligibility.insert(library, Arc::new(f));
        self
    }

    /// Marks the op as never using oneDNN.
    #[must_use]
    pub const fn with_dnn_fallback(mut self, on: bool) -> Self {
        self.dnn_fallback = on;
        self
    }

    /// Registers a legacy kernel.
    #[must_use]
    pub fn with_legacy_kernel(
        mut self,
        kernel_type: LegacyKernelType,
        f: impl Fn(&mut ExecutionContext<'_>) -> Result<(), KernelError> + Send + Sync + 'static,
    ) -> Self {
        self.legacy_kernels
            .insert(kernel_type.lookup_key(), Arc::new(f));
        self
    }

    /// Operator type.
    #[must_use]
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    /// Whether oneDNN is disabled for this op.
    #[must_use]
    pub const fn dnn_fallback(&self) -> bool {
        self.dnn_fallback
    }

    /// Shape-inference procedure, if registered.
    #[must_use]
    pub fn infer_shape(&self) -> Option<&InferShapeFn> {
        self.infer_shape.as_ref()
    }

    /// Runs the kernel-type policy, or the default one.
    ///
    /// # Errors
    ///
    /// Propagates the policy's rejection.
    pub fn kernel_type(&self, ctx: &InvocationContext<'_>) -> DispatchResult<KernelKey> {
        match &self.kernel_type {
            Some(policy) => policy(ctx),
            None => kernel_key::default_kernel_type(ctx),
        }
    }

    /// Whether the op accepts `library` for this invocation.
    ///
    /// Without a registered predicate, the op must request the library
    /// through its boolean request attribute; libraries without one are
    /// always accepted.
    #[must_use]
    pub fn is_eligible(&self, library: Library, ctx: &InvocationContext<'_>, dtype: DataType) -> bool {
        if let Some(pred) = self.eligibility.get(&library) {
            return pred(ctx, dtype);
        }
        library.request_attr().is_none_or(|attr| {
            ctx.attrs()
                .get(attr)
                .and_then(crate::attribute::Attribute::as_bool)
                .unwrap_or(false)
        })
    }

    /// Legacy kernel for `kernel_type`.
    #[must_use]
    pub fn legacy_kernel(&self, kernel_type: &LegacyKernelType) -> Option<&LegacyKernelFn> {
        self.legacy_kernels.get(&kernel_type.lookup_key())
    }

    /// Whether the op has any legacy kernel.
    #[must_use]
    pub fn has_legacy_kernels(&self) -> bool {
        !self.legacy_kernels.is_empty()
    }
}

/// Immutable registry read during resolution.
#[derive(Default)]
pub struct Registry {
    operators: HashMap<String, OperatorInfo>,
    kernels: KernelFactory,
    argument_mappings: HashMap<String, ArgumentMappingFn>,
    default_signatures: HashMap<String, KernelSignature>,
    overrides: Vec<LibraryOverride>,
    accelerators: Vec<AcceleratorPolicy>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut mapped: Vec<_> = self.argument_mappings.keys().collect();
        mapped.sort();
        f.debug_struct("Registry")
            .field("operators", &self.operators.len())
            .field("kernels", &self.kernels.kernels.len())
            .field("argument_mappings", &mapped)
            .field("default_signatures", &self.default_signatures.len())
            .field("overrides", &self.overrides)
            .field("accelerators", &self.accelerators)
            .finish()
    }
}

impl Registry {
    /// Starts a builder.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Operator description.
    #[must_use]
    pub fn operator(&self, op_type: &str) -> Option<&OperatorInfo> {
        self.operators.get(op_type)
    }

    /// Unified kernel factory.
    #[must_use]
    pub const fn kernels(&self) -> &KernelFactory {
        &self.kernels
    }

    /// Custom argument mapping of `op_type`.
    #[must_use]
    pub fn argument_mapping_fn(&self, op_type: &str) -> Option<&ArgumentMappingFn> {
        self.argument_mappings.get(op_type)
    }

    /// Default signature of `op_type`.
    #[must_use]
    pub fn default_signature(&self, op_type: &str) -> Option<&KernelSignature> {
        self.default_signatures.get(op_type)
    }

    /// Library overrides, in priority order.
    #[must_use]
    pub fn overrides(&self) -> &[LibraryOverride] {
        &self.overrides
    }

    /// Degradation policy for the accelerator class of `backend`.
    #[must_use]
    pub fn accelerator_policy(&self, backend: Backend) -> Option<&AcceleratorPolicy> {
        let class = backend.class();
        self.accelerators.iter().find(|p| p.class() == class)
    }
}

/// Builds a [`Registry`].
#[derive(Debug)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    /// Empty registry with host degradation for XPU, IPU and custom devices.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();
        registry.accelerators = [BackendClass::Xpu, BackendClass::Ipu, BackendClass::Custom]
            .into_iter()
            .map(AcceleratorPolicy::new)
            .collect();
        Self { registry }
    }

    /// Registers an operator.
    ///
    /// # Errors
    ///
    /// Fails if the op type is empty or already registered.
    pub fn operator(&mut self, info: OperatorInfo) -> DispatchResult<&mut Self> {
        let name = info.op_type().to_string();
        if name.trim().is_empty() {
            return Err(invalid(&name, "empty operator type"));
        }
        if self.registry.operators.contains_key(&name) {
            return Err(invalid(&name, "operator registered twice"));
        }
        self.registry.operators.insert(name, info);
        Ok(self)
    }

    /// Registers a unified kernel.
    ///
    /// # Errors
    ///
    /// Fails if the key has no dtype or is already taken for `name`.
    pub fn kernel(&mut self, name: &str, key: KernelKey, entry: KernelEntry) -> DispatchResult<&mut Self> {
        if key.dtype == DataType::Undefined {
            return Err(invalid(name, "kernel key without dtype"));
        }
        if self.registry.kernels.kernels.get(name).is_some_and(|m| m.contains_key(&key)) {
            return Err(invalid(name, &format!("kernel {key} registered twice")));
        }
        self.registry.kernels.insert(name, key, entry);
        Ok(self)
    }

    /// Registers a custom argument mapping.
    pub fn argument_mapping(
        &mut self,
        op_type: &str,
        f: impl Fn(&dyn crate::signature::ArgumentMappingContext) -> KernelSignature
        + Send
        + Sync
        + 'static,
    ) -> &mut Self {
        self.registry
            .argument_mappings
            .insert(op_type.to_string(), Arc::new(f));
        self
    }

    /// Registers a default signature.
    ///
    /// # Errors
    ///
    /// Fails if the signature has no name or repeats a parameter.
    pub fn default_signature(&mut self, op_type: &str, signature: KernelSignature) -> DispatchResult<&mut Self> {
        let signature = TrustedData::new(signature)
            .map_err(|e| invalid(op_type, &format!("malformed signature: {e}")))?
            .into_inner();
        self.registry
            .default_signatures
            .insert(op_type.to_string(), signature);
        Ok(self)
    }

    /// Appends a library override; earlier entries take priority.
    pub fn library_override(&mut self, entry: LibraryOverride) -> &mut Self {
        self.registry.overrides.push(entry);
        self
    }

    /// Installs an accelerator policy, replacing the one for its class.
    pub fn accelerator(&mut self, policy: AcceleratorPolicy) -> &mut Self {
        self.registry.accelerators.retain(|p| p.class() != policy.class());
        self.registry.accelerators.push(policy);
        self
    }

    /// Finishes the registry.
    #[must_use]
    pub fn build(self) -> Registry {
        self.registry
    }
}

fn invalid(name: &str, message: &str) -> DispatchError {
    DispatchError::InvalidRegistration {
        name: name.to_string(),
        message: message.to_string(),
    }
}
