//! Prepared operators.
//!
//! [`PreparedOperator::prepare`] turns an [`OperatorInvocation`] into a
//! bound kernel:
//!
//! 1. look the operator up in the registry;
//! 2. find its unified signature, if it has one;
//! 3. derive the kernel key and apply library overrides;
//! 4. walk the fallback chain, swapping device contexts when needed.
//!
//! [`PreparedOperator::run`] then executes it: shape inference, input
//! transformation (unified function kernels only), the kernel itself and
//! the post-execution hooks. Inputs are never modified; transformed inputs
//! live in a per-run side table.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, debug_span, trace_span};

use crate::attribute::{AttributeMap, Attributes};
use crate::backend::Place;
use crate::context::{
    ExecutionContext, InferShapeContext, InvocationContext, KernelContext, RuntimeContext, TransformedInputs,
};
use crate::device::DeviceContext;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, DispatchResult, KernelError};
use crate::fallback::{FallbackChain, Selected, Tier};
use crate::hooks;
use crate::kernel_key::{self, KernelKey};
use crate::registry::{KernelEntry, KernelFn, KernelKind, LegacyKernelFn, LegacyKernelType, OperatorInfo, StructuredKernelFn};
use crate::signature::{self, KernelSignature};
use crate::transform::{DataTransform, needs_transform};
use crate::variable::{NameVarMap, VarMapView, VariableLike};

/// One call of an operator.
#[derive(Clone, Copy)]
pub struct OperatorInvocation<'a> {
    /// Operator type.
    pub op_type: &'a str,
    /// Inputs.
    pub ins: &'a dyn VarMapView,
    /// Outputs.
    pub outs: &'a dyn VarMapView,
    /// Call-site attributes.
    pub attrs: &'a AttributeMap,
    /// Default attributes.
    pub default_attrs: &'a AttributeMap,
    /// Target place.
    pub place: Place,
}

impl fmt::Debug for OperatorInvocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorInvocation")
            .field("op_type", &self.op_type)
            .field("ins", &self.ins.names())
            .field("outs", &self.outs.names())
            .field("attrs", &self.attrs)
            .field("place", &self.place)
            .finish_non_exhaustive()
    }
}

impl<'a> OperatorInvocation<'a> {
    /// Builds an invocation.
    pub fn new(
        op_type: &'a str,
        ins: &'a dyn VarMapView,
        outs: &'a dyn VarMapView,
        attrs: &'a AttributeMap,
        default_attrs: &'a AttributeMap,
        place: Place,
    ) -> Self {
        Self { op_type, ins, outs, attrs, default_attrs, place }
    }
}

/// A bound kernel.
#[derive(Clone)]
pub enum PreparedKernel<'r> {
    /// Unified function kernel.
    Function {
        /// Calling convention.
        signature: KernelSignature,
        /// Registered entry, with argument requirements.
        entry: &'r KernelEntry,
        /// Body.
        func: &'r KernelFn,
    },
    /// Unified structured kernel.
    Structured {
        /// Name-only or mapped signature.
        signature: KernelSignature,
        /// Body.
        func: &'r StructuredKernelFn,
    },
    /// Legacy kernel.
    Legacy {
        /// Descriptor it was found under.
        kernel_type: LegacyKernelType,
        /// Body.
        func: &'r LegacyKernelFn,
    },
}

impl fmt::Debug for PreparedKernel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function { signature, .. } => f.debug_tuple("Function").field(signature).finish(),
            Self::Structured { signature, .. } => f.debug_tuple("Structured").field(signature).finish(),
            Self::Legacy { kernel_type, .. } => f.debug_tuple("Legacy").field(kernel_type).finish(),
        }
    }
}

impl PreparedKernel<'_> {
    /// Whether this is a unified kernel.
    #[must_use]
    pub const fn is_unified(&self) -> bool {
        !matches!(self, Self::Legacy { .. })
    }

    fn name(&self) -> String {
        match self {
            Self::Function { signature, .. } | Self::Structured { signature, .. } => signature.name.clone(),
            Self::Legacy { kernel_type, .. } => kernel_type.to_string(),
        }
    }
}

/// An operator bound to a kernel and a device context, ready to run.
pub struct PreparedOperator<'r> {
    op: &'r OperatorInfo,
    key: KernelKey,
    tier: Tier,
    kernel: PreparedKernel<'r>,
    dev_ctx: Arc<dyn DeviceContext>,
    default_signature: Option<&'r KernelSignature>,
    dispatcher: &'r Dispatcher,
}

impl fmt::Debug for PreparedOperator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedOperator")
            .field("op_type", &self.op.op_type())
            .field("key", &self.key)
            .field("tier", &self.tier)
            .field("kernel", &self.kernel)
            .field("place", &self.dev_ctx.place())
            .finish_non_exhaustive()
    }
}

impl<'r> PreparedOperator<'r> {
    /// Resolves the kernel for `inv`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::UnknownOperator`] if the op is not registered;
    /// - [`DispatchError::InvalidInvocation`] if the kernel-type policy
    ///   rejects the call;
    /// - [`DispatchError::ResolutionFailure`] if no tier has a kernel;
    /// - [`DispatchError::DeviceFailure`] if a device context cannot be made.
    pub fn prepare(dispatcher: &'r Dispatcher, inv: &OperatorInvocation<'_>) -> DispatchResult<Self> {
        let _span = debug_span!("prepare", op = inv.op_type, place = %inv.place).entered();
        let registry = dispatcher.registry();
        let op = registry
            .operator(inv.op_type)
            .ok_or_else(|| DispatchError::UnknownOperator(inv.op_type.to_string()))?;

        let attrs = Attributes::new(inv.attrs, inv.default_attrs);
        let ctx = InvocationContext::new(inv.op_type, inv.ins, inv.outs, attrs, inv.place);
        let signature = signature::lookup_signature(registry, inv.op_type, &ctx);
        if let Some(sig) = &signature {
            debug!(signature = %sig.signature, source = ?sig.source, "signature");
        }

        let resolved = kernel_key::resolve_key(op, &ctx, registry.overrides(), dispatcher.flags())?;
        debug!(key = %resolved.key, base = %resolved.base, "kernel key");

        let dev_ctx = dispatcher
            .pool()
            .get(inv.place)
            .map_err(|source| DispatchError::DeviceFailure {
                op_type: inv.op_type.to_string(),
                source,
            })?;

        let resolution = FallbackChain::new(registry, dispatcher.pool()).resolve(
            op,
            signature.as_ref().map(|s| &s.signature),
            &resolved,
            dev_ctx,
        )?;

        let kernel = match (resolution.kernel, signature) {
            (Selected::Legacy(kernel_type, func), _) => PreparedKernel::Legacy { kernel_type, func },
            (Selected::Unified(entry), Some(sig)) => match &entry.kind {
                KernelKind::Function(func) => PreparedKernel::Function {
                    signature: sig.signature,
                    entry,
                    func,
                },
                KernelKind::Structured(func) => PreparedKernel::Structured {
                    signature: sig.signature,
                    func,
                },
            },
            (Selected::Unified(_), None) => {
                return Err(DispatchError::ResolutionFailure {
                    op_type: inv.op_type.to_string(),
                    attempted: crate::error::AttemptLog::default(),
                });
            }
        };

        Ok(Self {
            op,
            key: resolution.key,
            tier: resolution.tier,
            kernel,
            dev_ctx: resolution.dev_ctx,
            default_signature: registry.default_signature(inv.op_type),
            dispatcher,
        })
    }

    /// Operator type.
    #[must_use]
    pub fn op_type(&self) -> &str {
        self.op.op_type()
    }

    /// Key the kernel was selected with.
    #[must_use]
    pub const fn kernel_key(&self) -> KernelKey {
        self.key
    }

    /// Fallback tier that produced the kernel.
    #[must_use]
    pub const fn tier(&self) -> Tier {
        self.tier
    }

    /// Bound kernel.
    #[must_use]
    pub const fn kernel(&self) -> &PreparedKernel<'r> {
        &self.kernel
    }

    /// Device context the kernel runs on.
    #[must_use]
    pub fn device_context(&self) -> &Arc<dyn DeviceContext> {
        &self.dev_ctx
    }

    /// Unified signature, `None` for legacy kernels.
    #[must_use]
    pub const fn signature(&self) -> Option<&KernelSignature> {
        match &self.kernel {
            PreparedKernel::Function { signature, .. } | PreparedKernel::Structured { signature, .. } => {
                Some(signature)
            }
            PreparedKernel::Legacy { .. } => None,
        }
    }

    /// Runs shape inference, the kernel and the post-execution hooks.
    ///
    /// Outputs are written in place; inputs are only read.
    ///
    /// # Errors
    ///
    /// Shape-inference, transform, kernel, numeric and device failures, in
    /// the order they can occur.
    pub fn run<V: VariableLike>(
        &self,
        ins: &NameVarMap<V>,
        outs: &mut NameVarMap<V>,
        attrs: &AttributeMap,
        default_attrs: &AttributeMap,
    ) -> DispatchResult<()> {
        let op_type = self.op.op_type();
        let attrs = Attributes::new(attrs, default_attrs);

        if let Some(infer_shape) = self.op.infer_shape() {
            let _span = trace_span!("infer_shape", op = op_type).entered();
            let signature = self.signature().or(self.default_signature);
            let mut ctx = InferShapeContext::new(op_type, ins, &mut *outs, attrs, self.key, signature);
            infer_shape(&mut ctx).map_err(|source| DispatchError::ShapeInferenceFailure {
                op_type: op_type.to_string(),
                source,
            })?;
        }

        {
            let _span = trace_span!("compute", op = op_type, key = %self.key).entered();
            let result = match &self.kernel {
                PreparedKernel::Function { signature, entry, func } => {
                    let transformed = self.transform_inputs(signature, entry, ins)?;
                    let mut ctx = KernelContext::new(&*self.dev_ctx, signature, ins, &transformed, &mut *outs, attrs);
                    func(&mut ctx)
                }
                PreparedKernel::Structured { func, .. } | PreparedKernel::Legacy { func, .. } => {
                    self.run_with_execution_context(func, ins, &mut *outs, attrs)
                }
            };
            result.map_err(|source| DispatchError::KernelFailure {
                op_type: op_type.to_string(),
                kernel: self.kernel.name(),
                source,
            })?;
        }

        let flags = self.dispatcher.flags();
        if flags.check_numerics {
            hooks::check_nan_inf(op_type, &*outs, self.dev_ctx.place())?;
        }
        if flags.benchmark {
            hooks::synchronize(op_type, &*self.dev_ctx)?;
        }
        if self.key.dtype.is_complex() {
            hooks::repair_complex_grads(op_type, &mut *outs, self.key.dtype);
        }
        Ok(())
    }

    fn run_with_execution_context<V: VariableLike>(
        &self,
        func: &StructuredKernelFn,
        ins: &NameVarMap<V>,
        outs: &mut NameVarMap<V>,
        attrs: Attributes<'_>,
    ) -> Result<(), KernelError> {
        let runtime = RuntimeContext::from_maps(ins, &*outs);
        let transformed = TransformedInputs::new();
        let mut ctx = ExecutionContext::new(
            self.op.op_type(),
            &*self.dev_ctx,
            &runtime,
            ins,
            &transformed,
            &mut *outs,
            attrs,
        );
        func(&mut ctx)
    }

    fn transform_inputs(
        &self,
        signature: &KernelSignature,
        entry: &KernelEntry,
        ins: &dyn VarMapView,
    ) -> DispatchResult<TransformedInputs> {
        let transform: &dyn DataTransform = self.dispatcher.transform();
        let mut transformed = TransformedInputs::new();
        for (pos, name) in signature.inputs.iter().enumerate() {
            let def = entry.input_def(pos);
            for idx in 0..ins.len_of(name).unwrap_or(0) {
                let Some(var) = ins.var(name, idx) else { continue };
                let Some(tensor) = var.tensor().filter(|t| needs_transform(t, &def)) else {
                    continue;
                };
                let out = transform.transform(var.name(), tensor, &def, self.dev_ctx.place())?;
                transformed.insert((name.clone(), idx), out);
            }
        }
        Ok(transformed)
    }
}
