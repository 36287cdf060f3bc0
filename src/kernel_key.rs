//! Kernel keys and backend-library upgrades.
//!
//! The key of an invocation is derived in two steps:
//!
//! 1. [`derive_base_key`] asks the operator's kernel-type policy for the
//!    plain (backend, layout, dtype) the invocation needs;
//! 2. [`apply_library_overrides`] walks the registered [`LibraryOverride`]
//!    table in priority order and may move the key to a library-specific
//!    backend (oneDNN, a GPU DNN library, XPU kernel primitives).
//!
//! Both keys are kept in a [`ResolvedKey`]: overrides are only a preference,
//! and the fallback chain retries the base key when the upgraded one has no
//! kernel.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{Backend, BackendClass, DataLayout, DataType};
use crate::config::RuntimeFlags;
use crate::context::InvocationContext;
use crate::error::{DispatchError, DispatchResult};
use crate::registry::OperatorInfo;

/// Canonical identity of a kernel: backend, layout and dtype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct KernelKey {
    /// Backend.
    pub backend: Backend,
    /// Layout.
    pub layout: DataLayout,
    /// Element type.
    pub dtype: DataType,
}

impl KernelKey {
    /// Builds a key.
    #[must_use]
    pub const fn new(backend: Backend, layout: DataLayout, dtype: DataType) -> Self {
        Self { backend, layout, dtype }
    }

    /// Plain CPU key for `dtype`.
    #[must_use]
    pub const fn cpu(dtype: DataType) -> Self {
        Self::new(Backend::Cpu, DataLayout::Any, dtype)
    }

    /// Same dtype on the plain CPU backend.
    #[must_use]
    pub const fn degraded_to_cpu(self) -> Self {
        Self::cpu(self.dtype)
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.backend, self.layout, self.dtype)
    }
}

/// Accelerator libraries that can take over a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Library {
    /// oneDNN on the host.
    OneDnn,
    /// Vendor DNN library on GPUs.
    CuDnn,
    /// Kernel primitives on XPUs.
    XpuKp,
}

impl Library {
    /// Attribute an operator sets to ask for this library, if any.
    #[must_use]
    pub const fn request_attr(self) -> Option<&'static str> {
        match self {
            Self::OneDnn => Some("use_mkldnn"),
            Self::CuDnn => Some("use_cudnn"),
            Self::XpuKp => None,
        }
    }
}

impl fmt::Display for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OneDnn => "onednn",
            Self::CuDnn => "cudnn",
            Self::XpuKp => "xpu_kp",
        })
    }
}

/// Runtime capability probe for a library.
pub type CapabilityProbe = Arc<dyn Fn(DataType) -> bool + Send + Sync>;

/// One entry of the library-override table.
#[derive(Clone)]
pub struct LibraryOverride {
    library: Library,
    source: BackendClass,
    backend: Backend,
    layout: Option<DataLayout>,
    denylist: BTreeSet<String>,
    allowlist: BTreeSet<String>,
    probe: CapabilityProbe,
}

impl fmt::Debug for LibraryOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryOverride")
            .field("library", &self.library)
            .field("backend", &self.backend)
            .field("layout", &self.layout)
            .field("denylist", &self.denylist)
            .field("allowlist", &self.allowlist)
            .finish_non_exhaustive()
    }
}

impl LibraryOverride {
    fn new(
        library: Library,
        source: BackendClass,
        backend: Backend,
        layout: Option<DataLayout>,
        probe: impl Fn(DataType) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            library,
            source,
            backend,
            layout,
            denylist: BTreeSet::new(),
            allowlist: BTreeSet::new(),
            probe: Arc::new(probe),
        }
    }

    /// Host keys upgraded to oneDNN kernels and layout.
    pub fn one_dnn(probe: impl Fn(DataType) -> bool + Send + Sync + 'static) -> Self {
        Self::new(
            Library::OneDnn,
            BackendClass::Host,
            Backend::OneDnn,
            Some(DataLayout::OneDnn),
            probe,
        )
    }

    /// GPU keys upgraded to DNN-library kernels.
    pub fn cudnn(probe: impl Fn(DataType) -> bool + Send + Sync + 'static) -> Self {
        Self::new(Library::CuDnn, BackendClass::Gpu, Backend::GpuDnn, None, probe)
    }

    /// XPU keys upgraded to kernel-primitive kernels.
    ///
    /// Applies when `run_kp_kernel` is set and the probe approves, or
    /// unconditionally for allow-listed operators.
    pub fn xpu_kp(probe: impl Fn(DataType) -> bool + Send + Sync + 'static) -> Self {
        Self::new(Library::XpuKp, BackendClass::Xpu, Backend::Kps, None, probe)
    }

    /// Never upgrade `op_type`.
    #[must_use]
    pub fn deny(mut self, op_type: &str) -> Self {
        self.denylist.insert(op_type.to_string());
        self
    }

    /// Always upgrade `op_type` (when not denied).
    #[must_use]
    pub fn allow(mut self, op_type: &str) -> Self {
        self.allowlist.insert(op_type.to_string());
        self
    }

    /// The library this entry upgrades to.
    #[must_use]
    pub const fn library(&self) -> Library {
        self.library
    }

    fn applies(
        &self,
        key: &KernelKey,
        op: &OperatorInfo,
        ctx: &InvocationContext<'_>,
        flags: &RuntimeFlags,
    ) -> bool {
        if key.backend.class() != self.source || key.backend.is_library_specific() {
            return false;
        }
        let op_type = op.op_type();
        if self.denylist.contains(op_type) {
            return false;
        }
        if self.library == Library::OneDnn && op.dnn_fallback() {
            return false;
        }
        if self.allowlist.contains(op_type) {
            return true;
        }
        if self.library == Library::XpuKp && !flags.run_kp_kernel {
            return false;
        }
        (self.probe)(key.dtype) && op.is_eligible(self.library, ctx, key.dtype)
    }
}

/// Key chosen for an invocation, with the pre-override key kept for fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    /// Key after library overrides.
    pub key: KernelKey,
    /// Key returned by the kernel-type policy.
    pub base: KernelKey,
    /// Libraries that upgraded the key, in order.
    pub libraries: Vec<Library>,
}

impl ResolvedKey {
    /// Keys to try, preferred first, without duplicates.
    #[must_use]
    pub fn candidates(&self) -> Vec<KernelKey> {
        if self.key == self.base {
            vec![self.key]
        } else {
            vec![self.key, self.base]
        }
    }
}

/// Asks the operator's kernel-type policy for the base key.
///
/// # Errors
///
/// Propagates the policy's rejection of the invocation.
pub fn derive_base_key(op: &OperatorInfo, ctx: &InvocationContext<'_>) -> DispatchResult<KernelKey> {
    op.kernel_type(ctx)
}

/// Upgrades `key` in place with the first applicable override.
///
/// Returns the libraries applied. Nothing happens unless
/// `use_accelerated_layout` is set.
pub fn apply_library_overrides(
    key: &mut KernelKey,
    op: &OperatorInfo,
    ctx: &InvocationContext<'_>,
    overrides: &[LibraryOverride],
    flags: &RuntimeFlags,
) -> Vec<Library> {
    let mut applied = Vec::new();
    if !flags.use_accelerated_layout {
        return applied;
    }
    for entry in overrides {
        if entry.applies(key, op, ctx, flags) {
            let before = *key;
            key.backend = entry.backend;
            if let Some(layout) = entry.layout {
                key.layout = layout;
            }
            debug!(op = op.op_type(), library = %entry.library, %before, after = %key, "library override");
            applied.push(entry.library);
        }
    }
    applied
}

/// Derives the base key and applies overrides.
///
/// # Errors
///
/// Propagates the kernel-type policy's rejection of the invocation.
pub fn resolve_key(
    op: &OperatorInfo,
    ctx: &InvocationContext<'_>,
    overrides: &[LibraryOverride],
    flags: &RuntimeFlags,
) -> DispatchResult<ResolvedKey> {
    let base = derive_base_key(op, ctx)?;
    let mut key = base;
    let libraries = apply_library_overrides(&mut key, op, ctx, overrides, flags);
    Ok(ResolvedKey { key, base, libraries })
}

/// Kernel-type policy used when an operator registers none.
///
/// The dtype is the one shared by every initialized input; the backend
/// follows the target place; the layout is plain.
///
/// # Errors
///
/// Fails if inputs disagree on dtype or none is initialized.
pub fn default_kernel_type(ctx: &InvocationContext<'_>) -> DispatchResult<KernelKey> {
    let ins = ctx.ins();
    let mut dtype: Option<(DataType, &str)> = None;
    for name in ins.names() {
        for idx in 0..ins.len_of(name).unwrap_or(0) {
            let Some(tensor) = ins.tensor(name, idx).filter(|t| t.is_initialized()) else {
                continue;
            };
            match dtype {
                None => dtype = Some((tensor.dtype(), name)),
                Some((seen, first)) if seen != tensor.dtype() => {
                    return Err(DispatchError::invalid_invocation(
                        ctx.op_type(),
                        format!(
                            "input `{name}` is {} but input `{first}` is {seen}",
                            tensor.dtype()
                        ),
                    ));
                }
                Some(_) => {}
            }
        }
    }
    let (dtype, _) = dtype.ok_or_else(|| {
        DispatchError::invalid_invocation(ctx.op_type(), "all inputs are uninitialized")
    })?;
    Ok(KernelKey::new(
        Backend::from_place(ctx.place()),
        DataLayout::Any,
        dtype,
    ))
}
