//! The kernel fallback chain.
//!
//! Given the resolved key of an invocation, kernels are looked up in four
//! tiers and the first hit wins:
//!
//! 1. the unified kernel at the key (the upgraded key first, then the
//!    pre-override key), unless the accelerator policy of the key's device
//!    family declares the op unsupported;
//! 2. the unified kernel at the plain CPU key;
//! 3. the legacy kernel at the translated descriptor;
//! 4. for accelerators with a degradation policy, the legacy kernel at the
//!    same descriptor on the host.
//!
//! Every lookup is recorded, so a miss reports exactly what was tried.
//! When the chosen kernel runs on another device family than the current
//! device context, the context is swapped for one from the pool.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{Backend, BackendClass, DataType, Place, backends_are_same_class};
use crate::device::{DeviceContext, DeviceContextPool};
use crate::error::{AttemptLog, DispatchError, DispatchResult};
use crate::kernel_key::{KernelKey, ResolvedKey};
use crate::registry::{KernelEntry, LegacyKernelFn, LegacyKernelType, OperatorInfo, Registry};
use crate::signature::KernelSignature;

/// Predicate marking ops an accelerator cannot run.
pub type UnsupportedFn = Arc<dyn Fn(&str, DataType) -> bool + Send + Sync>;

/// How an accelerator family degrades to the host.
#[derive(Clone)]
pub struct AcceleratorPolicy {
    class: BackendClass,
    unsupported: Option<UnsupportedFn>,
}

impl fmt::Debug for AcceleratorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratorPolicy")
            .field("class", &self.class)
            .field("has_unsupported", &self.unsupported.is_some())
            .finish()
    }
}

impl AcceleratorPolicy {
    /// Degrades to the host only when the accelerator has no kernel.
    #[must_use]
    pub const fn new(class: BackendClass) -> Self {
        Self { class, unsupported: None }
    }

    /// Also degrades ops for which `f(op_type, dtype)` is true.
    #[must_use]
    pub fn with_unsupported(mut self, f: impl Fn(&str, DataType) -> bool + Send + Sync + 'static) -> Self {
        self.unsupported = Some(Arc::new(f));
        self
    }

    /// Device family the policy covers.
    #[must_use]
    pub const fn class(&self) -> BackendClass {
        self.class
    }

    /// Whether the accelerator declares `op_type` unsupported for `dtype`.
    #[must_use]
    pub fn is_unsupported(&self, op_type: &str, dtype: DataType) -> bool {
        self.unsupported.as_ref().is_some_and(|f| f(op_type, dtype))
    }
}

/// Tier that produced a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Unified kernel at the resolved key.
    Unified,
    /// Unified kernel at the plain CPU key.
    UnifiedCpu,
    /// Legacy kernel at the resolved descriptor.
    Legacy,
    /// Legacy kernel on the host after accelerator degradation.
    LegacyCpu,
}

/// Kernel found by the chain.
#[derive(Clone, Copy)]
pub enum Selected<'r> {
    /// Unified kernel.
    Unified(&'r KernelEntry),
    /// Legacy kernel.
    Legacy(LegacyKernelType, &'r LegacyKernelFn),
}

impl fmt::Debug for Selected<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unified(entry) => f.debug_tuple("Unified").field(&entry.kind).finish(),
            Self::Legacy(kt, _) => f.debug_tuple("Legacy").field(kt).finish(),
        }
    }
}

/// Outcome of [`FallbackChain::resolve`].
pub struct Resolution<'r> {
    /// Key the kernel was selected with.
    pub key: KernelKey,
    /// Selected kernel.
    pub kernel: Selected<'r>,
    /// Tier that produced it.
    pub tier: Tier,
    /// Device context the kernel must run on.
    pub dev_ctx: Arc<dyn DeviceContext>,
}

impl fmt::Debug for Resolution<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("key", &self.key)
            .field("tier", &self.tier)
            .field("place", &self.dev_ctx.place())
            .finish_non_exhaustive()
    }
}

/// Walks the fallback tiers against a registry.
#[derive(Debug, Clone, Copy)]
pub struct FallbackChain<'r> {
    registry: &'r Registry,
    pool: &'r DeviceContextPool,
}

impl<'r> FallbackChain<'r> {
    /// Chain over `registry`, taking new device contexts from `pool`.
    #[must_use]
    pub const fn new(registry: &'r Registry, pool: &'r DeviceContextPool) -> Self {
        Self { registry, pool }
    }

    /// Finds the kernel for `key`.
    ///
    /// `signature` is the unified signature of the op, `None` if the op has
    /// no unified kernel. `dev_ctx` is the context of the target place.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ResolutionFailure`] if every tier misses, or
    /// [`DispatchError::DeviceFailure`] if a needed context cannot be made.
    pub fn resolve(
        &self,
        op: &'r OperatorInfo,
        signature: Option<&KernelSignature>,
        key: &ResolvedKey,
        dev_ctx: Arc<dyn DeviceContext>,
    ) -> DispatchResult<Resolution<'r>> {
        let op_type = op.op_type();
        let mut attempted = Vec::new();
        let policy = self.registry.accelerator_policy(key.base.backend);
        let vetoed = |k: &KernelKey| {
            !k.backend.is_library_specific()
                && policy.is_some_and(|p| p.is_unsupported(op_type, k.dtype))
        };

        if let Some(sig) = signature {
            let kernels = self.registry.kernels();
            for candidate in key.candidates() {
                if vetoed(&candidate) {
                    attempted.push(format!("unified {} {candidate} (unsupported on accelerator)", sig.name));
                    continue;
                }
                attempted.push(format!("unified {} {candidate}", sig.name));
                if let Some(entry) = kernels.select_kernel(&sig.name, &candidate) {
                    let dev_ctx = self.rebind_unified(op_type, candidate.backend, dev_ctx)?;
                    return Ok(self.found(op_type, candidate, Selected::Unified(entry), Tier::Unified, dev_ctx));
                }
            }

            let cpu = key.base.degraded_to_cpu();
            if !key.candidates().contains(&cpu) {
                attempted.push(format!("unified {} {cpu}", sig.name));
                if let Some(entry) = kernels.select_kernel(&sig.name, &cpu) {
                    let dev_ctx = self.rebind_unified(op_type, cpu.backend, dev_ctx)?;
                    return Ok(self.found(op_type, cpu, Selected::Unified(entry), Tier::UnifiedCpu, dev_ctx));
                }
            }
        }

        let device_id = dev_ctx.place().device_id();
        let mut degrade = false;
        for candidate in key.candidates() {
            let kt = LegacyKernelType::from_key(candidate, device_id);
            if vetoed(&candidate) {
                attempted.push(format!("legacy {kt} (unsupported on accelerator)"));
                degrade = true;
                continue;
            }
            attempted.push(format!("legacy {kt}"));
            if let Some(f) = op.legacy_kernel(&kt) {
                let dev_ctx = self.rebind_legacy(op_type, &kt, dev_ctx)?;
                return Ok(self.found(op_type, candidate, Selected::Legacy(kt, f), Tier::Legacy, dev_ctx));
            }
            degrade = true;
        }

        if degrade && policy.is_some() {
            let kt = LegacyKernelType::from_key(key.base, device_id).on_cpu();
            attempted.push(format!("legacy {kt}"));
            if let Some(f) = op.legacy_kernel(&kt) {
                warn!(op = op_type, from = %key.base.backend, "degrading to host kernel");
                let dev_ctx = self.rebind_legacy(op_type, &kt, dev_ctx)?;
                let cpu_key = KernelKey::new(Backend::Cpu, kt.layout, kt.dtype);
                return Ok(self.found(op_type, cpu_key, Selected::Legacy(kt, f), Tier::LegacyCpu, dev_ctx));
            }
        }

        warn!(op = op_type, key = %key.key, "no kernel found");
        Err(DispatchError::ResolutionFailure {
            op_type: op_type.to_string(),
            attempted: AttemptLog(attempted),
        })
    }

    fn found(
        &self,
        op_type: &str,
        key: KernelKey,
        kernel: Selected<'r>,
        tier: Tier,
        dev_ctx: Arc<dyn DeviceContext>,
    ) -> Resolution<'r> {
        debug!(op = op_type, %key, ?tier, place = %dev_ctx.place(), "kernel selected");
        Resolution { key, kernel, tier, dev_ctx }
    }

    fn rebind_unified(
        &self,
        op_type: &str,
        backend: Backend,
        dev_ctx: Arc<dyn DeviceContext>,
    ) -> DispatchResult<Arc<dyn DeviceContext>> {
        let current = dev_ctx.place();
        if backends_are_same_class(backend, Backend::from_place(current)) {
            return Ok(dev_ctx);
        }
        self.context_for(op_type, backend.to_place(current.device_id()))
    }

    fn rebind_legacy(
        &self,
        op_type: &str,
        kt: &LegacyKernelType,
        dev_ctx: Arc<dyn DeviceContext>,
    ) -> DispatchResult<Arc<dyn DeviceContext>> {
        if kt.place.is_same_class(dev_ctx.place()) {
            return Ok(dev_ctx);
        }
        self.context_for(op_type, kt.place)
    }

    fn context_for(&self, op_type: &str, place: Place) -> DispatchResult<Arc<dyn DeviceContext>> {
        debug!(op = op_type, %place, "switching device context");
        self.pool
            .get(place)
            .map_err(|source| DispatchError::DeviceFailure {
                op_type: op_type.to_string(),
                source,
            })
    }
}
