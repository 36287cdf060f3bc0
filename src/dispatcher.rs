//! The dispatcher: owns the registry, device contexts, flags and data
//! transform, and is the entry point for preparing and running operators.

use tracing::debug;

use crate::attribute::AttributeMap;
use crate::backend::Place;
use crate::config::RuntimeFlags;
use crate::device::DeviceContextPool;
use crate::error::DispatchResult;
use crate::prepared::{OperatorInvocation, PreparedOperator};
use crate::registry::Registry;
use crate::transform::{DataTransform, HostDataTransform};
use crate::variable::{NameVarMap, VariableLike};

/// Root object of kernel dispatch.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Registry,
    pool: DeviceContextPool,
    flags: RuntimeFlags,
    transform: Box<dyn DataTransform>,
}

impl Dispatcher {
    /// Dispatcher over `registry` with process-wide flags, the default
    /// device pool and host data transform.
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            pool: DeviceContextPool::new(),
            flags: RuntimeFlags::global(),
            transform: Box::new(HostDataTransform),
        }
    }

    /// Replaces the flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: RuntimeFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Replaces the device context pool.
    #[must_use]
    pub fn with_pool(mut self, pool: DeviceContextPool) -> Self {
        self.pool = pool;
        self
    }

    /// Replaces the data transform.
    #[must_use]
    pub fn with_transform(mut self, transform: impl DataTransform + 'static) -> Self {
        self.transform = Box::new(transform);
        self
    }

    /// The registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The device context pool.
    #[must_use]
    pub const fn pool(&self) -> &DeviceContextPool {
        &self.pool
    }

    /// Active flags.
    #[must_use]
    pub const fn flags(&self) -> &RuntimeFlags {
        &self.flags
    }

    /// The data transform.
    #[must_use]
    pub fn transform(&self) -> &dyn DataTransform {
        self.transform.as_ref()
    }

    /// Resolves the kernel for an invocation.
    ///
    /// # Errors
    ///
    /// See [`PreparedOperator::prepare`].
    pub fn prepare(&self, inv: &OperatorInvocation<'_>) -> DispatchResult<PreparedOperator<'_>> {
        PreparedOperator::prepare(self, inv)
    }

    /// Prepares and runs `op_type` in one step.
    ///
    /// # Errors
    ///
    /// Any resolution or execution failure.
    pub fn execute<V: VariableLike>(
        &self,
        op_type: &str,
        ins: &NameVarMap<V>,
        outs: &mut NameVarMap<V>,
        attrs: &AttributeMap,
        default_attrs: &AttributeMap,
        place: Place,
    ) -> DispatchResult<()> {
        let prepared = {
            let inv = OperatorInvocation::new(op_type, ins, &*outs, attrs, default_attrs, place);
            self.prepare(&inv)?
        };
        debug!(op = op_type, kernel = ?prepared.kernel(), "running");
        prepared.run(ins, outs, attrs, default_attrs)
    }
}
