//! Device contexts.
//!
//! A [`DeviceContext`] is the per-device handle a kernel runs against. The
//! dispatcher only needs two things from it: the place it drives and a way
//! to synchronize, which is also where asynchronous device errors surface.
//!
//! Contexts are handed out by a [`DeviceContextPool`], which creates at most
//! one context per place and caches it.
//!
//! # Feature
//!
//! With the `wgpu` feature, GPU places are served by
//! [`wgpu::WgpuDeviceContext`].

#[cfg(feature = "wgpu")]
pub mod wgpu;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::backend::{Backend, BackendClass, Place};
use crate::error::DeviceError;

/// Handle to one device.
pub trait DeviceContext: Send + Sync + fmt::Debug {
    /// Place this context drives.
    fn place(&self) -> Place;

    /// Blocks until queued work finishes.
    ///
    /// # Errors
    ///
    /// Reports asynchronous failures recorded since the last call.
    fn wait(&self) -> Result<(), DeviceError>;
}

/// The host. Work is synchronous, so waiting never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDeviceContext;

impl DeviceContext for CpuDeviceContext {
    fn place(&self) -> Place {
        Place::Cpu
    }

    fn wait(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Creates the context for a place.
pub type DeviceContextFactory =
    Arc<dyn Fn(Place) -> Result<Arc<dyn DeviceContext>, DeviceError> + Send + Sync>;

/// Lazily created, cached device contexts.
pub struct DeviceContextPool {
    factories: HashMap<BackendClass, DeviceContextFactory>,
    contexts: RwLock<HashMap<Place, Arc<dyn DeviceContext>>>,
}

impl fmt::Debug for DeviceContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let contexts = self.contexts.read().unwrap_or_else(PoisonError::into_inner);
        let mut places: Vec<_> = contexts.keys().copied().collect();
        places.sort();
        f.debug_struct("DeviceContextPool")
            .field("live", &places)
            .finish_non_exhaustive()
    }
}

impl Default for DeviceContextPool {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceContextPool {
    /// Pool serving the host, plus GPUs when built with `wgpu`.
    #[must_use]
    pub fn new() -> Self {
        let mut pool = Self {
            factories: HashMap::new(),
            contexts: RwLock::new(HashMap::new()),
        };
        pool.register(BackendClass::Host, |_| Ok(Arc::new(CpuDeviceContext)));
        #[cfg(feature = "wgpu")]
        pool.register(BackendClass::Gpu, |place| {
            Ok(Arc::new(wgpu::WgpuDeviceContext::new(place)?))
        });
        pool
    }

    /// Installs the factory for a device family.
    pub fn register(
        &mut self,
        class: BackendClass,
        factory: impl Fn(Place) -> Result<Arc<dyn DeviceContext>, DeviceError> + Send + Sync + 'static,
    ) -> &mut Self {
        self.factories.insert(class, Arc::new(factory));
        self
    }

    /// Builder form of [`Self::register`].
    #[must_use]
    pub fn with_factory(
        mut self,
        class: BackendClass,
        factory: impl Fn(Place) -> Result<Arc<dyn DeviceContext>, DeviceError> + Send + Sync + 'static,
    ) -> Self {
        self.register(class, factory);
        self
    }

    /// Context for `place`, created on first use.
    ///
    /// # Errors
    ///
    /// Fails if no factory serves the place or the factory fails.
    pub fn get(&self, place: Place) -> Result<Arc<dyn DeviceContext>, DeviceError> {
        if let Some(ctx) = self
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&place)
        {
            return Ok(Arc::clone(ctx));
        }

        let class = Backend::from_place(place).class();
        let factory = self.factories.get(&class).ok_or_else(|| DeviceError::Unavailable {
            place,
            message: "no device context factory for this device family".to_string(),
        })?;

        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(ctx) = contexts.get(&place) {
            return Ok(Arc::clone(ctx));
        }
        let ctx = factory(place)?;
        debug!(%place, "created device context");
        contexts.insert(place, Arc::clone(&ctx));
        Ok(ctx)
    }
}
