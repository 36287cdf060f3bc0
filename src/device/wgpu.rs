//! GPU device context backed by `wgpu`.
//!
//! Errors raised by the device outside of a synchronous call are captured
//! by an uncaptured-error handler and reported by the next
//! [`DeviceContext::wait`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use super::DeviceContext;
use crate::backend::Place;
use crate::error::DeviceError;

/// Holds the `wgpu` device and queue for one GPU place.
pub struct WgpuDeviceContext {
    place: Place,
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// Submission queue of the device.
    pub queue: wgpu::Queue,
    pending: Arc<Mutex<Option<String>>>,
}

impl fmt::Debug for WgpuDeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuDeviceContext")
            .field("place", &self.place)
            .finish_non_exhaustive()
    }
}

impl WgpuDeviceContext {
    /// Selects the default adapter and opens a device on it.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Unavailable`] if no adapter or device can be
    /// acquired.
    pub fn new(place: Place) -> Result<Self, DeviceError> {
        let unavailable = |message: String| DeviceError::Unavailable { place, message };

        let instance = wgpu::Instance::default();
        let adapter =
            pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
                .map_err(|e| unavailable(e.to_string()))?;
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_dispatch"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| unavailable(e.to_string()))?;

        let pending = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&pending);
        device.on_uncaptured_error(Box::new(move |err: wgpu::Error| {
            warn!(%place, error = %err, "uncaptured device error");
            let mut slot = sink.lock().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert_with(|| err.to_string());
        }));

        Ok(Self { place, device, queue, pending })
    }
}

impl DeviceContext for WgpuDeviceContext {
    fn place(&self) -> Place {
        self.place
    }

    fn wait(&self) -> Result<(), DeviceError> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| DeviceError::Async {
                place: self.place,
                message: e.to_string(),
            })?;
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match pending {
            Some(message) => Err(DeviceError::Async { place: self.place, message }),
            None => Ok(()),
        }
    }
}
