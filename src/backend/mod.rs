//! Backend abstraction layer
//!
//! Provides the native-API boundary that the software and wgpu backends implement.
//!
//! # Available Backends
//!
//! - software (always built): in-process device with real memory and command ordering
//! - wgpu (`wgpu-backend` feature): GPU adapters through wgpu

pub mod software;
pub mod traits;
pub mod types;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use traits::*;
pub use types::*;

use crate::config::{BackendType, DeviceCreationFlags, InstanceParameters};
use crate::error::{ComputeError, ComputeResult};

static NEXT_NATIVE_DEVICE: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique native device identity.
pub(crate) fn next_native_device_id() -> NativeDeviceId {
    NativeDeviceId(NEXT_NATIVE_DEVICE.fetch_add(1, Ordering::Relaxed))
}

/// List the adapters the configured backend exposes.
pub fn enumerate_adapters(params: &InstanceParameters) -> Vec<AdapterInfo> {
    match params.backend {
        BackendType::Software => software::adapters(params.software_adapters),
        #[cfg(feature = "wgpu-backend")]
        BackendType::Wgpu => wgpu_backend::adapters(),
        #[cfg(not(feature = "wgpu-backend"))]
        BackendType::Wgpu => {
            log::warn!("wgpu backend requested but the `wgpu-backend` feature is disabled");
            Vec::new()
        }
    }
}

/// Create a backend device on `adapter_index`.
///
/// # Errors
///
/// Returns [`ComputeError::DeviceCreationFailed`] if the index is out of range,
/// the backend is unavailable, or the native device cannot be created.
pub fn create_device_backend(
    params: &InstanceParameters,
    adapter_index: usize,
    flags: DeviceCreationFlags,
) -> ComputeResult<Arc<dyn DeviceBackend>> {
    let adapters = enumerate_adapters(params);
    let adapter = adapters.get(adapter_index).cloned().ok_or_else(|| {
        ComputeError::DeviceCreationFailed(format!(
            "adapter index {adapter_index} out of range ({})",
            adapters.len()
        ))
    })?;

    log::info!(
        "Creating {:?} device on adapter {adapter_index}: {} ({:?})",
        params.backend,
        adapter.name,
        flags
    );

    match params.backend {
        BackendType::Software => Ok(Arc::new(software::SoftwareDevice::new(
            adapter,
            params.row_pitch_alignment,
            flags,
        ))),
        #[cfg(feature = "wgpu-backend")]
        BackendType::Wgpu => {
            let device = wgpu_backend::WgpuDevice::new(adapter_index, adapter, flags)?;
            Ok(Arc::new(device))
        }
        #[cfg(not(feature = "wgpu-backend"))]
        BackendType::Wgpu => Err(ComputeError::DeviceCreationFailed(
            "wgpu backend is not compiled in".into(),
        )),
    }
}
