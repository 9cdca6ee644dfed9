//! Common utilities for compute integration tests.
//!
//! Tests are parameterised over [`Backend`]; a backend that is not compiled in
//! or exposes no adapter yields no device and the test is skipped.

use std::sync::Once;

use gpu_compute::{
    BackendType, ComputeInstance, CpuAccessMode, Device, DeviceCreationFlags, InstanceParameters,
    Resource, ResourceShape,
};

static LOGGER: Once = Once::new();

/// Route `log` output through env_logger, once per test binary.
pub fn init_logging() {
    LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

// ============================================================================
// Backend Enumeration
// ============================================================================

/// Backends the tests run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// In-process software device, always available.
    Software,
    /// wgpu adapters, available with the `wgpu-backend` feature.
    Wgpu,
}

impl Backend {
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Software => true,
            #[cfg(feature = "wgpu-backend")]
            Backend::Wgpu => true,
            #[cfg(not(feature = "wgpu-backend"))]
            Backend::Wgpu => false,
        }
    }

    pub fn to_instance_parameters(self) -> InstanceParameters {
        match self {
            Backend::Software => InstanceParameters::new().with_backend(BackendType::Software),
            Backend::Wgpu => InstanceParameters::new().with_backend(BackendType::Wgpu),
        }
    }

    /// Create a device on `adapter_index`, or `None` if the backend cannot provide one.
    pub fn device(self, adapter_index: usize) -> Option<Device> {
        init_logging();
        if !self.is_available() {
            return None;
        }
        let instance = ComputeInstance::new(self.to_instance_parameters()).ok()?;
        match instance.create_device(adapter_index, DeviceCreationFlags::DEBUG) {
            Ok(device) => Some(device),
            Err(e) => {
                eprintln!("Backend {self:?} adapter {adapter_index}: {e}");
                None
            }
        }
    }
}

/// Bytes `0, 1, 2, ...` wrapping at 251 so rows never repeat at power-of-two pitches.
pub fn generate_test_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Read the logical contents of `resource` as tightly packed rows.
pub fn read_tight<S: ResourceShape>(resource: &mut Resource<S>) -> Vec<u8> {
    let layout = gpu_compute::backend::SubresourceLayout::tight(&resource.shape().dimension());
    resource
        .access_raw_data(CpuAccessMode::Read, |mapped| {
            let mut bytes = Vec::with_capacity(layout.total_size());
            for slice in 0..layout.slices as usize {
                for row in 0..layout.rows as usize {
                    let start = slice * mapped.slice_pitch() + row * mapped.row_pitch();
                    bytes.extend_from_slice(&mapped.bytes()[start..start + layout.row_bytes]);
                }
            }
            bytes
        })
        .expect("resource should be readable")
}

/// Overwrite the logical contents of `resource` from tightly packed rows.
pub fn write_tight<S: ResourceShape>(resource: &mut Resource<S>, data: &[u8]) {
    let layout = gpu_compute::backend::SubresourceLayout::tight(&resource.shape().dimension());
    assert_eq!(data.len(), layout.total_size());
    resource
        .access_raw_data(CpuAccessMode::Write, |mapped| {
            let (row_pitch, slice_pitch) = (mapped.row_pitch(), mapped.slice_pitch());
            for slice in 0..layout.slices as usize {
                for row in 0..layout.rows as usize {
                    let start = slice * slice_pitch + row * row_pitch;
                    let from = (slice * layout.rows as usize + row) * layout.row_bytes;
                    mapped.bytes_mut()[start..start + layout.row_bytes]
                        .copy_from_slice(&data[from..from + layout.row_bytes]);
                }
            }
        })
        .expect("resource should be writable")
}
