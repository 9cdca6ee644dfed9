//! Constant buffers.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;

use bytemuck::Pod;

use crate::backend::{BindFlags, ResourceDescriptor, ResourceDimension, ResourceId, SubresourceData};
use crate::device::Device;
use crate::error::ComputeResult;

/// A single `T` bound to a kernel's constant registers. Update-only: there is
/// no staging mirror and no read path.
pub struct ConstantBuffer<T> {
    device: Device,
    gpu: ResourceId,
    _value: PhantomData<fn() -> T>,
}

impl<T: Pod> ConstantBuffer<T> {
    pub(crate) fn create(device: &Device, value: &T) -> ComputeResult<Self> {
        let bytes = bytemuck::bytes_of(value);
        let descriptor = ResourceDescriptor::new(ResourceDimension::Buffer {
            size: bytes.len() as u64,
            stride: 0,
        })
        .with_label("ConstantBuffer")
        .with_bind_flags(BindFlags::CONSTANT_BUFFER);
        let gpu = device.create_resource(
            &descriptor,
            &[SubresourceData {
                bytes,
                row_pitch: bytes.len(),
                slice_pitch: bytes.len(),
            }],
        )?;
        Ok(Self {
            device: device.clone(),
            gpu,
            _value: PhantomData,
        })
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        size_of::<T>()
    }

    /// Replace the buffer contents on the GPU.
    pub fn update(&mut self, value: &T) -> ComputeResult<()> {
        let bytes = bytemuck::bytes_of(value);
        self.device.backend().update_resource(
            self.gpu,
            SubresourceData {
                bytes,
                row_pitch: bytes.len(),
                slice_pitch: bytes.len(),
            },
        )
    }
}

impl<T> ConstantBuffer<T> {
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub(crate) fn gpu_id(&self) -> ResourceId {
        self.gpu
    }
}

impl<T> Drop for ConstantBuffer<T> {
    fn drop(&mut self) {
        self.device.backend().release_resource(self.gpu);
    }
}

impl<T> fmt::Debug for ConstantBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstantBuffer")
            .field("size", &size_of::<T>())
            .field("device", &self.device.native_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceCreationFlags;
    use crate::error::ComputeError;

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Twenty {
        values: [f32; 5],
    }

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct ThirtyTwo {
        values: [f32; 8],
    }

    #[test]
    fn test_size_must_be_multiple_of_16() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let result = device.create_constant_buffer(&Twenty { values: [0.0; 5] });
        assert!(matches!(result, Err(ComputeError::ResourceCreationFailed(_))));

        let mut buffer = device
            .create_constant_buffer(&ThirtyTwo { values: [0.0; 8] })
            .unwrap();
        assert_eq!(buffer.size(), 32);
        assert!(buffer.update(&ThirtyTwo { values: [1.0; 8] }).is_ok());
    }
}
