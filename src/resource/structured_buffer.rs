//! Typed structured buffers.

use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;

use bytemuck::Pod;

use crate::backend::{
    BindFlags, CpuAccessMode, ResourceDimension, SubresourceData, ViewDescriptor,
};
use crate::error::{ComputeError, ComputeResult};

use super::{Resource, ResourceShape};

/// Element count of a structured buffer of `T`; the stride is `size_of::<T>()`.
pub struct StructuredShape<T> {
    len: u32,
    _element: PhantomData<fn() -> T>,
}

impl<T: Pod> StructuredShape<T> {
    pub fn with_len(len: usize) -> ComputeResult<Self> {
        let len = u32::try_from(len).map_err(|_| {
            ComputeError::ResourceCreationFailed(format!("{len} elements exceed the buffer limit"))
        })?;
        Ok(Self {
            len,
            _element: PhantomData,
        })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn stride() -> u32 {
        size_of::<T>() as u32
    }
}

impl<T> Clone for StructuredShape<T> {
    fn clone(&self) -> Self {
        Self {
            len: self.len,
            _element: PhantomData,
        }
    }
}

impl<T> fmt::Debug for StructuredShape<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredShape")
            .field("len", &self.len)
            .field("stride", &size_of::<T>())
            .finish()
    }
}

impl<T: Pod> ResourceShape for StructuredShape<T> {
    const KIND: &'static str = "StructuredBuffer";

    fn dimension(&self) -> ResourceDimension {
        ResourceDimension::Buffer {
            size: self.len as u64 * Self::stride() as u64,
            stride: Self::stride(),
        }
    }

    fn bind_flags(&self) -> BindFlags {
        BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS
    }

    fn view(&self) -> ViewDescriptor {
        ViewDescriptor::Buffer {
            first_element: 0,
            element_count: self.len,
            counter: true,
        }
    }

    fn from_dimension(dimension: &ResourceDimension) -> ComputeResult<Self> {
        match *dimension {
            ResourceDimension::Buffer { size, stride } if stride == Self::stride() && stride > 0 => {
                Self::with_len((size / stride as u64) as usize)
            }
            other => Err(ComputeError::IncompatibleResource(format!(
                "{other:?} is not a structured buffer of {}-byte elements",
                Self::stride()
            ))),
        }
    }

    fn cpu_access_on_import() -> bool {
        true
    }
}

/// A fixed-length GPU array of `T`.
pub type StructuredBuffer<T> = Resource<StructuredShape<T>>;

impl<T: Pod> Resource<StructuredShape<T>> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.shape.len == 0
    }

    /// Element stride in bytes.
    pub fn stride(&self) -> u32 {
        StructuredShape::<T>::stride()
    }

    fn check_len(&self, len: usize) -> ComputeResult<()> {
        if len != self.len() {
            return Err(ComputeError::ArgumentInvalid(format!(
                "{len} elements supplied for a buffer of {}",
                self.len()
            )));
        }
        Ok(())
    }

    /// Overwrite every element directly on the GPU, bypassing the staging mirror.
    pub fn set_data(&mut self, data: &[T]) -> ComputeResult<()> {
        self.check_len(data.len())?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.device.backend().update_resource(
            self.gpu,
            SubresourceData {
                bytes,
                row_pitch: bytes.len(),
                slice_pitch: bytes.len(),
            },
        )
    }

    /// Read every element into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::CpuAccessDisabled`] unless CPU access is enabled,
    /// and [`ComputeError::ArgumentInvalid`] if `out` has the wrong length.
    pub fn get_data(&mut self, out: &mut [T]) -> ComputeResult<()> {
        self.check_len(out.len())?;
        let size = self.resource_size() as usize;
        self.access_raw_data(CpuAccessMode::Read, |mapped| -> ComputeResult<()> {
            let source = mapped.bytes().get(..size).ok_or_else(|| {
                ComputeError::Internal(format!(
                    "mapped {} bytes of a {size}-byte buffer",
                    mapped.len()
                ))
            })?;
            bytemuck::cast_slice_mut::<T, u8>(out).copy_from_slice(source);
            Ok(())
        })?
    }

    /// Read every element into a new vector.
    pub fn to_vec(&mut self) -> ComputeResult<Vec<T>> {
        let mut out = vec![T::zeroed(); self.len()];
        self.get_data(&mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceCreationFlags;
    use crate::device::Device;

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Particle {
        position: [f32; 3],
        mass: f32,
    }

    #[test]
    fn test_shape() {
        let shape = StructuredShape::<Particle>::with_len(8).unwrap();
        assert_eq!(StructuredShape::<Particle>::stride(), 16);
        assert_eq!(
            shape.dimension(),
            ResourceDimension::Buffer {
                size: 128,
                stride: 16
            }
        );
        assert_eq!(
            StructuredShape::<Particle>::from_dimension(&shape.dimension())
                .unwrap()
                .len(),
            8
        );
        assert!(StructuredShape::<u32>::from_dimension(&shape.dimension()).is_err());
    }

    #[test]
    fn test_set_and_get() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let initial = [Particle {
            position: [0.0; 3],
            mass: 1.0,
        }; 4];
        let mut buffer = device.create_structured_buffer(&initial).unwrap();
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.stride(), 16);

        let mut out = [Particle {
            position: [0.0; 3],
            mass: 0.0,
        }; 4];
        assert_eq!(buffer.get_data(&mut out), Err(ComputeError::CpuAccessDisabled));

        buffer.enable_cpu_access().unwrap();
        let updated: Vec<Particle> = (0..4)
            .map(|i| Particle {
                position: [i as f32, 0.0, 1.0],
                mass: 2.0,
            })
            .collect();
        buffer.set_data(&updated).unwrap();
        assert_eq!(buffer.to_vec().unwrap(), updated);

        assert!(matches!(
            buffer.set_data(&updated[..2]),
            Err(ComputeError::ArgumentInvalid(_))
        ));
        assert!(matches!(
            buffer.get_data(&mut out[..3]),
            Err(ComputeError::ArgumentInvalid(_))
        ));
    }

    #[test]
    fn test_sizing_rules() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        // 3 x 4 bytes is not a multiple of 16.
        assert!(matches!(
            device.create_structured_buffer(&[1.0f32, 2.0, 3.0]),
            Err(ComputeError::ResourceCreationFailed(_))
        ));
        assert!(device.create_structured_buffer_zeroed::<u32>(8).is_ok());
    }
}
