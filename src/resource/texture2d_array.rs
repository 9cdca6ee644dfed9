//! 2D texture arrays with per-slice access.

use crate::backend::{BindFlags, CpuAccessMode, MappedSubresource, ResourceDimension, ViewDescriptor};
use crate::error::{ComputeError, ComputeResult};
use crate::format::TextureFormat;

use super::texture2d::{check_region, copy_mapped_region, texture_bind_flags};
use super::{Resource, ResourceShape, Texture2D};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Texture2DArrayShape {
    pub width: u32,
    pub height: u32,
    pub slices: u32,
    pub format: TextureFormat,
}

impl Texture2DArrayShape {
    pub fn new(width: u32, height: u32, slices: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            slices,
            format,
        }
    }
}

impl ResourceShape for Texture2DArrayShape {
    const KIND: &'static str = "Texture2DArray";

    fn dimension(&self) -> ResourceDimension {
        ResourceDimension::Texture2D {
            width: self.width,
            height: self.height,
            array_size: self.slices,
            format: self.format,
        }
    }

    fn bind_flags(&self) -> BindFlags {
        texture_bind_flags(self.format)
    }

    fn view(&self) -> ViewDescriptor {
        ViewDescriptor::Texture2DArray {
            format: self.format,
            mip_slice: 0,
            first_slice: 0,
            slice_count: self.slices,
        }
    }

    fn from_dimension(dimension: &ResourceDimension) -> ComputeResult<Self> {
        match *dimension {
            ResourceDimension::Texture2D {
                width,
                height,
                array_size,
                format,
            } => Ok(Self::new(width, height, array_size, format)),
            other => Err(ComputeError::IncompatibleResource(format!(
                "{other:?} is not a texture array"
            ))),
        }
    }
}

/// An array of equally sized 2D texture slices.
pub type Texture2DArray = Resource<Texture2DArrayShape>;

impl Resource<Texture2DArrayShape> {
    pub fn width(&self) -> u32 {
        self.shape.width
    }

    pub fn height(&self) -> u32 {
        self.shape.height
    }

    pub fn slices(&self) -> u32 {
        self.shape.slices
    }

    pub fn format(&self) -> TextureFormat {
        self.shape.format
    }

    fn check_slice(&self, slice: u32) -> ComputeResult<()> {
        if slice >= self.slices() {
            return Err(ComputeError::OutOfRange(format!(
                "slice {slice} of a {}-slice array",
                self.slices()
            )));
        }
        Ok(())
    }

    /// Run `access` with one slice mapped for `mode`.
    ///
    /// The mapped bytes start at the first row of `slice`.
    pub fn access_slice_raw_data<R>(
        &mut self,
        slice: u32,
        mode: CpuAccessMode,
        access: impl FnOnce(&mut MappedSubresource<'_>) -> R,
    ) -> ComputeResult<R> {
        self.check_slice(slice)?;
        self.access_subresource(Some(slice), mode, access)
    }

    /// Copy slice `slice` into the top-left corner of `destination`.
    pub fn copy_slice_to(&mut self, destination: &mut Texture2D, slice: u32) -> ComputeResult<()> {
        let (width, height) = (self.width(), self.height());
        self.copy_slice_region_to(destination, slice, 0, 0, 0, 0, width, height)
    }

    /// Copy a rectangle of slice `slice` into `destination`.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_slice_region_to(
        &mut self,
        destination: &mut Texture2D,
        slice: u32,
        src_x: u32,
        src_y: u32,
        dst_x: u32,
        dst_y: u32,
        width: u32,
        height: u32,
    ) -> ComputeResult<()> {
        self.check_slice(slice)?;
        let region = check_region(
            "src",
            src_x,
            src_y,
            width,
            height,
            (self.width(), self.height()),
        )?;
        check_region(
            "dst",
            dst_x,
            dst_y,
            width,
            height,
            (destination.width(), destination.height()),
        )?;
        if !self.format().is_copy_compatible(destination.format()) {
            return Err(ComputeError::IncompatibleResource(format!(
                "formats {} and {} are not copy compatible",
                self.format(),
                destination.format()
            )));
        }

        if self.device.same_domain(&destination.device) {
            return self.device.backend().copy_subresource_region(
                self.gpu,
                slice,
                Some(region),
                destination.gpu,
                0,
                (dst_x, dst_y),
            );
        }

        if !self.is_cpu_access_enabled() || !destination.is_cpu_access_enabled() {
            return Err(ComputeError::CpuAccessDisabled);
        }
        log::warn!(
            "Copying slice {slice} between devices {:?} and {:?} through the CPU",
            self.device.native_id(),
            destination.device.native_id()
        );
        let texel_size = self.format().size_in_bytes() as usize;
        destination
            .access_raw_data(CpuAccessMode::ReadWrite, |dst| {
                let dst_pitched = dst.pitched();
                self.access_slice_raw_data(slice, CpuAccessMode::Read, |src| {
                    copy_mapped_region(
                        src.bytes(),
                        src.pitched(),
                        (src_x, src_y),
                        dst.bytes_mut(),
                        dst_pitched,
                        (dst_x, dst_y),
                        (width, height),
                        texel_size,
                    )
                })
                .and_then(|copied| copied)
            })
            .and_then(|copied| copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceCreationFlags;
    use crate::device::Device;

    fn slice_data(value: u8) -> Vec<u8> {
        vec![value; 4 * 4 * 4]
    }

    #[test]
    fn test_slice_access() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let (a, b, c) = (slice_data(1), slice_data(2), slice_data(3));
        let mut array = device
            .create_texture2d_array_with_data(4, 4, TextureFormat::R8G8B8A8Unorm, &[a.as_slice(), b.as_slice(), c.as_slice()])
            .unwrap();
        assert_eq!(array.slices(), 3);
        array.enable_cpu_access().unwrap();

        let first = array
            .access_slice_raw_data(1, CpuAccessMode::Read, |mapped| mapped.row(0, 16).map(|row| row.to_vec()))
            .unwrap();
        assert_eq!(first, Some(vec![2; 16]));

        array
            .access_slice_raw_data(2, CpuAccessMode::Write, |mapped| {
                if let Some(row) = mapped.row_mut(3, 16) {
                    row.fill(9);
                }
            })
            .unwrap();
        let last = array
            .access_slice_raw_data(2, CpuAccessMode::Read, |mapped| {
                (mapped.row(2, 4).map(|r| r.to_vec()), mapped.row(3, 4).map(|r| r.to_vec()))
            })
            .unwrap();
        assert_eq!(last, (Some(vec![3; 4]), Some(vec![9; 4])));

        assert!(matches!(
            array.access_slice_raw_data(3, CpuAccessMode::Read, |_| ()),
            Err(ComputeError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_copy_slice() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let (a, b) = (slice_data(4), slice_data(5));
        let mut array = device
            .create_texture2d_array_with_data(4, 4, TextureFormat::R8G8B8A8Unorm, &[a.as_slice(), b.as_slice()])
            .unwrap();
        let mut target = device
            .create_texture2d(4, 4, TextureFormat::R8G8B8A8Unorm)
            .unwrap();
        target.enable_cpu_access().unwrap();

        array.copy_slice_to(&mut target, 1).unwrap();
        let bytes = target
            .access_raw_data(CpuAccessMode::Read, |mapped| mapped.row(3, 16).map(|r| r.to_vec()))
            .unwrap();
        assert_eq!(bytes, Some(vec![5; 16]));

        assert!(matches!(
            array.copy_slice_to(&mut target, 2),
            Err(ComputeError::OutOfRange(_))
        ));

        let mut small = device
            .create_texture2d(2, 2, TextureFormat::R8G8B8A8Unorm)
            .unwrap();
        assert!(matches!(
            array.copy_slice_to(&mut small, 0),
            Err(ComputeError::OutOfRange(_))
        ));
        assert!(array
            .copy_slice_region_to(&mut small, 0, 2, 2, 0, 0, 2, 2)
            .is_ok());
    }
}
