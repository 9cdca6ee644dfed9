//! Single-slice 2D textures.

use crate::backend::{
    copy_pitched, BindFlags, CopyRegion, CpuAccessMode, Pitched, ResourceDimension, ViewDescriptor,
};
use crate::error::{ComputeError, ComputeResult};
use crate::format::TextureFormat;

use super::{Resource, ResourceShape};

/// Extent and format of a 2D texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Texture2DShape {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl Texture2DShape {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }
}

/// Bind flags shared by every texture shape.
pub(super) fn texture_bind_flags(format: TextureFormat) -> BindFlags {
    if format.supports_unordered_access() {
        BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS
    } else {
        BindFlags::SHADER_RESOURCE
    }
}

impl ResourceShape for Texture2DShape {
    const KIND: &'static str = "Texture2D";

    fn dimension(&self) -> ResourceDimension {
        ResourceDimension::Texture2D {
            width: self.width,
            height: self.height,
            array_size: 1,
            format: self.format,
        }
    }

    fn bind_flags(&self) -> BindFlags {
        texture_bind_flags(self.format)
    }

    fn view(&self) -> ViewDescriptor {
        ViewDescriptor::Texture2D {
            format: self.format,
            mip_slice: 0,
        }
    }

    fn from_dimension(dimension: &ResourceDimension) -> ComputeResult<Self> {
        match *dimension {
            ResourceDimension::Texture2D {
                width,
                height,
                array_size: 1,
                format,
            } => Ok(Self::new(width, height, format)),
            other => Err(ComputeError::IncompatibleResource(format!(
                "{other:?} is not a single-slice 2D texture"
            ))),
        }
    }
}

/// A 2D texture.
pub type Texture2D = Resource<Texture2DShape>;

/// Check a copy rectangle against a `width` x `height` texture.
pub(super) fn check_region(
    side: &str,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    bounds: (u32, u32),
) -> ComputeResult<CopyRegion> {
    let region = CopyRegion::new(x, y, width, height);
    if region.fits_within(bounds.0, bounds.1) {
        return Ok(region);
    }
    Err(ComputeError::OutOfRange(format!(
        "{side} region {x},{y} {width}x{height} exceeds {}x{}: {side}X + width = {}, {side}Y + height = {}",
        bounds.0,
        bounds.1,
        x as u64 + width as u64,
        y as u64 + height as u64
    )))
}

/// Copy a rectangle between two mapped textures using each side's pitch.
#[allow(clippy::too_many_arguments)]
pub(super) fn copy_mapped_region(
    src: &[u8],
    src_pitch: Pitched,
    src_origin: (u32, u32),
    dst: &mut [u8],
    dst_pitch: Pitched,
    dst_origin: (u32, u32),
    region: (u32, u32),
    texel_size: usize,
) -> ComputeResult<()> {
    let src_layout = Pitched {
        offset: src_pitch.offset
            + src_origin.1 as usize * src_pitch.row_pitch
            + src_origin.0 as usize * texel_size,
        ..src_pitch
    };
    let dst_layout = Pitched {
        offset: dst_pitch.offset
            + dst_origin.1 as usize * dst_pitch.row_pitch
            + dst_origin.0 as usize * texel_size,
        ..dst_pitch
    };
    copy_pitched(
        src,
        src_layout,
        dst,
        dst_layout,
        region.0 as usize * texel_size,
        region.1,
        1,
    )
}

impl Resource<Texture2DShape> {
    pub fn width(&self) -> u32 {
        self.shape.width
    }

    pub fn height(&self) -> u32 {
        self.shape.height
    }

    pub fn format(&self) -> TextureFormat {
        self.shape.format
    }

    /// Copy a `width` x `height` rectangle at (`src_x`, `src_y`) into
    /// `destination` at (`dst_x`, `dst_y`).
    ///
    /// Texels of `destination` outside the rectangle are preserved. Across
    /// domains both textures need CPU access.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::OutOfRange`] if the rectangle leaves either texture.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_region_to(
        &mut self,
        destination: &mut Texture2D,
        src_x: u32,
        src_y: u32,
        dst_x: u32,
        dst_y: u32,
        width: u32,
        height: u32,
    ) -> ComputeResult<()> {
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
                0,
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
            "Copying a {width}x{height} region between devices {:?} and {:?} through the CPU",
            self.device.native_id(),
            destination.device.native_id()
        );
        let texel_size = self.format().size_in_bytes() as usize;
        destination
            .access_raw_data(CpuAccessMode::ReadWrite, |dst| {
                let dst_pitched = dst.pitched();
                self.access_raw_data(CpuAccessMode::Read, |src| {
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
