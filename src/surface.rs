//! Presentation surfaces.
//!
//! A surface consumes one [`Texture2D`] per frame. Windowing and swap chains
//! live outside this crate; implementors only need [`PresentationSurface`].

use image::DynamicImage;

use crate::device::Device;
use crate::error::{ComputeError, ComputeResult};
use crate::format::TextureFormat;
use crate::imaging::TextureConverter;
use crate::resource::Texture2D;

/// Destination for rendered frames.
pub trait PresentationSurface {
    /// Current extent in pixels.
    fn size(&self) -> (u32, u32);

    fn format(&self) -> TextureFormat;

    /// Hand `frame` to the surface. Implementations call [`validate_frame`] first.
    fn present(&mut self, frame: &Texture2D) -> ComputeResult<()>;
}

/// Check that `frame` can be presented on `surface`.
///
/// The frame must match the surface extent, be copy compatible with its
/// format, and have CPU access disabled so the presentation copy does not
/// contend with a staging mirror.
pub fn validate_frame(surface: &dyn PresentationSurface, frame: &Texture2D) -> ComputeResult<()> {
    let (width, height) = surface.size();
    if (frame.width(), frame.height()) != (width, height) {
        return Err(ComputeError::IncompatibleResource(format!(
            "frame is {}x{}, surface is {width}x{height}",
            frame.width(),
            frame.height()
        )));
    }
    if !frame.format().is_copy_compatible(surface.format()) {
        return Err(ComputeError::IncompatibleResource(format!(
            "frame format {} cannot be presented as {}",
            frame.format(),
            surface.format()
        )));
    }
    if frame.is_cpu_access_enabled() {
        return Err(ComputeError::ArgumentInvalid(
            "disable CPU access on a frame before presenting it".into(),
        ));
    }
    Ok(())
}

/// A surface without a window that keeps the last presented frame as a bitmap.
#[derive(Debug)]
pub struct HeadlessSurface {
    width: u32,
    height: u32,
    format: TextureFormat,
    converter: TextureConverter,
    last_frame: Option<DynamicImage>,
    frames_presented: u64,
}

impl HeadlessSurface {
    /// # Errors
    ///
    /// Returns [`ComputeError::UnsupportedFormat`] if `format` has no bitmap layout.
    pub fn new(device: &Device, width: u32, height: u32, format: TextureFormat) -> ComputeResult<Self> {
        if format.pixel_layout().is_none() {
            return Err(ComputeError::UnsupportedFormat(format!(
                "{format} cannot back a headless surface"
            )));
        }
        log::info!("Created {width}x{height} headless surface ({format})");
        Ok(Self {
            width,
            height,
            format,
            converter: TextureConverter::new(device),
            last_frame: None,
            frames_presented: 0,
        })
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        log::debug!("Headless surface resized to {width}x{height}");
        self.width = width;
        self.height = height;
        self.last_frame = None;
    }

    pub fn last_frame(&self) -> Option<&DynamicImage> {
        self.last_frame.as_ref()
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }
}

impl PresentationSurface for HeadlessSurface {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> TextureFormat {
        self.format
    }

    fn present(&mut self, frame: &Texture2D) -> ComputeResult<()> {
        validate_frame(self, frame)?;
        self.last_frame = Some(self.converter.convert(frame)?);
        self.frames_presented += 1;
        log::trace!("Presented frame {}", self.frames_presented);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceCreationFlags;
    use image::GenericImageView;

    #[test]
    fn test_present_rules() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let mut surface =
            HeadlessSurface::new(&device, 4, 4, TextureFormat::R8G8B8A8Unorm).unwrap();

        let mut frame = device
            .create_texture2d_with_data(4, 4, TextureFormat::R8G8B8A8Unorm, &[200; 64])
            .unwrap();
        frame.enable_cpu_access().unwrap();
        assert!(matches!(
            surface.present(&frame),
            Err(ComputeError::ArgumentInvalid(_))
        ));

        frame.disable_cpu_access();
        surface.present(&frame).unwrap();
        assert_eq!(surface.frames_presented(), 1);
        let image = surface.last_frame().unwrap();
        assert_eq!(image.dimensions(), (4, 4));
        assert_eq!(image.as_bytes(), &[200; 64][..]);

        let small = device
            .create_texture2d(2, 2, TextureFormat::R8G8B8A8Unorm)
            .unwrap();
        assert!(matches!(
            surface.present(&small),
            Err(ComputeError::IncompatibleResource(_))
        ));
    }

    #[test]
    fn test_surface_format_needs_bitmap_layout() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        assert!(matches!(
            HeadlessSurface::new(&device, 4, 4, TextureFormat::R32Float),
            Err(ComputeError::UnsupportedFormat(_))
        ));
    }
}
