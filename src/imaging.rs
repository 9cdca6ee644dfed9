//! Bitmap interop.
//!
//! Decoding goes through the `image` crate. Only 32-bit and 64-bit RGBA
//! bitmaps have a texture format counterpart; everything else is rejected
//! rather than converted.

use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageBuffer, ImageError, Rgba};

use crate::backend::CpuAccessMode;
use crate::device::Device;
use crate::error::{ComputeError, ComputeResult};
use crate::format::{PixelLayout, TextureFormat};
use crate::resource::Texture2D;

/// Tightly packed pixels of a decoded bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub pixels: Vec<u8>,
}

/// Decode the image file at `path`.
///
/// # Errors
///
/// Returns [`ComputeError::ArgumentInvalid`] if the file cannot be read and
/// [`ComputeError::UnsupportedFormat`] if it does not decode to RGBA8 or RGBA16.
pub fn decode_image_file(path: impl AsRef<Path>) -> ComputeResult<DecodedImage> {
    let path = path.as_ref();
    let image = image::open(path).map_err(|e| match e {
        ImageError::IoError(io) => {
            ComputeError::ArgumentInvalid(format!("cannot read {}: {io}", path.display()))
        }
        other => ComputeError::UnsupportedFormat(format!("{}: {other}", path.display())),
    })?;
    let (width, height) = image.dimensions();
    log::debug!(
        "Decoded {} ({width}x{height}, {:?})",
        path.display(),
        image.color()
    );
    decode_image(&image)
}

/// Extract the pixels of an in-memory bitmap.
pub fn decode_image(image: &DynamicImage) -> ComputeResult<DecodedImage> {
    let (layout, pixels) = match image {
        DynamicImage::ImageRgba8(buffer) => (PixelLayout::Rgba8, buffer.as_raw().clone()),
        DynamicImage::ImageRgba16(buffer) => (
            PixelLayout::Rgba16,
            buffer
                .as_raw()
                .iter()
                .flat_map(|channel| channel.to_ne_bytes())
                .collect(),
        ),
        other => {
            return Err(ComputeError::UnsupportedFormat(format!(
                "{:?} has no texture format; convert to RGBA8 or RGBA16 first",
                other.color()
            )))
        }
    };
    let (width, height) = image.dimensions();
    Ok(DecodedImage {
        width,
        height,
        format: layout.texture_format(),
        pixels,
    })
}

/// Reads textures back into bitmaps.
///
/// The converter owns a CPU-accessible copy of the last texture shape it
/// converted, so source textures need no CPU access of their own.
#[derive(Debug)]
pub struct TextureConverter {
    device: Device,
    staging: Option<Texture2D>,
}

impl TextureConverter {
    pub fn new(device: &Device) -> Self {
        Self {
            device: device.clone(),
            staging: None,
        }
    }

    fn staging_for(&mut self, texture: &Texture2D) -> ComputeResult<&mut Texture2D> {
        let reusable = self
            .staging
            .as_ref()
            .is_some_and(|staging| staging.shape() == texture.shape());
        if !reusable {
            let mut staging =
                self.device
                    .create_texture2d(texture.width(), texture.height(), texture.format())?;
            staging.enable_cpu_access()?;
            self.staging = Some(staging);
        }
        self.staging
            .as_mut()
            .ok_or_else(|| ComputeError::Internal("converter staging texture missing".into()))
    }

    /// Copy `texture` into a new bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::UnsupportedFormat`] for formats without a bitmap
    /// layout and [`ComputeError::IncompatibleResource`] for textures of
    /// another device.
    pub fn convert(&mut self, texture: &Texture2D) -> ComputeResult<DynamicImage> {
        if !self.device.same_domain(texture.device()) {
            return Err(ComputeError::IncompatibleResource(
                "texture belongs to another device than the converter".into(),
            ));
        }
        let layout = texture.format().pixel_layout().ok_or_else(|| {
            ComputeError::UnsupportedFormat(format!("{} has no bitmap layout", texture.format()))
        })?;
        let (width, height) = (texture.width(), texture.height());
        let row_bytes = width as usize * texture.format().size_in_bytes() as usize;

        let staging = self.staging_for(texture)?;
        texture.copy_resource(staging)?;
        let pixels = staging.access_raw_data(CpuAccessMode::Read, |mapped| {
            let mut pixels = Vec::with_capacity(row_bytes * height as usize);
            for y in 0..height as usize {
                let row = mapped.row(y, row_bytes).ok_or_else(|| {
                    ComputeError::Internal(format!("row {y} missing from mapped texture"))
                })?;
                pixels.extend_from_slice(row);
            }
            Ok::<_, ComputeError>(pixels)
        })??;

        let image = match layout {
            PixelLayout::Rgba8 => ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, pixels)
                .map(DynamicImage::ImageRgba8),
            PixelLayout::Rgba16 => {
                let channels = pixels
                    .chunks_exact(2)
                    .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
                    .collect();
                ImageBuffer::<Rgba<u16>, _>::from_raw(width, height, channels)
                    .map(DynamicImage::ImageRgba16)
            }
        };
        image.ok_or_else(|| ComputeError::Internal("pixel buffer does not match extent".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceCreationFlags;

    #[test]
    fn test_decode_layouts() {
        let rgba8 = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(3, 2, Rgba([1u8, 2, 3, 4])));
        let decoded = decode_image(&rgba8).unwrap();
        assert_eq!((decoded.width, decoded.height), (3, 2));
        assert_eq!(decoded.format, TextureFormat::R8G8B8A8Unorm);
        assert_eq!(decoded.pixels.len(), 24);
        assert_eq!(&decoded.pixels[..4], &[1, 2, 3, 4]);

        let rgba16 =
            DynamicImage::ImageRgba16(ImageBuffer::from_pixel(2, 2, Rgba([1u16, 2, 3, 4])));
        let decoded = decode_image(&rgba16).unwrap();
        assert_eq!(decoded.format, TextureFormat::R16G16B16A16Unorm);
        assert_eq!(decoded.pixels.len(), 32);

        let rgb = DynamicImage::ImageRgb8(ImageBuffer::new(2, 2));
        assert!(matches!(
            decode_image(&rgb),
            Err(ComputeError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            decode_image_file("does/not/exist.png"),
            Err(ComputeError::ArgumentInvalid(_))
        ));
    }

    #[test]
    fn test_convert_crops_row_padding() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        // 3 RGBA8 texels per row is 12 bytes, below the 16-byte pitch alignment.
        let source = DynamicImage::ImageRgba8(ImageBuffer::from_fn(3, 3, |x, y| {
            Rgba([x as u8, y as u8, 7, 255])
        }));
        let texture = device.create_texture2d_from_image(&source).unwrap();
        assert!(!texture.is_cpu_access_enabled());

        let mut converter = TextureConverter::new(&device);
        let image = converter.convert(&texture).unwrap();
        assert_eq!(image, source);

        let float = device
            .create_texture2d(2, 2, TextureFormat::R32Float)
            .unwrap();
        assert!(matches!(
            converter.convert(&float),
            Err(ComputeError::UnsupportedFormat(_))
        ));
    }
}
