//! Texture and element formats.
//!
//! [`TextureFormat`] is the closed set of pixel layouts understood by the
//! native API, keeping the native numeric values so formats survive a round
//! trip through raw handles. Formats sharing a typeless family are copy
//! compatible: an `R32G32B32Float` texture can be copied into an
//! `R32G32B32Uint` texture because both belong to `R32G32B32Typeless`.

macro_rules! texture_formats {
    ($($name:ident = $value:literal,)*) => {
        /// Pixel / element layout of a texture.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum TextureFormat {
            $($name = $value,)*
        }

        impl TextureFormat {
            /// Every format, in native value order.
            pub const ALL: &'static [TextureFormat] = &[$(TextureFormat::$name,)*];

            /// Look up a format by its native value.
            pub fn from_raw(value: u32) -> Option<Self> {
                match value {
                    $($value => Some(TextureFormat::$name),)*
                    _ => None,
                }
            }
        }
    };
}

texture_formats! {
    Unknown = 0,
    R32G32B32A32Typeless = 1,
    R32G32B32A32Float = 2,
    R32G32B32A32Uint = 3,
    R32G32B32A32Sint = 4,
    R32G32B32Typeless = 5,
    R32G32B32Float = 6,
    R32G32B32Uint = 7,
    R32G32B32Sint = 8,
    R16G16B16A16Typeless = 9,
    R16G16B16A16Float = 10,
    R16G16B16A16Unorm = 11,
    R16G16B16A16Uint = 12,
    R16G16B16A16Snorm = 13,
    R16G16B16A16Sint = 14,
    R32G32Typeless = 15,
    R32G32Float = 16,
    R32G32Uint = 17,
    R32G32Sint = 18,
    R32G8X24Typeless = 19,
    D32FloatS8X24Uint = 20,
    R32FloatX8X24Typeless = 21,
    X32TypelessG8X24Uint = 22,
    R10G10B10A2Typeless = 23,
    R10G10B10A2Unorm = 24,
    R10G10B10A2Uint = 25,
    R11G11B10Float = 26,
    R8G8B8A8Typeless = 27,
    R8G8B8A8Unorm = 28,
    R8G8B8A8UnormSrgb = 29,
    R8G8B8A8Uint = 30,
    R8G8B8A8Snorm = 31,
    R8G8B8A8Sint = 32,
    R16G16Typeless = 33,
    R16G16Float = 34,
    R16G16Unorm = 35,
    R16G16Uint = 36,
    R16G16Snorm = 37,
    R16G16Sint = 38,
    R32Typeless = 39,
    D32Float = 40,
    R32Float = 41,
    R32Uint = 42,
    R32Sint = 43,
    R24G8Typeless = 44,
    D24UnormS8Uint = 45,
    R24UnormX8Typeless = 46,
    X24TypelessG8Uint = 47,
    R8G8Typeless = 48,
    R8G8Unorm = 49,
    R8G8Uint = 50,
    R8G8Snorm = 51,
    R8G8Sint = 52,
    R16Typeless = 53,
    R16Float = 54,
    D16Unorm = 55,
    R16Unorm = 56,
    R16Uint = 57,
    R16Snorm = 58,
    R16Sint = 59,
    R8Typeless = 60,
    R8Unorm = 61,
    R8Uint = 62,
    R8Snorm = 63,
    R8Sint = 64,
    A8Unorm = 65,
    R1Unorm = 66,
    R9G9B9E5Sharedexp = 67,
    R8G8B8G8Unorm = 68,
    G8R8G8B8Unorm = 69,
    Bc1Typeless = 70,
    Bc1Unorm = 71,
    Bc1UnormSrgb = 72,
    Bc2Typeless = 73,
    Bc2Unorm = 74,
    Bc2UnormSrgb = 75,
    Bc3Typeless = 76,
    Bc3Unorm = 77,
    Bc3UnormSrgb = 78,
    Bc4Typeless = 79,
    Bc4Unorm = 80,
    Bc4Snorm = 81,
    Bc5Typeless = 82,
    Bc5Unorm = 83,
    Bc5Snorm = 84,
    B5G6R5Unorm = 85,
    B5G5R5A1Unorm = 86,
    B8G8R8A8Unorm = 87,
    B8G8R8X8Unorm = 88,
    R10G10B10XrBiasA2Unorm = 89,
    B8G8R8A8Typeless = 90,
    B8G8R8A8UnormSrgb = 91,
    B8G8R8X8Typeless = 92,
    B8G8R8X8UnormSrgb = 93,
    Bc6hTypeless = 94,
    Bc6hUf16 = 95,
    Bc6hSf16 = 96,
    Bc7Typeless = 97,
    Bc7Unorm = 98,
    Bc7UnormSrgb = 99,
    Ayuv = 100,
    Y410 = 101,
    Y416 = 102,
    Nv12 = 103,
    P010 = 104,
    P016 = 105,
    Opaque420 = 106,
    Yuy2 = 107,
    Y210 = 108,
    Y216 = 109,
    Nv11 = 110,
    Ai44 = 111,
    Ia44 = 112,
    P8 = 113,
    A8P8 = 114,
    B4G4R4A4Unorm = 115,
    P208 = 130,
    V208 = 131,
    V408 = 132,
}

impl TextureFormat {
    /// Native numeric value.
    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Bits occupied by one pixel (or the per-pixel average for block and planar formats).
    pub fn bits_per_pixel(self) -> u32 {
        use TextureFormat::*;
        match self {
            R32G32B32A32Typeless | R32G32B32A32Float | R32G32B32A32Uint | R32G32B32A32Sint => 128,
            R32G32B32Typeless | R32G32B32Float | R32G32B32Uint | R32G32B32Sint => 96,
            R16G16B16A16Typeless | R16G16B16A16Float | R16G16B16A16Unorm | R16G16B16A16Uint
            | R16G16B16A16Snorm | R16G16B16A16Sint | R32G32Typeless | R32G32Float
            | R32G32Uint | R32G32Sint | R32G8X24Typeless | D32FloatS8X24Uint
            | R32FloatX8X24Typeless | X32TypelessG8X24Uint | Y416 | Y210 | Y216 => 64,
            R10G10B10A2Typeless | R10G10B10A2Unorm | R10G10B10A2Uint | R11G11B10Float
            | R8G8B8A8Typeless | R8G8B8A8Unorm | R8G8B8A8UnormSrgb | R8G8B8A8Uint
            | R8G8B8A8Snorm | R8G8B8A8Sint | R16G16Typeless | R16G16Float | R16G16Unorm
            | R16G16Uint | R16G16Snorm | R16G16Sint | R32Typeless | D32Float | R32Float
            | R32Uint | R32Sint | R24G8Typeless | D24UnormS8Uint | R24UnormX8Typeless
            | X24TypelessG8Uint | R9G9B9E5Sharedexp | R8G8B8G8Unorm | G8R8G8B8Unorm
            | B8G8R8A8Unorm | B8G8R8X8Unorm | R10G10B10XrBiasA2Unorm | B8G8R8A8Typeless
            | B8G8R8A8UnormSrgb | B8G8R8X8Typeless | B8G8R8X8UnormSrgb | Ayuv | Y410 | Yuy2 => {
                32
            }
            P010 | P016 | V408 => 24,
            R8G8Typeless | R8G8Unorm | R8G8Uint | R8G8Snorm | R8G8Sint | R16Typeless
            | R16Float | D16Unorm | R16Unorm | R16Uint | R16Snorm | R16Sint | B5G6R5Unorm
            | B5G5R5A1Unorm | A8P8 | B4G4R4A4Unorm | P208 | V208 => 16,
            Nv12 | Opaque420 | Nv11 => 12,
            R8Typeless | R8Unorm | R8Uint | R8Snorm | R8Sint | A8Unorm | Ai44 | Ia44 | P8
            | Bc2Typeless | Bc2Unorm | Bc2UnormSrgb | Bc3Typeless | Bc3Unorm | Bc3UnormSrgb
            | Bc5Typeless | Bc5Unorm | Bc5Snorm | Bc6hTypeless | Bc6hUf16 | Bc6hSf16
            | Bc7Typeless | Bc7Unorm | Bc7UnormSrgb => 8,
            Bc1Typeless | Bc1Unorm | Bc1UnormSrgb | Bc4Typeless | Bc4Unorm | Bc4Snorm => 4,
            R1Unorm => 1,
            Unknown => 0,
        }
    }

    /// Bytes occupied by one pixel; zero when a pixel is not byte addressable.
    pub fn size_in_bytes(self) -> u32 {
        self.bits_per_pixel() / 8
    }

    /// The typeless member of this format's family, or the format itself when
    /// it has no family.
    pub fn typeless_group(self) -> TextureFormat {
        use TextureFormat::*;
        match self {
            R32G32B32A32Typeless | R32G32B32A32Float | R32G32B32A32Uint | R32G32B32A32Sint => {
                R32G32B32A32Typeless
            }
            R32G32B32Typeless | R32G32B32Float | R32G32B32Uint | R32G32B32Sint => {
                R32G32B32Typeless
            }
            R16G16B16A16Typeless | R16G16B16A16Float | R16G16B16A16Unorm | R16G16B16A16Uint
            | R16G16B16A16Snorm | R16G16B16A16Sint => R16G16B16A16Typeless,
            R32G32Typeless | R32G32Float | R32G32Uint | R32G32Sint => R32G32Typeless,
            R32G8X24Typeless | D32FloatS8X24Uint | R32FloatX8X24Typeless
            | X32TypelessG8X24Uint => R32G8X24Typeless,
            R10G10B10A2Typeless | R10G10B10A2Unorm | R10G10B10A2Uint => R10G10B10A2Typeless,
            R8G8B8A8Typeless | R8G8B8A8Unorm | R8G8B8A8UnormSrgb | R8G8B8A8Uint
            | R8G8B8A8Snorm | R8G8B8A8Sint => R8G8B8A8Typeless,
            R16G16Typeless | R16G16Float | R16G16Unorm | R16G16Uint | R16G16Snorm
            | R16G16Sint => R16G16Typeless,
            R32Typeless | D32Float | R32Float | R32Uint | R32Sint => R32Typeless,
            R24G8Typeless | D24UnormS8Uint | R24UnormX8Typeless | X24TypelessG8Uint => {
                R24G8Typeless
            }
            R8G8Typeless | R8G8Unorm | R8G8Uint | R8G8Snorm | R8G8Sint => R8G8Typeless,
            R16Typeless | R16Float | D16Unorm | R16Unorm | R16Uint | R16Snorm | R16Sint => {
                R16Typeless
            }
            R8Typeless | R8Unorm | R8Uint | R8Snorm | R8Sint => R8Typeless,
            Bc1Typeless | Bc1Unorm | Bc1UnormSrgb => Bc1Typeless,
            Bc2Typeless | Bc2Unorm | Bc2UnormSrgb => Bc2Typeless,
            Bc3Typeless | Bc3Unorm | Bc3UnormSrgb => Bc3Typeless,
            Bc4Typeless | Bc4Unorm | Bc4Snorm => Bc4Typeless,
            Bc5Typeless | Bc5Unorm | Bc5Snorm => Bc5Typeless,
            B8G8R8A8Typeless | B8G8R8A8Unorm | B8G8R8A8UnormSrgb => B8G8R8A8Typeless,
            B8G8R8X8Typeless | B8G8R8X8Unorm | B8G8R8X8UnormSrgb => B8G8R8X8Typeless,
            Bc6hTypeless | Bc6hUf16 | Bc6hSf16 => Bc6hTypeless,
            Bc7Typeless | Bc7Unorm | Bc7UnormSrgb => Bc7Typeless,
            other => other,
        }
    }

    /// Whether a copy between the two formats is legal.
    pub fn is_copy_compatible(self, other: TextureFormat) -> bool {
        self != TextureFormat::Unknown && self.typeless_group() == other.typeless_group()
    }

    pub fn is_typeless(self) -> bool {
        use TextureFormat::*;
        matches!(
            self,
            R32G32B32A32Typeless
                | R32G32B32Typeless
                | R16G16B16A16Typeless
                | R32G32Typeless
                | R32G8X24Typeless
                | R32FloatX8X24Typeless
                | X32TypelessG8X24Uint
                | R10G10B10A2Typeless
                | R8G8B8A8Typeless
                | R16G16Typeless
                | R32Typeless
                | R24G8Typeless
                | R24UnormX8Typeless
                | X24TypelessG8Uint
                | R8G8Typeless
                | R16Typeless
                | R8Typeless
                | Bc1Typeless
                | Bc2Typeless
                | Bc3Typeless
                | Bc4Typeless
                | Bc5Typeless
                | B8G8R8A8Typeless
                | B8G8R8X8Typeless
                | Bc6hTypeless
                | Bc7Typeless
        )
    }

    pub fn is_depth(self) -> bool {
        use TextureFormat::*;
        matches!(self, D32FloatS8X24Uint | D32Float | D24UnormS8Uint | D16Unorm)
    }

    pub fn is_block_compressed(self) -> bool {
        (TextureFormat::Bc1Typeless.raw()..=TextureFormat::Bc5Snorm.raw()).contains(&self.raw())
            || (TextureFormat::Bc6hTypeless.raw()..=TextureFormat::Bc7UnormSrgb.raw())
                .contains(&self.raw())
    }

    /// Video, palette and packed-pair formats with no plain per-pixel layout.
    pub fn is_video(self) -> bool {
        use TextureFormat::*;
        (self.raw() >= Ayuv.raw() && self != B4G4R4A4Unorm)
            || matches!(self, R8G8B8G8Unorm | G8R8G8B8Unorm)
    }

    /// Whether texels are stored as plain rows of whole bytes, which is what
    /// staging mirrors and CPU copies require.
    pub fn is_linear(self) -> bool {
        self != TextureFormat::Unknown
            && self.bits_per_pixel() % 8 == 0
            && !self.is_block_compressed()
            && !self.is_video()
    }

    /// Whether a read/write kernel view can be created over this format.
    pub fn supports_unordered_access(self) -> bool {
        self.is_linear() && !self.is_typeless() && !self.is_depth()
    }

    /// Formats only available on devices created with BGRA support.
    pub fn requires_bgra_support(self) -> bool {
        use TextureFormat::*;
        matches!(
            self,
            B5G6R5Unorm
                | B5G5R5A1Unorm
                | B8G8R8A8Unorm
                | B8G8R8X8Unorm
                | B8G8R8A8Typeless
                | B8G8R8A8UnormSrgb
                | B8G8R8X8Typeless
                | B8G8R8X8UnormSrgb
                | B4G4R4A4Unorm
        )
    }

    /// The bitmap layout with the same memory representation, if any.
    pub fn pixel_layout(self) -> Option<PixelLayout> {
        match self {
            TextureFormat::R8G8B8A8Unorm => Some(PixelLayout::Rgba8),
            TextureFormat::R16G16B16A16Unorm => Some(PixelLayout::Rgba16),
            _ => None,
        }
    }
}

impl std::fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Bitmap pixel layouts that have a texture format counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// 32 bits per pixel, four 8-bit RGBA channels.
    Rgba8,
    /// 64 bits per pixel, four 16-bit RGBA channels.
    Rgba16,
}

impl PixelLayout {
    pub fn texture_format(self) -> TextureFormat {
        match self {
            PixelLayout::Rgba8 => TextureFormat::R8G8B8A8Unorm,
            PixelLayout::Rgba16 => TextureFormat::R16G16B16A16Unorm,
        }
    }

    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelLayout::Rgba8 => 32,
            PixelLayout::Rgba16 => 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_values_round_trip() {
        for format in TextureFormat::ALL {
            assert_eq!(TextureFormat::from_raw(format.raw()), Some(*format));
        }
        assert_eq!(TextureFormat::from_raw(116), None);
        assert_eq!(TextureFormat::from_raw(28), Some(TextureFormat::R8G8B8A8Unorm));
        assert_eq!(TextureFormat::V408.raw(), 132);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(TextureFormat::R32G32B32A32Float.size_in_bytes(), 16);
        assert_eq!(TextureFormat::R32G32B32Float.size_in_bytes(), 12);
        assert_eq!(TextureFormat::R16G16B16A16Unorm.size_in_bytes(), 8);
        assert_eq!(TextureFormat::R8G8B8A8Unorm.size_in_bytes(), 4);
        assert_eq!(TextureFormat::R16Float.size_in_bytes(), 2);
        assert_eq!(TextureFormat::R8Unorm.size_in_bytes(), 1);
        assert_eq!(TextureFormat::Bc1Unorm.size_in_bytes(), 0);
        assert_eq!(TextureFormat::Unknown.size_in_bytes(), 0);
    }

    #[test]
    fn test_typeless_groups_define_copy_compatibility() {
        assert!(TextureFormat::R32G32B32Float.is_copy_compatible(TextureFormat::R32G32B32Uint));
        assert!(TextureFormat::R8G8B8A8Unorm.is_copy_compatible(TextureFormat::R8G8B8A8Typeless));
        assert!(TextureFormat::D32Float.is_copy_compatible(TextureFormat::R32Float));
        assert!(!TextureFormat::R8G8B8A8Unorm.is_copy_compatible(TextureFormat::B8G8R8A8Unorm));
        assert!(!TextureFormat::R32Float.is_copy_compatible(TextureFormat::R32G32Float));
        assert!(TextureFormat::R11G11B10Float.is_copy_compatible(TextureFormat::R11G11B10Float));
        assert!(!TextureFormat::Unknown.is_copy_compatible(TextureFormat::Unknown));
    }

    #[test]
    fn test_linear_and_view_support() {
        assert!(TextureFormat::R8G8B8A8Unorm.is_linear());
        assert!(TextureFormat::R8G8B8A8Unorm.supports_unordered_access());
        assert!(TextureFormat::R8G8B8A8Typeless.is_linear());
        assert!(!TextureFormat::R8G8B8A8Typeless.supports_unordered_access());
        assert!(!TextureFormat::D32Float.supports_unordered_access());
        assert!(!TextureFormat::Bc7Unorm.is_linear());
        assert!(!TextureFormat::Nv12.is_linear());
        assert!(!TextureFormat::R1Unorm.is_linear());
        assert!(TextureFormat::B4G4R4A4Unorm.is_linear());
    }

    #[test]
    fn test_bgra_family() {
        assert!(TextureFormat::B8G8R8A8Unorm.requires_bgra_support());
        assert!(TextureFormat::B8G8R8X8UnormSrgb.requires_bgra_support());
        assert!(!TextureFormat::R8G8B8A8Unorm.requires_bgra_support());
    }

    #[test]
    fn test_pixel_layout_mapping() {
        assert_eq!(
            TextureFormat::R8G8B8A8Unorm.pixel_layout(),
            Some(PixelLayout::Rgba8)
        );
        assert_eq!(
            TextureFormat::R16G16B16A16Unorm.pixel_layout(),
            Some(PixelLayout::Rgba16)
        );
        assert_eq!(TextureFormat::R32Float.pixel_layout(), None);
        for layout in [PixelLayout::Rgba8, PixelLayout::Rgba16] {
            assert_eq!(layout.texture_format().pixel_layout(), Some(layout));
            assert_eq!(
                layout.texture_format().bits_per_pixel(),
                layout.bits_per_pixel()
            );
        }
    }
}
