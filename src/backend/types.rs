//! Descriptors and plain data shared by every backend.

use bitflags::bitflags;

use crate::backend::traits::{KernelId, ResourceId, ViewId};
use crate::error::{ComputeError, ComputeResult};
use crate::format::TextureFormat;

/// Buffer byte sizes must be a multiple of this.
pub const MIN_BUFFER_ALIGNMENT: u64 = 16;
/// Largest element stride of a structured buffer.
pub const MAX_STRUCTURE_STRIDE: u32 = 2048;
/// Largest constant buffer, in bytes.
pub const MAX_CONSTANT_BUFFER_SIZE: u64 = 4096 * 16;
pub const MAX_TEXTURE_DIMENSION: u32 = 16384;
pub const MAX_TEXTURE_ARRAY_SLICES: u32 = 2048;

bitflags! {
    /// How a resource may be bound to the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        const CONSTANT_BUFFER = 0x4;
        const SHADER_RESOURCE = 0x8;
        const UNORDERED_ACCESS = 0x80;
    }
}

bitflags! {
    /// CPU access granted to a staging resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CpuAccessFlags: u32 {
        const WRITE = 0x10000;
        const READ = 0x20000;
    }
}

/// Usage class of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceUsage {
    /// GPU resident; updatable from the CPU only through copies and updates.
    #[default]
    Default,
    /// CPU visible mirror used for map/unmap.
    Staging,
}

/// Access requested when mapping a staging mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuAccessMode {
    Read = 1,
    Write = 2,
    ReadWrite = 3,
}

impl CpuAccessMode {
    pub fn reads(self) -> bool {
        matches!(self, CpuAccessMode::Read | CpuAccessMode::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, CpuAccessMode::Write | CpuAccessMode::ReadWrite)
    }
}

/// Shape of an allocation as the native API sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    /// Linear buffer. `stride` is zero for raw and constant buffers.
    Buffer { size: u64, stride: u32 },
    /// 2D texture with `array_size` slices and a single mip level.
    Texture2D {
        width: u32,
        height: u32,
        array_size: u32,
        format: TextureFormat,
    },
}

impl ResourceDimension {
    /// Size of the resource contents with tightly packed rows.
    pub fn byte_size(&self) -> u64 {
        match *self {
            ResourceDimension::Buffer { size, .. } => size,
            ResourceDimension::Texture2D {
                width,
                height,
                array_size,
                format,
            } => width as u64 * height as u64 * array_size as u64 * format.size_in_bytes() as u64,
        }
    }

    pub fn subresource_count(&self) -> u32 {
        match *self {
            ResourceDimension::Buffer { .. } => 1,
            ResourceDimension::Texture2D { array_size, .. } => array_size,
        }
    }

    pub fn format(&self) -> Option<TextureFormat> {
        match *self {
            ResourceDimension::Buffer { .. } => None,
            ResourceDimension::Texture2D { format, .. } => Some(format),
        }
    }

    /// Same extent, and for textures a copy compatible format.
    pub fn is_copy_compatible(&self, other: &ResourceDimension) -> bool {
        match (*self, *other) {
            (
                ResourceDimension::Buffer { size: a, .. },
                ResourceDimension::Buffer { size: b, .. },
            ) => a == b,
            (
                ResourceDimension::Texture2D {
                    width: w0,
                    height: h0,
                    array_size: s0,
                    format: f0,
                },
                ResourceDimension::Texture2D {
                    width: w1,
                    height: h1,
                    array_size: s1,
                    format: f1,
                },
            ) => w0 == w1 && h0 == h1 && s0 == s1 && f0.is_copy_compatible(f1),
            _ => false,
        }
    }
}

/// Full creation description of an allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub label: Option<String>,
    pub dimension: ResourceDimension,
    pub usage: ResourceUsage,
    pub bind: BindFlags,
    pub cpu_access: CpuAccessFlags,
}

impl ResourceDescriptor {
    pub fn new(dimension: ResourceDimension) -> Self {
        Self {
            label: None,
            dimension,
            usage: ResourceUsage::Default,
            bind: BindFlags::empty(),
            cpu_access: CpuAccessFlags::empty(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_bind_flags(mut self, bind: BindFlags) -> Self {
        self.bind = bind;
        self
    }

    /// Description of the CPU visible mirror of this resource.
    pub fn staging_mirror(&self) -> Self {
        Self {
            label: self.label.as_ref().map(|label| format!("{label} (staging)")),
            dimension: self.dimension,
            usage: ResourceUsage::Staging,
            bind: BindFlags::empty(),
            cpu_access: CpuAccessFlags::READ | CpuAccessFlags::WRITE,
        }
    }

    /// Check the description against the native API's creation rules.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::ResourceCreationFailed`] naming the violated rule.
    pub fn validate(&self) -> ComputeResult<()> {
        let fail = |msg: String| Err(ComputeError::ResourceCreationFailed(msg));

        match self.usage {
            ResourceUsage::Staging => {
                if !self.bind.is_empty() {
                    return fail("staging resources cannot be bound to the pipeline".into());
                }
                if self.cpu_access.is_empty() {
                    return fail("staging resources require CPU access flags".into());
                }
            }
            ResourceUsage::Default => {
                if !self.cpu_access.is_empty() {
                    return fail("default usage resources cannot be CPU accessible".into());
                }
            }
        }

        match self.dimension {
            ResourceDimension::Buffer { size, stride } => {
                if size == 0 {
                    return fail("buffer size cannot be zero".into());
                }
                if size % MIN_BUFFER_ALIGNMENT != 0 {
                    return fail(format!(
                        "buffer size {size} is not a multiple of {MIN_BUFFER_ALIGNMENT} bytes"
                    ));
                }
                if self.bind.contains(BindFlags::CONSTANT_BUFFER) {
                    if self.bind != BindFlags::CONSTANT_BUFFER {
                        return fail("constant buffers cannot take other bind flags".into());
                    }
                    if size > MAX_CONSTANT_BUFFER_SIZE {
                        return fail(format!(
                            "constant buffer size {size} exceeds {MAX_CONSTANT_BUFFER_SIZE} bytes"
                        ));
                    }
                }
                if stride > 0 {
                    if stride % 4 != 0 || stride > MAX_STRUCTURE_STRIDE {
                        return fail(format!(
                            "structure stride {stride} must be a multiple of 4 no larger than {MAX_STRUCTURE_STRIDE}"
                        ));
                    }
                    if size % stride as u64 != 0 {
                        return fail(format!(
                            "buffer size {size} is not a whole number of {stride}-byte elements"
                        ));
                    }
                }
            }
            ResourceDimension::Texture2D {
                width,
                height,
                array_size,
                format,
            } => {
                if width == 0 || height == 0 {
                    return fail(format!("texture extent {width}x{height} cannot be empty"));
                }
                if width > MAX_TEXTURE_DIMENSION || height > MAX_TEXTURE_DIMENSION {
                    return fail(format!(
                        "texture extent {width}x{height} exceeds {MAX_TEXTURE_DIMENSION}"
                    ));
                }
                if array_size == 0 || array_size > MAX_TEXTURE_ARRAY_SLICES {
                    return fail(format!(
                        "texture array size {array_size} must be in 1..={MAX_TEXTURE_ARRAY_SLICES}"
                    ));
                }
                if !format.is_linear() {
                    return fail(format!("format {format} has no linear texel layout"));
                }
                if self.bind.contains(BindFlags::CONSTANT_BUFFER) {
                    return fail("textures cannot be bound as constant buffers".into());
                }
                if self.bind.contains(BindFlags::UNORDERED_ACCESS)
                    && (format.is_depth() || !format.is_linear())
                {
                    return fail(format!("format {format} cannot back a read/write view"));
                }
            }
        }

        Ok(())
    }
}

/// Read/write kernel view description, one per resource shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewDescriptor {
    /// Structured buffer view with an append/consume counter.
    Buffer {
        first_element: u32,
        element_count: u32,
        counter: bool,
    },
    Texture2D {
        format: TextureFormat,
        mip_slice: u32,
    },
    Texture2DArray {
        format: TextureFormat,
        mip_slice: u32,
        first_slice: u32,
        slice_count: u32,
    },
}

impl ViewDescriptor {
    /// Check the view against the resource it is created over.
    pub fn validate_against(&self, resource: &ResourceDescriptor) -> ComputeResult<()> {
        if !resource.bind.contains(BindFlags::UNORDERED_ACCESS) {
            return Err(ComputeError::IncompatibleResource(
                "resource was not created with read/write view binding".into(),
            ));
        }
        match (*self, resource.dimension) {
            (
                ViewDescriptor::Buffer {
                    first_element,
                    element_count,
                    ..
                },
                ResourceDimension::Buffer { size, stride },
            ) => {
                if stride == 0 {
                    return Err(ComputeError::IncompatibleResource(
                        "buffer views require a structured buffer".into(),
                    ));
                }
                let end = first_element as u64 + element_count as u64;
                if end * stride as u64 > size {
                    return Err(ComputeError::OutOfRange(format!(
                        "view elements {first_element}..{end} exceed the buffer"
                    )));
                }
                Ok(())
            }
            (
                ViewDescriptor::Texture2D { format, mip_slice },
                ResourceDimension::Texture2D {
                    array_size,
                    format: resource_format,
                    ..
                },
            ) => {
                if array_size != 1 {
                    return Err(ComputeError::IncompatibleResource(
                        "2D views require a single slice texture".into(),
                    ));
                }
                check_view_format(format, resource_format, mip_slice)
            }
            (
                ViewDescriptor::Texture2DArray {
                    format,
                    mip_slice,
                    first_slice,
                    slice_count,
                },
                ResourceDimension::Texture2D {
                    array_size,
                    format: resource_format,
                    ..
                },
            ) => {
                if first_slice as u64 + slice_count as u64 > array_size as u64 {
                    return Err(ComputeError::OutOfRange(format!(
                        "view slices {first_slice}..{} exceed {array_size} slices",
                        first_slice as u64 + slice_count as u64
                    )));
                }
                check_view_format(format, resource_format, mip_slice)
            }
            _ => Err(ComputeError::IncompatibleResource(
                "view dimension does not match the resource".into(),
            )),
        }
    }
}

fn check_view_format(
    view: TextureFormat,
    resource: TextureFormat,
    mip_slice: u32,
) -> ComputeResult<()> {
    if mip_slice != 0 {
        return Err(ComputeError::OutOfRange(format!(
            "mip slice {mip_slice} does not exist"
        )));
    }
    if !view.supports_unordered_access() {
        return Err(ComputeError::IncompatibleResource(format!(
            "format {view} cannot be used for a read/write view"
        )));
    }
    if !view.is_copy_compatible(resource) {
        return Err(ComputeError::IncompatibleResource(format!(
            "view format {view} is not in the family of {resource}"
        )));
    }
    Ok(())
}

/// Rectangle of texels within one subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CopyRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CopyRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Region covering a whole `width` x `height` subresource.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Whether the region lies inside a `width` x `height` extent.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        matches!(self.x.checked_add(self.width), Some(right) if right <= width)
            && matches!(self.y.checked_add(self.height), Some(bottom) if bottom <= height)
    }
}

/// Byte layout of a resource in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceLayout {
    /// Meaningful bytes per row.
    pub row_bytes: usize,
    /// Rows per slice.
    pub rows: u32,
    /// Slices (array layers).
    pub slices: u32,
    /// Distance between the starts of consecutive rows.
    pub row_pitch: usize,
    /// Distance between the starts of consecutive slices.
    pub slice_pitch: usize,
    /// Bytes per texel or element, used to turn x offsets into byte offsets.
    pub texel_size: usize,
}

impl SubresourceLayout {
    /// Layout with rows padded up to `row_alignment` bytes.
    pub fn for_dimension(dimension: &ResourceDimension, row_alignment: usize) -> Self {
        match *dimension {
            ResourceDimension::Buffer { size, .. } => {
                let row_pitch = align_up(size as usize, row_alignment);
                Self {
                    row_bytes: size as usize,
                    rows: 1,
                    slices: 1,
                    row_pitch,
                    slice_pitch: row_pitch,
                    texel_size: 1,
                }
            }
            ResourceDimension::Texture2D {
                width,
                height,
                array_size,
                format,
            } => {
                let texel_size = format.size_in_bytes() as usize;
                let row_bytes = width as usize * texel_size;
                let row_pitch = align_up(row_bytes, row_alignment);
                Self {
                    row_bytes,
                    rows: height,
                    slices: array_size,
                    row_pitch,
                    slice_pitch: row_pitch * height as usize,
                    texel_size,
                }
            }
        }
    }

    /// Layout with no row padding, as host data is usually supplied.
    pub fn tight(dimension: &ResourceDimension) -> Self {
        Self::for_dimension(dimension, 1)
    }

    pub fn total_size(&self) -> usize {
        self.slice_pitch * self.slices as usize
    }

    pub fn offset(&self, slice: u32, row: u32, x: u32) -> usize {
        slice as usize * self.slice_pitch + row as usize * self.row_pitch + x as usize * self.texel_size
    }

    /// The same layout restricted to one slice.
    pub fn single_slice(&self) -> Self {
        Self { slices: 1, ..*self }
    }
}

/// Round `value` up to a multiple of `alignment`.
pub fn align_up(value: usize, alignment: usize) -> usize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// One side of a pitched copy: where the first row starts and how rows and slices advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pitched {
    pub offset: usize,
    pub row_pitch: usize,
    pub slice_pitch: usize,
}

/// Copy `rows` x `slices` rows of `row_bytes` bytes between two pitched byte ranges.
///
/// # Errors
///
/// Returns [`ComputeError::OutOfRange`] if either side would be addressed past its end.
pub fn copy_pitched(
    src: &[u8],
    src_layout: Pitched,
    dst: &mut [u8],
    dst_layout: Pitched,
    row_bytes: usize,
    rows: u32,
    slices: u32,
) -> ComputeResult<()> {
    for slice in 0..slices as usize {
        for row in 0..rows as usize {
            let from = src_layout.offset + slice * src_layout.slice_pitch + row * src_layout.row_pitch;
            let to = dst_layout.offset + slice * dst_layout.slice_pitch + row * dst_layout.row_pitch;
            let source = src.get(from..from + row_bytes).ok_or_else(|| {
                ComputeError::OutOfRange(format!(
                    "source row {row} of slice {slice} lies outside {} mapped bytes",
                    src.len()
                ))
            })?;
            let dest_len = dst.len();
            let dest = dst.get_mut(to..to + row_bytes).ok_or_else(|| {
                ComputeError::OutOfRange(format!(
                    "destination row {row} of slice {slice} lies outside {dest_len} mapped bytes"
                ))
            })?;
            dest.copy_from_slice(source);
        }
    }
    Ok(())
}

/// CPU view of a mapped staging mirror, valid only inside the access callback.
#[derive(Debug)]
pub struct MappedSubresource<'a> {
    data: &'a mut [u8],
    row_pitch: usize,
    slice_pitch: usize,
    mode: CpuAccessMode,
}

impl<'a> MappedSubresource<'a> {
    pub fn new(data: &'a mut [u8], row_pitch: usize, slice_pitch: usize, mode: CpuAccessMode) -> Self {
        Self {
            data,
            row_pitch,
            slice_pitch,
            mode,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.data
    }

    /// Mutable mapped bytes. Writes are only copied back when the mode includes write.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        debug_assert!(
            self.mode.writes(),
            "mapped region was opened read-only; writes would be discarded"
        );
        self.data
    }

    /// Distance in bytes between consecutive rows. Always use this rather than
    /// the logical width.
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    pub fn slice_pitch(&self) -> usize {
        self.slice_pitch
    }

    pub fn mode(&self) -> CpuAccessMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pitched(&self) -> Pitched {
        Pitched {
            offset: 0,
            row_pitch: self.row_pitch,
            slice_pitch: self.slice_pitch,
        }
    }

    /// Bytes of row `y` of the first slice, `row_bytes` long.
    pub fn row(&self, y: usize, row_bytes: usize) -> Option<&[u8]> {
        let start = y.checked_mul(self.row_pitch)?;
        self.data.get(start..start.checked_add(row_bytes)?)
    }

    pub fn row_mut(&mut self, y: usize, row_bytes: usize) -> Option<&mut [u8]> {
        let start = y.checked_mul(self.row_pitch)?;
        self.data.get_mut(start..start.checked_add(row_bytes)?)
    }
}

/// Host data for one subresource at creation or update time.
#[derive(Debug, Clone, Copy)]
pub struct SubresourceData<'a> {
    pub bytes: &'a [u8],
    pub row_pitch: usize,
    pub slice_pitch: usize,
}

impl<'a> SubresourceData<'a> {
    /// Tightly packed data for a resource of the given dimension.
    pub fn tight(bytes: &'a [u8], dimension: &ResourceDimension) -> Self {
        let layout = SubresourceLayout::tight(dimension);
        Self {
            bytes,
            row_pitch: layout.row_pitch,
            slice_pitch: layout.slice_pitch,
        }
    }
}

/// A dispatch with every binding spelled out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDescriptor {
    pub kernel: KernelId,
    pub views: Vec<(u32, ViewId)>,
    pub constant_buffers: Vec<(u32, ResourceId)>,
    pub group_count: [u32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// GPU tick counter value at the point the query ends.
    Timestamp,
    /// Brackets timestamp queries; reports the tick frequency and whether it changed.
    TimestampDisjoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryData {
    Timestamp(u64),
    TimestampDisjoint { frequency: u64, disjoint: bool },
}

/// Information about a compute adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    /// Adapter name.
    pub name: String,
    /// Adapter vendor.
    pub vendor: String,
    /// Device type (discrete, integrated, etc.).
    pub device_type: AdapterType,
}

/// Type of compute adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterType {
    Discrete,
    Integrated,
    Software,
    Unknown,
}
