//! wgpu backend implementation
//!
//! One wgpu device and queue per [`WgpuDevice`]. Copies and dispatches are
//! recorded into a pending command encoder, which is submitted on `flush`,
//! before every queue write and before a staging mirror is read back, so
//! commands reach the GPU in issue order.
//!
//! Staging mirrors are `MAP_READ` readback buffers with rows aligned to
//! [`wgpu::COPY_BYTES_PER_ROW_ALIGNMENT`] plus a host shadow copy. Uploads
//! from a staging mirror go through queue writes of the shadow.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::mpsc;

use parking_lot::Mutex;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config::DeviceCreationFlags;
use crate::error::{ComputeError, ComputeResult};
use crate::format::TextureFormat;
use crate::kernel::KernelSource;

/// Row pitch of every staging mirror.
pub const ROW_PITCH_ALIGNMENT: usize = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;

const MAX_DISPATCH_GROUPS: u32 = 65535;

fn instance() -> wgpu::Instance {
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

fn adapter_info(adapter: &wgpu::Adapter) -> AdapterInfo {
    let info = adapter.get_info();
    AdapterInfo {
        name: info.name,
        vendor: format!("{:#06x} ({:?})", info.vendor, info.backend),
        device_type: match info.device_type {
            wgpu::DeviceType::DiscreteGpu => AdapterType::Discrete,
            wgpu::DeviceType::IntegratedGpu => AdapterType::Integrated,
            wgpu::DeviceType::Cpu => AdapterType::Software,
            _ => AdapterType::Unknown,
        },
    }
}

/// Adapters visible to wgpu, in enumeration order.
pub fn adapters() -> Vec<AdapterInfo> {
    instance()
        .enumerate_adapters(wgpu::Backends::all())
        .iter()
        .map(adapter_info)
        .collect()
}

fn convert_texture_format(format: TextureFormat) -> ComputeResult<wgpu::TextureFormat> {
    use wgpu::TextureFormat as W;
    let converted = match format {
        TextureFormat::R8G8B8A8Unorm => W::Rgba8Unorm,
        TextureFormat::R8G8B8A8UnormSrgb => W::Rgba8UnormSrgb,
        TextureFormat::R8G8B8A8Uint => W::Rgba8Uint,
        TextureFormat::R8G8B8A8Snorm => W::Rgba8Snorm,
        TextureFormat::R8G8B8A8Sint => W::Rgba8Sint,
        TextureFormat::B8G8R8A8Unorm => W::Bgra8Unorm,
        TextureFormat::B8G8R8A8UnormSrgb => W::Bgra8UnormSrgb,
        TextureFormat::R16G16B16A16Float => W::Rgba16Float,
        TextureFormat::R16G16B16A16Unorm => W::Rgba16Unorm,
        TextureFormat::R16G16B16A16Uint => W::Rgba16Uint,
        TextureFormat::R16G16B16A16Snorm => W::Rgba16Snorm,
        TextureFormat::R16G16B16A16Sint => W::Rgba16Sint,
        TextureFormat::R32G32B32A32Float => W::Rgba32Float,
        TextureFormat::R32G32B32A32Uint => W::Rgba32Uint,
        TextureFormat::R32G32B32A32Sint => W::Rgba32Sint,
        TextureFormat::R32G32Float => W::Rg32Float,
        TextureFormat::R32G32Uint => W::Rg32Uint,
        TextureFormat::R32G32Sint => W::Rg32Sint,
        TextureFormat::R10G10B10A2Unorm => W::Rgb10a2Unorm,
        TextureFormat::R16G16Float => W::Rg16Float,
        TextureFormat::R16G16Unorm => W::Rg16Unorm,
        TextureFormat::R16G16Uint => W::Rg16Uint,
        TextureFormat::R16G16Snorm => W::Rg16Snorm,
        TextureFormat::R16G16Sint => W::Rg16Sint,
        TextureFormat::R32Float => W::R32Float,
        TextureFormat::R32Uint => W::R32Uint,
        TextureFormat::R32Sint => W::R32Sint,
        TextureFormat::R8G8Unorm => W::Rg8Unorm,
        TextureFormat::R8G8Uint => W::Rg8Uint,
        TextureFormat::R8G8Snorm => W::Rg8Snorm,
        TextureFormat::R8G8Sint => W::Rg8Sint,
        TextureFormat::R16Float => W::R16Float,
        TextureFormat::R16Unorm => W::R16Unorm,
        TextureFormat::R16Uint => W::R16Uint,
        TextureFormat::R16Snorm => W::R16Snorm,
        TextureFormat::R16Sint => W::R16Sint,
        TextureFormat::R8Unorm => W::R8Unorm,
        TextureFormat::R8Uint => W::R8Uint,
        TextureFormat::R8Snorm => W::R8Snorm,
        TextureFormat::R8Sint => W::R8Sint,
        TextureFormat::D32Float => W::Depth32Float,
        TextureFormat::D16Unorm => W::Depth16Unorm,
        other => {
            return Err(ComputeError::FeatureNotSupported(format!(
                "format {other} has no wgpu equivalent"
            )))
        }
    };
    Ok(converted)
}

fn texture_extent(dimension: &ResourceDimension) -> wgpu::Extent3d {
    match *dimension {
        ResourceDimension::Texture2D {
            width,
            height,
            array_size,
            ..
        } => wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: array_size,
        },
        ResourceDimension::Buffer { size, .. } => wgpu::Extent3d {
            width: size as u32,
            height: 1,
            depth_or_array_layers: 1,
        },
    }
}

fn texture_at(texture: &wgpu::Texture, x: u32, y: u32, slice: u32) -> wgpu::ImageCopyTexture<'_> {
    wgpu::ImageCopyTexture {
        texture,
        mip_level: 0,
        origin: wgpu::Origin3d { x, y, z: slice },
        aspect: wgpu::TextureAspect::All,
    }
}

fn data_layout(row_pitch: usize, rows: u32) -> wgpu::ImageDataLayout {
    wgpu::ImageDataLayout {
        offset: 0,
        bytes_per_row: Some(row_pitch as u32),
        rows_per_image: Some(rows),
    }
}

enum Allocation {
    Buffer(wgpu::Buffer),
    Texture(wgpu::Texture),
    Staging {
        readback: wgpu::Buffer,
        shadow: Vec<u8>,
        layout: SubresourceLayout,
        /// The readback buffer holds newer data than the shadow.
        stale: bool,
    },
}

struct ResourceEntry {
    descriptor: ResourceDescriptor,
    allocation: Allocation,
}

enum ViewEntry {
    Buffer {
        resource: u64,
        offset: u64,
        size: u64,
    },
    Texture {
        view: wgpu::TextureView,
        format: wgpu::TextureFormat,
        dimension: wgpu::TextureViewDimension,
    },
}

struct KernelEntry {
    module: wgpu::ShaderModule,
    entry_point: String,
}

#[derive(Default)]
struct State {
    next_id: u64,
    resources: HashMap<u64, ResourceEntry>,
    views: HashMap<u64, ViewEntry>,
    kernels: HashMap<u64, KernelEntry>,
    encoder: Option<wgpu::CommandEncoder>,
}

impl State {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn resource(&self, resource: ResourceId) -> ComputeResult<&ResourceEntry> {
        self.resources.get(&resource.0).ok_or_else(|| unknown_resource(resource))
    }
}

fn unknown_resource(resource: ResourceId) -> ComputeError {
    ComputeError::ArgumentInvalid(format!("unknown resource {}", resource.0))
}

/// Host shadow taken out of the device tables while a mapping callback runs.
/// Dropping it puts the shadow back, also when the callback unwinds.
struct ShadowLease<'a> {
    state: &'a Mutex<State>,
    staging: u64,
    shadow: Vec<u8>,
}

impl Drop for ShadowLease<'_> {
    fn drop(&mut self) {
        if let Some(ResourceEntry {
            allocation: Allocation::Staging { shadow, .. },
            ..
        }) = self.state.lock().resources.get_mut(&self.staging)
        {
            *shadow = std::mem::take(&mut self.shadow);
        }
    }
}

/// A wgpu device with its queue.
pub struct WgpuDevice {
    id: NativeDeviceId,
    adapter: AdapterInfo,
    flags: DeviceCreationFlags,
    device: wgpu::Device,
    queue: wgpu::Queue,
    state: Mutex<State>,
}

impl WgpuDevice {
    /// Open adapter `adapter_index` of [`adapters`].
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceCreationFailed`] if the adapter is gone or
    /// refuses to create a device.
    pub fn new(
        adapter_index: usize,
        adapter: AdapterInfo,
        flags: DeviceCreationFlags,
    ) -> ComputeResult<Self> {
        let native = instance()
            .enumerate_adapters(wgpu::Backends::all())
            .into_iter()
            .nth(adapter_index)
            .ok_or_else(|| {
                ComputeError::DeviceCreationFailed(format!(
                    "wgpu adapter {adapter_index} disappeared"
                ))
            })?;

        let required_features = native.features() & wgpu::Features::TEXTURE_FORMAT_16BIT_NORM;
        let (device, queue) = pollster::block_on(native.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gpu-compute device"),
                required_features,
                required_limits: native.limits(),
                ..Default::default()
            },
            None,
        ))
        .map_err(|e| ComputeError::DeviceCreationFailed(e.to_string()))?;

        device.on_uncaptured_error(Box::new(|error| {
            log::error!("wgpu: {error}");
        }));

        let id = super::next_native_device_id();
        log::info!(
            "WgpuDevice {}: created on {} ({})",
            id.0,
            adapter.name,
            adapter.vendor
        );
        Ok(Self {
            id,
            adapter,
            flags,
            device,
            queue,
            state: Mutex::new(State::default()),
        })
    }

    /// Run `f` inside a validation error scope.
    fn validated<R>(
        &self,
        failure: fn(String) -> ComputeError,
        f: impl FnOnce() -> R,
    ) -> ComputeResult<R> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(error) => Err(failure(error.to_string())),
            None => Ok(value),
        }
    }

    fn recording<'a>(
        &self,
        encoder: &'a mut Option<wgpu::CommandEncoder>,
    ) -> &'a mut wgpu::CommandEncoder {
        encoder.get_or_insert_with(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("gpu-compute commands"),
                })
        })
    }

    fn submit(&self, encoder: &mut Option<wgpu::CommandEncoder>) {
        if let Some(encoder) = encoder.take() {
            if self.flags.wants_diagnostics() {
                log::debug!("WgpuDevice {}: submitting commands", self.id.0);
            }
            self.queue.submit(Some(encoder.finish()));
        }
    }

    /// Bring the host shadow of `staging` up to date with its readback buffer.
    fn refresh_staging(&self, state: &mut State, staging: u64) -> ComputeResult<()> {
        let stale = matches!(
            state.resources.get(&staging),
            Some(ResourceEntry {
                allocation: Allocation::Staging { stale: true, .. },
                ..
            })
        );
        if !stale {
            return Ok(());
        }
        self.submit(&mut state.encoder);

        let Some(ResourceEntry {
            allocation:
                Allocation::Staging {
                    readback,
                    shadow,
                    stale,
                    ..
                },
            ..
        }) = state.resources.get_mut(&staging)
        else {
            return Err(ComputeError::Internal(format!(
                "staging resource {staging} vanished"
            )));
        };

        let slice = readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ComputeError::Internal(format!("readback failed: {e}"))),
            Err(_) => return Err(ComputeError::Internal("readback was never mapped".into())),
        }
        shadow.copy_from_slice(&slice.get_mapped_range());
        readback.unmap();
        *stale = false;
        Ok(())
    }

    fn copy_whole(
        &self,
        state: &mut State,
        source: ResourceId,
        target: &mut ResourceEntry,
    ) -> ComputeResult<()> {
        let State {
            resources, encoder, ..
        } = state;
        let source = resources.get(&source.0).ok_or_else(|| unknown_resource(source))?;
        let dimension = target.descriptor.dimension;
        if !source.descriptor.dimension.is_copy_compatible(&dimension) {
            return Err(ComputeError::IncompatibleResource(format!(
                "cannot copy {:?} into {dimension:?}",
                source.descriptor.dimension
            )));
        }
        let extent = texture_extent(&dimension);
        let size = dimension.byte_size();

        match (&source.allocation, &mut target.allocation) {
            (Allocation::Buffer(from), Allocation::Buffer(to)) => {
                self.recording(encoder).copy_buffer_to_buffer(from, 0, to, 0, size);
            }
            (Allocation::Texture(from), Allocation::Texture(to)) => {
                if from.format().remove_srgb_suffix() != to.format().remove_srgb_suffix() {
                    return Err(ComputeError::FeatureNotSupported(format!(
                        "wgpu cannot copy {:?} into {:?}",
                        from.format(),
                        to.format()
                    )));
                }
                self.recording(encoder).copy_texture_to_texture(
                    texture_at(from, 0, 0, 0),
                    texture_at(to, 0, 0, 0),
                    extent,
                );
            }
            (Allocation::Buffer(from), Allocation::Staging { readback, stale, .. }) => {
                self.recording(encoder)
                    .copy_buffer_to_buffer(from, 0, readback, 0, size);
                *stale = true;
            }
            (
                Allocation::Texture(from),
                Allocation::Staging {
                    readback,
                    layout,
                    stale,
                    ..
                },
            ) => {
                self.recording(encoder).copy_texture_to_buffer(
                    texture_at(from, 0, 0, 0),
                    wgpu::ImageCopyBuffer {
                        buffer: readback,
                        layout: data_layout(layout.row_pitch, layout.rows),
                    },
                    extent,
                );
                *stale = true;
            }
            (Allocation::Staging { shadow, .. }, Allocation::Buffer(to)) => {
                self.submit(encoder);
                self.queue.write_buffer(to, 0, &shadow[..size as usize]);
            }
            (Allocation::Staging { shadow, layout, .. }, Allocation::Texture(to)) => {
                self.submit(encoder);
                self.queue.write_texture(
                    texture_at(to, 0, 0, 0),
                    shadow,
                    data_layout(layout.row_pitch, layout.rows),
                    extent,
                );
            }
            (
                Allocation::Staging { shadow: from, .. },
                Allocation::Staging {
                    shadow: to, stale, ..
                },
            ) => {
                to.copy_from_slice(from);
                *stale = false;
            }
            _ => {
                return Err(ComputeError::IncompatibleResource(
                    "buffers and textures cannot be copied into each other".into(),
                ))
            }
        }
        Ok(())
    }

    fn create_allocation(
        &self,
        descriptor: &ResourceDescriptor,
        initial_data: &[SubresourceData<'_>],
    ) -> ComputeResult<Allocation> {
        let label = descriptor.label.as_deref();
        match (descriptor.usage, descriptor.dimension) {
            (ResourceUsage::Staging, dimension) => {
                let layout = SubresourceLayout::for_dimension(&dimension, ROW_PITCH_ALIGNMENT);
                let mut shadow = vec![0u8; layout.total_size()];
                for (slice, data) in initial_data.iter().enumerate() {
                    copy_pitched(
                        data.bytes,
                        Pitched {
                            offset: 0,
                            row_pitch: data.row_pitch,
                            slice_pitch: data.slice_pitch,
                        },
                        &mut shadow,
                        Pitched {
                            offset: slice * layout.slice_pitch,
                            row_pitch: layout.row_pitch,
                            slice_pitch: layout.slice_pitch,
                        },
                        layout.row_bytes,
                        layout.rows,
                        1,
                    )?;
                }
                let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label,
                    size: layout.total_size() as u64,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                Ok(Allocation::Staging {
                    readback,
                    shadow,
                    layout,
                    stale: false,
                })
            }
            (ResourceUsage::Default, ResourceDimension::Buffer { size, .. }) => {
                let usage = if descriptor.bind.contains(BindFlags::CONSTANT_BUFFER) {
                    wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST
                } else {
                    wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC
                        | wgpu::BufferUsages::COPY_DST
                };
                let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label,
                    size,
                    usage,
                    mapped_at_creation: false,
                });
                if let Some(data) = initial_data.first() {
                    let bytes = data.bytes.get(..size as usize).ok_or_else(|| {
                        ComputeError::ArgumentInvalid(format!(
                            "{} bytes supplied for a {size}-byte buffer",
                            data.bytes.len()
                        ))
                    })?;
                    self.queue.write_buffer(&buffer, 0, bytes);
                }
                Ok(Allocation::Buffer(buffer))
            }
            (
                ResourceUsage::Default,
                ResourceDimension::Texture2D {
                    width,
                    height,
                    format,
                    ..
                },
            ) => {
                let mut usage = wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::TEXTURE_BINDING;
                if descriptor.bind.contains(BindFlags::UNORDERED_ACCESS) {
                    usage |= wgpu::TextureUsages::STORAGE_BINDING;
                }
                let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                    label,
                    size: texture_extent(&descriptor.dimension),
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: convert_texture_format(format)?,
                    usage,
                    view_formats: &[],
                });
                for (slice, data) in initial_data.iter().enumerate() {
                    self.queue.write_texture(
                        texture_at(&texture, 0, 0, slice as u32),
                        data.bytes,
                        data_layout(data.row_pitch, height),
                        wgpu::Extent3d {
                            width,
                            height,
                            depth_or_array_layers: 1,
                        },
                    );
                }
                Ok(Allocation::Texture(texture))
            }
        }
    }
}

impl fmt::Debug for WgpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuDevice")
            .field("id", &self.id)
            .field("adapter", &self.adapter.name)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

impl Drop for WgpuDevice {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        self.submit(&mut state.encoder);
        let _ = self.device.poll(wgpu::Maintain::Wait);
        log::debug!("WgpuDevice {}: destroyed", self.id.0);
    }
}

impl DeviceBackend for WgpuDevice {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn native_id(&self) -> NativeDeviceId {
        self.id
    }

    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn row_pitch_alignment(&self) -> usize {
        ROW_PITCH_ALIGNMENT
    }

    fn create_resource(
        &self,
        descriptor: &ResourceDescriptor,
        initial_data: &[SubresourceData<'_>],
    ) -> ComputeResult<ResourceId> {
        descriptor.validate()?;
        let subresources = descriptor.dimension.subresource_count() as usize;
        if !initial_data.is_empty() && initial_data.len() != subresources {
            return Err(ComputeError::ArgumentInvalid(format!(
                "{} initial data blocks for {subresources} subresources",
                initial_data.len()
            )));
        }

        let mut state = self.state.lock();
        self.submit(&mut state.encoder);
        let allocation = self
            .validated(ComputeError::ResourceCreationFailed, || {
                self.create_allocation(descriptor, initial_data)
            })
            .and_then(|allocation| allocation)?;

        let id = state.allocate_id();
        log::trace!(
            "WgpuDevice {}: creating resource {id} {:?} ({:?})",
            self.id.0,
            descriptor.label,
            descriptor.usage
        );
        state.resources.insert(
            id,
            ResourceEntry {
                descriptor: descriptor.clone(),
                allocation,
            },
        );
        Ok(ResourceId(id))
    }

    fn describe_resource(&self, resource: ResourceId) -> ComputeResult<ResourceDescriptor> {
        Ok(self.state.lock().resource(resource)?.descriptor.clone())
    }

    fn release_resource(&self, resource: ResourceId) {
        let removed = self.state.lock().resources.remove(&resource.0);
        debug_assert!(removed.is_some(), "resource {} released twice", resource.0);
        if let Some(ResourceEntry {
            allocation: Allocation::Texture(texture),
            ..
        }) = removed
        {
            texture.destroy();
        }
    }

    fn create_view(
        &self,
        resource: ResourceId,
        descriptor: &ViewDescriptor,
    ) -> ComputeResult<ViewId> {
        let mut state = self.state.lock();
        let entry = state.resource(resource)?;
        descriptor.validate_against(&entry.descriptor)?;

        let view = match (&entry.allocation, *descriptor, entry.descriptor.dimension) {
            (
                Allocation::Buffer(_),
                ViewDescriptor::Buffer {
                    first_element,
                    element_count,
                    ..
                },
                ResourceDimension::Buffer { stride, .. },
            ) => ViewEntry::Buffer {
                resource: resource.0,
                offset: first_element as u64 * stride as u64,
                size: element_count as u64 * stride as u64,
            },
            (Allocation::Texture(texture), ViewDescriptor::Texture2D { format, mip_slice }, _) => {
                let format = convert_texture_format(format)?;
                ViewEntry::Texture {
                    view: texture.create_view(&wgpu::TextureViewDescriptor {
                        format: Some(format),
                        dimension: Some(wgpu::TextureViewDimension::D2),
                        base_mip_level: mip_slice,
                        mip_level_count: Some(1),
                        ..Default::default()
                    }),
                    format,
                    dimension: wgpu::TextureViewDimension::D2,
                }
            }
            (
                Allocation::Texture(texture),
                ViewDescriptor::Texture2DArray {
                    format,
                    mip_slice,
                    first_slice,
                    slice_count,
                },
                _,
            ) => {
                let format = convert_texture_format(format)?;
                ViewEntry::Texture {
                    view: texture.create_view(&wgpu::TextureViewDescriptor {
                        format: Some(format),
                        dimension: Some(wgpu::TextureViewDimension::D2Array),
                        base_mip_level: mip_slice,
                        mip_level_count: Some(1),
                        base_array_layer: first_slice,
                        array_layer_count: Some(slice_count),
                        ..Default::default()
                    }),
                    format,
                    dimension: wgpu::TextureViewDimension::D2Array,
                }
            }
            _ => {
                return Err(ComputeError::IncompatibleResource(
                    "views require a GPU-resident resource of the matching kind".into(),
                ))
            }
        };
        let id = state.allocate_id();
        state.views.insert(id, view);
        Ok(ViewId(id))
    }

    fn release_view(&self, view: ViewId) {
        let removed = self.state.lock().views.remove(&view.0);
        debug_assert!(removed.is_some(), "view {} released twice", view.0);
    }

    fn copy_resource(&self, source: ResourceId, destination: ResourceId) -> ComputeResult<()> {
        if source == destination {
            return Err(ComputeError::ArgumentInvalid(
                "source and destination are the same resource".into(),
            ));
        }
        let mut state = self.state.lock();
        state.resource(source)?;
        self.refresh_staging(&mut state, source.0)?;
        let mut target = state
            .resources
            .remove(&destination.0)
            .ok_or_else(|| unknown_resource(destination))?;
        let result = self.copy_whole(&mut state, source, &mut target);
        state.resources.insert(destination.0, target);
        result
    }

    fn copy_subresource_region(
        &self,
        source: ResourceId,
        source_subresource: u32,
        region: Option<CopyRegion>,
        destination: ResourceId,
        destination_subresource: u32,
        destination_origin: (u32, u32),
    ) -> ComputeResult<()> {
        let mut state = self.state.lock();
        let State {
            resources, encoder, ..
        } = &mut *state;
        let from = resources.get(&source.0).ok_or_else(|| unknown_resource(source))?;
        let to = resources
            .get(&destination.0)
            .ok_or_else(|| unknown_resource(destination))?;
        let (Allocation::Texture(from_texture), Allocation::Texture(to_texture)) =
            (&from.allocation, &to.allocation)
        else {
            return Err(ComputeError::ArgumentInvalid(
                "region copies need GPU-resident textures on wgpu".into(),
            ));
        };
        let source_extent = texture_extent(&from.descriptor.dimension);
        let region = region
            .unwrap_or_else(|| CopyRegion::full(source_extent.width, source_extent.height));
        if !region.fits_within(source_extent.width, source_extent.height)
            || source_subresource >= source_extent.depth_or_array_layers
        {
            return Err(ComputeError::OutOfRange(format!(
                "source region {region:?} of slice {source_subresource} exceeds the texture"
            )));
        }
        let target_extent = texture_extent(&to.descriptor.dimension);
        let placed = CopyRegion::new(
            destination_origin.0,
            destination_origin.1,
            region.width,
            region.height,
        );
        if !placed.fits_within(target_extent.width, target_extent.height)
            || destination_subresource >= target_extent.depth_or_array_layers
        {
            return Err(ComputeError::OutOfRange(format!(
                "destination region {placed:?} of slice {destination_subresource} exceeds the texture"
            )));
        }
        if from_texture.format().remove_srgb_suffix() != to_texture.format().remove_srgb_suffix() {
            return Err(ComputeError::FeatureNotSupported(format!(
                "wgpu cannot copy {:?} into {:?}",
                from_texture.format(),
                to_texture.format()
            )));
        }

        self.recording(encoder).copy_texture_to_texture(
            texture_at(from_texture, region.x, region.y, source_subresource),
            texture_at(
                to_texture,
                destination_origin.0,
                destination_origin.1,
                destination_subresource,
            ),
            wgpu::Extent3d {
                width: region.width,
                height: region.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn update_resource(
        &self,
        destination: ResourceId,
        data: SubresourceData<'_>,
    ) -> ComputeResult<()> {
        let mut state = self.state.lock();
        let State {
            resources, encoder, ..
        } = &mut *state;
        let entry = resources
            .get(&destination.0)
            .ok_or_else(|| unknown_resource(destination))?;
        let dimension = entry.descriptor.dimension;
        let tight = SubresourceLayout::tight(&dimension);
        if data.bytes.len() < tight.total_size() {
            return Err(ComputeError::ArgumentInvalid(format!(
                "{} bytes supplied, {} required",
                data.bytes.len(),
                tight.total_size()
            )));
        }
        self.submit(encoder);
        match &entry.allocation {
            Allocation::Buffer(buffer) => {
                self.queue
                    .write_buffer(buffer, 0, &data.bytes[..tight.total_size()]);
            }
            Allocation::Texture(texture) => {
                let rows = (data.slice_pitch / data.row_pitch.max(1)) as u32;
                self.queue.write_texture(
                    texture_at(texture, 0, 0, 0),
                    data.bytes,
                    data_layout(data.row_pitch, rows),
                    texture_extent(&dimension),
                );
            }
            Allocation::Staging { .. } => {
                return Err(ComputeError::ArgumentInvalid(
                    "staging resources are updated through map".into(),
                ))
            }
        }
        Ok(())
    }

    fn map(
        &self,
        staging: ResourceId,
        subresource: Option<u32>,
        mode: CpuAccessMode,
        access: &mut dyn FnMut(&mut MappedSubresource<'_>),
    ) -> ComputeResult<()> {
        let mut state = self.state.lock();
        let descriptor = &state.resource(staging)?.descriptor;
        if descriptor.usage != ResourceUsage::Staging {
            return Err(ComputeError::ArgumentInvalid(
                "only staging resources can be mapped".into(),
            ));
        }
        if (mode.reads() && !descriptor.cpu_access.contains(CpuAccessFlags::READ))
            || (mode.writes() && !descriptor.cpu_access.contains(CpuAccessFlags::WRITE))
        {
            return Err(ComputeError::ArgumentInvalid(format!(
                "map mode {mode:?} not permitted by {:?}",
                descriptor.cpu_access
            )));
        }
        self.refresh_staging(&mut state, staging.0)?;
        let Some(ResourceEntry {
            allocation: Allocation::Staging { shadow, layout, .. },
            ..
        }) = state.resources.get_mut(&staging.0)
        else {
            return Err(unknown_resource(staging));
        };
        let layout = *layout;
        let range = match subresource {
            Some(slice) if slice >= layout.slices => {
                return Err(ComputeError::OutOfRange(format!(
                    "subresource {slice} of {} slices",
                    layout.slices
                )))
            }
            Some(slice) => {
                let start = slice as usize * layout.slice_pitch;
                start..start + layout.slice_pitch
            }
            None => 0..shadow.len(),
        };
        let mut lease = ShadowLease {
            state: &self.state,
            staging: staging.0,
            shadow: std::mem::take(shadow),
        };
        drop(state);

        let mut mapped = MappedSubresource::new(
            &mut lease.shadow[range],
            layout.row_pitch,
            layout.slice_pitch,
            mode,
        );
        access(&mut mapped);
        Ok(())
    }

    fn export_shared(&self, _resource: ResourceId) -> ComputeResult<SharedHandle> {
        Err(ComputeError::FeatureNotSupported(
            "wgpu has no cross-device shared handles".into(),
        ))
    }

    fn open_shared(&self, _handle: SharedHandle) -> ComputeResult<ResourceId> {
        Err(ComputeError::FeatureNotSupported(
            "wgpu has no cross-device shared handles".into(),
        ))
    }

    fn create_kernel(&self, source: &KernelSource) -> ComputeResult<KernelId> {
        let bytecode = match source {
            KernelSource::Bytecode(bytecode) => bytecode,
            KernelSource::Host { label, .. } => {
                return Err(ComputeError::FeatureNotSupported(format!(
                    "host kernel '{label}' cannot run on wgpu"
                )))
            }
        };
        let module = self.validated(ComputeError::CompilationFailed, || {
            self.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(bytecode.entry_point()),
                    source: wgpu::ShaderSource::SpirV(Cow::Borrowed(bytecode.words())),
                })
        })?;
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.kernels.insert(
            id,
            KernelEntry {
                module,
                entry_point: bytecode.entry_point().to_string(),
            },
        );
        Ok(KernelId(id))
    }

    fn release_kernel(&self, kernel: KernelId) {
        let removed = self.state.lock().kernels.remove(&kernel.0);
        debug_assert!(removed.is_some(), "kernel {} released twice", kernel.0);
    }

    fn dispatch(&self, dispatch: &DispatchDescriptor) -> ComputeResult<()> {
        if let Some(count) = dispatch
            .group_count
            .iter()
            .find(|&&count| count > MAX_DISPATCH_GROUPS)
        {
            return Err(ComputeError::OutOfRange(format!(
                "group count {count} exceeds {MAX_DISPATCH_GROUPS}"
            )));
        }

        let mut state = self.state.lock();
        let State {
            resources,
            views,
            kernels,
            encoder,
            ..
        } = &mut *state;
        let kernel = kernels.get(&dispatch.kernel.0).ok_or_else(|| {
            ComputeError::ArgumentInvalid(format!("unknown kernel {}", dispatch.kernel.0))
        })?;

        let mut view_layout = Vec::new();
        let mut view_entries = Vec::new();
        for &(register, view) in &dispatch.views {
            let entry = views.get(&view.0).ok_or_else(|| {
                ComputeError::ArgumentInvalid(format!("unknown view {} at u{register}", view.0))
            })?;
            let (ty, resource) = match entry {
                ViewEntry::Buffer {
                    resource,
                    offset,
                    size,
                } => {
                    let buffer = match resources.get(resource) {
                        Some(ResourceEntry {
                            allocation: Allocation::Buffer(buffer),
                            ..
                        }) => buffer,
                        _ => {
                            return Err(ComputeError::ArgumentInvalid(format!(
                                "view at u{register} outlived its buffer"
                            )))
                        }
                    };
                    (
                        wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: false },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer,
                            offset: *offset,
                            size: NonZeroU64::new(*size),
                        }),
                    )
                }
                ViewEntry::Texture {
                    view,
                    format,
                    dimension,
                } => (
                    wgpu::BindingType::StorageTexture {
                        access: wgpu::StorageTextureAccess::ReadWrite,
                        format: *format,
                        view_dimension: *dimension,
                    },
                    wgpu::BindingResource::TextureView(view),
                ),
            };
            view_layout.push(wgpu::BindGroupLayoutEntry {
                binding: register,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty,
                count: None,
            });
            view_entries.push(wgpu::BindGroupEntry {
                binding: register,
                resource,
            });
        }

        let mut constant_layout = Vec::new();
        let mut constant_entries = Vec::new();
        for &(register, buffer) in &dispatch.constant_buffers {
            let entry = resources.get(&buffer.0).ok_or_else(|| unknown_resource(buffer))?;
            let Allocation::Buffer(buffer) = &entry.allocation else {
                return Err(ComputeError::IncompatibleResource(format!(
                    "resource bound at b{register} is not a constant buffer"
                )));
            };
            if !entry.descriptor.bind.contains(BindFlags::CONSTANT_BUFFER) {
                return Err(ComputeError::IncompatibleResource(format!(
                    "resource bound at b{register} is not a constant buffer"
                )));
            }
            constant_layout.push(wgpu::BindGroupLayoutEntry {
                binding: register,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
            constant_entries.push(wgpu::BindGroupEntry {
                binding: register,
                resource: buffer.as_entire_binding(),
            });
        }

        let (pipeline, view_group, constant_group) =
            self.validated(ComputeError::IncompatibleResource, || {
                let view_group_layout =
                    self.device
                        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                            label: Some("kernel views"),
                            entries: &view_layout,
                        });
                let constant_group_layout =
                    self.device
                        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                            label: Some("kernel constants"),
                            entries: &constant_layout,
                        });
                let pipeline_layout =
                    self.device
                        .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                            label: Some("kernel layout"),
                            bind_group_layouts: &[&view_group_layout, &constant_group_layout],
                            push_constant_ranges: &[],
                        });
                let pipeline =
                    self.device
                        .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                            label: Some(&kernel.entry_point),
                            layout: Some(&pipeline_layout),
                            module: &kernel.module,
                            entry_point: Some(&kernel.entry_point),
                            compilation_options: wgpu::PipelineCompilationOptions::default(),
                            cache: None,
                        });
                let view_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("kernel views"),
                    layout: &view_group_layout,
                    entries: &view_entries,
                });
                let constant_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("kernel constants"),
                    layout: &constant_group_layout,
                    entries: &constant_entries,
                });
                (pipeline, view_group, constant_group)
            })?;

        let [x, y, z] = dispatch.group_count;
        if self.flags.wants_diagnostics() {
            log::debug!(
                "WgpuDevice {}: dispatch '{}' {x}x{y}x{z}",
                self.id.0,
                kernel.entry_point
            );
        }
        let mut pass = self
            .recording(encoder)
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&kernel.entry_point),
                timestamp_writes: None,
            });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &view_group, &[]);
        pass.set_bind_group(1, &constant_group, &[]);
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    fn create_query(&self, kind: QueryKind) -> ComputeResult<QueryId> {
        Err(ComputeError::FeatureNotSupported(format!(
            "{kind:?} queries are not available on wgpu"
        )))
    }

    fn begin_query(&self, query: QueryId) -> ComputeResult<()> {
        Err(ComputeError::ArgumentInvalid(format!("unknown query {}", query.0)))
    }

    fn end_query(&self, query: QueryId) -> ComputeResult<()> {
        Err(ComputeError::ArgumentInvalid(format!("unknown query {}", query.0)))
    }

    fn query_data(&self, query: QueryId) -> ComputeResult<Option<QueryData>> {
        Err(ComputeError::ArgumentInvalid(format!("unknown query {}", query.0)))
    }

    fn release_query(&self, query: QueryId) {
        log::warn!("WgpuDevice {}: release of unknown query {}", self.id.0, query.0);
    }

    fn flush(&self) {
        log::trace!("WgpuDevice {}: flush", self.id.0);
        let mut state = self.state.lock();
        self.submit(&mut state.encoder);
        let _ = self.device.poll(wgpu::Maintain::Poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mapping() {
        assert_eq!(
            convert_texture_format(TextureFormat::R8G8B8A8Unorm).unwrap(),
            wgpu::TextureFormat::Rgba8Unorm
        );
        assert!(matches!(
            convert_texture_format(TextureFormat::Bc1Unorm),
            Err(ComputeError::FeatureNotSupported(_))
        ));
    }

    #[test]
    fn test_staging_rows_are_copy_aligned() {
        let layout = SubresourceLayout::for_dimension(
            &ResourceDimension::Texture2D {
                width: 3,
                height: 2,
                array_size: 1,
                format: TextureFormat::R8G8B8A8Unorm,
            },
            ROW_PITCH_ALIGNMENT,
        );
        assert_eq!(layout.row_pitch, 256);
        assert_eq!(layout.total_size(), 512);
    }
}
