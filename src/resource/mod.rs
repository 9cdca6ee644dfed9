//! GPU resources.
//!
//! Every texture and structured buffer is a [`Resource`] parameterised over its
//! shape. The resource owns one GPU-resident allocation, an optional staging
//! mirror used for CPU access, and a lazily created read/write view.
//!
//! CPU access follows a fixed protocol: copy the allocation into the staging
//! mirror, map the mirror, run the caller's closure, unmap, and copy the mirror
//! back if the access wrote. The closure is the only place mapped memory is
//! reachable, so unmapping cannot be skipped.

mod constant_buffer;
mod structured_buffer;
mod texture2d;
mod texture2d_array;

use std::fmt;

use crate::backend::{
    copy_pitched, BindFlags, CpuAccessMode, MappedSubresource, ResourceDescriptor,
    ResourceDimension, ResourceId, SubresourceData, SubresourceLayout, ViewDescriptor, ViewId,
};
use crate::config::DeviceCreationFlags;
use crate::device::{Device, NativeDevice};
use crate::error::{ComputeError, ComputeResult};

pub use constant_buffer::ConstantBuffer;
pub use structured_buffer::{StructuredBuffer, StructuredShape};
pub use texture2d::{Texture2D, Texture2DShape};
pub use texture2d_array::{Texture2DArray, Texture2DArrayShape};

/// Shape of a resource variant: how it is described to the backend and how
/// its read/write view looks.
pub trait ResourceShape: Clone + fmt::Debug + Send + Sync + 'static {
    /// Variant name for logs and labels.
    const KIND: &'static str;

    /// Native description of the allocation.
    fn dimension(&self) -> ResourceDimension;

    fn bind_flags(&self) -> BindFlags;

    /// Read/write view over the whole resource.
    fn view(&self) -> ViewDescriptor;

    /// Byte size of the resource contents.
    fn byte_size(&self) -> u64 {
        self.dimension().byte_size()
    }

    /// Recover the shape from the description of an opened allocation.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::IncompatibleResource`] if the allocation does not
    /// have this shape.
    fn from_dimension(dimension: &ResourceDimension) -> ComputeResult<Self>;

    /// Whether resources of this shape enable CPU access when imported.
    fn cpu_access_on_import() -> bool {
        false
    }
}

/// Whether dropping the wrapper releases the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    Owned,
    /// Imported from a raw native resource that is released elsewhere.
    Borrowed,
}

/// Raw native resource reference: the device it lives on, its handle there,
/// and the creation flags of the device handle it was taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeResource {
    device: NativeDevice,
    id: ResourceId,
    flags: DeviceCreationFlags,
}

impl NativeResource {
    pub fn device(&self) -> &NativeDevice {
        &self.device
    }

    pub fn flags(&self) -> DeviceCreationFlags {
        self.flags
    }
}

/// A GPU-resident allocation with optional CPU access.
pub struct Resource<S: ResourceShape> {
    device: Device,
    shape: S,
    gpu: ResourceId,
    staging: Option<ResourceId>,
    view: Option<ViewId>,
    ownership: Ownership,
}

impl<S: ResourceShape> Resource<S> {
    /// Create a resource of `shape`, optionally filled with one tightly packed
    /// data block per subresource.
    pub(crate) fn create(device: &Device, shape: S, initial_data: &[&[u8]]) -> ComputeResult<Self> {
        let dimension = shape.dimension();
        let tight = SubresourceLayout::tight(&dimension);
        if !initial_data.is_empty() && initial_data.len() != dimension.subresource_count() as usize
        {
            return Err(ComputeError::ArgumentInvalid(format!(
                "{} data blocks for {} subresources",
                initial_data.len(),
                dimension.subresource_count()
            )));
        }
        let subresources = initial_data
            .iter()
            .map(|bytes| {
                if bytes.len() != tight.slice_pitch {
                    return Err(ComputeError::ArgumentInvalid(format!(
                        "{} bytes supplied for a {}-byte subresource",
                        bytes.len(),
                        tight.slice_pitch
                    )));
                }
                Ok(SubresourceData {
                    bytes,
                    row_pitch: tight.row_pitch,
                    slice_pitch: tight.slice_pitch,
                })
            })
            .collect::<ComputeResult<Vec<_>>>()?;

        let descriptor = ResourceDescriptor::new(dimension)
            .with_label(S::KIND)
            .with_bind_flags(shape.bind_flags());
        let gpu = device.create_resource(&descriptor, &subresources)?;
        Ok(Self {
            device: device.clone(),
            shape,
            gpu,
            staging: None,
            view: None,
            ownership: Ownership::Owned,
        })
    }

    /// Wrap an allocation that already exists on `device`.
    fn adopt(device: Device, gpu: ResourceId, ownership: Ownership) -> ComputeResult<Self> {
        let described = device
            .backend()
            .describe_resource(gpu)
            .and_then(|descriptor| S::from_dimension(&descriptor.dimension));
        let shape = match described {
            Ok(shape) => shape,
            Err(e) => {
                if ownership == Ownership::Owned {
                    device.backend().release_resource(gpu);
                }
                return Err(e);
            }
        };
        let mut resource = Self {
            device,
            shape,
            gpu,
            staging: None,
            view: None,
            ownership,
        };
        if S::cpu_access_on_import() {
            resource.enable_cpu_access()?;
        }
        Ok(resource)
    }

    /// Wrap a raw native resource. The wrapper never releases the allocation
    /// itself, only the staging mirror and view it creates.
    pub fn from_native(native: &NativeResource) -> ComputeResult<Self> {
        let device = Device::from_native(&native.device, native.flags);
        Self::adopt(device, native.id, Ownership::Borrowed)
    }

    pub fn native(&self) -> NativeResource {
        NativeResource {
            device: self.device.native(),
            id: self.gpu,
            flags: self.device.flags(),
        }
    }

    /// Whether both wrappers refer to the same allocation handle on the same device.
    pub fn same_native_resource<O: ResourceShape>(&self, other: &Resource<O>) -> bool {
        self.device.same_domain(&other.device) && self.gpu == other.gpu
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn shape(&self) -> &S {
        &self.shape
    }

    pub(crate) fn gpu_id(&self) -> ResourceId {
        self.gpu
    }

    /// Byte size of the whole resource with tightly packed rows.
    pub fn resource_size(&self) -> u64 {
        self.shape.byte_size()
    }

    /// Allocate the staging mirror. Does nothing if CPU access is already enabled.
    pub fn enable_cpu_access(&mut self) -> ComputeResult<()> {
        if self.staging.is_some() {
            return Ok(());
        }
        let descriptor = ResourceDescriptor::new(self.shape.dimension())
            .with_label(S::KIND)
            .staging_mirror();
        self.staging = Some(self.device.create_resource(&descriptor, &[])?);
        Ok(())
    }

    /// Release the staging mirror. Does nothing if CPU access is disabled.
    pub fn disable_cpu_access(&mut self) {
        if let Some(staging) = self.staging.take() {
            self.device.backend().release_resource(staging);
        }
    }

    pub fn is_cpu_access_enabled(&self) -> bool {
        self.staging.is_some()
    }

    /// Run `access` with the resource contents mapped for `mode`.
    ///
    /// Use [`MappedSubresource::row_pitch`] to address rows; it is usually
    /// larger than the logical row width.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::CpuAccessDisabled`] unless CPU access is enabled.
    pub fn access_raw_data<R>(
        &mut self,
        mode: CpuAccessMode,
        access: impl FnOnce(&mut MappedSubresource<'_>) -> R,
    ) -> ComputeResult<R> {
        self.access_subresource(None, mode, access)
    }

    pub(crate) fn access_subresource<R>(
        &mut self,
        subresource: Option<u32>,
        mode: CpuAccessMode,
        access: impl FnOnce(&mut MappedSubresource<'_>) -> R,
    ) -> ComputeResult<R> {
        let staging = self.staging.ok_or(ComputeError::CpuAccessDisabled)?;
        let backend = self.device.backend();

        backend.copy_resource(self.gpu, staging)?;

        let mut access = Some(access);
        let mut result = None;
        backend.map(staging, subresource, mode, &mut |mapped| {
            if let Some(access) = access.take() {
                result = Some(access(mapped));
            }
        })?;

        if mode.writes() {
            backend.copy_resource(staging, self.gpu)?;
        }

        result.ok_or_else(|| ComputeError::Internal("map returned without running the access".into()))
    }

    /// Overwrite the whole resource from tightly packed host data without
    /// going through the staging mirror.
    pub fn update_subresource(&mut self, data: &[u8]) -> ComputeResult<()> {
        let dimension = self.shape.dimension();
        let expected = SubresourceLayout::tight(&dimension).total_size();
        if data.len() != expected {
            return Err(ComputeError::ArgumentInvalid(format!(
                "{} bytes supplied for a {expected}-byte resource",
                data.len()
            )));
        }
        self.device
            .backend()
            .update_resource(self.gpu, SubresourceData::tight(data, &dimension))
    }

    /// GPU copy of the whole resource into `destination` on the same device.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::IncompatibleResource`] if the resources live in
    /// different domains or differ in shape or format group.
    pub fn copy_resource(&self, destination: &mut Resource<S>) -> ComputeResult<()> {
        if !self.device.same_domain(&destination.device) {
            return Err(ComputeError::IncompatibleResource(format!(
                "cannot copy from device {:?} to device {:?}; use copy_to",
                self.device.native_id(),
                destination.device.native_id()
            )));
        }
        if !self
            .shape
            .dimension()
            .is_copy_compatible(&destination.shape.dimension())
        {
            return Err(ComputeError::IncompatibleResource(format!(
                "{:?} and {:?} are not copy compatible",
                self.shape, destination.shape
            )));
        }
        if self.gpu == destination.gpu {
            return Err(ComputeError::ArgumentInvalid(
                "source and destination are the same resource".into(),
            ));
        }
        self.device.backend().copy_resource(self.gpu, destination.gpu)
    }

    /// Copy the whole resource into `destination`, on any device.
    ///
    /// Within one domain this is [`Resource::copy_resource`]. Across domains
    /// both resources need CPU access and the bytes travel through both
    /// staging mirrors, which is far slower.
    pub fn copy_to(&mut self, destination: &mut Resource<S>) -> ComputeResult<()> {
        if self.device.same_domain(&destination.device) {
            return self.copy_resource(destination);
        }
        if !self
            .shape
            .dimension()
            .is_copy_compatible(&destination.shape.dimension())
        {
            return Err(ComputeError::IncompatibleResource(format!(
                "{:?} and {:?} are not copy compatible",
                self.shape, destination.shape
            )));
        }
        if !self.is_cpu_access_enabled() || !destination.is_cpu_access_enabled() {
            return Err(ComputeError::CpuAccessDisabled);
        }

        log::warn!(
            "Copying {} between devices {:?} and {:?} through the CPU",
            S::KIND,
            self.device.native_id(),
            destination.device.native_id()
        );
        let layout = SubresourceLayout::tight(&self.shape.dimension());
        destination
            .access_raw_data(CpuAccessMode::Write, |dst| {
                let dst_pitched = dst.pitched();
                self.access_raw_data(CpuAccessMode::Read, |src| {
                    copy_pitched(
                        src.bytes(),
                        src.pitched(),
                        dst.bytes_mut(),
                        dst_pitched,
                        layout.row_bytes,
                        layout.rows,
                        layout.slices,
                    )
                })
                .and_then(|copied| copied)
            })
            .and_then(|copied| copied)
    }

    /// Open this allocation on `device` as an independent resource.
    ///
    /// The two resources alias the same memory. After writing through either
    /// one, flush its device before reading through the other.
    pub fn share(&self, device: &Device) -> ComputeResult<Self> {
        let handle = self.device.backend().export_shared(self.gpu)?;
        let opened = device.backend().open_shared(handle)?;
        log::debug!(
            "Shared {} from device {:?} to device {:?}",
            S::KIND,
            self.device.native_id(),
            device.native_id()
        );
        Self::adopt(device.clone(), opened, Ownership::Owned)
    }

    /// Share with the device behind a bare native device handle.
    pub fn share_with_native(&self, native: &NativeDevice) -> ComputeResult<Self> {
        self.share(&Device::from_native(native, self.device.flags()))
    }

    /// Share with the device that owns `other`.
    pub fn share_with<O: ResourceShape>(&self, other: &Resource<O>) -> ComputeResult<Self> {
        self.share(&other.device)
    }

    /// Read/write view used for kernel binding, created on first use.
    pub(crate) fn view(&mut self) -> ComputeResult<ViewId> {
        if let Some(view) = self.view {
            return Ok(view);
        }
        let view = self
            .device
            .backend()
            .create_view(self.gpu, &self.shape.view())?;
        self.view = Some(view);
        Ok(view)
    }
}

impl<S: ResourceShape> Drop for Resource<S> {
    fn drop(&mut self) {
        let backend = self.device.backend();
        if self.ownership == Ownership::Owned {
            backend.release_resource(self.gpu);
        }
        if let Some(staging) = self.staging.take() {
            backend.release_resource(staging);
        }
        if let Some(view) = self.view.take() {
            backend.release_view(view);
        }
    }
}

impl<S: ResourceShape> fmt::Debug for Resource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(S::KIND)
            .field("shape", &self.shape)
            .field("device", &self.device.native_id())
            .field("cpu_access", &self.is_cpu_access_enabled())
            .field("ownership", &self.ownership)
            .finish()
    }
}
