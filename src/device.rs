//! Compute device.
//!
//! A [`Device`] owns one native device together with its immediate context
//! and is the factory for every resource and kernel. Two handles wrapping the
//! same native device form one resource domain.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytemuck::Pod;
use image::DynamicImage;

use crate::backend::{
    AdapterInfo, DeviceBackend, NativeDeviceId, ResourceDescriptor, ResourceId, SubresourceData,
};
use crate::config::{DeviceCreationFlags, InstanceParameters};
use crate::error::{ComputeError, ComputeResult};
use crate::format::TextureFormat;
use crate::imaging::{self, DecodedImage};
use crate::instance::ComputeInstance;
use crate::kernel::{self, HostInvocation, Kernel, KernelBytecode, KernelSource};
use crate::resource::{
    ConstantBuffer, StructuredBuffer, StructuredShape, Texture2D, Texture2DArray,
    Texture2DArrayShape, Texture2DShape,
};

/// A bare native device, without creation flags.
///
/// Re-wrapping it with [`Device::from_native`] yields a new handle in the
/// same resource domain.
#[derive(Clone)]
pub struct NativeDevice {
    backend: Arc<dyn DeviceBackend>,
}

impl NativeDevice {
    pub fn id(&self) -> NativeDeviceId {
        self.backend.native_id()
    }
}

impl fmt::Debug for NativeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NativeDevice").field(&self.id()).finish()
    }
}

impl PartialEq for NativeDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for NativeDevice {}

pub(crate) struct DeviceInner {
    backend: Arc<dyn DeviceBackend>,
    flags: DeviceCreationFlags,
}

/// Handle to a compute device and its immediate context.
///
/// Cloning is cheap and every clone refers to the same device.
///
/// # Thread Safety
///
/// `Device` is `Send + Sync`. Commands issued through one device execute in
/// issue order regardless of the issuing thread.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Create a device on `adapter_index` of a default software instance.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::DeviceCreationFailed`] if the adapter does not exist.
    pub fn create(adapter_index: usize, flags: DeviceCreationFlags) -> ComputeResult<Self> {
        ComputeInstance::new(InstanceParameters::default())?.create_device(adapter_index, flags)
    }

    pub(crate) fn from_backend(backend: Arc<dyn DeviceBackend>, flags: DeviceCreationFlags) -> Self {
        Self {
            inner: Arc::new(DeviceInner { backend, flags }),
        }
    }

    /// Wrap an existing native device in a new handle.
    pub fn from_native(native: &NativeDevice, flags: DeviceCreationFlags) -> Self {
        log::debug!("Wrapping native device {:?}", native.id());
        Self::from_backend(Arc::clone(&native.backend), flags)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.inner.backend
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<DeviceInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn native(&self) -> NativeDevice {
        NativeDevice {
            backend: Arc::clone(&self.inner.backend),
        }
    }

    pub fn native_id(&self) -> NativeDeviceId {
        self.inner.backend.native_id()
    }

    /// Whether resources of `other` can be used on this device without sharing.
    pub fn same_domain(&self, other: &Device) -> bool {
        self.native_id() == other.native_id()
    }

    pub fn flags(&self) -> DeviceCreationFlags {
        self.inner.flags
    }

    pub fn adapter(&self) -> &AdapterInfo {
        self.inner.backend.adapter()
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend.name()
    }

    /// Submit all issued work so other devices observe it on their next access.
    pub fn flush(&self) {
        self.inner.backend.flush();
    }

    /// Allocate a native resource after the device-level format checks.
    pub(crate) fn create_resource(
        &self,
        descriptor: &ResourceDescriptor,
        initial_data: &[SubresourceData<'_>],
    ) -> ComputeResult<ResourceId> {
        if let Some(format) = descriptor.dimension.format() {
            if format.requires_bgra_support()
                && !self.flags().contains(DeviceCreationFlags::BGRA_SUPPORT)
            {
                return Err(ComputeError::ResourceCreationFailed(format!(
                    "format {format} requires a device created with BGRA support"
                )));
            }
        }
        let id = self.backend().create_resource(descriptor, initial_data)?;
        log::debug!(
            "Created {:?} resource {:?} {:?}",
            descriptor.usage,
            descriptor.label,
            descriptor.dimension
        );
        Ok(id)
    }

    /// Create an empty 2D texture.
    pub fn create_texture2d(
        &self,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> ComputeResult<Texture2D> {
        Texture2D::create(self, Texture2DShape::new(width, height, format), &[])
    }

    /// Create a 2D texture from tightly packed texel rows.
    pub fn create_texture2d_with_data(
        &self,
        width: u32,
        height: u32,
        format: TextureFormat,
        data: &[u8],
    ) -> ComputeResult<Texture2D> {
        Texture2D::create(self, Texture2DShape::new(width, height, format), &[data])
    }

    /// Create a 2D texture holding the pixels of a decoded bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::UnsupportedFormat`] unless the image is RGBA8 or RGBA16.
    pub fn create_texture2d_from_image(&self, image: &DynamicImage) -> ComputeResult<Texture2D> {
        let decoded = imaging::decode_image(image)?;
        self.create_texture2d_with_data(
            decoded.width,
            decoded.height,
            decoded.format,
            &decoded.pixels,
        )
    }

    /// Create a 2D texture from an image file.
    pub fn create_texture2d_from_path(&self, path: impl AsRef<Path>) -> ComputeResult<Texture2D> {
        let decoded = imaging::decode_image_file(path)?;
        self.create_texture2d_with_data(
            decoded.width,
            decoded.height,
            decoded.format,
            &decoded.pixels,
        )
    }

    pub fn create_texture2d_array(
        &self,
        width: u32,
        height: u32,
        slices: u32,
        format: TextureFormat,
    ) -> ComputeResult<Texture2DArray> {
        Texture2DArray::create(
            self,
            Texture2DArrayShape::new(width, height, slices, format),
            &[],
        )
    }

    /// Create a texture array with one tightly packed data block per slice.
    pub fn create_texture2d_array_with_data(
        &self,
        width: u32,
        height: u32,
        format: TextureFormat,
        slices: &[&[u8]],
    ) -> ComputeResult<Texture2DArray> {
        let count = u32::try_from(slices.len())
            .map_err(|_| ComputeError::ArgumentInvalid("too many slices".into()))?;
        Texture2DArray::create(
            self,
            Texture2DArrayShape::new(width, height, count, format),
            slices,
        )
    }

    /// Create a texture array with one slice per image. All images must share
    /// dimensions and pixel layout.
    pub fn create_texture2d_array_from_images(
        &self,
        images: &[DynamicImage],
    ) -> ComputeResult<Texture2DArray> {
        let decoded = images
            .iter()
            .map(imaging::decode_image)
            .collect::<ComputeResult<Vec<DecodedImage>>>()?;
        let first = decoded.first().ok_or_else(|| {
            ComputeError::ArgumentInvalid("a texture array needs at least one image".into())
        })?;
        if let Some(odd) = decoded.iter().find(|image| {
            (image.width, image.height, image.format) != (first.width, first.height, first.format)
        }) {
            return Err(ComputeError::ArgumentInvalid(format!(
                "image {}x{} {} does not match the first image {}x{} {}",
                odd.width, odd.height, odd.format, first.width, first.height, first.format
            )));
        }
        let slices: Vec<&[u8]> = decoded.iter().map(|image| image.pixels.as_slice()).collect();
        self.create_texture2d_array_with_data(first.width, first.height, first.format, &slices)
    }

    /// Create a structured buffer holding `data`; the element stride is `size_of::<T>()`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::ResourceCreationFailed`] if the byte size is not a
    /// multiple of 16 or the stride is not a multiple of 4.
    pub fn create_structured_buffer<T: Pod>(&self, data: &[T]) -> ComputeResult<StructuredBuffer<T>> {
        let shape = StructuredShape::<T>::with_len(data.len())?;
        StructuredBuffer::create(self, shape, &[bytemuck::cast_slice(data)])
    }

    /// Create a structured buffer of `len` zeroed elements.
    pub fn create_structured_buffer_zeroed<T: Pod>(
        &self,
        len: usize,
    ) -> ComputeResult<StructuredBuffer<T>> {
        StructuredBuffer::create(self, StructuredShape::<T>::with_len(len)?, &[])
    }

    /// Create a constant buffer initialised with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::ResourceCreationFailed`] unless `size_of::<T>()`
    /// is a multiple of 16.
    pub fn create_constant_buffer<T: Pod>(&self, value: &T) -> ComputeResult<ConstantBuffer<T>> {
        ConstantBuffer::create(self, value)
    }

    /// Create a kernel object from compiled bytecode.
    pub fn create_kernel(&self, bytecode: &KernelBytecode) -> ComputeResult<Kernel> {
        let id = self
            .backend()
            .create_kernel(&KernelSource::Bytecode(bytecode.clone()))?;
        Ok(Kernel::new(self.clone(), id, bytecode.entry_point().to_string()))
    }

    /// Create a kernel that runs `function` on the host for every dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::FeatureNotSupported`] on backends that only run bytecode.
    pub fn create_host_kernel<F>(&self, label: impl Into<String>, function: F) -> ComputeResult<Kernel>
    where
        F: Fn(&mut HostInvocation) -> ComputeResult<()> + Send + Sync + 'static,
    {
        let label = label.into();
        let id = self.backend().create_kernel(&KernelSource::Host {
            label: label.clone(),
            function: Arc::new(function),
        })?;
        Ok(Kernel::new(self.clone(), id, label))
    }

    /// Compile the kernel source at `path` and create a kernel object from it.
    pub fn compile_kernel(
        &self,
        path: impl AsRef<Path>,
        entry_point: &str,
        target_profile: &str,
    ) -> ComputeResult<Kernel> {
        let bytecode = kernel::compile_kernel(path, entry_point, target_profile)?;
        self.create_kernel(&bytecode)
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.same_domain(other)
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("native", &self.native_id())
            .field("backend", &self.backend_name())
            .field("adapter", &self.adapter().name)
            .field("flags", &self.flags())
            .finish()
    }
}

// Ensure device handles can be shared across threads
static_assertions::assert_impl_all!(Device: Send, Sync, Clone);
static_assertions::assert_impl_all!(NativeDevice: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_device() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        assert_eq!(device.backend_name(), "Software");
        assert_eq!(device.adapter().name, "Software Adapter 0");
    }

    #[test]
    fn test_invalid_adapter_index() {
        let result = Device::create(99, DeviceCreationFlags::empty());
        assert!(matches!(result, Err(ComputeError::DeviceCreationFailed(_))));
    }

    #[test]
    fn test_identity_follows_native_device() {
        let a = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let b = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        assert_ne!(a, b);

        let rewrapped = Device::from_native(&a.native(), DeviceCreationFlags::DEBUG);
        assert_eq!(a, rewrapped);
        assert!(a.same_domain(&rewrapped));
        assert_eq!(rewrapped.flags(), DeviceCreationFlags::DEBUG);
        assert_eq!(a.native(), rewrapped.native());
    }

    #[test]
    fn test_bgra_formats_need_flag() {
        let plain = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let result = plain.create_texture2d(4, 4, TextureFormat::B8G8R8A8Unorm);
        assert!(matches!(result, Err(ComputeError::ResourceCreationFailed(_))));

        let bgra = Device::create(0, DeviceCreationFlags::BGRA_SUPPORT).unwrap();
        assert!(bgra.create_texture2d(4, 4, TextureFormat::B8G8R8A8Unorm).is_ok());
    }

    #[test]
    fn test_host_kernel_is_owned_by_device() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let kernel = device.create_host_kernel("noop", |_| Ok(())).unwrap();
        assert_eq!(kernel.label(), "noop");
        assert_eq!(kernel.device(), &device);
    }
}
