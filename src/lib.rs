//! GPU compute resource layer
//!
//! Textures, texture arrays, structured buffers and constant buffers living on
//! a compute device, with:
//! - CPU access through a staging mirror and a scoped mapping closure
//! - Whole-resource and region copies, within a device or across devices
//! - Cross-device sharing of one allocation
//! - Kernel compilation, binding and dispatch
//! - Bitmap import and export, headless presentation and GPU timing
//!
//! Two backends implement the native device boundary:
//! - **software**: in-process device with real memory and command ordering
//! - **wgpu**: GPU adapters through wgpu (`wgpu-backend` feature)
//!
//! # Example
//!
//! ```ignore
//! let device = Device::create(0, DeviceCreationFlags::empty())?;
//! let mut buffer = device.create_structured_buffer(&[1.0f32, 2.0, 3.0, 4.0])?;
//! buffer.enable_cpu_access()?;
//! assert_eq!(buffer.to_vec()?, vec![1.0, 2.0, 3.0, 4.0]);
//! ```

pub mod backend;
pub mod binding;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod format;
pub mod imaging;
pub mod instance;
pub mod kernel;
pub mod resource;
pub mod surface;

pub use backend::{AdapterInfo, AdapterType, CopyRegion, CpuAccessMode, MappedSubresource};
pub use binding::KernelBindings;
pub use config::{BackendType, DeviceCreationFlags, InstanceParameters};
pub use device::{Device, NativeDevice};
pub use diagnostics::{GpuTimer, GpuTiming};
pub use error::{ComputeError, ComputeResult};
pub use format::{PixelLayout, TextureFormat};
pub use imaging::{decode_image, decode_image_file, DecodedImage, TextureConverter};
pub use instance::ComputeInstance;
pub use kernel::{
    compile_kernel, compile_kernel_source, HostInvocation, HostView, Kernel, KernelBytecode,
};
pub use resource::{
    ConstantBuffer, NativeResource, Resource, ResourceShape, StructuredBuffer, Texture2D,
    Texture2DArray,
};
pub use surface::{validate_frame, HeadlessSurface, PresentationSurface};
