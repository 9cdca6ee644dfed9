//! Kernel binding table.
//!
//! [`KernelBindings`] records which kernel is active and which views and
//! constant buffers sit at which registers. Nothing is bound implicitly: the
//! target [`Device`] is passed to every call and must match the domain of
//! everything already bound.

use std::collections::BTreeMap;

use bytemuck::Pod;

use crate::backend::{DispatchDescriptor, NativeDeviceId, ResourceId, ViewId};
use crate::device::Device;
use crate::error::{ComputeError, ComputeResult};
use crate::kernel::Kernel;
use crate::resource::{ConstantBuffer, Resource, ResourceShape};

/// Number of read/write view registers (`u0` .. `u7`).
pub const MAX_VIEW_REGISTERS: u32 = 8;
/// Number of constant buffer registers (`b0` .. `b13`).
pub const MAX_CONSTANT_BUFFER_REGISTERS: u32 = 14;
/// Largest group count per dimension of a single dispatch.
pub const MAX_DISPATCH_GROUPS: u32 = 65535;

/// Registers bound for the next dispatch.
#[derive(Debug, Default)]
pub struct KernelBindings {
    domain: Option<NativeDeviceId>,
    kernel: Option<Kernel>,
    views: BTreeMap<u32, ViewId>,
    constants: BTreeMap<u32, ResourceId>,
}

impl KernelBindings {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_domain(&mut self, device: &Device, what: &str, owner: &Device) -> ComputeResult<()> {
        if !device.same_domain(owner) {
            return Err(ComputeError::IncompatibleResource(format!(
                "{what} belongs to device {:?}, not {:?}",
                owner.native_id(),
                device.native_id()
            )));
        }
        match self.domain {
            Some(domain) if domain != device.native_id() => {
                Err(ComputeError::IncompatibleResource(format!(
                    "bindings hold objects of device {domain:?}; clear them before using {:?}",
                    device.native_id()
                )))
            }
            _ => {
                self.domain = Some(device.native_id());
                Ok(())
            }
        }
    }

    /// Make `kernel` the one run by [`dispatch`](Self::dispatch).
    pub fn set_kernel(&mut self, device: &Device, kernel: &Kernel) -> ComputeResult<()> {
        self.check_domain(device, "kernel", kernel.device())?;
        self.kernel = Some(kernel.clone());
        Ok(())
    }

    /// Bind the read/write view of `resource` at register `u{register}`.
    ///
    /// The view is created on first use and cached by the resource.
    pub fn set_read_write_view<S: ResourceShape>(
        &mut self,
        device: &Device,
        resource: &mut Resource<S>,
        register: u32,
    ) -> ComputeResult<()> {
        if register >= MAX_VIEW_REGISTERS {
            return Err(ComputeError::OutOfRange(format!(
                "view register u{register} (limit {MAX_VIEW_REGISTERS})"
            )));
        }
        self.check_domain(device, S::KIND, resource.device())?;
        let view = resource.view()?;
        log::trace!("Binding {} view {view:?} at u{register}", S::KIND);
        self.views.insert(register, view);
        Ok(())
    }

    /// Bind `buffer` at register `b{register}`.
    pub fn set_constant_buffer<T: Pod>(
        &mut self,
        device: &Device,
        buffer: &ConstantBuffer<T>,
        register: u32,
    ) -> ComputeResult<()> {
        if register >= MAX_CONSTANT_BUFFER_REGISTERS {
            return Err(ComputeError::OutOfRange(format!(
                "constant buffer register b{register} (limit {MAX_CONSTANT_BUFFER_REGISTERS})"
            )));
        }
        self.check_domain(device, "constant buffer", buffer.device())?;
        self.constants.insert(register, buffer.gpu_id());
        Ok(())
    }

    /// Unbind everything, including the kernel.
    pub fn clear(&mut self, device: &Device) {
        log::trace!("Clearing kernel bindings for {:?}", device.native_id());
        self.domain = None;
        self.kernel = None;
        self.views.clear();
        self.constants.clear();
    }

    pub fn kernel(&self) -> Option<&Kernel> {
        self.kernel.as_ref()
    }

    pub fn bound_view_registers(&self) -> impl Iterator<Item = u32> + '_ {
        self.views.keys().copied()
    }

    /// Queue the active kernel with `x` * `y` * `z` thread groups.
    ///
    /// Bound views and constant buffers must outlive the dispatch call; the
    /// backend keeps what it needs until the work has executed.
    ///
    /// The kernel runs later, in issue order. An error it raises is returned
    /// by the next CPU access on the same device, not by this call.
    pub fn dispatch(&self, device: &Device, x: u32, y: u32, z: u32) -> ComputeResult<()> {
        let kernel = self.kernel.as_ref().ok_or_else(|| {
            ComputeError::ArgumentInvalid("dispatch without an active kernel".into())
        })?;
        if let Some(domain) = self.domain {
            if domain != device.native_id() {
                return Err(ComputeError::IncompatibleResource(format!(
                    "bindings belong to device {domain:?}, dispatch targets {:?}",
                    device.native_id()
                )));
            }
        }
        let group_count = [x, y, z];
        if let Some(count) = group_count.iter().find(|&&c| c > MAX_DISPATCH_GROUPS) {
            return Err(ComputeError::OutOfRange(format!(
                "group count {count} exceeds {MAX_DISPATCH_GROUPS}"
            )));
        }

        let descriptor = DispatchDescriptor {
            kernel: kernel.id(),
            views: self.views.iter().map(|(&r, &v)| (r, v)).collect(),
            constant_buffers: self.constants.iter().map(|(&r, &b)| (r, b)).collect(),
            group_count,
        };
        log::trace!(
            "Dispatching '{}' with {x}x{y}x{z} groups on {:?}",
            kernel.label(),
            device.native_id()
        );
        device.backend().dispatch(&descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceCreationFlags;

    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Scale {
        factor: u32,
        _pad: [u32; 3],
    }

    #[test]
    fn test_register_limits() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let mut buffer = device.create_structured_buffer(&[0u32; 4]).unwrap();
        let constants = device
            .create_constant_buffer(&Scale {
                factor: 2,
                _pad: [0; 3],
            })
            .unwrap();
        let mut bindings = KernelBindings::new();

        assert!(bindings.set_read_write_view(&device, &mut buffer, 7).is_ok());
        assert!(matches!(
            bindings.set_read_write_view(&device, &mut buffer, 8),
            Err(ComputeError::OutOfRange(_))
        ));
        assert!(bindings.set_constant_buffer(&device, &constants, 13).is_ok());
        assert!(matches!(
            bindings.set_constant_buffer(&device, &constants, 14),
            Err(ComputeError::OutOfRange(_))
        ));
        assert_eq!(bindings.bound_view_registers().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_dispatch_requires_kernel() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let bindings = KernelBindings::new();
        assert!(matches!(
            bindings.dispatch(&device, 1, 1, 1),
            Err(ComputeError::ArgumentInvalid(_))
        ));
    }

    #[test]
    fn test_group_count_limit() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let kernel = device.create_host_kernel("noop", |_| Ok(())).unwrap();
        let mut bindings = KernelBindings::new();
        bindings.set_kernel(&device, &kernel).unwrap();

        assert!(bindings.dispatch(&device, 65535, 1, 1).is_ok());
        assert!(matches!(
            bindings.dispatch(&device, 1, 65536, 1),
            Err(ComputeError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_other_domain_is_rejected() {
        let first = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let second = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let mut buffer = second.create_structured_buffer(&[0u32; 4]).unwrap();
        let kernel = first.create_host_kernel("noop", |_| Ok(())).unwrap();
        let mut bindings = KernelBindings::new();

        assert!(matches!(
            bindings.set_read_write_view(&first, &mut buffer, 0),
            Err(ComputeError::IncompatibleResource(_))
        ));
        bindings.set_kernel(&first, &kernel).unwrap();
        assert!(matches!(
            bindings.dispatch(&second, 1, 1, 1),
            Err(ComputeError::IncompatibleResource(_))
        ));

        bindings.clear(&first);
        assert!(bindings.kernel().is_none());
        assert!(bindings.set_read_write_view(&second, &mut buffer, 0).is_ok());
    }

    #[test]
    fn test_host_kernel_sees_bindings() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let mut buffer = device.create_structured_buffer(&[1u32, 2, 3, 4]).unwrap();
        buffer.enable_cpu_access().unwrap();
        let constants = device
            .create_constant_buffer(&Scale {
                factor: 3,
                _pad: [0; 3],
            })
            .unwrap();
        let kernel = device
            .create_host_kernel("scale", |invocation| {
                let scale: Scale = invocation.constant(0)?;
                invocation.with_view(0, |view| {
                    for i in 0..4 {
                        if let Some(value) = view.read::<u32>(i) {
                            view.write(i, value * scale.factor);
                        }
                    }
                })
            })
            .unwrap();

        let mut bindings = KernelBindings::new();
        bindings.set_kernel(&device, &kernel).unwrap();
        bindings.set_read_write_view(&device, &mut buffer, 0).unwrap();
        bindings.set_constant_buffer(&device, &constants, 0).unwrap();
        bindings.dispatch(&device, 1, 1, 1).unwrap();

        assert_eq!(buffer.to_vec().unwrap(), vec![3, 6, 9, 12]);
    }

    #[test]
    fn test_kernel_error_surfaces_on_next_access() {
        let device = Device::create(0, DeviceCreationFlags::empty()).unwrap();
        let mut buffer = device.create_structured_buffer(&[1u32, 2, 3, 4]).unwrap();
        buffer.enable_cpu_access().unwrap();
        let kernel = device
            .create_host_kernel("unbound", |invocation| {
                invocation.with_view(5, |_| ())
            })
            .unwrap();

        let mut bindings = KernelBindings::new();
        bindings.set_kernel(&device, &kernel).unwrap();
        bindings.set_read_write_view(&device, &mut buffer, 0).unwrap();
        assert!(bindings.dispatch(&device, 1, 1, 1).is_ok());

        assert!(buffer.to_vec().is_err());
        assert_eq!(buffer.to_vec().unwrap(), vec![1, 2, 3, 4]);
    }
}
