//! Compute instance.
//!
//! The [`ComputeInstance`] is the top-level entry point: it selects a backend,
//! enumerates its adapters, and creates [`Device`]s.

use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::backend::{self, AdapterInfo};
use crate::config::{DeviceCreationFlags, InstanceParameters};
use crate::device::{Device, DeviceInner};
use crate::error::ComputeResult;

/// The compute instance manages adapters and the devices created on them.
///
/// # Example
///
/// ```ignore
/// let instance = ComputeInstance::new(InstanceParameters::default())?;
/// let device = instance.create_device(0, DeviceCreationFlags::empty())?;
/// ```
pub struct ComputeInstance {
    params: InstanceParameters,
    adapters: Vec<AdapterInfo>,
    /// Devices created by this instance, tracked weakly for diagnostics.
    devices: RwLock<Vec<Weak<DeviceInner>>>,
}

impl ComputeInstance {
    /// Create a new compute instance.
    pub fn new(params: InstanceParameters) -> ComputeResult<Arc<Self>> {
        log::info!("Creating ComputeInstance ({:?} backend)", params.backend);

        let adapters = backend::enumerate_adapters(&params);
        if adapters.is_empty() {
            log::warn!("{:?} backend exposes no adapters", params.backend);
        }
        for (index, adapter) in adapters.iter().enumerate() {
            log::info!("  adapter {index}: {} ({:?})", adapter.name, adapter.device_type);
        }

        Ok(Arc::new(Self {
            params,
            adapters,
            devices: RwLock::new(Vec::new()),
        }))
    }

    pub fn parameters(&self) -> &InstanceParameters {
        &self.params
    }

    /// Enumerate available compute adapters.
    pub fn enumerate_adapters(&self) -> Vec<AdapterInfo> {
        self.adapters.clone()
    }

    /// Create a device on the adapter at `adapter_index`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ComputeError::DeviceCreationFailed`] if the adapter index
    /// is out of range or the backend cannot create the device.
    pub fn create_device(
        &self,
        adapter_index: usize,
        flags: DeviceCreationFlags,
    ) -> ComputeResult<Device> {
        let backend = backend::create_device_backend(&self.params, adapter_index, flags)?;
        let device = Device::from_backend(backend, flags);

        let mut devices = self.devices.write();
        devices.retain(|weak| weak.strong_count() > 0);
        devices.push(device.downgrade());

        Ok(device)
    }

    /// Number of devices created by this instance that are still alive.
    pub fn device_count(&self) -> usize {
        self.devices
            .read()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

impl std::fmt::Debug for ComputeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeInstance")
            .field("backend", &self.params.backend)
            .field("adapters", &self.adapters.len())
            .field("device_count", &self.device_count())
            .finish()
    }
}

// Ensure ComputeInstance is Send + Sync
static_assertions::assert_impl_all!(ComputeInstance: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ComputeError;

    #[test]
    fn test_instance_creation() {
        let instance = ComputeInstance::new(InstanceParameters::default()).unwrap();
        assert_eq!(instance.device_count(), 0);
        assert_eq!(instance.enumerate_adapters().len(), 2);
    }

    #[test]
    fn test_create_multiple_devices() {
        let instance = ComputeInstance::new(InstanceParameters::default()).unwrap();
        let first = instance.create_device(0, DeviceCreationFlags::empty()).unwrap();
        let second = instance.create_device(1, DeviceCreationFlags::empty()).unwrap();
        assert_eq!(instance.device_count(), 2);
        assert!(!first.same_domain(&second));

        drop(second);
        assert_eq!(instance.device_count(), 1);
    }

    #[test]
    fn test_invalid_adapter_index() {
        let instance =
            ComputeInstance::new(InstanceParameters::new().with_software_adapters(1)).unwrap();
        let result = instance.create_device(1, DeviceCreationFlags::empty());
        assert!(matches!(result, Err(ComputeError::DeviceCreationFailed(_))));
    }

    #[test]
    fn test_row_pitch_alignment_reaches_devices() {
        let instance =
            ComputeInstance::new(InstanceParameters::new().with_row_pitch_alignment(64)).unwrap();
        let device = instance.create_device(0, DeviceCreationFlags::empty()).unwrap();
        assert_eq!(device.backend().row_pitch_alignment(), 64);
    }
}
