//! Instance configuration and device creation flags.

use bitflags::bitflags;

/// Backend selection for a compute instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// In-process software device - always available, used by the tests
    #[default]
    Software,
    /// wgpu backend - real GPU adapters (requires the `wgpu-backend` feature)
    Wgpu,
}

bitflags! {
    /// Creation flags for a device, using the native bit values.
    ///
    /// The layer treats most of them as opaque. `DEBUG` and `DEBUGGABLE`
    /// turn on per-command diagnostics; `BGRA_SUPPORT` enables the BGRA
    /// format family.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceCreationFlags: u32 {
        const SINGLE_THREADED = 0x1;
        const DEBUG = 0x2;
        const SWITCH_TO_REF = 0x4;
        const PREVENT_THREADING_OPTIMIZATIONS = 0x8;
        const BGRA_SUPPORT = 0x20;
        const DEBUGGABLE = 0x40;
        const PREVENT_ALTERING_LAYER_SETTINGS_FROM_REGISTRY = 0x80;
        const DISABLE_GPU_TIMEOUT = 0x100;
        const VIDEO_SUPPORT = 0x800;
    }
}

impl DeviceCreationFlags {
    /// Whether executed commands should be logged.
    pub fn wants_diagnostics(self) -> bool {
        self.intersects(Self::DEBUG | Self::DEBUGGABLE)
    }
}

/// Configuration for creating a compute instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceParameters {
    /// Which backend creates devices
    pub backend: BackendType,
    /// Number of adapters the software backend exposes
    pub software_adapters: usize,
    /// Row pitch alignment of software staging memory, in bytes
    pub row_pitch_alignment: usize,
}

impl Default for InstanceParameters {
    fn default() -> Self {
        Self {
            backend: BackendType::Software,
            software_adapters: 2,
            row_pitch_alignment: 16,
        }
    }
}

impl InstanceParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_software_adapters(mut self, count: usize) -> Self {
        self.software_adapters = count;
        self
    }

    /// Alignment must be a power of two; other values are rounded up to one.
    pub fn with_row_pitch_alignment(mut self, alignment: usize) -> Self {
        self.row_pitch_alignment = alignment.max(1).next_power_of_two();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_values_match_native() {
        assert_eq!(DeviceCreationFlags::BGRA_SUPPORT.bits(), 32);
        assert_eq!(DeviceCreationFlags::VIDEO_SUPPORT.bits(), 2048);
        assert_eq!(DeviceCreationFlags::default(), DeviceCreationFlags::empty());
    }

    #[test]
    fn test_diagnostic_flags() {
        assert!(DeviceCreationFlags::DEBUG.wants_diagnostics());
        assert!(DeviceCreationFlags::DEBUGGABLE.wants_diagnostics());
        assert!(!DeviceCreationFlags::BGRA_SUPPORT.wants_diagnostics());
    }

    #[test]
    fn test_parameters_builder() {
        let params = InstanceParameters::new()
            .with_software_adapters(3)
            .with_row_pitch_alignment(200);
        assert_eq!(params.backend, BackendType::Software);
        assert_eq!(params.software_adapters, 3);
        assert_eq!(params.row_pitch_alignment, 256);
    }
}
