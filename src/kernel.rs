//! Compute kernels.
//!
//! Kernels are written in WGSL and compiled to SPIR-V with `naga`. The
//! software backend can additionally run host kernels: Rust closures that
//! receive the bound views and constant buffers of a dispatch.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::Mutex;

use crate::backend::{KernelId, SubresourceLayout, ViewDescriptor};
use crate::device::Device;
use crate::error::{ComputeError, ComputeResult};

/// Entry point used when none is given.
pub const DEFAULT_ENTRY_POINT: &str = "main";
/// Target profile used when none is given.
pub const DEFAULT_TARGET_PROFILE: &str = "spv_1_0";

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Compiled kernel bytecode (SPIR-V words) for one compute entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBytecode {
    words: Vec<u32>,
    entry_point: String,
    workgroup_size: [u32; 3],
}

impl KernelBytecode {
    /// Wrap externally produced SPIR-V.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::ArgumentInvalid`] if `words` is not a SPIR-V module.
    pub fn from_words(words: Vec<u32>, entry_point: impl Into<String>) -> ComputeResult<Self> {
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(ComputeError::ArgumentInvalid(
                "kernel bytecode is not a SPIR-V module".into(),
            ));
        }
        Ok(Self {
            words,
            entry_point: entry_point.into(),
            workgroup_size: [1, 1, 1],
        })
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Threads per workgroup declared by the entry point.
    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }
}

/// Parse a target profile such as `spv_1_3` into a SPIR-V language version.
fn parse_target_profile(profile: &str) -> ComputeResult<(u8, u8)> {
    let version = profile
        .strip_prefix("spv_")
        .and_then(|rest| rest.split_once('_'))
        .and_then(|(major, minor)| Some((major.parse::<u8>().ok()?, minor.parse::<u8>().ok()?)));

    match version {
        Some((1, minor)) if minor <= 6 => Ok((1, minor)),
        _ => Err(ComputeError::CompilationFailed(format!(
            "unknown target profile '{profile}' (expected spv_1_0 ... spv_1_6)"
        ))),
    }
}

/// Compile the WGSL file at `path`.
///
/// # Errors
///
/// Returns [`ComputeError::CompilationFailed`] if the file cannot be read or
/// the source does not compile.
pub fn compile_kernel(
    path: impl AsRef<Path>,
    entry_point: &str,
    target_profile: &str,
) -> ComputeResult<KernelBytecode> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|e| {
        ComputeError::CompilationFailed(format!("cannot read {}: {e}", path.display()))
    })?;
    log::debug!("Compiling kernel {} ({entry_point}, {target_profile})", path.display());
    compile_kernel_source(&source, entry_point, target_profile)
}

/// Compile WGSL source held in memory.
///
/// # Errors
///
/// Returns [`ComputeError::CompilationFailed`] on parse or validation errors,
/// an unknown profile, or when `entry_point` is not a compute entry point.
pub fn compile_kernel_source(
    source: &str,
    entry_point: &str,
    target_profile: &str,
) -> ComputeResult<KernelBytecode> {
    let lang_version = parse_target_profile(target_profile)?;

    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        ComputeError::CompilationFailed(format!("WGSL parse error: {e}"))
    })?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator.validate(&module).map_err(|e| {
        ComputeError::CompilationFailed(format!("validation error: {e}"))
    })?;

    let workgroup_size = module
        .entry_points
        .iter()
        .find(|ep| ep.name == entry_point && ep.stage == naga::ShaderStage::Compute)
        .map(|ep| ep.workgroup_size)
        .ok_or_else(|| {
            ComputeError::CompilationFailed(format!(
                "compute entry point '{entry_point}' not found"
            ))
        })?;

    let options = naga::back::spv::Options {
        lang_version,
        flags: naga::back::spv::WriterFlags::empty(),
        ..Default::default()
    };
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga::ShaderStage::Compute,
        entry_point: entry_point.to_string(),
    };

    let words = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| ComputeError::CompilationFailed(format!("SPIR-V generation error: {e}")))?;

    Ok(KernelBytecode {
        words,
        entry_point: entry_point.to_string(),
        workgroup_size,
    })
}

/// Body of a host kernel.
pub type HostKernelFn = dyn Fn(&mut HostInvocation) -> ComputeResult<()> + Send + Sync;

/// What a kernel object is created from.
#[derive(Clone)]
pub enum KernelSource {
    Bytecode(KernelBytecode),
    Host {
        label: String,
        function: Arc<HostKernelFn>,
    },
}

impl fmt::Debug for KernelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSource::Bytecode(bytecode) => f
                .debug_struct("Bytecode")
                .field("entry_point", &bytecode.entry_point)
                .field("words", &bytecode.words.len())
                .finish(),
            KernelSource::Host { label, .. } => {
                f.debug_struct("Host").field("label", label).finish()
            }
        }
    }
}

/// A view bound to a host kernel dispatch.
#[derive(Debug, Clone)]
pub(crate) struct HostBinding {
    pub memory: Arc<Mutex<Vec<u8>>>,
    pub layout: SubresourceLayout,
    pub view: ViewDescriptor,
}

/// Everything a host kernel sees during one dispatch.
#[derive(Debug)]
pub struct HostInvocation {
    group_count: [u32; 3],
    views: BTreeMap<u32, HostBinding>,
    constants: BTreeMap<u32, Vec<u8>>,
}

impl HostInvocation {
    pub(crate) fn new(
        group_count: [u32; 3],
        views: BTreeMap<u32, HostBinding>,
        constants: BTreeMap<u32, Vec<u8>>,
    ) -> Self {
        Self {
            group_count,
            views,
            constants,
        }
    }

    pub fn group_count(&self) -> [u32; 3] {
        self.group_count
    }

    /// Registers with a bound read/write view.
    pub fn view_registers(&self) -> Vec<u32> {
        self.views.keys().copied().collect()
    }

    /// Run `access` with the view bound at `register`.
    ///
    /// # Errors
    ///
    /// Returns [`ComputeError::ArgumentInvalid`] if nothing is bound there.
    pub fn with_view<R>(
        &mut self,
        register: u32,
        access: impl FnOnce(&mut HostView<'_>) -> R,
    ) -> ComputeResult<R> {
        let binding = self.views.get(&register).ok_or_else(|| {
            ComputeError::ArgumentInvalid(format!("no read/write view bound at u{register}"))
        })?;
        let mut memory = binding.memory.lock();
        let mut view = HostView {
            bytes: &mut memory[..],
            layout: binding.layout,
            view: binding.view,
        };
        Ok(access(&mut view))
    }

    /// Read the constant buffer bound at `register` as a `T`.
    pub fn constant<T: Pod>(&self, register: u32) -> ComputeResult<T> {
        let bytes = self.constants.get(&register).ok_or_else(|| {
            ComputeError::ArgumentInvalid(format!("no constant buffer bound at b{register}"))
        })?;
        let size = std::mem::size_of::<T>();
        let bytes = bytes.get(..size).ok_or_else(|| {
            ComputeError::ArgumentInvalid(format!(
                "constant buffer at b{register} holds {} bytes, {size} requested",
                bytes.len()
            ))
        })?;
        Ok(bytemuck::pod_read_unaligned(bytes))
    }
}

/// Memory of one bound view during a host dispatch.
#[derive(Debug)]
pub struct HostView<'a> {
    bytes: &'a mut [u8],
    layout: SubresourceLayout,
    view: ViewDescriptor,
}

impl HostView<'_> {
    pub fn descriptor(&self) -> ViewDescriptor {
        self.view
    }

    pub fn row_pitch(&self) -> usize {
        self.layout.row_pitch
    }

    pub fn slice_pitch(&self) -> usize {
        self.layout.slice_pitch
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }

    /// Element `index` of a buffer view.
    pub fn read<T: Pod>(&self, index: usize) -> Option<T> {
        let size = std::mem::size_of::<T>();
        let start = index.checked_mul(size)?;
        self.bytes
            .get(start..start.checked_add(size)?)
            .map(bytemuck::pod_read_unaligned)
    }

    /// Overwrite element `index` of a buffer view; `false` if out of bounds.
    pub fn write<T: Pod>(&mut self, index: usize, value: T) -> bool {
        let size = std::mem::size_of::<T>();
        let Some(end) = index
            .checked_mul(size)
            .and_then(|start| start.checked_add(size))
        else {
            return false;
        };
        match self.bytes.get_mut(end - size..end) {
            Some(slot) => {
                slot.copy_from_slice(bytemuck::bytes_of(&value));
                true
            }
            None => false,
        }
    }

    /// Texel at (`x`, `y`) of array slice `slice`.
    pub fn read_texel<T: Pod>(&self, x: u32, y: u32, slice: u32) -> Option<T> {
        let start = self.texel_offset::<T>(x, y, slice)?;
        self.bytes
            .get(start..start + std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
    }

    pub fn write_texel<T: Pod>(&mut self, x: u32, y: u32, slice: u32, value: T) -> bool {
        let Some(start) = self.texel_offset::<T>(x, y, slice) else {
            return false;
        };
        match self.bytes.get_mut(start..start + std::mem::size_of::<T>()) {
            Some(slot) => {
                slot.copy_from_slice(bytemuck::bytes_of(&value));
                true
            }
            None => false,
        }
    }

    fn texel_offset<T>(&self, x: u32, y: u32, slice: u32) -> Option<usize> {
        let in_bounds = (x as usize) * self.layout.texel_size < self.layout.row_bytes
            && y < self.layout.rows
            && slice < self.layout.slices
            && std::mem::size_of::<T>() <= self.layout.texel_size;
        in_bounds.then(|| self.layout.offset(slice, y, x))
    }
}

struct KernelInner {
    device: Device,
    id: KernelId,
    label: String,
}

impl Drop for KernelInner {
    fn drop(&mut self) {
        log::trace!("Releasing kernel '{}'", self.label);
        self.device.backend().release_kernel(self.id);
    }
}

/// A kernel object created on one device.
///
/// Cloning is cheap; the native object is released with the last clone.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    pub(crate) fn new(device: Device, id: KernelId, label: String) -> Self {
        Self {
            inner: Arc::new(KernelInner { device, id, label }),
        }
    }

    pub(crate) fn id(&self) -> KernelId {
        self.inner.id
    }

    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("label", &self.inner.label)
            .field("device", &self.inner.device.native_id())
            .finish()
    }
}
