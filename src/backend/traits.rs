//! Core backend abstraction traits
//!
//! These traits define the interface that both the software and wgpu backends must implement.

use std::fmt;

use crate::backend::types::*;
use crate::error::ComputeResult;
use crate::kernel::KernelSource;

/// Handle to a GPU allocation (texture or buffer)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub(crate) u64);

/// Handle to a read/write kernel view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub(crate) u64);

/// Handle to a compiled kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub(crate) u64);

/// Handle to a timing query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(pub(crate) u64);

/// Identity of a native device. Two device handles with the same id form one
/// resource domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeDeviceId(pub(crate) u64);

/// Opaque cross-device reference to an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedHandle(pub(crate) u64);

impl SharedHandle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Native device plus its immediate context.
///
/// All commands issued through one backend device execute in issue order.
/// Nothing orders commands across devices except [`DeviceBackend::flush`].
pub trait DeviceBackend: Send + Sync + fmt::Debug + 'static {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    fn native_id(&self) -> NativeDeviceId;

    fn adapter(&self) -> &AdapterInfo;

    /// Alignment applied to row pitches of mapped staging memory.
    fn row_pitch_alignment(&self) -> usize;

    /// Allocate a resource, optionally initialised with one entry per subresource.
    fn create_resource(
        &self,
        descriptor: &ResourceDescriptor,
        initial_data: &[SubresourceData<'_>],
    ) -> ComputeResult<ResourceId>;

    /// Creation description of a live resource.
    fn describe_resource(&self, resource: ResourceId) -> ComputeResult<ResourceDescriptor>;

    fn release_resource(&self, resource: ResourceId);

    fn create_view(&self, resource: ResourceId, descriptor: &ViewDescriptor)
        -> ComputeResult<ViewId>;

    fn release_view(&self, view: ViewId);

    /// Queue a whole-resource copy.
    fn copy_resource(&self, source: ResourceId, destination: ResourceId) -> ComputeResult<()>;

    /// Queue a copy of `region` (or the whole subresource) between texture subresources.
    fn copy_subresource_region(
        &self,
        source: ResourceId,
        source_subresource: u32,
        region: Option<CopyRegion>,
        destination: ResourceId,
        destination_subresource: u32,
        destination_origin: (u32, u32),
    ) -> ComputeResult<()>;

    /// Queue an overwrite of the entire resource from host memory.
    fn update_resource(&self, destination: ResourceId, data: SubresourceData<'_>)
        -> ComputeResult<()>;

    /// Map a staging resource and hand the mapped memory to `access`.
    ///
    /// Blocks until every previously issued command has completed. The
    /// resource is unmapped when `access` returns or unwinds. `subresource`
    /// selects one array slice; `None` maps the whole resource.
    fn map(
        &self,
        staging: ResourceId,
        subresource: Option<u32>,
        mode: CpuAccessMode,
        access: &mut dyn FnMut(&mut MappedSubresource<'_>),
    ) -> ComputeResult<()>;

    fn export_shared(&self, resource: ResourceId) -> ComputeResult<SharedHandle>;

    /// Open an allocation exported by any device of the same backend.
    fn open_shared(&self, handle: SharedHandle) -> ComputeResult<ResourceId>;

    fn create_kernel(&self, source: &KernelSource) -> ComputeResult<KernelId>;

    fn release_kernel(&self, kernel: KernelId);

    /// Queue a kernel dispatch with the given bindings.
    fn dispatch(&self, dispatch: &DispatchDescriptor) -> ComputeResult<()>;

    fn create_query(&self, kind: QueryKind) -> ComputeResult<QueryId>;

    fn begin_query(&self, query: QueryId) -> ComputeResult<()>;

    fn end_query(&self, query: QueryId) -> ComputeResult<()>;

    /// Query result, or `None` while the GPU has not reached the query yet.
    fn query_data(&self, query: QueryId) -> ComputeResult<Option<QueryData>>;

    fn release_query(&self, query: QueryId);

    /// Submit every queued command. Other devices observe the results of
    /// work issued before the flush on their next access.
    fn flush(&self);
}
