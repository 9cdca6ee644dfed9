//! Software backend implementation
//!
//! An in-process device: allocations are host memory laid out with the
//! native row pitch rules, and every command goes through a per-device queue
//! that is executed in issue order. The queue is drained on `flush`, on every
//! map, when query results are read, and when the device is dropped, which
//! gives shared allocations the same visibility rules as a real GPU: another
//! device sees a write only after the writer flushes.

mod memory;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::config::DeviceCreationFlags;
use crate::error::{ComputeError, ComputeResult};
use crate::kernel::{HostBinding, HostInvocation, HostKernelFn, KernelSource};

use memory::Allocation;

/// Maximum thread groups per dispatch dimension.
pub const MAX_DISPATCH_GROUPS: u32 = 65535;

/// Adapters exposed by the software backend.
pub fn adapters(count: usize) -> Vec<AdapterInfo> {
    (0..count)
        .map(|index| AdapterInfo {
            name: format!("Software Adapter {index}"),
            vendor: "gpu-compute".to_string(),
            device_type: AdapterType::Software,
        })
        .collect()
}

/// Queued backend command; executed when the device queue drains.
enum Command {
    Copy {
        source: Arc<Allocation>,
        destination: Arc<Allocation>,
    },
    CopyRegion {
        source: Arc<Allocation>,
        source_slice: u32,
        region: CopyRegion,
        destination: Arc<Allocation>,
        destination_slice: u32,
        origin: (u32, u32),
    },
    Update {
        destination: Arc<Allocation>,
        data: Vec<u8>,
        row_pitch: usize,
        slice_pitch: usize,
    },
    Dispatch {
        label: String,
        function: Option<Arc<HostKernelFn>>,
        views: BTreeMap<u32, HostBinding>,
        constants: BTreeMap<u32, Arc<Allocation>>,
        group_count: [u32; 3],
    },
    Timestamp {
        result: Arc<Mutex<Option<QueryData>>>,
    },
    Disjoint {
        result: Arc<Mutex<Option<QueryData>>>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Copy { .. } => "CopyResource",
            Command::CopyRegion { .. } => "CopySubresourceRegion",
            Command::Update { .. } => "UpdateSubresource",
            Command::Dispatch { .. } => "Dispatch",
            Command::Timestamp { .. } => "Timestamp",
            Command::Disjoint { .. } => "TimestampDisjoint",
        }
    }
}

struct ViewEntry {
    allocation: Arc<Allocation>,
    descriptor: ViewDescriptor,
}

struct KernelEntry {
    label: String,
    function: Option<Arc<HostKernelFn>>,
}

struct QueryEntry {
    kind: QueryKind,
    active: bool,
    result: Arc<Mutex<Option<QueryData>>>,
}

#[derive(Default)]
struct Tables {
    resources: HashMap<u64, Arc<Allocation>>,
    views: HashMap<u64, ViewEntry>,
    kernels: HashMap<u64, KernelEntry>,
    queries: HashMap<u64, QueryEntry>,
    next_id: u64,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn resource(&self, id: ResourceId) -> ComputeResult<Arc<Allocation>> {
        self.resources.get(&id.0).cloned().ok_or_else(|| {
            ComputeError::ArgumentInvalid(format!("unknown resource handle {}", id.0))
        })
    }
}

/// Software device: one native device plus its immediate context.
pub struct SoftwareDevice {
    id: NativeDeviceId,
    adapter: AdapterInfo,
    row_alignment: usize,
    diagnostics: bool,
    epoch: Instant,
    tables: Mutex<Tables>,
    queue: Mutex<VecDeque<Command>>,
    executor: Mutex<()>,
    /// First queued command that failed since the last map.
    failure: Mutex<Option<ComputeError>>,
}

impl SoftwareDevice {
    pub fn new(adapter: AdapterInfo, row_alignment: usize, flags: DeviceCreationFlags) -> Self {
        let id = super::next_native_device_id();
        log::debug!(
            "SoftwareDevice {}: created on '{}' (row pitch alignment {row_alignment})",
            id.0,
            adapter.name
        );
        Self {
            id,
            adapter,
            row_alignment: row_alignment.max(1),
            diagnostics: flags.wants_diagnostics(),
            epoch: Instant::now(),
            tables: Mutex::new(Tables::default()),
            queue: Mutex::new(VecDeque::new()),
            executor: Mutex::new(()),
            failure: Mutex::new(None),
        }
    }

    fn enqueue(&self, command: Command) {
        log::trace!("SoftwareDevice {}: queued {}", self.id.0, command.name());
        self.queue.lock().push_back(command);
    }

    /// Execute every queued command in issue order.
    fn drain(&self) {
        let _executing = self.executor.lock();
        loop {
            let Some(command) = self.queue.lock().pop_front() else {
                break;
            };
            let name = command.name();
            if self.diagnostics {
                log::debug!("SoftwareDevice {}: executing {name}", self.id.0);
            }
            if let Err(e) = self.execute(command) {
                log::error!("SoftwareDevice {}: {name} failed: {e}", self.id.0);
                self.failure.lock().get_or_insert(e);
            }
        }
    }

    /// Drain the queue and report the first command that failed since the
    /// previous report.
    fn drain_checked(&self) -> ComputeResult<()> {
        self.drain();
        match self.failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn execute(&self, command: Command) -> ComputeResult<()> {
        match command {
            Command::Copy {
                source,
                destination,
            } => memory::copy_whole(&source, &destination),
            Command::CopyRegion {
                source,
                source_slice,
                region,
                destination,
                destination_slice,
                origin,
            } => memory::copy_region(
                &source,
                source_slice,
                region,
                &destination,
                destination_slice,
                origin,
            ),
            Command::Update {
                destination,
                data,
                row_pitch,
                slice_pitch,
            } => memory::write_host_data(&destination, &data, row_pitch, slice_pitch),
            Command::Dispatch {
                label,
                function,
                views,
                constants,
                group_count,
            } => {
                let Some(function) = function else {
                    log::trace!(
                        "SoftwareDevice {}: recorded dispatch of '{label}' {group_count:?}",
                        self.id.0
                    );
                    return Ok(());
                };
                let constants = constants
                    .into_iter()
                    .map(|(register, allocation)| {
                        let bytes = allocation.bytes.lock();
                        (register, bytes[..allocation.layout.row_bytes].to_vec())
                    })
                    .collect();
                let mut invocation = HostInvocation::new(group_count, views, constants);
                (*function)(&mut invocation)
            }
            Command::Timestamp { result } => {
                let ticks = self.epoch.elapsed().as_nanos() as u64;
                *result.lock() = Some(QueryData::Timestamp(ticks));
                Ok(())
            }
            Command::Disjoint { result } => {
                *result.lock() = Some(QueryData::TimestampDisjoint {
                    frequency: 1_000_000_000,
                    disjoint: false,
                });
                Ok(())
            }
        }
    }

    fn texture_extent(allocation: &Allocation) -> ComputeResult<(u32, u32, u32)> {
        match allocation.descriptor.dimension {
            ResourceDimension::Texture2D {
                width,
                height,
                array_size,
                ..
            } => Ok((width, height, array_size)),
            ResourceDimension::Buffer { .. } => Err(ComputeError::IncompatibleResource(
                "region copies require textures".into(),
            )),
        }
    }
}

impl fmt::Debug for SoftwareDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareDevice")
            .field("id", &self.id)
            .field("adapter", &self.adapter.name)
            .field("row_alignment", &self.row_alignment)
            .field("pending", &self.queue.lock().len())
            .finish_non_exhaustive()
    }
}

impl Drop for SoftwareDevice {
    fn drop(&mut self) {
        self.drain();
        log::debug!("SoftwareDevice {}: destroyed", self.id.0);
    }
}

impl DeviceBackend for SoftwareDevice {
    fn name(&self) -> &'static str {
        "Software"
    }

    fn native_id(&self) -> NativeDeviceId {
        self.id
    }

    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn row_pitch_alignment(&self) -> usize {
        self.row_alignment
    }

    fn create_resource(
        &self,
        descriptor: &ResourceDescriptor,
        initial_data: &[SubresourceData<'_>],
    ) -> ComputeResult<ResourceId> {
        descriptor.validate()?;
        let allocation = Allocation::new(descriptor.clone(), self.row_alignment, initial_data)?;

        let mut tables = self.tables.lock();
        let id = tables.allocate_id();
        log::trace!(
            "SoftwareDevice {}: creating resource {id} {:?} ({:?}, {} bytes)",
            self.id.0,
            descriptor.label,
            descriptor.usage,
            allocation.layout.total_size()
        );
        tables.resources.insert(id, allocation);
        Ok(ResourceId(id))
    }

    fn describe_resource(&self, resource: ResourceId) -> ComputeResult<ResourceDescriptor> {
        Ok(self.tables.lock().resource(resource)?.descriptor.clone())
    }

    fn release_resource(&self, resource: ResourceId) {
        let removed = self.tables.lock().resources.remove(&resource.0);
        debug_assert!(removed.is_some(), "resource {} released twice", resource.0);
        log::trace!("SoftwareDevice {}: released resource {}", self.id.0, resource.0);
    }

    fn create_view(
        &self,
        resource: ResourceId,
        descriptor: &ViewDescriptor,
    ) -> ComputeResult<ViewId> {
        let mut tables = self.tables.lock();
        let allocation = tables.resource(resource)?;
        descriptor.validate_against(&allocation.descriptor)?;
        let id = tables.allocate_id();
        tables.views.insert(
            id,
            ViewEntry {
                allocation,
                descriptor: *descriptor,
            },
        );
        Ok(ViewId(id))
    }

    fn release_view(&self, view: ViewId) {
        let removed = self.tables.lock().views.remove(&view.0);
        debug_assert!(removed.is_some(), "view {} released twice", view.0);
    }

    fn copy_resource(&self, source: ResourceId, destination: ResourceId) -> ComputeResult<()> {
        if source == destination {
            return Err(ComputeError::ArgumentInvalid(
                "source and destination are the same resource".into(),
            ));
        }
        let (source, destination) = {
            let tables = self.tables.lock();
            (tables.resource(source)?, tables.resource(destination)?)
        };
        if !source
            .descriptor
            .dimension
            .is_copy_compatible(&destination.descriptor.dimension)
        {
            return Err(ComputeError::IncompatibleResource(format!(
                "cannot copy {:?} into {:?}",
                source.descriptor.dimension, destination.descriptor.dimension
            )));
        }
        self.enqueue(Command::Copy {
            source,
            destination,
        });
        Ok(())
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
        let (source, destination) = {
            let tables = self.tables.lock();
            (tables.resource(source)?, tables.resource(destination)?)
        };
        let (src_width, src_height, src_slices) = Self::texture_extent(&source)?;
        let (dst_width, dst_height, dst_slices) = Self::texture_extent(&destination)?;

        if source_subresource >= src_slices || destination_subresource >= dst_slices {
            return Err(ComputeError::OutOfRange(format!(
                "subresources {source_subresource} -> {destination_subresource} exceed {src_slices} / {dst_slices} slices"
            )));
        }
        let (src_format, dst_format) = (
            source.descriptor.dimension.format(),
            destination.descriptor.dimension.format(),
        );
        match (src_format, dst_format) {
            (Some(a), Some(b)) if a.is_copy_compatible(b) => {}
            _ => {
                return Err(ComputeError::IncompatibleResource(format!(
                    "formats {src_format:?} and {dst_format:?} are not copy compatible"
                )))
            }
        }

        let region = region.unwrap_or_else(|| CopyRegion::full(src_width, src_height));
        if !region.fits_within(src_width, src_height) {
            return Err(ComputeError::OutOfRange(format!(
                "source region {region:?} exceeds {src_width}x{src_height}"
            )));
        }
        let (dst_x, dst_y) = destination_origin;
        let placed = CopyRegion::new(dst_x, dst_y, region.width, region.height);
        if !placed.fits_within(dst_width, dst_height) {
            return Err(ComputeError::OutOfRange(format!(
                "destination region {placed:?} exceeds {dst_width}x{dst_height}"
            )));
        }

        self.enqueue(Command::CopyRegion {
            source,
            source_slice: source_subresource,
            region,
            destination,
            destination_slice: destination_subresource,
            origin: destination_origin,
        });
        Ok(())
    }

    fn update_resource(
        &self,
        destination: ResourceId,
        data: SubresourceData<'_>,
    ) -> ComputeResult<()> {
        let destination = self.tables.lock().resource(destination)?;
        if destination.descriptor.usage != ResourceUsage::Default {
            return Err(ComputeError::ArgumentInvalid(
                "only default usage resources can be updated directly".into(),
            ));
        }
        let layout = destination.layout;
        let needed = (layout.slices as usize - 1) * data.slice_pitch
            + (layout.rows as usize - 1) * data.row_pitch
            + layout.row_bytes;
        let bytes = data.bytes.get(..needed).ok_or_else(|| {
            ComputeError::ArgumentInvalid(format!(
                "update needs {needed} bytes, {} supplied",
                data.bytes.len()
            ))
        })?;
        self.enqueue(Command::Update {
            destination,
            data: bytes.to_vec(),
            row_pitch: data.row_pitch,
            slice_pitch: data.slice_pitch,
        });
        Ok(())
    }

    fn map(
        &self,
        staging: ResourceId,
        subresource: Option<u32>,
        mode: CpuAccessMode,
        access: &mut dyn FnMut(&mut MappedSubresource<'_>),
    ) -> ComputeResult<()> {
        let allocation = self.tables.lock().resource(staging)?;
        let descriptor = &allocation.descriptor;
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

        let layout = allocation.layout;
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
            None => 0..layout.total_size(),
        };

        // Mapping waits for every earlier command, like a blocking native map.
        self.drain_checked()?;

        let mut bytes = allocation.bytes.lock();
        let mut mapped =
            MappedSubresource::new(&mut bytes[range], layout.row_pitch, layout.slice_pitch, mode);
        access(&mut mapped);
        Ok(())
    }

    fn export_shared(&self, resource: ResourceId) -> ComputeResult<SharedHandle> {
        let allocation = self.tables.lock().resource(resource)?;
        if allocation.descriptor.usage != ResourceUsage::Default {
            return Err(ComputeError::ArgumentInvalid(
                "staging resources cannot be shared".into(),
            ));
        }
        let handle = memory::export(&allocation);
        log::trace!(
            "SoftwareDevice {}: exported resource {} as {:#x}",
            self.id.0,
            resource.0,
            handle.0
        );
        Ok(handle)
    }

    fn open_shared(&self, handle: SharedHandle) -> ComputeResult<ResourceId> {
        let allocation = memory::open(handle)?;
        let mut tables = self.tables.lock();
        let id = tables.allocate_id();
        tables.resources.insert(id, allocation);
        log::trace!(
            "SoftwareDevice {}: opened {:#x} as resource {id}",
            self.id.0,
            handle.0
        );
        Ok(ResourceId(id))
    }

    fn create_kernel(&self, source: &KernelSource) -> ComputeResult<KernelId> {
        let entry = match source {
            KernelSource::Bytecode(bytecode) => KernelEntry {
                label: bytecode.entry_point().to_string(),
                function: None,
            },
            KernelSource::Host { label, function } => KernelEntry {
                label: label.clone(),
                function: Some(Arc::clone(function)),
            },
        };
        let mut tables = self.tables.lock();
        let id = tables.allocate_id();
        log::trace!("SoftwareDevice {}: creating kernel '{}'", self.id.0, entry.label);
        tables.kernels.insert(id, entry);
        Ok(KernelId(id))
    }

    fn release_kernel(&self, kernel: KernelId) {
        let removed = self.tables.lock().kernels.remove(&kernel.0);
        debug_assert!(removed.is_some(), "kernel {} released twice", kernel.0);
    }

    fn dispatch(&self, dispatch: &DispatchDescriptor) -> ComputeResult<()> {
        if dispatch
            .group_count
            .iter()
            .any(|&count| count > MAX_DISPATCH_GROUPS)
        {
            return Err(ComputeError::OutOfRange(format!(
                "group count {:?} exceeds {MAX_DISPATCH_GROUPS} per dimension",
                dispatch.group_count
            )));
        }

        let tables = self.tables.lock();
        let kernel = tables.kernels.get(&dispatch.kernel.0).ok_or_else(|| {
            ComputeError::ArgumentInvalid(format!("unknown kernel handle {}", dispatch.kernel.0))
        })?;

        let mut views = BTreeMap::new();
        for &(register, view) in &dispatch.views {
            let entry = tables.views.get(&view.0).ok_or_else(|| {
                ComputeError::ArgumentInvalid(format!("unknown view handle {}", view.0))
            })?;
            views.insert(
                register,
                HostBinding {
                    memory: Arc::clone(&entry.allocation.bytes),
                    layout: entry.allocation.layout,
                    view: entry.descriptor,
                },
            );
        }

        let mut constants = BTreeMap::new();
        for &(register, buffer) in &dispatch.constant_buffers {
            let allocation = tables.resource(buffer)?;
            if !allocation.descriptor.bind.contains(BindFlags::CONSTANT_BUFFER) {
                return Err(ComputeError::IncompatibleResource(format!(
                    "resource bound at b{register} is not a constant buffer"
                )));
            }
            constants.insert(register, allocation);
        }

        let command = Command::Dispatch {
            label: kernel.label.clone(),
            function: kernel.function.clone(),
            views,
            constants,
            group_count: dispatch.group_count,
        };
        drop(tables);
        self.enqueue(command);
        Ok(())
    }

    fn create_query(&self, kind: QueryKind) -> ComputeResult<QueryId> {
        let mut tables = self.tables.lock();
        let id = tables.allocate_id();
        tables.queries.insert(
            id,
            QueryEntry {
                kind,
                active: false,
                result: Arc::new(Mutex::new(None)),
            },
        );
        Ok(QueryId(id))
    }

    fn begin_query(&self, query: QueryId) -> ComputeResult<()> {
        let mut tables = self.tables.lock();
        let entry = tables
            .queries
            .get_mut(&query.0)
            .ok_or_else(|| ComputeError::ArgumentInvalid(format!("unknown query {}", query.0)))?;
        if entry.kind == QueryKind::Timestamp {
            return Err(ComputeError::ArgumentInvalid(
                "timestamp queries are only ended, never begun".into(),
            ));
        }
        entry.active = true;
        *entry.result.lock() = None;
        Ok(())
    }

    fn end_query(&self, query: QueryId) -> ComputeResult<()> {
        let mut tables = self.tables.lock();
        let entry = tables
            .queries
            .get_mut(&query.0)
            .ok_or_else(|| ComputeError::ArgumentInvalid(format!("unknown query {}", query.0)))?;
        let result = Arc::clone(&entry.result);
        *result.lock() = None;
        let command = match entry.kind {
            QueryKind::Timestamp => Command::Timestamp { result },
            QueryKind::TimestampDisjoint => {
                if !entry.active {
                    return Err(ComputeError::ArgumentInvalid(
                        "disjoint query ended without being begun".into(),
                    ));
                }
                entry.active = false;
                Command::Disjoint { result }
            }
        };
        drop(tables);
        self.enqueue(command);
        Ok(())
    }

    fn query_data(&self, query: QueryId) -> ComputeResult<Option<QueryData>> {
        let result = {
            let tables = self.tables.lock();
            let entry = tables.queries.get(&query.0).ok_or_else(|| {
                ComputeError::ArgumentInvalid(format!("unknown query {}", query.0))
            })?;
            Arc::clone(&entry.result)
        };
        self.drain();
        let data = *result.lock();
        Ok(data)
    }

    fn release_query(&self, query: QueryId) {
        let removed = self.tables.lock().queries.remove(&query.0);
        debug_assert!(removed.is_some(), "query {} released twice", query.0);
    }

    fn flush(&self) {
        log::trace!("SoftwareDevice {}: flush", self.id.0);
        self.drain();
    }
}
