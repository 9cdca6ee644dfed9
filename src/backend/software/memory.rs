//! Allocations of the software backend and the process-wide shared handle table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::backend::types::{
    copy_pitched, CopyRegion, Pitched, ResourceDescriptor, SubresourceData, SubresourceLayout,
};
use crate::backend::SharedHandle;
use crate::error::{ComputeError, ComputeResult};

/// Memory of one resource plus the description it was created with.
///
/// Aliases opened through a shared handle hold the same `Arc<Allocation>`.
#[derive(Debug)]
pub(super) struct Allocation {
    pub descriptor: ResourceDescriptor,
    pub layout: SubresourceLayout,
    pub bytes: Arc<Mutex<Vec<u8>>>,
    shared_handle: Mutex<Option<SharedHandle>>,
}

impl Allocation {
    pub fn new(
        descriptor: ResourceDescriptor,
        row_alignment: usize,
        initial_data: &[SubresourceData<'_>],
    ) -> ComputeResult<Arc<Self>> {
        let layout = SubresourceLayout::for_dimension(&descriptor.dimension, row_alignment);
        let mut bytes = vec![0u8; layout.total_size()];

        if !initial_data.is_empty() {
            let slices = descriptor.dimension.subresource_count() as usize;
            if initial_data.len() != slices {
                return Err(ComputeError::ArgumentInvalid(format!(
                    "{} initial subresources supplied for a resource with {slices}",
                    initial_data.len()
                )));
            }
            for (slice, data) in initial_data.iter().enumerate() {
                copy_pitched(
                    data.bytes,
                    Pitched {
                        offset: 0,
                        row_pitch: data.row_pitch,
                        slice_pitch: data.slice_pitch,
                    },
                    &mut bytes,
                    Pitched {
                        offset: slice * layout.slice_pitch,
                        row_pitch: layout.row_pitch,
                        slice_pitch: layout.slice_pitch,
                    },
                    layout.row_bytes,
                    layout.rows,
                    1,
                )
                .map_err(|e| {
                    ComputeError::ArgumentInvalid(format!("initial data for slice {slice}: {e}"))
                })?;
            }
        }

        Ok(Arc::new(Self {
            descriptor,
            layout,
            bytes: Arc::new(Mutex::new(bytes)),
            shared_handle: Mutex::new(None),
        }))
    }

    pub fn aliases(&self, other: &Allocation) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

/// Lock two distinct allocations in address order so concurrent copies in
/// opposite directions cannot deadlock.
fn lock_pair<'a>(
    source: &'a Allocation,
    destination: &'a Allocation,
) -> (MutexGuard<'a, Vec<u8>>, MutexGuard<'a, Vec<u8>>) {
    let source_first = Arc::as_ptr(&source.bytes) < Arc::as_ptr(&destination.bytes);
    if source_first {
        let src = source.bytes.lock();
        let dst = destination.bytes.lock();
        (src, dst)
    } else {
        let dst = destination.bytes.lock();
        let src = source.bytes.lock();
        (src, dst)
    }
}

/// Copy every row of `source` into `destination`.
pub(super) fn copy_whole(source: &Allocation, destination: &Allocation) -> ComputeResult<()> {
    if source.aliases(destination) {
        return Ok(());
    }
    let (src, mut dst) = lock_pair(source, destination);
    if source.layout == destination.layout {
        dst.copy_from_slice(&src);
        return Ok(());
    }
    let (s, d) = (source.layout, destination.layout);
    copy_pitched(
        &src,
        Pitched {
            offset: 0,
            row_pitch: s.row_pitch,
            slice_pitch: s.slice_pitch,
        },
        &mut dst,
        Pitched {
            offset: 0,
            row_pitch: d.row_pitch,
            slice_pitch: d.slice_pitch,
        },
        s.row_bytes.min(d.row_bytes),
        s.rows.min(d.rows),
        s.slices.min(d.slices),
    )
}

/// Copy a rectangle between texture slices.
pub(super) fn copy_region(
    source: &Allocation,
    source_slice: u32,
    region: CopyRegion,
    destination: &Allocation,
    destination_slice: u32,
    origin: (u32, u32),
) -> ComputeResult<()> {
    let (s, d) = (source.layout, destination.layout);
    let row_bytes = region.width as usize * s.texel_size;
    let src_pitched = Pitched {
        offset: s.offset(source_slice, region.y, region.x),
        row_pitch: s.row_pitch,
        slice_pitch: s.slice_pitch,
    };
    let dst_pitched = Pitched {
        offset: d.offset(destination_slice, origin.1, origin.0),
        row_pitch: d.row_pitch,
        slice_pitch: d.slice_pitch,
    };

    if source.aliases(destination) {
        // Same memory: stage through a temporary so overlapping rows stay intact.
        let mut bytes = source.bytes.lock();
        let snapshot = bytes.clone();
        return copy_pitched(
            &snapshot,
            src_pitched,
            &mut bytes,
            dst_pitched,
            row_bytes,
            region.height,
            1,
        );
    }

    let (src, mut dst) = lock_pair(source, destination);
    copy_pitched(
        &src,
        src_pitched,
        &mut dst,
        dst_pitched,
        row_bytes,
        region.height,
        1,
    )
}

/// Overwrite every row of `destination` from host data.
pub(super) fn write_host_data(
    destination: &Allocation,
    data: &[u8],
    row_pitch: usize,
    slice_pitch: usize,
) -> ComputeResult<()> {
    let layout = destination.layout;
    let mut bytes = destination.bytes.lock();
    copy_pitched(
        data,
        Pitched {
            offset: 0,
            row_pitch,
            slice_pitch,
        },
        &mut bytes,
        Pitched {
            offset: 0,
            row_pitch: layout.row_pitch,
            slice_pitch: layout.slice_pitch,
        },
        layout.row_bytes,
        layout.rows,
        layout.slices,
    )
}

fn shared_table() -> &'static Mutex<HashMap<u64, Weak<Allocation>>> {
    static TABLE: OnceLock<Mutex<HashMap<u64, Weak<Allocation>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

static NEXT_SHARED_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Publish `allocation` under a shared handle; exporting twice yields the same handle.
pub(super) fn export(allocation: &Arc<Allocation>) -> SharedHandle {
    let mut slot = allocation.shared_handle.lock();
    if let Some(handle) = *slot {
        return handle;
    }
    let handle = SharedHandle(NEXT_SHARED_HANDLE.fetch_add(1, Ordering::Relaxed));
    let mut table = shared_table().lock();
    table.retain(|_, weak| weak.strong_count() > 0);
    table.insert(handle.0, Arc::downgrade(allocation));
    *slot = Some(handle);
    handle
}

/// Resolve a shared handle to the live allocation behind it.
pub(super) fn open(handle: SharedHandle) -> ComputeResult<Arc<Allocation>> {
    shared_table()
        .lock()
        .get(&handle.0)
        .and_then(Weak::upgrade)
        .ok_or_else(|| {
            ComputeError::ArgumentInvalid(format!(
                "shared handle {:#x} does not refer to a live allocation",
                handle.0
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::ResourceDimension;
    use crate::format::TextureFormat;

    fn texture(width: u32, height: u32, slices: u32) -> ResourceDescriptor {
        ResourceDescriptor::new(ResourceDimension::Texture2D {
            width,
            height,
            array_size: slices,
            format: TextureFormat::R8G8B8A8Unorm,
        })
    }

    #[test]
    fn test_initial_data_is_laid_out_by_pitch() {
        let data: Vec<u8> = (0..24).collect();
        let desc = texture(3, 2, 1);
        let allocation = Allocation::new(
            desc.clone(),
            16,
            &[SubresourceData::tight(&data, &desc.dimension)],
        )
        .unwrap();

        let bytes = allocation.bytes.lock();
        assert_eq!(bytes.len(), 32);
        assert_eq!(&bytes[..12], &data[..12]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
        assert_eq!(&bytes[16..28], &data[12..24]);
    }

    #[test]
    fn test_initial_data_must_cover_every_slice() {
        let data = vec![0u8; 64];
        let desc = texture(4, 4, 2);
        let result = Allocation::new(desc.clone(), 16, &[SubresourceData::tight(&data, &desc.dimension)]);
        assert!(matches!(result, Err(ComputeError::ArgumentInvalid(_))));
    }

    #[test]
    fn test_copy_between_layouts() {
        let data: Vec<u8> = (0..24).collect();
        let desc = texture(3, 2, 1);
        let init = [SubresourceData::tight(&data, &desc.dimension)];
        let narrow = Allocation::new(desc.clone(), 16, &init).unwrap();
        let wide = Allocation::new(desc, 256, &[]).unwrap();

        copy_whole(&narrow, &wide).unwrap();
        let bytes = wide.bytes.lock();
        assert_eq!(&bytes[..12], &data[..12]);
        assert_eq!(&bytes[256..268], &data[12..24]);
    }

    #[test]
    fn test_region_copy_within_one_allocation() {
        let data: Vec<u8> = (0..64).collect();
        let desc = texture(4, 4, 1);
        let allocation =
            Allocation::new(desc.clone(), 16, &[SubresourceData::tight(&data, &desc.dimension)])
                .unwrap();

        copy_region(&allocation, 0, CopyRegion::new(0, 0, 2, 1), &allocation, 0, (1, 0)).unwrap();
        let bytes = allocation.bytes.lock();
        assert_eq!(&bytes[4..12], &data[0..8]);
    }

    #[test]
    fn test_shared_handles() {
        let allocation = Allocation::new(texture(4, 4, 1), 16, &[]).unwrap();
        let handle = export(&allocation);
        assert_eq!(export(&allocation), handle);

        let opened = open(handle).unwrap();
        assert!(opened.aliases(&allocation));

        drop(opened);
        drop(allocation);
        assert!(open(handle).is_err());
    }
}
