//! Integration tests for the compute resource layer.
//!
//! Each test is parameterised with `rstest` over the backends in
//! [`common::Backend`]. Backends that are not compiled in are skipped.
//!
//! # Test Categories
//!
//! - **CPU access**: staging mirror lifecycle and mapped round trips
//! - **Copies**: whole-resource and region copies, bounds checking
//! - **Sharing**: share, write, flush, read across devices; CPU-mediated
//!   region and slice copies between devices
//! - **Kernels**: bind and dispatch end to end
//!
//! ```bash
//! cargo test --test compute_tests
//! cargo test --test compute_tests --features wgpu-backend
//! ```

mod common;

use rstest::rstest;

use common::{generate_test_pattern, read_tight, write_tight, Backend};
use gpu_compute::{
    compile_kernel_source, ComputeError, CpuAccessMode, KernelBindings, StructuredBuffer,
    TextureFormat,
};

// ============================================================================
// CPU Access
// ============================================================================

/// Enabling then disabling CPU access drops the staging mirror.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_cpu_access_disable_drops_mirror(#[case] backend: Backend) {
    let Some(device) = backend.device(0) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let mut texture = device
        .create_texture2d(8, 8, TextureFormat::R8G8B8A8Unorm)
        .unwrap();
    assert!(matches!(
        texture.access_raw_data(CpuAccessMode::Read, |_| ()),
        Err(ComputeError::CpuAccessDisabled)
    ));

    texture.enable_cpu_access().unwrap();
    assert!(texture.is_cpu_access_enabled());
    texture.disable_cpu_access();
    assert!(!texture.is_cpu_access_enabled());
    assert!(matches!(
        texture.access_raw_data(CpuAccessMode::Write, |_| ()),
        Err(ComputeError::CpuAccessDisabled)
    ));
}

/// A pattern written through a mapping reads back unchanged.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_cpu_access_round_trip(#[case] backend: Backend) {
    let Some(device) = backend.device(0) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    // 5 texels per row forces row padding on every backend.
    let mut texture = device
        .create_texture2d(5, 7, TextureFormat::R8G8B8A8Unorm)
        .unwrap();
    texture.enable_cpu_access().unwrap();
    assert_eq!(texture.resource_size(), 5 * 7 * 4);

    let pattern = generate_test_pattern(texture.resource_size() as usize);
    write_tight(&mut texture, &pattern);
    assert_eq!(read_tight(&mut texture), pattern);

    let mut array = device
        .create_texture2d_array(4, 4, 3, TextureFormat::R32Float)
        .unwrap();
    array.enable_cpu_access().unwrap();
    let pattern = generate_test_pattern(array.resource_size() as usize);
    write_tight(&mut array, &pattern);
    assert_eq!(read_tight(&mut array), pattern);
}

/// StructuredBuffer set then get returns the same elements.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_structured_buffer_set_get(#[case] backend: Backend) {
    let Some(device) = backend.device(0) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let mut buffer = device.create_structured_buffer_zeroed::<[f32; 4]>(8).unwrap();
    buffer.enable_cpu_access().unwrap();
    assert_eq!(buffer.stride(), 16);

    let data: Vec<[f32; 4]> = (0..8)
        .map(|i| {
            let i = i as f32;
            [i, i * 0.5, -i, 1.0]
        })
        .collect();
    buffer.set_data(&data).unwrap();

    let mut result = vec![[0.0f32; 4]; 8];
    buffer.get_data(&mut result).unwrap();
    assert_eq!(result, data);

    let mut short = vec![[0.0f32; 4]; 7];
    assert!(matches!(
        buffer.get_data(&mut short),
        Err(ComputeError::ArgumentInvalid(_))
    ));
}

// ============================================================================
// Copies
// ============================================================================

/// Copying twice gives the same destination as copying once.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_copy_resource_idempotent(#[case] backend: Backend) {
    let Some(device) = backend.device(0) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let pattern = generate_test_pattern(16 * 16 * 4);
    let source = device
        .create_texture2d_with_data(16, 16, TextureFormat::R8G8B8A8Unorm, &pattern)
        .unwrap();
    let mut dest = device
        .create_texture2d(16, 16, TextureFormat::R8G8B8A8Unorm)
        .unwrap();
    dest.enable_cpu_access().unwrap();

    source.copy_resource(&mut dest).unwrap();
    let once = read_tight(&mut dest);
    source.copy_resource(&mut dest).unwrap();
    let twice = read_tight(&mut dest);

    assert_eq!(once, pattern);
    assert_eq!(twice, once);
}

/// A region leaving the source texture is rejected before any copy happens.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_region_copy_out_of_bounds(#[case] backend: Backend) {
    let Some(device) = backend.device(0) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let mut source = device
        .create_texture2d(64, 64, TextureFormat::R8G8B8A8Unorm)
        .unwrap();
    let mut dest = device
        .create_texture2d(64, 64, TextureFormat::R8G8B8A8Unorm)
        .unwrap();

    let result = source.copy_region_to(&mut dest, 60, 60, 0, 0, 10, 10);
    assert!(matches!(result, Err(ComputeError::OutOfRange(_))));

    assert!(source.copy_region_to(&mut dest, 54, 54, 0, 0, 10, 10).is_ok());
}

/// Constant buffers must be a multiple of 16 bytes.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_constant_buffer_sizing(#[case] backend: Backend) {
    let Some(device) = backend.device(0) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    assert!(matches!(
        device.create_constant_buffer(&[0u32; 5]),
        Err(ComputeError::ResourceCreationFailed(_))
    ));
    let mut constants = device.create_constant_buffer(&[0u32; 8]).unwrap();
    assert_eq!(constants.size(), 32);
    constants.update(&[7u32; 8]).unwrap();
}

// ============================================================================
// Sharing
// ============================================================================

/// A write on one device is visible through the shared resource after a flush.
///
/// Reading without the flush is unspecified, so only the flushed order is checked.
#[rstest]
#[case::software(Backend::Software)]
fn test_share_write_flush_read(#[case] backend: Backend) {
    let (Some(first), Some(second)) = (backend.device(0), backend.device(1)) else {
        eprintln!("Backend {:?} has fewer than two adapters, skipping", backend);
        return;
    };
    assert!(!first.same_domain(&second));

    let mut original = first
        .create_texture2d(8, 4, TextureFormat::R8G8B8A8Unorm)
        .unwrap();
    original.enable_cpu_access().unwrap();
    let mut shared = original.share(&second).unwrap();
    shared.enable_cpu_access().unwrap();
    assert!(!shared.same_native_resource(&original));

    let pattern = generate_test_pattern(8 * 4 * 4);
    write_tight(&mut original, &pattern);
    first.flush();

    assert_eq!(read_tight(&mut shared), pattern);
}

/// Structured buffers enable CPU access when shared, and cross-device copies
/// go through both staging mirrors.
#[rstest]
#[case::software(Backend::Software)]
fn test_share_structured_buffer(#[case] backend: Backend) {
    let (Some(first), Some(second)) = (backend.device(0), backend.device(1)) else {
        eprintln!("Backend {:?} has fewer than two adapters, skipping", backend);
        return;
    };

    let buffer = first.create_structured_buffer(&[5u32, 6, 7, 8]).unwrap();
    let mut shared = buffer.share(&second).unwrap();
    assert!(shared.is_cpu_access_enabled());
    assert_eq!(shared.to_vec().unwrap(), vec![5, 6, 7, 8]);

    let mut local = second.create_structured_buffer(&[0u32; 4]).unwrap();
    let mut remote = first.create_structured_buffer(&[1u32, 2, 3, 4]).unwrap();
    remote.enable_cpu_access().unwrap();
    local.enable_cpu_access().unwrap();
    remote.copy_to(&mut local).unwrap();
    assert_eq!(local.to_vec().unwrap(), vec![1, 2, 3, 4]);
}

/// `share_with_native` and `share_with` alias the allocation on the other device.
#[rstest]
#[case::software(Backend::Software)]
fn test_share_with_native_and_resource(#[case] backend: Backend) {
    let (Some(first), Some(second)) = (backend.device(0), backend.device(1)) else {
        eprintln!("Backend {:?} has fewer than two adapters, skipping", backend);
        return;
    };

    let pattern = generate_test_pattern(4 * 4 * 4);
    let mut original = first
        .create_texture2d_with_data(4, 4, TextureFormat::R8G8B8A8Unorm, &pattern)
        .unwrap();

    let mut by_native = original.share_with_native(&second.native()).unwrap();
    assert!(by_native.device().same_domain(&second));
    by_native.enable_cpu_access().unwrap();
    assert_eq!(read_tight(&mut by_native), pattern);

    let anchor = second
        .create_texture2d(1, 1, TextureFormat::R8G8B8A8Unorm)
        .unwrap();
    let mut by_resource = original.share_with(&anchor).unwrap();
    assert!(by_resource.device().same_domain(&second));
    by_resource.enable_cpu_access().unwrap();

    let update = vec![0x5a; pattern.len()];
    original.enable_cpu_access().unwrap();
    write_tight(&mut original, &update);
    first.flush();
    assert_eq!(read_tight(&mut by_native), update);
    assert_eq!(read_tight(&mut by_resource), update);
}

/// A region copied between devices lands at the destination origin and
/// leaves every other destination texel untouched.
#[rstest]
#[case::software(Backend::Software)]
fn test_cross_device_region_copy(#[case] backend: Backend) {
    let (Some(first), Some(second)) = (backend.device(0), backend.device(1)) else {
        eprintln!("Backend {:?} has fewer than two adapters, skipping", backend);
        return;
    };

    let pattern = generate_test_pattern(4 * 4 * 4);
    let mut source = first
        .create_texture2d_with_data(4, 4, TextureFormat::R8G8B8A8Unorm, &pattern)
        .unwrap();
    let mut dest = second
        .create_texture2d_with_data(4, 4, TextureFormat::R8G8B8A8Unorm, &[0xee; 64])
        .unwrap();

    assert!(matches!(
        source.copy_region_to(&mut dest, 2, 2, 1, 1, 2, 2),
        Err(ComputeError::CpuAccessDisabled)
    ));
    source.enable_cpu_access().unwrap();
    dest.enable_cpu_access().unwrap();
    source.copy_region_to(&mut dest, 2, 2, 1, 1, 2, 2).unwrap();

    let result = read_tight(&mut dest);
    for y in 0..4 {
        for x in 0..4 {
            let texel = &result[(y * 4 + x) * 4..][..4];
            if (1..3).contains(&x) && (1..3).contains(&y) {
                let from = ((y + 1) * 4 + x + 1) * 4;
                assert_eq!(texel, &pattern[from..from + 4], "texel {x},{y}");
            } else {
                assert_eq!(texel, &[0xee; 4], "texel {x},{y}");
            }
        }
    }
}

/// Array slices copy into a texture on another device, whole or by region.
#[rstest]
#[case::software(Backend::Software)]
fn test_cross_device_slice_copy(#[case] backend: Backend) {
    let (Some(first), Some(second)) = (backend.device(0), backend.device(1)) else {
        eprintln!("Backend {:?} has fewer than two adapters, skipping", backend);
        return;
    };

    let slices: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i * 10 + 1; 4 * 4 * 4]).collect();
    let slice_refs: Vec<&[u8]> = slices.iter().map(Vec::as_slice).collect();
    let mut array = first
        .create_texture2d_array_with_data(4, 4, TextureFormat::R8G8B8A8Unorm, &slice_refs)
        .unwrap();
    array.enable_cpu_access().unwrap();
    let mut dest = second
        .create_texture2d(4, 4, TextureFormat::R8G8B8A8Unorm)
        .unwrap();
    dest.enable_cpu_access().unwrap();

    array.copy_slice_to(&mut dest, 1).unwrap();
    assert_eq!(read_tight(&mut dest), slices[1]);

    array
        .copy_slice_region_to(&mut dest, 2, 0, 0, 2, 2, 2, 2)
        .unwrap();
    let result = read_tight(&mut dest);
    for y in 0..4 {
        for x in 0..4 {
            let expected = if x >= 2 && y >= 2 { 21 } else { 11 };
            assert_eq!(result[(y * 4 + x) * 4], expected, "texel {x},{y}");
        }
    }

    assert!(matches!(
        array.copy_slice_to(&mut dest, 3),
        Err(ComputeError::OutOfRange(_))
    ));
}

// ============================================================================
// Kernels
// ============================================================================

/// Create, bind, dispatch a kernel that does nothing, and read the buffer back.
#[rstest]
#[case::software(Backend::Software)]
#[case::wgpu(Backend::Wgpu)]
fn test_noop_dispatch_end_to_end(#[case] backend: Backend) {
    let Some(device) = backend.device(0) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let buffer = device
        .create_structured_buffer(&[1.0f32, 2.0, 3.0, 4.0])
        .unwrap();
    assert_eq!(buffer.stride(), 4);
    let mut imported = StructuredBuffer::<f32>::from_native(&buffer.native()).unwrap();
    assert!(imported.is_cpu_access_enabled());

    let bytecode = compile_kernel_source(
        "@compute @workgroup_size(1) fn main() {}",
        "main",
        "spv_1_0",
    )
    .unwrap();
    let kernel = device.create_kernel(&bytecode).unwrap();

    let mut bindings = KernelBindings::new();
    bindings.set_kernel(&device, &kernel).unwrap();
    bindings
        .set_read_write_view(&device, &mut imported, 0)
        .unwrap();
    bindings.dispatch(&device, 1, 1, 1).unwrap();

    let mut result = [0.0f32; 4];
    imported.get_data(&mut result).unwrap();
    assert_eq!(result, [1.0, 2.0, 3.0, 4.0]);
}

/// A host kernel sees the texture bound at its register.
#[rstest]
#[case::software(Backend::Software)]
fn test_host_kernel_writes_texture(#[case] backend: Backend) {
    let Some(device) = backend.device(0) else {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    };

    let mut texture = device
        .create_texture2d(4, 4, TextureFormat::R32Uint)
        .unwrap();
    texture.enable_cpu_access().unwrap();
    let kernel = device
        .create_host_kernel("diagonal", |invocation| {
            invocation.with_view(1, |view| {
                for i in 0..4 {
                    view.write_texel(i, i, 0, 9u32);
                }
            })
        })
        .unwrap();

    let mut bindings = KernelBindings::new();
    bindings.set_kernel(&device, &kernel).unwrap();
    bindings.set_read_write_view(&device, &mut texture, 1).unwrap();
    bindings.dispatch(&device, 1, 1, 1).unwrap();

    let texels: Vec<u32> = read_tight(&mut texture)
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    for y in 0..4 {
        for x in 0..4 {
            let expected = if x == y { 9 } else { 0 };
            assert_eq!(texels[y * 4 + x], expected, "texel {x},{y}");
        }
    }
}
