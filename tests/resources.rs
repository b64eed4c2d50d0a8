//! Buffer, binding and command buffer lifecycle tests.
//!
//! Cover transfers, host mapping, argument validation and command buffer
//! misuse on a real device.
//!
//! Run with: cargo test --test resources -- --ignored

use vkcompute::kernels::{self, INCREMENT_SLOTS};
use vkcompute::{CommandBufferState, Device, DevicePool, ErrorKind};

fn device() -> Device {
    DevicePool::new("vkcompute-tests", false)
        .expect("Vulkan init")
        .into_devices()
        .into_iter()
        .next()
        .expect("at least one device")
}

/// Pseudo-random but reproducible words.
fn pattern(len: usize) -> Vec<u32> {
    let mut state = 0x9E37_79B9u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state
        })
        .collect()
}

// =============================================================================
// Transfers
// =============================================================================

#[test]
#[ignore = "Requires GPU"]
fn test_round_trip_through_device_local_is_bit_exact() {
    let device = device();
    let data = pattern(4096);
    let bytes = data.len() * 4;

    let mut src = device.mappable(bytes).unwrap();
    let local = device.buffer(bytes).unwrap();
    let mut dst = device.mappable(bytes).unwrap();
    src.write(&data).unwrap();

    let mut cb = device.command_buffer().unwrap();
    cb.begin().unwrap();
    cb.copy_buffer(&src, &local, bytes).unwrap();
    cb.barrier().unwrap();
    cb.copy_buffer(&local, &dst, bytes).unwrap();
    // makes the copy visible to the host read below
    cb.barrier().unwrap();
    cb.end().unwrap();
    device.run(&cb).unwrap();

    assert_eq!(dst.read::<u32>().unwrap(), data);
}

#[test]
#[ignore = "Requires GPU"]
fn test_fill_then_download() {
    let device = device();
    let buffer = device.buffer(1024).unwrap();
    buffer.fill(0xDEAD_BEEF).unwrap();

    let words = buffer.download_vec::<u32>().unwrap();
    assert_eq!(words.len(), 256);
    assert!(words.iter().all(|&w| w == 0xDEAD_BEEF));

    // Partial download
    let mut head = [0u8; 8];
    buffer.download(&mut head).unwrap();
    assert_eq!(head, [0xEF, 0xBE, 0xAD, 0xDE, 0xEF, 0xBE, 0xAD, 0xDE]);
}

#[test]
#[ignore = "Requires GPU"]
fn test_recorded_fill_is_visible_after_wait() {
    let device = device();
    let buffer = device.buffer(64).unwrap();

    let mut cb = device.command_buffer().unwrap();
    cb.begin().unwrap();
    cb.fill_buffer(&buffer, 7).unwrap();
    cb.end().unwrap();
    device.submit(&cb).unwrap();
    device.wait().unwrap();

    assert_eq!(buffer.download_vec::<u32>().unwrap(), vec![7; 16]);
}

#[test]
#[ignore = "Requires GPU"]
fn test_oversized_copy_is_rejected() {
    let device = device();
    let small = device.buffer(16).unwrap();
    let large = device.buffer(64).unwrap();

    let mut cb = device.command_buffer().unwrap();
    cb.begin().unwrap();
    let err = cb.copy_buffer(&large, &small, 64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Recording);
}

// =============================================================================
// Mapping
// =============================================================================

#[test]
#[ignore = "Requires GPU"]
fn test_device_local_buffer_cannot_be_mapped() {
    let device = device();
    let mut buffer = device.buffer(64).unwrap();
    assert!(!buffer.is_mappable());

    let err = buffer.map().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Map);
}

#[test]
#[ignore = "Requires GPU"]
fn test_double_map_is_rejected_until_unmap() {
    let device = device();
    let mut buffer = device.mappable(64).unwrap();

    buffer.map().unwrap()[0] = 42;
    assert!(buffer.is_mapped());
    assert_eq!(buffer.map().unwrap_err().kind(), ErrorKind::Map);
    assert_eq!(buffer.mapped().unwrap()[0], 42);

    buffer.unmap();
    assert!(!buffer.is_mapped());
    assert_eq!(buffer.map().unwrap()[0], 42);
}

#[test]
#[ignore = "Requires GPU"]
fn test_zero_sized_buffer_is_rejected() {
    let device = device();
    assert_eq!(device.buffer(0).unwrap_err().kind(), ErrorKind::Allocation);
}

#[test]
#[ignore = "Requires GPU"]
fn test_memory_types_are_queried() {
    let device = device();
    let local = device.buffer(64).unwrap();
    let mappable = device.mappable(64).unwrap();

    assert_eq!(Some(local.memory_type_index()), device.local_memory_type());
    assert_eq!(Some(mappable.memory_type_index()), device.mappable_memory_type());
    assert!(local.allocation_size() >= 64);
}

// =============================================================================
// Programs and arguments
// =============================================================================

#[test]
#[ignore = "Requires GPU"]
fn test_argument_count_must_match_slots() {
    let device = device();
    let program = device
        .program(&kernels::increment_f64(), INCREMENT_SLOTS)
        .unwrap();
    let a = device.buffer(64).unwrap();
    let b = device.buffer(64).unwrap();

    let err = device.arguments(&program, &[&a, &b]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Binding);

    let err = device.arguments(&program, &[]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Binding);

    let args = device.arguments(&program, &[&a]).unwrap();
    assert_eq!(args.slot_count(), 1);
    assert_eq!(args.layout(), program.layout());
    assert!(format!("{:?}", args).contains("slot_count: 1"));
}

/// Smallest valid compute kernel: local size 1, no resources, empty body.
#[rustfmt::skip]
const NOOP_KERNEL: &[u32] = &[
    0x0723_0203, 0x0001_0000, 0, 5, 0,
    0x0002_0011, 1,                        // OpCapability Shader
    0x0003_000E, 0, 1,                     // OpMemoryModel Logical GLSL450
    0x0005_000F, 5, 3, 0x6E69_616D, 0,     // OpEntryPoint GLCompute %3 "main"
    0x0006_0010, 3, 17, 1, 1, 1,           // OpExecutionMode %3 LocalSize 1 1 1
    0x0002_0013, 1,                        // %1 = OpTypeVoid
    0x0003_0021, 2, 1,                     // %2 = OpTypeFunction %1
    0x0005_0036, 1, 3, 0, 2,               // %3 = OpFunction %1 None %2
    0x0002_00F8, 4,                        // %4 = OpLabel
    0x0001_00FD,                           // OpReturn
    0x0001_0038,                           // OpFunctionEnd
];

#[test]
#[ignore = "Requires GPU"]
fn test_slotless_program_binds_empty_arguments() {
    let device = device();
    let kernel: Vec<u8> = NOOP_KERNEL.iter().flat_map(|w| w.to_le_bytes()).collect();
    let program = device.program(&kernel, &[]).unwrap();
    assert_eq!(program.slot_count(), 0);

    let args = device.arguments(&program, &[]).unwrap();
    assert_eq!(args.slot_count(), 0);

    let buffer = device.buffer(16).unwrap();
    let err = device.arguments(&program, &[&buffer]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Binding);

    let mut cb = device.command_buffer().unwrap();
    cb.begin().unwrap();
    program.bind_to(&mut cb).unwrap();
    args.bind_to(&mut cb).unwrap();
    cb.dispatch(1, 1, 1).unwrap();
    cb.end().unwrap();
    device.run(&cb).unwrap();
}

#[test]
#[ignore = "Requires GPU"]
fn test_malformed_kernel_is_a_kernel_error() {
    let device = device();
    let err = device
        .program(&[0x03, 0x02, 0x23], INCREMENT_SLOTS)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Kernel);
}

// =============================================================================
// Command buffer lifecycle
// =============================================================================

#[test]
#[ignore = "Requires GPU"]
fn test_submit_before_end_is_rejected() {
    let device = device();
    let mut cb = device.command_buffer().unwrap();
    assert_eq!(cb.state(), CommandBufferState::NotStarted);
    assert_eq!(device.submit(&cb).unwrap_err().kind(), ErrorKind::Recording);

    cb.begin().unwrap();
    assert_eq!(device.submit(&cb).unwrap_err().kind(), ErrorKind::Recording);

    cb.end().unwrap();
    assert_eq!(cb.state(), CommandBufferState::Ended);
    device.run(&cb).unwrap();
    // resubmitting an ended buffer is fine
    device.run(&cb).unwrap();
}

#[test]
#[ignore = "Requires GPU"]
fn test_begin_twice_is_rejected() {
    let device = device();
    let mut cb = device.command_buffer().unwrap();
    cb.begin().unwrap();
    assert_eq!(cb.begin().unwrap_err().kind(), ErrorKind::Recording);
}

#[test]
#[ignore = "Requires GPU"]
fn test_dispatch_without_pipeline_is_rejected() {
    let device = device();
    let mut cb = device.command_buffer().unwrap();
    cb.begin().unwrap();
    assert_eq!(cb.dispatch(1, 1, 1).unwrap_err().kind(), ErrorKind::Recording);
}

#[test]
#[ignore = "Requires GPU"]
fn test_recorded_resources_outlive_their_handles() {
    let device = device();
    let data = pattern(64);

    let mut src = device.mappable(256).unwrap();
    src.write(&data).unwrap();
    let mut dst = device.mappable(256).unwrap();

    let mut cb = device.command_buffer().unwrap();
    cb.begin().unwrap();
    cb.copy_buffer(&src, &dst, 256).unwrap();
    cb.barrier().unwrap();
    cb.end().unwrap();

    // The recording keeps the source alive
    src.destroy();
    device.run(&cb).unwrap();
    assert_eq!(dst.read::<u32>().unwrap(), data);
}

#[test]
#[ignore = "Requires GPU"]
fn test_objects_survive_device_destroy() {
    let device = device();
    let mut buffer = device.mappable(16).unwrap();
    device.destroy();

    buffer.write(&[1u32, 2, 3, 4]).unwrap();
    assert_eq!(buffer.read::<u32>().unwrap(), vec![1, 2, 3, 4]);
}
