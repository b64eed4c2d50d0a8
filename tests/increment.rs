//! Increment kernel tests.
//!
//! Exercise the full record / submit / download path with the built-in
//! double-precision increment kernel.
//!
//! Run with: cargo test --test increment -- --ignored

use vkcompute::kernels::{self, INCREMENT_LOCAL_SIZE, INCREMENT_SLOTS};
use vkcompute::{Buffer, CommandBuffer, Device, DevicePool, Program};

/// Elements used by the small tests: two full work groups.
const ELEMENTS: usize = 2 * INCREMENT_LOCAL_SIZE as usize;

/// First device that can run f64 kernels.
fn f64_device() -> Device {
    DevicePool::new("vkcompute-tests", false)
        .expect("Vulkan init")
        .into_devices()
        .into_iter()
        .find(Device::supports_f64)
        .expect("no device with shaderFloat64")
}

/// Device-local buffer of `elements` doubles, all 0.0.
fn zeroed(device: &Device, elements: usize) -> Buffer {
    let buffer = device
        .buffer(elements * std::mem::size_of::<f64>())
        .expect("buffer");
    buffer.fill(0).expect("fill");
    buffer
}

fn increment_program(device: &Device) -> Program {
    device
        .program(&kernels::increment_f64(), INCREMENT_SLOTS)
        .expect("increment program")
}

/// Record `passes` increments over `elements` doubles, optionally with a
/// barrier after each dispatch.
fn record(
    device: &Device,
    program: &Program,
    buffer: &Buffer,
    elements: usize,
    passes: u32,
    barriers: bool,
) -> CommandBuffer {
    let groups = (elements / INCREMENT_LOCAL_SIZE as usize) as u32;

    let mut cb = device.command_buffer().expect("command buffer");
    cb.begin().unwrap();
    program.bind_to(&mut cb).unwrap();
    cb.bind_resources(program, &[buffer]).unwrap();
    for _ in 0..passes {
        cb.dispatch(groups, 1, 1).unwrap();
        if barriers {
            cb.barrier().unwrap();
        }
    }
    cb.end().unwrap();
    assert_eq!(cb.dispatch_count(), u64::from(passes));
    cb
}

fn assert_all_equal(values: &[f64], expected: f64) {
    for (i, &v) in values.iter().enumerate() {
        assert_eq!(v, expected, "element {} is {}, expected {}", i, v, expected);
    }
}

#[test]
#[ignore = "Requires GPU"]
fn test_increment_with_barriers_counts_every_pass() {
    let device = f64_device();
    let program = increment_program(&device);
    let buffer = zeroed(&device, ELEMENTS);

    let cb = record(&device, &program, &buffer, ELEMENTS, 1000, true);
    device.submit(&cb).unwrap();
    device.wait().unwrap();

    let values = buffer.download_vec::<f64>().unwrap();
    assert_eq!(values.len(), ELEMENTS);
    assert_all_equal(&values, 1000.0);
}

/// Without barriers, dispatches may overlap and lose updates. The result is
/// therefore unspecified, but it can never exceed the number of dispatches.
#[test]
#[ignore = "Requires GPU"]
fn test_increment_without_barriers_never_overcounts() {
    let device = f64_device();
    let program = increment_program(&device);
    let buffer = zeroed(&device, ELEMENTS);

    let passes = 1000;
    let cb = record(&device, &program, &buffer, ELEMENTS, passes, false);
    device.run(&cb).unwrap();

    let values = buffer.download_vec::<f64>().unwrap();
    for (i, &v) in values.iter().enumerate() {
        assert!(
            v >= 1.0 && v <= f64::from(passes),
            "element {} is {}, outside [1, {}]",
            i,
            v,
            passes
        );
    }

    let lost = values.iter().filter(|&&v| v < f64::from(passes)).count();
    println!("{} of {} elements lost updates without barriers", lost, ELEMENTS);
}

#[test]
#[ignore = "Requires GPU"]
fn test_resubmission_matches_single_long_recording() {
    let device = f64_device();
    let program = increment_program(&device);
    let (passes, submissions) = (50, 4);

    // M submissions of N passes
    let replayed = zeroed(&device, ELEMENTS);
    let short = record(&device, &program, &replayed, ELEMENTS, passes, true);
    for _ in 0..submissions {
        device.submit(&short).unwrap();
        device.wait().unwrap();
    }

    // One submission of M * N passes
    let single = zeroed(&device, ELEMENTS);
    let long = record(&device, &program, &single, ELEMENTS, passes * submissions, true);
    device.run(&long).unwrap();

    let replayed = replayed.download_vec::<f64>().unwrap();
    let single = single.download_vec::<f64>().unwrap();
    assert_eq!(replayed, single);
    assert_all_equal(&single, f64::from(passes * submissions));
}

#[test]
#[ignore = "Requires GPU"]
fn test_reference_benchmark_reaches_half_a_million() {
    let device = f64_device();
    let program = increment_program(&device);
    let elements = 10240;

    let output = device.buffer(elements * 8).unwrap();
    let mut staging = device.mappable(elements * 8).unwrap();
    staging.write(&vec![0.0f64; elements]).unwrap();

    let mut upload = device.command_buffer().unwrap();
    upload.begin().unwrap();
    upload.copy_buffer(&staging, &output, elements * 8).unwrap();
    upload.end().unwrap();
    device.run(&upload).unwrap();

    let cb = record(&device, &program, &output, elements, 100_000, true);
    for run in 0..5 {
        let elapsed = device.run(&cb).unwrap();
        println!("run {}: {:.3} ms", run, elapsed.as_secs_f64() * 1000.0);
    }

    let values = output.download_vec::<f64>().unwrap();
    assert_all_equal(&values, 500_000.0);
}

#[test]
#[ignore = "Requires GPU"]
fn test_reset_allows_rerecording() {
    let device = f64_device();
    let program = increment_program(&device);
    let buffer = zeroed(&device, ELEMENTS);

    let mut cb = record(&device, &program, &buffer, ELEMENTS, 3, true);
    device.run(&cb).unwrap();

    cb.reset().unwrap();
    cb.begin().unwrap();
    cb.bind_pipeline(&program).unwrap();
    cb.bind_resources(&program, &[&buffer]).unwrap();
    cb.dispatch(2, 1, 1).unwrap();
    cb.end().unwrap();
    device.run(&cb).unwrap();

    assert_all_equal(&buffer.download_vec::<f64>().unwrap(), 4.0);
}
