// =============================================================================
// INCREMENT BENCHMARK - vkcompute driver
// =============================================================================
//
// Runs the increment kernel on every Vulkan device and checks the result.
//
// PER DEVICE:
// 1. Zero a device-local buffer of `buffer_size` doubles (via a staging copy)
// 2. Record `increment_passes` x (dispatch, barrier) into one command buffer
// 3. Submit it `runs` times, logging the wall-clock time of each run
// 4. Download and verify every element equals `increment_passes * runs`
//
// Usage: vkcompute-bench [config.toml]
//
// =============================================================================

use anyhow::{Context, Result};
use std::fmt;
use vkcompute::config::{BenchmarkConfig, Config};
use vkcompute::kernels::INCREMENT_SLOTS;
use vkcompute::{Buffer, CommandBuffer, Device, DevicePool, Program};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from the given path or config.toml
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    init_logging(&config);
    log::info!("Starting increment benchmark");
    log::info!(
        "{} elements, {} passes x {} runs, workgroups {:?}",
        config.benchmark.buffer_size,
        config.benchmark.increment_passes,
        config.benchmark.runs,
        config.benchmark.workgroups
    );

    let pool = DevicePool::new(&config.instance.app_name, config.instance.validation_layers)
        .context("Failed to open Vulkan devices")?;

    let mut mismatches = 0;
    for device in &pool {
        println!("[{}]", device.name());

        match run_increment(device, &config.benchmark) {
            Ok(Verdict::Passed) => log::info!("{}: all elements correct", device.name()),
            Ok(verdict) => {
                log::error!("{}: {}", device.name(), verdict);
                mismatches += 1;
            }
            // Keep going; other devices may still work
            Err(e) => log::error!("{}: {:#}", device.name(), e),
        }
    }

    if mismatches > 0 {
        anyhow::bail!("{} device(s) produced wrong results", mismatches);
    }
    Ok(())
}

fn init_logging(config: &Config) {
    use env_logger::Builder;

    let mut builder = Builder::from_default_env();
    // RUST_LOG wins over the configured level
    if std::env::var_os("RUST_LOG").is_none() {
        builder.filter_level(config.log_level());
    }
    builder.init();
}

// =============================================================================
// BENCHMARK
// =============================================================================

/// Outcome of checking the downloaded buffer.
#[derive(Debug, PartialEq)]
enum Verdict {
    Passed,
    /// Element 0 does not hold the expected count.
    Mismatch { expected: f64, actual: f64 },
    /// Element 0 is right but a later element differs from it.
    Corruption { index: usize, value: f64 },
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Passed => write!(f, "passed"),
            Verdict::Mismatch { expected, actual } => {
                write!(f, "Mismatching result! expected {expected}, got {actual}")
            }
            Verdict::Corruption { index, value } => {
                write!(f, "Corruption at {index}: {value}")
            }
        }
    }
}

fn verify(values: &[f64], expected: f64) -> Verdict {
    let Some(&first) = values.first() else {
        return Verdict::Mismatch {
            expected,
            actual: f64::NAN,
        };
    };

    if first.round() != expected {
        return Verdict::Mismatch {
            expected,
            actual: first,
        };
    }

    match values.iter().position(|&v| v != first) {
        Some(index) => Verdict::Corruption {
            index,
            value: values[index],
        },
        None => Verdict::Passed,
    }
}

fn run_increment(device: &Device, bench: &BenchmarkConfig) -> Result<Verdict> {
    if !device.supports_f64() {
        anyhow::bail!("shaderFloat64 not supported, skipping");
    }

    let program = device
        .program(&bench.kernel_bytes()?, INCREMENT_SLOTS)
        .context("Failed to build increment program")?;

    let byte_size = bench.buffer_size * std::mem::size_of::<f64>();
    let output = device.buffer(byte_size)?;
    let mut staging = device.mappable(byte_size)?;

    // Upload zeros
    staging.write(&vec![0.0f64; bench.buffer_size])?;
    let mut upload = device.command_buffer()?;
    upload.begin()?;
    upload.copy_buffer(&staging, &output, byte_size)?;
    upload.end()?;
    device.run(&upload).context("Failed to upload initial values")?;

    // Record once, replay `runs` times
    let increment = record_increment(device, &program, &output, bench)?;
    for run in 0..bench.runs {
        let elapsed = device
            .run(&increment)
            .with_context(|| format!("Run {run} failed"))?;
        println!("  run {}: {:.3} ms", run, elapsed.as_secs_f64() * 1000.0);
    }

    let values = output
        .download_vec::<f64>()
        .context("Failed to download results")?;

    Ok(verify(&values, bench.expected_value()))
}

fn record_increment(
    device: &Device,
    program: &Program,
    output: &Buffer,
    bench: &BenchmarkConfig,
) -> Result<CommandBuffer> {
    let [x, y, z] = bench.workgroups;

    let mut command_buffer = device.command_buffer()?;
    command_buffer.begin()?;
    program.bind_to(&mut command_buffer)?;
    command_buffer.bind_resources(program, &[output])?;
    for _ in 0..bench.increment_passes {
        command_buffer.dispatch(x, y, z)?;
        command_buffer.barrier()?;
    }
    command_buffer.end()?;

    log::debug!("Recorded {} dispatches", command_buffer.dispatch_count());
    Ok(command_buffer)
}
