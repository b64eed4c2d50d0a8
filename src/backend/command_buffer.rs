// Command buffers - recorded, replayable GPU instruction streams
//
// Each CommandBuffer owns its own command pool on the device's compute queue
// family, so buffers can be recorded on different threads without sharing a
// pool. Recording once and resubmitting is the intended use: a benchmark
// records N (dispatch, barrier) pairs a single time and replays them.
//
// STATE MACHINE:
//   NotStarted --begin--> Recording --end--> Ended --(submit)*
//        ^                                     |
//        +----------------reset----------------+

use ash::vk;
use std::any::Any;
use std::sync::Arc;

use super::device::DeviceContext;
use super::error::{ComputeError, Result, VkResultExt};
use super::{Arguments, Buffer, Device, Program};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    /// Allocated or reset; `begin` has not been called.
    NotStarted,
    /// Between `begin` and `end`; instructions may be appended.
    Recording,
    /// Immutable; may be submitted any number of times.
    Ended,
}

/// Stages and accesses of a global memory barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BarrierScope {
    pub(crate) src_stage: vk::PipelineStageFlags,
    pub(crate) dst_stage: vk::PipelineStageFlags,
    pub(crate) src_access: vk::AccessFlags,
    pub(crate) dst_access: vk::AccessFlags,
}

impl BarrierScope {
    /// All prior writes, device or transfer, visible to all later commands and
    /// to the host.
    pub(crate) fn full() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags::ALL_COMMANDS,
            dst_stage: vk::PipelineStageFlags::ALL_COMMANDS | vk::PipelineStageFlags::HOST,
            src_access: vk::AccessFlags::MEMORY_WRITE,
            dst_access: vk::AccessFlags::MEMORY_READ
                | vk::AccessFlags::MEMORY_WRITE
                | vk::AccessFlags::HOST_READ,
        }
    }

    /// Transfer writes visible to host reads of mapped memory.
    pub(crate) fn transfer_to_host() -> Self {
        Self {
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::HOST,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::HOST_READ,
        }
    }

    /// `command_buffer` must be recording.
    pub(crate) fn record(self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        let memory_barrier = vk::MemoryBarrier::builder()
            .src_access_mask(self.src_access)
            .dst_access_mask(self.dst_access)
            .build();

        unsafe {
            device.cmd_pipeline_barrier(
                command_buffer,
                self.src_stage,
                self.dst_stage,
                vk::DependencyFlags::empty(),
                &[memory_barrier],
                &[],
                &[],
            );
        }
    }
}

/// Host-side bookkeeping of a recording, independent of the driver.
#[derive(Debug)]
pub(crate) struct RecordingState {
    state: CommandBufferState,
    /// Slot count of the bound pipeline, if any.
    pipeline_slots: Option<usize>,
    resources_bound: bool,
    dispatches: u64,
}

impl RecordingState {
    pub(crate) fn new() -> Self {
        Self {
            state: CommandBufferState::NotStarted,
            pipeline_slots: None,
            resources_bound: false,
            dispatches: 0,
        }
    }

    fn expect(&self, wanted: CommandBufferState, op: &str) -> Result<()> {
        if self.state != wanted {
            return Err(ComputeError::recording(format!(
                "{op} requires state {wanted:?}, command buffer is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    pub(crate) fn begin(&mut self) -> Result<()> {
        self.expect(CommandBufferState::NotStarted, "begin")?;
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    pub(crate) fn require_recording(&self, op: &str) -> Result<()> {
        self.expect(CommandBufferState::Recording, op)
    }

    pub(crate) fn bind_pipeline(&mut self, slots: usize) -> Result<()> {
        self.require_recording("bind_pipeline")?;
        self.pipeline_slots = Some(slots);
        Ok(())
    }

    pub(crate) fn bind_resources(&mut self) -> Result<()> {
        self.require_recording("bind_resources")?;
        self.resources_bound = true;
        Ok(())
    }

    /// A dispatch needs a pipeline, and a descriptor set if that pipeline
    /// declares any slots. Anything else is an ill-formed recording.
    pub(crate) fn dispatch(&mut self) -> Result<()> {
        self.require_recording("dispatch")?;
        match self.pipeline_slots {
            None => Err(ComputeError::recording("dispatch without a bound pipeline")),
            Some(slots) if slots > 0 && !self.resources_bound => Err(ComputeError::recording(
                "dispatch without bound resources for the pipeline's slots",
            )),
            Some(_) => {
                self.dispatches += 1;
                Ok(())
            }
        }
    }

    pub(crate) fn end(&mut self) -> Result<()> {
        self.expect(CommandBufferState::Recording, "end")?;
        self.state = CommandBufferState::Ended;
        Ok(())
    }

    pub(crate) fn require_executable(&self) -> Result<()> {
        self.expect(CommandBufferState::Ended, "submit")
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }
}

/// A recorded sequence of copy, fill, bind, dispatch and barrier instructions.
///
/// Buffers, programs and arguments referenced by recorded instructions are kept
/// alive until the command buffer is reset or dropped, so releasing them early
/// never leaves a dangling handle in the recording.
///
/// Dropping or resetting a command buffer that is still executing is a caller
/// error: call [`Device::wait`] first.
pub struct CommandBuffer {
    ctx: Arc<DeviceContext>,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
    recording: RecordingState,
    retained: Vec<Arc<dyn Any + Send + Sync>>,
}

impl CommandBuffer {
    pub fn new(device: &Device) -> Result<Self> {
        let ctx = device.context();
        let device = &ctx.device;

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(ctx.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .or_fail(ComputeError::allocation, "Failed to create command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
            .or_fail(ComputeError::allocation, "Failed to allocate command buffer")
            .inspect_err(|_| unsafe { device.destroy_command_pool(pool, None) })?[0];

        Ok(Self {
            ctx: Arc::clone(ctx),
            pool,
            buffer,
            recording: RecordingState::new(),
            retained: Vec::new(),
        })
    }

    pub fn state(&self) -> CommandBufferState {
        self.recording.state
    }

    /// Dispatches recorded since the last `begin`.
    pub fn dispatch_count(&self) -> u64 {
        self.recording.dispatches
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub(crate) fn belongs_to(&self, ctx: &Arc<DeviceContext>) -> bool {
        Arc::ptr_eq(&self.ctx, ctx)
    }

    pub(crate) fn expect_executable(&self) -> Result<()> {
        self.recording.require_executable()
    }

    fn check_device(&self, same: bool, what: &str) -> Result<()> {
        if !same {
            return Err(ComputeError::recording(format!(
                "{what} was created on a different device than the command buffer"
            )));
        }
        Ok(())
    }

    /// Start recording. Only valid on a fresh or reset command buffer.
    pub fn begin(&mut self) -> Result<()> {
        self.recording.begin()?;

        // Resubmitting while a previous submission is still pending is allowed
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

        unsafe { self.ctx.device.begin_command_buffer(self.buffer, &begin_info) }
            .or_fail(ComputeError::recording, "Failed to begin command buffer")
            .inspect_err(|_| self.recording.reset())
    }

    /// Use `program`'s pipeline for subsequent dispatches.
    pub fn bind_pipeline(&mut self, program: &Program) -> Result<()> {
        self.check_device(Arc::ptr_eq(program.context(), &self.ctx), "program")?;
        self.recording.bind_pipeline(program.slot_count())?;

        unsafe {
            self.ctx.device.cmd_bind_pipeline(
                self.buffer,
                vk::PipelineBindPoint::COMPUTE,
                program.handle(),
            );
        }
        self.retained.push(program.retain());
        Ok(())
    }

    /// Use a prepared descriptor set for subsequent dispatches.
    pub fn bind_arguments(&mut self, arguments: &Arguments) -> Result<()> {
        self.check_device(arguments.belongs_to(&self.ctx), "arguments")?;
        self.recording.bind_resources()?;

        // Slotless arguments have no set to bind
        if arguments.slot_count() > 0 {
            unsafe {
                self.ctx.device.cmd_bind_descriptor_sets(
                    self.buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    arguments.layout(),
                    0,
                    &[arguments.descriptor_set()],
                    &[],
                );
            }
        }
        self.retained.push(arguments.retain());
        Ok(())
    }

    /// Bind `buffers` to `program`'s slots, in order, for subsequent dispatches.
    pub fn bind_resources(&mut self, program: &Program, buffers: &[&Buffer]) -> Result<()> {
        self.recording.require_recording("bind_resources")?;
        let arguments = Arguments::new(program, buffers)?;
        self.bind_arguments(&arguments)
    }

    /// Launch the bound pipeline over an `x * y * z` grid of work groups.
    ///
    /// Dispatches recorded back to back may overlap on the GPU; put a
    /// [`CommandBuffer::barrier`] between dispatches that depend on each other.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.recording.dispatch()?;
        unsafe { self.ctx.device.cmd_dispatch(self.buffer, x, y, z) };
        Ok(())
    }

    /// Full execution and memory barrier: everything recorded before it
    /// completes, and its writes become visible, before anything after it starts.
    ///
    /// Host reads are part of the destination scope, so a copy into a mappable
    /// buffer followed by a barrier can be read once [`Device::wait`] returns.
    pub fn barrier(&mut self) -> Result<()> {
        self.recording.require_recording("barrier")?;
        BarrierScope::full().record(&self.ctx.device, self.buffer);
        Ok(())
    }

    /// Copy the first `byte_size` bytes of `src` to the start of `dst`.
    pub fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, byte_size: usize) -> Result<()> {
        self.recording.require_recording("copy_buffer")?;
        self.check_device(src.belongs_to(&self.ctx), "copy source")?;
        self.check_device(dst.belongs_to(&self.ctx), "copy destination")?;

        if byte_size == 0 {
            return Err(ComputeError::recording("copy of zero bytes"));
        }
        if byte_size > src.size() || byte_size > dst.size() {
            return Err(ComputeError::recording(format!(
                "copy of {} bytes exceeds source ({}) or destination ({})",
                byte_size,
                src.size(),
                dst.size()
            )));
        }

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: byte_size as vk::DeviceSize,
        };

        unsafe {
            self.ctx
                .device
                .cmd_copy_buffer(self.buffer, src.handle(), dst.handle(), &[region]);
        }
        self.retained.push(src.retain());
        self.retained.push(dst.retain());
        Ok(())
    }

    /// Fill the whole of `buffer` with a repeated 32-bit `value`.
    pub fn fill_buffer(&mut self, buffer: &Buffer, value: u32) -> Result<()> {
        self.recording.require_recording("fill_buffer")?;
        self.check_device(buffer.belongs_to(&self.ctx), "buffer")?;

        unsafe {
            self.ctx
                .device
                .cmd_fill_buffer(self.buffer, buffer.handle(), 0, vk::WHOLE_SIZE, value);
        }
        self.retained.push(buffer.retain());
        Ok(())
    }

    /// Finish recording. The instruction stream is immutable afterwards.
    pub fn end(&mut self) -> Result<()> {
        self.recording.require_recording("end")?;
        unsafe { self.ctx.device.end_command_buffer(self.buffer) }
            .or_fail(ComputeError::recording, "Failed to end command buffer")?;
        self.recording.end()
    }

    /// Discard the recording and return to `NotStarted`.
    pub fn reset(&mut self) -> Result<()> {
        unsafe {
            self.ctx
                .device
                .reset_command_buffer(self.buffer, vk::CommandBufferResetFlags::RELEASE_RESOURCES)
        }
        .or_fail(ComputeError::recording, "Failed to reset command buffer")?;

        self.recording.reset();
        self.retained.clear();
        Ok(())
    }

    /// Release the command buffer and its pool. It must not be executing.
    pub fn destroy(self) {
        log::debug!(
            "Destroying command buffer ({} dispatches recorded)",
            self.recording.dispatches
        );
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.free_command_buffers(self.pool, &[self.buffer]);
            self.ctx.device.destroy_command_pool(self.pool, None);
        }
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("state", &self.recording.state)
            .field("dispatches", &self.recording.dispatches)
            .finish()
    }
}
