// Compute device - logical GPU context
//
// Responsibilities:
// - Compute queue family selection (first family advertising COMPUTE)
// - Logical device + single queue creation
// - Memory type discovery (first host-visible, first device-local)
// - Factories for buffers, programs, arguments and command buffers
// - Queue submission, idle waits and timed runs

use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::device_pool::Instance;
use super::error::{ComputeError, Result, VkResultExt};
use super::{Arguments, Buffer, CommandBuffer, Program, ResourceKind};

/// First queue family (by index) that advertises compute support.
pub(crate) fn find_compute_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|family| {
            family.queue_count > 0 && family.queue_flags.contains(vk::QueueFlags::COMPUTE)
        })
        .map(|index| index as u32)
}

/// First memory type allowed by `type_bits` that has all of `flags`.
pub(crate) fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..properties.memory_type_count).find(|&i| {
        let allowed = (type_bits & (1 << i)) != 0;
        allowed
            && properties.memory_types[i as usize]
                .property_flags
                .contains(flags)
    })
}

/// Memory types cached at device creation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MemoryTypes {
    properties: vk::PhysicalDeviceMemoryProperties,
    pub(crate) mappable: Option<u32>,
    pub(crate) local: Option<u32>,
}

impl MemoryTypes {
    pub(crate) fn new(properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            properties,
            mappable: find_memory_type(&properties, !0, vk::MemoryPropertyFlags::HOST_VISIBLE),
            local: find_memory_type(&properties, !0, vk::MemoryPropertyFlags::DEVICE_LOCAL),
        }
    }

    /// Memory type for a buffer whose requirements allow `type_bits`.
    ///
    /// The cached index wins when the buffer accepts it; otherwise the first
    /// allowed type with the same capability is used.
    pub(crate) fn select(&self, type_bits: u32, mappable: bool) -> Option<u32> {
        let (cached, flags) = if mappable {
            (self.mappable, vk::MemoryPropertyFlags::HOST_VISIBLE)
        } else {
            (self.local, vk::MemoryPropertyFlags::DEVICE_LOCAL)
        };

        match cached {
            Some(index) if type_bits & (1 << index) != 0 => Some(index),
            _ => {
                let fallback = find_memory_type(&self.properties, type_bits, flags);
                if let Some(index) = fallback {
                    log::warn!("Cached memory type not allowed for buffer, using type {}", index);
                }
                fallback
            }
        }
    }

    pub(crate) fn is_coherent(&self, index: u32) -> bool {
        self.properties.memory_types[index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// The implicit command buffer behind `Buffer::fill` and `Buffer::download`.
struct ImplicitCommands {
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

/// Logical device state shared by the `Device` handle and every object created
/// from it. Dropped (and the logical device destroyed) with the last reference.
pub(crate) struct DeviceContext {
    pub(crate) device: ash::Device,
    pub(crate) queue_family: u32,
    pub(crate) memory: MemoryTypes,
    queue: Mutex<vk::Queue>,
    implicit: Mutex<ImplicitCommands>,
    _instance: Arc<Instance>,
}

impl DeviceContext {
    pub(crate) fn submit(&self, command_buffer: vk::CommandBuffer) -> Result<()> {
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        let queue = self.queue.lock();
        unsafe {
            self.device
                .queue_submit(*queue, &[submit_info.build()], vk::Fence::null())
        }
        .or_fail(ComputeError::submission, "Failed to submit command buffer")
    }

    pub(crate) fn wait(&self) -> Result<()> {
        let queue = self.queue.lock();
        unsafe { self.device.queue_wait_idle(*queue) }
            .or_fail(ComputeError::submission, "Failed to wait for queue")
    }

    /// Record into the implicit command buffer, submit it and wait for it.
    pub(crate) fn run_implicit(
        &self,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<()> {
        let implicit = self.implicit.lock();
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(implicit.buffer, &begin_info)
                .or_fail(ComputeError::recording, "Failed to begin implicit command buffer")?;
            record(&self.device, implicit.buffer);
            self.device
                .end_command_buffer(implicit.buffer)
                .or_fail(ComputeError::recording, "Failed to end implicit command buffer")?;
        }

        self.submit(implicit.buffer)?;
        self.wait()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device
                .destroy_command_pool(self.implicit.get_mut().pool, None);
            self.device.destroy_device(None);
        }
    }
}

/// Static identity of the adapter behind a [`Device`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_id: u32,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
}

/// A logical device with one compute queue.
///
/// Objects created from a `Device` hold a shared reference to its context, so
/// [`Device::destroy`] never invalidates them: the logical device is released
/// once the last of them is dropped.
pub struct Device {
    ctx: Arc<DeviceContext>,
    physical_device: vk::PhysicalDevice,
    info: DeviceInfo,
    float64: bool,
}

impl Device {
    pub(crate) fn new(instance: Arc<Instance>, physical_device: vk::PhysicalDevice) -> Result<Self> {
        let vk_instance = &instance.instance;

        let properties = unsafe { vk_instance.get_physical_device_properties(physical_device) };
        let info = DeviceInfo {
            name: unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned(),
            vendor_id: properties.vendor_id,
            device_id: properties.device_id,
            device_type: properties.device_type,
            api_version: properties.api_version,
        };

        // Step 1: Pick the compute queue family
        let queue_families =
            unsafe { vk_instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_family = find_compute_queue_family(&queue_families).ok_or_else(|| {
            ComputeError::device(format!("'{}' has no compute-capable queue family", info.name))
        })?;

        // Step 2: Enable only what compute kernels may need
        let supported = unsafe { vk_instance.get_physical_device_features(physical_device) };
        let float64 = supported.shader_float64 == vk::TRUE;
        let features = vk::PhysicalDeviceFeatures {
            shader_float64: supported.shader_float64,
            ..Default::default()
        };

        // Step 3: Create logical device with one queue
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_features(&features);

        let device = unsafe { vk_instance.create_device(physical_device, &create_info, None) }
            .or_fail(ComputeError::device, "Failed to create logical device")?;

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        // Step 4: Cache memory types
        let memory = MemoryTypes::new(unsafe {
            vk_instance.get_physical_device_memory_properties(physical_device)
        });

        // Step 5: Implicit command buffer for synchronous buffer helpers
        let implicit = Self::create_implicit_commands(&device, queue_family)
            .inspect_err(|_| unsafe { device.destroy_device(None) })?;

        log::info!(
            "Opened device: {} (vendor 0x{:04x}, {:?})",
            info.name,
            info.vendor_id,
            info.device_type
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(info.api_version),
            vk::api_version_minor(info.api_version),
            vk::api_version_patch(info.api_version)
        );
        log::debug!(
            "Compute queue family {}, mappable memory {:?}, local memory {:?}, float64: {}",
            queue_family,
            memory.mappable,
            memory.local,
            float64
        );

        Ok(Self {
            ctx: Arc::new(DeviceContext {
                device,
                queue_family,
                memory,
                queue: Mutex::new(queue),
                implicit: Mutex::new(implicit),
                _instance: instance,
            }),
            physical_device,
            info,
            float64,
        })
    }

    fn create_implicit_commands(device: &ash::Device, queue_family: u32) -> Result<ImplicitCommands> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            );

        let pool = unsafe { device.create_command_pool(&pool_info, None) }
            .or_fail(ComputeError::device, "Failed to create implicit command pool")?;

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
            .or_fail(ComputeError::device, "Failed to allocate implicit command buffer")
            .inspect_err(|_| unsafe { device.destroy_command_pool(pool, None) })?;

        Ok(ImplicitCommands {
            pool,
            buffer: buffers[0],
        })
    }

    pub(crate) fn context(&self) -> &Arc<DeviceContext> {
        &self.ctx
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn vendor_id(&self) -> u32 {
        self.info.vendor_id
    }

    pub fn device_type(&self) -> vk::PhysicalDeviceType {
        self.info.device_type
    }

    /// True for discrete, integrated and virtual GPUs; false for CPU
    /// implementations such as llvmpipe.
    pub fn is_gpu(&self) -> bool {
        matches!(
            self.info.device_type,
            vk::PhysicalDeviceType::DISCRETE_GPU
                | vk::PhysicalDeviceType::INTEGRATED_GPU
                | vk::PhysicalDeviceType::VIRTUAL_GPU
        )
    }

    /// Whether kernels may use 64-bit floats (`shaderFloat64` was enabled).
    pub fn supports_f64(&self) -> bool {
        self.float64
    }

    pub fn compute_queue_family(&self) -> u32 {
        self.ctx.queue_family
    }

    pub fn mappable_memory_type(&self) -> Option<u32> {
        self.ctx.memory.mappable
    }

    pub fn local_memory_type(&self) -> Option<u32> {
        self.ctx.memory.local
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Device-local buffer of `byte_size` bytes.
    pub fn buffer(&self, byte_size: usize) -> Result<Buffer> {
        Buffer::new(self, byte_size, false)
    }

    /// Host-visible buffer of `byte_size` bytes.
    pub fn mappable(&self, byte_size: usize) -> Result<Buffer> {
        Buffer::new(self, byte_size, true)
    }

    pub fn program(&self, kernel: &[u8], slots: &[ResourceKind]) -> Result<Program> {
        Program::new(self, kernel, slots)
    }

    pub fn arguments(&self, program: &Program, buffers: &[&Buffer]) -> Result<Arguments> {
        Arguments::new(program, buffers)
    }

    pub fn command_buffer(&self) -> Result<CommandBuffer> {
        CommandBuffer::new(self)
    }

    /// Enqueue an ended command buffer. Does not block.
    ///
    /// Successive submissions execute in order but may overlap; call
    /// [`Device::wait`] between them when one depends on another.
    pub fn submit(&self, command_buffer: &CommandBuffer) -> Result<()> {
        if !command_buffer.belongs_to(&self.ctx) {
            return Err(ComputeError::submission(
                "command buffer was created on a different device",
            ));
        }
        command_buffer.expect_executable()?;
        self.ctx.submit(command_buffer.handle())
    }

    /// Block until all submitted work on this device's queue has completed.
    pub fn wait(&self) -> Result<()> {
        self.ctx.wait()
    }

    /// Submit, wait, and return the wall-clock time in between.
    pub fn run(&self, command_buffer: &CommandBuffer) -> Result<Duration> {
        let start = Instant::now();
        self.submit(command_buffer)?;
        self.wait()?;
        Ok(start.elapsed())
    }

    /// Drain the queue and release this device handle.
    ///
    /// Objects created from the device stay valid afterwards. The logical
    /// context (the `VkDevice` and its queue) is released together with the
    /// last of them, or here if none are left.
    pub fn destroy(self) {
        if let Err(e) = self.ctx.wait() {
            log::warn!("Failed to drain queue of {}: {}", self.info.name, e);
        }

        let outstanding = Arc::strong_count(&self.ctx) - 1;
        if outstanding > 0 {
            log::debug!(
                "Destroying device {} with {} live object(s); context released with the last one",
                self.info.name,
                outstanding
            );
        } else {
            log::info!("Destroying device {}", self.info.name);
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.info.name)
            .field("vendor_id", &format_args!("0x{:04x}", self.info.vendor_id))
            .field("queue_family", &self.ctx.queue_family)
            .finish()
    }
}
