// Storage buffers backed by a dedicated memory allocation
//
// Each Buffer owns exactly one VkDeviceMemory. Mappable buffers live in the
// device's first host-visible memory type, the others in its first
// device-local type.

use ash::vk;
use bytemuck::Pod;
use std::ptr::NonNull;
use std::sync::Arc;

use super::command_buffer::BarrierScope;
use super::device::DeviceContext;
use super::error::{ComputeError, Result, VkResultExt};
use super::Device;

/// Vulkan objects of a buffer. Shared with command buffers that reference the
/// buffer so they stay valid until those recordings are released.
pub(crate) struct BufferInner {
    ctx: Arc<DeviceContext>,
    pub(crate) buffer: vk::Buffer,
    memory: vk::DeviceMemory,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device.destroy_buffer(self.buffer, None);
            self.ctx.device.free_memory(self.memory, None);
        }
    }
}

/// GPU storage buffer.
///
/// Usable as a storage binding and as the source or destination of copies.
/// Mapping a buffer that in-flight GPU work is reading or writing is a caller
/// error; the buffer does not track queue state. Results of recorded copies
/// into a mappable buffer are host-readable once a
/// [`CommandBuffer::barrier`](super::CommandBuffer::barrier)
/// recorded after them has executed and [`Device::wait`] returned.
///
/// A destroyed buffer cannot be used again, `destroy` takes it by value:
///
/// ```compile_fail
/// # fn demo(device: &vkcompute::backend::Device) -> vkcompute::backend::Result<()> {
/// let mut staging = device.mappable(64)?;
/// staging.destroy();
/// staging.map()?;
/// # Ok(())
/// # }
/// ```
pub struct Buffer {
    inner: Arc<BufferInner>,
    size: usize,
    allocation_size: vk::DeviceSize,
    memory_type: u32,
    mappable: bool,
    coherent: bool,
    mapped: Option<NonNull<u8>>,
}

// SAFETY: the mapped pointer is only dereferenced through `&mut self`.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Allocate `byte_size` bytes, host-visible if `mappable`.
    pub fn new(device: &Device, byte_size: usize, mappable: bool) -> Result<Self> {
        Self::with_context(device.context(), byte_size, mappable)
    }

    pub(crate) fn with_context(
        ctx: &Arc<DeviceContext>,
        byte_size: usize,
        mappable: bool,
    ) -> Result<Self> {
        if byte_size == 0 {
            return Err(ComputeError::allocation("buffer size must be non-zero"));
        }

        let device = &ctx.device;

        // Create buffer
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(byte_size as vk::DeviceSize)
            .usage(
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .or_fail(ComputeError::allocation, "Failed to create buffer")?;

        // Get memory requirements
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        // Find suitable memory type
        let Some(memory_type) = ctx.memory.select(requirements.memory_type_bits, mappable) else {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(ComputeError::allocation(format!(
                "no {} memory type available for buffer",
                if mappable { "host-visible" } else { "device-local" }
            )));
        };

        // Allocate memory
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        let memory = unsafe { device.allocate_memory(&alloc_info, None) }
            .or_fail(ComputeError::allocation, "Failed to allocate buffer memory")
            .inspect_err(|_| unsafe { device.destroy_buffer(buffer, None) })?;

        // Bind memory to buffer
        unsafe { device.bind_buffer_memory(buffer, memory, 0) }
            .or_fail(ComputeError::allocation, "Failed to bind buffer memory")
            .inspect_err(|_| unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            })?;

        log::debug!(
            "Created {} buffer: {} bytes ({} allocated, memory type {})",
            if mappable { "mappable" } else { "device-local" },
            byte_size,
            requirements.size,
            memory_type
        );

        Ok(Self {
            inner: Arc::new(BufferInner {
                ctx: Arc::clone(ctx),
                buffer,
                memory,
            }),
            size: byte_size,
            allocation_size: requirements.size,
            memory_type,
            mappable,
            coherent: ctx.memory.is_coherent(memory_type),
            mapped: None,
        })
    }

    /// Requested size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes actually allocated; at least [`Buffer::size`].
    pub fn allocation_size(&self) -> vk::DeviceSize {
        self.allocation_size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type
    }

    pub fn is_mappable(&self) -> bool {
        self.mappable
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    pub fn handle(&self) -> vk::Buffer {
        self.inner.buffer
    }

    pub(crate) fn retain(&self) -> Arc<BufferInner> {
        Arc::clone(&self.inner)
    }

    pub(crate) fn belongs_to(&self, ctx: &Arc<DeviceContext>) -> bool {
        Arc::ptr_eq(&self.inner.ctx, ctx)
    }

    /// Map the whole buffer into host memory.
    ///
    /// Fails for device-local buffers and when the buffer is already mapped.
    /// The mapping stays valid until [`Buffer::unmap`] or drop; use
    /// [`Buffer::mapped`] to reach it again.
    pub fn map(&mut self) -> Result<&mut [u8]> {
        if !self.mappable {
            return Err(ComputeError::map("buffer was not allocated as mappable"));
        }
        if self.mapped.is_some() {
            return Err(ComputeError::map("buffer is already mapped"));
        }

        let device = &self.inner.ctx.device;
        let memory = self.inner.memory;

        let raw = unsafe { device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
            .or_fail(ComputeError::map, "Failed to map buffer memory")?;

        if !self.coherent {
            let range = vk::MappedMemoryRange::builder()
                .memory(memory)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .build();
            unsafe { device.invalidate_mapped_memory_ranges(&[range]) }
                .or_fail(ComputeError::map, "Failed to invalidate mapped memory")
                .inspect_err(|_| unsafe { device.unmap_memory(memory) })?;
        }

        let Some(pointer) = NonNull::new(raw.cast::<u8>()) else {
            unsafe { device.unmap_memory(memory) };
            return Err(ComputeError::map("driver returned a null mapping"));
        };

        self.mapped = Some(pointer);
        Ok(unsafe { std::slice::from_raw_parts_mut(pointer.as_ptr(), self.size) })
    }

    /// The current mapping, if any.
    pub fn mapped(&mut self) -> Option<&mut [u8]> {
        self.mapped
            .map(|pointer| unsafe { std::slice::from_raw_parts_mut(pointer.as_ptr(), self.size) })
    }

    /// Drop the current mapping. Does nothing if the buffer is not mapped.
    pub fn unmap(&mut self) {
        if self.mapped.take().is_none() {
            return;
        }

        let device = &self.inner.ctx.device;
        let memory = self.inner.memory;

        if !self.coherent {
            let range = vk::MappedMemoryRange::builder()
                .memory(memory)
                .offset(0)
                .size(vk::WHOLE_SIZE)
                .build();
            if let Err(e) = unsafe { device.flush_mapped_memory_ranges(&[range]) } {
                log::warn!("Failed to flush mapped memory: {}", e);
            }
        }

        unsafe { device.unmap_memory(memory) };
    }

    /// Copy `data` to the start of a mappable buffer.
    pub fn write<T: Pod>(&mut self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() > self.size {
            return Err(ComputeError::map(format!(
                "{} bytes do not fit in a {} byte buffer",
                bytes.len(),
                self.size
            )));
        }

        self.map()?[..bytes.len()].copy_from_slice(bytes);
        self.unmap();
        Ok(())
    }

    /// Read a mappable buffer back as elements of `T`.
    pub fn read<T: Pod>(&mut self) -> Result<Vec<T>> {
        let element = std::mem::size_of::<T>();
        if element == 0 || self.size % element != 0 {
            return Err(ComputeError::map(format!(
                "buffer of {} bytes is not a whole number of {} byte elements",
                self.size, element
            )));
        }

        let result = bytemuck::try_cast_slice::<u8, T>(self.map()?)
            .map(<[T]>::to_vec)
            .map_err(|e| ComputeError::map(format!("mapped memory cannot be viewed as elements: {e}")));
        self.unmap();
        result
    }

    /// Fill the whole buffer with a repeated 32-bit `value` and wait for it.
    pub fn fill(&self, value: u32) -> Result<()> {
        let buffer = self.inner.buffer;
        self.inner.ctx.run_implicit(|device, command_buffer| unsafe {
            device.cmd_fill_buffer(command_buffer, buffer, 0, vk::WHOLE_SIZE, value);
        })
    }

    /// Copy the first `host.len()` bytes of this buffer into `host`.
    ///
    /// Stages through a temporary mappable buffer and blocks until the copy
    /// has completed, so `host` reflects the buffer as of that moment.
    pub fn download(&self, host: &mut [u8]) -> Result<()> {
        if host.len() > self.size {
            return Err(ComputeError::map(format!(
                "host slice of {} bytes exceeds buffer size {}",
                host.len(),
                self.size
            )));
        }

        let mut staging = Buffer::with_context(&self.inner.ctx, self.size, true)?;
        let (src, dst) = (self.inner.buffer, staging.inner.buffer);
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: self.size as vk::DeviceSize,
        };

        self.inner.ctx.run_implicit(|device, command_buffer| {
            // Earlier submissions' writes first, then the copy result to the host
            BarrierScope::full().record(device, command_buffer);
            unsafe { device.cmd_copy_buffer(command_buffer, src, dst, &[region]) };
            BarrierScope::transfer_to_host().record(device, command_buffer);
        })?;

        host.copy_from_slice(&staging.map()?[..host.len()]);
        staging.unmap();
        Ok(())
    }

    /// Download the whole buffer as elements of `T`.
    pub fn download_vec<T: Pod>(&self) -> Result<Vec<T>> {
        let element = std::mem::size_of::<T>();
        if element == 0 || self.size % element != 0 {
            return Err(ComputeError::map(format!(
                "buffer of {} bytes is not a whole number of {} byte elements",
                self.size, element
            )));
        }

        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); self.size / element];
        self.download(bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    /// Release the buffer. Memory is freed once no recorded command buffer
    /// still references it.
    pub fn destroy(self) {
        log::debug!("Destroying buffer of {} bytes", self.size);
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.unmap();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("size", &self.size)
            .field("allocation_size", &self.allocation_size)
            .field("mappable", &self.mappable)
            .field("mapped", &self.mapped.is_some())
            .finish()
    }
}
