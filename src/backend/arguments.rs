// Resource binding - buffers attached to a program's slots
//
// One descriptor pool per Arguments, sized for exactly the program's slots and
// a single set. A program without slots gets an empty Arguments with no pool.

use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::buffer::BufferInner;
use super::device::DeviceContext;
use super::error::{ComputeError, Result, VkResultExt};
use super::program::ProgramInner;
use super::{Buffer, CommandBuffer, Program};

/// The number of buffers must match the number of declared slots exactly.
pub(crate) fn check_binding_count(slots: usize, buffers: usize) -> Result<()> {
    if slots != buffers {
        return Err(ComputeError::binding(format!(
            "program declares {slots} slot(s) but {buffers} buffer(s) were given"
        )));
    }
    Ok(())
}

pub(crate) struct ArgumentsInner {
    ctx: Arc<DeviceContext>,
    pool: vk::DescriptorPool,
    pub(crate) set: vk::DescriptorSet,
    _program: Arc<ProgramInner>,
    _buffers: Vec<Arc<BufferInner>>,
}

impl Drop for ArgumentsInner {
    fn drop(&mut self) {
        // frees the set with it; destroying a null pool is a no-op
        unsafe { self.ctx.device.destroy_descriptor_pool(self.pool, None) };
    }
}

/// A descriptor set binding concrete buffers to a [`Program`]'s slots.
///
/// Keeps the program's layout and the bound buffers alive for as long as the
/// set exists.
pub struct Arguments {
    inner: Arc<ArgumentsInner>,
    layout: vk::PipelineLayout,
    slot_count: usize,
}

impl Arguments {
    /// Bind `buffers[i]` to slot `i` of `program`.
    pub fn new(program: &Program, buffers: &[&Buffer]) -> Result<Self> {
        check_binding_count(program.slot_count(), buffers.len())?;

        let ctx = program.context();
        if let Some(i) = buffers.iter().position(|b| !b.belongs_to(ctx)) {
            return Err(ComputeError::binding(format!(
                "buffer {i} was created on a different device than the program"
            )));
        }

        if buffers.is_empty() {
            return Ok(Self::empty(program));
        }

        let device = &ctx.device;

        // how many descriptors of each type
        let mut counts: BTreeMap<i32, u32> = BTreeMap::new();
        for kind in program.slot_types() {
            *counts.entry(kind.descriptor_type().as_raw()).or_default() += 1;
        }
        let pool_sizes: Vec<vk::DescriptorPoolSize> = counts
            .into_iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty: vk::DescriptorType::from_raw(ty),
                descriptor_count,
            })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(1)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .or_fail(ComputeError::binding, "Failed to create descriptor pool")?;

        let set_layouts = [program.set_layout()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);

        let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .or_fail(ComputeError::binding, "Failed to allocate descriptor set")
            .inspect_err(|_| unsafe { device.destroy_descriptor_pool(pool, None) })?[0];

        // Buffer infos must outlive the writes that point at them
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = buffers
            .iter()
            .map(|buffer| vk::DescriptorBufferInfo {
                buffer: buffer.handle(),
                offset: 0,
                range: vk::WHOLE_SIZE,
            })
            .collect();

        let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
            .iter()
            .zip(program.slot_types())
            .enumerate()
            .map(|(slot, (info, kind))| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(slot as u32)
                    .descriptor_type(kind.descriptor_type())
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();

        unsafe { device.update_descriptor_sets(&writes, &[]) };

        log::debug!("Bound {} buffer(s) to program", buffers.len());

        Ok(Self {
            inner: Arc::new(ArgumentsInner {
                ctx: Arc::clone(ctx),
                pool,
                set,
                _program: program.retain(),
                _buffers: buffers.iter().map(|b| b.retain()).collect(),
            }),
            layout: program.layout(),
            slot_count: buffers.len(),
        })
    }

    fn empty(program: &Program) -> Self {
        Self {
            inner: Arc::new(ArgumentsInner {
                ctx: Arc::clone(program.context()),
                pool: vk::DescriptorPool::null(),
                set: vk::DescriptorSet::null(),
                _program: program.retain(),
                _buffers: Vec::new(),
            }),
            layout: program.layout(),
            slot_count: 0,
        }
    }

    /// Descriptor set handle; null when the program declares no slots.
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.inner.set
    }

    /// Layout of the program these arguments were created for.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub(crate) fn belongs_to(&self, ctx: &Arc<DeviceContext>) -> bool {
        Arc::ptr_eq(&self.inner.ctx, ctx)
    }

    pub(crate) fn retain(&self) -> Arc<ArgumentsInner> {
        Arc::clone(&self.inner)
    }

    /// Record "use this descriptor set" into `command_buffer`.
    pub fn bind_to(&self, command_buffer: &mut CommandBuffer) -> Result<()> {
        command_buffer.bind_arguments(self)
    }

    /// Release the descriptor pool. Deferred while a command buffer still
    /// references this set; bound buffers and the program are unaffected.
    pub fn destroy(self) {
        log::debug!("Destroying arguments for {} slot(s)", self.slot_count);
    }
}

impl std::fmt::Debug for Arguments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arguments")
            .field("set", &self.inner.set)
            .field("layout", &self.layout)
            .field("slot_count", &self.slot_count)
            .finish()
    }
}
