// Compute programs - SPIR-V kernel plus its resource interface
//
// A Program owns the descriptor set layout (one binding per declared slot,
// numbered by position), the pipeline layout and the compute pipeline. The
// shader module is only needed while the pipeline is built.

use ash::vk;
use std::ffi::CStr;
use std::io::Cursor;
use std::sync::Arc;

use super::device::DeviceContext;
use super::error::{ComputeError, Result, VkResultExt};
use super::{CommandBuffer, Device};
use crate::kernels::SPIRV_MAGIC;

/// Entry point every kernel must export.
pub const KERNEL_ENTRY_POINT: &CStr = c"main";

/// Kind of resource attached to a binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Read-write storage buffer.
    StorageBuffer,
}

impl ResourceKind {
    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            ResourceKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// Check a kernel blob and turn it into SPIR-V words.
///
/// The blob must be non-empty, a whole number of 32-bit words and start with
/// the SPIR-V magic number (either byte order).
pub(crate) fn validate_kernel(code: &[u8]) -> Result<Vec<u32>> {
    if code.is_empty() {
        return Err(ComputeError::kernel("kernel blob is empty"));
    }
    if code.len() % 4 != 0 {
        return Err(ComputeError::kernel(format!(
            "kernel blob is {} bytes, not a multiple of 4",
            code.len()
        )));
    }

    // read_spv copies into aligned storage and fixes byte order
    let words = ash::util::read_spv(&mut Cursor::new(code))
        .map_err(|e| ComputeError::kernel(format!("Failed to read SPIR-V: {e}")))?;

    if words[0] != SPIRV_MAGIC {
        return Err(ComputeError::kernel(format!(
            "bad SPIR-V magic number 0x{:08x}",
            words[0]
        )));
    }

    Ok(words)
}

pub(crate) struct ProgramInner {
    ctx: Arc<DeviceContext>,
    pipeline: vk::Pipeline,
    pipeline_layout: vk::PipelineLayout,
    set_layout: vk::DescriptorSetLayout,
}

impl Drop for ProgramInner {
    fn drop(&mut self) {
        unsafe {
            let device = &self.ctx.device;
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// A compiled compute kernel and its binding layout. Immutable.
pub struct Program {
    inner: Arc<ProgramInner>,
    slots: Vec<ResourceKind>,
}

impl Program {
    /// Build a compute pipeline from `kernel` with one binding per entry of `slots`.
    pub fn new(device: &Device, kernel: &[u8], slots: &[ResourceKind]) -> Result<Self> {
        let ctx = device.context();
        let device = &ctx.device;
        let words = validate_kernel(kernel)?;

        // Shader module
        let module_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe { device.create_shader_module(&module_info, None) }
            .or_fail(ComputeError::kernel, "Failed to create shader module")?;

        // Set layout: slot i -> binding i
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = slots
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(i as u32)
                    .descriptor_type(kind.descriptor_type())
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();

        let set_layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = unsafe { device.create_descriptor_set_layout(&set_layout_info, None) }
            .or_fail(ComputeError::kernel, "Failed to create descriptor set layout")
            .inspect_err(|_| unsafe { device.destroy_shader_module(module, None) })?;

        // Pipeline layout
        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .or_fail(ComputeError::kernel, "Failed to create pipeline layout")
            .inspect_err(|_| unsafe {
                device.destroy_descriptor_set_layout(set_layout, None);
                device.destroy_shader_module(module, None);
            })?;

        // Compute pipeline
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(KERNEL_ENTRY_POINT)
            .build();

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(pipeline_layout)
            .build();

        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_, e)| e)
        .or_fail(ComputeError::kernel, "Failed to create compute pipeline");

        unsafe { device.destroy_shader_module(module, None) };

        let pipeline = pipelines
            .inspect_err(|_| unsafe {
                device.destroy_pipeline_layout(pipeline_layout, None);
                device.destroy_descriptor_set_layout(set_layout, None);
            })?[0];

        log::debug!(
            "Created compute program: {} words, {} slot(s)",
            words.len(),
            slots.len()
        );

        Ok(Self {
            inner: Arc::new(ProgramInner {
                ctx: Arc::clone(ctx),
                pipeline,
                pipeline_layout,
                set_layout,
            }),
            slots: slots.to_vec(),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_types(&self) -> &[ResourceKind] {
        &self.slots
    }

    /// Pipeline handle.
    pub fn handle(&self) -> vk::Pipeline {
        self.inner.pipeline
    }

    /// Pipeline layout that descriptor sets for this program bind against.
    pub fn layout(&self) -> vk::PipelineLayout {
        self.inner.pipeline_layout
    }

    pub(crate) fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.inner.set_layout
    }

    pub(crate) fn context(&self) -> &Arc<DeviceContext> {
        &self.inner.ctx
    }

    pub(crate) fn retain(&self) -> Arc<ProgramInner> {
        Arc::clone(&self.inner)
    }

    /// Record "use this pipeline" into `command_buffer`.
    pub fn bind_to(&self, command_buffer: &mut CommandBuffer) -> Result<()> {
        command_buffer.bind_pipeline(self)
    }

    pub fn destroy(self) {
        log::debug!("Destroying compute program");
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("pipeline", &self.inner.pipeline)
            .field("slots", &self.slots)
            .finish()
    }
}
