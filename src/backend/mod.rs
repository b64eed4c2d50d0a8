// Backend module - Vulkan compute abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Ownership: every object holds a shared handle to its device's context;
// nothing here inherits or reaches into another object's internals

pub mod arguments;
pub mod buffer;
pub mod command_buffer;
pub mod device;
pub mod device_pool;
pub mod error;
pub mod program;

pub use arguments::Arguments;
pub use buffer::Buffer;
pub use command_buffer::{CommandBuffer, CommandBufferState};
pub use device::{Device, DeviceInfo};
pub use device_pool::DevicePool;
pub use error::{ComputeError, ErrorKind, Result};
pub use program::{Program, ResourceKind, KERNEL_ENTRY_POINT};
