// =============================================================================
// VKCOMPUTE - Minimal Vulkan compute abstraction
// =============================================================================
//
// Host-side wrapper over ash for running SPIR-V compute kernels.
//
// OBJECT GRAPH:
// ┌─────────────────────────────────────────────────────────────────┐
// │  DevicePool (instance, one Device per adapter)                  │
// │    └── Device (logical device, compute queue, memory types)     │
// │          ├── Buffer (storage buffer + dedicated memory)         │
// │          ├── Program (SPIR-V kernel + slot layout)              │
// │          │     └── Arguments (buffers bound to the slots)       │
// │          └── CommandBuffer (recorded, resubmittable)            │
// └─────────────────────────────────────────────────────────────────┘
//
// TYPICAL FLOW:
// 1. Open a DevicePool and pick a Device
// 2. Create buffers and a program
// 3. Record bind / dispatch / barrier into a command buffer once
// 4. Submit it as often as needed, wait, download results
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod kernels;

pub use backend::{
    Arguments, Buffer, CommandBuffer, CommandBufferState, ComputeError, Device, DeviceInfo,
    DevicePool, ErrorKind, Program, ResourceKind, Result,
};
pub use config::Config;
