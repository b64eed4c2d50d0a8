// Error taxonomy for the compute backend
//
// Every Vulkan call that can fail is mapped to one of a small set of kinds so
// callers can recover per kind (e.g. skip a device whose queue families lack
// compute, but abort on a rejected kernel). Nothing is retried internally.

use ash::vk;
use thiserror::Error;

/// Broad category of a [`ComputeError`], for matching without caring about the
/// message or driver code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InstanceCreation,
    DeviceCreation,
    Allocation,
    Map,
    Kernel,
    Binding,
    Submission,
    Recording,
}

/// Errors produced by the compute backend.
///
/// Variants carrying a `vk::Result` originate from a driver call; the others are
/// rejected on the host before the driver is involved.
#[derive(Debug, Error)]
pub enum ComputeError {
    /// The Vulkan loader could not be loaded or the instance was rejected.
    #[error("instance creation failed: {message}")]
    InstanceCreation {
        message: String,
        result: Option<vk::Result>,
    },

    /// No adapter is visible, an adapter has no compute-capable queue family, or
    /// the logical device was rejected.
    #[error("device creation failed: {message}")]
    DeviceCreation {
        message: String,
        result: Option<vk::Result>,
    },

    /// Buffer/memory creation, allocation or binding failed.
    #[error("allocation failed: {message}")]
    Allocation {
        message: String,
        result: Option<vk::Result>,
    },

    /// Mapping a non host-visible or already mapped buffer, or a bad host range.
    #[error("map failed: {message}")]
    Map {
        message: String,
        result: Option<vk::Result>,
    },

    /// Malformed kernel blob, or the driver rejected the module/layout/pipeline.
    #[error("kernel error: {message}")]
    Kernel {
        message: String,
        result: Option<vk::Result>,
    },

    /// Buffers don't match the program's declared slots, or descriptor setup failed.
    #[error("binding error: {message}")]
    Binding {
        message: String,
        result: Option<vk::Result>,
    },

    /// Queue submission or wait was rejected, including device loss.
    #[error("submission failed: {message}")]
    Submission {
        message: String,
        result: Option<vk::Result>,
    },

    /// A command buffer operation was issued in the wrong state.
    #[error("recording error: {message}")]
    Recording {
        message: String,
        result: Option<vk::Result>,
    },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ComputeError>;

macro_rules! constructors {
    ($($name:ident => $variant:ident),* $(,)?) => {
        impl ComputeError {
            $(
                pub(crate) fn $name(message: impl Into<String>) -> Self {
                    Self::$variant { message: message.into(), result: None }
                }
            )*
        }
    };
}

constructors! {
    instance => InstanceCreation,
    device => DeviceCreation,
    allocation => Allocation,
    map => Map,
    kernel => Kernel,
    binding => Binding,
    submission => Submission,
    recording => Recording,
}

impl ComputeError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InstanceCreation { .. } => ErrorKind::InstanceCreation,
            Self::DeviceCreation { .. } => ErrorKind::DeviceCreation,
            Self::Allocation { .. } => ErrorKind::Allocation,
            Self::Map { .. } => ErrorKind::Map,
            Self::Kernel { .. } => ErrorKind::Kernel,
            Self::Binding { .. } => ErrorKind::Binding,
            Self::Submission { .. } => ErrorKind::Submission,
            Self::Recording { .. } => ErrorKind::Recording,
        }
    }

    /// Driver result code, if the error came from a Vulkan call.
    pub fn vk_result(&self) -> Option<vk::Result> {
        match self {
            Self::InstanceCreation { result, .. }
            | Self::DeviceCreation { result, .. }
            | Self::Allocation { result, .. }
            | Self::Map { result, .. }
            | Self::Kernel { result, .. }
            | Self::Binding { result, .. }
            | Self::Submission { result, .. }
            | Self::Recording { result, .. } => *result,
        }
    }

    /// True when the driver reported `VK_ERROR_DEVICE_LOST`.
    pub fn is_device_lost(&self) -> bool {
        self.vk_result() == Some(vk::Result::ERROR_DEVICE_LOST)
    }

    fn with_result(mut self, code: vk::Result) -> Self {
        match &mut self {
            Self::InstanceCreation { result, .. }
            | Self::DeviceCreation { result, .. }
            | Self::Allocation { result, .. }
            | Self::Map { result, .. }
            | Self::Kernel { result, .. }
            | Self::Binding { result, .. }
            | Self::Submission { result, .. }
            | Self::Recording { result, .. } => *result = Some(code),
        }
        self
    }
}

/// Attach an error kind and message to a raw `VkResult`, the way
/// `anyhow::Context` does for the binary.
pub(crate) trait VkResultExt<T> {
    fn or_fail(self, make: fn(String) -> ComputeError, what: &str) -> Result<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn or_fail(self, make: fn(String) -> ComputeError, what: &str) -> Result<T> {
        self.map_err(|code| make(format!("{what}: {code}")).with_result(code))
    }
}
