// Device pool - Vulkan instance and adapter enumeration
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Forwarding validation messages to `log`
// - Wrapping every physical adapter in a compute `Device`

use ash::{vk, Entry};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::error::{ComputeError, Result, VkResultExt};
use super::Device;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Loaded Vulkan library plus instance. Shared by every device created from it
/// so the instance outlives all logical devices.
pub(crate) struct Instance {
    pub(crate) instance: ash::Instance,
    debug_utils: Option<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    _entry: Entry,
}

impl Instance {
    fn new(app_name: &str, enable_validation: bool) -> Result<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| {
            ComputeError::instance(format!(
                "Failed to load Vulkan library ({e}). Is Vulkan installed?"
            ))
        })?;

        let validation = enable_validation && Self::validation_available(&entry);
        if enable_validation && !validation {
            log::warn!(
                "{} not available, continuing without validation",
                VALIDATION_LAYER.to_string_lossy()
            );
        }

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| ComputeError::instance("application name contains a NUL byte"))?;
        let engine_name = c"vkcompute";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_0);

        let (extensions, layers) = if validation {
            (
                vec![ash::extensions::ext::DebugUtils::name().as_ptr()],
                vec![VALIDATION_LAYER.as_ptr()],
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .or_fail(ComputeError::instance, "Failed to create Vulkan instance")?;

        let debug_utils = if validation {
            Some(
                Self::setup_debug_messenger(&entry, &instance)
                    .inspect_err(|_| unsafe { instance.destroy_instance(None) })?,
            )
        } else {
            None
        };

        log::info!(
            "Created Vulkan instance for '{}' (validation: {})",
            app_name,
            validation
        );

        Ok(Self {
            instance,
            debug_utils,
            _entry: entry,
        })
    }

    fn validation_available(entry: &Entry) -> bool {
        entry
            .enumerate_instance_layer_properties()
            .map(|layers| has_layer(&layers, VALIDATION_LAYER))
            .unwrap_or(false)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::extensions::ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::extensions::ext::DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .or_fail(ComputeError::instance, "Failed to create debug messenger")?;

        Ok((debug_utils, messenger))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Every physical adapter visible to the process, each opened as a [`Device`].
///
/// Callers pick devices by iterating; there is no filtering API. The pool may
/// be dropped while devices are still in use, the instance lives on until the
/// last device is released.
pub struct DevicePool {
    devices: Vec<Device>,
    instance: Arc<Instance>,
}

impl DevicePool {
    /// Create the instance and open a device on every adapter.
    ///
    /// Fails if the Vulkan library or instance is unavailable, if no adapter is
    /// visible, or if any adapter cannot be opened for compute.
    pub fn new(app_name: &str, enable_validation: bool) -> Result<Self> {
        let instance = Arc::new(Instance::new(app_name, enable_validation)?);

        let physical_devices = unsafe { instance.instance.enumerate_physical_devices() }
            .or_fail(ComputeError::device, "Failed to enumerate physical devices")?;

        require_adapters(physical_devices.len())?;

        log::info!("Found {} Vulkan adapter(s)", physical_devices.len());

        let devices = physical_devices
            .into_iter()
            .map(|physical_device| Device::new(Arc::clone(&instance), physical_device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { devices, instance })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Take ownership of the devices, e.g. to move each onto its own thread.
    pub fn into_devices(self) -> Vec<Device> {
        self.devices
    }

    /// Raw instance handle, for interop with other Vulkan code.
    pub fn instance_handle(&self) -> vk::Instance {
        self.instance.instance.handle()
    }
}

impl<'a> IntoIterator for &'a DevicePool {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.devices.iter()
    }
}

fn has_layer(layers: &[vk::LayerProperties], name: &CStr) -> bool {
    layers.iter().any(|layer| {
        let layer_name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
        layer_name == name
    })
}

/// An instance without adapters is usable but has nothing to open.
fn require_adapters(found: usize) -> Result<()> {
    if found == 0 {
        return Err(ComputeError::device("No Vulkan-capable adapter found"));
    }
    Ok(())
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}
