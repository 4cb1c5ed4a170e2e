//! Vulkan context
//!
//! Headless instance and device bring-up for ray tracing. The selected device
//! must expose the acceleration structure, ray-tracing pipeline and deferred
//! host operations extensions along with buffer device addresses.

#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{AccelerationStructure, DeferredHostOperations, RayTracingPipeline};
use ash::vk;
use ash::{Device, Entry, Instance};
use std::ffi::{CStr, CString};

use crate::config::RendererConfig;
use crate::device::RayTracingProperties;
use crate::error::{RtxError, RtxResult};

const ENGINE_NAME: &str = "rtx_core";
const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Device extensions every ray-tracing device must support
pub fn required_device_extensions() -> [&'static CStr; 3] {
    [
        AccelerationStructure::name(),
        RayTracingPipeline::name(),
        DeferredHostOperations::name(),
    ]
}

/// Instance plus the debug messenger used in validation runs
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension (debug builds)
    #[cfg(debug_assertions)]
    pub debug_utils: Option<DebugUtils>,
    /// Debug messenger handle (debug builds)
    #[cfg(debug_assertions)]
    pub debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanInstance {
    /// Create a Vulkan 1.2 instance without any surface extensions
    pub fn new(app_name: &str, enable_validation: bool) -> RtxResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| RtxError::initialization(format!("Failed to load Vulkan: {:?}", e)))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|_| RtxError::initialization("application name contains a NUL byte"))?;
        let engine_name_cstr = CString::new(ENGINE_NAME)
            .map_err(|_| RtxError::initialization("engine name contains a NUL byte"))?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let validation = cfg!(debug_assertions) && enable_validation;

        #[allow(unused_mut)]
        let mut extensions: Vec<*const std::os::raw::c_char> = Vec::new();
        #[cfg(debug_assertions)]
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if validation {
            vec![CString::new(VALIDATION_LAYER)
                .map_err(|_| RtxError::initialization("invalid validation layer name"))?]
        } else {
            Vec::new()
        };
        let layer_name_ptrs: Vec<*const std::os::raw::c_char> =
            layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| RtxError::initialization(format!("Instance creation failed: {:?}", e)))?;

        #[cfg(debug_assertions)]
        let (debug_utils, debug_messenger) = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match Self::setup_debug_messenger(&debug_utils) {
                Ok(messenger) => (Some(debug_utils), Some(messenger)),
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            }
        } else {
            (None, None)
        };

        log::info!("Created Vulkan instance (validation: {})", validation);

        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
            #[cfg(debug_assertions)]
            debug_messenger,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> RtxResult<vk::DebugUtilsMessengerEXT> {
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

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) };
        messenger.map_err(|e| RtxError::initialization(format!("Debug messenger creation failed: {:?}", e)))
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            #[cfg(debug_assertions)]
            if let (Some(debug_utils), Some(debug_messenger)) = (&self.debug_utils, &self.debug_messenger) {
                debug_utils.destroy_debug_utils_messenger(*debug_messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Routes validation messages into `log`
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Physical device selection and ray-tracing capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Ray-tracing pipeline constants
    pub ray_tracing: RayTracingProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family used for builds and dispatch
    pub queue_family: u32,
}

impl PhysicalDeviceInfo {
    /// Select the first device that supports ray tracing
    pub fn select_suitable_device(instance: &Instance) -> RtxResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| RtxError::initialization(format!("Device enumeration failed: {:?}", e)))?;

        for device in devices {
            match Self::evaluate_device(instance, device) {
                Ok(device_info) => {
                    log::info!(
                        "Selected GPU: {} (handle {} bytes, alignment {}, recursion {})",
                        device_info.name(),
                        device_info.ray_tracing.shader_group_handle_size,
                        device_info.ray_tracing.shader_group_base_alignment,
                        device_info.ray_tracing.max_ray_recursion_depth
                    );
                    return Ok(device_info);
                }
                Err(reason) => log::debug!("Skipping device {:?}: {}", device, reason),
            }
        }

        Err(RtxError::initialization("No GPU with ray-tracing support found"))
    }

    /// Device name reported by the driver
    pub fn name(&self) -> String {
        let name = unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) };
        name.to_string_lossy().into_owned()
    }

    fn evaluate_device(instance: &Instance, device: vk::PhysicalDevice) -> Result<Self, String> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_2 {
            return Err("Vulkan 1.2 not supported".to_string());
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let queue_family = queue_families
            .iter()
            .position(|family| {
                family
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .ok_or("no graphics and compute queue family")? as u32;

        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .map_err(|e| format!("extension query failed: {:?}", e))?;
        for required in required_device_extensions() {
            let supported = extensions.iter().any(|available| {
                let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
                name == required
            });
            if !supported {
                return Err(format!("missing extension {:?}", required));
            }
        }

        let mut address_features = vk::PhysicalDeviceBufferDeviceAddressFeatures::default();
        let mut structure_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut pipeline_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut features = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut address_features)
            .push_next(&mut structure_features)
            .push_next(&mut pipeline_features);
        unsafe { instance.get_physical_device_features2(device, &mut features) };
        if address_features.buffer_device_address == vk::FALSE
            || structure_features.acceleration_structure == vk::FALSE
            || pipeline_features.ray_tracing_pipeline == vk::FALSE
        {
            return Err("ray-tracing features not supported".to_string());
        }

        let mut ray_tracing_properties = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut structure_properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::builder()
            .push_next(&mut ray_tracing_properties)
            .push_next(&mut structure_properties);
        unsafe { instance.get_physical_device_properties2(device, &mut properties2) };

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

        Ok(Self {
            device,
            properties,
            ray_tracing: RayTracingProperties::from_vk(&ray_tracing_properties, &structure_properties),
            memory_properties,
            queue_family,
        })
    }
}

/// Find a memory type allowed by `type_filter` that has every flag in
/// `properties`
pub fn find_memory_type(
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

/// Logical device created with the ray-tracing feature chain
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Queue used for builds and dispatch
    pub queue: vk::Queue,
    /// Index of the queue family
    pub queue_family: u32,
}

impl LogicalDevice {
    /// Create the device with the ray-tracing extensions and features enabled
    pub fn new(instance: &Instance, physical_device_info: &PhysicalDeviceInfo) -> RtxResult<Self> {
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(physical_device_info.queue_family)
            .queue_priorities(&priorities)
            .build()];

        let extension_names: Vec<*const std::os::raw::c_char> = required_device_extensions()
            .iter()
            .map(|name| name.as_ptr())
            .collect();

        let mut address_features =
            vk::PhysicalDeviceBufferDeviceAddressFeatures::builder().buffer_device_address(true);
        let mut structure_features =
            vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
        let mut pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_names)
            .push_next(&mut address_features)
            .push_next(&mut structure_features)
            .push_next(&mut pipeline_features);

        let device = unsafe { instance.create_device(physical_device_info.device, &create_info, None) }
            .map_err(|e| RtxError::initialization(format!("Device creation failed: {:?}", e)))?;
        let queue = unsafe { device.get_device_queue(physical_device_info.queue_family, 0) };

        Ok(Self {
            device,
            queue,
            queue_family: physical_device_info.queue_family,
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Owns the instance, the selected physical device and the logical device
pub struct VulkanContext {
    // Declared first so the device is destroyed before the instance
    /// Logical device
    pub device: LogicalDevice,
    /// Selected physical device information
    pub physical_device: PhysicalDeviceInfo,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Bring up a headless context for `config`
    pub fn new(config: &RendererConfig) -> RtxResult<Self> {
        let instance = VulkanInstance::new(&config.application_name, config.validation_enabled())?;
        let physical_device = PhysicalDeviceInfo::select_suitable_device(&instance.instance)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        Ok(Self {
            device,
            physical_device,
            instance,
        })
    }

    /// Instance handle
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Clone of the logical device handle
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// Get the queue
    pub fn queue(&self) -> vk::Queue {
        self.device.queue
    }

    /// Get the queue family index
    pub fn queue_family(&self) -> u32 {
        self.device.queue_family
    }
}
