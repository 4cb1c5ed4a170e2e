//! Vulkan backend implementation
//!
//! Organized into initialization, resources, rendering and state modules,
//! plus the [`VulkanDevice`] that implements the device collaborator.

/// Vulkan initialization types (instance, physical and logical device)
pub mod initialization;

/// Vulkan resource binding (descriptor sets, storage image)
pub mod resources;

/// Vulkan rendering operations (shaders, pipelines, commands)
pub mod rendering;

/// Vulkan state management
pub mod state;

/// Device collaborator implementation
pub mod device;

pub use device::VulkanDevice;

// Re-export core initialization types
pub use initialization::context::{PhysicalDeviceInfo, VulkanContext};

// Re-export resource types
pub use resources::descriptor_set::{
    DescriptorPool, DescriptorSetLayout, DescriptorSetLayoutBuilder, DescriptorSetWriter, DescriptorWrite,
};
pub use resources::storage_image::StorageImage;

// Re-export rendering types
pub use rendering::commands::{CommandPool, CommandRecorder};
pub use rendering::pipeline::RayTracingPipeline;
pub use rendering::shader::ShaderModule;

// Re-export state types
pub use state::sync::MemoryBarrierBuilder;
