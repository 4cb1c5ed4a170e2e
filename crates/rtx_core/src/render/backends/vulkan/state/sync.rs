//! Memory barriers for acceleration structure builds and ray dispatch
//!
//! Builds that share one scratch buffer must be serialized: each build is
//! followed by a barrier that makes its structure writes visible to the next
//! build before it starts. The same pattern orders the top-level build after
//! every bottom-level build it reads.
//!
//! ```rust
//! use rtx_core::render::backends::vulkan::MemoryBarrierBuilder;
//!
//! let barrier = MemoryBarrierBuilder::acceleration_structure_write_to_read();
//! ```

use ash::vk;

/// Memory barrier builder for common synchronization patterns
pub struct MemoryBarrierBuilder;

impl MemoryBarrierBuilder {
    /// Structure write → structure read, recorded after every build
    pub fn acceleration_structure_write_to_read() -> vk::MemoryBarrier {
        vk::MemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR)
            .build()
    }

    /// Undefined → general layout for an image the ray-generation shader
    /// writes. Previous contents are discarded.
    pub fn image_undefined_to_general(image: vk::Image) -> vk::ImageMemoryBarrier {
        vk::ImageMemoryBarrier::builder()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::GENERAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(COLOR_SUBRESOURCE_RANGE)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::SHADER_WRITE)
            .build()
    }
}

/// Single mip level and layer of a color image
pub const COLOR_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Pipeline stages a build barrier waits on and blocks
pub const BUILD_BARRIER_STAGES: vk::PipelineStageFlags =
    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR;
