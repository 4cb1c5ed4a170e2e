//! Device-local output image written by the ray-generation shader

use ash::{vk, Device};

use crate::error::{RtxError, RtxResult};
use crate::render::backends::vulkan::initialization::context::find_memory_type;
use crate::render::backends::vulkan::state::sync::{MemoryBarrierBuilder, COLOR_SUBRESOURCE_RANGE};

/// Storage image with its memory and a 2D view
pub struct StorageImage {
    device: Device,
    image: vk::Image,
    view: vk::ImageView,
    memory: vk::DeviceMemory,
    extent: vk::Extent2D,
}

impl StorageImage {
    /// Texel format of the output image
    pub const FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    /// Create an `extent`-sized image in device-local memory. Everything
    /// created before a failing step is released.
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        extent: vk::Extent2D,
    ) -> RtxResult<Self> {
        if extent.width == 0 || extent.height == 0 {
            return Err(RtxError::resource_creation(
                format!("{}x{} storage image", extent.width, extent.height),
                vk::Result::ERROR_INITIALIZATION_FAILED,
            ));
        }

        let image_info = image_create_info(extent);
        let image = unsafe { device.create_image(&image_info, None) }
            .map_err(|e| RtxError::resource_creation("storage image", e))?;

        let (memory, view) = match Self::bind_memory_and_view(device, memory_properties, image) {
            Ok(parts) => parts,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        log::debug!("Created {}x{} storage image", extent.width, extent.height);
        Ok(Self {
            device: device.clone(),
            image,
            view,
            memory,
            extent,
        })
    }

    fn bind_memory_and_view(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        image: vk::Image,
    ) -> RtxResult<(vk::DeviceMemory, vk::ImageView)> {
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type = find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            memory_properties,
        )
        .ok_or_else(|| {
            RtxError::resource_creation("storage image memory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        })?;

        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = unsafe { device.allocate_memory(&allocate_info, None) }
            .map_err(|e| RtxError::resource_creation("storage image memory", e))?;

        let view_result = unsafe { device.bind_image_memory(image, memory, 0) }
            .map_err(|e| RtxError::resource_creation("storage image memory binding", e))
            .and_then(|()| {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(Self::FORMAT)
                    .subresource_range(COLOR_SUBRESOURCE_RANGE);
                unsafe { device.create_image_view(&view_info, None) }
                    .map_err(|e| RtxError::resource_creation("storage image view", e))
            });

        match view_result {
            Ok(view) => Ok((memory, view)),
            Err(e) => {
                unsafe { device.free_memory(memory, None) };
                Err(e)
            }
        }
    }

    /// Image handle
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// View bound to the storage image descriptor
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Image size in texels
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Transition recorded before the first dispatch into this image
    pub fn general_layout_barrier(&self) -> vk::ImageMemoryBarrier {
        MemoryBarrierBuilder::image_undefined_to_general(self.image)
    }
}

impl Drop for StorageImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

fn image_create_info(extent: vk::Extent2D) -> vk::ImageCreateInfo {
    vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .format(StorageImage::FORMAT)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .samples(vk::SampleCountFlags::TYPE_1)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_create_info_is_single_level_storage() {
        let info = image_create_info(vk::Extent2D {
            width: 800,
            height: 600,
        });
        assert_eq!(info.extent.width, 800);
        assert_eq!(info.extent.height, 600);
        assert_eq!(info.extent.depth, 1);
        assert_eq!(info.mip_levels, 1);
        assert_eq!(info.format, vk::Format::R8G8B8A8_UNORM);
        assert!(info.usage.contains(vk::ImageUsageFlags::STORAGE));
        assert_eq!(info.initial_layout, vk::ImageLayout::UNDEFINED);
    }
}
