//! Vulkan resource binding

pub mod descriptor_set;
pub mod storage_image;
