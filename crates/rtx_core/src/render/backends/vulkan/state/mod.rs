//! Vulkan synchronization state

pub mod sync;
