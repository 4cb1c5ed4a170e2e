//! Graphics API backends

pub mod vulkan;
