//! Vulkan rendering operations

pub mod commands;
pub mod pipeline;
pub mod shader;
