// Vulkan initialization components

pub mod context;

pub use context::*;
