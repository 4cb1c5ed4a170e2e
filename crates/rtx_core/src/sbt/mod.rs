//! Shader binding table layout engine
//!
//! [`SbtBuilder`] fixes the order of shader stages and groups, [`SbtLayout`]
//! derives the byte layout from the group counts and the device's base
//! alignment, and [`ShaderBindingTable`] copies the pipeline's group handles
//! into a device-addressable buffer laid out that way.

pub mod builder;
pub mod layout;
pub mod table;

pub use builder::{GroupKind, SbtBuilder, SbtState, ShaderGroup, ShaderStage, StageKind, SHADER_ENTRY_POINT};
pub use layout::{SbtLayout, SbtRegion};
pub use table::{SbtRegions, ShaderBindingTable};
