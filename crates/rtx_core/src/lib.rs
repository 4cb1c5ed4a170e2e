//! # RTX Core
//!
//! Load-time build core for Vulkan KHR ray tracing.
//!
//! ## Features
//!
//! - **Acceleration Structures**: one bottom-level structure per mesh and a
//!   top-level structure over them, built in a single submission
//! - **Shader Binding Tables**: ordered raygen, hit and miss groups laid out
//!   at the device's record alignment
//! - **Render Core**: explicit configure, build, render loop and teardown phases
//! - **Device Seam**: every GPU call goes through [`device::RayTracingDevice`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rtx_core::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     rtx_core::foundation::logging::init();
//!
//!     let config = RendererConfig::default();
//!     let device = Arc::new(VulkanDevice::new(&config)?);
//!     let shared: SharedDevice = device.clone();
//!
//!     let mut core = RayTracingCore::configure(&shared, config)?;
//!     let meshes = vec![MeshData::from_triangles(
//!         vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
//!         vec![0, 1, 2],
//!         0,
//!     )];
//!     core.build_scene(&meshes)?;
//!     core.teardown();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::cast_possible_truncation
)]

pub mod accel;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod foundation;
pub mod render;
pub mod resources;
pub mod sbt;
pub mod scene;

pub use engine::{EnginePhase, FrameBindings, RayTracingCore};
pub use error::{RtxError, RtxResult};

/// Common imports for core users
pub mod prelude {
    pub use crate::{
        accel::{AccelerationStructure, AccelerationStructureBuilder, BuildSummary},
        config::{BuildPreference, Config, HitGroupShaders, RayTracingShaderConfig, RendererConfig},
        device::{RayTracingDevice, SharedDevice},
        engine::{EnginePhase, FrameBindings, RayTracingCore},
        error::{RtxError, RtxResult},
        render::backends::vulkan::{
            DescriptorPool, DescriptorSetLayoutBuilder, DescriptorSetWriter, RayTracingPipeline, ShaderModule,
            StorageImage, VulkanDevice,
        },
        resources::GpuBuffer,
        sbt::{SbtBuilder, ShaderBindingTable, ShaderStage, StageKind},
        scene::{Instance, Mesh, MeshData, Scene},
    };
}
