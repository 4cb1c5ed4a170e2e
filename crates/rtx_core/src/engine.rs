//! Ray-tracing core lifecycle
//!
//! [`RayTracingCore`] composes the scene, the shader binding table and the
//! frame bindings behind an explicit phase machine:
//!
//! ```text
//! Configure --build_scene--> Build --begin_render_loop--> RenderLoop
//!     \                        |                              |
//!      `------------------ teardown --------------------------'--> Teardown
//! ```
//!
//! Operations called in the wrong phase fail with
//! [`RtxError::PhaseViolation`].

use ash::extensions::khr::RayTracingPipeline as RayTracingPipelineLoader;
use ash::vk;

use crate::accel::BuildSummary;
use crate::config::RendererConfig;
use crate::device::SharedDevice;
use crate::error::{RtxError, RtxResult};
use crate::render::backends::vulkan::CommandRecorder;
use crate::sbt::{SbtBuilder, SbtRegions, ShaderBindingTable};
use crate::scene::{MeshData, Scene};

/// Lifecycle phase of the ray-tracing core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// Configuration accepted, nothing built yet
    Configure,
    /// Scene structures built, shader table being prepared
    Build,
    /// Frames may be dispatched
    RenderLoop,
    /// Every resource released
    Teardown,
}

/// Everything a frame needs to dispatch rays. Read-only during the loop.
#[derive(Debug, Clone, Copy)]
pub struct FrameBindings {
    /// Top-level structure, for descriptor binding
    pub tlas: vk::AccelerationStructureKHR,
    /// Top-level structure device address
    pub tlas_address: vk::DeviceAddress,
    /// Shader binding table regions
    pub regions: SbtRegions,
    /// Dispatch extent
    pub extent: vk::Extent2D,
}

impl FrameBindings {
    /// Record the ray dispatch. Pipeline and descriptor sets must already be
    /// bound on `recorder`.
    pub fn record_trace_rays(
        &self,
        recorder: &mut CommandRecorder,
        loader: &RayTracingPipelineLoader,
    ) -> RtxResult<()> {
        recorder.cmd_trace_rays(loader, &self.regions, self.extent)
    }
}

/// Ray-tracing core: scene structures, shader table and frame bindings
pub struct RayTracingCore {
    // Field order matters for drop: table, then scene, then device
    sbt: Option<ShaderBindingTable>,
    scene: Option<Scene>,
    device: SharedDevice,
    config: RendererConfig,
    phase: EnginePhase,
}

impl RayTracingCore {
    /// Validate `config` against the device and enter the configure phase
    pub fn configure(device: &SharedDevice, config: RendererConfig) -> RtxResult<Self> {
        config.validate()?;
        device
            .ray_tracing_properties()
            .check_recursion_depth(config.max_recursion_depth)?;

        log::info!(
            "Ray-tracing core configured for '{}' at {}x{}",
            config.application_name,
            config.resolution.0,
            config.resolution.1
        );

        Ok(Self {
            sbt: None,
            scene: None,
            device: device.clone(),
            config,
            phase: EnginePhase::Configure,
        })
    }

    /// Current phase
    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    /// Active configuration
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Device the core was configured with
    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    /// Upload `meshes` and build their structures, then enter the build
    /// phase. On failure the core stays in the configure phase with nothing
    /// allocated.
    pub fn build_scene(&mut self, meshes: &[MeshData]) -> RtxResult<BuildSummary> {
        self.require_phase("build_scene", EnginePhase::Configure)?;

        let mut scene = Scene::from_mesh_data(&self.device, meshes)?;
        let summary = scene.build_acceleration_structures(self.config.build_preference)?;
        self.scene = Some(scene);

        self.enter(EnginePhase::Build);
        Ok(summary)
    }

    /// Shader table builder sized from the device's handle constants
    pub fn shader_table_builder(&self, num_hit_groups: u32, num_miss_groups: u32) -> RtxResult<SbtBuilder> {
        self.require_phase("shader_table_builder", EnginePhase::Build)?;
        SbtBuilder::new(num_hit_groups, num_miss_groups, &self.device.ray_tracing_properties())
    }

    /// Materialize the shader table for `pipeline`, created from `builder`
    pub fn build_shader_table(&mut self, builder: &SbtBuilder, pipeline: vk::Pipeline) -> RtxResult<()> {
        self.require_phase("build_shader_table", EnginePhase::Build)?;
        if self.sbt.is_some() {
            return Err(RtxError::protocol("shader binding table already built"));
        }
        self.sbt = Some(ShaderBindingTable::new(&self.device, builder, pipeline)?);
        Ok(())
    }

    /// Enter the render loop once the scene and the shader table exist
    pub fn begin_render_loop(&mut self) -> RtxResult<FrameBindings> {
        self.require_phase("begin_render_loop", EnginePhase::Build)?;
        if self.sbt.is_none() {
            return Err(RtxError::protocol("render loop requires a shader binding table"));
        }
        self.enter(EnginePhase::RenderLoop);
        self.frame_bindings()
    }

    /// Bindings for the next frame
    pub fn frame_bindings(&self) -> RtxResult<FrameBindings> {
        self.require_phase("frame_bindings", EnginePhase::RenderLoop)?;

        let tlas = self
            .scene
            .as_ref()
            .and_then(Scene::tlas)
            .ok_or_else(|| RtxError::protocol("no top-level structure"))?;
        let sbt = self
            .sbt
            .as_ref()
            .ok_or_else(|| RtxError::protocol("no shader binding table"))?;

        Ok(FrameBindings {
            tlas: tlas.handle(),
            tlas_address: tlas.device_address(),
            regions: sbt.regions(),
            extent: self.config.extent(),
        })
    }

    /// Built scene, from the build phase on
    pub fn scene(&self) -> Option<&Scene> {
        self.scene.as_ref()
    }

    /// Shader table, once built
    pub fn shader_binding_table(&self) -> Option<&ShaderBindingTable> {
        self.sbt.as_ref()
    }

    /// Release the shader table, then the scene. Valid from any phase and
    /// idempotent.
    pub fn teardown(&mut self) {
        if self.phase == EnginePhase::Teardown {
            return;
        }
        self.sbt = None;
        if let Some(mut scene) = self.scene.take() {
            scene.teardown();
        }
        self.enter(EnginePhase::Teardown);
    }

    fn require_phase(&self, operation: &'static str, expected: EnginePhase) -> RtxResult<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(RtxError::phase(operation, expected, self.phase))
        }
    }

    fn enter(&mut self, phase: EnginePhase) {
        log::info!("Ray-tracing core: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }
}

impl Drop for RayTracingCore {
    fn drop(&mut self) {
        self.teardown();
    }
}
