//! Headless ray-tracing demo
//!
//! Brings up a ray-tracing device, builds the acceleration structures of a
//! small procedural scene, creates the pipeline and shader binding table,
//! then binds the scene and dispatches one frame of rays into an offscreen
//! image. Pass a TOML or RON config path as the first argument to override
//! the defaults.

mod camera;
mod scene;

use std::sync::Arc;

use ash::vk;
use rtx_core::config::ConfigError;
use rtx_core::foundation::logging;
use rtx_core::prelude::*;
use rtx_core::render::backends::vulkan::CommandRecorder;

use camera::CameraUniform;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] RtxError),
}

/// Compiled shader modules for one pipeline
struct ShaderSet {
    raygen: ShaderModule,
    hit_groups: Vec<Vec<(ShaderModule, StageKind)>>,
    misses: Vec<ShaderModule>,
}

impl ShaderSet {
    fn load(device: &ash::Device, shaders: &RayTracingShaderConfig) -> RtxResult<Self> {
        let raygen = ShaderModule::from_file(device, &shaders.raygen)?;

        let mut hit_groups = Vec::with_capacity(shaders.hit_groups.len());
        for group in &shaders.hit_groups {
            let mut stages = vec![(
                ShaderModule::from_file(device, &group.closest_hit)?,
                StageKind::ClosestHit,
            )];
            if let Some(any_hit) = &group.any_hit {
                stages.push((ShaderModule::from_file(device, any_hit)?, StageKind::AnyHit));
            }
            hit_groups.push(stages);
        }

        let misses = shaders
            .miss
            .iter()
            .map(|path| ShaderModule::from_file(device, path))
            .collect::<RtxResult<Vec<_>>>()?;

        Ok(Self {
            raygen,
            hit_groups,
            misses,
        })
    }

    /// Fill `builder` in raygen, hit, miss order
    fn populate(&self, builder: &mut SbtBuilder) -> RtxResult<()> {
        builder.set_raygen_stage(ShaderStage::new(self.raygen.handle(), StageKind::Raygen))?;

        for (index, group) in self.hit_groups.iter().enumerate() {
            let stages: Vec<ShaderStage> = group
                .iter()
                .map(|(module, kind)| ShaderStage::new(module.handle(), *kind))
                .collect();
            builder.add_stage_to_hit_group(&stages, index as u32)?;
        }

        for (index, module) in self.misses.iter().enumerate() {
            builder.add_stage_to_miss_group(ShaderStage::new(module.handle(), StageKind::Miss), index as u32)?;
        }
        Ok(())
    }
}

fn load_config() -> Result<RendererConfig, ConfigError> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Loading configuration from {}", path);
            RendererConfig::load_from_file(&path)?
        }
        None => {
            log::info!("No configuration file given, using defaults");
            RendererConfig::default()
        }
    };
    config.validate()?;
    config.shaders.validate_files()?;
    Ok(config)
}

/// Record and submit one dispatch, blocking until the queue is idle
fn dispatch_frame(
    device: &VulkanDevice,
    pipeline: &RayTracingPipeline,
    descriptor_set: vk::DescriptorSet,
    output: &StorageImage,
    bindings: &FrameBindings,
) -> RtxResult<()> {
    let pool = device.command_pool();
    let mut recorder = pool.begin_single_time()?;
    if let Err(e) = record_frame(&mut recorder, device, pipeline, descriptor_set, output, bindings) {
        pool.discard(recorder);
        return Err(e);
    }
    pool.submit_and_wait(recorder, device.queue())
}

fn record_frame(
    recorder: &mut CommandRecorder,
    device: &VulkanDevice,
    pipeline: &RayTracingPipeline,
    descriptor_set: vk::DescriptorSet,
    output: &StorageImage,
    bindings: &FrameBindings,
) -> RtxResult<()> {
    recorder.cmd_image_barrier(
        output.general_layout_barrier(),
        vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
    )?;
    recorder.cmd_bind_ray_tracing_pipeline(pipeline.handle())?;
    recorder.cmd_bind_ray_tracing_descriptor_sets(pipeline.layout(), &[descriptor_set])?;
    bindings.record_trace_rays(recorder, device.ray_tracing_pipeline_loader())
}

fn run() -> Result<(), AppError> {
    let config = load_config()?;

    log::info!("Creating ray-tracing device...");
    let device = Arc::new(VulkanDevice::new(&config)?);
    log::info!("Using GPU: {}", device.physical_device().name());
    let shared: SharedDevice = device.clone();

    let mut core = RayTracingCore::configure(&shared, config)?;

    log::info!("Building acceleration structures...");
    let summary = core.build_scene(&scene::demo_scene())?;
    log::info!(
        "Built {} bottom-level and {} top-level structures ({} bytes, {} bytes scratch)",
        summary.bottom_level_count,
        summary.top_level_count,
        summary.structure_bytes,
        summary.scratch_size
    );

    let set_layout = DescriptorSetLayoutBuilder::scene_layout().build(device.raw_device())?;

    log::info!("Creating ray-tracing pipeline...");
    let shaders = ShaderSet::load(device.raw_device(), &core.config().shaders)?;
    let mut builder = core.shader_table_builder(
        shaders.hit_groups.len() as u32,
        shaders.misses.len() as u32,
    )?;
    shaders.populate(&mut builder)?;
    let pipeline = RayTracingPipeline::new(
        &device,
        &[set_layout.handle()],
        &builder,
        core.config().max_recursion_depth,
    )?;
    drop(shaders);

    core.build_shader_table(&builder, pipeline.handle())?;

    let bindings = core.begin_render_loop()?;
    log::info!(
        "Render loop ready: {}x{} dispatch, TLAS at {:#x}",
        bindings.extent.width,
        bindings.extent.height,
        bindings.tlas_address
    );
    log::debug!(
        "SBT regions: raygen {:#x}/{} hit {:#x}/{}x{} miss {:#x}/{}x{}",
        bindings.regions.raygen.device_address,
        bindings.regions.raygen.size,
        bindings.regions.hit.device_address,
        bindings.regions.hit.stride,
        bindings.regions.hit.size / bindings.regions.hit.stride.max(1),
        bindings.regions.miss.device_address,
        bindings.regions.miss.stride,
        bindings.regions.miss.size / bindings.regions.miss.stride.max(1)
    );

    let camera = CameraUniform::demo(bindings.extent.width, bindings.extent.height);
    let camera_buffer = GpuBuffer::with_data(&shared, &[camera], vk::BufferUsageFlags::UNIFORM_BUFFER)?;
    let output = StorageImage::new(
        device.raw_device(),
        &device.physical_device().memory_properties,
        bindings.extent,
    )?;
    let descriptor_pool = DescriptorPool::new(device.raw_device(), &set_layout, 1)?;
    let descriptor_set = descriptor_pool.allocate(&set_layout)?;
    DescriptorSetWriter::new()
        .write_acceleration_structure(0, bindings.tlas)
        .write_storage_image(1, output.view())
        .write_uniform_buffer(2, camera_buffer.handle(), camera_buffer.size())
        .update(device.raw_device(), descriptor_set, &set_layout)?;

    log::info!("Dispatching one frame...");
    dispatch_frame(&device, &pipeline, descriptor_set, &output, &bindings)?;
    log::info!("Frame dispatched");

    device.wait_idle()?;

    log::info!("Tearing down...");
    core.teardown();
    drop(descriptor_pool);
    drop(output);
    drop(camera_buffer);
    drop(pipeline);
    drop(set_layout);
    Ok(())
}

fn main() {
    logging::init();
    log::info!("Starting headless ray-tracing demo");

    if let Err(e) = run() {
        log::error!("Demo failed: {}", e);
        std::process::exit(1);
    }
    log::info!("Demo finished");
}
