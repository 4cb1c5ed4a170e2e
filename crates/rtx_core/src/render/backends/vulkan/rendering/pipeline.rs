//! Ray-tracing pipeline creation
//!
//! The pipeline takes its stage and group arrays from a complete
//! [`SbtBuilder`], so group `i` of the pipeline is record `i` of the table.

use ash::{vk, Device};

use crate::device::RayTracingDevice;
use crate::error::{RtxError, RtxResult};
use crate::render::backends::vulkan::VulkanDevice;
use crate::sbt::SbtBuilder;

/// Ray-tracing pipeline and its layout
pub struct RayTracingPipeline {
    device: Device,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl RayTracingPipeline {
    /// Create a pipeline over `set_layouts` from the stages and groups of
    /// `builder`. The shader modules may be destroyed once this returns.
    pub fn new(
        device: &VulkanDevice,
        set_layouts: &[vk::DescriptorSetLayout],
        builder: &SbtBuilder,
        max_recursion_depth: u32,
    ) -> RtxResult<Self> {
        builder.ensure_complete()?;
        device
            .ray_tracing_properties()
            .check_recursion_depth(max_recursion_depth)?;

        let raw_device = device.raw_device().clone();

        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(set_layouts);
        let layout = unsafe { raw_device.create_pipeline_layout(&layout_info, None) }
            .map_err(|e| RtxError::resource_creation("ray-tracing pipeline layout", e))?;

        let stages: Vec<vk::PipelineShaderStageCreateInfo> =
            builder.stages().iter().map(|stage| stage.create_info()).collect();
        let groups: Vec<vk::RayTracingShaderGroupCreateInfoKHR> =
            builder.groups().iter().map(|group| group.to_vk()).collect();

        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(max_recursion_depth)
            .layout(layout)
            .build();

        let result = unsafe {
            device.ray_tracing_pipeline_loader().create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
        };

        let pipeline = match result.map(|pipelines| pipelines.into_iter().next()) {
            Ok(Some(pipeline)) => pipeline,
            Ok(None) => {
                unsafe { raw_device.destroy_pipeline_layout(layout, None) };
                return Err(RtxError::resource_creation(
                    "ray-tracing pipeline",
                    vk::Result::ERROR_INITIALIZATION_FAILED,
                ));
            }
            Err(e) => {
                unsafe { raw_device.destroy_pipeline_layout(layout, None) };
                return Err(RtxError::resource_creation("ray-tracing pipeline", e));
            }
        };

        log::info!(
            "Created ray-tracing pipeline: {} stages, {} groups, recursion depth {}",
            stages.len(),
            groups.len(),
            max_recursion_depth
        );

        Ok(Self {
            device: raw_device,
            pipeline,
            layout,
        })
    }

    /// Pipeline handle
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    /// Pipeline layout handle
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}
