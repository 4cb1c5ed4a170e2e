//! Command pools and recorders
//!
//! Single-use command buffers for load-time structure builds and the
//! recording calls the ray-tracing core needs: structure builds, memory
//! barriers and ray dispatch.

use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline as RayTracingPipelineLoader};
use ash::{vk, Device};

use crate::accel::GeometryDescription;
use crate::error::{RtxError, RtxResult};
use crate::render::backends::vulkan::state::sync::BUILD_BARRIER_STAGES;
use crate::sbt::SbtRegions;

/// Resettable command pool for single-time submissions
pub struct CommandPool {
    device: Device,
    command_pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a pool on `queue_family_index`
    pub fn new(device: Device, queue_family_index: u32) -> RtxResult<Self> {
        let pool_create_info = vk::CommandPoolCreateInfo::builder()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);

        let command_pool = unsafe {
            device.create_command_pool(&pool_create_info, None)
                .map_err(|e| RtxError::resource_creation("command pool", e))?
        };

        Ok(Self {
            device,
            command_pool,
        })
    }

    /// Pool handle
    pub fn handle(&self) -> vk::CommandPool {
        self.command_pool
    }

    /// Allocate a primary buffer and begin recording it for one submission
    pub fn begin_single_time(&self) -> RtxResult<CommandRecorder> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = unsafe {
            self.device.allocate_command_buffers(&alloc_info)
                .map_err(|e| RtxError::resource_creation("command buffer", e))?
        }
        .into_iter()
        .next()
        .ok_or_else(|| {
            RtxError::resource_creation("command buffer", vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        })?;

        let mut recorder = CommandRecorder::new(command_buffer, self.device.clone());
        if let Err(e) = recorder.begin() {
            self.free(command_buffer);
            return Err(e);
        }
        Ok(recorder)
    }

    /// End `recorder`, submit it to `queue` and block until the queue is idle.
    /// The command buffer is freed whether or not submission succeeds.
    pub fn submit_and_wait(&self, recorder: CommandRecorder, queue: vk::Queue) -> RtxResult<()> {
        let command_buffer = recorder.command_buffer;
        let result = recorder.end().and_then(|command_buffer| {
            let command_buffers = [command_buffer];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

            unsafe {
                self.device
                    .queue_submit(queue, &[submit_info.build()], vk::Fence::null())
                    .map_err(|e| RtxError::submission("queue submit", e))?;
                self.device
                    .queue_wait_idle(queue)
                    .map_err(|e| RtxError::submission("queue wait idle", e))
            }
        });

        self.free(command_buffer);
        result
    }

    /// Free a recorder's command buffer without submitting it
    pub fn discard(&self, recorder: CommandRecorder) {
        self.free(recorder.command_buffer);
    }

    fn free(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device.free_command_buffers(self.command_pool, &[command_buffer]);
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            // Pending submissions must finish before the pool goes
            let _ = self.device.device_wait_idle();
            self.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Type-safe command buffer recorder
pub struct CommandRecorder {
    command_buffer: vk::CommandBuffer,
    device: Device,
    recording: bool,
}

impl CommandRecorder {
    /// Wrap an allocated command buffer
    pub fn new(command_buffer: vk::CommandBuffer, device: Device) -> Self {
        Self {
            command_buffer,
            device,
            recording: false,
        }
    }

    /// Begin one-time-submit recording
    pub fn begin(&mut self) -> RtxResult<&mut Self> {
        if self.recording {
            return Err(RtxError::protocol("Command buffer already recording"));
        }

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device.begin_command_buffer(self.command_buffer, &begin_info)
                .map_err(|e| RtxError::submission("begin command buffer", e))?;
        }

        self.recording = true;
        Ok(self)
    }

    /// End command recording
    pub fn end(mut self) -> RtxResult<vk::CommandBuffer> {
        self.ensure_recording()?;

        unsafe {
            self.device.end_command_buffer(self.command_buffer)
                .map_err(|e| RtxError::submission("end command buffer", e))?;
        }

        self.recording = false;
        Ok(self.command_buffer)
    }

    /// Raw command buffer handle
    pub fn handle(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    fn ensure_recording(&self) -> RtxResult<()> {
        if self.recording {
            Ok(())
        } else {
            Err(RtxError::protocol("Command buffer not recording"))
        }
    }

    /// Record one acceleration structure build
    pub fn cmd_build_acceleration_structure(
        &mut self,
        loader: &AccelerationStructure,
        destination: vk::AccelerationStructureKHR,
        geometry: &GeometryDescription,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        scratch_address: vk::DeviceAddress,
    ) -> RtxResult<()> {
        self.ensure_recording()?;

        let geometries = [geometry.to_vk()];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(geometry.level().vk_type())
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(destination)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            })
            .build();
        let ranges = [geometry.build_range()];
        let range_infos: &[&[vk::AccelerationStructureBuildRangeInfoKHR]] = &[&ranges];

        unsafe {
            loader.cmd_build_acceleration_structures(self.command_buffer, &[build_info], range_infos);
        }
        Ok(())
    }

    /// Record a global memory barrier between structure builds
    pub fn cmd_build_barrier(&mut self, barrier: vk::MemoryBarrier) -> RtxResult<()> {
        self.ensure_recording()?;

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                BUILD_BARRIER_STAGES,
                BUILD_BARRIER_STAGES,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(())
    }

    /// Record a single image layout transition
    pub fn cmd_image_barrier(
        &mut self,
        barrier: vk::ImageMemoryBarrier,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) -> RtxResult<()> {
        self.ensure_recording()?;

        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        Ok(())
    }

    /// Bind a ray-tracing pipeline
    pub fn cmd_bind_ray_tracing_pipeline(&mut self, pipeline: vk::Pipeline) -> RtxResult<()> {
        self.ensure_recording()?;

        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                pipeline,
            );
        }
        Ok(())
    }

    /// Bind descriptor sets for the ray-tracing bind point
    pub fn cmd_bind_ray_tracing_descriptor_sets(
        &mut self,
        layout: vk::PipelineLayout,
        descriptor_sets: &[vk::DescriptorSet],
    ) -> RtxResult<()> {
        self.ensure_recording()?;

        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                layout,
                0,
                descriptor_sets,
                &[],
            );
        }
        Ok(())
    }

    /// Dispatch `extent` rays through the binding table regions
    pub fn cmd_trace_rays(
        &mut self,
        loader: &RayTracingPipelineLoader,
        regions: &SbtRegions,
        extent: vk::Extent2D,
    ) -> RtxResult<()> {
        self.ensure_recording()?;

        let [raygen, miss, hit, callable] = regions.trace_rays_order();
        unsafe {
            loader.cmd_trace_rays(
                self.command_buffer,
                raygen,
                miss,
                hit,
                callable,
                extent.width,
                extent.height,
                1,
            );
        }
        Ok(())
    }
}
