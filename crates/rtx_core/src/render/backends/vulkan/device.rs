//! Vulkan implementation of the device collaborator

use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline as RayTracingPipelineLoader};
use ash::{vk, Device};

use super::initialization::context::{find_memory_type, PhysicalDeviceInfo, VulkanContext};
use super::rendering::commands::{CommandPool, CommandRecorder};
use crate::accel::{BuildCommand, GeometryDescription, StructureLevel};
use crate::config::RendererConfig;
use crate::device::{BufferWrite, BuildSizes, MemoryLocation, RawBuffer, RayTracingDevice, RayTracingProperties};
use crate::error::{RtxError, RtxResult};

/// Ray-tracing capable Vulkan device with its extension loaders and a
/// command pool for one-shot submissions
pub struct VulkanDevice {
    // Field order matters for drop: the pool goes before the device
    command_pool: CommandPool,
    acceleration_structure: AccelerationStructure,
    ray_tracing_pipeline: RayTracingPipelineLoader,
    context: VulkanContext,
}

impl VulkanDevice {
    /// Bring up a headless ray-tracing device for `config`
    pub fn new(config: &RendererConfig) -> RtxResult<Self> {
        let context = VulkanContext::new(config)?;
        let device = context.raw_device();

        let acceleration_structure = AccelerationStructure::new(context.instance(), &device);
        let ray_tracing_pipeline = RayTracingPipelineLoader::new(context.instance(), &device);
        let command_pool = CommandPool::new(device, context.queue_family())?;

        Ok(Self {
            command_pool,
            acceleration_structure,
            ray_tracing_pipeline,
            context,
        })
    }

    /// Raw logical device
    pub fn raw_device(&self) -> &Device {
        &self.context.device.device
    }

    /// Selected physical device
    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.context.physical_device
    }

    /// Queue used for builds and dispatch
    pub fn queue(&self) -> vk::Queue {
        self.context.queue()
    }

    /// Command pool for one-shot submissions
    pub fn command_pool(&self) -> &CommandPool {
        &self.command_pool
    }

    /// Ray-tracing pipeline extension loader
    pub fn ray_tracing_pipeline_loader(&self) -> &RayTracingPipelineLoader {
        &self.ray_tracing_pipeline
    }

    /// Block until the device is idle
    pub fn wait_idle(&self) -> RtxResult<()> {
        let result = unsafe { self.raw_device().device_wait_idle() };
        result.map_err(|e| RtxError::submission("device wait idle", e))
    }

    fn record(&self, recorder: &mut CommandRecorder, command: &BuildCommand) -> RtxResult<()> {
        match command {
            BuildCommand::Build {
                destination,
                geometry,
                flags,
                scratch_address,
            } => recorder.cmd_build_acceleration_structure(
                &self.acceleration_structure,
                *destination,
                geometry,
                *flags,
                *scratch_address,
            ),
            BuildCommand::Barrier(barrier) => recorder.cmd_build_barrier(*barrier),
        }
    }
}

impl RayTracingDevice for VulkanDevice {
    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.context.physical_device.ray_tracing
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RtxResult<RawBuffer> {
        let device = self.raw_device();

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(|e| RtxError::resource_creation("buffer", e))?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let Some(memory_type) = find_memory_type(
            requirements.memory_type_bits,
            location.property_flags(),
            &self.context.physical_device.memory_properties,
        ) else {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(RtxError::resource_creation(
                format!("{:?} buffer memory type", location),
                vk::Result::ERROR_FEATURE_NOT_PRESENT,
            ));
        };

        let mut flags_info = vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(RtxError::resource_creation("buffer memory", e));
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(RtxError::resource_creation("buffer memory binding", e));
        }

        Ok(RawBuffer { buffer, memory, size })
    }

    fn destroy_buffer(&self, buffer: &RawBuffer) {
        unsafe {
            self.raw_device().destroy_buffer(buffer.buffer, None);
            self.raw_device().free_memory(buffer.memory, None);
        }
    }

    fn write_buffer(&self, buffer: &RawBuffer, writes: &[BufferWrite<'_>]) -> RtxResult<()> {
        let device = self.raw_device();
        let mapped = unsafe { device.map_memory(buffer.memory, 0, buffer.size, vk::MemoryMapFlags::empty()) }
            .map_err(|e| RtxError::resource_creation("buffer mapping", e))?
            .cast::<u8>();

        for write in writes {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    write.bytes.as_ptr(),
                    mapped.add(write.offset as usize),
                    write.bytes.len(),
                );
            }
        }

        unsafe { device.unmap_memory(buffer.memory) };
        Ok(())
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
        unsafe { self.raw_device().get_buffer_device_address(&info) }
    }

    fn acceleration_structure_build_sizes(
        &self,
        geometry: &GeometryDescription,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> RtxResult<BuildSizes> {
        let geometries = [geometry.to_vk()];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(geometry.level().vk_type())
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let sizes = unsafe {
            self.acceleration_structure.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[geometry.primitive_count()],
            )
        };

        Ok(BuildSizes {
            structure_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
        })
    }

    fn create_acceleration_structure(
        &self,
        level: StructureLevel,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RtxResult<vk::AccelerationStructureKHR> {
        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer)
            .offset(0)
            .size(size)
            .ty(level.vk_type());

        let structure = unsafe { self.acceleration_structure.create_acceleration_structure(&create_info, None) };
        structure.map_err(|e| RtxError::resource_creation("acceleration structure", e))
    }

    fn destroy_acceleration_structure(&self, structure: vk::AccelerationStructureKHR) {
        unsafe {
            self.acceleration_structure.destroy_acceleration_structure(structure, None);
        }
    }

    fn acceleration_structure_device_address(
        &self,
        structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        let info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(structure);
        unsafe {
            self.acceleration_structure
                .get_acceleration_structure_device_address(&info)
        }
    }

    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        group_count: u32,
        data_size: usize,
    ) -> RtxResult<Vec<u8>> {
        let handles = unsafe {
            self.ray_tracing_pipeline
                .get_ray_tracing_shader_group_handles(pipeline, 0, group_count, data_size)
        };
        handles.map_err(|e| RtxError::capability_query("shader group handles", format!("{:?}", e)))
    }

    fn submit_build_commands(&self, commands: &[BuildCommand]) -> RtxResult<()> {
        let mut recorder = self.command_pool.begin_single_time()?;
        if let Err(e) = commands
            .iter()
            .try_for_each(|command| self.record(&mut recorder, command))
        {
            self.command_pool.discard(recorder);
            return Err(e);
        }

        log::debug!("Submitting {} build commands", commands.len());
        self.command_pool.submit_and_wait(recorder, self.queue())
    }
}
