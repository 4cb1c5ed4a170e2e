//! Device collaborator interface
//!
//! Everything the build core asks of the GPU goes through [`RayTracingDevice`]:
//! buffer allocation and host writes, device addresses, build-size queries,
//! structure creation, shader group handles and one-shot command submission.
//! The Vulkan implementation lives in [`crate::render::backends::vulkan`];
//! tests use a recording mock.
//!
//! The device is passed explicitly as a [`SharedDevice`] into every resource
//! constructor. Resources keep a clone so they can release themselves on drop.

use ash::vk;
use std::sync::Arc;

use crate::accel::{BuildCommand, GeometryDescription, StructureLevel};
use crate::error::{RtxError, RtxResult};

#[cfg(test)]
pub(crate) mod mock;

/// Requested memory visibility for a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// GPU-only memory
    DeviceLocal,
    /// Host-visible, coherent memory that can be mapped for writes
    HostVisible,
}

impl MemoryLocation {
    /// Memory property flags a memory type must carry
    pub fn property_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            Self::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }
}

/// Buffer handle and its bound memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    /// Buffer handle
    pub buffer: vk::Buffer,
    /// Memory bound at offset 0
    pub memory: vk::DeviceMemory,
    /// Requested size in bytes
    pub size: vk::DeviceSize,
}

/// Ray-tracing constants reported by the physical device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size in bytes of one shader group handle
    pub shader_group_handle_size: u32,
    /// Required alignment of every shader binding table record
    pub shader_group_base_alignment: u32,
    /// Maximum ray recursion depth the pipeline may request
    pub max_ray_recursion_depth: u32,
    /// Required alignment of the scratch address passed to a build
    pub min_scratch_offset_alignment: u32,
}

impl RayTracingProperties {
    /// Combine the pipeline and acceleration structure property blocks
    pub fn from_vk(
        pipeline: &vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
        structure: &vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
    ) -> Self {
        Self {
            shader_group_handle_size: pipeline.shader_group_handle_size,
            shader_group_base_alignment: pipeline.shader_group_base_alignment,
            max_ray_recursion_depth: pipeline.max_ray_recursion_depth,
            min_scratch_offset_alignment: structure.min_acceleration_structure_scratch_offset_alignment,
        }
    }

    /// Check that a pipeline may request `depth` levels of recursion
    pub fn check_recursion_depth(&self, depth: u32) -> RtxResult<()> {
        if depth == 0 || depth > self.max_ray_recursion_depth {
            return Err(RtxError::capability_query(
                "ray recursion depth",
                format!(
                    "requested {} but the device supports 1..={}",
                    depth, self.max_ray_recursion_depth
                ),
            ));
        }
        Ok(())
    }
}

/// Storage and scratch requirements for one structure build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    /// Bytes of storage the structure occupies
    pub structure_size: vk::DeviceSize,
    /// Bytes of scratch memory the build needs
    pub build_scratch_size: vk::DeviceSize,
}

/// Bytes written at an offset inside a host-visible buffer
#[derive(Debug, Clone, Copy)]
pub struct BufferWrite<'a> {
    /// Byte offset from the start of the buffer
    pub offset: vk::DeviceSize,
    /// Data to copy
    pub bytes: &'a [u8],
}

impl<'a> BufferWrite<'a> {
    /// Create a write of `bytes` at `offset`
    pub fn new(offset: vk::DeviceSize, bytes: &'a [u8]) -> Self {
        Self { offset, bytes }
    }

    /// One past the last byte written
    pub fn end(&self) -> vk::DeviceSize {
        self.offset + self.bytes.len() as vk::DeviceSize
    }
}

/// GPU operations consumed by the acceleration structure builder and the
/// shader binding table
pub trait RayTracingDevice {
    /// Ray-tracing constants of the selected physical device
    fn ray_tracing_properties(&self) -> RayTracingProperties;

    /// Create a buffer and bind freshly allocated memory to it. Buffers with
    /// `SHADER_DEVICE_ADDRESS` usage get device-address capable memory.
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RtxResult<RawBuffer>;

    /// Destroy a buffer and free its memory
    fn destroy_buffer(&self, buffer: &RawBuffer);

    /// Map a host-visible buffer once, apply every write, then unmap
    fn write_buffer(&self, buffer: &RawBuffer, writes: &[BufferWrite<'_>]) -> RtxResult<()>;

    /// Device address of a buffer created with `SHADER_DEVICE_ADDRESS` usage
    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress;

    /// Storage and scratch sizes for building `geometry` with `flags`
    fn acceleration_structure_build_sizes(
        &self,
        geometry: &GeometryDescription,
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> RtxResult<BuildSizes>;

    /// Create a structure of `level` occupying `size` bytes of `buffer`
    fn create_acceleration_structure(
        &self,
        level: StructureLevel,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RtxResult<vk::AccelerationStructureKHR>;

    /// Destroy a structure. Its storage buffer is released separately.
    fn destroy_acceleration_structure(&self, structure: vk::AccelerationStructureKHR);

    /// Device address of a created structure
    fn acceleration_structure_device_address(
        &self,
        structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress;

    /// Concatenated handles of groups `0..group_count` of `pipeline`
    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        group_count: u32,
        data_size: usize,
    ) -> RtxResult<Vec<u8>>;

    /// Record `commands` into one command buffer, submit it and wait until
    /// the queue is idle
    fn submit_build_commands(&self, commands: &[BuildCommand]) -> RtxResult<()>;
}

/// Device context shared by every resource created from it
pub type SharedDevice = Arc<dyn RayTracingDevice>;
