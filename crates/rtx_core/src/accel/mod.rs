//! Acceleration structures
//!
//! One bottom-level structure per mesh and one top-level structure over an
//! instance per mesh. Structures are created and built once at load time by
//! [`AccelerationStructureBuilder`] and destroyed when dropped.

pub mod builder;
pub mod geometry;

pub use builder::{AccelerationStructureBuilder, BuildSummary};
pub use geometry::{BuildCommand, GeometryDescription, InstanceGeometry, StructureLevel, TriangleGeometry};

use ash::vk;

use crate::device::{BuildSizes, MemoryLocation, SharedDevice};
use crate::error::RtxResult;
use crate::resources::GpuBuffer;

/// Acceleration structure with its storage buffer
pub struct AccelerationStructure {
    device: SharedDevice,
    handle: vk::AccelerationStructureKHR,
    level: StructureLevel,
    device_address: vk::DeviceAddress,
    sizes: BuildSizes,
    // Dropped after the handle is destroyed in `Drop`
    storage: GpuBuffer,
}

impl AccelerationStructure {
    /// Allocate storage of exactly `sizes.structure_size` bytes and create
    /// an unbuilt structure in it
    pub(crate) fn create(device: &SharedDevice, level: StructureLevel, sizes: BuildSizes) -> RtxResult<Self> {
        let storage = GpuBuffer::new(
            device,
            sizes.structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::DeviceLocal,
        )?;

        let handle = device.create_acceleration_structure(level, storage.handle(), sizes.structure_size)?;
        let device_address = device.acceleration_structure_device_address(handle);

        log::debug!(
            "Created {:?} structure {:?}: {} bytes storage, {} bytes scratch, address {:#x}",
            level, handle, sizes.structure_size, sizes.build_scratch_size, device_address
        );

        Ok(Self {
            device: device.clone(),
            handle,
            level,
            device_address,
            sizes,
            storage,
        })
    }

    /// Structure handle
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// Structure level
    pub fn level(&self) -> StructureLevel {
        self.level
    }

    /// Device address, valid from creation on
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Sizes reported by the device for this structure's build
    pub fn sizes(&self) -> BuildSizes {
        self.sizes
    }

    /// Storage buffer handle
    pub fn storage_buffer(&self) -> vk::Buffer {
        self.storage.handle()
    }
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        log::debug!("Destroying {:?} structure {:?}", self.level, self.handle);
        self.device.destroy_acceleration_structure(self.handle);
    }
}

impl std::fmt::Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("handle", &self.handle)
            .field("level", &self.level)
            .field("device_address", &self.device_address)
            .field("sizes", &self.sizes)
            .finish()
    }
}
