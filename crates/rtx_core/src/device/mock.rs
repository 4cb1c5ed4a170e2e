//! Recording device used by unit tests
//!
//! Hands out fabricated handles, keeps buffer contents in host memory and logs
//! every submission so tests can inspect ordering, sizes and lifetimes.

use ash::vk::{self, Handle};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use super::{BufferWrite, BuildSizes, MemoryLocation, RawBuffer, RayTracingDevice, RayTracingProperties, SharedDevice};
use crate::accel::{BuildCommand, GeometryDescription, StructureLevel};
use crate::error::{RtxError, RtxResult};

/// Fill byte for fresh mock buffers, so untouched padding is detectable
pub(crate) const POISON: u8 = 0xCD;

const BUFFER_ADDRESS_BASE: u64 = 0x1_0000_0000;
const STRUCTURE_ADDRESS_BASE: u64 = 0xA_0000_0000;

pub(crate) struct MockBuffer {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub contents: Vec<u8>,
}

pub(crate) struct MockStructure {
    pub level: StructureLevel,
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
}

#[derive(Default)]
pub(crate) struct MockState {
    next_handle: u64,
    pub buffers: HashMap<vk::Buffer, MockBuffer>,
    pub structures: HashMap<vk::AccelerationStructureKHR, MockStructure>,
    pub created_buffers: Vec<(vk::Buffer, vk::DeviceSize, vk::BufferUsageFlags)>,
    pub destroyed_structures: Vec<vk::AccelerationStructureKHR>,
    pub size_queries: Vec<GeometryDescription>,
    pub submissions: Vec<Vec<BuildCommand>>,
    pub handle_queries: Vec<(vk::Pipeline, u32, usize)>,
    pub structures_created: usize,
    pub address_skew: u64,
    pub fail_structure_creation_at: Option<usize>,
    pub fail_handle_query: bool,
    pub fail_submission: bool,
    pub zero_size_query: bool,
    pub short_handle_blob: bool,
}

pub(crate) struct MockDevice {
    properties: RayTracingProperties,
    pub state: RefCell<MockState>,
}

impl MockDevice {
    pub fn new() -> Arc<Self> {
        Self::with_properties(RayTracingProperties {
            shader_group_handle_size: 32,
            shader_group_base_alignment: 64,
            max_ray_recursion_depth: 31,
            min_scratch_offset_alignment: 128,
        })
    }

    pub fn with_properties(properties: RayTracingProperties) -> Arc<Self> {
        Arc::new(Self {
            properties,
            state: RefCell::new(MockState::default()),
        })
    }

    pub fn shared(self: &Arc<Self>) -> SharedDevice {
        self.clone()
    }

    /// Structure storage for a build of `primitive_count` primitives
    pub fn structure_size_for(geometry: &GeometryDescription) -> vk::DeviceSize {
        let count = u64::from(geometry.primitive_count());
        match geometry.level() {
            StructureLevel::BottomLevel => 1024 + 256 * count,
            StructureLevel::TopLevel => 512 + 128 * count,
        }
    }

    /// Scratch requirement for a build of `primitive_count` primitives
    pub fn scratch_size_for(geometry: &GeometryDescription) -> vk::DeviceSize {
        let count = u64::from(geometry.primitive_count());
        match geometry.level() {
            StructureLevel::BottomLevel => 2048 + 64 * count,
            StructureLevel::TopLevel => 4096 + 16 * count,
        }
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub fn live_structure_count(&self) -> usize {
        self.state.borrow().structures.len()
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state.borrow().buffers.get(&buffer).map(|b| b.contents.clone()).unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<Vec<BuildCommand>> {
        self.state.borrow().submissions.clone()
    }

    pub fn fail_structure_creation_at(&self, index: usize) {
        self.state.borrow_mut().fail_structure_creation_at = Some(index);
    }

    pub fn fail_handle_query(&self) {
        self.state.borrow_mut().fail_handle_query = true;
    }

    pub fn fail_submission(&self) {
        self.state.borrow_mut().fail_submission = true;
    }

    /// Offset every buffer address by `skew` bytes
    pub fn skew_buffer_addresses(&self, skew: u64) {
        self.state.borrow_mut().address_skew = skew;
    }

    pub fn report_zero_sizes(&self) {
        self.state.borrow_mut().zero_size_query = true;
    }

    pub fn return_short_handle_blob(&self) {
        self.state.borrow_mut().short_handle_blob = true;
    }

    /// Handle bytes the mock issues for `group`: every byte is `group + 1`
    pub fn handle_for_group(&self, group: u32) -> Vec<u8> {
        vec![(group + 1) as u8; self.properties.shader_group_handle_size as usize]
    }

    fn next_raw(state: &mut MockState) -> u64 {
        state.next_handle += 1;
        state.next_handle
    }
}

impl RayTracingDevice for MockDevice {
    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.properties
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RtxResult<RawBuffer> {
        let mut state = self.state.borrow_mut();
        let raw = Self::next_raw(&mut state);
        let buffer = vk::Buffer::from_raw(raw);
        let memory = vk::DeviceMemory::from_raw(raw);
        state.buffers.insert(
            buffer,
            MockBuffer {
                size,
                usage,
                location,
                contents: vec![POISON; size as usize],
            },
        );
        state.created_buffers.push((buffer, size, usage));
        Ok(RawBuffer { buffer, memory, size })
    }

    fn destroy_buffer(&self, buffer: &RawBuffer) {
        let removed = self.state.borrow_mut().buffers.remove(&buffer.buffer);
        assert!(removed.is_some(), "buffer {:?} destroyed twice", buffer.buffer);
    }

    fn write_buffer(&self, buffer: &RawBuffer, writes: &[BufferWrite<'_>]) -> RtxResult<()> {
        let mut state = self.state.borrow_mut();
        let target = state.buffers.get_mut(&buffer.buffer).ok_or_else(|| {
            RtxError::resource_creation("mapping of unknown buffer", vk::Result::ERROR_MEMORY_MAP_FAILED)
        })?;
        assert_eq!(target.location, MemoryLocation::HostVisible, "write to device-local buffer");
        for write in writes {
            let start = write.offset as usize;
            target.contents[start..start + write.bytes.len()].copy_from_slice(write.bytes);
        }
        Ok(())
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let state = self.state.borrow();
        let usage = state.buffers.get(&buffer).map(|b| b.usage).unwrap_or_default();
        assert!(
            usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
            "address queried for buffer without SHADER_DEVICE_ADDRESS usage"
        );
        BUFFER_ADDRESS_BASE + buffer.as_raw() * 0x10000 + state.address_skew
    }

    fn acceleration_structure_build_sizes(
        &self,
        geometry: &GeometryDescription,
        _flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> RtxResult<BuildSizes> {
        let mut state = self.state.borrow_mut();
        state.size_queries.push(*geometry);
        if state.zero_size_query {
            return Ok(BuildSizes::default());
        }
        Ok(BuildSizes {
            structure_size: Self::structure_size_for(geometry),
            build_scratch_size: Self::scratch_size_for(geometry),
        })
    }

    fn create_acceleration_structure(
        &self,
        level: StructureLevel,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> RtxResult<vk::AccelerationStructureKHR> {
        let mut state = self.state.borrow_mut();
        let index = state.structures_created;
        state.structures_created += 1;
        if state.fail_structure_creation_at == Some(index) {
            return Err(RtxError::resource_creation(
                "acceleration structure",
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ));
        }
        let backing = state.buffers.get(&buffer).map(|b| b.size).unwrap_or_default();
        assert!(size <= backing, "structure larger than its storage buffer");

        let raw = Self::next_raw(&mut state);
        let structure = vk::AccelerationStructureKHR::from_raw(raw);
        state.structures.insert(structure, MockStructure { level, buffer, size });
        Ok(structure)
    }

    fn destroy_acceleration_structure(&self, structure: vk::AccelerationStructureKHR) {
        let mut state = self.state.borrow_mut();
        let removed = state.structures.remove(&structure);
        assert!(removed.is_some(), "structure {:?} destroyed twice", structure);
        state.destroyed_structures.push(structure);
    }

    fn acceleration_structure_device_address(
        &self,
        structure: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        STRUCTURE_ADDRESS_BASE + structure.as_raw() * 0x100
    }

    fn shader_group_handles(
        &self,
        pipeline: vk::Pipeline,
        group_count: u32,
        data_size: usize,
    ) -> RtxResult<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        state.handle_queries.push((pipeline, group_count, data_size));
        if state.fail_handle_query {
            return Err(RtxError::capability_query(
                "shader group handles",
                format!("{:?}", vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            ));
        }
        let mut blob: Vec<u8> = (0..group_count).flat_map(|group| self.handle_for_group(group)).collect();
        assert_eq!(blob.len(), data_size, "handle blob size mismatch");
        if state.short_handle_blob {
            blob.truncate(data_size / 2);
        }
        Ok(blob)
    }

    fn submit_build_commands(&self, commands: &[BuildCommand]) -> RtxResult<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_submission {
            return Err(RtxError::submission("queue submit", vk::Result::ERROR_DEVICE_LOST));
        }
        for command in commands {
            if let BuildCommand::Build { destination, .. } = command {
                assert!(
                    state.structures.contains_key(destination),
                    "build recorded for a destroyed structure"
                );
            }
        }
        state.submissions.push(commands.to_vec());
        Ok(())
    }
}
