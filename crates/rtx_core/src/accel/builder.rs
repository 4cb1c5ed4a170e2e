//! Load-time acceleration structure builds
//!
//! Structures are created eagerly (so their device addresses are known when
//! instance records are written) and built later in one submission:
//!
//! 1. one scratch buffer sized to the largest scratch requirement, its
//!    address aligned to the device's scratch offset alignment
//! 2. each bottom-level build, followed by a structure write → read barrier
//! 3. the top-level build and its barrier
//! 4. submit, wait for queue idle, release scratch and instance input

use ash::vk;

use super::geometry::{BuildCommand, GeometryDescription, InstanceGeometry, StructureLevel};
use super::AccelerationStructure;
use crate::config::BuildPreference;
use crate::device::{MemoryLocation, SharedDevice};
use crate::error::{RtxError, RtxResult};
use crate::render::backends::vulkan::MemoryBarrierBuilder;
use crate::resources::{align_up, GpuBuffer};
use crate::scene::{Instance, InstanceRecord, Mesh};

struct PendingBuild {
    destination: vk::AccelerationStructureKHR,
    geometry: GeometryDescription,
    scratch_size: vk::DeviceSize,
}

/// Statistics of a completed build submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSummary {
    /// Bottom-level structures built
    pub bottom_level_count: usize,
    /// Top-level structures built
    pub top_level_count: usize,
    /// Size of the shared scratch buffer
    pub scratch_size: vk::DeviceSize,
    /// Sum of all structure storage sizes
    pub structure_bytes: vk::DeviceSize,
}

/// Collects structure builds and submits them as one command sequence
pub struct AccelerationStructureBuilder {
    device: SharedDevice,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    pending: Vec<PendingBuild>,
    build_inputs: Vec<GpuBuffer>,
    summary: BuildSummary,
}

impl AccelerationStructureBuilder {
    /// Create a builder preferring fast traversal
    pub fn new(device: &SharedDevice) -> Self {
        Self {
            device: device.clone(),
            flags: BuildPreference::FastTrace.flags(),
            pending: Vec::new(),
            build_inputs: Vec::new(),
            summary: BuildSummary::default(),
        }
    }

    /// Set the build preference for every structure
    pub fn with_build_preference(mut self, preference: BuildPreference) -> Self {
        self.flags = preference.flags();
        self
    }

    /// Build flags used for every structure
    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    /// Create one bottom-level structure per mesh and queue its build.
    /// Structures are returned in mesh order.
    pub fn build_bottom_level(&mut self, meshes: &[Mesh]) -> RtxResult<Vec<AccelerationStructure>> {
        if self.summary.top_level_count > 0 {
            return Err(RtxError::protocol(
                "bottom-level builds must be queued before the top-level build",
            ));
        }
        if meshes.is_empty() {
            return Err(RtxError::invalid_scene("no meshes to build"));
        }

        let checkpoint = (self.pending.len(), self.summary);
        let result = meshes
            .iter()
            .map(|mesh| mesh.geometry().and_then(|geometry| self.create_and_queue(geometry)))
            .collect::<RtxResult<Vec<AccelerationStructure>>>();

        // Structures created so far were dropped with the partial result
        let structures = match result {
            Ok(structures) => structures,
            Err(e) => {
                self.pending.truncate(checkpoint.0);
                self.summary = checkpoint.1;
                return Err(e);
            }
        };

        log::info!("Queued {} bottom-level structure builds", structures.len());
        Ok(structures)
    }

    /// Write the instance records to a host-visible buffer, create the
    /// top-level structure and queue its build after every bottom-level build.
    /// On failure every queued build is dropped, so a later `submit` cannot
    /// build the bottom level without its top level.
    pub fn build_top_level(&mut self, instances: &[Instance]) -> RtxResult<AccelerationStructure> {
        if self.summary.top_level_count > 0 {
            return Err(RtxError::protocol("top-level build already queued"));
        }
        if instances.is_empty() {
            return Err(RtxError::invalid_scene("no instances for the top-level structure"));
        }

        match self.queue_top_level(instances) {
            Ok(structure) => Ok(structure),
            Err(e) => {
                log::warn!("Top-level build failed, discarding {} queued builds", self.pending.len());
                self.pending.clear();
                self.build_inputs.clear();
                self.summary = BuildSummary::default();
                Err(e)
            }
        }
    }

    fn queue_top_level(&mut self, instances: &[Instance]) -> RtxResult<AccelerationStructure> {
        let records = instances
            .iter()
            .map(Instance::to_record)
            .collect::<RtxResult<Vec<InstanceRecord>>>()?;

        let instance_buffer = GpuBuffer::with_data(
            &self.device,
            &records,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;

        let geometry = GeometryDescription::Instances(InstanceGeometry {
            instance_address: instance_buffer.require_device_address()?,
            instance_count: records.len() as u32,
        });
        let structure = self.create_and_queue(geometry)?;
        self.build_inputs.push(instance_buffer);

        log::info!("Queued top-level structure build over {} instances", records.len());
        Ok(structure)
    }

    /// Largest scratch requirement among the queued builds
    pub fn scratch_size(&self) -> vk::DeviceSize {
        self.pending.iter().map(|build| build.scratch_size).max().unwrap_or(0)
    }

    /// Record every queued build into one command sequence, submit it and
    /// wait for the queue to go idle. The scratch buffer and the instance
    /// buffer are released afterwards.
    pub fn submit(mut self) -> RtxResult<BuildSummary> {
        if self.pending.is_empty() {
            return Err(RtxError::protocol("no acceleration structure builds queued"));
        }

        let scratch_size = self.scratch_size();
        let alignment = u64::from(self.device.ray_tracing_properties().min_scratch_offset_alignment).max(1);
        // Over-allocate so the aligned start still leaves `scratch_size` bytes
        let scratch = GpuBuffer::new(
            &self.device,
            scratch_size + alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::DeviceLocal,
        )?;
        let scratch_address = align_up(scratch.require_device_address()?, alignment);

        let barrier = MemoryBarrierBuilder::acceleration_structure_write_to_read();
        let commands: Vec<BuildCommand> = self
            .pending
            .iter()
            .flat_map(|build| {
                [
                    BuildCommand::Build {
                        destination: build.destination,
                        geometry: build.geometry,
                        flags: self.flags,
                        scratch_address,
                    },
                    BuildCommand::Barrier(barrier),
                ]
            })
            .collect();

        self.device.submit_build_commands(&commands)?;

        drop(scratch);
        self.build_inputs.clear();

        self.summary.scratch_size = scratch_size;
        log::info!(
            "Built {} bottom-level and {} top-level structures ({} bytes storage, {} bytes scratch)",
            self.summary.bottom_level_count,
            self.summary.top_level_count,
            self.summary.structure_bytes,
            scratch_size
        );
        Ok(self.summary)
    }

    fn create_and_queue(&mut self, geometry: GeometryDescription) -> RtxResult<AccelerationStructure> {
        let level = geometry.level();
        let sizes = self.device.acceleration_structure_build_sizes(&geometry, self.flags)?;
        if sizes.structure_size == 0 || sizes.build_scratch_size == 0 {
            return Err(RtxError::capability_query(
                "acceleration structure build sizes",
                format!(
                    "{:?} build reported {} bytes storage and {} bytes scratch",
                    level, sizes.structure_size, sizes.build_scratch_size
                ),
            ));
        }

        let structure = AccelerationStructure::create(&self.device, level, sizes)?;

        self.pending.push(PendingBuild {
            destination: structure.handle(),
            geometry,
            scratch_size: sizes.build_scratch_size,
        });
        match level {
            StructureLevel::BottomLevel => self.summary.bottom_level_count += 1,
            StructureLevel::TopLevel => self.summary.top_level_count += 1,
        }
        self.summary.structure_bytes += sizes.structure_size;

        Ok(structure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;
    use ash::vk::Handle;
    use crate::scene::{Mesh, MeshData};

    fn upload(device: &SharedDevice, triangles: u32) -> Mesh {
        Mesh::upload(device, &MeshData::fan(triangles)).unwrap()
    }

    fn instances_for(blas: &[AccelerationStructure]) -> Vec<Instance> {
        blas.iter()
            .enumerate()
            .map(|(i, s)| Instance::new(i as u32, s.device_address()))
            .collect()
    }

    #[test]
    fn test_one_bottom_level_per_mesh_with_face_counts() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let meshes = vec![upload(&device, 1), upload(&device, 4), upload(&device, 9)];

        let mut builder = AccelerationStructureBuilder::new(&device);
        let blas = builder.build_bottom_level(&meshes).unwrap();
        assert_eq!(blas.len(), 3);

        let queries = mock.state.borrow().size_queries.clone();
        let counts: Vec<u32> = queries.iter().map(GeometryDescription::primitive_count).collect();
        assert_eq!(counts, vec![1, 4, 9]);
        assert!(blas.iter().all(|s| s.level() == StructureLevel::BottomLevel));
    }

    #[test]
    fn test_single_submission_with_barriers_and_top_level_last() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let meshes = vec![upload(&device, 2), upload(&device, 3)];

        let mut builder = AccelerationStructureBuilder::new(&device);
        let blas = builder.build_bottom_level(&meshes).unwrap();
        let tlas = builder.build_top_level(&instances_for(&blas)).unwrap();
        let summary = builder.submit().unwrap();

        assert_eq!(summary.bottom_level_count, 2);
        assert_eq!(summary.top_level_count, 1);

        let submissions = mock.submissions();
        assert_eq!(submissions.len(), 1);
        let commands = &submissions[0];
        assert_eq!(commands.len(), 6);

        for pair in commands.chunks(2) {
            assert!(pair[0].is_build());
            match pair[1] {
                BuildCommand::Barrier(barrier) => {
                    assert_eq!(barrier.src_access_mask, vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR);
                    assert_eq!(barrier.dst_access_mask, vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR);
                }
                BuildCommand::Build { .. } => panic!("build not followed by a barrier"),
            }
        }

        let destinations: Vec<vk::AccelerationStructureKHR> = commands
            .iter()
            .filter_map(|command| match command {
                BuildCommand::Build { destination, .. } => Some(*destination),
                BuildCommand::Barrier(_) => None,
            })
            .collect();
        assert_eq!(destinations, vec![blas[0].handle(), blas[1].handle(), tlas.handle()]);
        match commands[4] {
            BuildCommand::Build { geometry, .. } => {
                assert_eq!(geometry.level(), StructureLevel::TopLevel);
                assert_eq!(geometry.primitive_count(), 2);
            }
            BuildCommand::Barrier(_) => panic!("expected top-level build"),
        }
    }

    #[test]
    fn test_scratch_sized_to_maximum_and_shared() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let meshes = vec![upload(&device, 1), upload(&device, 40), upload(&device, 5)];

        let mut builder = AccelerationStructureBuilder::new(&device);
        let blas = builder.build_bottom_level(&meshes).unwrap();
        let _tlas = builder.build_top_level(&instances_for(&blas)).unwrap();

        let expected = mock
            .state
            .borrow()
            .size_queries
            .iter()
            .map(MockDevice::scratch_size_for)
            .max()
            .unwrap();
        assert_eq!(builder.scratch_size(), expected);

        let buffers_before = mock.live_buffer_count();
        let summary = builder.submit().unwrap();
        assert_eq!(summary.scratch_size, expected);

        let state = mock.state.borrow();
        let scratch_buffers: Vec<_> = state
            .created_buffers
            .iter()
            .filter(|(_, _, usage)| *usage == vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .collect();
        assert_eq!(scratch_buffers.len(), 1);
        assert_eq!(scratch_buffers[0].1, expected + 128);

        let scratch_addresses: Vec<vk::DeviceAddress> = state.submissions[0]
            .iter()
            .filter_map(|command| match command {
                BuildCommand::Build { scratch_address, .. } => Some(*scratch_address),
                BuildCommand::Barrier(_) => None,
            })
            .collect();
        assert!(scratch_addresses.windows(2).all(|pair| pair[0] == pair[1]));
        drop(state);

        // scratch and the instance buffer are gone after the submission
        assert_eq!(mock.live_buffer_count(), buffers_before - 1);
    }

    #[test]
    fn test_instance_buffer_holds_packed_records() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let meshes = vec![upload(&device, 1), upload(&device, 2)];

        let mut builder = AccelerationStructureBuilder::new(&device);
        let blas = builder.build_bottom_level(&meshes).unwrap();
        let _tlas = builder.build_top_level(&instances_for(&blas)).unwrap();

        let instance_buffer = builder.build_inputs[0].handle();
        let contents = mock.buffer_contents(instance_buffer);
        assert_eq!(contents.len(), 2 * std::mem::size_of::<InstanceRecord>());

        let records: Vec<InstanceRecord> = contents
            .chunks_exact(std::mem::size_of::<InstanceRecord>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.custom_index(), i as u32);
            assert_eq!(record.mask(), 0xFF);
            assert_eq!(record.acceleration_structure_reference, blas[i].device_address());
        }
    }

    #[test]
    fn test_failure_midway_destroys_created_structures() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let meshes = vec![upload(&device, 1), upload(&device, 2), upload(&device, 3)];
        let mesh_buffers = mock.live_buffer_count();

        mock.fail_structure_creation_at(2);
        let mut builder = AccelerationStructureBuilder::new(&device);
        let result = builder.build_bottom_level(&meshes);
        assert!(matches!(result, Err(RtxError::ResourceCreationFailure { .. })));
        assert_eq!(builder.scratch_size(), 0);
        drop(builder);

        assert_eq!(mock.live_structure_count(), 0);
        assert_eq!(mock.state.borrow().destroyed_structures.len(), 2);
        assert_eq!(mock.live_buffer_count(), mesh_buffers);
        assert!(mock.submissions().is_empty());
    }

    #[test]
    fn test_zero_size_query_is_capability_failure() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let meshes = vec![upload(&device, 1)];
        mock.report_zero_sizes();

        let mut builder = AccelerationStructureBuilder::new(&device);
        let result = builder.build_bottom_level(&meshes);
        assert!(matches!(result, Err(RtxError::CapabilityQueryFailure { .. })));
        assert_eq!(mock.live_structure_count(), 0);
    }

    #[test]
    fn test_submission_failure_propagates() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let meshes = vec![upload(&device, 1)];

        let mut builder = AccelerationStructureBuilder::new(&device);
        let blas = builder.build_bottom_level(&meshes).unwrap();
        let tlas = builder.build_top_level(&instances_for(&blas)).unwrap();
        mock.fail_submission();
        assert!(matches!(builder.submit(), Err(RtxError::SubmissionFailure { .. })));

        drop(tlas);
        drop(blas);
        assert_eq!(mock.live_structure_count(), 0);
    }

    #[test]
    fn test_protocol_order_enforced() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let meshes = vec![upload(&device, 1)];

        let mut builder = AccelerationStructureBuilder::new(&device);
        let blas = builder.build_bottom_level(&meshes).unwrap();
        let _tlas = builder.build_top_level(&instances_for(&blas)).unwrap();
        assert!(matches!(
            builder.build_bottom_level(&meshes),
            Err(RtxError::ProtocolViolation { .. })
        ));
        assert!(builder.build_top_level(&instances_for(&blas)).is_err());

        let empty = AccelerationStructureBuilder::new(&device);
        assert!(matches!(empty.submit(), Err(RtxError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let mut builder = AccelerationStructureBuilder::new(&device);
        assert!(matches!(
            builder.build_bottom_level(&[]),
            Err(RtxError::InvalidSceneData { .. })
        ));
        assert!(matches!(
            builder.build_top_level(&[]),
            Err(RtxError::InvalidSceneData { .. })
        ));
    }

    #[test]
    fn test_build_preference_flags_recorded() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let meshes = vec![upload(&device, 1)];

        let mut builder =
            AccelerationStructureBuilder::new(&device).with_build_preference(BuildPreference::FastBuild);
        let blas = builder.build_bottom_level(&meshes).unwrap();
        let _tlas = builder.build_top_level(&instances_for(&blas)).unwrap();
        builder.submit().unwrap();

        let submissions = mock.submissions();
        for command in &submissions[0] {
            if let BuildCommand::Build { flags, .. } = command {
                assert_eq!(*flags, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD);
            }
        }
    }

    #[test]
    fn test_scratch_address_aligned_when_buffer_address_is_not() {
        let mock = MockDevice::new();
        let device = mock.shared();
        mock.skew_buffer_addresses(16);
        let meshes = vec![upload(&device, 3)];

        let mut builder = AccelerationStructureBuilder::new(&device);
        let blas = builder.build_bottom_level(&meshes).unwrap();
        let _tlas = builder.build_top_level(&instances_for(&blas)).unwrap();
        let required = builder.scratch_size();
        builder.submit().unwrap();

        let state = mock.state.borrow();
        let (scratch, size, _) = *state
            .created_buffers
            .iter()
            .find(|(_, _, usage)| *usage == vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .unwrap();
        let raw_address = 0x1_0000_0000 + scratch.as_raw() * 0x10000 + 16;
        assert_ne!(raw_address % 128, 0);

        for command in &state.submissions[0] {
            if let BuildCommand::Build { scratch_address, .. } = command {
                assert_eq!(scratch_address % 128, 0);
                assert!(*scratch_address >= raw_address);
                assert!(scratch_address + required <= raw_address + size);
            }
        }
    }

    #[test]
    fn test_failed_top_level_discards_queued_builds() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let meshes = vec![upload(&device, 2)];

        let mut builder = AccelerationStructureBuilder::new(&device);
        let blas = builder.build_bottom_level(&meshes).unwrap();
        mock.fail_structure_creation_at(1);
        assert!(matches!(
            builder.build_top_level(&instances_for(&blas)),
            Err(RtxError::ResourceCreationFailure { .. })
        ));
        assert_eq!(builder.scratch_size(), 0);
        assert!(builder.build_inputs.is_empty());

        assert!(matches!(builder.submit(), Err(RtxError::ProtocolViolation { .. })));
        assert!(mock.submissions().is_empty());
    }
}
