//! Geometry descriptions and recorded build commands

use ash::vk;

/// Level of an acceleration structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StructureLevel {
    /// Triangles of one mesh
    BottomLevel,
    /// Instances referencing bottom-level structures
    TopLevel,
}

impl StructureLevel {
    /// Vulkan structure type
    pub fn vk_type(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Self::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Self::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

/// Indexed triangle geometry read from device-addressable buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriangleGeometry {
    /// Address of the position buffer
    pub vertex_address: vk::DeviceAddress,
    /// Byte stride between positions
    pub vertex_stride: vk::DeviceSize,
    /// Position format
    pub vertex_format: vk::Format,
    /// Highest vertex index referenced
    pub max_vertex: u32,
    /// Address of the index buffer
    pub index_address: vk::DeviceAddress,
    /// Index format
    pub index_type: vk::IndexType,
    /// Number of triangles
    pub triangle_count: u32,
}

/// Packed instance records read from a device-addressable buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceGeometry {
    /// Address of the first instance record
    pub instance_address: vk::DeviceAddress,
    /// Number of instance records
    pub instance_count: u32,
}

/// Geometry consumed by one acceleration structure build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryDescription {
    /// Bottom-level triangle input
    Triangles(TriangleGeometry),
    /// Top-level instance input
    Instances(InstanceGeometry),
}

impl GeometryDescription {
    /// Structure level this geometry builds
    pub fn level(&self) -> StructureLevel {
        match self {
            Self::Triangles(_) => StructureLevel::BottomLevel,
            Self::Instances(_) => StructureLevel::TopLevel,
        }
    }

    /// Primitive count for the build range: triangles or instances
    pub fn primitive_count(&self) -> u32 {
        match self {
            Self::Triangles(triangles) => triangles.triangle_count,
            Self::Instances(instances) => instances.instance_count,
        }
    }

    /// Vulkan geometry entry. All geometry is marked opaque.
    pub fn to_vk(&self) -> vk::AccelerationStructureGeometryKHR {
        match self {
            Self::Triangles(triangles) => {
                let data = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                    .vertex_format(triangles.vertex_format)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: triangles.vertex_address,
                    })
                    .vertex_stride(triangles.vertex_stride)
                    .max_vertex(triangles.max_vertex)
                    .index_type(triangles.index_type)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: triangles.index_address,
                    })
                    .build();

                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles: data })
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .build()
            }
            Self::Instances(instances) => {
                let data = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: instances.instance_address,
                    })
                    .build();

                vk::AccelerationStructureGeometryKHR::builder()
                    .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { instances: data })
                    .flags(vk::GeometryFlagsKHR::OPAQUE)
                    .build()
            }
        }
    }

    /// Build range covering every primitive
    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::builder()
            .primitive_count(self.primitive_count())
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
            .build()
    }
}

/// One step of a recorded build sequence
#[derive(Debug, Clone, Copy)]
pub enum BuildCommand {
    /// Build `destination` from `geometry` using scratch memory at `scratch_address`
    Build {
        /// Structure being built
        destination: vk::AccelerationStructureKHR,
        /// Build input
        geometry: GeometryDescription,
        /// Build flags
        flags: vk::BuildAccelerationStructureFlagsKHR,
        /// Scratch memory address
        scratch_address: vk::DeviceAddress,
    },
    /// Memory barrier at the acceleration-structure build stage
    Barrier(vk::MemoryBarrier),
}

impl BuildCommand {
    /// Whether this is a build step
    pub fn is_build(&self) -> bool {
        matches!(self, Self::Build { .. })
    }
}
