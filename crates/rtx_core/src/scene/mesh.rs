//! Triangle meshes
//!
//! [`MeshData`] is the host-side description handed over by the scene loader.
//! [`Mesh::upload`] validates it and copies it into five device-addressable
//! buffers that both the structure build and the hit shaders read.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use nalgebra::Vector3;

use super::StructureKey;
use crate::accel::{GeometryDescription, TriangleGeometry};
use crate::device::SharedDevice;
use crate::error::{RtxError, RtxResult};
use crate::resources::GpuBuffer;

/// Byte stride of one position
pub const POSITION_STRIDE: vk::DeviceSize = std::mem::size_of::<[f32; 3]>() as vk::DeviceSize;

/// Per-vertex shading attributes, std430 compatible
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct VertexAttribute {
    /// Normal in xyz, w unused
    pub normal: [f32; 4],
    /// Texture coordinate in xy, zw unused
    pub uv: [f32; 4],
}

impl VertexAttribute {
    /// Attribute from a normal and a texture coordinate
    pub fn new(normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            normal: [normal[0], normal[1], normal[2], 0.0],
            uv: [uv[0], uv[1], 0.0, 0.0],
        }
    }
}

/// Host-side triangle mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    /// Vertex positions
    pub positions: Vec<[f32; 3]>,
    /// One attribute per vertex
    pub attributes: Vec<VertexAttribute>,
    /// Triangle list indices
    pub indices: Vec<u32>,
    /// One material id per triangle
    pub material_ids: Vec<u32>,
}

impl MeshData {
    /// Mesh from explicit arrays
    pub fn new(
        positions: Vec<[f32; 3]>,
        attributes: Vec<VertexAttribute>,
        indices: Vec<u32>,
        material_ids: Vec<u32>,
    ) -> Self {
        Self {
            positions,
            attributes,
            indices,
            material_ids,
        }
    }

    /// Mesh with one material and normals averaged from the faces around
    /// each vertex. Texture coordinates are zero.
    pub fn from_triangles(positions: Vec<[f32; 3]>, indices: Vec<u32>, material_id: u32) -> Self {
        let mut normals = vec![Vector3::<f32>::zeros(); positions.len()];
        for face in indices.chunks_exact(3) {
            let corners: Option<Vec<Vector3<f32>>> = face
                .iter()
                .map(|&i| positions.get(i as usize).map(|p| Vector3::from(*p)))
                .collect();
            let Some(corners) = corners else { continue };
            let face_normal = (corners[1] - corners[0]).cross(&(corners[2] - corners[0]));
            for &i in face {
                normals[i as usize] += face_normal;
            }
        }

        let attributes = normals
            .iter()
            .map(|n| {
                let n = n.try_normalize(f32::EPSILON).unwrap_or_else(Vector3::y);
                VertexAttribute::new([n.x, n.y, n.z], [0.0, 0.0])
            })
            .collect();
        let material_ids = vec![material_id; indices.len() / 3];

        Self {
            positions,
            attributes,
            indices,
            material_ids,
        }
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of triangles
    pub fn face_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Check the arrays are consistent before upload
    pub fn validate(&self) -> RtxResult<()> {
        if self.positions.is_empty() {
            return Err(RtxError::invalid_scene("mesh has no vertices"));
        }
        if self.indices.is_empty() || self.indices.len() % 3 != 0 {
            return Err(RtxError::invalid_scene(format!(
                "index count {} is not a positive multiple of 3",
                self.indices.len()
            )));
        }
        if let Some(index) = self.indices.iter().find(|&&i| i as usize >= self.positions.len()) {
            return Err(RtxError::invalid_scene(format!(
                "index {} out of range for {} vertices",
                index,
                self.positions.len()
            )));
        }
        if self.attributes.len() != self.positions.len() {
            return Err(RtxError::invalid_scene(format!(
                "{} attributes for {} vertices",
                self.attributes.len(),
                self.positions.len()
            )));
        }
        if self.material_ids.len() != self.face_count() {
            return Err(RtxError::invalid_scene(format!(
                "{} material ids for {} faces",
                self.material_ids.len(),
                self.face_count()
            )));
        }
        if self.positions.iter().flatten().any(|c| !c.is_finite()) {
            return Err(RtxError::invalid_scene("non-finite vertex position"));
        }
        if u32::try_from(self.positions.len()).is_err() {
            return Err(RtxError::invalid_scene("too many vertices"));
        }
        Ok(())
    }

    /// One `(a, b, c, 0)` quad per face, the layout hit shaders index
    pub fn face_quads(&self) -> Vec<[u32; 4]> {
        self.indices
            .chunks_exact(3)
            .map(|face| [face[0], face[1], face[2], 0])
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn fan(triangles: u32) -> Self {
        let rim = triangles + 1;
        let positions = std::iter::once([0.0, 0.0, 0.0])
            .chain((0..rim).map(|i| {
                let angle = i as f32 / rim as f32 * std::f32::consts::PI;
                [angle.cos(), 0.0, angle.sin()]
            }))
            .collect();
        let indices = (0..triangles).flat_map(|i| [0, i + 1, i + 2]).collect();
        Self::from_triangles(positions, indices, 0)
    }
}

/// Mesh uploaded to the device
pub struct Mesh {
    num_vertices: u32,
    num_faces: u32,
    positions: GpuBuffer,
    attributes: GpuBuffer,
    indices: GpuBuffer,
    faces: GpuBuffer,
    material_ids: GpuBuffer,
    blas: Option<StructureKey>,
}

impl Mesh {
    /// Usage flags shared by every mesh buffer
    pub const BUFFER_USAGE: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR.as_raw()
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS.as_raw()
            | vk::BufferUsageFlags::STORAGE_BUFFER.as_raw(),
    );

    /// Validate `data` and copy it into host-visible buffers
    pub fn upload(device: &SharedDevice, data: &MeshData) -> RtxResult<Self> {
        data.validate()?;

        let positions = GpuBuffer::with_data(device, &data.positions, Self::BUFFER_USAGE)?;
        let attributes = GpuBuffer::with_data(device, &data.attributes, Self::BUFFER_USAGE)?;
        let indices = GpuBuffer::with_data(device, &data.indices, Self::BUFFER_USAGE)?;
        let faces = GpuBuffer::with_data(device, &data.face_quads(), Self::BUFFER_USAGE)?;
        let material_ids = GpuBuffer::with_data(device, &data.material_ids, Self::BUFFER_USAGE)?;

        log::debug!(
            "Uploaded mesh: {} vertices, {} faces",
            data.vertex_count(),
            data.face_count()
        );

        Ok(Self {
            num_vertices: data.vertex_count() as u32,
            num_faces: data.face_count() as u32,
            positions,
            attributes,
            indices,
            faces,
            material_ids,
            blas: None,
        })
    }

    /// Triangle input for this mesh's bottom-level build
    pub fn geometry(&self) -> RtxResult<GeometryDescription> {
        Ok(GeometryDescription::Triangles(TriangleGeometry {
            vertex_address: self.positions.require_device_address()?,
            vertex_stride: POSITION_STRIDE,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            max_vertex: self.num_vertices - 1,
            index_address: self.indices.require_device_address()?,
            index_type: vk::IndexType::UINT32,
            triangle_count: self.num_faces,
        }))
    }

    /// Number of vertices
    pub fn num_vertices(&self) -> u32 {
        self.num_vertices
    }

    /// Number of triangles
    pub fn num_faces(&self) -> u32 {
        self.num_faces
    }

    /// Position buffer
    pub fn positions(&self) -> &GpuBuffer {
        &self.positions
    }

    /// Vertex attribute buffer
    pub fn attributes(&self) -> &GpuBuffer {
        &self.attributes
    }

    /// Index buffer
    pub fn indices(&self) -> &GpuBuffer {
        &self.indices
    }

    /// Face quad buffer
    pub fn faces(&self) -> &GpuBuffer {
        &self.faces
    }

    /// Material id buffer
    pub fn material_ids(&self) -> &GpuBuffer {
        &self.material_ids
    }

    /// Key of this mesh's bottom-level structure, once built
    pub fn blas(&self) -> Option<StructureKey> {
        self.blas
    }

    pub(crate) fn set_blas(&mut self, key: Option<StructureKey>) {
        self.blas = key;
    }
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("num_vertices", &self.num_vertices)
            .field("num_faces", &self.num_faces)
            .field("blas", &self.blas)
            .finish_non_exhaustive()
    }
}
