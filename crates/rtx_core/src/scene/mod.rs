//! Scene data and acceleration structure ownership
//!
//! The scene owns the uploaded meshes and every acceleration structure built
//! over them. Structures live in a slot map arena and meshes refer to their
//! bottom-level structure by key, so teardown can release the top level
//! first, then the bottom levels, then the mesh buffers.

pub mod instance;
pub mod mesh;

pub use instance::{Instance, InstanceRecord};
pub use mesh::{Mesh, MeshData, VertexAttribute};

use ash::vk;
use slotmap::SlotMap;

use crate::accel::{AccelerationStructure, AccelerationStructureBuilder, BuildSummary};
use crate::config::BuildPreference;
use crate::device::SharedDevice;
use crate::error::{RtxError, RtxResult};

slotmap::new_key_type! {
    /// Key of an acceleration structure owned by a [`Scene`]
    pub struct StructureKey;
}

/// Meshes plus the structures built over them
pub struct Scene {
    device: SharedDevice,
    meshes: Vec<Mesh>,
    structures: SlotMap<StructureKey, AccelerationStructure>,
    tlas: Option<StructureKey>,
}

impl Scene {
    /// Empty scene on `device`
    pub fn new(device: &SharedDevice) -> Self {
        Self {
            device: device.clone(),
            meshes: Vec::new(),
            structures: SlotMap::with_key(),
            tlas: None,
        }
    }

    /// Scene holding an upload of every mesh in `meshes`
    pub fn from_mesh_data(device: &SharedDevice, meshes: &[MeshData]) -> RtxResult<Self> {
        let mut scene = Self::new(device);
        for data in meshes {
            scene.upload_mesh(data)?;
        }
        Ok(scene)
    }

    /// Upload `data` and add it to the scene, returning its index
    pub fn upload_mesh(&mut self, data: &MeshData) -> RtxResult<usize> {
        let mesh = Mesh::upload(&self.device, data)?;
        self.add_mesh(mesh)
    }

    /// Add an uploaded mesh, returning its index
    pub fn add_mesh(&mut self, mesh: Mesh) -> RtxResult<usize> {
        if self.tlas.is_some() {
            return Err(RtxError::protocol("meshes cannot be added after the structures are built"));
        }
        self.meshes.push(mesh);
        Ok(self.meshes.len() - 1)
    }

    /// Uploaded meshes in insertion order
    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    /// Build one bottom-level structure per mesh and a top-level structure
    /// with one identity instance per mesh, in a single submission. The
    /// scene keeps the structures only when the whole build succeeds.
    pub fn build_acceleration_structures(&mut self, preference: BuildPreference) -> RtxResult<BuildSummary> {
        if self.tlas.is_some() {
            return Err(RtxError::protocol("scene acceleration structures are already built"));
        }
        if self.meshes.is_empty() {
            return Err(RtxError::invalid_scene("scene has no meshes"));
        }

        let mut builder = AccelerationStructureBuilder::new(&self.device).with_build_preference(preference);
        let blas = builder.build_bottom_level(&self.meshes)?;
        let instances: Vec<Instance> = blas
            .iter()
            .enumerate()
            .map(|(index, structure)| Instance::new(index as u32, structure.device_address()))
            .collect();
        let tlas = builder.build_top_level(&instances)?;
        let summary = builder.submit()?;

        for (mesh, structure) in self.meshes.iter_mut().zip(blas) {
            let key = self.structures.insert(structure);
            mesh.set_blas(Some(key));
        }
        self.tlas = Some(self.structures.insert(tlas));

        Ok(summary)
    }

    /// Instances of the built top-level structure, one per mesh
    pub fn instances(&self) -> RtxResult<Vec<Instance>> {
        self.meshes
            .iter()
            .enumerate()
            .map(|(index, mesh)| {
                let structure = mesh
                    .blas()
                    .and_then(|key| self.structures.get(key))
                    .ok_or_else(|| RtxError::protocol(format!("mesh {} has no bottom-level structure", index)))?;
                Ok(Instance::new(index as u32, structure.device_address()))
            })
            .collect()
    }

    /// Top-level structure, once built
    pub fn tlas(&self) -> Option<&AccelerationStructure> {
        self.tlas.and_then(|key| self.structures.get(key))
    }

    /// Bottom-level structure of mesh `index`, once built
    pub fn blas(&self, index: usize) -> Option<&AccelerationStructure> {
        self.meshes
            .get(index)
            .and_then(Mesh::blas)
            .and_then(|key| self.structures.get(key))
    }

    /// Top-level handle, or a null handle before the build
    pub fn tlas_handle(&self) -> vk::AccelerationStructureKHR {
        self.tlas().map_or_else(vk::AccelerationStructureKHR::null, AccelerationStructure::handle)
    }

    /// Number of live structures
    pub fn structure_count(&self) -> usize {
        self.structures.len()
    }

    /// Release the top-level structure, then every bottom-level structure,
    /// then the mesh buffers. Safe to call more than once.
    pub fn teardown(&mut self) {
        if let Some(key) = self.tlas.take() {
            self.structures.remove(key);
        }
        for mesh in &mut self.meshes {
            if let Some(key) = mesh.blas() {
                self.structures.remove(key);
                mesh.set_blas(None);
            }
        }
        self.structures.clear();
        if !self.meshes.is_empty() {
            log::debug!("Releasing {} meshes", self.meshes.len());
        }
        self.meshes.clear();
    }
}

impl Drop for Scene {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scene")
            .field("meshes", &self.meshes)
            .field("structures", &self.structures.len())
            .field("tlas", &self.tlas)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockDevice;

    fn scene_with(mock: &std::sync::Arc<MockDevice>, fans: &[u32]) -> Scene {
        let meshes: Vec<MeshData> = fans.iter().map(|&n| MeshData::fan(n)).collect();
        Scene::from_mesh_data(&mock.shared(), &meshes).unwrap()
    }

    #[test]
    fn test_build_links_meshes_to_structures() {
        let mock = MockDevice::new();
        let mut scene = scene_with(&mock, &[2, 6]);

        let summary = scene.build_acceleration_structures(BuildPreference::FastTrace).unwrap();
        assert_eq!(summary.bottom_level_count, 2);
        assert_eq!(summary.top_level_count, 1);
        assert_eq!(scene.structure_count(), 3);

        let tlas = scene.tlas().unwrap();
        assert_eq!(tlas.level(), crate::accel::StructureLevel::TopLevel);
        assert_eq!(scene.tlas_handle(), tlas.handle());

        let instances = scene.instances().unwrap();
        assert_eq!(instances.len(), 2);
        for (index, instance) in instances.iter().enumerate() {
            assert_eq!(instance.custom_index, index as u32);
            assert_eq!(instance.blas_address, scene.blas(index).unwrap().device_address());
        }
    }

    #[test]
    fn test_build_is_one_shot() {
        let mock = MockDevice::new();
        let mut scene = scene_with(&mock, &[1]);
        scene.build_acceleration_structures(BuildPreference::FastTrace).unwrap();
        assert!(matches!(
            scene.build_acceleration_structures(BuildPreference::FastTrace),
            Err(RtxError::ProtocolViolation { .. })
        ));
        assert!(scene.upload_mesh(&MeshData::fan(1)).is_err());
        assert_eq!(mock.submissions().len(), 1);
    }

    #[test]
    fn test_empty_scene_rejected() {
        let mock = MockDevice::new();
        let mut scene = Scene::new(&mock.shared());
        assert!(matches!(
            scene.build_acceleration_structures(BuildPreference::FastTrace),
            Err(RtxError::InvalidSceneData { .. })
        ));
        assert!(scene.tlas().is_none());
        assert_eq!(scene.tlas_handle(), vk::AccelerationStructureKHR::null());
    }

    #[test]
    fn test_failed_build_keeps_no_structures() {
        let mock = MockDevice::new();
        let mut scene = scene_with(&mock, &[1, 2]);
        mock.fail_submission();

        assert!(scene.build_acceleration_structures(BuildPreference::FastTrace).is_err());
        assert_eq!(scene.structure_count(), 0);
        assert_eq!(mock.live_structure_count(), 0);
        assert!(scene.meshes().iter().all(|mesh| mesh.blas().is_none()));
        assert!(scene.instances().is_err());
    }

    #[test]
    fn test_teardown_releases_top_level_first() {
        let mock = MockDevice::new();
        let mut scene = scene_with(&mock, &[1, 3]);
        scene.build_acceleration_structures(BuildPreference::FastBuild).unwrap();

        let tlas = scene.tlas_handle();
        let blas: Vec<_> = (0..2).map(|i| scene.blas(i).unwrap().handle()).collect();

        scene.teardown();
        assert_eq!(mock.state.borrow().destroyed_structures, vec![tlas, blas[0], blas[1]]);
        assert_eq!(mock.live_structure_count(), 0);
        assert_eq!(mock.live_buffer_count(), 0);

        scene.teardown();
        drop(scene);
        assert_eq!(mock.state.borrow().destroyed_structures.len(), 3);
    }

    #[test]
    fn test_drop_releases_everything() {
        let mock = MockDevice::new();
        let mut scene = scene_with(&mock, &[4]);
        scene.build_acceleration_structures(BuildPreference::FastTrace).unwrap();
        drop(scene);
        assert_eq!(mock.live_structure_count(), 0);
        assert_eq!(mock.live_buffer_count(), 0);
    }
}
