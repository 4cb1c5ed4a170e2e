//! Procedural demo scene: a ground plane with cubes resting on it

use nalgebra::Vector3;
use rtx_core::scene::MeshData;

/// Material id of the ground plane
pub const GROUND_MATERIAL: u32 = 0;
/// Material id of the cubes
pub const CUBE_MATERIAL: u32 = 1;

/// Square plane at y = 0 facing +Y
pub fn ground_plane(half_extent: f32) -> MeshData {
    let s = half_extent;
    MeshData::from_triangles(
        vec![[-s, 0.0, -s], [s, 0.0, -s], [s, 0.0, s], [-s, 0.0, s]],
        vec![0, 2, 1, 0, 3, 2],
        GROUND_MATERIAL,
    )
}

/// Axis-aligned cube with separate vertices per face so every face keeps a
/// flat normal
pub fn cube(center: Vector3<f32>, half_extent: f32) -> MeshData {
    let axes: [Vector3<f32>; 6] = [
        Vector3::x(),
        -Vector3::x(),
        Vector3::y(),
        -Vector3::y(),
        Vector3::z(),
        -Vector3::z(),
    ];

    let mut positions = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for normal in axes {
        // u x v == normal, so the winding below faces outward
        let u = if normal.x.abs() > 0.5 { Vector3::y() } else { Vector3::x() };
        let v = normal.cross(&u);

        let base = positions.len() as u32;
        for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let corner = center + (normal + u * su + v * sv) * half_extent;
            positions.push([corner.x, corner.y, corner.z]);
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    MeshData::from_triangles(positions, indices, CUBE_MATERIAL)
}

/// Ground plane plus two cubes
pub fn demo_scene() -> Vec<MeshData> {
    vec![
        ground_plane(10.0),
        cube(Vector3::new(-1.5, 1.0, 0.0), 1.0),
        cube(Vector3::new(2.0, 0.5, -1.0), 0.5),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_ground_plane_faces_up() {
        let plane = ground_plane(5.0);
        plane.validate().unwrap();
        assert_eq!(plane.face_count(), 2);
        for attribute in &plane.attributes {
            assert_relative_eq!(attribute.normal[1], 1.0);
        }
    }

    #[test]
    fn test_cube_normals_point_outward() {
        let center = Vector3::new(1.0, 2.0, 3.0);
        let mesh = cube(center, 0.5);
        mesh.validate().unwrap();
        assert_eq!(mesh.vertex_count(), 24);
        assert_eq!(mesh.face_count(), 12);

        for (position, attribute) in mesh.positions.iter().zip(&mesh.attributes) {
            let offset = Vector3::from(*position) - center;
            let normal = Vector3::new(attribute.normal[0], attribute.normal[1], attribute.normal[2]);
            assert_relative_eq!(normal.norm(), 1.0, epsilon = 1e-5);
            // Each corner sits half a unit out along its face normal
            assert_relative_eq!(offset.dot(&normal), 0.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_demo_scene_is_valid() {
        let meshes = demo_scene();
        assert_eq!(meshes.len(), 3);
        for mesh in &meshes {
            mesh.validate().unwrap();
        }
        assert!(meshes[1..].iter().all(|m| m.material_ids.iter().all(|&id| id == CUBE_MATERIAL)));
    }
}
