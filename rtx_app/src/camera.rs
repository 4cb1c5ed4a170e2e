//! Camera uniform read by the ray-generation and closest-hit shaders

use bytemuck::{Pod, Zeroable};
use nalgebra::{Isometry3, Matrix4, Perspective3, Point3, Vector3};

/// Camera uniform data, laid out like the shaders' `CameraUniform` block
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct CameraUniform {
    /// Camera space to world space
    pub view_inverse: [[f32; 4]; 4],
    /// Clip space to camera space, Y pointing down the image
    pub projection_inverse: [[f32; 4]; 4],
    /// Direction the light travels (xyz, w unused)
    pub light_direction: [f32; 4],
}

impl CameraUniform {
    /// Camera at `eye` looking at `target` with a vertical field of view of
    /// `fov_degrees`
    pub fn look_at(eye: Point3<f32>, target: Point3<f32>, fov_degrees: f32, aspect_ratio: f32) -> Self {
        let view = Isometry3::look_at_rh(&eye, &target, &Vector3::y());
        let projection = Perspective3::new(aspect_ratio, fov_degrees.to_radians(), 0.1, 1000.0);
        // Image rows grow downward
        let flip_y = Matrix4::new_nonuniform_scaling(&Vector3::new(1.0, -1.0, 1.0));
        let light = Vector3::new(-1.0, -2.0, -0.5).normalize();

        Self {
            view_inverse: view.inverse().to_homogeneous().into(),
            projection_inverse: (projection.inverse() * flip_y).into(),
            light_direction: [light.x, light.y, light.z, 0.0],
        }
    }

    /// Default view over the demo scene
    pub fn demo(width: u32, height: u32) -> Self {
        Self::look_at(
            Point3::new(0.0, 4.0, 10.0),
            Point3::new(0.0, 0.5, 0.0),
            60.0,
            width as f32 / height.max(1) as f32,
        )
    }
}
