//! Top-level instances and their packed device records

use ash::vk;
use bytemuck::{Pod, Zeroable};
use nalgebra::Matrix3x4;

use crate::error::{RtxError, RtxResult};

const MAX_24_BIT: u32 = 0x00FF_FFFF;

/// One placement of a bottom-level structure in the top-level structure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instance {
    /// Object-to-world transform, the top three rows of an affine matrix
    pub transform: Matrix3x4<f32>,
    /// Value shaders read as the instance custom index, 24 bits
    pub custom_index: u32,
    /// Visibility mask tested against the ray mask
    pub mask: u8,
    /// Hit-group record offset, 24 bits
    pub sbt_record_offset: u32,
    /// Instance flags
    pub flags: vk::GeometryInstanceFlagsKHR,
    /// Device address of the referenced bottom-level structure
    pub blas_address: vk::DeviceAddress,
}

impl Instance {
    /// Identity-transformed instance visible to every ray, with culling off
    pub fn new(custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform: Matrix3x4::identity(),
            custom_index,
            mask: 0xFF,
            sbt_record_offset: 0,
            flags: vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas_address,
        }
    }

    /// Set the object-to-world transform
    pub fn with_transform(mut self, transform: Matrix3x4<f32>) -> Self {
        self.transform = transform;
        self
    }

    /// Set the hit-group record offset
    pub fn with_sbt_record_offset(mut self, offset: u32) -> Self {
        self.sbt_record_offset = offset;
        self
    }

    /// Pack into the 64-byte layout the top-level build reads
    pub fn to_record(&self) -> RtxResult<InstanceRecord> {
        if self.custom_index > MAX_24_BIT {
            return Err(RtxError::invalid_scene(format!(
                "instance custom index {} does not fit in 24 bits",
                self.custom_index
            )));
        }
        if self.sbt_record_offset > MAX_24_BIT {
            return Err(RtxError::invalid_scene(format!(
                "instance record offset {} does not fit in 24 bits",
                self.sbt_record_offset
            )));
        }
        if self.blas_address == 0 {
            return Err(RtxError::invalid_scene("instance references a null structure address"));
        }

        let mut transform = [0.0f32; 12];
        for row in 0..3 {
            for column in 0..4 {
                transform[row * 4 + column] = self.transform[(row, column)];
            }
        }

        Ok(InstanceRecord {
            transform,
            custom_index_and_mask: self.custom_index | (u32::from(self.mask) << 24),
            sbt_offset_and_flags: self.sbt_record_offset | ((self.flags.as_raw() & 0xFF) << 24),
            acceleration_structure_reference: self.blas_address,
        })
    }
}

/// Device instance record: a row-major 3x4 transform, two 24/8-bit packed
/// words and the referenced structure address
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceRecord {
    /// Row-major 3x4 transform
    pub transform: [f32; 12],
    /// Custom index in bits 0..24, mask in bits 24..32
    pub custom_index_and_mask: u32,
    /// Record offset in bits 0..24, flags in bits 24..32
    pub sbt_offset_and_flags: u32,
    /// Bottom-level structure device address
    pub acceleration_structure_reference: u64,
}

const _: () = assert!(
    std::mem::size_of::<InstanceRecord>() == std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
);

impl InstanceRecord {
    /// Unpacked custom index
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & MAX_24_BIT
    }

    /// Unpacked mask
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    /// Unpacked record offset
    pub fn sbt_record_offset(&self) -> u32 {
        self.sbt_offset_and_flags & MAX_24_BIT
    }

    /// Unpacked instance flags
    pub fn flags(&self) -> vk::GeometryInstanceFlagsKHR {
        vk::GeometryInstanceFlagsKHR::from_raw(self.sbt_offset_and_flags >> 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix4, Vector3};

    #[test]
    fn test_record_is_64_bytes() {
        assert_eq!(std::mem::size_of::<InstanceRecord>(), 64);
    }

    #[test]
    fn test_identity_record() {
        let record = Instance::new(3, 0xA_0000_0100).to_record().unwrap();
        assert_eq!(record.custom_index(), 3);
        assert_eq!(record.mask(), 0xFF);
        assert_eq!(record.sbt_record_offset(), 0);
        assert_eq!(record.flags(), vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE);
        assert_eq!(record.acceleration_structure_reference, 0xA_0000_0100);
        assert_eq!(
            record.transform,
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_transform_packed_row_major() {
        let affine = Matrix4::new_translation(&Vector3::new(2.0, -1.0, 5.0)) * Matrix4::new_scaling(0.5);
        let transform: Matrix3x4<f32> = affine.fixed_view::<3, 4>(0, 0).into_owned();
        let record = Instance::new(0, 1).with_transform(transform).to_record().unwrap();

        assert_relative_eq!(record.transform[0], 0.5);
        assert_relative_eq!(record.transform[3], 2.0);
        assert_relative_eq!(record.transform[5], 0.5);
        assert_relative_eq!(record.transform[7], -1.0);
        assert_relative_eq!(record.transform[10], 0.5);
        assert_relative_eq!(record.transform[11], 5.0);
        assert_relative_eq!(record.transform[1], 0.0);
    }

    #[test]
    fn test_packing_keeps_fields_apart() {
        let mut instance = Instance::new(MAX_24_BIT, 1).with_sbt_record_offset(MAX_24_BIT);
        instance.mask = 0x0F;
        instance.flags = vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE;
        let record = instance.to_record().unwrap();

        assert_eq!(record.custom_index(), MAX_24_BIT);
        assert_eq!(record.mask(), 0x0F);
        assert_eq!(record.sbt_record_offset(), MAX_24_BIT);
        assert_eq!(record.flags(), vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE);
    }

    #[test]
    fn test_out_of_range_fields_rejected() {
        assert!(matches!(
            Instance::new(MAX_24_BIT + 1, 1).to_record(),
            Err(RtxError::InvalidSceneData { .. })
        ));
        assert!(Instance::new(0, 1).with_sbt_record_offset(1 << 24).to_record().is_err());
        assert!(Instance::new(0, 0).to_record().is_err());
    }
}
