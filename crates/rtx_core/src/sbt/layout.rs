//! Byte layout of a shader binding table
//!
//! Three contiguous regions share one record stride:
//!
//! ```text
//! offset 0                 stride            stride * (1 + H)     stride * (1 + H + M)
//! | raygen (1 record)      | hit (H records)  | miss (M records)   |
//! ```
//!
//! Only the first `handle_size` bytes of a record carry the group handle; the
//! rest is padding up to the stride.

use ash::vk;

/// One region of the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtRegion {
    /// Byte offset from the table base
    pub offset: vk::DeviceSize,
    /// Record stride in bytes
    pub stride: vk::DeviceSize,
    /// Region size in bytes
    pub size: vk::DeviceSize,
}

impl SbtRegion {
    /// Number of records in the region
    pub fn record_count(&self) -> u64 {
        self.size / self.stride
    }

    /// Device-facing region for a table based at `base_address`. An empty
    /// region is reported with a null address.
    pub fn to_device_region(&self, base_address: vk::DeviceAddress) -> vk::StridedDeviceAddressRegionKHR {
        if self.size == 0 {
            return vk::StridedDeviceAddressRegionKHR::default();
        }
        vk::StridedDeviceAddressRegionKHR {
            device_address: base_address + self.offset,
            stride: self.stride,
            size: self.size,
        }
    }
}

/// Derived region layout, a pure function of the group counts and stride
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    /// Raygen region, exactly one record
    pub raygen: SbtRegion,
    /// Hit region
    pub hit: SbtRegion,
    /// Miss region
    pub miss: SbtRegion,
    /// Total table size in bytes
    pub total_size: vk::DeviceSize,
}

impl SbtLayout {
    /// Compute the layout for `num_hit_groups` hit records and
    /// `num_miss_groups` miss records of `stride` bytes each
    pub fn compute(num_hit_groups: u32, num_miss_groups: u32, stride: u32) -> Self {
        let stride = vk::DeviceSize::from(stride);

        let raygen = SbtRegion {
            offset: 0,
            stride,
            size: stride,
        };
        let hit = SbtRegion {
            offset: raygen.offset + raygen.size,
            stride,
            size: vk::DeviceSize::from(num_hit_groups) * stride,
        };
        let miss = SbtRegion {
            offset: hit.offset + hit.size,
            stride,
            size: vk::DeviceSize::from(num_miss_groups) * stride,
        };

        Self {
            raygen,
            hit,
            miss,
            total_size: miss.offset + miss.size,
        }
    }

    /// Record stride shared by every region
    pub fn stride(&self) -> vk::DeviceSize {
        self.raygen.stride
    }

    /// Number of groups, raygen included
    pub fn group_count(&self) -> u32 {
        (self.total_size / self.stride()) as u32
    }

    /// Byte offset of the record for `group_index`
    pub fn record_offset(&self, group_index: u32) -> vk::DeviceSize {
        vk::DeviceSize::from(group_index) * self.stride()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_two_hit_two_miss() {
        let layout = SbtLayout::compute(2, 2, 64);
        assert_eq!((layout.raygen.offset, layout.raygen.size), (0, 64));
        assert_eq!((layout.hit.offset, layout.hit.size), (64, 128));
        assert_eq!((layout.miss.offset, layout.miss.size), (192, 128));
        assert_eq!(layout.total_size, 320);
        assert_eq!(layout.group_count(), 5);
    }

    #[test]
    fn test_offset_law_holds_generally() {
        for stride in [32u32, 64, 128] {
            for hit in 0..5u32 {
                for miss in 0..5u32 {
                    let layout = SbtLayout::compute(hit, miss, stride);
                    let s = u64::from(stride);
                    assert_eq!(layout.hit.offset, s);
                    assert_eq!(layout.miss.offset, s * (1 + u64::from(hit)));
                    assert_eq!(layout.total_size, s * u64::from(1 + hit + miss));
                    assert_eq!(layout.raygen.record_count(), 1);
                    assert_eq!(layout.hit.record_count(), u64::from(hit));
                    assert_eq!(layout.miss.record_count(), u64::from(miss));
                    assert_eq!(layout.raygen.stride, layout.hit.stride);
                    assert_eq!(layout.hit.stride, layout.miss.stride);
                }
            }
        }
    }

    #[test]
    fn test_compute_is_idempotent() {
        assert_eq!(SbtLayout::compute(3, 1, 64), SbtLayout::compute(3, 1, 64));
    }

    #[test]
    fn test_record_offsets_follow_group_index() {
        let layout = SbtLayout::compute(2, 2, 64);
        let offsets: Vec<u64> = (0..layout.group_count()).map(|g| layout.record_offset(g)).collect();
        assert_eq!(offsets, vec![0, 64, 128, 192, 256]);
        assert_eq!(layout.record_offset(1), layout.hit.offset);
        assert_eq!(layout.record_offset(3), layout.miss.offset);
    }

    #[test]
    fn test_device_regions() {
        let layout = SbtLayout::compute(1, 0, 64);
        let base = 0x1000_0000;
        let raygen = layout.raygen.to_device_region(base);
        assert_eq!((raygen.device_address, raygen.stride, raygen.size), (base, 64, 64));
        let hit = layout.hit.to_device_region(base);
        assert_eq!(hit.device_address, base + 64);
        let miss = layout.miss.to_device_region(base);
        assert_eq!((miss.device_address, miss.stride, miss.size), (0, 0, 0));
    }
}
