//! Shader binding table population

use ash::vk;

use super::builder::SbtBuilder;
use super::layout::SbtLayout;
use crate::device::{BufferWrite, MemoryLocation, SharedDevice};
use crate::error::{RtxError, RtxResult};
use crate::resources::{align_up, GpuBuffer};

/// Device-facing regions passed to the ray dispatch
#[derive(Debug, Clone, Copy, Default)]
pub struct SbtRegions {
    /// Raygen region
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    /// Hit region
    pub hit: vk::StridedDeviceAddressRegionKHR,
    /// Miss region
    pub miss: vk::StridedDeviceAddressRegionKHR,
    /// Callable region, always empty
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

impl SbtRegions {
    /// Regions in the argument order of `vkCmdTraceRaysKHR`: raygen, miss,
    /// hit, callable
    pub fn trace_rays_order(&self) -> [&vk::StridedDeviceAddressRegionKHR; 4] {
        [&self.raygen, &self.miss, &self.hit, &self.callable]
    }
}

/// Host-visible table holding one handle per shader group.
///
/// The buffer is one stride larger than the layout so the table can start at
/// the first stride-aligned address inside it.
#[derive(Debug)]
pub struct ShaderBindingTable {
    buffer: GpuBuffer,
    layout: SbtLayout,
    table_offset: vk::DeviceSize,
    device_address: vk::DeviceAddress,
}

impl ShaderBindingTable {
    /// Fetch the group handles of `pipeline` and copy each one to its
    /// record. The builder must be complete and must be the one the pipeline
    /// was created from.
    pub fn new(device: &SharedDevice, builder: &SbtBuilder, pipeline: vk::Pipeline) -> RtxResult<Self> {
        builder.ensure_complete()?;

        let layout = builder.layout();
        let group_count = layout.group_count();
        let handle_size = builder.handle_size() as usize;
        let data_size = group_count as usize * handle_size;

        let handles = device.shader_group_handles(pipeline, group_count, data_size)?;
        if handles.len() != data_size {
            return Err(RtxError::capability_query(
                "shader group handles",
                format!("expected {} bytes, device returned {}", data_size, handles.len()),
            ));
        }

        let buffer = GpuBuffer::new(
            device,
            layout.total_size + layout.stride(),
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::HostVisible,
        )?;
        let buffer_address = buffer.require_device_address()?;
        let device_address = align_up(buffer_address, layout.stride());
        let table_offset = device_address - buffer_address;

        let writes: Vec<BufferWrite<'_>> = handles
            .chunks_exact(handle_size)
            .enumerate()
            .map(|(group, handle)| BufferWrite::new(table_offset + layout.record_offset(group as u32), handle))
            .collect();
        buffer.write_regions(&writes)?;

        log::info!(
            "Shader binding table: {} groups, {} bytes, stride {}, base offset {}",
            group_count,
            layout.total_size,
            layout.stride(),
            table_offset
        );

        Ok(Self {
            buffer,
            layout,
            table_offset,
            device_address,
        })
    }

    /// Regions for the dispatch call, including the empty callable region
    pub fn regions(&self) -> SbtRegions {
        SbtRegions {
            raygen: self.layout.raygen.to_device_region(self.device_address),
            hit: self.layout.hit.to_device_region(self.device_address),
            miss: self.layout.miss.to_device_region(self.device_address),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        }
    }

    /// Byte layout
    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    /// Backing buffer handle
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Table base address, aligned to the stride
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Bytes skipped at the start of the buffer to reach the aligned base
    pub fn table_offset(&self) -> vk::DeviceSize {
        self.table_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, POISON};
    use crate::device::RayTracingDevice;
    use crate::sbt::{ShaderStage, StageKind};
    use ash::vk::Handle;

    fn complete_builder(device: &MockDevice, hit: u32, miss: u32) -> SbtBuilder {
        let stage = |id: u64, kind| ShaderStage::new(vk::ShaderModule::from_raw(id), kind);
        let mut builder = SbtBuilder::new(hit, miss, &device.ray_tracing_properties()).unwrap();
        builder.set_raygen_stage(stage(1, StageKind::Raygen)).unwrap();
        for i in 0..hit {
            builder.add_stage_to_hit_group(&[stage(10 + u64::from(i), StageKind::ClosestHit)], i).unwrap();
        }
        for i in 0..miss {
            builder.add_stage_to_miss_group(stage(20 + u64::from(i), StageKind::Miss), i).unwrap();
        }
        builder
    }

    #[test]
    fn test_records_written_at_stride_with_padding_untouched() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let builder = complete_builder(&mock, 2, 2);
        let table = ShaderBindingTable::new(&device, &builder, vk::Pipeline::from_raw(77)).unwrap();

        let contents = mock.buffer_contents(table.buffer());
        assert_eq!(contents.len(), 384);
        assert_eq!(table.table_offset(), 0);
        for group in 0..5u32 {
            let start = (group * 64) as usize;
            assert_eq!(&contents[start..start + 32], mock.handle_for_group(group).as_slice());
            assert!(contents[start + 32..start + 64].iter().all(|&b| b == POISON));
        }

        let queries = mock.state.borrow().handle_queries.clone();
        assert_eq!(queries, vec![(vk::Pipeline::from_raw(77), 5, 160)]);
    }

    #[test]
    fn test_regions_point_into_table() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let builder = complete_builder(&mock, 2, 2);
        let table = ShaderBindingTable::new(&device, &builder, vk::Pipeline::from_raw(1)).unwrap();

        let base = table.device_address();
        let regions = table.regions();
        assert_eq!(regions.raygen.device_address, base);
        assert_eq!(regions.raygen.size, 64);
        assert_eq!(regions.hit.device_address, base + 64);
        assert_eq!(regions.hit.size, 128);
        assert_eq!(regions.miss.device_address, base + 192);
        assert_eq!(regions.miss.stride, 64);
        assert_eq!(regions.callable.size, 0);
        assert_eq!(regions.callable.device_address, 0);
    }

    #[test]
    fn test_unaligned_buffer_address_is_aligned_up() {
        let mock = MockDevice::new();
        let device = mock.shared();
        mock.skew_buffer_addresses(16);
        let builder = complete_builder(&mock, 1, 1);
        let table = ShaderBindingTable::new(&device, &builder, vk::Pipeline::from_raw(1)).unwrap();

        assert_eq!(table.device_address() % 64, 0);
        assert_eq!(table.table_offset(), 48);

        let contents = mock.buffer_contents(table.buffer());
        assert!(contents[..48].iter().all(|&b| b == POISON));
        for group in 0..3u32 {
            let start = 48 + (group * 64) as usize;
            assert_eq!(&contents[start..start + 32], mock.handle_for_group(group).as_slice());
        }
        assert_eq!(table.regions().raygen.device_address, table.device_address());
    }

    #[test]
    fn test_trace_rays_order_puts_miss_before_hit() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let builder = complete_builder(&mock, 3, 1);
        let table = ShaderBindingTable::new(&device, &builder, vk::Pipeline::from_raw(1)).unwrap();
        let regions = table.regions();

        let [raygen, miss, hit, callable] = regions.trace_rays_order();
        assert_eq!(raygen.size, 64);
        assert_eq!(miss.size, 64);
        assert_eq!(miss.device_address, table.device_address() + 256);
        assert_eq!(hit.size, 192);
        assert_eq!(hit.device_address, table.device_address() + 64);
        assert_eq!(callable.size, 0);
    }

    #[test]
    fn test_handle_query_failure_is_capability_failure() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let builder = complete_builder(&mock, 1, 1);
        mock.fail_handle_query();
        let result = ShaderBindingTable::new(&device, &builder, vk::Pipeline::from_raw(1));
        assert!(matches!(result, Err(RtxError::CapabilityQueryFailure { .. })));
        assert_eq!(mock.live_buffer_count(), 0);
    }

    #[test]
    fn test_short_handle_blob_rejected() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let builder = complete_builder(&mock, 1, 1);
        mock.return_short_handle_blob();
        let result = ShaderBindingTable::new(&device, &builder, vk::Pipeline::from_raw(1));
        assert!(matches!(result, Err(RtxError::CapabilityQueryFailure { .. })));
    }

    #[test]
    fn test_incomplete_builder_rejected() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let mut builder = SbtBuilder::new(1, 1, &mock.ray_tracing_properties()).unwrap();
        builder
            .set_raygen_stage(ShaderStage::new(vk::ShaderModule::from_raw(1), StageKind::Raygen))
            .unwrap();
        let result = ShaderBindingTable::new(&device, &builder, vk::Pipeline::from_raw(1));
        assert!(matches!(result, Err(RtxError::ProtocolViolation { .. })));
        assert!(mock.state.borrow().handle_queries.is_empty());
    }

    #[test]
    fn test_table_released_on_drop() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let builder = complete_builder(&mock, 0, 1);
        let table = ShaderBindingTable::new(&device, &builder, vk::Pipeline::from_raw(1)).unwrap();
        assert_eq!(mock.live_buffer_count(), 1);
        drop(table);
        assert_eq!(mock.live_buffer_count(), 0);
    }
}
