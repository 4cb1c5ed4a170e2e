//! GPU buffer management
//!
//! Buffers are created through the shared device context and released on drop.
//! Host writes always go through a single scoped map/unmap.

use ash::vk;
use bytemuck::Pod;

use crate::device::{BufferWrite, MemoryLocation, RawBuffer, SharedDevice};
use crate::error::{RtxError, RtxResult};

/// Buffer wrapper with memory management
pub struct GpuBuffer {
    device: SharedDevice,
    raw: RawBuffer,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    device_address: Option<vk::DeviceAddress>,
}

impl GpuBuffer {
    /// Create a new buffer. The device address is queried right away when
    /// the usage includes `SHADER_DEVICE_ADDRESS`.
    pub fn new(
        device: &SharedDevice,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> RtxResult<Self> {
        if size == 0 {
            return Err(RtxError::resource_creation(
                "zero-sized buffer",
                vk::Result::ERROR_INITIALIZATION_FAILED,
            ));
        }

        let raw = device.create_buffer(size, usage, location)?;
        let device_address = usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
            .then(|| device.buffer_device_address(raw.buffer));

        Ok(Self {
            device: device.clone(),
            raw,
            usage,
            location,
            device_address,
        })
    }

    /// Create a host-visible buffer holding `data`
    pub fn with_data<T: Pod>(
        device: &SharedDevice,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> RtxResult<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let buffer = Self::new(device, bytes.len() as vk::DeviceSize, usage, MemoryLocation::HostVisible)?;
        buffer.write_regions(&[BufferWrite::new(0, bytes)])?;
        Ok(buffer)
    }

    /// Write `data` at the start of the buffer
    pub fn write_slice<T: Pod>(&self, data: &[T]) -> RtxResult<()> {
        self.write_regions(&[BufferWrite::new(0, bytemuck::cast_slice(data))])
    }

    /// Apply several writes under one mapping. Bytes outside the written
    /// ranges are left untouched.
    pub fn write_regions(&self, writes: &[BufferWrite<'_>]) -> RtxResult<()> {
        if self.location != MemoryLocation::HostVisible {
            return Err(RtxError::protocol("host write to a device-local buffer"));
        }
        if let Some(write) = writes.iter().find(|write| write.end() > self.raw.size) {
            return Err(RtxError::protocol(format!(
                "write of {} bytes at offset {} exceeds buffer size {}",
                write.bytes.len(),
                write.offset,
                self.raw.size
            )));
        }
        self.device.write_buffer(&self.raw, writes)
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.raw.buffer
    }

    /// Get size
    pub fn size(&self) -> vk::DeviceSize {
        self.raw.size
    }

    /// Usage flags the buffer was created with
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Device address, if the buffer was created with `SHADER_DEVICE_ADDRESS`
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.device_address
    }

    pub(crate) fn require_device_address(&self) -> RtxResult<vk::DeviceAddress> {
        self.device_address
            .ok_or_else(|| RtxError::protocol("buffer was created without SHADER_DEVICE_ADDRESS usage"))
    }
}

/// Round `value` up to a multiple of `alignment`. Zero alignment is treated as one.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(&self.raw);
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("buffer", &self.raw.buffer)
            .field("size", &self.raw.size)
            .field("usage", &self.usage)
            .field("device_address", &self.device_address)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, POISON};

    #[test]
    fn test_buffer_released_on_drop() {
        let mock = MockDevice::new();
        let device = mock.shared();
        {
            let _buffer = GpuBuffer::new(
                &device,
                128,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::DeviceLocal,
            )
            .unwrap();
            assert_eq!(mock.live_buffer_count(), 1);
        }
        assert_eq!(mock.live_buffer_count(), 0);
    }

    #[test]
    fn test_device_address_only_with_usage() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let plain = GpuBuffer::new(
            &device,
            64,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::HostVisible,
        )
        .unwrap();
        assert!(plain.device_address().is_none());
        assert!(plain.require_device_address().is_err());

        let addressable = GpuBuffer::new(
            &device,
            64,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::HostVisible,
        )
        .unwrap();
        assert!(addressable.device_address().is_some());
    }

    #[test]
    fn test_with_data_uploads_bytes() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let buffer = GpuBuffer::with_data(&device, &[1u32, 2, 3], vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
        assert_eq!(buffer.size(), 12);
        let contents = mock.buffer_contents(buffer.handle());
        let words: Vec<u32> = contents
            .chunks_exact(4)
            .map(|chunk| u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        assert_eq!(words, vec![1, 2, 3]);
    }

    #[test]
    fn test_partial_writes_leave_gaps_untouched() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let buffer = GpuBuffer::new(
            &device,
            16,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::HostVisible,
        )
        .unwrap();
        buffer
            .write_regions(&[BufferWrite::new(0, &[1, 1]), BufferWrite::new(8, &[2, 2])])
            .unwrap();
        let contents = mock.buffer_contents(buffer.handle());
        assert_eq!(&contents[0..2], &[1, 1]);
        assert!(contents[2..8].iter().all(|&b| b == POISON));
        assert_eq!(&contents[8..10], &[2, 2]);
        assert!(contents[10..].iter().all(|&b| b == POISON));
    }

    #[test]
    fn test_out_of_bounds_write_rejected() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let buffer = GpuBuffer::new(
            &device,
            8,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::HostVisible,
        )
        .unwrap();
        let result = buffer.write_regions(&[BufferWrite::new(4, &[0u8; 8])]);
        assert!(matches!(result, Err(RtxError::ProtocolViolation { .. })));
    }

    #[test]
    fn test_write_to_device_local_rejected() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let buffer = GpuBuffer::new(
            &device,
            8,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::DeviceLocal,
        )
        .unwrap();
        assert!(buffer.write_slice(&[0u32]).is_err());
    }

    #[test]
    fn test_zero_size_rejected() {
        let mock = MockDevice::new();
        let device = mock.shared();
        let result = GpuBuffer::new(&device, 0, vk::BufferUsageFlags::STORAGE_BUFFER, MemoryLocation::HostVisible);
        assert!(matches!(result, Err(RtxError::ResourceCreationFailure { .. })));
        assert_eq!(mock.live_buffer_count(), 0);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(0x1_0000_0010, 128), 0x1_0000_0080);
        assert_eq!(align_up(13, 0), 13);
    }
}
