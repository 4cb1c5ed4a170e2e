//! Descriptor sets for ray-tracing pipelines
//!
//! Layouts, a pool sized from a layout's bindings and a writer that checks
//! each write against the layout before updating the set.

use ash::{vk, Device};

use crate::error::{RtxError, RtxResult};

/// Stages that read scene resources
pub const RAY_TRACING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw(),
);

/// Descriptor set layout builder for creating reusable layouts
#[derive(Debug, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create a new descriptor set layout builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Layout the bundled shaders expect: top-level structure at binding 0,
    /// output image at 1, camera uniform at 2
    pub fn scene_layout() -> Self {
        Self::new()
            .add_acceleration_structure(0, RAY_TRACING_STAGES)
            .add_storage_image(1, vk::ShaderStageFlags::RAYGEN_KHR)
            .add_uniform_buffer(2, RAY_TRACING_STAGES)
    }

    /// Add a top-level acceleration structure binding
    pub fn add_acceleration_structure(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, stage_flags)
    }

    /// Add a storage image binding
    pub fn add_storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::STORAGE_IMAGE, stage_flags)
    }

    /// Add a uniform buffer binding
    pub fn add_uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags)
    }

    /// Add a storage buffer binding
    pub fn add_storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.add(binding, vk::DescriptorType::STORAGE_BUFFER, stage_flags)
    }

    fn add(mut self, binding: u32, descriptor_type: vk::DescriptorType, stage_flags: vk::ShaderStageFlags) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stage_flags)
                .build(),
        );
        self
    }

    /// Bindings added so far
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }

    /// Build the descriptor set layout
    pub fn build(self, device: &Device) -> RtxResult<DescriptorSetLayout> {
        if let Some(duplicate) = self
            .bindings
            .iter()
            .enumerate()
            .find(|(i, a)| self.bindings[..*i].iter().any(|b| b.binding == a.binding))
        {
            return Err(RtxError::protocol(format!(
                "descriptor binding {} declared twice",
                duplicate.1.binding
            )));
        }

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&self.bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| RtxError::resource_creation("descriptor set layout", e))?;

        Ok(DescriptorSetLayout {
            layout,
            device: device.clone(),
            bindings: self.bindings,
        })
    }
}

/// Descriptor set layout wrapper with automatic cleanup
pub struct DescriptorSetLayout {
    layout: vk::DescriptorSetLayout,
    device: Device,
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayout {
    /// Get the Vulkan descriptor set layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Get the bindings used in this layout
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Pool sizes covering `max_sets` sets of `bindings`, one entry per
/// descriptor type in first-seen order
pub fn pool_sizes_for(bindings: &[vk::DescriptorSetLayoutBinding], max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for binding in bindings {
        let count = binding.descriptor_count * max_sets;
        match sizes.iter_mut().find(|size| size.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: count,
            }),
        }
    }
    sizes
}

/// Descriptor pool sized for one layout
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    device: Device,
}

impl DescriptorPool {
    /// Create a pool holding `max_sets` sets of `layout`
    pub fn new(device: &Device, layout: &DescriptorSetLayout, max_sets: u32) -> RtxResult<Self> {
        let pool_sizes = pool_sizes_for(layout.bindings(), max_sets);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| RtxError::resource_creation("descriptor pool", e))?;

        Ok(Self {
            pool,
            device: device.clone(),
        })
    }

    /// Allocate one set of `layout`
    pub fn allocate(&self, layout: &DescriptorSetLayout) -> RtxResult<vk::DescriptorSet> {
        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| RtxError::resource_creation("descriptor set", e))?;
        sets.into_iter()
            .next()
            .ok_or_else(|| RtxError::resource_creation("descriptor set", vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    /// Get the pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// One resource bound to a descriptor
#[derive(Debug, Clone, Copy)]
pub enum DescriptorWrite {
    /// Top-level acceleration structure
    AccelerationStructure {
        /// Binding number
        binding: u32,
        /// Structure handle
        structure: vk::AccelerationStructureKHR,
    },
    /// Storage image in the general layout
    StorageImage {
        /// Binding number
        binding: u32,
        /// Image view
        view: vk::ImageView,
    },
    /// Whole-buffer uniform range
    UniformBuffer {
        /// Binding number
        binding: u32,
        /// Buffer handle
        buffer: vk::Buffer,
        /// Bytes visible to the shader
        range: vk::DeviceSize,
    },
}

impl DescriptorWrite {
    /// Binding number written
    pub fn binding(&self) -> u32 {
        match *self {
            Self::AccelerationStructure { binding, .. }
            | Self::StorageImage { binding, .. }
            | Self::UniformBuffer { binding, .. } => binding,
        }
    }

    /// Descriptor type the binding must declare
    pub fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::AccelerationStructure { .. } => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            Self::StorageImage { .. } => vk::DescriptorType::STORAGE_IMAGE,
            Self::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
        }
    }
}

/// Descriptor set writer for updating descriptor sets
#[derive(Debug, Default)]
pub struct DescriptorSetWriter {
    writes: Vec<DescriptorWrite>,
}

impl DescriptorSetWriter {
    /// Create a new descriptor set writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a top-level acceleration structure
    pub fn write_acceleration_structure(mut self, binding: u32, structure: vk::AccelerationStructureKHR) -> Self {
        self.writes.push(DescriptorWrite::AccelerationStructure { binding, structure });
        self
    }

    /// Bind a storage image view
    pub fn write_storage_image(mut self, binding: u32, view: vk::ImageView) -> Self {
        self.writes.push(DescriptorWrite::StorageImage { binding, view });
        self
    }

    /// Bind the first `range` bytes of a uniform buffer
    pub fn write_uniform_buffer(mut self, binding: u32, buffer: vk::Buffer, range: vk::DeviceSize) -> Self {
        self.writes.push(DescriptorWrite::UniformBuffer { binding, buffer, range });
        self
    }

    /// Queued writes
    pub fn writes(&self) -> &[DescriptorWrite] {
        &self.writes
    }

    /// Check that every write targets a declared binding of the matching
    /// type and that every declared binding is written exactly once
    pub fn validate(&self, bindings: &[vk::DescriptorSetLayoutBinding]) -> RtxResult<()> {
        for (i, write) in self.writes.iter().enumerate() {
            let declared = bindings
                .iter()
                .find(|b| b.binding == write.binding())
                .ok_or_else(|| RtxError::protocol(format!("descriptor binding {} is not in the layout", write.binding())))?;
            if declared.descriptor_type != write.descriptor_type() {
                return Err(RtxError::protocol(format!(
                    "descriptor binding {} declared as {:?}, written as {:?}",
                    write.binding(),
                    declared.descriptor_type,
                    write.descriptor_type()
                )));
            }
            if self.writes[..i].iter().any(|w| w.binding() == write.binding()) {
                return Err(RtxError::protocol(format!(
                    "descriptor binding {} written twice",
                    write.binding()
                )));
            }
        }

        if let Some(missing) = bindings
            .iter()
            .find(|b| !self.writes.iter().any(|w| w.binding() == b.binding))
        {
            return Err(RtxError::protocol(format!(
                "descriptor binding {} left unwritten",
                missing.binding
            )));
        }
        Ok(())
    }

    /// Validate against `layout` and write every resource into `set`
    pub fn update(&self, device: &Device, set: vk::DescriptorSet, layout: &DescriptorSetLayout) -> RtxResult<()> {
        self.validate(layout.bindings())?;

        for write in &self.writes {
            match *write {
                DescriptorWrite::AccelerationStructure { structure, .. } => {
                    let structures = [structure];
                    let mut structure_info =
                        vk::WriteDescriptorSetAccelerationStructureKHR::builder().acceleration_structures(&structures);
                    let mut descriptor_write = base_write(set, write).push_next(&mut structure_info).build();
                    // The count is not derived from the extension struct
                    descriptor_write.descriptor_count = 1;
                    unsafe { device.update_descriptor_sets(&[descriptor_write], &[]) };
                }
                DescriptorWrite::StorageImage { view, .. } => {
                    let image_info = [vk::DescriptorImageInfo::builder()
                        .image_view(view)
                        .image_layout(vk::ImageLayout::GENERAL)
                        .build()];
                    let descriptor_write = base_write(set, write).image_info(&image_info).build();
                    unsafe { device.update_descriptor_sets(&[descriptor_write], &[]) };
                }
                DescriptorWrite::UniformBuffer { buffer, range, .. } => {
                    let buffer_info = [vk::DescriptorBufferInfo::builder()
                        .buffer(buffer)
                        .offset(0)
                        .range(range)
                        .build()];
                    let descriptor_write = base_write(set, write).buffer_info(&buffer_info).build();
                    unsafe { device.update_descriptor_sets(&[descriptor_write], &[]) };
                }
            }
        }

        log::debug!("Updated descriptor set with {} writes", self.writes.len());
        Ok(())
    }
}

fn base_write<'a>(set: vk::DescriptorSet, write: &DescriptorWrite) -> vk::WriteDescriptorSetBuilder<'a> {
    vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(write.binding())
        .dst_array_element(0)
        .descriptor_type(write.descriptor_type())
}
