//! Shader group construction protocol
//!
//! [`SbtBuilder`] collects the raygen stage, the triangle hit groups and the
//! miss groups in that order. Each group index is filled exactly once and the
//! builder derives the pipeline's stage array and group array from what was
//! filled:
//!
//! ```text
//! stages: [raygen][hit 0 stages..]..[hit H-1 stages..][miss 0]..[miss M-1]
//! groups: [raygen][hit 0]..[hit H-1][miss 0]..[miss M-1]
//! ```
//!
//! Hit groups may be filled in any index order; stage indices always follow
//! group order because the arrays are derived, not appended to.

use ash::vk;
use std::ffi::CStr;

use super::layout::SbtLayout;
use crate::device::RayTracingProperties;
use crate::error::{RtxError, RtxResult};

/// Entry point used by every ray-tracing stage
pub const SHADER_ENTRY_POINT: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Kind of ray-tracing shader stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Ray generation
    Raygen,
    /// Closest hit
    ClosestHit,
    /// Any hit
    AnyHit,
    /// Miss
    Miss,
}

impl StageKind {
    /// Vulkan stage flag
    pub fn vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            Self::Raygen => vk::ShaderStageFlags::RAYGEN_KHR,
            Self::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            Self::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
            Self::Miss => vk::ShaderStageFlags::MISS_KHR,
        }
    }
}

/// Compiled shader module tagged with its stage kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStage {
    /// Shader module handle
    pub module: vk::ShaderModule,
    /// Stage kind
    pub kind: StageKind,
}

impl ShaderStage {
    /// Create a stage
    pub fn new(module: vk::ShaderModule, kind: StageKind) -> Self {
        Self { module, kind }
    }

    /// Pipeline stage create info with the `main` entry point
    pub fn create_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.kind.vk_stage())
            .module(self.module)
            .name(SHADER_ENTRY_POINT)
            .build()
    }
}

/// Kind of shader group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Raygen or miss group with one general stage
    General,
    /// Triangle hit group with closest-hit and/or any-hit stages
    TrianglesHitGroup,
}

/// Shader group referencing slots of the stage array
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderGroup {
    /// Group kind
    pub kind: GroupKind,
    /// General stage index, or `vk::SHADER_UNUSED_KHR`
    pub general_shader: u32,
    /// Closest-hit stage index, or `vk::SHADER_UNUSED_KHR`
    pub closest_hit_shader: u32,
    /// Any-hit stage index, or `vk::SHADER_UNUSED_KHR`
    pub any_hit_shader: u32,
    /// Intersection stage index, always `vk::SHADER_UNUSED_KHR` for triangles
    pub intersection_shader: u32,
}

impl ShaderGroup {
    /// General group for stage `index`
    pub fn general(index: u32) -> Self {
        Self {
            kind: GroupKind::General,
            general_shader: index,
            closest_hit_shader: vk::SHADER_UNUSED_KHR,
            any_hit_shader: vk::SHADER_UNUSED_KHR,
            intersection_shader: vk::SHADER_UNUSED_KHR,
        }
    }

    /// Empty triangle hit group
    pub fn triangles_hit_group() -> Self {
        Self {
            kind: GroupKind::TrianglesHitGroup,
            general_shader: vk::SHADER_UNUSED_KHR,
            closest_hit_shader: vk::SHADER_UNUSED_KHR,
            any_hit_shader: vk::SHADER_UNUSED_KHR,
            intersection_shader: vk::SHADER_UNUSED_KHR,
        }
    }

    /// Vulkan group create info
    pub fn to_vk(&self) -> vk::RayTracingShaderGroupCreateInfoKHR {
        let ty = match self.kind {
            GroupKind::General => vk::RayTracingShaderGroupTypeKHR::GENERAL,
            GroupKind::TrianglesHitGroup => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
        };
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(ty)
            .general_shader(self.general_shader)
            .closest_hit_shader(self.closest_hit_shader)
            .any_hit_shader(self.any_hit_shader)
            .intersection_shader(self.intersection_shader)
            .build()
    }
}

/// Construction state of an [`SbtBuilder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbtState {
    /// Nothing added yet
    Empty,
    /// Raygen stage set
    RaygenSet,
    /// At least one hit group filled
    HitGroups,
    /// At least one miss group filled
    MissGroups,
}

/// Ordered shader group builder
#[derive(Debug, Clone)]
pub struct SbtBuilder {
    handle_size: u32,
    stride: u32,
    state: SbtState,
    raygen: Option<ShaderStage>,
    hit_groups: Vec<Option<Vec<ShaderStage>>>,
    miss_groups: Vec<Option<ShaderStage>>,
}

impl SbtBuilder {
    /// Create a builder for `num_hit_groups` hit groups and
    /// `num_miss_groups` miss groups. The record stride is the device's
    /// shader group base alignment.
    pub fn new(
        num_hit_groups: u32,
        num_miss_groups: u32,
        properties: &RayTracingProperties,
    ) -> RtxResult<Self> {
        let handle_size = properties.shader_group_handle_size;
        let stride = properties.shader_group_base_alignment;

        if handle_size == 0 || stride == 0 {
            return Err(RtxError::capability_query(
                "shader group properties",
                format!("handle size {} / base alignment {}", handle_size, stride),
            ));
        }
        if !stride.is_power_of_two() {
            return Err(RtxError::capability_query(
                "shader group properties",
                format!("base alignment {} is not a power of two", stride),
            ));
        }
        if handle_size > stride {
            return Err(RtxError::capability_query(
                "shader group properties",
                format!("handle size {} exceeds base alignment {}", handle_size, stride),
            ));
        }

        log::debug!(
            "SBT builder: {} hit groups, {} miss groups, handle {} bytes, stride {} bytes",
            num_hit_groups, num_miss_groups, handle_size, stride
        );

        Ok(Self {
            handle_size,
            stride,
            state: SbtState::Empty,
            raygen: None,
            hit_groups: vec![None; num_hit_groups as usize],
            miss_groups: vec![None; num_miss_groups as usize],
        })
    }

    /// Set the raygen stage. Must be the first call and happen exactly once.
    pub fn set_raygen_stage(&mut self, stage: ShaderStage) -> RtxResult<()> {
        if self.state != SbtState::Empty {
            return Err(RtxError::protocol("raygen stage already set"));
        }
        if stage.kind != StageKind::Raygen {
            return Err(RtxError::protocol(format!(
                "raygen group given a {:?} stage",
                stage.kind
            )));
        }

        self.raygen = Some(stage);
        self.state = SbtState::RaygenSet;
        Ok(())
    }

    /// Fill hit group `group_index` with closest-hit and/or any-hit stages
    pub fn add_stage_to_hit_group(&mut self, stages: &[ShaderStage], group_index: u32) -> RtxResult<()> {
        match self.state {
            SbtState::Empty => {
                return Err(RtxError::protocol("hit group added before the raygen stage"));
            }
            SbtState::MissGroups => {
                return Err(RtxError::protocol("hit group added after miss groups"));
            }
            SbtState::RaygenSet | SbtState::HitGroups => {}
        }

        let num_hit_groups = self.hit_groups.len();
        let slot = self.hit_groups.get_mut(group_index as usize).ok_or_else(|| {
            RtxError::protocol(format!(
                "hit group index {} out of range (0..{})",
                group_index, num_hit_groups
            ))
        })?;
        if slot.is_some() {
            return Err(RtxError::protocol(format!("hit group {} already populated", group_index)));
        }
        if stages.is_empty() {
            return Err(RtxError::protocol(format!("hit group {} given no stages", group_index)));
        }
        for (i, stage) in stages.iter().enumerate() {
            if !matches!(stage.kind, StageKind::ClosestHit | StageKind::AnyHit) {
                return Err(RtxError::protocol(format!(
                    "hit group {} given a {:?} stage",
                    group_index, stage.kind
                )));
            }
            if stages[..i].iter().any(|earlier| earlier.kind == stage.kind) {
                return Err(RtxError::protocol(format!(
                    "hit group {} given two {:?} stages",
                    group_index, stage.kind
                )));
            }
        }

        *slot = Some(stages.to_vec());
        self.state = SbtState::HitGroups;
        Ok(())
    }

    /// Fill miss group `group_index` with one miss stage. Every hit group must
    /// already be filled.
    pub fn add_stage_to_miss_group(&mut self, stage: ShaderStage, group_index: u32) -> RtxResult<()> {
        if self.state == SbtState::Empty {
            return Err(RtxError::protocol("miss group added before the raygen stage"));
        }
        if let Some(missing) = self.hit_groups.iter().position(Option::is_none) {
            return Err(RtxError::protocol(format!(
                "miss group added while hit group {} is not populated",
                missing
            )));
        }

        let num_miss_groups = self.miss_groups.len();
        let slot = self.miss_groups.get_mut(group_index as usize).ok_or_else(|| {
            RtxError::protocol(format!(
                "miss group index {} out of range (0..{})",
                group_index, num_miss_groups
            ))
        })?;
        if slot.is_some() {
            return Err(RtxError::protocol(format!("miss group {} already populated", group_index)));
        }
        if stage.kind != StageKind::Miss {
            return Err(RtxError::protocol(format!(
                "miss group {} given a {:?} stage",
                group_index, stage.kind
            )));
        }

        *slot = Some(stage);
        self.state = SbtState::MissGroups;
        Ok(())
    }

    /// Current construction state
    pub fn state(&self) -> SbtState {
        self.state
    }

    /// Number of hit groups
    pub fn num_hit_groups(&self) -> u32 {
        self.hit_groups.len() as u32
    }

    /// Number of miss groups
    pub fn num_miss_groups(&self) -> u32 {
        self.miss_groups.len() as u32
    }

    /// Total group count, raygen included
    pub fn group_count(&self) -> u32 {
        1 + self.num_hit_groups() + self.num_miss_groups()
    }

    /// Shader group handle size in bytes
    pub fn handle_size(&self) -> u32 {
        self.handle_size
    }

    /// Record stride in bytes
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Whether raygen and every hit and miss group are filled
    pub fn is_complete(&self) -> bool {
        self.raygen.is_some()
            && self.hit_groups.iter().all(Option::is_some)
            && self.miss_groups.iter().all(Option::is_some)
    }

    /// Fail unless [`is_complete`](Self::is_complete)
    pub fn ensure_complete(&self) -> RtxResult<()> {
        if self.raygen.is_none() {
            return Err(RtxError::protocol("raygen stage not set"));
        }
        if let Some(index) = self.hit_groups.iter().position(Option::is_none) {
            return Err(RtxError::protocol(format!("hit group {} not populated", index)));
        }
        if let Some(index) = self.miss_groups.iter().position(Option::is_none) {
            return Err(RtxError::protocol(format!("miss group {} not populated", index)));
        }
        Ok(())
    }

    /// Stage array in group order. Unfilled groups contribute nothing.
    pub fn stages(&self) -> Vec<ShaderStage> {
        self.raygen
            .iter()
            .copied()
            .chain(self.hit_groups.iter().flatten().flatten().copied())
            .chain(self.miss_groups.iter().flatten().copied())
            .collect()
    }

    /// Group array whose stage indices refer to [`stages`](Self::stages).
    /// Unfilled groups are skipped.
    pub fn groups(&self) -> Vec<ShaderGroup> {
        let mut groups = Vec::with_capacity(self.group_count() as usize);
        let mut next_stage = 0u32;

        if self.raygen.is_some() {
            groups.push(ShaderGroup::general(next_stage));
            next_stage += 1;
        }

        for stages in self.hit_groups.iter().flatten() {
            let mut group = ShaderGroup::triangles_hit_group();
            for stage in stages {
                match stage.kind {
                    StageKind::ClosestHit => group.closest_hit_shader = next_stage,
                    StageKind::AnyHit => group.any_hit_shader = next_stage,
                    StageKind::Raygen | StageKind::Miss => {}
                }
                next_stage += 1;
            }
            groups.push(group);
        }

        for _ in self.miss_groups.iter().flatten() {
            groups.push(ShaderGroup::general(next_stage));
            next_stage += 1;
        }

        groups
    }

    /// Byte layout of the table this builder describes
    pub fn layout(&self) -> SbtLayout {
        SbtLayout::compute(self.num_hit_groups(), self.num_miss_groups(), self.stride)
    }
}
