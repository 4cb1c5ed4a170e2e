//! Renderer configuration
//!
//! Application metadata, dispatch resolution, acceleration structure build
//! preference and the ray-tracing shader set. Loaded through the [`Config`]
//! trait from TOML or RON.

use ash::vk;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{Config, ConfigError};

/// Directories searched when resolving a bare shader file name
const SHADER_SEARCH_DIRS: [&str; 5] = [
    "target/shaders/",
    "shaders/",
    "resources/shaders/",
    "../target/shaders/",
    "./",
];

fn resolve_shader_path(file_name: &str) -> String {
    SHADER_SEARCH_DIRS
        .iter()
        .map(|dir| format!("{}{}", dir, file_name))
        .find(|candidate| Path::new(candidate).exists())
        .unwrap_or_else(|| format!("target/shaders/{}", file_name))
}

/// Acceleration structure build preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BuildPreference {
    /// Slower build, faster traversal
    #[default]
    FastTrace,
    /// Faster build, slower traversal
    FastBuild,
}

impl BuildPreference {
    /// Build flags passed to every structure build
    pub fn flags(self) -> vk::BuildAccelerationStructureFlagsKHR {
        match self {
            Self::FastTrace => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            Self::FastBuild => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
        }
    }
}

/// SPIR-V paths for one triangle hit group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitGroupShaders {
    /// Closest-hit stage
    pub closest_hit: String,
    /// Optional any-hit stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any_hit: Option<String>,
}

impl HitGroupShaders {
    /// Hit group with only a closest-hit stage
    pub fn closest_hit(path: impl Into<String>) -> Self {
        Self {
            closest_hit: path.into(),
            any_hit: None,
        }
    }

    /// Add an any-hit stage
    pub fn with_any_hit(mut self, path: impl Into<String>) -> Self {
        self.any_hit = Some(path.into());
        self
    }
}

/// # Ray-Tracing Shader Configuration
///
/// One raygen stage, ordered hit groups and ordered miss stages. Group order
/// here is the order the shader binding table is filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RayTracingShaderConfig {
    /// Raygen stage
    pub raygen: String,
    /// Miss stages, one per miss group
    pub miss: Vec<String>,
    /// Hit groups in binding-table order
    pub hit_groups: Vec<HitGroupShaders>,
}

impl RayTracingShaderConfig {
    /// Create a shader set from explicit paths
    pub fn new(raygen: impl Into<String>) -> Self {
        Self {
            raygen: raygen.into(),
            miss: Vec::new(),
            hit_groups: Vec::new(),
        }
    }

    /// Append a hit group
    pub fn with_hit_group(mut self, group: HitGroupShaders) -> Self {
        self.hit_groups.push(group);
        self
    }

    /// Append a miss stage
    pub fn with_miss(mut self, path: impl Into<String>) -> Self {
        self.miss.push(path.into());
        self
    }

    /// Create a shader set resolving each file name against the usual
    /// shader output directories
    pub fn with_path_resolution(
        raygen: &str,
        hit_groups: &[(&str, Option<&str>)],
        miss: &[&str],
    ) -> Self {
        Self {
            raygen: resolve_shader_path(raygen),
            miss: miss.iter().map(|name| resolve_shader_path(name)).collect(),
            hit_groups: hit_groups
                .iter()
                .map(|(closest_hit, any_hit)| HitGroupShaders {
                    closest_hit: resolve_shader_path(closest_hit),
                    any_hit: any_hit.map(resolve_shader_path),
                })
                .collect(),
        }
    }

    /// Number of hit groups
    pub fn hit_group_count(&self) -> u32 {
        self.hit_groups.len() as u32
    }

    /// Number of miss groups
    pub fn miss_group_count(&self) -> u32 {
        self.miss.len() as u32
    }

    /// Check that every configured shader file exists
    pub fn validate_files(&self) -> Result<(), ConfigError> {
        let paths = std::iter::once(&self.raygen)
            .chain(self.hit_groups.iter().flat_map(|group| {
                std::iter::once(&group.closest_hit).chain(group.any_hit.iter())
            }))
            .chain(self.miss.iter());

        for path in paths {
            if !Path::new(path).exists() {
                return Err(ConfigError::Validation(format!("Shader not found: {}", path)));
            }
        }
        Ok(())
    }
}

impl Default for RayTracingShaderConfig {
    fn default() -> Self {
        Self::with_path_resolution(
            "ray_gen.spv",
            &[("ray_chit.spv", None), ("shadow_ray_chit.spv", None)],
            &["ray_miss.spv", "shadow_ray_miss.spv"],
        )
    }
}

/// # Renderer Configuration
///
/// Settings the ray-tracing core needs at configure time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Dispatch width and height
    pub resolution: (u32, u32),
    /// Whether to enable Vulkan validation layers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_validation: Option<bool>,
    /// Maximum ray recursion depth requested from the pipeline
    pub max_recursion_depth: u32,
    /// Acceleration structure build preference
    #[serde(default)]
    pub build_preference: BuildPreference,
    /// Ray-tracing shader set
    pub shaders: RayTracingShaderConfig,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            resolution: (1280, 720),
            enable_validation: None,
            max_recursion_depth: 2,
            build_preference: BuildPreference::FastTrace,
            shaders: RayTracingShaderConfig::default(),
        }
    }

    /// Set dispatch resolution
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = (width, height);
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Enables validation in debug builds and disables it in release builds
    pub fn with_auto_validation(mut self) -> Self {
        self.enable_validation = Some(cfg!(debug_assertions));
        self
    }

    /// Set maximum ray recursion depth
    pub fn with_max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    /// Set acceleration structure build preference
    pub fn with_build_preference(mut self, preference: BuildPreference) -> Self {
        self.build_preference = preference;
        self
    }

    /// Set the ray-tracing shader set
    pub fn with_shaders(mut self, shaders: RayTracingShaderConfig) -> Self {
        self.shaders = shaders;
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Dispatch extent
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.resolution.0,
            height: self.resolution.1,
        }
    }

    /// Validate the configuration values. Shader files are checked
    /// separately by [`RayTracingShaderConfig::validate_files`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Validation("Application name cannot be empty".to_string()));
        }

        if self.resolution.0 == 0 || self.resolution.1 == 0 {
            return Err(ConfigError::Validation(format!(
                "Resolution must be non-zero, got {}x{}",
                self.resolution.0, self.resolution.1
            )));
        }

        if self.max_recursion_depth == 0 {
            return Err(ConfigError::Validation(
                "Max recursion depth must be at least 1".to_string(),
            ));
        }

        if self.shaders.raygen.is_empty() {
            return Err(ConfigError::Validation("Raygen shader path cannot be empty".to_string()));
        }

        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("RTX Application").with_auto_validation()
    }
}

impl Config for RendererConfig {}
