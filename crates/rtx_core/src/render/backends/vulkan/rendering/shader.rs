//! SPIR-V shader modules
//!
//! Ray-tracing stages are loaded from compiled SPIR-V files and only need to
//! live until the pipeline that references them has been created.

use ash::{vk, Device};
use std::path::Path;

use crate::error::{RtxError, RtxResult};

/// SPIR-V shader module wrapper with automatic resource management
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create shader module from SPIR-V bytecode
    pub fn from_bytes(device: &Device, bytes: &[u8]) -> RtxResult<Self> {
        Self::from_bytes_named(device, bytes, "<memory>")
    }

    fn from_bytes_named(device: &Device, bytes: &[u8], name: &str) -> RtxResult<Self> {
        log::debug!("[SHADER] Creating shader module from {} bytes", bytes.len());

        let words = spirv_words(bytes).map_err(|reason| {
            log::error!("[SHADER] {}: {}", name, reason);
            RtxError::Shader { path: name.to_string(), reason }
        })?;

        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

        let module = unsafe {
            device.create_shader_module(&create_info, None)
                .map_err(|e| RtxError::resource_creation(format!("shader module {}", name), e))?
        };

        log::debug!("[SHADER] Shader module created: {:?}", module);
        Ok(Self { device: device.clone(), module })
    }

    /// Load shader from SPIR-V file
    pub fn from_file<P: AsRef<Path>>(device: &Device, path: P) -> RtxResult<Self> {
        let path_ref = path.as_ref();
        log::debug!("[SHADER] Loading shader from: {:?}", path_ref);

        let bytes = std::fs::read(path_ref).map_err(|e| {
            log::error!("[SHADER] Failed to read shader file {:?}: {}", path_ref, e);
            RtxError::Shader {
                path: path_ref.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        Self::from_bytes_named(device, &bytes, &path_ref.display().to_string())
    }

    /// Get shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        log::debug!("[SHADER] Dropping ShaderModule {:?}", self.module);
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Decode SPIR-V bytes into words, checking length and magic number
pub fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>, String> {
    let mut cursor = std::io::Cursor::new(bytes);
    ash::util::read_spv(&mut cursor).map_err(|e| format!("invalid SPIR-V: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn test_spirv_words_accepts_magic() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 7]);
    }

    #[test]
    fn test_spirv_words_rejects_truncated_input() {
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
    }

    #[test]
    fn test_spirv_words_rejects_bad_magic() {
        assert!(spirv_words(&[0u8; 8]).is_err());
    }
}
