// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. The compiled modules are read
// from disk at startup (see build.rs for compilation).

use anyhow::{Context, Result};
use ash::vk;
use std::path::Path;

use super::VulkanDevice;
use crate::config::ShaderConfig;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into words, accepting either byte order
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        anyhow::bail!("SPIR-V length {} is not a positive multiple of 4", bytes.len());
    }

    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] == SPIRV_MAGIC.swap_bytes() {
        for word in &mut words {
            *word = word.swap_bytes();
        }
    } else if words[0] != SPIRV_MAGIC {
        anyhow::bail!("Missing SPIR-V magic number (found {:#010x})", words[0]);
    }

    Ok(words)
}

/// Read a compiled shader from disk
pub fn load_spirv<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to open shader file: {:?}", path))?;

    parse_spirv(&bytes).with_context(|| format!("Invalid shader file: {:?}", path))
}

/// Vertex + fragment SPIR-V for the triangle pipeline
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderSet {
    pub fn load(config: &ShaderConfig) -> Result<Self> {
        let shaders = Self {
            vertex: load_spirv(&config.vertex)?,
            fragment: load_spirv(&config.fragment)?,
        };
        log::debug!(
            "Loaded shaders {:?} ({} words), {:?} ({} words)",
            config.vertex,
            shaders.vertex.len(),
            config.fragment,
            shaders.fragment.len()
        );
        Ok(shaders)
    }
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder()
        .code(code);

    unsafe {
        device.device.create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}
