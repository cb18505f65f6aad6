// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::swapchain::DEFAULT_SURFACE_FORMAT;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Hello Triangle".to_string(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Concurrency depth of the frame ring
    pub max_frames_in_flight: usize,
    pub clear_color: [f32; 4],
    pub vertex_count: u32,
    /// Preferred surface format, see [`Config::surface_format`]
    pub surface_format: String,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            max_frames_in_flight: 2,
            clear_color: [0.1, 0.2, 0.3, 1.0],
            vertex_count: 3,
            surface_format: "bgra8_unorm".to_string(),
        }
    }
}

/// Compiled SPIR-V locations
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/triangle.vert.spv"),
            fragment: PathBuf::from("shaders/triangle.frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

/// Highest vertex count the triangle shaders have positions for
pub const MAX_VERTEX_COUNT: u32 = 3;

impl Config {
    /// Load `config.toml`, falling back to defaults on any error.
    ///
    /// Runs before the logger exists, so problems are returned as warnings
    /// for the caller to log once logging is up.
    pub fn load() -> (Self, Vec<String>) {
        Self::load_or_default("config.toml")
    }

    /// Like [`Config::load`] for an arbitrary path
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Vec<String>) {
        let path = path.as_ref();
        match Self::load_from_path(path) {
            Ok(loaded) => loaded,
            Err(e) => (
                Config::default(),
                vec![format!("Failed to load {:?}: {:#}. Using defaults.", path, e)],
            ),
        }
    }

    /// Load configuration from a specific path; a missing file yields defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<(Self, Vec<String>)> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok((Config::default(), Vec::new()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    /// Parse configuration text and normalize out-of-range values
    pub fn from_toml_str(content: &str) -> Result<(Self, Vec<String>)> {
        let mut config: Config = toml::from_str(content)?;
        let warnings = config.normalize();
        Ok((config, warnings))
    }

    /// Clamp values the renderer cannot use, describing each change
    fn normalize(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.graphics.max_frames_in_flight == 0 {
            warnings.push("max_frames_in_flight must be at least 1, using 1".to_string());
            self.graphics.max_frames_in_flight = 1;
        }

        if self.graphics.vertex_count > MAX_VERTEX_COUNT {
            warnings.push(format!(
                "vertex_count {} exceeds the {} vertices the shaders define, using {}",
                self.graphics.vertex_count, MAX_VERTEX_COUNT, MAX_VERTEX_COUNT
            ));
            self.graphics.vertex_count = MAX_VERTEX_COUNT;
        }

        warnings
    }

    /// Preferred surface format as a Vulkan format/color-space pair
    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        let srgb = vk::ColorSpaceKHR::SRGB_NONLINEAR;
        match self.graphics.surface_format.to_lowercase().as_str() {
            "bgra8_unorm" => DEFAULT_SURFACE_FORMAT,
            "bgra8_srgb" => vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: srgb,
            },
            "rgba8_unorm" => vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: srgb,
            },
            "rgba8_srgb" => vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_SRGB,
                color_space: srgb,
            },
            other => {
                log::warn!("Unknown surface format '{}', defaulting to bgra8_unorm", other);
                DEFAULT_SURFACE_FORMAT
            }
        }
    }

    /// Log filter parsed from `debug.log_level`
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let (config, warnings) = Config::from_toml_str("").unwrap();
        assert!(warnings.is_empty());
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.graphics.vertex_count, 3);
        assert_eq!(config.graphics.clear_color, [0.1, 0.2, 0.3, 1.0]);
        assert_eq!(config.surface_format().format, DEFAULT_SURFACE_FORMAT.format);
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let (config, _) = Config::from_toml_str(
            r#"
            [window]
            width = 1024

            [graphics]
            clear_color = [0.0, 0.0, 0.0, 1.0]
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1024);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.shaders.vertex, PathBuf::from("shaders/triangle.vert.spv"));
    }

    #[test]
    fn test_zero_frames_in_flight_is_clamped() {
        let (config, warnings) = Config::from_toml_str("[graphics]\nmax_frames_in_flight = 0\n").unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("max_frames_in_flight"));
    }

    #[test]
    fn test_vertex_count_capped_to_shader_vertices() {
        let (config, warnings) = Config::from_toml_str("[graphics]\nvertex_count = 6\n").unwrap();
        assert_eq!(config.graphics.vertex_count, MAX_VERTEX_COUNT);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("vertex_count 6"));

        // Zero draws nothing but is still valid
        let (config, warnings) = Config::from_toml_str("[graphics]\nvertex_count = 0\n").unwrap();
        assert_eq!(config.graphics.vertex_count, 0);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_surface_format_names() {
        let (config, _) = Config::from_toml_str("[graphics]\nsurface_format = \"BGRA8_SRGB\"\n").unwrap();
        assert_eq!(config.surface_format().format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(config.surface_format().color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);

        let (config, _) = Config::from_toml_str("[graphics]\nsurface_format = \"nope\"\n").unwrap();
        assert_eq!(config.surface_format().format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn test_log_level_parsing() {
        let (config, _) = Config::from_toml_str("[debug]\nlog_level = \"trace\"\n").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Trace);

        let (config, _) = Config::from_toml_str("[debug]\nlog_level = \"loud\"\n").unwrap();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        assert!(Config::from_toml_str("[graphics]\nvertex_count = \"three\"\n").is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let (config, warnings) = Config::load_or_default("definitely/not/here/config.toml");
        assert_eq!(config.window.title, "Hello Triangle");
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_malformed_file_falls_back_with_warning() {
        let path = std::env::temp_dir().join(format!("triangle-present-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[graphics]\nvertex_count = \"three\"\nmax_frames_in_flight = 0\n").unwrap();

        let (config, warnings) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.graphics.vertex_count, 3);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Failed to load"));
        assert!(warnings[0].contains("Using defaults"));
    }

    #[test]
    fn test_file_clamp_warnings_are_returned() {
        let path = std::env::temp_dir().join(format!("triangle-present-clamp-{}.toml", std::process::id()));
        std::fs::write(&path, "[graphics]\nmax_frames_in_flight = 0\n").unwrap();

        let (config, warnings) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.graphics.max_frames_in_flight, 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("at least 1"));
    }
}
