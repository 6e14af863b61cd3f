//! Application configuration.

use serde::{Deserialize, Serialize};
use vse_asset::LoaderConfig;
use vse_gpu::frame::DEFAULT_FRAMES_IN_FLIGHT;
use vse_gpu::{DeviceConfig, FrameConfig};
use vse_render::RendererConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Window title, also used as the Vulkan application name.
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    pub frames_in_flight: u32,
    pub renderer: RendererConfig,
    pub loader: LoaderConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "VSE Viewer".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            renderer: RendererConfig::default(),
            loader: LoaderConfig::default(),
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    #[must_use]
    pub const fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    #[must_use]
    pub const fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: RendererConfig) -> Self {
        self.renderer = renderer;
        self
    }

    #[must_use]
    pub const fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig::default()
            .with_app_name(self.title.clone())
            .with_validation(self.validation)
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig::default()
            .with_frames_in_flight(self.frames_in_flight)
            .with_vsync(self.vsync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_configs_follow_app_settings() {
        let config = AppConfig::new("Test")
            .with_vsync(false)
            .with_frames_in_flight(3)
            .with_validation(true);

        let device = config.device_config();
        assert_eq!(device.app_name, "Test");
        assert!(device.validation);

        let frame = config.frame_config();
        assert_eq!(frame.frames_in_flight, 3);
        assert!(!frame.vsync);
    }

    #[test]
    fn defaults_keep_two_frames_in_flight() {
        let config = AppConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!((config.width, config.height), (1280, 720));
        assert!(config.target_fps.is_none());
    }
}
