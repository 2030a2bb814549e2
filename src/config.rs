//! Configuration loader - YAML tuning file + .env settings

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use three_d::{vec3, Rad};

use crate::camera::FitOptions;
use crate::overlay::DEFAULT_DIM_GRAY;
use crate::picker::{PickConfig, DEFAULT_CLICK_THRESHOLD_PX, DEFAULT_PIXEL_RADIUS};
use crate::selection::{DEFAULT_PROXIMITY_RADIUS, DEFAULT_REMOVE_RADIUS};

/// Tuning loaded from cloud_seg.yaml. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub picking: PickingConfig,
    pub selection: SelectionConfig,
    pub overlay: OverlayConfig,
    pub camera: CameraConfig,
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PickingConfig {
    pub click_threshold_px: f32,
    pub pixel_radius: f32,
    /// Pick on pointer move as well as on click
    pub hover: bool,
}

impl Default for PickingConfig {
    fn default() -> Self {
        Self {
            click_threshold_px: DEFAULT_CLICK_THRESHOLD_PX,
            pixel_radius: DEFAULT_PIXEL_RADIUS,
            hover: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub proximity_radius: f32,
    pub remove_radius: f32,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            proximity_radius: DEFAULT_PROXIMITY_RADIUS,
            remove_radius: DEFAULT_REMOVE_RADIUS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub dim_gray: f32,
    /// Decode colors from sRGB before display
    pub linear_colors: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            dim_gray: DEFAULT_DIM_GRAY,
            linear_colors: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub padding: f32,
    pub direction: [f32; 3],
    pub fov_degrees: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            padding: 0.25,
            direction: [0.0, 1.5, -0.1],
            fov_degrees: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Point sprite size in pixels
    pub point_size: f32,
    pub marker_radius: f32,
    pub orbit_speed: f32,
    pub zoom_speed: f32,
    /// Seconds a notification stays on screen
    pub notice_secs: f32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            point_size: 2.0,
            marker_radius: 5.0,
            orbit_speed: 0.005,
            zoom_speed: 0.001,
            notice_secs: 4.0,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load when the file exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn fit_options(&self) -> FitOptions {
        let [x, y, z] = self.camera.direction;
        FitOptions {
            padding: self.camera.padding,
            direction: vec3(x, y, z),
        }
    }

    pub fn fov(&self) -> Rad<f32> {
        Rad(self.camera.fov_degrees.to_radians())
    }

    pub fn pick_config(&self) -> PickConfig {
        PickConfig {
            pixel_radius: self.picking.pixel_radius,
        }
    }
}

/// Settings loaded from the environment and .env
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_base_url: String,
    pub api_timeout: Duration,
    pub log_dir: String,
}

impl Settings {
    pub fn load() -> Self {
        dotenvy::dotenv().ok();

        Settings {
            api_base_url: std::env::var("API_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            api_timeout: Duration::from_secs(
                std::env::var("API_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            log_dir: std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string()),
        }
    }
}
