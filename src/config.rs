use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{MonitorError, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// HTTP/WebSocket server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Filesystem roots for demo videos and recordings.
    pub paths: PathsConfig,
    /// Model weights and device selection.
    pub models: ModelConfig,
    /// Persistence configuration (optional).
    #[serde(default)]
    pub db: DbConfig,
    /// Initial per-session parameter defaults.
    #[serde(default)]
    pub defaults: DefaultParams,
    /// Known cameras, served by the camera-list endpoint.
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

fn default_port() -> u16 { 9000 }

/// Filesystem layout.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Directory that relative / `/video/...` source URLs resolve into.
    pub video_root: PathBuf,
    /// Directory recordings are written under (`<record_root>/<camera>/<ts>.mp4`).
    pub record_root: PathBuf,
}

/// Model weights and device selection, fixed at process start.
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// ONNX weights for the water segmentation model.
    pub water_weights: PathBuf,
    /// ONNX weights for the vehicle/risk model.
    pub risk_weights: PathBuf,
    /// "cpu" or "cuda" (requires the `cuda` build feature).
    #[serde(default = "default_device")]
    pub device: String,
}

fn default_device() -> String { "cpu".into() }

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// Whether sessions may be persisted at all.
    #[serde(default)]
    pub enabled: bool,
    /// sqlx connection URL.
    #[serde(default = "default_db_url")]
    pub url: String,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { enabled: false, url: default_db_url() }
    }
}

fn default_db_url() -> String { "sqlite://floodwatch.db".into() }

/// Default tunable parameters applied to every new session before the
/// start record's overrides.
#[derive(Debug, Deserialize, Clone)]
pub struct DefaultParams {
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_conf")]
    pub conf_water: f32,
    #[serde(default = "default_iou")]
    pub iou_water: f32,
    #[serde(default = "default_conf")]
    pub conf_risk: f32,
    #[serde(default = "default_iou")]
    pub iou_risk: f32,
    #[serde(default = "default_send_mask_every")]
    pub send_mask_every: u32,
    #[serde(default = "default_imgsz")]
    pub imgsz_water: u32,
    #[serde(default = "default_imgsz")]
    pub imgsz_risk: u32,
}

impl Default for DefaultParams {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            conf_water: default_conf(),
            iou_water: default_iou(),
            conf_risk: default_conf(),
            iou_risk: default_iou(),
            send_mask_every: default_send_mask_every(),
            imgsz_water: default_imgsz(),
            imgsz_risk: default_imgsz(),
        }
    }
}

fn default_fps() -> u32 { 10 }
fn default_conf() -> f32 { 0.25 }
fn default_iou() -> f32 { 0.45 }
fn default_send_mask_every() -> u32 { 1 }
fn default_imgsz() -> u32 { 640 }

/// Per-camera configuration (informational; sessions name their own source).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Unique identifier used for recording directories.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Free-form location description.
    #[serde(default)]
    pub location: String,
    /// Stream or file URL.
    pub url: String,
    /// "video", "live", "hls" or "mjpeg".
    #[serde(default = "default_source_type")]
    pub source_type: String,
}

fn default_source_type() -> String { "video".into() }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MonitorError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| MonitorError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(MonitorError::Config("server.port must be > 0".into()));
        }
        if self.paths.video_root.as_os_str().is_empty() {
            return Err(MonitorError::Config("paths.video_root must be set".into()));
        }
        if self.paths.record_root.as_os_str().is_empty() {
            return Err(MonitorError::Config("paths.record_root must be set".into()));
        }
        if self.defaults.fps == 0 || self.defaults.fps > 30 {
            return Err(MonitorError::Config("defaults.fps must be in 1..=30".into()));
        }
        Ok(())
    }
}
