use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::common::error::{AttendanceError, Result};
use crate::core::pipeline::{DetectionModel, EncodingModel};
use crate::service::protocol;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Required before a session can start; may also come from `--server`.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_database_port")]
    pub database_port: u16,
    #[serde(default = "default_attendance_port")]
    pub attendance_port: u16,
    #[serde(default = "default_database_chunk_size")]
    pub database_chunk_size: usize,
    #[serde(default = "default_attendance_chunk_size")]
    pub attendance_chunk_size: usize,
}

fn default_database_port() -> u16 { protocol::DEFAULT_DATABASE_PORT }
fn default_attendance_port() -> u16 { protocol::DEFAULT_ATTENDANCE_PORT }
fn default_database_chunk_size() -> usize { protocol::DEFAULT_DATABASE_CHUNK_SIZE }
fn default_attendance_chunk_size() -> usize { protocol::DEFAULT_ATTENDANCE_CHUNK_SIZE }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: None,
            database_port: default_database_port(),
            attendance_port: default_attendance_port(),
            database_chunk_size: default_database_chunk_size(),
            attendance_chunk_size: default_attendance_chunk_size(),
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> Result<&str> {
        match self.address.as_deref().map(str::trim) {
            Some(address) if !address.is_empty() => Ok(address),
            _ => Err(AttendanceError::Config(
                "Server address is required (set server.address or pass --server)".into(),
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    /// Smaller is faster but less accurate detection.
    #[serde(default = "default_scale_frame")]
    pub scale_frame: f32,
    #[serde(default)]
    pub detection_model: DetectionModel,
    #[serde(default)]
    pub encoding_model: EncodingModel,
    #[serde(default = "default_true")]
    pub show_preview: bool,
    #[serde(default = "default_fps")]
    pub desired_fps: u32,
    #[serde(default = "default_match_tolerance")]
    pub match_tolerance: f32,
}

fn default_scale_frame() -> f32 { 0.5 }
fn default_true() -> bool { true }
fn default_fps() -> u32 { 15 }
fn default_match_tolerance() -> f32 { 0.6 }

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scale_frame: default_scale_frame(),
            detection_model: DetectionModel::default(),
            encoding_model: EncodingModel::default(),
            show_preview: default_true(),
            desired_fps: default_fps(),
            match_tolerance: default_match_tolerance(),
        }
    }
}

impl SessionConfig {
    /// Preview wait between frames.
    pub fn frame_delay_ms(&self) -> u64 {
        1000 / self.desired_fps.max(1) as u64
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
}

fn default_camera_width() -> u32 { 640 }
fn default_camera_height() -> u32 { 480 }
fn default_warmup_frames() -> u32 { 5 }
fn default_warmup_delay() -> u64 { 50 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_camera_width(),
            height: default_camera_height(),
            warmup_frames: default_warmup_frames(),
            warmup_delay_ms: default_warmup_delay(),
        }
    }
}

/// Model files; relative paths resolve against the run mode's models dir.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_fast_detector")]
    pub fast_detector_path: PathBuf,
    #[serde(default = "default_accurate_detector")]
    pub accurate_detector_path: PathBuf,
    #[serde(default = "default_small_encoder")]
    pub small_encoder_path: PathBuf,
    #[serde(default = "default_large_encoder")]
    pub large_encoder_path: PathBuf,
    #[serde(default = "default_optimization_level")]
    pub optimization_level: u32,
}

fn default_fast_detector() -> PathBuf { PathBuf::from("face_detector_fast.onnx") }
fn default_accurate_detector() -> PathBuf { PathBuf::from("face_detector_accurate.onnx") }
fn default_small_encoder() -> PathBuf { PathBuf::from("face_encoder_small.onnx") }
fn default_large_encoder() -> PathBuf { PathBuf::from("face_encoder_large.onnx") }
fn default_optimization_level() -> u32 { 3 }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            fast_detector_path: default_fast_detector(),
            accurate_detector_path: default_accurate_detector(),
            small_encoder_path: default_small_encoder(),
            large_encoder_path: default_large_encoder(),
            optimization_level: default_optimization_level(),
        }
    }
}

impl ModelConfig {
    pub fn detector_path(&self, model: DetectionModel, models_base: &Path) -> PathBuf {
        let path = match model {
            DetectionModel::Fast => &self.fast_detector_path,
            DetectionModel::Accurate => &self.accurate_detector_path,
        };
        resolve_model_path(path, models_base)
    }

    pub fn encoder_path(&self, model: EncodingModel, models_base: &Path) -> PathBuf {
        let path = match model {
            EncodingModel::Small => &self.small_encoder_path,
            EncodingModel::Large => &self.large_encoder_path,
        };
        resolve_model_path(path, models_base)
    }
}

fn resolve_model_path(path: &Path, models_base: &Path) -> PathBuf {
    if path.is_relative() {
        models_base.join(path)
    } else {
        path.to_path_buf()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    #[serde(default = "default_detection_confidence")]
    pub confidence_threshold: f32,
    #[serde(default = "default_max_faces")]
    pub max_faces: usize,
}

fn default_detector_input() -> u32 { 640 }
fn default_detection_confidence() -> f32 { 0.5 }
fn default_max_faces() -> usize { 10 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            confidence_threshold: default_detection_confidence(),
            max_faces: default_max_faces(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EncoderConfig {
    #[serde(default = "default_encoder_input")]
    pub input_size: u32,
    #[serde(default = "default_normalization")]
    pub normalization_value: f32,
}

fn default_encoder_input() -> u32 { 112 }
fn default_normalization() -> f32 { 127.5 }

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            input_size: default_encoder_input(),
            normalization_value: default_normalization(),
        }
    }
}

impl Config {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AttendanceError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| AttendanceError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.session.scale_frame > 0.0 && self.session.scale_frame <= 1.0) {
            return Err(AttendanceError::Config(format!(
                "Frame scale must be in (0.0, 1.0], got {}", self.session.scale_frame
            )));
        }
        if self.session.desired_fps == 0 || self.session.desired_fps > 120 {
            return Err(AttendanceError::Config(format!(
                "Desired FPS must be between 1 and 120, got {}", self.session.desired_fps
            )));
        }
        if !(self.session.match_tolerance > 0.0) {
            return Err(AttendanceError::Config(format!(
                "Match tolerance must be positive, got {}", self.session.match_tolerance
            )));
        }

        if self.server.database_chunk_size == 0 || self.server.attendance_chunk_size == 0 {
            return Err(AttendanceError::Config("Chunk sizes must be at least 1 byte".into()));
        }
        if self.server.database_port == 0 || self.server.attendance_port == 0 {
            return Err(AttendanceError::Config("Server ports must be non-zero".into()));
        }

        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(AttendanceError::Config(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(AttendanceError::Config(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }

        if self.detector.input_width == 0 || self.detector.input_width > 4096
            || self.detector.input_height == 0 || self.detector.input_height > 4096
        {
            return Err(AttendanceError::Config(format!(
                "Detector input must be between 1 and 4096 per side, got {}x{}",
                self.detector.input_width, self.detector.input_height
            )));
        }
        if self.detector.confidence_threshold < 0.0 || self.detector.confidence_threshold > 1.0 {
            return Err(AttendanceError::Config(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.confidence_threshold
            )));
        }

        if self.encoder.input_size == 0 || self.encoder.input_size > 1024 {
            return Err(AttendanceError::Config(format!(
                "Encoder input size must be between 1 and 1024, got {}", self.encoder.input_size
            )));
        }

        Ok(())
    }
}
