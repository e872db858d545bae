use crate::common::config::CameraConfig;
use crate::common::{AttendanceError, Result};
use crate::core::pipeline::VideoSource;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use std::fs;
use std::time::Duration;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

const STREAM_BUFFERS: u32 = 4;

/// Pixel layouts the capture path knows how to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Grey,
    Yuyv,
    Mjpeg,
}

impl PixelLayout {
    fn from_fourcc(fourcc: &FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"GREY" => Some(Self::Grey),
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub index: u32,
    pub name: String,
    pub formats: Vec<String>,
    pub supported: bool,
}

pub struct Camera {
    device: Device,
    config: CameraConfig,
    width: u32,
    height: u32,
    layout: PixelLayout,
}

impl Camera {
    /// Every `/dev/videoN` that answers a capability query.
    pub fn list_all_cameras() -> Result<Vec<CameraInfo>> {
        let mut cameras = Vec::new();

        for entry in fs::read_dir("/dev")? {
            let path = entry?.path();
            let Some(index) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("video"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };

            let Ok(device) = Device::new(index as usize) else {
                continue;
            };
            let Ok(caps) = device.query_caps() else {
                continue;
            };

            let formats = device.enum_formats().unwrap_or_default();
            let supported = caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE)
                && formats.iter().any(|f| PixelLayout::from_fourcc(&f.fourcc).is_some());

            cameras.push(CameraInfo {
                index,
                name: caps.card.clone(),
                formats: formats
                    .iter()
                    .map(|f| f.fourcc.str().unwrap_or("????").to_string())
                    .collect(),
                supported,
            });
        }

        cameras.sort_by_key(|c| c.index);
        Ok(cameras)
    }

    pub fn new(config: &CameraConfig) -> Result<Self> {
        let index = config.device_index;
        let device = Device::new(index as usize)
            .map_err(|e| AttendanceError::Camera(format!("Failed to open camera {}: {}", index, e)))?;

        let caps = device
            .query_caps()
            .map_err(|e| AttendanceError::Camera(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            tracing::warn!("Device {} ({}) may not support video capture", index, caps.card);
        }

        let mut fmt = device
            .format()
            .map_err(|e| AttendanceError::Camera(format!("Failed to get format: {}", e)))?;
        fmt.width = config.width;
        fmt.height = config.height;
        if PixelLayout::from_fourcc(&fmt.fourcc).is_none() {
            fmt.fourcc = FourCC::new(b"MJPG");
        }

        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set format {}x{}: {}. Using device defaults.", fmt.width, fmt.height, e);
        }

        let actual = device
            .format()
            .map_err(|e| AttendanceError::Camera(format!("Failed to get final format: {}", e)))?;
        let layout = PixelLayout::from_fourcc(&actual.fourcc).ok_or_else(|| {
            AttendanceError::Camera(format!(
                "Unsupported pixel format {}",
                actual.fourcc.str().unwrap_or("????")
            ))
        })?;

        if actual.width != config.width || actual.height != config.height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                actual.width, actual.height, config.width, config.height
            );
        }
        tracing::info!("Camera {} ({}) open at {}x{} {:?}", index, caps.card, actual.width, actual.height, layout);

        Ok(Self {
            device,
            config: config.clone(),
            width: actual.width,
            height: actual.height,
            layout,
        })
    }

    /// Starts streaming and discards the configured warmup frames.
    pub fn start_session(&mut self) -> Result<CameraSession<'_>> {
        let mut stream = Stream::with_buffers(&mut self.device, Type::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| AttendanceError::Camera(format!("Failed to create stream: {}", e)))?;

        for i in 0..self.config.warmup_frames {
            stream
                .next()
                .map_err(|e| AttendanceError::Camera(format!("Failed to capture warmup frame {}: {}", i, e)))?;
            std::thread::sleep(Duration::from_millis(self.config.warmup_delay_ms));
        }
        tracing::debug!("Camera ready after {} warmup frames", self.config.warmup_frames);

        Ok(CameraSession {
            stream: Some(stream),
            width: self.width,
            height: self.height,
            layout: self.layout,
        })
    }
}

/// A running capture stream. Dropping the stream turns it off.
pub struct CameraSession<'a> {
    stream: Option<Stream<'a>>,
    width: u32,
    height: u32,
    layout: PixelLayout,
}

impl VideoSource for CameraSession<'_> {
    fn next_frame(&mut self) -> Result<Option<DynamicImage>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        let (buf, _meta) = stream
            .next()
            .map_err(|e| AttendanceError::Camera(format!("Failed to capture: {}", e)))?;
        decode_frame(buf, self.width, self.height, self.layout).map(Some)
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("Camera stream released");
        }
    }
}

pub fn decode_frame(data: &[u8], width: u32, height: u32, layout: PixelLayout) -> Result<DynamicImage> {
    match layout {
        PixelLayout::Grey => {
            let pixels = (width * height) as usize;
            let buffer = data.get(..pixels).ok_or_else(|| short_frame(data.len(), pixels))?;
            GrayImage::from_raw(width, height, buffer.to_vec())
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| AttendanceError::Camera("Failed to create grayscale image buffer".into()))
        }
        PixelLayout::Yuyv => yuyv_to_rgb(data, width, height).map(DynamicImage::ImageRgb8),
        PixelLayout::Mjpeg => Ok(image::load_from_memory_with_format(data, ImageFormat::Jpeg)?),
    }
}

fn short_frame(got: usize, want: usize) -> AttendanceError {
    AttendanceError::Camera(format!("Short frame: {} bytes, expected {}", got, want))
}

/// Packed YUV 4:2:2 (Y0 U Y1 V) to RGB, BT.601.
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let bytes = (width * height * 2) as usize;
    let data = data.get(..bytes).ok_or_else(|| short_frame(data.len(), bytes))?;

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in data.chunks_exact(4) {
        let (u, v) = (quad[1] as f32 - 128.0, quad[3] as f32 - 128.0);
        for y in [quad[0], quad[2]] {
            let y = y as f32;
            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| AttendanceError::Camera("Failed to create RGB image buffer".into()))
}
