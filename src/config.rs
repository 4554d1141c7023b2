//! Configuration types for GhostCodec

use crate::convert::ColorSpace;
use crate::error::{Error, Result};
use crate::types::{ApiKind, Codec, OutputMode, Resolution};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Highest quantizer accepted by every backend
pub const MAX_QP: u8 = 51;

/// Quantizer bounds, always `min <= max <= 51`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawQpRange")]
pub struct QpRange {
    min: u8,
    max: u8,
}

#[derive(Deserialize)]
struct RawQpRange {
    min: i32,
    max: i32,
}

impl TryFrom<RawQpRange> for QpRange {
    type Error = Error;

    fn try_from(raw: RawQpRange) -> Result<Self> {
        QpRange::new(raw.min, raw.max)
    }
}

impl QpRange {
    /// Validate a quantizer range as received from a caller
    pub fn new(min: i32, max: i32) -> Result<Self> {
        let in_range = |q: i32| (0..=MAX_QP as i32).contains(&q);
        if !in_range(min) || !in_range(max) || min > max {
            return Err(Error::Configuration(format!(
                "invalid qp range [{}, {}], expected 0 <= min <= max <= {}",
                min, max, MAX_QP
            )));
        }
        Ok(Self {
            min: min as u8,
            max: max as u8,
        })
    }

    pub fn min(&self) -> u8 {
        self.min
    }

    pub fn max(&self) -> u8 {
        self.max
    }
}

impl Default for QpRange {
    fn default() -> Self {
        Self { min: 0, max: MAX_QP }
    }
}

/// Encoder session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Output bitstream format
    pub codec: Codec,
    /// API the encoder context binds the device through
    pub api: ApiKind,
    /// Encoded resolution, must match the submitted textures
    pub resolution: Resolution,
    /// Target bitrate in kbps
    pub bitrate_kbps: u32,
    /// Frames per second
    pub framerate: u32,
    /// IDR period in frames
    pub gop: u32,
    /// Quantizer bounds
    pub qp: QpRange,
    /// Upper bound on a single output drain
    pub drain_timeout_ms: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            api: ApiKind::Dx11,
            resolution: Resolution::FHD_1080P,
            bitrate_kbps: 4000,
            framerate: 60,
            gop: 60,
            qp: QpRange::default(),
            drain_timeout_ms: 2000,
        }
    }
}

impl EncoderConfig {
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_api(mut self, api: ApiKind) -> Self {
        self.api = api;
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Resolution::new(width, height);
        self
    }

    pub fn with_bitrate_kbps(mut self, bitrate: u32) -> Self {
        self.bitrate_kbps = bitrate;
        self
    }

    pub fn with_framerate(mut self, fps: u32) -> Self {
        self.framerate = fps;
        self
    }

    pub fn with_gop(mut self, gop: u32) -> Self {
        self.gop = gop;
        self
    }

    pub fn with_qp(mut self, qp: QpRange) -> Self {
        self.qp = qp;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Reject anything a backend would choke on, before touching the GPU
    pub fn validate(&self) -> Result<()> {
        if !self.resolution.is_valid_420() {
            return Err(Error::Configuration(format!(
                "resolution {} must be positive and even",
                self.resolution
            )));
        }
        if self.bitrate_kbps == 0 {
            return Err(Error::Configuration("bitrate must be positive".into()));
        }
        if self.framerate == 0 {
            return Err(Error::Configuration("framerate must be positive".into()));
        }
        if self.drain_timeout_ms == 0 {
            return Err(Error::Configuration("drain timeout must be positive".into()));
        }
        Ok(())
    }

    /// Apply a preset configuration
    pub fn from_preset(preset: Preset) -> Self {
        preset.into()
    }
}

/// Decoder session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Input bitstream format
    pub codec: Codec,
    /// API the decoder binds the device through
    pub api: ApiKind,
    /// Raw texture or shared handle delivery
    pub output: OutputMode,
    /// YUV matrix and range used for NV12 -> BGRA
    pub color: ColorSpace,
    /// Bound on a media-engine sync point wait
    pub sync_timeout_ms: u64,
    /// Cap on busy/more-surface retries inside one decode call
    pub max_decode_iterations: u32,
    /// Number of BGRA output textures cycled through
    pub output_ring_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            api: ApiKind::Dx11,
            output: OutputMode::Texture,
            color: ColorSpace::default(),
            sync_timeout_ms: 1000,
            max_decode_iterations: 100,
            output_ring_size: 4,
        }
    }
}

impl DecoderConfig {
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_api(mut self, api: ApiKind) -> Self {
        self.api = api;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn with_color(mut self, color: ColorSpace) -> Self {
        self.color = color;
        self
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sync_timeout_ms == 0 {
            return Err(Error::Configuration("sync timeout must be positive".into()));
        }
        if self.max_decode_iterations == 0 {
            return Err(Error::Configuration(
                "decode iteration cap must be positive".into(),
            ));
        }
        if self.output_ring_size == 0 {
            return Err(Error::Configuration("output ring must hold a texture".into()));
        }
        Ok(())
    }
}

/// Encoder and decoder settings loaded together from one TOML file
///
/// ```toml
/// [encoder]
/// codec = "hevc"
/// resolution = { width = 1920, height = 1080 }
/// bitrate_kbps = 6000
/// qp = { min = 10, max = 40 }
///
/// [decoder]
/// output = "shared_handle"
/// color = { bt709 = true, full_range = false }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
}

impl TranscodeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: TranscodeConfig = toml::from_str(text)?;
        config.encoder.validate()?;
        config.decoder.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        tracing::debug!("Loading transcode config from {}", path.display());
        Self::from_toml_str(&text)
    }
}

/// Fixed encoder presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preset {
    /// 720p30 H.264, 2.5 Mbps
    Stream720p30,
    /// 1080p60 H.264, 4 Mbps
    Stream1080p60,
    /// 1080p60 H.264, short GOP for remote desktop
    LowLatency1080p60,
    /// 1440p60 HEVC, 12 Mbps
    Quality1440p60,
    /// 4K60 HEVC, 25 Mbps
    Ultra4K60,
}

impl Preset {
    pub const ALL: [Preset; 5] = [
        Preset::Stream720p30,
        Preset::Stream1080p60,
        Preset::LowLatency1080p60,
        Preset::Quality1440p60,
        Preset::Ultra4K60,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "720p" | "stream720p30" => Some(Preset::Stream720p30),
            "1080p" | "stream1080p60" => Some(Preset::Stream1080p60),
            "lowlatency" | "lowlatency1080p60" => Some(Preset::LowLatency1080p60),
            "quality" | "quality1440p60" => Some(Preset::Quality1440p60),
            "4k" | "ultra4k60" => Some(Preset::Ultra4K60),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Preset::Stream720p30 => "720p30, H.264, 2.5 Mbps",
            Preset::Stream1080p60 => "1080p60, H.264, 4 Mbps",
            Preset::LowLatency1080p60 => "1080p60, H.264, 6 Mbps, 30 frame GOP",
            Preset::Quality1440p60 => "1440p60, HEVC, 12 Mbps",
            Preset::Ultra4K60 => "4K60, HEVC, 25 Mbps",
        }
    }
}

impl From<Preset> for EncoderConfig {
    fn from(preset: Preset) -> Self {
        match preset {
            Preset::Stream720p30 => EncoderConfig {
                codec: Codec::H264,
                resolution: Resolution::HD_720P,
                bitrate_kbps: 2500,
                framerate: 30,
                gop: 60,
                ..Default::default()
            },
            Preset::Stream1080p60 => EncoderConfig {
                codec: Codec::H264,
                resolution: Resolution::FHD_1080P,
                bitrate_kbps: 4000,
                framerate: 60,
                gop: 120,
                ..Default::default()
            },
            Preset::LowLatency1080p60 => EncoderConfig {
                codec: Codec::H264,
                resolution: Resolution::FHD_1080P,
                bitrate_kbps: 6000,
                framerate: 60,
                gop: 30,
                ..Default::default()
            },
            Preset::Quality1440p60 => EncoderConfig {
                codec: Codec::Hevc,
                resolution: Resolution::QHD_1440P,
                bitrate_kbps: 12000,
                framerate: 60,
                gop: 120,
                ..Default::default()
            },
            Preset::Ultra4K60 => EncoderConfig {
                codec: Codec::Hevc,
                resolution: Resolution::UHD_4K,
                bitrate_kbps: 25000,
                framerate: 60,
                gop: 120,
                ..Default::default()
            },
        }
    }
}
