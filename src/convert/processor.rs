//! Fixed-function video processor conversion

use super::matrix::{ColorSpace, DxgiColorSpace};
use crate::error::{Error, Result};
use crate::gpu::{GpuDevice, ProcessJob};
use crate::types::{PlatformHandle, Resolution};

/// Output of the video processor is always full-range sRGB
pub const OUTPUT_SPACE: DxgiColorSpace = DxgiColorSpace::RgbFullG22NoneP709;

/// NV12 -> BGRA converter backed by the device's video processor block
#[derive(Debug, Clone)]
pub struct VideoProcessorConverter {
    color: ColorSpace,
    input_space: DxgiColorSpace,
    frame_rate: u32,
    configured: Option<Resolution>,
}

impl VideoProcessorConverter {
    pub fn new(color: ColorSpace) -> Self {
        Self {
            color,
            input_space: color.into(),
            frame_rate: 60,
            configured: None,
        }
    }

    pub fn with_frame_rate(mut self, fps: u32) -> Self {
        self.frame_rate = fps.max(1);
        self
    }

    pub fn color_space(&self) -> ColorSpace {
        self.color
    }

    pub fn input_space(&self) -> DxgiColorSpace {
        self.input_space
    }

    /// Convert the visible `crop` of `input` into `output` and wait for the GPU
    pub fn process(
        &mut self,
        device: &mut dyn GpuDevice,
        input: PlatformHandle,
        output: PlatformHandle,
        crop: Resolution,
    ) -> Result<()> {
        if !crop.is_valid_420() {
            return Err(Error::ColorspaceConversion(format!(
                "invalid crop {} for video processor",
                crop
            )));
        }
        if self.configured != Some(crop) {
            tracing::debug!(
                "Video processor configured for {} ({:?} -> {:?})",
                crop,
                self.input_space,
                OUTPUT_SPACE
            );
            self.configured = Some(crop);
        }

        device
            .video_process(&ProcessJob {
                input,
                output,
                input_space: self.input_space,
                output_space: OUTPUT_SPACE,
                crop,
                frame_rate: self.frame_rate,
            })
            .map_err(|e| Error::ColorspaceConversion(format!("video processor: {}", e)))?;
        device.flush_and_wait()
    }
}
