//! NV12 -> BGRA colour conversion
//!
//! Two interchangeable strategies produce the same packed output for a given
//! [`ColorSpace`]:
//! - [`ShaderConverter`]: full-screen quad with a pixel program that hard-codes
//!   the YUV matrix (used with interop-registered luma/chroma planes)
//! - [`VideoProcessorConverter`]: the device's fixed-function video processor,
//!   driven by explicit input/output colour-space enums

mod matrix;
mod processor;
mod shader;

pub use matrix::{nv12_to_bgra, ColorSpace, DxgiColorSpace, YuvMatrix};
pub use processor::VideoProcessorConverter;
pub use shader::ShaderConverter;
