//! GPU device contract
//!
//! Every session drives its device through [`GpuDevice`]: texture and view
//! creation, the full-screen-quad shader pass, the fixed-function video
//! processor and shared-handle export. A session owns its device exclusively,
//! so the trait takes `&mut self` and needs no internal locking.

use crate::convert::{DxgiColorSpace, YuvMatrix};
use crate::error::Result;
use crate::types::{Luid, PlatformHandle, Resolution};

/// Texel layout of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Single 8-bit channel (luma plane)
    R8,
    /// Two 8-bit channels (interleaved chroma plane)
    R8G8,
    /// Two-plane 4:2:0, luma followed by interleaved chroma
    Nv12,
    /// Packed 8-bit BGRA
    Bgra8,
}

impl PixelFormat {
    /// Bytes needed for a tightly packed surface of this format
    pub fn byte_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::R8 => pixels,
            PixelFormat::R8G8 => pixels * 2,
            PixelFormat::Nv12 => pixels + pixels / 2,
            PixelFormat::Bgra8 => pixels * 4,
        }
    }
}

/// What a texture will be bound as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureUsage {
    /// Sampled by a pixel shader, written by interop copies
    ShaderResource,
    /// Render target, private to the device
    RenderTarget,
    /// Render target that can be exported as a shared handle
    SharedRenderTarget,
    /// Decoder output surface
    Decoder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub const fn new(width: u32, height: u32, format: PixelFormat, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            format,
            usage,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// How a texture is viewed by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    ShaderResource(PixelFormat),
    RenderTarget,
}

/// Full-screen quad vertex: clip-space position + texture coordinate
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadVertex {
    pub pos: [f32; 3],
    pub tex: [f32; 2],
}

/// Two triangles covering clip space, texture origin at the top-left
pub const FULLSCREEN_QUAD: [QuadVertex; 6] = [
    QuadVertex { pos: [-1.0, -1.0, 0.0], tex: [0.0, 1.0] },
    QuadVertex { pos: [-1.0, 1.0, 0.0], tex: [0.0, 0.0] },
    QuadVertex { pos: [1.0, -1.0, 0.0], tex: [1.0, 1.0] },
    QuadVertex { pos: [1.0, -1.0, 0.0], tex: [1.0, 1.0] },
    QuadVertex { pos: [-1.0, 1.0, 0.0], tex: [0.0, 0.0] },
    QuadVertex { pos: [1.0, 1.0, 0.0], tex: [1.0, 0.0] },
];

/// Pixel program source together with the matrix it hard-codes
#[derive(Debug, Clone, PartialEq)]
pub struct PixelProgram {
    pub source: String,
    pub entry_point: &'static str,
    pub matrix: YuvMatrix,
}

/// One full-screen-quad draw with every binding spelled out
#[derive(Debug, Clone, Copy)]
pub struct DrawCall {
    pub vertex_shader: PlatformHandle,
    pub pixel_shader: PlatformHandle,
    pub input_layout: PlatformHandle,
    pub sampler: PlatformHandle,
    pub vertex_buffer: PlatformHandle,
    pub vertex_count: u32,
    /// Luma view at slot 0, chroma view at slot 1
    pub shader_resources: [PlatformHandle; 2],
    pub render_target: PlatformHandle,
    pub viewport: Resolution,
}

/// One fixed-function video processor blit (NV12 in, BGRA out)
#[derive(Debug, Clone, Copy)]
pub struct ProcessJob {
    pub input: PlatformHandle,
    pub output: PlatformHandle,
    pub input_space: DxgiColorSpace,
    pub output_space: DxgiColorSpace,
    /// Visible area of the input that is scaled onto the output
    pub crop: Resolution,
    pub frame_rate: u32,
}

/// Device/context pair a session renders and copies with
pub trait GpuDevice: Send {
    /// Adapter this device lives on
    fn luid(&self) -> Luid;

    /// Native device pointer handed to codec engines
    fn raw(&self) -> PlatformHandle;

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<PlatformHandle>;

    fn describe(&self, texture: PlatformHandle) -> Result<TextureDesc>;

    /// GPU-side copy of identically described textures
    fn copy_texture(&mut self, dst: PlatformHandle, src: PlatformHandle) -> Result<()>;

    /// Export a shared handle for a [`TextureUsage::SharedRenderTarget`] texture
    fn shared_handle(&mut self, texture: PlatformHandle) -> Result<PlatformHandle>;

    fn create_view(&mut self, texture: PlatformHandle, kind: ViewKind) -> Result<PlatformHandle>;

    fn create_sampler(&mut self) -> Result<PlatformHandle>;

    fn compile_vertex_shader(&mut self, source: &str, entry_point: &str) -> Result<PlatformHandle>;

    fn compile_pixel_shader(&mut self, program: &PixelProgram) -> Result<PlatformHandle>;

    /// Input layout matching [`QuadVertex`] for the given vertex shader
    fn create_input_layout(&mut self, vertex_shader: PlatformHandle) -> Result<PlatformHandle>;

    fn create_vertex_buffer(&mut self, vertices: &[QuadVertex]) -> Result<PlatformHandle>;

    fn draw(&mut self, call: &DrawCall) -> Result<()>;

    fn video_process(&mut self, job: &ProcessJob) -> Result<()>;

    /// Flush queued work and block until the GPU has consumed it
    fn flush_and_wait(&mut self) -> Result<()>;

    /// Release any object created by this device
    fn release(&mut self, object: PlatformHandle);
}
