//! Full-screen-quad shader conversion
//!
//! Samples the luma (R8) and chroma (R8G8) planes through two shader resource
//! views and renders a BGRA target with the YUV matrix baked into the pixel
//! program. The whole pipeline is built once per resolution and dropped as a
//! set when the resolution changes.

use super::matrix::{ColorSpace, YuvMatrix, CHROMA_ZERO};
use crate::error::{Error, Result};
use crate::gpu::{
    DrawCall, GpuDevice, PixelFormat, PixelProgram, TextureDesc, TextureUsage, ViewKind,
    FULLSCREEN_QUAD,
};
use crate::types::{PlatformHandle, Resolution};

const VERTEX_ENTRY: &str = "VS";
const PIXEL_ENTRY: &str = "PS";

const VERTEX_SHADER: &str = r#"
struct VS_INPUT { float4 Pos : POSITION; float2 Tex : TEXCOORD; };
struct PS_INPUT { float4 Pos : SV_POSITION; float2 Tex : TEXCOORD; };

PS_INPUT VS(VS_INPUT input)
{
    PS_INPUT output;
    output.Pos = input.Pos;
    output.Tex = input.Tex;
    return output;
}
"#;

/// Pixel program applying `matrix` to the two sampled planes
pub fn pixel_shader_source(matrix: &YuvMatrix) -> String {
    format!(
        r#"
Texture2D lumaChannel : register(t0);
Texture2D chromaChannel : register(t1);
SamplerState splr : register(s0);

struct PS_INPUT {{ float4 Pos : SV_POSITION; float2 Tex : TEXCOORD; }};

float4 PS(PS_INPUT input) : SV_TARGET
{{
    float y = (lumaChannel.Sample(splr, input.Tex).r - {y_offset:.10}) * {y_scale:.10};
    float2 uv = chromaChannel.Sample(splr, input.Tex).rg - float2({chroma_zero:.10}, {chroma_zero:.10});
    float r = y + {rv:.10} * uv.y;
    float g = y - {gv:.10} * uv.y - {gu:.10} * uv.x;
    float b = y + {bu:.10} * uv.x;
    return float4(saturate(r), saturate(g), saturate(b), 1.0);
}}
"#,
        y_offset = matrix.y_offset,
        y_scale = matrix.y_scale,
        rv = matrix.rv,
        gv = matrix.gv,
        gu = matrix.gu,
        bu = matrix.bu,
        chroma_zero = CHROMA_ZERO,
    )
}

/// Every object of one built pipeline
#[derive(Debug)]
struct Pipeline {
    resolution: Resolution,
    plane_views: [PlatformHandle; 2],
    target: PlatformHandle,
    target_view: PlatformHandle,
    sampler: PlatformHandle,
    vertex_shader: PlatformHandle,
    pixel_shader: PlatformHandle,
    input_layout: PlatformHandle,
    vertex_buffer: PlatformHandle,
}

impl Pipeline {
    /// Release order mirrors creation order, reversed
    fn handles(&self) -> [PlatformHandle; 9] {
        [
            self.vertex_buffer,
            self.input_layout,
            self.pixel_shader,
            self.vertex_shader,
            self.sampler,
            self.target_view,
            self.target,
            self.plane_views[1],
            self.plane_views[0],
        ]
    }
}

/// NV12 -> BGRA converter driven through a shader pass
#[derive(Debug)]
pub struct ShaderConverter {
    color: ColorSpace,
    matrix: YuvMatrix,
    pipeline: Option<Pipeline>,
}

impl ShaderConverter {
    pub fn new(color: ColorSpace) -> Self {
        Self {
            color,
            matrix: YuvMatrix::for_color_space(color),
            pipeline: None,
        }
    }

    pub fn color_space(&self) -> ColorSpace {
        self.color
    }

    pub fn is_built(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Resolution the current pipeline was built for
    pub fn resolution(&self) -> Option<Resolution> {
        self.pipeline.as_ref().map(|p| p.resolution)
    }

    /// BGRA render target of the current pipeline
    pub fn target(&self) -> Option<PlatformHandle> {
        self.pipeline.as_ref().map(|p| p.target)
    }

    /// Build views, target, sampler, shaders and vertex buffer for `planes`
    ///
    /// Any previously built pipeline is released first. On failure every
    /// object created by this call is released before the error is returned.
    pub fn build(
        &mut self,
        device: &mut dyn GpuDevice,
        planes: [PlatformHandle; 2],
        resolution: Resolution,
    ) -> Result<()> {
        self.release(device);

        let mut created = Vec::with_capacity(9);
        match self.create_pipeline(device, planes, resolution, &mut created) {
            Ok(pipeline) => {
                tracing::debug!("Shader pipeline built at {} ({})", resolution, self.color);
                self.pipeline = Some(pipeline);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Shader pipeline build failed: {}", e);
                for handle in created.into_iter().rev() {
                    device.release(handle);
                }
                Err(e)
            }
        }
    }

    fn create_pipeline(
        &self,
        device: &mut dyn GpuDevice,
        planes: [PlatformHandle; 2],
        resolution: Resolution,
        created: &mut Vec<PlatformHandle>,
    ) -> Result<Pipeline> {
        let mut track = |r: Result<PlatformHandle>| -> Result<PlatformHandle> {
            let handle = r?;
            created.push(handle);
            Ok(handle)
        };

        let luma_view = track(device.create_view(planes[0], ViewKind::ShaderResource(PixelFormat::R8)))?;
        let chroma_view =
            track(device.create_view(planes[1], ViewKind::ShaderResource(PixelFormat::R8G8)))?;

        let target = track(device.create_texture(&TextureDesc::new(
            resolution.width,
            resolution.height,
            PixelFormat::Bgra8,
            TextureUsage::RenderTarget,
        )))?;
        let target_view = track(device.create_view(target, ViewKind::RenderTarget))?;
        let sampler = track(device.create_sampler())?;

        let vertex_shader = track(device.compile_vertex_shader(VERTEX_SHADER, VERTEX_ENTRY))?;
        let pixel_shader = track(device.compile_pixel_shader(&PixelProgram {
            source: pixel_shader_source(&self.matrix),
            entry_point: PIXEL_ENTRY,
            matrix: self.matrix,
        }))?;
        let input_layout = track(device.create_input_layout(vertex_shader))?;
        let vertex_buffer = track(device.create_vertex_buffer(&FULLSCREEN_QUAD))?;

        Ok(Pipeline {
            resolution,
            plane_views: [luma_view, chroma_view],
            target,
            target_view,
            sampler,
            vertex_shader,
            pixel_shader,
            input_layout,
            vertex_buffer,
        })
    }

    /// Draw the quad and wait for the GPU, returning the BGRA target
    pub fn convert(&mut self, device: &mut dyn GpuDevice) -> Result<PlatformHandle> {
        let pipeline = self.pipeline.as_ref().ok_or_else(|| {
            Error::ColorspaceConversion("shader pipeline used before it was built".into())
        })?;

        device.draw(&DrawCall {
            vertex_shader: pipeline.vertex_shader,
            pixel_shader: pipeline.pixel_shader,
            input_layout: pipeline.input_layout,
            sampler: pipeline.sampler,
            vertex_buffer: pipeline.vertex_buffer,
            vertex_count: FULLSCREEN_QUAD.len() as u32,
            shader_resources: pipeline.plane_views,
            render_target: pipeline.target_view,
            viewport: pipeline.resolution,
        })?;
        device.flush_and_wait()?;
        Ok(pipeline.target)
    }

    /// Drop every pipeline object; the plane textures stay with their owner
    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        if let Some(pipeline) = self.pipeline.take() {
            for handle in pipeline.handles() {
                device.release(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{FaultPlan, ReferenceDevice, TextureStore};
    use crate::types::Luid;

    fn planes(device: &mut ReferenceDevice, res: Resolution, y: u8, u: u8, v: u8) -> [PlatformHandle; 2] {
        let luma = device
            .create_texture(&TextureDesc::new(res.width, res.height, PixelFormat::R8, TextureUsage::ShaderResource))
            .unwrap();
        let chroma = device
            .create_texture(&TextureDesc::new(
                res.width / 2,
                res.height / 2,
                PixelFormat::R8G8,
                TextureUsage::ShaderResource,
            ))
            .unwrap();
        device.store().fill(luma, &[y]).unwrap();
        device.store().fill(chroma, &[u, v]).unwrap();
        [luma, chroma]
    }

    #[test]
    fn test_pixel_shader_embeds_matrix() {
        let source = pixel_shader_source(&YuvMatrix::for_color_space(ColorSpace::BT709_STUDIO));
        assert!(source.contains("1.7927"));
        assert!(source.contains("0.0625"));
        assert!(source.contains("saturate"));
    }

    #[test]
    fn test_convert_renders_white() {
        let store = TextureStore::new();
        let mut device = ReferenceDevice::new(store.clone(), Luid(1), FaultPlan::default());
        let res = Resolution::new(16, 8);
        let planes = planes(&mut device, res, 235, 128, 128);

        let mut converter = ShaderConverter::new(ColorSpace::BT601_STUDIO);
        converter.build(&mut device, planes, res).unwrap();
        let target = converter.convert(&mut device).unwrap();

        let pixels = store.read(target).unwrap();
        assert_eq!(pixels.len(), 16 * 8 * 4);
        assert!(pixels.chunks_exact(4).all(|p| p == [255, 255, 255, 255]));
    }

    #[test]
    fn test_build_failure_rolls_back() {
        let store = TextureStore::new();
        let faults = FaultPlan {
            fail_pixel_shader: true,
            ..Default::default()
        };
        let mut device = ReferenceDevice::new(store.clone(), Luid(1), faults);
        let res = Resolution::new(8, 8);
        let planes = planes(&mut device, res, 16, 128, 128);
        let before = store.live_objects();

        let mut converter = ShaderConverter::new(ColorSpace::default());
        assert!(converter.build(&mut device, planes, res).is_err());
        assert!(!converter.is_built());
        assert_eq!(store.live_objects(), before);
    }

    #[test]
    fn test_release_frees_pipeline_only() {
        let store = TextureStore::new();
        let mut device = ReferenceDevice::new(store.clone(), Luid(1), FaultPlan::default());
        let res = Resolution::new(8, 8);
        let planes = planes(&mut device, res, 16, 128, 128);
        let before = store.live_objects();

        let mut converter = ShaderConverter::new(ColorSpace::default());
        converter.build(&mut device, planes, res).unwrap();
        assert_eq!(store.live_objects(), before + 9);
        converter.release(&mut device);
        assert_eq!(store.live_objects(), before);
        assert!(converter.convert(&mut device).is_err());
    }
}
