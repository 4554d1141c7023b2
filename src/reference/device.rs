//! CPU-backed [`GpuDevice`]

use super::store::TextureStore;
use super::FaultPlan;
use crate::convert::{nv12_to_bgra, ColorSpace, DxgiColorSpace, YuvMatrix};
use crate::error::{Error, Result};
use crate::gpu::{
    DrawCall, GpuDevice, PixelFormat, PixelProgram, ProcessJob, QuadVertex, TextureDesc,
    TextureUsage, ViewKind,
};
use crate::types::{Luid, PlatformHandle};

/// Device whose objects live in a [`TextureStore`] and whose passes run on the CPU
///
/// Opening a device creates no store objects; everything it creates is
/// released through [`GpuDevice::release`].
#[derive(Debug)]
pub struct ReferenceDevice {
    store: TextureStore,
    luid: Luid,
    raw: PlatformHandle,
    faults: FaultPlan,
}

impl ReferenceDevice {
    pub fn new(store: TextureStore, luid: Luid, faults: FaultPlan) -> Self {
        let raw = store.reserve_handle();
        Self {
            store,
            luid,
            raw,
            faults,
        }
    }

    pub fn store(&self) -> &TextureStore {
        &self.store
    }

    fn texture_of_view(&self, view: PlatformHandle) -> Result<(PlatformHandle, TextureDesc)> {
        let (texture, _) = self.store.view_target(view)?;
        Ok((texture, self.store.describe(texture)?))
    }
}

impl GpuDevice for ReferenceDevice {
    fn luid(&self) -> Luid {
        self.luid
    }

    fn raw(&self) -> PlatformHandle {
        self.raw
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<PlatformHandle> {
        if self.faults.fail_textures {
            return Err(Error::Internal("out of video memory".into()));
        }
        if desc.width == 0 || desc.height == 0 {
            return Err(Error::Internal(format!(
                "cannot create a {}x{} texture",
                desc.width, desc.height
            )));
        }
        Ok(self.store.create_texture(desc))
    }

    fn describe(&self, texture: PlatformHandle) -> Result<TextureDesc> {
        self.store.describe(texture)
    }

    fn copy_texture(&mut self, dst: PlatformHandle, src: PlatformHandle) -> Result<()> {
        let (dst_desc, src_desc) = (self.store.describe(dst)?, self.store.describe(src)?);
        if dst_desc.resolution() != src_desc.resolution() || dst_desc.format != src_desc.format {
            return Err(Error::Internal(format!(
                "copy between mismatched textures: {:?} <- {:?}",
                dst_desc, src_desc
            )));
        }
        let data = self.store.read(src)?;
        self.store.write(dst, &data)
    }

    fn shared_handle(&mut self, texture: PlatformHandle) -> Result<PlatformHandle> {
        if self.faults.fail_shared_handle {
            return Err(Error::Output("shared handle export refused".into()));
        }
        let desc = self.store.describe(texture)?;
        if desc.usage != TextureUsage::SharedRenderTarget {
            return Err(Error::Output(format!("{} was not created shareable", texture)));
        }
        self.store.share(texture)
    }

    fn create_view(&mut self, texture: PlatformHandle, kind: ViewKind) -> Result<PlatformHandle> {
        let desc = self.store.describe(texture)?;
        match kind {
            ViewKind::ShaderResource(format) if format != desc.format => {
                Err(Error::Internal(format!(
                    "{:?} view on a {:?} texture",
                    format, desc.format
                )))
            }
            ViewKind::RenderTarget if desc.format != PixelFormat::Bgra8 => Err(Error::Internal(
                format!("render target view on a {:?} texture", desc.format),
            )),
            _ => self.store.insert_view(texture, kind),
        }
    }

    fn create_sampler(&mut self) -> Result<PlatformHandle> {
        Ok(self.store.insert_object("sampler"))
    }

    fn compile_vertex_shader(&mut self, source: &str, entry_point: &str) -> Result<PlatformHandle> {
        if !source.contains(entry_point) {
            return Err(Error::Internal(format!(
                "vertex entry point {} not found",
                entry_point
            )));
        }
        Ok(self.store.insert_object("vertex shader"))
    }

    fn compile_pixel_shader(&mut self, program: &PixelProgram) -> Result<PlatformHandle> {
        if self.faults.fail_pixel_shader {
            return Err(Error::ColorspaceConversion("pixel shader compilation failed".into()));
        }
        if !program.source.contains(program.entry_point) {
            return Err(Error::Internal(format!(
                "pixel entry point {} not found",
                program.entry_point
            )));
        }
        Ok(self.store.insert_pixel_shader(program.matrix))
    }

    fn create_input_layout(&mut self, vertex_shader: PlatformHandle) -> Result<PlatformHandle> {
        if self.store.label(vertex_shader) != Some("vertex shader") {
            return Err(Error::Internal(format!("{} is not a vertex shader", vertex_shader)));
        }
        Ok(self.store.insert_object("input layout"))
    }

    fn create_vertex_buffer(&mut self, vertices: &[QuadVertex]) -> Result<PlatformHandle> {
        if vertices.is_empty() {
            return Err(Error::Internal("empty vertex buffer".into()));
        }
        Ok(self.store.insert_object("vertex buffer"))
    }

    fn draw(&mut self, call: &DrawCall) -> Result<()> {
        for object in [call.vertex_shader, call.input_layout, call.sampler, call.vertex_buffer] {
            if !self.store.contains(object) {
                return Err(Error::Internal(format!("draw binds released object {}", object)));
            }
        }
        if call.vertex_count < 3 {
            return Err(Error::Internal("draw without a triangle".into()));
        }

        let matrix: YuvMatrix = self.store.pixel_shader(call.pixel_shader)?;
        let (luma, luma_desc) = self.texture_of_view(call.shader_resources[0])?;
        let (chroma, _) = self.texture_of_view(call.shader_resources[1])?;
        let (target, target_desc) = self.texture_of_view(call.render_target)?;

        let viewport = call.viewport;
        if luma_desc.resolution() != viewport || target_desc.resolution() != viewport {
            return Err(Error::Internal(format!(
                "viewport {} does not match planes {} / target {}",
                viewport,
                luma_desc.resolution(),
                target_desc.resolution()
            )));
        }

        let pixels = nv12_to_bgra(
            &self.store.read(luma)?,
            &self.store.read(chroma)?,
            viewport.width,
            viewport.height,
            &matrix,
        )?;
        self.store.write(target, &pixels)
    }

    fn video_process(&mut self, job: &ProcessJob) -> Result<()> {
        if self.faults.fail_video_process {
            return Err(Error::Internal("video processor unavailable".into()));
        }
        if job.output_space != DxgiColorSpace::RgbFullG22NoneP709 {
            return Err(Error::Internal(format!(
                "unsupported output colour space {:?}",
                job.output_space
            )));
        }
        let color = ColorSpace::from_dxgi(job.input_space).ok_or_else(|| {
            Error::Internal(format!("{:?} is not a YCbCr space", job.input_space))
        })?;

        let input = self.store.describe(job.input)?;
        let output = self.store.describe(job.output)?;
        let crop = job.crop;
        if input.format != PixelFormat::Nv12 || output.format != PixelFormat::Bgra8 {
            return Err(Error::Internal(format!(
                "video processor needs NV12 -> BGRA, got {:?} -> {:?}",
                input.format, output.format
            )));
        }
        if crop.width > input.width || crop.height > input.height || output.resolution() != crop {
            return Err(Error::Internal(format!(
                "crop {} does not fit input {} / output {}",
                crop,
                input.resolution(),
                output.resolution()
            )));
        }

        // Cut the visible area out of both planes
        let data = self.store.read(job.input)?;
        let (stride, w, h) = (input.width as usize, crop.width as usize, crop.height as usize);
        let chroma_base = stride * input.height as usize;
        let mut luma = Vec::with_capacity(w * h);
        let mut chroma = Vec::with_capacity(w * h / 2);
        for row in 0..h {
            luma.extend_from_slice(&data[row * stride..row * stride + w]);
        }
        for row in 0..h / 2 {
            let start = chroma_base + row * stride;
            chroma.extend_from_slice(&data[start..start + w]);
        }

        let pixels = nv12_to_bgra(
            &luma,
            &chroma,
            crop.width,
            crop.height,
            &YuvMatrix::for_color_space(color),
        )?;
        self.store.write(job.output, &pixels)
    }

    fn flush_and_wait(&mut self) -> Result<()> {
        Ok(())
    }

    fn release(&mut self, object: PlatformHandle) {
        if !self.store.remove(object) {
            tracing::warn!("Release of unknown object {}", object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;

    #[test]
    fn test_copy_requires_matching_textures() {
        let store = TextureStore::new();
        let mut device = ReferenceDevice::new(store.clone(), Luid(1), FaultPlan::default());
        let a = device
            .create_texture(&TextureDesc::new(4, 4, PixelFormat::Bgra8, TextureUsage::ShaderResource))
            .unwrap();
        let b = device
            .create_texture(&TextureDesc::new(4, 4, PixelFormat::Bgra8, TextureUsage::RenderTarget))
            .unwrap();
        let c = device
            .create_texture(&TextureDesc::new(8, 4, PixelFormat::Bgra8, TextureUsage::RenderTarget))
            .unwrap();
        store.fill(a, &[9, 8, 7, 6]).unwrap();

        device.copy_texture(b, a).unwrap();
        assert_eq!(store.read(b).unwrap(), store.read(a).unwrap());
        assert!(device.copy_texture(c, a).is_err());
    }

    #[test]
    fn test_video_process_crops_coded_surface() {
        let store = TextureStore::new();
        let mut device = ReferenceDevice::new(store.clone(), Luid(1), FaultPlan::default());
        let input = device
            .create_texture(&TextureDesc::new(16, 16, PixelFormat::Nv12, TextureUsage::Decoder))
            .unwrap();
        let output = device
            .create_texture(&TextureDesc::new(16, 10, PixelFormat::Bgra8, TextureUsage::RenderTarget))
            .unwrap();
        store.fill_nv12(input, 235, 128, 128).unwrap();

        device
            .video_process(&ProcessJob {
                input,
                output,
                input_space: DxgiColorSpace::YcbcrStudioG22LeftP601,
                output_space: DxgiColorSpace::RgbFullG22NoneP709,
                crop: Resolution::new(16, 10),
                frame_rate: 60,
            })
            .unwrap();
        let pixels = store.read(output).unwrap();
        assert!(pixels.chunks_exact(4).all(|px| px == [255, 255, 255, 255]));
    }

    #[test]
    fn test_release_removes_object() {
        let store = TextureStore::new();
        let mut device = ReferenceDevice::new(store.clone(), Luid(1), FaultPlan::default());
        assert_eq!(store.live_objects(), 0);
        let sampler = device.create_sampler().unwrap();
        assert_eq!(store.live_objects(), 1);
        device.release(sampler);
        assert_eq!(store.live_objects(), 0);
    }
}
