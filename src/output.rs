//! Output bridge
//!
//! Encoded bytes are staged in a grow-only [`PacketBuffer`]; decoded frames
//! are written into an [`OutputRing`] of BGRA textures and handed out either
//! as the texture itself or as a shared handle to it.

use crate::error::{Error, Result};
use crate::gpu::{GpuDevice, PixelFormat, TextureDesc, TextureUsage};
use crate::types::{OutputHandle, OutputMode, PlatformHandle, Resolution};

/// Reusable packet staging buffer whose capacity only ever grows
///
/// Capacity is always zero or a power of two: the smallest one that fits the
/// largest packet stored so far.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    buf: Box<[u8]>,
    len: usize,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `bytes` in, growing first if needed, and return the stored slice
    pub fn store(&mut self, bytes: &[u8]) -> &[u8] {
        if bytes.len() > self.buf.len() {
            let capacity = bytes.len().next_power_of_two();
            tracing::trace!("Packet buffer grown {} -> {} bytes", self.buf.len(), capacity);
            self.buf = vec![0u8; capacity].into_boxed_slice();
        }
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        &self.buf[..self.len]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Ring of BGRA textures decoded frames are delivered from
///
/// The set is recreated wholesale when the frame size changes. Textures are
/// created shareable when the session delivers shared handles.
#[derive(Debug)]
pub struct OutputRing {
    mode: OutputMode,
    size: usize,
    textures: Vec<PlatformHandle>,
    resolution: Option<Resolution>,
    index: usize,
}

impl OutputRing {
    pub fn new(mode: OutputMode, size: usize) -> Self {
        Self {
            mode,
            size: size.max(1),
            textures: Vec::new(),
            resolution: None,
            index: 0,
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    fn usage(&self) -> TextureUsage {
        match self.mode {
            OutputMode::Texture => TextureUsage::RenderTarget,
            OutputMode::SharedHandle => TextureUsage::SharedRenderTarget,
        }
    }

    /// Make sure the ring holds textures of `resolution`
    pub fn ensure(&mut self, device: &mut dyn GpuDevice, resolution: Resolution) -> Result<()> {
        if self.resolution == Some(resolution) && !self.textures.is_empty() {
            return Ok(());
        }
        self.release(device);

        let desc = TextureDesc::new(
            resolution.width,
            resolution.height,
            PixelFormat::Bgra8,
            self.usage(),
        );
        let mut textures = Vec::with_capacity(self.size);
        for _ in 0..self.size {
            match device.create_texture(&desc) {
                Ok(t) => textures.push(t),
                Err(e) => {
                    textures.into_iter().for_each(|t| device.release(t));
                    return Err(Error::Output(format!(
                        "output texture creation failed at {}: {}",
                        resolution, e
                    )));
                }
            }
        }
        tracing::debug!("Output ring of {} textures at {}", self.size, resolution);
        self.textures = textures;
        self.resolution = Some(resolution);
        self.index = 0;
        Ok(())
    }

    /// Move to the next slot and return it
    pub fn advance(&mut self) -> Result<PlatformHandle> {
        if self.textures.is_empty() {
            return Err(Error::Output("output ring is empty".into()));
        }
        self.index = (self.index + 1) % self.textures.len();
        Ok(self.textures[self.index])
    }

    pub fn current(&self) -> Option<PlatformHandle> {
        self.textures.get(self.index).copied()
    }

    /// Hand the current slot out in the session's output mode
    pub fn deliver(&self, device: &mut dyn GpuDevice) -> Result<OutputHandle> {
        let texture = self
            .current()
            .ok_or_else(|| Error::Output("no decoded frame to deliver".into()))?;
        match self.mode {
            OutputMode::Texture => Ok(OutputHandle::Texture(texture)),
            OutputMode::SharedHandle => device
                .shared_handle(texture)
                .map(OutputHandle::Shared)
                .map_err(|e| Error::Output(format!("shared handle: {}", e))),
        }
    }

    pub fn release(&mut self, device: &mut dyn GpuDevice) {
        for t in self.textures.drain(..) {
            device.release(t);
        }
        self.resolution = None;
        self.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{FaultPlan, ReferenceDevice, TextureStore};
    use crate::types::Luid;

    #[test]
    fn test_packet_buffer_grows_to_power_of_two() {
        let mut buf = PacketBuffer::new();
        assert_eq!(buf.capacity(), 0);

        let mut largest = 0;
        for size in [100usize, 3000, 64, 4096, 4097, 10] {
            let data = vec![0xAB; size];
            assert_eq!(buf.store(&data), &data[..]);
            largest = largest.max(size);
            assert_eq!(buf.capacity(), largest.next_power_of_two());
        }
        assert_eq!(buf.capacity(), 8192);
        assert_eq!(buf.len(), 10);
    }

    #[test]
    fn test_ring_cycles_and_recreates_on_resize() {
        let store = TextureStore::new();
        let mut device = ReferenceDevice::new(store.clone(), Luid(1), FaultPlan::default());
        let mut ring = OutputRing::new(OutputMode::Texture, 4);

        ring.ensure(&mut device, Resolution::HD_720P).unwrap();
        assert_eq!(store.live_objects(), 4);
        let first = ring.current().unwrap();
        let seen: Vec<_> = (0..4).map(|_| ring.advance().unwrap()).collect();
        assert_eq!(seen[3], first);

        ring.ensure(&mut device, Resolution::HD_720P).unwrap();
        assert_eq!(store.live_objects(), 4);

        ring.ensure(&mut device, Resolution::FHD_1080P).unwrap();
        assert_eq!(store.live_objects(), 4);
        let t = ring.current().unwrap();
        assert_eq!(device.describe(t).unwrap().resolution(), Resolution::FHD_1080P);

        ring.release(&mut device);
        assert_eq!(store.live_objects(), 0);
    }

    #[test]
    fn test_shared_mode_delivers_shared_handle() {
        let store = TextureStore::new();
        let mut device = ReferenceDevice::new(store, Luid(1), FaultPlan::default());
        let mut ring = OutputRing::new(OutputMode::SharedHandle, 4);
        assert!(ring.deliver(&mut device).is_err());

        ring.ensure(&mut device, Resolution::new(64, 64)).unwrap();
        let out = ring.deliver(&mut device).unwrap();
        assert!(matches!(out, OutputHandle::Shared(_)));
        assert_ne!(out.handle(), ring.current().unwrap());
    }

    #[test]
    fn test_shared_handle_failure_is_output_error() {
        let store = TextureStore::new();
        let faults = FaultPlan {
            fail_shared_handle: true,
            ..Default::default()
        };
        let mut device = ReferenceDevice::new(store, Luid(1), faults);
        let mut ring = OutputRing::new(OutputMode::SharedHandle, 2);
        ring.ensure(&mut device, Resolution::new(64, 64)).unwrap();
        assert!(matches!(ring.deliver(&mut device), Err(Error::Output(_))));
    }
}
