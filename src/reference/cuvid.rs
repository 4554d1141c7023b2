//! Reference CUDA/NVDEC-style decode engine

use super::store::TextureStore;
use super::stream::StreamPacket;
use super::FaultPlan;
use crate::driver::DriverHandle;
use crate::error::{Error, Result};
use crate::interop::{DeviceFrame, InteropApi, PlaneCopy, RegisteredResource};
use crate::session::{CuvidEngine, DecodeFlags};
use crate::types::{Codec, PlatformHandle, Resolution, VideoFormatSnapshot};
use std::collections::{HashSet, VecDeque};

/// Row alignment of decoded frames in engine memory
const PITCH_ALIGN: u32 = 64;

#[derive(Debug)]
struct Decoder {
    object: PlatformHandle,
    codec: Codec,
    /// Fixed by the first sequence header the decoder sees
    max: Option<Resolution>,
}

/// One decoded NV12 frame in engine memory
#[derive(Debug, Clone)]
struct HostFrame {
    size: Resolution,
    pitch: u32,
    data: Vec<u8>,
}

impl HostFrame {
    fn from_packet(packet: &StreamPacket) -> Self {
        let size = packet.display_size();
        let pitch = (size.width + PITCH_ALIGN - 1) / PITCH_ALIGN * PITCH_ALIGN;
        let [y, u, v] = packet.yuv;
        let (w, p, h) = (size.width as usize, pitch as usize, size.height as usize);

        // Row padding is left dirty so a copy that ignores the pitch shows up
        let mut data = vec![0xEE; p * h + p * h / 2];
        for row in 0..h {
            data[row * p..row * p + w].fill(y);
        }
        for row in 0..h / 2 {
            let start = p * h + row * p;
            for pair in data[start..start + w].chunks_exact_mut(2) {
                pair[0] = u;
                pair[1] = v;
            }
        }
        Self { size, pitch, data }
    }
}

/// Decode context plus at most one decoder, with frames kept in host memory
pub struct ReferenceCuvid {
    store: TextureStore,
    _driver: DriverHandle,
    faults: FaultPlan,
    context: Option<PlatformHandle>,
    depth: u32,
    decoder: Option<Decoder>,
    decoders_created: u32,
    latest: VideoFormatSnapshot,
    frame_size: Resolution,
    held: Vec<HostFrame>,
    ready: VecDeque<HostFrame>,
    mapped_frame: Option<(PlatformHandle, HostFrame)>,
    registered: HashSet<RegisteredResource>,
    mapped: HashSet<RegisteredResource>,
}

impl ReferenceCuvid {
    pub fn new(store: TextureStore, driver: DriverHandle, faults: FaultPlan) -> Self {
        let context = store.insert_object("decode context");
        Self {
            store,
            _driver: driver,
            faults,
            context: Some(context),
            depth: 0,
            decoder: None,
            decoders_created: 0,
            latest: VideoFormatSnapshot::default(),
            frame_size: Resolution::new(0, 0),
            held: Vec::new(),
            ready: VecDeque::new(),
            mapped_frame: None,
            registered: HashSet::new(),
            mapped: HashSet::new(),
        }
    }

    fn require_current(&self, what: &str) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::Interop(format!("{} without a current context", what)));
        }
        Ok(())
    }
}

impl InteropApi for ReferenceCuvid {
    fn push_context(&mut self) -> Result<()> {
        if self.context.is_none() {
            return Err(Error::Interop("decode context destroyed".into()));
        }
        self.depth += 1;
        Ok(())
    }

    fn pop_context(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn register_texture(&mut self, texture: PlatformHandle) -> Result<RegisteredResource> {
        self.require_current("register")?;
        if self.faults.fail_register {
            return Err(Error::Interop("graphics resource registration refused".into()));
        }
        self.store.describe(texture)?;
        let resource = RegisteredResource(texture);
        if !self.registered.insert(resource) {
            return Err(Error::Interop(format!("{} registered twice", texture)));
        }
        Ok(resource)
    }

    fn unregister(&mut self, resource: RegisteredResource) {
        if self.mapped.remove(&resource) {
            tracing::warn!("Unregistering mapped resource {}", resource.0);
        }
        self.registered.remove(&resource);
    }

    fn map(&mut self, resource: RegisteredResource) -> Result<PlatformHandle> {
        if !self.registered.contains(&resource) {
            return Err(Error::Interop(format!("{} is not registered", resource.0)));
        }
        if !self.mapped.insert(resource) {
            return Err(Error::Interop(format!("{} is already mapped", resource.0)));
        }
        Ok(resource.0)
    }

    fn unmap(&mut self, resource: RegisteredResource) {
        self.mapped.remove(&resource);
    }

    fn copy_2d(&mut self, copy: &PlaneCopy) -> Result<()> {
        self.require_current("copy")?;
        if !self.mapped.contains(&RegisteredResource(copy.dst)) {
            return Err(Error::Interop(format!("copy into unmapped array {}", copy.dst)));
        }
        let frame = match &self.mapped_frame {
            Some((base, frame)) if *base == copy.src => frame,
            _ => return Err(Error::Interop(format!("{} is not a mapped frame", copy.src))),
        };

        let (width, height, pitch) = (copy.width_bytes as usize, copy.height as usize, copy.src_pitch as usize);
        let end = copy.src_offset + pitch * height.saturating_sub(1) + width;
        if end > frame.data.len() {
            return Err(Error::Interop(format!(
                "copy reads {} bytes past a {} byte frame",
                end - frame.data.len(),
                frame.data.len()
            )));
        }

        self.store.update(copy.dst, |desc, data| {
            let row_bytes = desc.format.byte_size(desc.width, 1);
            if width > row_bytes || height > desc.height as usize {
                return Err(Error::Interop(format!(
                    "{}x{} byte copy does not fit a {}x{} array",
                    width, height, row_bytes, desc.height
                )));
            }
            for row in 0..height {
                let src = copy.src_offset + row * pitch;
                data[row * row_bytes..row * row_bytes + width]
                    .copy_from_slice(&frame.data[src..src + width]);
            }
            Ok(())
        })
    }
}

impl CuvidEngine for ReferenceCuvid {
    fn create_decoder(&mut self, codec: Codec) -> Result<()> {
        if self.context.is_none() {
            return Err(Error::BackendInit("decode context destroyed".into()));
        }
        if codec == Codec::Av1 {
            return Err(Error::CodecNotSupported("AV1 decode".into()));
        }
        if self.faults.fail_decoder_recreate && self.decoders_created > 0 {
            return Err(Error::BackendInit("decoder creation refused".into()));
        }
        if self.decoder.is_some() {
            return Err(Error::BackendInit("decoder already exists".into()));
        }
        let object = self.store.insert_object("video decoder");
        self.decoder = Some(Decoder {
            object,
            codec,
            max: None,
        });
        self.decoders_created += 1;
        Ok(())
    }

    fn destroy_decoder(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            self.store.remove(decoder.object);
        }
        self.held.clear();
        self.ready.clear();
        self.mapped_frame = None;
    }

    fn decode(&mut self, data: &[u8], flags: DecodeFlags) -> Result<usize> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::Submit("no decoder".into()))?;
        let (packet, _) = StreamPacket::parse(data)?;
        if packet.codec != decoder.codec {
            return Err(Error::Submit(format!(
                "{} packet fed to a {} decoder",
                packet.codec, decoder.codec
            )));
        }

        let max = *decoder.max.get_or_insert(packet.coded);
        self.latest = VideoFormatSnapshot {
            display_area: packet.display,
            coded_width: packet.coded.width,
            coded_height: packet.coded.height,
            max_width: max.width,
            max_height: max.height,
        };
        if self.latest.exceeds_max() {
            return Err(Error::Submit(format!(
                "coded size {} exceeds decoder maximum {}",
                packet.coded, max
            )));
        }

        self.ready.clear();
        let frame = HostFrame::from_packet(&packet);
        if packet.hold && !flags.end_of_picture {
            self.held.push(frame);
            return Ok(0);
        }
        self.frame_size = frame.size;
        self.ready.extend(self.held.drain(..));
        self.ready.push_back(frame);
        Ok(self.ready.len())
    }

    fn latest_format(&self) -> VideoFormatSnapshot {
        self.latest
    }

    fn frame_size(&self) -> Resolution {
        self.frame_size
    }

    fn next_frame(&mut self) -> Option<DeviceFrame> {
        let frame = self.ready.pop_front()?;
        let base = self.store.reserve_handle();
        let pitch = frame.pitch;
        self.mapped_frame = Some((base, frame));
        Some(DeviceFrame { base, pitch })
    }

    fn destroy_context(&mut self) {
        self.destroy_decoder();
        if !self.registered.is_empty() {
            tracing::warn!("{} resources still registered at context teardown", self.registered.len());
            self.registered.clear();
            self.mapped.clear();
        }
        if let Some(context) = self.context.take() {
            self.store.remove(context);
        }
    }
}

impl Drop for ReferenceCuvid {
    fn drop(&mut self) {
        self.destroy_context();
    }
}
