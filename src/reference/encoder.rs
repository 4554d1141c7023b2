//! Reference encoder component

use super::store::TextureStore;
use super::FaultPlan;
use crate::config::QpRange;
use crate::driver::DriverHandle;
use crate::error::{Error, Result};
use crate::gpu::PixelFormat;
use crate::session::{EncodeEngine, EncodedFrame, EncoderParams, FrameType};
use crate::types::{Codec, PlatformHandle};
use std::collections::VecDeque;

/// Annex-B start code
const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL header bytes of a key / non-key slice
fn nal_header(codec: Codec, frame_type: FrameType) -> &'static [u8] {
    match (codec, frame_type.is_keyframe()) {
        (Codec::Hevc, true) => &[0x26, 0x01],
        (Codec::Hevc, false) => &[0x02, 0x01],
        (_, true) => &[0x65],
        (_, false) => &[0x41],
    }
}

/// Encoder that "compresses" a BGRA surface into a fingerprint of its contents
///
/// Packet sizes follow the configured bitrate, keyframes the GOP.
pub struct ReferenceEncoder {
    store: TextureStore,
    _driver: DriverHandle,
    faults: FaultPlan,
    codec: Codec,
    component: Option<PlatformHandle>,
    params: Option<EncoderParams>,
    queue: VecDeque<EncodedFrame>,
    frames: u64,
}

impl ReferenceEncoder {
    pub fn new(store: TextureStore, driver: DriverHandle, faults: FaultPlan, codec: Codec) -> Self {
        let component = store.insert_object("encoder component");
        Self {
            store,
            _driver: driver,
            faults,
            codec,
            component: Some(component),
            params: None,
            queue: VecDeque::new(),
            frames: 0,
        }
    }

    fn params_mut(&mut self) -> Result<&mut EncoderParams> {
        self.params
            .as_mut()
            .ok_or_else(|| Error::Internal("encoder used before init".into()))
    }

    fn packet_size(params: &EncoderParams, keyframe: bool) -> usize {
        let per_frame = params.bitrate_bps / 8 / params.framerate.max(1) as u64;
        let size = if keyframe { per_frame } else { per_frame / 4 };
        size.clamp(16, 1 << 20) as usize
    }
}

impl EncodeEngine for ReferenceEncoder {
    fn init(&mut self, params: &EncoderParams) -> Result<()> {
        if self.faults.fail_engine_init {
            return Err(Error::BackendInit("component rejected its parameters".into()));
        }
        if params.codec != self.codec {
            return Err(Error::BackendInit(format!(
                "component created for {}, initialised for {}",
                self.codec, params.codec
            )));
        }
        self.params = Some(*params);
        Ok(())
    }

    fn submit_input(&mut self, surface: PlatformHandle, pts: i64) -> Result<()> {
        let params = *self.params_mut()?;
        let desc = self.store.describe(surface)?;
        if desc.format != PixelFormat::Bgra8 || desc.resolution() != params.resolution {
            return Err(Error::Submit(format!(
                "surface {:?} {} does not match encoder input {}",
                desc.format,
                desc.resolution(),
                params.resolution
            )));
        }

        let pixels = self.store.read(surface)?;
        let fingerprint = pixels
            .iter()
            .fold(0x811c_9dc5u32, |h, b| (h ^ *b as u32).wrapping_mul(0x0100_0193));

        let frame_type = if self.frames % params.gop.max(1) as u64 == 0 {
            FrameType::Idr
        } else {
            FrameType::P
        };
        let mut data = Vec::with_capacity(Self::packet_size(&params, true));
        data.extend_from_slice(&START_CODE);
        data.extend_from_slice(nal_header(self.codec, frame_type));
        data.extend_from_slice(&fingerprint.to_le_bytes());
        data.extend_from_slice(&pts.to_le_bytes());
        let size = Self::packet_size(&params, frame_type.is_keyframe()).max(data.len());
        data.resize(size, 0xA5);

        self.queue.push_back(EncodedFrame {
            data,
            frame_type,
            pts,
        });
        self.frames += 1;
        Ok(())
    }

    fn query_output(&mut self) -> Result<Option<EncodedFrame>> {
        if self.faults.encoder_output_error {
            return Err(Error::Output("encoder lost its output queue".into()));
        }
        if self.faults.encoder_never_ready {
            return Ok(None);
        }
        Ok(self.queue.pop_front())
    }

    fn set_bitrate(&mut self, bps: u64) -> Result<()> {
        self.params_mut()?.bitrate_bps = bps;
        Ok(())
    }

    fn set_framerate(&mut self, fps: u32) -> Result<()> {
        self.params_mut()?.framerate = fps;
        Ok(())
    }

    fn set_qp(&mut self, qp: QpRange) -> Result<()> {
        self.params_mut()?.qp = qp;
        Ok(())
    }

    fn terminate(&mut self) {
        if let Some(component) = self.component.take() {
            self.store.remove(component);
        }
        self.params = None;
        self.queue.clear();
    }
}

impl Drop for ReferenceEncoder {
    fn drop(&mut self) {
        self.terminate();
    }
}
