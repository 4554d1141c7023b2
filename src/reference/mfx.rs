//! Reference oneVPL-style decode engine

use super::store::TextureStore;
use super::stream::StreamPacket;
use super::FaultPlan;
use crate::driver::DriverHandle;
use crate::error::{Error, Result};
use crate::gpu::{PixelFormat, TextureDesc, TextureUsage};
use crate::session::{
    Bitstream, DecodeAsync, DecodeStatus, MfxEngine, MfxSurface, StreamInfo, SyncStatus, SyncToken,
};
use crate::types::{Codec, PlatformHandle};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

/// Surfaces requested per stream: current output, one held reference and headroom
const SUGGESTED_SURFACES: usize = 4;

/// Media session decoding into a pool of NV12 surfaces
pub struct ReferenceMfx {
    store: TextureStore,
    _driver: DriverHandle,
    faults: FaultPlan,
    codec: Codec,
    session: Option<PlatformHandle>,
    surfaces: Vec<MfxSurface>,
    initialized: Option<StreamInfo>,
    /// Surfaces decoded but held back, oldest first
    held: VecDeque<usize>,
    pending_syncs: HashSet<u64>,
    next_sync: u64,
}

impl ReferenceMfx {
    pub fn new(store: TextureStore, driver: DriverHandle, faults: FaultPlan, codec: Codec) -> Self {
        let session = store.insert_object("media session");
        Self {
            store,
            _driver: driver,
            faults,
            codec,
            session: Some(session),
            surfaces: Vec::new(),
            initialized: None,
            held: VecDeque::new(),
            pending_syncs: HashSet::new(),
            next_sync: 1,
        }
    }

    fn parse(&self, bitstream: &Bitstream<'_>) -> Result<(StreamPacket, usize)> {
        let (packet, len) = StreamPacket::parse(bitstream.remaining())?;
        if packet.codec != self.codec {
            return Err(Error::Submit(format!(
                "{} packet fed to a {} session",
                packet.codec, self.codec
            )));
        }
        Ok((packet, len))
    }

    fn status(status: DecodeStatus) -> DecodeAsync {
        DecodeAsync {
            status,
            sync: None,
            output: None,
        }
    }
}

impl MfxEngine for ReferenceMfx {
    fn decode_header(&mut self, bitstream: &Bitstream<'_>) -> Result<StreamInfo> {
        let (packet, _) = self.parse(bitstream)?;
        Ok(StreamInfo {
            coded: packet.coded,
            crop: packet.display_size(),
            surfaces: SUGGESTED_SURFACES,
        })
    }

    fn alloc_frames(&mut self, info: &StreamInfo) -> Result<()> {
        if !self.surfaces.is_empty() {
            return Err(Error::Internal("surface pool already allocated".into()));
        }
        let desc = TextureDesc::new(
            info.coded.width,
            info.coded.height,
            PixelFormat::Nv12,
            TextureUsage::Decoder,
        );
        self.surfaces = (0..info.surfaces)
            .map(|_| MfxSurface {
                texture: self.store.create_texture(&desc),
                crop: info.crop,
                locked: self.faults.lock_all_surfaces,
            })
            .collect();
        tracing::trace!("Allocated {} decode surfaces at {}", info.surfaces, info.coded);
        Ok(())
    }

    fn free_frames(&mut self) {
        for surface in self.surfaces.drain(..) {
            self.store.remove(surface.texture);
        }
        self.held.clear();
    }

    fn init(&mut self, info: &StreamInfo) -> Result<()> {
        if self.session.is_none() {
            return Err(Error::BackendInit("media session closed".into()));
        }
        if self.initialized.is_some() {
            return Err(Error::BackendInit("decoder already initialised".into()));
        }
        if self.surfaces.len() < info.surfaces {
            return Err(Error::BackendInit(format!(
                "{} surfaces allocated, {} required",
                self.surfaces.len(),
                info.surfaces
            )));
        }
        self.initialized = Some(*info);
        Ok(())
    }

    fn close(&mut self) {
        self.initialized = None;
        for index in self.held.drain(..) {
            if let Some(surface) = self.surfaces.get_mut(index) {
                surface.locked = false;
            }
        }
        self.pending_syncs.clear();
    }

    fn surfaces(&self) -> &[MfxSurface] {
        &self.surfaces
    }

    fn decode_frame_async(&mut self, bitstream: &mut Bitstream<'_>, work_surface: usize) -> Result<DecodeAsync> {
        if self.faults.mfx_device_busy {
            return Ok(Self::status(DecodeStatus::DeviceBusy));
        }
        let info = self
            .initialized
            .ok_or_else(|| Error::Submit("decoder not initialised".into()))?;
        if bitstream.is_empty() {
            return Ok(Self::status(DecodeStatus::MoreData));
        }

        let (packet, len) = self.parse(bitstream)?;
        if self.faults.mfx_always_incompatible || packet.coded != info.coded {
            return Ok(Self::status(DecodeStatus::IncompatibleParams));
        }

        let surface = self
            .surfaces
            .get_mut(work_surface)
            .ok_or_else(|| Error::Submit(format!("work surface {} out of range", work_surface)))?;
        if surface.locked {
            return Ok(Self::status(DecodeStatus::MoreSurface));
        }
        surface.crop = packet.display_size();
        surface.locked = true;
        let texture = surface.texture;
        let [y, u, v] = packet.yuv;
        self.store.fill_nv12(texture, y, u, v)?;
        bitstream.consume(len);

        self.held.push_back(work_surface);
        if packet.hold {
            return Ok(Self::status(DecodeStatus::MoreData));
        }

        // Frames leave in decode order, one per call
        let output = match self.held.pop_front() {
            Some(index) => index,
            None => work_surface,
        };
        if let Some(surface) = self.surfaces.get_mut(output) {
            surface.locked = false;
        }

        let token = self.next_sync;
        self.next_sync += 1;
        self.pending_syncs.insert(token);
        let status = if self.faults.mfx_warn_with_output {
            DecodeStatus::Warning(1)
        } else {
            DecodeStatus::Done
        };
        Ok(DecodeAsync {
            status,
            sync: Some(SyncToken(token)),
            output: Some(output),
        })
    }

    fn sync_operation(&mut self, token: SyncToken, timeout: Duration) -> Result<SyncStatus> {
        if !self.pending_syncs.remove(&token.0) {
            return Err(Error::Output(format!("unknown sync point {}", token.0)));
        }
        if self.faults.sync_never_completes {
            tracing::trace!("Sync point {} still pending after {:?}", token.0, timeout);
            return Ok(SyncStatus::TimedOut);
        }
        Ok(SyncStatus::Ready)
    }

    fn shutdown(&mut self) {
        self.close();
        self.free_frames();
        if let Some(session) = self.session.take() {
            self.store.remove(session);
        }
    }
}

impl Drop for ReferenceMfx {
    fn drop(&mut self) {
        self.shutdown();
    }
}
