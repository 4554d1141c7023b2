//! oneVPL/MFX-style decode session
//!
//! Decoding is asynchronous with an explicit sync point: every
//! `decode_frame_async` that produces a frame returns a token that is waited
//! on with a bounded timeout before the surface is read. Decoded surfaces are
//! converted to BGRA by the device's video processor.

use super::{check_codec, BackendSession, DeviceRequest, Reconfiguration, SessionInput, SessionKind, SessionOutput, SessionState};
use crate::config::DecoderConfig;
use crate::convert::VideoProcessorConverter;
use crate::driver::DriverHandle;
use crate::error::{Error, Result};
use crate::gpu::GpuDevice;
use crate::output::OutputRing;
use crate::platform::Platform;
use crate::types::{Luid, PlatformHandle, Resolution, Vendor};
use std::time::Duration;

/// Compressed input with a read cursor the engine advances
#[derive(Debug, Clone, Copy)]
pub struct Bitstream<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Bitstream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    pub fn consume(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }
}

/// Stream parameters parsed from a sequence header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    /// Allocated surface size
    pub coded: Resolution,
    /// Visible area
    pub crop: Resolution,
    /// Surfaces the decoder asks for
    pub surfaces: usize,
}

/// One decode surface of the engine's pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MfxSurface {
    pub texture: PlatformHandle,
    pub crop: Resolution,
    /// Held by the decoder as a reference or pending output
    pub locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncToken(pub u64);

/// Status of one `decode_frame_async` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// A frame is on its way, see the sync token
    Done,
    /// Input consumed without a frame; feed more data
    MoreData,
    /// Work surface is in use; retry with another
    MoreSurface,
    /// Hardware is busy; retry shortly
    DeviceBusy,
    /// Stream parameters no longer match the initialised decoder
    IncompatibleParams,
    /// Non-fatal warning code
    Warning(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeAsync {
    pub status: DecodeStatus,
    pub sync: Option<SyncToken>,
    /// Index of the output surface in the pool
    pub output: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Ready,
    TimedOut,
}

/// Media decode session entry points
pub trait MfxEngine: Send {
    fn decode_header(&mut self, bitstream: &Bitstream<'_>) -> Result<StreamInfo>;

    fn alloc_frames(&mut self, info: &StreamInfo) -> Result<()>;

    fn free_frames(&mut self);

    fn init(&mut self, info: &StreamInfo) -> Result<()>;

    fn close(&mut self);

    fn surfaces(&self) -> &[MfxSurface];

    fn decode_frame_async(&mut self, bitstream: &mut Bitstream<'_>, work_surface: usize) -> Result<DecodeAsync>;

    fn sync_operation(&mut self, token: SyncToken, timeout: Duration) -> Result<SyncStatus>;

    /// Tear down the media session itself
    fn shutdown(&mut self);
}

/// First surface the decoder does not hold
fn free_surface(surfaces: &[MfxSurface]) -> Option<usize> {
    surfaces.iter().position(|s| !s.locked)
}

/// oneVPL-style decode session
pub struct MfxSession<E: MfxEngine> {
    engine: Option<E>,
    device: Option<Box<dyn GpuDevice>>,
    driver: Option<DriverHandle>,
    config: DecoderConfig,
    luid: Luid,
    converter: VideoProcessorConverter,
    ring: OutputRing,
    stream: Option<StreamInfo>,
    needs_reinit: bool,
    reinits: u32,
    pending: Option<usize>,
    destroyed: bool,
}

impl<E: MfxEngine> MfxSession<E> {
    pub fn create<P>(platform: &P, request: DeviceRequest, config: &DecoderConfig) -> Result<Self>
    where
        P: Platform<Mfx = E>,
    {
        config.validate()?;
        check_codec(config.codec)?;

        let driver = platform.acquire_driver(Vendor::Intel)?;
        let device = platform.open_device(request.device, request.luid, request.api)?;
        let engine = platform.new_mfx_engine(&driver, device.as_ref(), config.codec)?;

        tracing::info!(
            "MFX decode session created: {} on {}, {:?} output, {}",
            config.codec,
            request.luid,
            config.output,
            config.color
        );

        Ok(Self {
            engine: Some(engine),
            device: Some(device),
            driver: Some(driver),
            config: config.clone(),
            luid: request.luid,
            converter: VideoProcessorConverter::new(config.color),
            ring: OutputRing::new(config.output, config.output_ring_size),
            stream: None,
            needs_reinit: false,
            reinits: 0,
            pending: None,
            destroyed: false,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// In-place reinitialisations, announced or after incompatible parameters
    pub fn reinits(&self) -> u32 {
        self.reinits
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.stream
    }

    /// A format change was announced and the next submit reinitialises
    pub fn reinit_pending(&self) -> bool {
        self.needs_reinit
    }

    /// Parse the header, (re)allocate the surface pool and init the decoder
    ///
    /// A failure leaves the engine closed with no surfaces, so the next
    /// submit starts from scratch.
    fn initialize_decode(&mut self, bitstream: &Bitstream<'_>, reinit: bool) -> Result<()> {
        let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
        self.stream = None;

        match Self::init_engine(engine, bitstream, reinit) {
            Ok(info) => {
                tracing::debug!(
                    "MFX decoder initialised: coded {}, crop {}, {} surfaces",
                    info.coded,
                    info.crop,
                    info.surfaces
                );
                self.stream = Some(info);
                Ok(())
            }
            Err(e) => {
                tracing::error!("MFX decoder initialisation failed: {}", e);
                engine.close();
                engine.free_frames();
                Err(e)
            }
        }
    }

    fn init_engine(engine: &mut E, bitstream: &Bitstream<'_>, reinit: bool) -> Result<StreamInfo> {
        let info = engine
            .decode_header(bitstream)
            .map_err(|e| Error::Submit(format!("decode header: {}", e)))?;
        if reinit {
            engine.free_frames();
        }
        engine.alloc_frames(&info)?;
        if reinit {
            engine.close();
        }
        engine
            .init(&info)
            .map_err(|e| Error::BackendInit(format!("decoder init: {}", e)))?;
        Ok(info)
    }

    fn submit_bitstream(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::Submit("empty packet".into()));
        }
        self.pending = None;

        if self.stream.is_none() || self.needs_reinit {
            let reinit = self.stream.is_some();
            self.needs_reinit = false;
            self.initialize_decode(&Bitstream::new(data), reinit)?;
            if reinit {
                self.reinits += 1;
            }
        }

        let max_iterations = self.config.max_decode_iterations;
        let sync_timeout = self.config.sync_timeout();
        let mut bitstream = Bitstream::new(data);
        let mut status = DecodeStatus::Done;
        let mut work = 0usize;
        let mut reinitialized = false;

        for _ in 0..max_iterations {
            if status == DecodeStatus::DeviceBusy {
                std::thread::sleep(Duration::from_millis(1));
            }

            let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
            if matches!(status, DecodeStatus::Done | DecodeStatus::MoreSurface) {
                work = free_surface(engine.surfaces())
                    .ok_or_else(|| Error::Submit("no free decode surface".into()))?;
            }

            let step = engine
                .decode_frame_async(&mut bitstream, work)
                .map_err(|e| Error::Submit(e.to_string()))?;
            status = step.status;

            if status == DecodeStatus::IncompatibleParams {
                if reinitialized {
                    return Err(Error::Submit(
                        "incompatible video parameters after reinitialisation".into(),
                    ));
                }
                tracing::info!("Incompatible video parameters, resetting decoder");
                bitstream = Bitstream::new(data);
                self.initialize_decode(&bitstream, true)?;
                self.reinits += 1;
                reinitialized = true;
                status = DecodeStatus::Done;
                continue;
            }

            // A warning that still carries a sync point is a delivered frame
            if matches!(status, DecodeStatus::Warning(_)) && step.sync.is_some() {
                status = DecodeStatus::Done;
            }

            match status {
                DecodeStatus::Done => {
                    let token = step
                        .sync
                        .ok_or_else(|| Error::Output("decoder returned no sync point".into()))?;
                    let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
                    if engine.sync_operation(token, sync_timeout)? == SyncStatus::TimedOut {
                        return Err(Error::Timeout(format!(
                            "sync point not reached within {} ms",
                            sync_timeout.as_millis()
                        )));
                    }
                    let output = step
                        .output
                        .ok_or_else(|| Error::Output("decoder returned no output surface".into()))?;
                    self.pending = Some(output);
                    return Ok(());
                }
                DecodeStatus::MoreData => {
                    tracing::trace!("Decoder needs more data, no frame ready");
                    return Ok(());
                }
                DecodeStatus::MoreSurface | DecodeStatus::DeviceBusy | DecodeStatus::Warning(_) => {}
                DecodeStatus::IncompatibleParams => {}
            }
        }

        Err(Error::Timeout(format!(
            "decode loop gave up after {} iterations",
            max_iterations
        )))
    }

    fn convert_surface(&mut self, index: usize) -> Result<SessionOutput<'static>> {
        let engine = self.engine.as_ref().ok_or(Error::Destroyed)?;
        let device = self.device.as_deref_mut().ok_or(Error::Destroyed)?;
        let surface = engine
            .surfaces()
            .get(index)
            .copied()
            .ok_or_else(|| Error::Output(format!("output surface {} out of range", index)))?;

        self.ring.ensure(device, surface.crop)?;
        let slot = self.ring.advance()?;
        self.converter.process(device, surface.texture, slot, surface.crop)?;
        Ok(SessionOutput::Frame(self.ring.deliver(device)?))
    }
}

impl<E: MfxEngine> BackendSession for MfxSession<E> {
    fn kind(&self) -> SessionKind {
        SessionKind::MfxDecode
    }

    fn state(&self) -> SessionState {
        if self.destroyed {
            SessionState::Destroyed
        } else if self.stream.is_some() {
            SessionState::Ready
        } else {
            SessionState::Uninitialized
        }
    }

    fn luid(&self) -> Luid {
        self.luid
    }

    fn submit(&mut self, input: SessionInput<'_>) -> Result<()> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        match input {
            SessionInput::Bitstream(data) => self.submit_bitstream(data),
            SessionInput::Texture(_) => Err(Error::Unsupported(
                "decode session takes bitstreams, not textures".into(),
            )),
        }
    }

    fn drain_output(&mut self) -> Result<Option<SessionOutput<'_>>> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        match self.pending.take() {
            Some(index) => self.convert_surface(index).map(Some),
            None => Ok(None),
        }
    }

    fn reconfigure(&mut self, change: Reconfiguration) -> Result<()> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        match change {
            Reconfiguration::Stream(snapshot) => {
                let crop = Resolution::new(snapshot.display_area.width(), snapshot.display_area.height());
                if self.stream.map(|s| s.crop) != Some(crop) {
                    tracing::info!("Stream format announced as {}, decoder will reinitialise", crop);
                    self.needs_reinit = true;
                }
                Ok(())
            }
            other => Err(Error::Unsupported(format!(
                "{:?} does not apply to a decode session",
                other
            ))),
        }
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        if let Some(mut engine) = self.engine.take() {
            engine.close();
            engine.free_frames();
            engine.shutdown();
        }
        if let Some(mut device) = self.device.take() {
            self.ring.release(device.as_mut());
        }
        self.driver.take();
        self.pending = None;
        self.destroyed = true;
        tracing::info!("MFX decode session on {} destroyed", self.luid);
    }
}

impl<E: MfxEngine> Drop for MfxSession<E> {
    fn drop(&mut self) {
        self.destroy();
    }
}
