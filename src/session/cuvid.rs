//! CUDA/NVDEC-style decode session
//!
//! Frames are decoded into engine memory, copied plane by plane into
//! interop-registered textures, converted to BGRA by the shader pass and
//! copied into the output ring. Surfaces and shaders are built on the first
//! decode that returns frames and dropped when the frame size changes or the
//! decoder is recreated.

use super::{check_codec, BackendSession, DeviceRequest, Reconfiguration, SessionInput, SessionKind, SessionOutput, SessionState};
use crate::config::DecoderConfig;
use crate::convert::ShaderConverter;
use crate::driver::DriverHandle;
use crate::error::{Error, Result};
use crate::gpu::GpuDevice;
use crate::interop::{DeviceFrame, InteropApi, InteropSurfaces};
use crate::output::OutputRing;
use crate::platform::Platform;
use crate::reconfig::{ReconfigController, ReconfigState, RecreateReason};
use crate::types::{Codec, Luid, Resolution, Vendor, VideoFormatSnapshot};

/// Packet flags passed with a decode call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeFlags {
    /// The packet completes a picture; flush it through the parser
    pub end_of_picture: bool,
}

impl DecodeFlags {
    pub const END_OF_PICTURE: Self = Self {
        end_of_picture: true,
    };
}

/// Decode engine with a context that outlives its decoder object
pub trait CuvidEngine: InteropApi + Send {
    /// Create parser + decoder inside the existing context
    fn create_decoder(&mut self, codec: Codec) -> Result<()>;

    fn destroy_decoder(&mut self);

    /// Decode one packet, returning how many frames became ready
    fn decode(&mut self, data: &[u8], flags: DecodeFlags) -> Result<usize>;

    /// Format of the last sequence the parser saw
    fn latest_format(&self) -> VideoFormatSnapshot;

    /// Size of frames handed out by [`CuvidEngine::next_frame`]
    fn frame_size(&self) -> Resolution;

    fn next_frame(&mut self) -> Option<DeviceFrame>;

    fn destroy_context(&mut self);
}

enum Decoded {
    Frames(usize),
    Recreated,
}

/// NVDEC-style decode session
pub struct CuvidSession<E: CuvidEngine> {
    engine: Option<E>,
    device: Option<Box<dyn GpuDevice>>,
    driver: Option<DriverHandle>,
    config: DecoderConfig,
    luid: Luid,
    surfaces: Option<InteropSurfaces>,
    converter: ShaderConverter,
    ring: OutputRing,
    reconfig: ReconfigController,
    frame_size: Option<Resolution>,
    pending: usize,
    destroyed: bool,
}

impl<E: CuvidEngine> CuvidSession<E> {
    pub fn create<P>(platform: &P, request: DeviceRequest, config: &DecoderConfig) -> Result<Self>
    where
        P: Platform<Cuvid = E>,
    {
        config.validate()?;
        check_codec(config.codec)?;

        let driver = platform.acquire_driver(Vendor::Nvidia)?;
        let device = platform.open_device(request.device, request.luid, request.api)?;
        let mut engine = platform.new_cuvid_engine(&driver, device.as_ref())?;
        if let Err(e) = engine.create_decoder(config.codec) {
            tracing::error!("Decoder creation failed on {}: {}", request.luid, e);
            engine.destroy_context();
            return Err(Error::BackendInit(format!("decoder: {}", e)));
        }

        tracing::info!(
            "Cuvid decode session created: {} on {}, {:?} output, {}",
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
            surfaces: None,
            converter: ShaderConverter::new(config.color),
            ring: OutputRing::new(config.output, config.output_ring_size),
            reconfig: ReconfigController::new(),
            frame_size: None,
            pending: 0,
            destroyed: false,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Engine rebuilds performed after format drift
    pub fn recreations(&self) -> u32 {
        self.reconfig.recreations()
    }

    pub fn reconfig_state(&self) -> ReconfigState {
        self.reconfig.state()
    }

    fn check_usable(&self) -> Result<()> {
        if self.destroyed {
            return Err(Error::Destroyed);
        }
        self.reconfig.ensure_usable()
    }

    /// Decode once, recreating the decoder if the stream format drifted
    fn decode_and_recreate(&mut self, data: &[u8]) -> Result<Decoded> {
        let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
        match engine.decode(data, DecodeFlags::default()) {
            Ok(0) => Ok(Decoded::Frames(0)),
            Ok(n) => {
                let format = engine.latest_format();
                match self.reconfig.observe(&format) {
                    None => Ok(Decoded::Frames(n)),
                    Some(reason) => {
                        self.recreate(reason)?;
                        Ok(Decoded::Recreated)
                    }
                }
            }
            Err(e) => {
                let format = engine.latest_format();
                match self.reconfig.observe_failure(&format) {
                    Some(reason) => {
                        self.recreate(reason)?;
                        Ok(Decoded::Recreated)
                    }
                    None => Err(Error::Submit(e.to_string())),
                }
            }
        }
    }

    fn recreate(&mut self, reason: RecreateReason) -> Result<()> {
        let codec = self.config.codec;
        let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
        self.reconfig.recreate(reason, || {
            engine.destroy_decoder();
            engine.create_decoder(codec)
        })?;
        self.reset_prepare();
        Ok(())
    }

    /// Drop surfaces and shader pipeline; rebuilt on the next frame
    fn reset_prepare(&mut self) {
        let (Some(engine), Some(device)) = (self.engine.as_mut(), self.device.as_deref_mut()) else {
            return;
        };
        self.converter.release(device);
        if let Some(surfaces) = self.surfaces.take() {
            surfaces.release(device, engine);
        }
    }

    /// Build interop surfaces and the shader pipeline for `size` if missing
    fn prepare(&mut self, size: Resolution) -> Result<()> {
        if self.surfaces.is_some() && self.converter.is_built() {
            return Ok(());
        }
        let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
        let device = self.device.as_deref_mut().ok_or(Error::Destroyed)?;

        let surfaces = InteropSurfaces::build(device, engine, size)?;
        if let Err(e) = self.converter.build(device, surfaces.textures(), size) {
            surfaces.release(device, engine);
            return Err(e);
        }
        self.surfaces = Some(surfaces);
        self.reconfig.mark_ready();
        Ok(())
    }

    fn submit_bitstream(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::Submit("empty packet".into()));
        }
        self.pending = 0;

        let frames = match self.decode_and_recreate(data)? {
            Decoded::Frames(n) => n,
            Decoded::Recreated => {
                let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
                engine
                    .decode(data, DecodeFlags::END_OF_PICTURE)
                    .map_err(|e| Error::Submit(format!("resubmit after recreate: {}", e)))?
            }
        };
        if frames == 0 {
            tracing::trace!("Decoder buffering, no frame ready");
            return Ok(());
        }

        let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
        self.reconfig.record(engine.latest_format());
        let size = engine.frame_size();
        if let Some(previous) = self.frame_size {
            if previous != size && self.surfaces.is_some() {
                tracing::info!("Resolution changed, {} -> {}", previous, size);
                self.reset_prepare();
            }
        }
        self.frame_size = Some(size);
        self.pending = frames;
        Ok(())
    }

    fn convert_next(&mut self) -> Result<SessionOutput<'static>> {
        let size = self
            .frame_size
            .ok_or_else(|| Error::Internal("frame pending without a frame size".into()))?;
        self.prepare(size)?;

        let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
        let device = self.device.as_deref_mut().ok_or(Error::Destroyed)?;
        let surfaces = self
            .surfaces
            .as_ref()
            .ok_or_else(|| Error::Internal("interop surfaces missing after prepare".into()))?;

        let frame = engine
            .next_frame()
            .ok_or_else(|| Error::Output("decoder returned fewer frames than reported".into()))?;
        surfaces.upload(engine, frame)?;
        let bgra = self.converter.convert(device)?;

        self.ring.ensure(device, size)?;
        let slot = self.ring.advance()?;
        device.copy_texture(slot, bgra)?;
        device.flush_and_wait()?;
        Ok(SessionOutput::Frame(self.ring.deliver(device)?))
    }
}

impl<E: CuvidEngine> BackendSession for CuvidSession<E> {
    fn kind(&self) -> SessionKind {
        SessionKind::CuvidDecode
    }

    fn state(&self) -> SessionState {
        if self.destroyed {
            SessionState::Destroyed
        } else if self.reconfig.state() == ReconfigState::Faulted {
            SessionState::Faulted
        } else if self.surfaces.is_some() {
            SessionState::Ready
        } else {
            SessionState::Uninitialized
        }
    }

    fn luid(&self) -> Luid {
        self.luid
    }

    fn submit(&mut self, input: SessionInput<'_>) -> Result<()> {
        self.check_usable()?;
        match input {
            SessionInput::Bitstream(data) => self.submit_bitstream(data),
            SessionInput::Texture(_) => Err(Error::Unsupported(
                "decode session takes bitstreams, not textures".into(),
            )),
        }
    }

    fn drain_output(&mut self) -> Result<Option<SessionOutput<'_>>> {
        self.check_usable()?;
        if self.pending == 0 {
            return Ok(None);
        }
        self.pending -= 1;
        self.convert_next().map(Some)
    }

    fn reconfigure(&mut self, change: Reconfiguration) -> Result<()> {
        self.check_usable()?;
        match change {
            Reconfiguration::Stream(snapshot) => {
                let drift = self
                    .reconfig
                    .observe(&snapshot)
                    .or_else(|| self.reconfig.observe_failure(&snapshot));
                if let Some(reason) = drift {
                    tracing::info!("Stream format announced, {}", reason);
                    self.recreate(reason)?;
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
        if let Some(engine) = self.engine.as_mut() {
            engine.destroy_decoder();
        }
        if let (Some(engine), Some(device)) = (self.engine.as_mut(), self.device.as_deref_mut()) {
            if let Some(surfaces) = self.surfaces.take() {
                surfaces.release(device, engine);
            }
            self.converter.release(device);
            self.ring.release(device);
        }
        if let Some(mut engine) = self.engine.take() {
            engine.destroy_context();
        }
        self.device.take();
        self.driver.take();
        self.pending = 0;
        self.destroyed = true;
        tracing::info!("Cuvid decode session on {} destroyed", self.luid);
    }
}

impl<E: CuvidEngine> Drop for CuvidSession<E> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{ColorSpace, YuvMatrix};
    use crate::reference::{synthetic_stream, FaultPlan, ReferencePlatform, StreamPacket, NVIDIA_LUID};
    use crate::types::{ApiKind, DisplayRect, OutputHandle, OutputMode};

    fn request() -> DeviceRequest {
        DeviceRequest::new(NVIDIA_LUID, ApiKind::Dx11)
    }

    fn frame_of(output: Option<SessionOutput<'_>>) -> OutputHandle {
        match output {
            Some(SessionOutput::Frame(handle)) => handle,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_converts_to_bgra() {
        let platform = ReferencePlatform::new();
        let config = DecoderConfig::default().with_color(ColorSpace::BT709_STUDIO);
        let mut session = CuvidSession::create(&platform, request(), &config).unwrap();
        assert_eq!(session.state(), SessionState::Uninitialized);

        let packet = StreamPacket::new(Codec::H264, Resolution::new(64, 32))
            .with_yuv(81, 90, 240)
            .to_bytes();
        session.submit(SessionInput::Bitstream(&packet)).unwrap();
        let out = frame_of(session.drain_output().unwrap());
        assert!(session.drain_output().unwrap().is_none());
        assert_eq!(session.state(), SessionState::Ready);

        let expected = YuvMatrix::for_color_space(ColorSpace::BT709_STUDIO).to_bgra8(81, 90, 240);
        let pixels = platform.store().read(out.handle()).unwrap();
        assert_eq!(pixels.len(), 64 * 32 * 4);
        assert!(pixels.chunks_exact(4).all(|px| px == expected));
    }

    #[test]
    fn test_buffered_packet_reports_no_output() {
        let platform = ReferencePlatform::new();
        let mut session = CuvidSession::create(&platform, request(), &DecoderConfig::default()).unwrap();
        let res = Resolution::new(64, 32);

        let held = StreamPacket::new(Codec::H264, res).with_hold().to_bytes();
        session.submit(SessionInput::Bitstream(&held)).unwrap();
        assert!(session.drain_output().unwrap().is_none());

        let next = StreamPacket::new(Codec::H264, res).to_bytes();
        session.submit(SessionInput::Bitstream(&next)).unwrap();
        frame_of(session.drain_output().unwrap());
        frame_of(session.drain_output().unwrap());
        assert!(session.drain_output().unwrap().is_none());
    }

    #[test]
    fn test_resolution_change_recreates_once() {
        let platform = ReferencePlatform::new();
        let mut session = CuvidSession::create(&platform, request(), &DecoderConfig::default()).unwrap();

        let mut stream = synthetic_stream(Codec::H264, Resolution::HD_720P, 3);
        stream.extend(synthetic_stream(Codec::H264, Resolution::FHD_1080P, 3));

        let mut sizes = Vec::new();
        for packet in &stream {
            session.submit(SessionInput::Bitstream(packet)).unwrap();
            while let Some(out) = session.drain_output().unwrap() {
                let handle = frame_of(Some(out)).handle();
                sizes.push(platform.store().describe(handle).unwrap().resolution());
            }
        }

        assert_eq!(session.recreations(), 1);
        assert_eq!(sizes.len(), 6);
        assert!(sizes[..3].iter().all(|r| *r == Resolution::HD_720P));
        assert!(sizes[3..].iter().all(|r| *r == Resolution::FHD_1080P));
    }

    #[test]
    fn test_display_area_shrink_recreates() {
        let platform = ReferencePlatform::new();
        let config = DecoderConfig::default().with_codec(Codec::Hevc);
        let mut session = CuvidSession::create(&platform, request(), &config).unwrap();
        let res = Resolution::new(128, 64);

        let full = StreamPacket::new(Codec::Hevc, res).to_bytes();
        let cropped = StreamPacket::new(Codec::Hevc, res)
            .with_display(DisplayRect::new(0, 0, 96, 64))
            .to_bytes();

        session.submit(SessionInput::Bitstream(&full)).unwrap();
        frame_of(session.drain_output().unwrap());
        session.submit(SessionInput::Bitstream(&cropped)).unwrap();
        let out = frame_of(session.drain_output().unwrap());

        assert_eq!(session.recreations(), 1);
        let desc = platform.store().describe(out.handle()).unwrap();
        assert_eq!(desc.resolution(), Resolution::new(96, 64));
    }

    fn announced(display: DisplayRect, coded: Resolution) -> Reconfiguration {
        Reconfiguration::Stream(VideoFormatSnapshot {
            display_area: display,
            coded_width: coded.width,
            coded_height: coded.height,
            max_width: coded.width,
            max_height: coded.height,
        })
    }

    #[test]
    fn test_announced_format_change_recreates_once() {
        let platform = ReferencePlatform::new();
        let mut session = CuvidSession::create(&platform, request(), &DecoderConfig::default()).unwrap();
        let res = Resolution::new(128, 64);
        let crop = DisplayRect::new(0, 0, 96, 64);

        let full = StreamPacket::new(Codec::H264, res).to_bytes();
        session.submit(SessionInput::Bitstream(&full)).unwrap();
        frame_of(session.drain_output().unwrap());

        session.reconfigure(announced(DisplayRect::full(res), res)).unwrap();
        assert_eq!(session.recreations(), 0);

        session.reconfigure(announced(crop, res)).unwrap();
        assert_eq!(session.recreations(), 1);
        assert_eq!(session.reconfig_state(), ReconfigState::Fresh);

        let cropped = StreamPacket::new(Codec::H264, res).with_display(crop).to_bytes();
        for _ in 0..3 {
            session.submit(SessionInput::Bitstream(&cropped)).unwrap();
            let out = frame_of(session.drain_output().unwrap());
            let desc = platform.store().describe(out.handle()).unwrap();
            assert_eq!(desc.resolution(), Resolution::new(96, 64));
        }
        assert_eq!(session.recreations(), 1);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_announcement_before_first_decode_is_baseline() {
        let platform = ReferencePlatform::new();
        let mut session = CuvidSession::create(&platform, request(), &DecoderConfig::default()).unwrap();
        let res = Resolution::new(128, 64);

        session.reconfigure(announced(DisplayRect::new(0, 0, 96, 64), res)).unwrap();
        let full = StreamPacket::new(Codec::H264, res).to_bytes();
        session.submit(SessionInput::Bitstream(&full)).unwrap();
        frame_of(session.drain_output().unwrap());
        assert_eq!(session.recreations(), 0);

        assert!(matches!(
            session.reconfigure(Reconfiguration::Bitrate(1000)),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_failed_recreate_faults_session() {
        let platform = ReferencePlatform::new().with_faults(FaultPlan {
            fail_decoder_recreate: true,
            ..Default::default()
        });
        let mut session = CuvidSession::create(&platform, request(), &DecoderConfig::default()).unwrap();

        let small = StreamPacket::new(Codec::H264, Resolution::HD_720P).to_bytes();
        let large = StreamPacket::new(Codec::H264, Resolution::FHD_1080P).to_bytes();
        session.submit(SessionInput::Bitstream(&small)).unwrap();
        frame_of(session.drain_output().unwrap());

        assert!(matches!(
            session.submit(SessionInput::Bitstream(&large)),
            Err(Error::Recreate(_))
        ));
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(matches!(
            session.submit(SessionInput::Bitstream(&small)),
            Err(Error::Faulted)
        ));

        session.destroy();
        assert_eq!(platform.store().live_objects(), 0);
    }

    #[test]
    fn test_shared_handle_output() {
        let platform = ReferencePlatform::new();
        let config = DecoderConfig::default().with_output(OutputMode::SharedHandle);
        let mut session = CuvidSession::create(&platform, request(), &config).unwrap();
        let packet = StreamPacket::new(Codec::H264, Resolution::new(64, 64)).to_bytes();
        session.submit(SessionInput::Bitstream(&packet)).unwrap();
        assert!(matches!(
            frame_of(session.drain_output().unwrap()),
            OutputHandle::Shared(_)
        ));
    }

    #[test]
    fn test_garbage_is_submit_error() {
        let platform = ReferencePlatform::new();
        let mut session = CuvidSession::create(&platform, request(), &DecoderConfig::default()).unwrap();
        assert!(matches!(
            session.submit(SessionInput::Bitstream(b"not a stream")),
            Err(Error::Submit(_))
        ));
        assert!(session.submit(SessionInput::Bitstream(&[])).is_err());
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_destroy_releases_all_objects() {
        let platform = ReferencePlatform::new();
        let mut session = CuvidSession::create(&platform, request(), &DecoderConfig::default()).unwrap();
        for packet in synthetic_stream(Codec::H264, Resolution::new(64, 32), 2) {
            session.submit(SessionInput::Bitstream(&packet)).unwrap();
            while session.drain_output().unwrap().is_some() {}
        }
        assert!(platform.store().live_objects() > 0);

        session.destroy();
        session.destroy();
        assert_eq!(platform.store().live_objects(), 0);
        assert!(!platform.drivers().is_loaded(Vendor::Nvidia));
    }

    #[test]
    fn test_av1_rejected_before_allocation() {
        let platform = ReferencePlatform::new();
        let config = DecoderConfig::default().with_codec(Codec::Av1);
        assert!(matches!(
            CuvidSession::create(&platform, request(), &config),
            Err(Error::CodecNotSupported(_))
        ));
        assert!(!platform.drivers().is_loaded(Vendor::Nvidia));
    }
}
