//! AMF-style encode session

use super::{check_codec, BackendSession, DeviceRequest, Reconfiguration, SessionInput, SessionKind, SessionOutput, SessionState};
use crate::config::{EncoderConfig, QpRange};
use crate::driver::DriverHandle;
use crate::error::{Error, Result};
use crate::gpu::{GpuDevice, PixelFormat, TextureDesc, TextureUsage};
use crate::output::PacketBuffer;
use crate::platform::Platform;
use crate::types::{ApiKind, Codec, Luid, Packet, PlatformHandle, Resolution, Vendor};
use std::time::{Duration, Instant};

/// Static encoder parameters applied before `init`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderParams {
    pub codec: Codec,
    pub resolution: Resolution,
    pub bitrate_bps: u64,
    pub framerate: u32,
    /// IDR period in frames
    pub gop: u32,
    pub qp: QpRange,
}

impl From<&EncoderConfig> for EncoderParams {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            codec: config.codec,
            resolution: config.resolution,
            bitrate_bps: config.bitrate_kbps as u64 * 1000,
            framerate: config.framerate,
            gop: config.gop,
            qp: config.qp,
        }
    }
}

/// Output data type reported with each encoded buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Idr,
    I,
    P,
    B,
}

impl FrameType {
    pub fn is_keyframe(&self) -> bool {
        matches!(self, FrameType::Idr | FrameType::I)
    }
}

/// One buffer returned by the encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub frame_type: FrameType,
    pub pts: i64,
}

/// Encoder component entry points
pub trait EncodeEngine: Send {
    /// Apply parameters and initialise for BGRA input
    fn init(&mut self, params: &EncoderParams) -> Result<()>;

    fn submit_input(&mut self, surface: PlatformHandle, pts: i64) -> Result<()>;

    /// `Ok(None)` means no output yet, ask again
    fn query_output(&mut self) -> Result<Option<EncodedFrame>>;

    fn set_bitrate(&mut self, bps: u64) -> Result<()>;

    fn set_framerate(&mut self, fps: u32) -> Result<()>;

    fn set_qp(&mut self, qp: QpRange) -> Result<()>;

    fn terminate(&mut self);
}

/// Hardware encode session
///
/// Field order is teardown order: engine, device, driver.
pub struct EncodeSession<E: EncodeEngine> {
    engine: Option<E>,
    device: Option<Box<dyn GpuDevice>>,
    driver: Option<DriverHandle>,
    config: EncoderConfig,
    luid: Luid,
    api: ApiKind,
    /// Session-owned copy of the caller's texture
    input: Option<PlatformHandle>,
    packets: PacketBuffer,
    awaiting_output: bool,
    next_pts: i64,
    state: SessionState,
}

impl<E: EncodeEngine> EncodeSession<E> {
    /// Validate, acquire driver and device, create and initialise the encoder
    ///
    /// Nothing is allocated for an invalid configuration; on any later failure
    /// the partially built objects are torn down in reverse order.
    pub fn create<P>(platform: &P, request: DeviceRequest, config: &EncoderConfig) -> Result<Self>
    where
        P: Platform<Encoder = E>,
    {
        config.validate()?;
        check_codec(config.codec)?;

        let driver = platform.acquire_driver(Vendor::Amd)?;
        let device = platform.open_device(request.device, request.luid, request.api)?;
        let mut engine = platform.new_encode_engine(&driver, device.as_ref(), request.api, config.codec)?;
        if let Err(e) = engine.init(&EncoderParams::from(config)) {
            tracing::error!("Encoder init failed on {}: {}", request.luid, e);
            engine.terminate();
            return Err(Error::BackendInit(format!("encoder init: {}", e)));
        }

        tracing::info!(
            "Encode session created: {} {} @ {} kbps, {} fps, gop {} on {}",
            config.codec,
            config.resolution,
            config.bitrate_kbps,
            config.framerate,
            config.gop,
            request.luid
        );

        Ok(Self {
            engine: Some(engine),
            device: Some(device),
            driver: Some(driver),
            config: config.clone(),
            luid: request.luid,
            api: request.api,
            input: None,
            packets: PacketBuffer::new(),
            awaiting_output: false,
            next_pts: 0,
            state: SessionState::Uninitialized,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn api(&self) -> ApiKind {
        self.api
    }

    pub fn packet_capacity(&self) -> usize {
        self.packets.capacity()
    }

    fn check_usable(&self) -> Result<()> {
        match self.state {
            SessionState::Destroyed => Err(Error::Destroyed),
            SessionState::Faulted => Err(Error::Faulted),
            _ => Ok(()),
        }
    }

    fn engine_mut(&mut self) -> Result<&mut E> {
        self.engine.as_mut().ok_or(Error::Destroyed)
    }

    fn submit_texture(&mut self, texture: PlatformHandle) -> Result<()> {
        let device = self.device.as_mut().ok_or(Error::Destroyed)?;
        let desc = device
            .describe(texture)
            .map_err(|e| Error::Submit(format!("input texture: {}", e)))?;
        if desc.resolution() != self.config.resolution {
            return Err(Error::Submit(format!(
                "input is {}, session encodes {}",
                desc.resolution(),
                self.config.resolution
            )));
        }

        // The encoder reads the surface after submit returns, so it gets its own copy
        let input = match self.input {
            Some(t) => t,
            None => {
                let t = device.create_texture(&TextureDesc::new(
                    desc.width,
                    desc.height,
                    desc.format,
                    TextureUsage::ShaderResource,
                ))?;
                tracing::debug!("Encoder input surface created at {}", desc.resolution());
                self.input = Some(t);
                t
            }
        };
        device
            .copy_texture(input, texture)
            .map_err(|e| Error::Submit(format!("input copy: {}", e)))?;
        device.flush_and_wait()?;

        let pts = self.next_pts;
        let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
        engine
            .submit_input(input, pts)
            .map_err(|e| Error::Submit(e.to_string()))?;

        self.next_pts += 1;
        self.awaiting_output = true;
        self.state = SessionState::Ready;
        tracing::trace!("Submitted frame {}", pts);
        Ok(())
    }

    /// Poll until the encoder hands out a buffer or the drain deadline passes
    fn poll_output(&mut self) -> Result<EncodedFrame> {
        let timeout = self.config.drain_timeout();
        let engine = self.engine.as_mut().ok_or(Error::Destroyed)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = engine.query_output()? {
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "no encoder output within {} ms",
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Allocate a throwaway surface and encode it once
    pub fn self_test(&mut self) -> Result<()> {
        self.check_usable()?;
        let res = self.config.resolution;
        let device = self.device.as_mut().ok_or(Error::Destroyed)?;
        let surface = device.create_texture(&TextureDesc::new(
            res.width,
            res.height,
            PixelFormat::Bgra8,
            TextureUsage::ShaderResource,
        ))?;

        let result = self.submit_texture(surface).and_then(|_| match self.drain_output()? {
            Some(_) => Ok(()),
            None => Err(Error::Output("encoder produced no packet".into())),
        });

        if let Some(device) = self.device.as_mut() {
            device.release(surface);
        }
        result
    }
}

impl<E: EncodeEngine> BackendSession for EncodeSession<E> {
    fn kind(&self) -> SessionKind {
        SessionKind::Encode
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn luid(&self) -> Luid {
        self.luid
    }

    fn submit(&mut self, input: SessionInput<'_>) -> Result<()> {
        self.check_usable()?;
        match input {
            SessionInput::Texture(texture) => self.submit_texture(texture),
            SessionInput::Bitstream(_) => Err(Error::Unsupported(
                "encode session takes textures, not bitstreams".into(),
            )),
        }
    }

    fn drain_output(&mut self) -> Result<Option<SessionOutput<'_>>> {
        self.check_usable()?;
        if !self.awaiting_output {
            return Ok(None);
        }
        self.awaiting_output = false;

        let frame = match self.poll_output() {
            Ok(frame) => frame,
            Err(e @ Error::Timeout(_)) => return Err(e),
            Err(e) => {
                tracing::error!("Encoder output failed, session faulted: {}", e);
                self.state = SessionState::Faulted;
                return Err(e);
            }
        };
        if frame.data.is_empty() {
            return Ok(None);
        }
        let is_keyframe = frame.frame_type.is_keyframe();
        let data = self.packets.store(&frame.data);
        tracing::trace!(
            "Packet pts {} ({} bytes{})",
            frame.pts,
            data.len(),
            if is_keyframe { ", key" } else { "" }
        );
        Ok(Some(SessionOutput::Packet(Packet {
            data,
            is_keyframe,
            pts: frame.pts,
            dts: frame.pts,
        })))
    }

    fn reconfigure(&mut self, change: Reconfiguration) -> Result<()> {
        self.check_usable()?;
        match change {
            Reconfiguration::Bitrate(kbps) => {
                if kbps == 0 {
                    return Err(Error::Configuration("bitrate must be positive".into()));
                }
                self.engine_mut()?.set_bitrate(kbps as u64 * 1000)?;
                self.config.bitrate_kbps = kbps;
                tracing::info!("Bitrate set to {} kbps", kbps);
            }
            Reconfiguration::Framerate(fps) => {
                if fps == 0 {
                    return Err(Error::Configuration("framerate must be positive".into()));
                }
                self.engine_mut()?.set_framerate(fps)?;
                self.config.framerate = fps;
                tracing::info!("Framerate set to {}", fps);
            }
            Reconfiguration::Qp(qp) => {
                self.engine_mut()?.set_qp(qp)?;
                self.config.qp = qp;
                tracing::info!("QP range set to [{}, {}]", qp.min(), qp.max());
            }
            Reconfiguration::Stream(_) => {
                return Err(Error::Unsupported(
                    "encode sessions have a fixed input format".into(),
                ))
            }
        }
        Ok(())
    }

    fn destroy(&mut self) {
        if self.state == SessionState::Destroyed {
            return;
        }
        if let Some(mut engine) = self.engine.take() {
            engine.terminate();
        }
        if let Some(mut device) = self.device.take() {
            if let Some(input) = self.input.take() {
                device.release(input);
            }
        }
        self.driver.take();
        self.state = SessionState::Destroyed;
        tracing::info!("Encode session on {} destroyed", self.luid);
    }
}

impl<E: EncodeEngine> Drop for EncodeSession<E> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{FaultPlan, ReferencePlatform, AMD_LUID};
    use crate::types::{DisplayRect, VideoFormatSnapshot};

    fn request() -> DeviceRequest {
        DeviceRequest::new(AMD_LUID, ApiKind::Dx11)
    }

    fn config() -> EncoderConfig {
        EncoderConfig::default()
            .with_resolution(320, 180)
            .with_qp(QpRange::new(10, 40).unwrap())
    }

    #[test]
    fn test_encode_produces_keyframe_first() {
        let platform = ReferencePlatform::new();
        let mut session = EncodeSession::create(&platform, request(), &config()).unwrap();
        assert_eq!(session.state(), SessionState::Uninitialized);

        let texture = platform.caller_texture(Resolution::new(320, 180), [40, 80, 120, 255]);
        session.submit(SessionInput::Texture(texture)).unwrap();
        match session.drain_output().unwrap() {
            Some(SessionOutput::Packet(p)) => {
                assert!(p.is_keyframe);
                assert!(p.size() > 0);
                assert_eq!(p.pts, 0);
            }
            other => panic!("expected packet, got {:?}", other),
        }
        assert!(session.drain_output().unwrap().is_none());
        assert_eq!(session.state(), SessionState::Ready);

        session.submit(SessionInput::Texture(texture)).unwrap();
        match session.drain_output().unwrap() {
            Some(SessionOutput::Packet(p)) => assert!(!p.is_keyframe),
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn test_input_copied_into_session_surface() {
        let platform = ReferencePlatform::new();
        let mut session = EncodeSession::create(&platform, request(), &config()).unwrap();
        let texture = platform.caller_texture(Resolution::new(320, 180), [0, 0, 0, 255]);
        let before = platform.store().live_objects();

        session.submit(SessionInput::Texture(texture)).unwrap();
        session.drain_output().unwrap();
        session.submit(SessionInput::Texture(texture)).unwrap();
        session.drain_output().unwrap();
        // one input surface, created on first submit and reused
        assert_eq!(platform.store().live_objects(), before + 1);
    }

    #[test]
    fn test_wrong_input_size_rejected() {
        let platform = ReferencePlatform::new();
        let mut session = EncodeSession::create(&platform, request(), &config()).unwrap();
        let texture = platform.caller_texture(Resolution::new(640, 360), [0, 0, 0, 255]);
        assert!(matches!(
            session.submit(SessionInput::Texture(texture)),
            Err(Error::Submit(_))
        ));
    }

    #[test]
    fn test_drain_times_out() {
        let platform = ReferencePlatform::new().with_faults(FaultPlan {
            encoder_never_ready: true,
            ..Default::default()
        });
        let config = config().with_drain_timeout(Duration::from_millis(20));
        let mut session = EncodeSession::create(&platform, request(), &config).unwrap();
        let texture = platform.caller_texture(Resolution::new(320, 180), [0, 0, 0, 255]);
        session.submit(SessionInput::Texture(texture)).unwrap();

        let start = Instant::now();
        assert!(matches!(session.drain_output(), Err(Error::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_output_error_faults_session() {
        let platform = ReferencePlatform::new().with_faults(FaultPlan {
            encoder_output_error: true,
            ..Default::default()
        });
        let mut session = EncodeSession::create(&platform, request(), &config()).unwrap();
        let texture = platform.caller_texture(Resolution::new(320, 180), [0, 0, 0, 255]);
        session.submit(SessionInput::Texture(texture)).unwrap();

        assert!(matches!(session.drain_output(), Err(Error::Output(_))));
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(matches!(
            session.submit(SessionInput::Texture(texture)),
            Err(Error::Faulted)
        ));
        assert!(matches!(
            session.reconfigure(Reconfiguration::Bitrate(1000)),
            Err(Error::Faulted)
        ));

        session.destroy();
        assert_eq!(session.state(), SessionState::Destroyed);
    }

    #[test]
    fn test_timeout_does_not_fault() {
        let platform = ReferencePlatform::new().with_faults(FaultPlan {
            encoder_never_ready: true,
            ..Default::default()
        });
        let config = config().with_drain_timeout(Duration::from_millis(5));
        let mut session = EncodeSession::create(&platform, request(), &config).unwrap();
        let texture = platform.caller_texture(Resolution::new(320, 180), [0, 0, 0, 255]);
        session.submit(SessionInput::Texture(texture)).unwrap();
        assert!(matches!(session.drain_output(), Err(Error::Timeout(_))));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_stream_announcement_rejected() {
        let platform = ReferencePlatform::new();
        let mut session = EncodeSession::create(&platform, request(), &config()).unwrap();
        let res = Resolution::new(320, 180);
        let before = session.config().clone();
        let change = Reconfiguration::Stream(VideoFormatSnapshot {
            display_area: DisplayRect::full(res),
            coded_width: res.width,
            coded_height: res.height,
            max_width: res.width,
            max_height: res.height,
        });

        assert!(matches!(session.reconfigure(change), Err(Error::Unsupported(_))));
        assert_eq!(session.config().resolution, before.resolution);
        assert_eq!(session.config().bitrate_kbps, before.bitrate_kbps);
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_invalid_config_allocates_nothing() {
        let platform = ReferencePlatform::new();
        let bad = config().with_resolution(321, 180);
        assert!(matches!(
            EncodeSession::create(&platform, request(), &bad),
            Err(Error::Configuration(_))
        ));
        assert_eq!(platform.store().live_objects(), 0);
        assert!(!platform.drivers().is_loaded(Vendor::Amd));
    }

    #[test]
    fn test_init_failure_tears_down() {
        let platform = ReferencePlatform::new().with_faults(FaultPlan {
            fail_engine_init: true,
            ..Default::default()
        });
        assert!(matches!(
            EncodeSession::create(&platform, request(), &config()),
            Err(Error::BackendInit(_))
        ));
        assert_eq!(platform.store().live_objects(), 0);
        assert!(!platform.drivers().is_loaded(Vendor::Amd));
    }

    #[test]
    fn test_reconfigure_updates_config() {
        let platform = ReferencePlatform::new();
        let mut session = EncodeSession::create(&platform, request(), &config()).unwrap();
        session.reconfigure(Reconfiguration::Bitrate(8000)).unwrap();
        session.reconfigure(Reconfiguration::Framerate(30)).unwrap();
        session
            .reconfigure(Reconfiguration::Qp(QpRange::new(20, 30).unwrap()))
            .unwrap();
        assert_eq!(session.config().bitrate_kbps, 8000);
        assert_eq!(session.config().framerate, 30);
        assert_eq!(session.config().qp.min(), 20);

        assert!(session.reconfigure(Reconfiguration::Bitrate(0)).is_err());
        assert_eq!(session.config().bitrate_kbps, 8000);
    }

    #[test]
    fn test_destroy_releases_everything_once() {
        let platform = ReferencePlatform::new();
        let texture = platform.caller_texture(Resolution::new(320, 180), [0, 0, 0, 255]);
        let baseline = platform.store().live_objects();

        let mut session = EncodeSession::create(&platform, request(), &config()).unwrap();
        session.submit(SessionInput::Texture(texture)).unwrap();
        session.drain_output().unwrap();
        assert!(platform.drivers().is_loaded(Vendor::Amd));

        session.destroy();
        session.destroy();
        assert_eq!(session.state(), SessionState::Destroyed);
        assert_eq!(platform.store().live_objects(), baseline);
        assert!(!platform.drivers().is_loaded(Vendor::Amd));
        assert!(matches!(
            session.submit(SessionInput::Texture(texture)),
            Err(Error::Destroyed)
        ));
    }

    #[test]
    fn test_self_test_leaves_no_surface() {
        let platform = ReferencePlatform::new();
        let mut session = EncodeSession::create(&platform, request(), &config()).unwrap();
        let before = platform.store().live_objects();
        session.self_test().unwrap();
        // only the session input copy remains
        assert_eq!(platform.store().live_objects(), before + 1);
    }
}
