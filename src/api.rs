//! Status-code boundary
//!
//! Entry points for callers that only deal in handles and integers. Nothing
//! here returns a `Result`: failures are logged and mapped to the negative
//! codes of [`Error::status`].
//!
//! | status | meaning |
//! |---|---|
//! | `0` | success, output delivered through the callback |
//! | `1` | success, no output yet (decoder buffering, encoder returned nothing) |
//! | `< 0` | failure, see [`Error::status`] |

use crate::config::{DecoderConfig, EncoderConfig, QpRange};
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::probe;
use crate::session::{
    create_decoder, create_encoder, BackendSession, DeviceRequest, Reconfiguration, SessionInput,
    SessionKind, SessionOutput, SessionState,
};
use crate::types::{AdapterDescriptor, OutputHandle, PlatformHandle, Vendor};
use std::sync::Arc;

pub const STATUS_OUTPUT: i32 = 0;
pub const STATUS_NO_OUTPUT: i32 = 1;

fn status_of(result: Result<usize>) -> i32 {
    match result {
        Ok(0) => STATUS_NO_OUTPUT,
        Ok(_) => STATUS_OUTPUT,
        Err(e) => e.status(),
    }
}

fn status_of_unit(result: Result<()>) -> i32 {
    match result {
        Ok(()) => STATUS_OUTPUT,
        Err(e) => e.status(),
    }
}

/// Vendor-bound factory for sessions, probes and driver checks
pub struct Transcoder<P: Platform> {
    platform: Arc<P>,
    vendor: Vendor,
}

impl<P: Platform> Clone for Transcoder<P> {
    fn clone(&self) -> Self {
        Self {
            platform: self.platform.clone(),
            vendor: self.vendor,
        }
    }
}

impl<P: Platform> Transcoder<P> {
    pub fn new(platform: P, vendor: Vendor) -> Self {
        Self::shared(Arc::new(platform), vendor)
    }

    /// Several vendors on one platform
    pub fn shared(platform: Arc<P>, vendor: Vendor) -> Self {
        Self { platform, vendor }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn vendor(&self) -> Vendor {
        self.vendor
    }

    /// Encode session, `None` if validation or construction failed
    pub fn create_encoder(&self, request: DeviceRequest, config: &EncoderConfig) -> Option<SessionHandle> {
        match create_encoder(self.platform.as_ref(), self.vendor, request, config) {
            Ok(session) => Some(SessionHandle::new(session)),
            Err(e) => {
                tracing::error!("Failed to create {} encoder on {}: {}", self.vendor, request.luid, e);
                None
            }
        }
    }

    /// Decode session, `None` if validation or construction failed
    pub fn create_decoder(&self, request: DeviceRequest, config: &DecoderConfig) -> Option<SessionHandle> {
        match create_decoder(self.platform.as_ref(), self.vendor, request, config) {
            Ok(session) => Some(SessionHandle::new(session)),
            Err(e) => {
                tracing::error!("Failed to create {} decoder on {}: {}", self.vendor, request.luid, e);
                None
            }
        }
    }

    /// `0` if the vendor runtime loads, negative otherwise
    pub fn driver_support(&self) -> i32 {
        status_of_unit(probe::driver_support(self.platform.as_ref(), self.vendor))
    }

    /// Adapters that passed an encode trial, at most `max`
    pub fn test_encode(&self, config: &EncoderConfig, max: usize) -> Vec<AdapterDescriptor> {
        probe::test_encode(self.platform.as_ref(), self.vendor, config, max).unwrap_or_else(|e| {
            tracing::error!("Encode capability probe for {} failed: {}", self.vendor, e);
            Vec::new()
        })
    }

    /// Adapters that decoded `sample` into a frame, at most `max`
    pub fn test_decode(&self, config: &DecoderConfig, sample: &[u8], max: usize) -> Vec<AdapterDescriptor> {
        probe::test_decode(self.platform.as_ref(), self.vendor, config, sample, max).unwrap_or_else(|e| {
            tracing::error!("Decode capability probe for {} failed: {}", self.vendor, e);
            Vec::new()
        })
    }
}

/// Caller-side handle to one session
///
/// Dropping the handle destroys the session.
pub struct SessionHandle {
    session: Option<Box<dyn BackendSession>>,
}

impl SessionHandle {
    pub fn new(session: Box<dyn BackendSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub fn kind(&self) -> Option<SessionKind> {
        self.session.as_ref().map(|s| s.kind())
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state())
            .unwrap_or(SessionState::Destroyed)
    }

    fn session_mut(&mut self) -> Result<&mut Box<dyn BackendSession>> {
        self.session.as_mut().ok_or(Error::Destroyed)
    }

    /// Encode one texture; `on_packet(data, keyframe)` runs once per packet
    ///
    /// The texture is borrowed for the call only. Packet bytes are valid
    /// inside the callback.
    pub fn encode<F>(&mut self, texture: PlatformHandle, mut on_packet: F) -> i32
    where
        F: FnMut(&[u8], bool),
    {
        let result = self.session_mut().and_then(|session| {
            session.submit(SessionInput::Texture(texture))?;
            let mut delivered = 0;
            while let Some(output) = session.drain_output()? {
                if let SessionOutput::Packet(packet) = output {
                    on_packet(packet.data, packet.is_keyframe);
                    delivered += 1;
                }
            }
            Ok(delivered)
        });
        if let Err(e) = &result {
            tracing::error!("encode failed: {}", e);
        }
        status_of(result)
    }

    /// Decode one access unit; `on_frame` runs once per frame, in decode order
    ///
    /// Texture outputs stay owned by the session and are valid until the next
    /// call on this handle.
    pub fn decode<F>(&mut self, data: &[u8], mut on_frame: F) -> i32
    where
        F: FnMut(OutputHandle),
    {
        let result = self.session_mut().and_then(|session| {
            session.submit(SessionInput::Bitstream(data))?;
            let mut delivered = 0;
            while let Some(output) = session.drain_output()? {
                if let SessionOutput::Frame(frame) = output {
                    on_frame(frame);
                    delivered += 1;
                }
            }
            Ok(delivered)
        });
        if let Err(e) = &result {
            tracing::error!("decode failed: {}", e);
        }
        status_of(result)
    }

    pub fn set_bitrate(&mut self, kbps: u32) -> i32 {
        self.reconfigure(Reconfiguration::Bitrate(kbps))
    }

    pub fn set_framerate(&mut self, fps: u32) -> i32 {
        self.reconfigure(Reconfiguration::Framerate(fps))
    }

    /// Quantizer bounds; an invalid pair changes nothing
    pub fn set_qp(&mut self, min: i32, max: i32) -> i32 {
        match QpRange::new(min, max) {
            Ok(qp) => self.reconfigure(Reconfiguration::Qp(qp)),
            Err(e) => {
                tracing::warn!("Rejected QP range [{}, {}]: {}", min, max, e);
                e.status()
            }
        }
    }

    fn reconfigure(&mut self, change: Reconfiguration) -> i32 {
        let result = self.session_mut().and_then(|session| session.reconfigure(change));
        if let Err(e) = &result {
            tracing::warn!("{:?} rejected: {}", change, e);
        }
        status_of_unit(result)
    }

    /// Release the session; later calls return `0` and do nothing
    pub fn destroy(&mut self) -> i32 {
        if let Some(mut session) = self.session.take() {
            session.destroy();
        }
        STATUS_OUTPUT
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::{FaultPlan, ReferencePlatform, StreamPacket, AMD_LUID, NVIDIA_LUID};
    use crate::types::{ApiKind, Codec, Resolution};

    fn encoder_config() -> EncoderConfig {
        EncoderConfig::default()
            .with_resolution(320, 180)
            .with_qp(QpRange::new(10, 40).unwrap())
    }

    #[test]
    fn test_encode_delivers_through_callback() {
        let amd = Transcoder::new(ReferencePlatform::new(), Vendor::Amd);
        let mut handle = amd
            .create_encoder(DeviceRequest::new(AMD_LUID, ApiKind::Dx11), &encoder_config())
            .unwrap();
        let texture = amd.platform().caller_texture(Resolution::new(320, 180), [1, 2, 3, 255]);

        let mut packets = Vec::new();
        let status = handle.encode(texture, |data, key| packets.push((data.len(), key)));
        assert_eq!(status, STATUS_OUTPUT);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].0 > 0);
        assert!(packets[0].1);
    }

    #[test]
    fn test_factory_failure_is_none() {
        let amd = Transcoder::new(ReferencePlatform::new(), Vendor::Amd);
        let odd = encoder_config().with_resolution(321, 180);
        assert!(amd.create_encoder(DeviceRequest::new(AMD_LUID, ApiKind::Dx11), &odd).is_none());

        let nvidia = Transcoder::new(ReferencePlatform::new(), Vendor::Nvidia);
        assert!(nvidia
            .create_encoder(DeviceRequest::new(NVIDIA_LUID, ApiKind::Dx11), &encoder_config())
            .is_none());
    }

    #[test]
    fn test_decode_status_codes() {
        let nvidia = Transcoder::new(ReferencePlatform::new(), Vendor::Nvidia);
        let mut handle = nvidia
            .create_decoder(DeviceRequest::new(NVIDIA_LUID, ApiKind::Dx11), &DecoderConfig::default())
            .unwrap();
        let res = Resolution::new(320, 180);

        let held = StreamPacket::new(Codec::H264, res).with_hold().to_bytes();
        let mut frames = Vec::new();
        assert_eq!(handle.decode(&held, |f| frames.push(f)), STATUS_NO_OUTPUT);
        assert!(frames.is_empty());

        let next = StreamPacket::new(Codec::H264, res).with_index(1).to_bytes();
        assert_eq!(handle.decode(&next, |f| frames.push(f)), STATUS_OUTPUT);
        assert_eq!(frames.len(), 2);

        assert_eq!(handle.decode(b"junk", |_| {}), Error::Submit(String::new()).status());
    }

    #[test]
    fn test_rejected_qp_is_negative() {
        let amd = Transcoder::new(ReferencePlatform::new(), Vendor::Amd);
        let mut handle = amd
            .create_encoder(DeviceRequest::new(AMD_LUID, ApiKind::Dx11), &encoder_config())
            .unwrap();
        assert_eq!(handle.set_qp(20, 30), STATUS_OUTPUT);
        assert!(handle.set_qp(30, 20) < 0);
        assert!(handle.set_qp(-1, 20) < 0);
        assert!(handle.set_bitrate(0) < 0);
        assert_eq!(handle.set_framerate(30), STATUS_OUTPUT);
    }

    #[test]
    fn test_destroy_twice() {
        let amd = Transcoder::new(ReferencePlatform::new(), Vendor::Amd);
        let mut handle = amd
            .create_encoder(DeviceRequest::new(AMD_LUID, ApiKind::Dx11), &encoder_config())
            .unwrap();
        assert_eq!(handle.destroy(), 0);
        assert_eq!(handle.destroy(), 0);
        assert_eq!(handle.state(), SessionState::Destroyed);
        assert_eq!(amd.platform().store().live_objects(), 0);
        assert!(!amd.platform().drivers().is_loaded(Vendor::Amd));

        let texture = amd.platform().caller_texture(Resolution::new(320, 180), [0, 0, 0, 255]);
        assert_eq!(handle.encode(texture, |_, _| {}), Error::Destroyed.status());
        assert_eq!(handle.set_bitrate(1000), Error::Destroyed.status());
    }

    #[test]
    fn test_driver_support_status() {
        let platform = Arc::new(ReferencePlatform::new().without_driver(Vendor::Intel));
        assert_eq!(Transcoder::shared(platform.clone(), Vendor::Amd).driver_support(), 0);
        assert_eq!(
            Transcoder::shared(platform, Vendor::Intel).driver_support(),
            Error::DriverUnavailable(String::new()).status()
        );
    }

    #[test]
    fn test_probe_through_boundary() {
        let platform = ReferencePlatform::new().with_faults(FaultPlan {
            fail_engine_init: true,
            ..Default::default()
        });
        let amd = Transcoder::new(platform, Vendor::Amd);
        assert!(amd.test_encode(&encoder_config(), 4).is_empty());

        let nvidia = Transcoder::new(ReferencePlatform::new(), Vendor::Nvidia);
        let sample = StreamPacket::new(Codec::H264, Resolution::new(320, 180)).to_bytes();
        assert_eq!(nvidia.test_decode(&DecoderConfig::default(), &sample, 4).len(), 1);
    }
}
