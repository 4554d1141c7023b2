//! Backend sessions
//!
//! One capability contract, [`BackendSession`], implemented by three
//! vendor backends:
//! - [`EncodeSession`]: AMF-style hardware encoder (AMD)
//! - [`CuvidSession`]: CUDA/NVDEC-style decoder with graphics interop (NVIDIA)
//! - [`MfxSession`]: oneVPL-style decoder with explicit sync points (Intel)
//!
//! The backend is picked once, at construction, from the adapter vendor.
//! There is no runtime fallback from one vendor to another.

mod cuvid;
mod encode;
mod mfx;

pub use cuvid::{CuvidEngine, CuvidSession, DecodeFlags};
pub use encode::{EncodeEngine, EncodeSession, EncodedFrame, EncoderParams, FrameType};
pub use mfx::{Bitstream, DecodeAsync, DecodeStatus, MfxEngine, MfxSession, MfxSurface, StreamInfo, SyncStatus, SyncToken};

use crate::config::{DecoderConfig, EncoderConfig, QpRange};
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::types::{ApiKind, Codec, Luid, OutputHandle, Packet, PlatformHandle, Vendor, VideoFormatSnapshot};

/// Which backend a session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Encode,
    CuvidDecode,
    MfxDecode,
}

impl SessionKind {
    /// Backend serving a vendor in one direction
    pub fn for_vendor(vendor: Vendor, encode: bool) -> Option<Self> {
        match (vendor, encode) {
            (Vendor::Amd, true) => Some(SessionKind::Encode),
            (Vendor::Nvidia, false) => Some(SessionKind::CuvidDecode),
            (Vendor::Intel, false) => Some(SessionKind::MfxDecode),
            _ => None,
        }
    }

    pub fn is_encode(&self) -> bool {
        matches!(self, SessionKind::Encode)
    }
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionKind::Encode => "encode",
            SessionKind::CuvidDecode => "cuvid decode",
            SessionKind::MfxDecode => "mfx decode",
        };
        write!(f, "{}", name)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, GPU-heavy resources not built yet
    Uninitialized,
    /// Resources built by a successful operation
    Ready,
    /// Terminal; only destroy is permitted
    Faulted,
    /// Resources released
    Destroyed,
}

/// Input accepted by [`BackendSession::submit`]
#[derive(Debug, Clone, Copy)]
pub enum SessionInput<'a> {
    /// Raw GPU texture, borrowed for the duration of the call
    Texture(PlatformHandle),
    /// One compressed access unit
    Bitstream(&'a [u8]),
}

/// Output produced by [`BackendSession::drain_output`]
#[derive(Debug, Clone, Copy)]
pub enum SessionOutput<'a> {
    Packet(Packet<'a>),
    Frame(OutputHandle),
}

/// Runtime parameter change
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconfiguration {
    Bitrate(u32),
    Framerate(u32),
    Qp(QpRange),
    /// New stream format announced by the caller
    Stream(VideoFormatSnapshot),
}

/// Which device a session binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRequest {
    /// Existing device to share, or `None` to open one on `luid`
    pub device: Option<PlatformHandle>,
    pub luid: Luid,
    pub api: ApiKind,
}

impl DeviceRequest {
    pub fn new(luid: Luid, api: ApiKind) -> Self {
        Self {
            device: None,
            luid,
            api,
        }
    }

    pub fn with_device(mut self, device: PlatformHandle) -> Self {
        self.device = Some(device);
        self
    }
}

/// Common contract of every vendor backend
///
/// A session is driven from one thread at a time: one submit, then drains
/// until `None`, then the next submit.
pub trait BackendSession: Send {
    fn kind(&self) -> SessionKind;

    fn state(&self) -> SessionState;

    fn luid(&self) -> Luid;

    /// Hand one unit of input to the backend
    fn submit(&mut self, input: SessionInput<'_>) -> Result<()>;

    /// Next output produced by the last submit, `None` once exhausted
    fn drain_output(&mut self) -> Result<Option<SessionOutput<'_>>>;

    fn reconfigure(&mut self, change: Reconfiguration) -> Result<()>;

    /// Release every resource; calling it again is a no-op
    fn destroy(&mut self);
}

/// Reject codecs no backend handles before touching the GPU
pub(crate) fn check_codec(codec: Codec) -> Result<()> {
    match codec {
        Codec::H264 | Codec::Hevc => Ok(()),
        Codec::Av1 => Err(Error::CodecNotSupported(format!(
            "{} is not supported by the hardware backends",
            codec.display_name()
        ))),
    }
}

/// Create the encode session serving `vendor`
pub fn create_encoder<P: Platform>(
    platform: &P,
    vendor: Vendor,
    request: DeviceRequest,
    config: &EncoderConfig,
) -> Result<Box<dyn BackendSession>> {
    match SessionKind::for_vendor(vendor, true) {
        Some(SessionKind::Encode) => {
            let session = EncodeSession::<P::Encoder>::create(platform, request, config)?;
            Ok(Box::new(session))
        }
        _ => Err(Error::Unsupported(format!("{} has no encode backend", vendor))),
    }
}

/// Create the decode session serving `vendor`
pub fn create_decoder<P: Platform>(
    platform: &P,
    vendor: Vendor,
    request: DeviceRequest,
    config: &DecoderConfig,
) -> Result<Box<dyn BackendSession>> {
    match SessionKind::for_vendor(vendor, false) {
        Some(SessionKind::CuvidDecode) => {
            let session = CuvidSession::<P::Cuvid>::create(platform, request, config)?;
            Ok(Box::new(session))
        }
        Some(SessionKind::MfxDecode) => {
            let session = MfxSession::<P::Mfx>::create(platform, request, config)?;
            Ok(Box::new(session))
        }
        _ => Err(Error::Unsupported(format!("{} has no decode backend", vendor))),
    }
}
